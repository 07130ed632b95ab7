// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io;
use std::os::fd::RawFd;

use log::*;

/// Owning wrapper around a kernel file descriptor, or none.
///
/// The runtime shuffles fds between the kernel's ancillary buffers and
/// service messages; this type pins down who closes what. Construction and
/// cloning always `dup` under `O_CLOEXEC` (the source fd is untouched and may
/// be closed independently), dropping closes, and [`release`](Self::release)
/// hands the raw fd back to the caller and forgets it.
#[derive(Debug)]
pub struct FileDescriptor {
    fd: RawFd,
}

impl FileDescriptor {
    /// Wrap `fd` by duplicating it. An invalid `fd` (or a failed dup) yields
    /// an invalid descriptor rather than an error; callers check
    /// [`is_valid`](Self::is_valid).
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd: dup_cloexec(fd),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    /// The wrapped raw fd, or -1. Ownership stays here.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Close the current fd (if any) and optionally dup-adopt a new one.
    pub fn reset(&mut self, fd: Option<RawFd>) {
        close_checked(self.fd);
        self.fd = match fd {
            Some(fd) => dup_cloexec(fd),
            None => -1,
        };
    }

    /// Hand the raw fd to the caller. The descriptor becomes invalid and
    /// will no longer close it.
    pub fn release(&mut self) -> RawFd {
        std::mem::replace(&mut self.fd, -1)
    }
}

impl Default for FileDescriptor {
    fn default() -> Self {
        Self { fd: -1 }
    }
}

impl Clone for FileDescriptor {
    fn clone(&self) -> Self {
        Self::new(self.fd)
    }
}

impl Drop for FileDescriptor {
    fn drop(&mut self) {
        close_checked(self.fd);
    }
}

/// Duplicate `fd` with the close-on-exec flag set, landing at fd 3 or above
/// so the standard streams are never reused. Returns -1 on failure.
fn dup_cloexec(fd: RawFd) -> RawFd {
    if fd < 0 {
        return -1;
    }

    // SAFETY: F_DUPFD_CLOEXEC only touches the fd table.
    let duped = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) };
    if duped < 0 {
        warn!("failed to dup supplied fd: {}", io::Error::last_os_error());
    }

    duped
}

/// Set `O_NONBLOCK` on a socket the runtime is adopting.
pub(crate) fn set_nonblocking<F: std::os::fd::AsFd>(fd: F) -> nix::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let flags = fcntl(&fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(&fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

fn close_checked(fd: RawFd) {
    if fd < 0 {
        return;
    }

    // SAFETY: fd is owned by this module and closed exactly once.
    if unsafe { libc::close(fd) } != 0 {
        error!(
            "failed to close file descriptor: {}",
            io::Error::last_os_error()
        );
    }
}
