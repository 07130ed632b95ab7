// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod client;
pub mod fd;
pub mod message;
pub mod pool;
pub mod server;
mod transport;
pub mod wire;

use std::fmt;

pub use client::{Channel, ClientController};
pub use fd::FileDescriptor;
pub use message::{IpcMessage, MethodDescriptor};
pub use server::{ClientHandle, IpcService, PendingReply, Server, ServerController};
pub use wire::DeserializeError;

/// Hard cap on a single envelope (header plus body) in bytes. Calls that
/// would exceed it fail locally; oversized replies are replaced with a
/// generic error before they are sent.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024;

/// Most file descriptors a channel will accept in one inbound message.
/// Anything beyond the limit is closed rather than delivered.
pub const CLIENT_MAX_FDS: usize = 32;

/// Most file descriptors the server will accept in one inbound message.
pub const SERVER_MAX_FDS: usize = 16;

/// Upper bound used to size the ancillary receive buffer.
pub(crate) const SCM_MAX_FD: usize = 255;

/// Time a call may remain outstanding before it is failed with "Timed out".
pub const DEFAULT_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(3000);

/// The possible errors that can arise while moving envelopes across a
/// channel. Client-visible call failures additionally carry a reason string
/// on the [`ClientController`].
#[derive(Debug)]
pub enum Error {
    /// The socket is gone: peer EOF, `EPOLLERR`, or a local disconnect.
    ConnectionLost,

    /// `sendmsg` failed or wrote a short datagram. The message (and any fds
    /// riding with it) never left this process.
    SendFailed,

    /// An envelope or body did not decode.
    ParseFailed,

    /// The count of fd-tagged fields did not match the ancillary fd count.
    FdMismatch,

    /// The envelope would exceed [`MAX_MESSAGE_SIZE`].
    MessageTooLarge,

    /// Errors returned by the underlying syscalls.
    Os(nix::Error),

    /// I/O failures outside the socket layer (lock files and the like).
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ConnectionLost => write!(f, "Not connected"),
            Self::SendFailed => write!(f, "Failed to send message"),
            Self::ParseFailed => write!(f, "Failed to parse message"),
            Self::FdMismatch => write!(f, "Mismatched file descriptors in message"),
            Self::MessageTooLarge => write!(f, "Message too big"),
            Self::Os(e) => write!(f, "OS error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Self::Os(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DeserializeError> for Error {
    fn from(_: DeserializeError) -> Self {
        Self::ParseFailed
    }
}

/// Restart a nix call that was interrupted by a signal. Every syscall on the
/// reactor paths must auto-restart on EINTR.
pub(crate) fn retry_eintr<T, F: FnMut() -> nix::Result<T>>(mut f: F) -> nix::Result<T> {
    loop {
        match f() {
            Err(nix::errno::Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// A connected `SOCK_SEQPACKET` pair, constructed using socketpair(2).
///
/// One end can be handed to [`Server::add_client`] or kept by a process
/// supervisor while the other is wrapped by [`Channel::from_socket`]; the
/// tests use it to exercise both endpoints in a single process.
pub mod pipe {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::fd::OwnedFd;

    pub fn pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        Ok((a, b))
    }
}
