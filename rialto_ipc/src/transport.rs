// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! One datagram, one envelope. The kernel does the framing
//! (`SOCK_SEQPACKET` delivers a whole datagram or nothing), this module does
//! the ancillary-data handling: outgoing fds ride as an `SCM_RIGHTS` record,
//! incoming records are dup'd into owning [`FileDescriptor`]s and spliced
//! into the parsed message's fd fields.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use log::*;

use crate::fd::FileDescriptor;
use crate::message::IpcMessage;
use crate::pool::SendBufferPool;
use crate::Error;

/// Fds drained (and closed) from a truncated datagram before discarding it.
const TRUNCATED_FD_DRAIN_LIMIT: usize = 16;

/// Size of the ancillary receive buffer, large enough for the biggest fd
/// array the kernel will hand over in one message.
pub(crate) fn recv_ctrl_capacity() -> usize {
    // SAFETY: CMSG_SPACE is pure arithmetic.
    unsafe { libc::CMSG_SPACE((crate::SCM_MAX_FD * mem::size_of::<libc::c_int>()) as u32) as usize }
}

fn socket_int_option(fd: RawFd, opt: libc::c_int) -> Option<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

    // SAFETY: value/len form a properly sized out-buffer for SOL_SOCKET
    // integer options.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 || len != mem::size_of::<libc::c_int>() as libc::socklen_t {
        return None;
    }

    Some(value)
}

/// Sanity check that a caller-supplied socket is `AF_UNIX`/`SOCK_SEQPACKET`.
pub(crate) fn check_seqpacket_socket(fd: RawFd) -> bool {
    match socket_int_option(fd, libc::SO_DOMAIN) {
        Some(domain) if domain == libc::AF_UNIX => {}
        Some(_) => {
            error!("supplied socket is not a unix domain socket");
            return false;
        }
        None => {
            error!(
                "failed to get domain of supplied socket: {}",
                io::Error::last_os_error()
            );
            return false;
        }
    }

    match socket_int_option(fd, libc::SO_TYPE) {
        Some(ty) if ty == libc::SOCK_SEQPACKET => true,
        Some(_) => {
            error!("supplied socket is not of type SOCK_SEQPACKET");
            false
        }
        None => {
            error!(
                "failed to get type of supplied socket: {}",
                io::Error::last_os_error()
            );
            false
        }
    }
}

/// True if the socket is sitting in listening mode (`SO_ACCEPTCONN`).
pub(crate) fn is_listening_socket(fd: RawFd) -> Option<bool> {
    socket_int_option(fd, libc::SO_ACCEPTCONN).map(|v| v != 0)
}

/// The peer's `{pid, uid, gid}` recorded by the kernel at connect time.
pub(crate) fn peer_credentials(fd: RawFd) -> Option<libc::ucred> {
    // SAFETY: creds/len form a properly sized out-buffer for SO_PEERCRED.
    let mut creds: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut creds as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 || len != mem::size_of::<libc::ucred>() as libc::socklen_t {
        return None;
    }

    Some(creds)
}

/// Outcome of reading one datagram from a non-blocking socket.
pub(crate) enum RecvFrame {
    /// A complete envelope of `len` bytes plus any fds that rode with it.
    Message {
        len: usize,
        fds: Vec<FileDescriptor>,
    },
    /// Data or control area was truncated. The contents are unusable; any
    /// fds that did arrive have already been closed.
    Truncated,
    /// The peer performed an orderly shutdown.
    Disconnected,
    /// Nothing left to read.
    WouldBlock,
}

pub(crate) fn recv_frame(
    sock: RawFd,
    data: &mut [u8],
    ctrl: &mut [u8],
    fd_limit: usize,
) -> Result<RecvFrame, Error> {
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // SAFETY: msghdr is plain data; zeroed is a valid initial state.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = ctrl.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = ctrl.len();

    let rd = loop {
        // SAFETY: msg points at buffers that outlive the call.
        let rd = unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if rd >= 0 {
            break rd;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(RecvFrame::WouldBlock),
            _ => return Err(Error::Io(err)),
        }
    };

    if rd == 0 {
        return Ok(RecvFrame::Disconnected);
    }

    if msg.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
        // the fds must still be collected and closed or they leak into this
        // process for good
        read_message_fds(&msg, TRUNCATED_FD_DRAIN_LIMIT);
        return Ok(RecvFrame::Truncated);
    }

    let fds = if msg.msg_controllen > 0 {
        read_message_fds(&msg, fd_limit)
    } else {
        Vec::new()
    };

    Ok(RecvFrame::Message {
        len: rd as usize,
        fds,
    })
}

/// Collect every `SCM_RIGHTS` fd from a received message into owning
/// wrappers, closing the kernel-installed fd in all cases so that even fds
/// beyond `limit` (which are dropped, not delivered) do not leak.
fn read_message_fds(msg: &libc::msghdr, limit: usize) -> Vec<FileDescriptor> {
    let mut fds = Vec::new();

    // SAFETY: msg was filled in by a successful recvmsg, so the CMSG_*
    // macros walk initialized control data within msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                if payload_len < mem::size_of::<libc::c_int>()
                    || payload_len % mem::size_of::<libc::c_int>() != 0
                {
                    error!("invalid fd array size");
                } else {
                    let count = payload_len / mem::size_of::<libc::c_int>();
                    debug!("received {count} fds");

                    let data = libc::CMSG_DATA(cmsg) as *const libc::c_int;
                    for i in 0..count {
                        let raw = std::ptr::read_unaligned(data.add(i));

                        if fds.len() >= limit {
                            error!("received too many file descriptors, exceeding max per message, closing left overs");
                        } else {
                            let fd = FileDescriptor::new(raw);
                            if fd.is_valid() {
                                fds.push(fd);
                            } else {
                                error!("received invalid fd (couldn't dup)");
                            }
                        }

                        if libc::close(raw) != 0 {
                            error!(
                                "failed to close received fd: {}",
                                io::Error::last_os_error()
                            );
                        }
                    }
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg as *const libc::msghdr as *mut libc::msghdr, cmsg);
        }
    }

    fds
}

/// Send one envelope, with `fds` attached as a single `SCM_RIGHTS` record.
///
/// The whole wire image is staged in one pool buffer laid out as
/// `[msghdr | cmsg + fds | iovec | body]`, so a steady-state reply performs
/// no allocation. On any failure the fds were not transferred and remain
/// owned by the caller.
pub(crate) fn send_frame(
    sock: RawFd,
    pool: &SendBufferPool,
    body: &[u8],
    fds: &[RawFd],
) -> Result<(), Error> {
    let ctrl_len = if fds.is_empty() {
        0
    } else {
        // SAFETY: CMSG_SPACE is pure arithmetic.
        unsafe { libc::CMSG_SPACE((fds.len() * mem::size_of::<libc::c_int>()) as u32) as usize }
    };

    let header_len = mem::size_of::<libc::msghdr>() + ctrl_len + mem::size_of::<libc::iovec>();
    let mut buf = pool.allocate(header_len + body.len());
    let base = buf.as_mut_ptr();

    // SAFETY: the buffer is 8-byte aligned and sized for the layout above;
    // msghdr sits at offset 0, the control area right after it (CMSG_SPACE
    // keeps the iovec that follows aligned), then the iovec, then the body.
    // Every pointer stays inside this one allocation, which outlives the
    // sendmsg call.
    let sent = unsafe {
        std::ptr::write_bytes(base, 0, header_len);

        let header = base as *mut libc::msghdr;
        let ctrl = base.add(mem::size_of::<libc::msghdr>());
        let iov = base.add(mem::size_of::<libc::msghdr>() + ctrl_len) as *mut libc::iovec;
        let data = base.add(header_len);

        std::ptr::copy_nonoverlapping(body.as_ptr(), data, body.len());
        (*iov).iov_base = data as *mut libc::c_void;
        (*iov).iov_len = body.len();
        (*header).msg_iov = iov;
        (*header).msg_iovlen = 1;

        if !fds.is_empty() {
            (*header).msg_control = ctrl as *mut libc::c_void;
            (*header).msg_controllen = ctrl_len;

            let cmsg = libc::CMSG_FIRSTHDR(header);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len =
                libc::CMSG_LEN((fds.len() * mem::size_of::<libc::c_int>()) as u32) as usize;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr() as *const u8,
                libc::CMSG_DATA(cmsg),
                fds.len() * mem::size_of::<libc::c_int>(),
            );
            (*header).msg_controllen = (*cmsg).cmsg_len;
        }

        loop {
            let rc = libc::sendmsg(sock, header, libc::MSG_NOSIGNAL);
            if rc >= 0 {
                break rc;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                warn!("sendmsg failed: {err}");
                return Err(Error::SendFailed);
            }
        }
    };

    if sent as usize != body.len() {
        warn!("short write sending message ({sent} of {} bytes)", body.len());
        return Err(Error::SendFailed);
    }

    Ok(())
}

/// Splice received fds into the parsed message: each present-and-set fd
/// field takes the next fd from the array, in field declaration order, and
/// from then on the message owns the raw fd.
///
/// A count mismatch in either direction rejects the message; the fds stay in
/// `fds` and are closed when it drops, so nothing leaks.
pub(crate) fn attach_message_fds(
    message: &mut dyn IpcMessage,
    fds: &mut Vec<FileDescriptor>,
) -> Result<(), Error> {
    let slots = message.fd_fields_mut();
    if slots.len() != fds.len() {
        error!(
            "message has {} fd fields set but {} fds were supplied",
            slots.len(),
            fds.len()
        );
        return Err(Error::FdMismatch);
    }

    for (slot, fd) in slots.into_iter().zip(fds.iter_mut()) {
        *slot = fd.release();
    }

    Ok(())
}

/// Collect the fd values of a reply or event and scrub the fields to -1 so
/// the wire bytes carry no real fd number. The caller still owns the
/// underlying descriptors; only the integer copies are taken.
pub(crate) fn take_message_fds(message: &mut dyn IpcMessage) -> Vec<RawFd> {
    message
        .fd_fields_mut()
        .into_iter()
        .map(|slot| mem::replace(slot, -1))
        .collect()
}
