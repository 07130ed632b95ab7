// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Privileged wiretap. A root client registers a non-listening
//! `SOCK_SEQPACKET` peer socket and from then on receives a timestamped
//! [`MonitorMessage`] copy of everything the server does: client
//! connects/disconnects, calls, replies, errors and events. Tap sockets are
//! written best-effort (`MSG_DONTWAIT`); a tap that errors or falls behind
//! is dropped.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Mutex;

use log::*;
use nix::sys::socket::{shutdown, Shutdown};
use nix::time::{clock_gettime, ClockId};

use crate::fd::FileDescriptor;
use crate::server::ClientHandle;
use crate::transport;
use crate::wire::{
    get_bool, get_i32, get_string, get_u32, get_u64, put_bool, put_string, DeserializeError,
    EventFromServer, MethodCall, MethodCallError, MethodCallReply,
};

/// Monitor datagrams carry whole envelopes plus framing, so their cap is
/// above the envelope cap.
pub const MONITOR_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Identity of a connected client as reported to monitors.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorClientDetails {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
    /// Path of the listening socket the client came in on; empty for
    /// sockets adopted through `Server::add_client`.
    pub socket_path: String,
}

impl MonitorClientDetails {
    fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.pid.to_be_bytes());
        buf.extend_from_slice(&self.uid.to_be_bytes());
        buf.extend_from_slice(&self.gid.to_be_bytes());
        put_string(buf, &self.socket_path);
    }

    fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        get_i32(&mut self.pid, input)?;
        get_u32(&mut self.uid, input)?;
        get_u32(&mut self.gid, input)?;
        get_string(&mut self.socket_path, input)?;
        Ok(())
    }
}

const MONITOR_CURRENT_CLIENTS: u32 = 1;
const MONITOR_CLIENT_CONNECTED: u32 = 2;
const MONITOR_CLIENT_DISCONNECTED: u32 = 3;
const MONITOR_CALL: u32 = 4;
const MONITOR_REPLY: u32 = 5;
const MONITOR_ERROR: u32 = 6;
const MONITOR_EVENT: u32 = 7;

/// What a monitor observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Roster snapshot, sent once when the tap is installed.
    CurrentClients(Vec<(u64, MonitorClientDetails)>),
    ClientConnected {
        client_id: u64,
        details: MonitorClientDetails,
    },
    ClientDisconnected {
        client_id: u64,
    },
    Call {
        client_id: u64,
        no_reply: bool,
        call: MethodCall,
    },
    Reply {
        target_client_id: u64,
        reply: MethodCallReply,
    },
    Error {
        target_client_id: u64,
        error: MethodCallError,
    },
    Event {
        target_client_id: u64,
        event: EventFromServer,
    },
}

/// One timestamped observation, the only thing a tap socket ever receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorMessage {
    /// `CLOCK_REALTIME` at observation time, in microseconds.
    pub timestamp_real: u64,
    /// `CLOCK_MONOTONIC` at observation time, in microseconds.
    pub timestamp_mono: u64,
    pub event: MonitorEvent,
}

impl Default for MonitorMessage {
    fn default() -> Self {
        Self {
            timestamp_real: 0,
            timestamp_mono: 0,
            event: MonitorEvent::CurrentClients(Vec::new()),
        }
    }
}

impl MonitorMessage {
    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.timestamp_real.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_mono.to_be_bytes());

        match &self.event {
            MonitorEvent::CurrentClients(clients) => {
                buf.extend_from_slice(&MONITOR_CURRENT_CLIENTS.to_be_bytes());
                buf.extend_from_slice(&(clients.len() as u32).to_be_bytes());
                for (client_id, details) in clients {
                    buf.extend_from_slice(&client_id.to_be_bytes());
                    details.serialize_into(&mut buf);
                }
            }
            MonitorEvent::ClientConnected { client_id, details } => {
                buf.extend_from_slice(&MONITOR_CLIENT_CONNECTED.to_be_bytes());
                buf.extend_from_slice(&client_id.to_be_bytes());
                details.serialize_into(&mut buf);
            }
            MonitorEvent::ClientDisconnected { client_id } => {
                buf.extend_from_slice(&MONITOR_CLIENT_DISCONNECTED.to_be_bytes());
                buf.extend_from_slice(&client_id.to_be_bytes());
            }
            MonitorEvent::Call {
                client_id,
                no_reply,
                call,
            } => {
                buf.extend_from_slice(&MONITOR_CALL.to_be_bytes());
                buf.extend_from_slice(&client_id.to_be_bytes());
                put_bool(&mut buf, *no_reply);
                buf.extend_from_slice(&call.serialize_alloc());
            }
            MonitorEvent::Reply {
                target_client_id,
                reply,
            } => {
                buf.extend_from_slice(&MONITOR_REPLY.to_be_bytes());
                buf.extend_from_slice(&target_client_id.to_be_bytes());
                buf.extend_from_slice(&reply.serialize_alloc());
            }
            MonitorEvent::Error {
                target_client_id,
                error,
            } => {
                buf.extend_from_slice(&MONITOR_ERROR.to_be_bytes());
                buf.extend_from_slice(&target_client_id.to_be_bytes());
                buf.extend_from_slice(&error.serialize_alloc());
            }
            MonitorEvent::Event {
                target_client_id,
                event,
            } => {
                buf.extend_from_slice(&MONITOR_EVENT.to_be_bytes());
                buf.extend_from_slice(&target_client_id.to_be_bytes());
                buf.extend_from_slice(&event.serialize_alloc());
            }
        }

        buf
    }

    pub fn deserialize(&mut self, input: &mut &[u8]) -> Result<(), DeserializeError> {
        get_u64(&mut self.timestamp_real, input)?;
        get_u64(&mut self.timestamp_mono, input)?;

        let mut discriminant = 0_u32;
        get_u32(&mut discriminant, input)?;
        self.event = match discriminant {
            MONITOR_CURRENT_CLIENTS => {
                let mut count = 0_u32;
                get_u32(&mut count, input)?;
                let mut clients = Vec::new();
                for _ in 0..count {
                    let mut client_id = 0_u64;
                    get_u64(&mut client_id, input)?;
                    let mut details = MonitorClientDetails::default();
                    details.deserialize(input)?;
                    clients.push((client_id, details));
                }
                MonitorEvent::CurrentClients(clients)
            }
            MONITOR_CLIENT_CONNECTED => {
                let mut client_id = 0_u64;
                get_u64(&mut client_id, input)?;
                let mut details = MonitorClientDetails::default();
                details.deserialize(input)?;
                MonitorEvent::ClientConnected { client_id, details }
            }
            MONITOR_CLIENT_DISCONNECTED => {
                let mut client_id = 0_u64;
                get_u64(&mut client_id, input)?;
                MonitorEvent::ClientDisconnected { client_id }
            }
            MONITOR_CALL => {
                let mut client_id = 0_u64;
                get_u64(&mut client_id, input)?;
                let mut no_reply = false;
                get_bool(&mut no_reply, input)?;
                let mut call = MethodCall::default();
                call.deserialize(input)?;
                MonitorEvent::Call {
                    client_id,
                    no_reply,
                    call,
                }
            }
            MONITOR_REPLY => {
                let mut target_client_id = 0_u64;
                get_u64(&mut target_client_id, input)?;
                let mut reply = MethodCallReply::default();
                reply.deserialize(input)?;
                MonitorEvent::Reply {
                    target_client_id,
                    reply,
                }
            }
            MONITOR_ERROR => {
                let mut target_client_id = 0_u64;
                get_u64(&mut target_client_id, input)?;
                let mut error = MethodCallError::default();
                error.deserialize(input)?;
                MonitorEvent::Error {
                    target_client_id,
                    error,
                }
            }
            MONITOR_EVENT => {
                let mut target_client_id = 0_u64;
                get_u64(&mut target_client_id, input)?;
                let mut event = EventFromServer::default();
                event.deserialize(input)?;
                MonitorEvent::Event {
                    target_client_id,
                    event,
                }
            }
            _ => return Err(DeserializeError),
        };

        Ok(())
    }

    fn now(event: MonitorEvent) -> Self {
        Self {
            timestamp_real: clock_usecs(ClockId::CLOCK_REALTIME),
            timestamp_mono: clock_usecs(ClockId::CLOCK_MONOTONIC),
            event,
        }
    }
}

fn clock_usecs(clock: ClockId) -> u64 {
    match clock_gettime(clock) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000 + (ts.tv_nsec() as u64) / 1_000,
        Err(e) => {
            error!("clock_gettime failed: {e}");
            0
        }
    }
}

struct MonitorState {
    sockets: Vec<FileDescriptor>,
    clients: BTreeMap<u64, MonitorClientDetails>,
}

/// Tap registry plus the client roster it reports. All methods are
/// best-effort: a monitor never disturbs the traffic it observes.
pub(crate) struct ServerMonitor {
    state: Mutex<MonitorState>,
}

impl ServerMonitor {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                sockets: Vec::new(),
                clients: BTreeMap::new(),
            }),
        }
    }

    /// Validate and install a tap socket, then send it the current roster.
    pub(crate) fn add_monitor_socket(&self, socket: FileDescriptor) -> bool {
        // SAFETY: st is a plain out-buffer for fstat to fill.
        let mut st: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(socket.fd(), &mut st) } != 0 {
            warn!(
                "failed to stat supplied monitor socket: {}",
                io::Error::last_os_error()
            );
            return false;
        }
        if st.st_mode & libc::S_IFMT != libc::S_IFSOCK {
            warn!("monitor fd supplied is not a socket");
            return false;
        }

        match transport::is_listening_socket(socket.fd()) {
            Some(false) => {}
            Some(true) => {
                warn!("listening socket was passed as monitor socket, ignoring");
                return false;
            }
            None => {
                warn!("failed to get monitor socket type");
                return false;
            }
        }

        // the tap is write-only from here on
        if let Err(e) = shutdown(socket.fd(), Shutdown::Read) {
            warn!("failed to shut down read side of monitor socket: {e}");
            return false;
        }

        let mut state = self.state.lock().unwrap();

        let roster = MonitorMessage::now(MonitorEvent::CurrentClients(
            state
                .clients
                .iter()
                .map(|(id, details)| (*id, details.clone()))
                .collect(),
        ));
        if !send_to_monitor(socket.fd(), &roster.serialize_alloc()) {
            warn!("failed to send all client details to the monitor socket");
            return false;
        }

        state.sockets.push(socket);
        true
    }

    pub(crate) fn client_connected(&self, socket_path: &Path, client_id: u64, client: &ClientHandle) {
        let details = MonitorClientDetails {
            pid: client.pid(),
            uid: client.uid(),
            gid: client.gid(),
            socket_path: socket_path.display().to_string(),
        };

        let mut state = self.state.lock().unwrap();
        state.clients.insert(client_id, details.clone());

        if state.sockets.is_empty() {
            return;
        }
        let message = MonitorMessage::now(MonitorEvent::ClientConnected { client_id, details });
        send_to_monitors(&mut state, &message);
    }

    pub(crate) fn client_disconnected(&self, client_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.clients.remove(&client_id);

        if state.sockets.is_empty() {
            return;
        }
        let message = MonitorMessage::now(MonitorEvent::ClientDisconnected { client_id });
        send_to_monitors(&mut state, &message);
    }

    pub(crate) fn call(&self, client_id: u64, call: &MethodCall, no_reply: bool) {
        let mut state = self.state.lock().unwrap();
        if state.sockets.is_empty() {
            return;
        }
        let message = MonitorMessage::now(MonitorEvent::Call {
            client_id,
            no_reply,
            call: call.clone(),
        });
        send_to_monitors(&mut state, &message);
    }

    pub(crate) fn reply(&self, client_id: u64, reply: &MethodCallReply) {
        let mut state = self.state.lock().unwrap();
        if state.sockets.is_empty() {
            return;
        }
        let message = MonitorMessage::now(MonitorEvent::Reply {
            target_client_id: client_id,
            reply: reply.clone(),
        });
        send_to_monitors(&mut state, &message);
    }

    pub(crate) fn error(&self, client_id: u64, error: &MethodCallError) {
        let mut state = self.state.lock().unwrap();
        if state.sockets.is_empty() {
            return;
        }
        let message = MonitorMessage::now(MonitorEvent::Error {
            target_client_id: client_id,
            error: error.clone(),
        });
        send_to_monitors(&mut state, &message);
    }

    pub(crate) fn event(&self, client_id: u64, event: &EventFromServer) {
        let mut state = self.state.lock().unwrap();
        if state.sockets.is_empty() {
            return;
        }
        let message = MonitorMessage::now(MonitorEvent::Event {
            target_client_id: client_id,
            event: event.clone(),
        });
        send_to_monitors(&mut state, &message);
    }
}

/// Write one datagram to a tap socket without ever blocking the server.
fn send_to_monitor(sock: RawFd, data: &[u8]) -> bool {
    if data.len() > MONITOR_MAX_MESSAGE_SIZE {
        error!(
            "monitor message too big to fit in buffer (size {}, max size {})",
            data.len(),
            MONITOR_MAX_MESSAGE_SIZE
        );
        return false;
    }

    let rc = loop {
        // SAFETY: data outlives the call.
        let rc = unsafe {
            libc::send(
                sock,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
            )
        };
        if rc >= 0 {
            break rc;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EPIPE) => {
                info!("monitor socket closed by remote end");
                return false;
            }
            Some(libc::EAGAIN) => {
                warn!("monitor socket is blocked, failed to add message, also closing socket");
                return false;
            }
            _ => {
                error!("failed to send the complete monitor message, closing socket: {err}");
                return false;
            }
        }
    };

    rc as usize == data.len()
}

/// Fan one message out to every tap; taps that fail are closed and removed.
fn send_to_monitors(state: &mut MonitorState, message: &MonitorMessage) {
    let data = message.serialize_alloc();
    state.sockets.retain(|socket| send_to_monitor(socket.fd(), &data));
}
