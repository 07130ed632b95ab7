// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Client side of the runtime: a [`Channel`] owns one connected
//! `SOCK_SEQPACKET` socket and multiplexes method calls over it by serial
//! number. A single thread is expected to drive [`Channel::process`] /
//! [`Channel::wait`]; everything else (`call_method`, `subscribe`,
//! `disconnect`) may be called from any thread.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::*;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::socket::{connect, socket, AddressFamily, Shutdown, SockFlag, SockType, UnixAddr};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::fd::FileDescriptor;
use crate::message::{IpcMessage, MethodDescriptor};
use crate::pool::SendBufferPool;
use crate::transport::{self, RecvFrame};
use crate::wire::{EventFromServer, MessageFromServer, MessageToServer, MethodCall as WireCall, MethodCallError, MethodCallReply};
use crate::{retry_eintr, Error, CLIENT_MAX_FDS, DEFAULT_CALL_TIMEOUT, MAX_MESSAGE_SIZE};

const SOCKET_EVENT_ID: u64 = 1;
const TIMER_EVENT_ID: u64 = 2;
const WAKE_EVENT_ID: u64 = 3;

/// Invoked exactly once when a call completes: reply, error, timeout, or
/// channel teardown. The response message is handed back; whether it is
/// meaningful is decided by the controller's failure state.
pub type Completion = Box<dyn FnOnce(Box<dyn IpcMessage>) + Send>;

type EventCallback = Box<dyn Fn(&dyn IpcMessage) + Send + Sync>;
type EventFactory = Box<dyn Fn() -> Box<dyn IpcMessage> + Send + Sync>;

/// Carries the outcome of one method call. Shared between the caller and the
/// channel; reset it before reusing it for another call. Mutating it while a
/// call is in flight is a caller bug.
#[derive(Default)]
pub struct ClientController {
    inner: Mutex<ControllerState>,
}

#[derive(Default)]
struct ControllerState {
    failed: bool,
    reason: String,
}

impl ClientController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the state so the controller can be reused for a new call.
    pub fn reset(&self) {
        let mut state = self.inner.lock().unwrap();
        state.failed = false;
        state.reason.clear();
    }

    pub fn failed(&self) -> bool {
        self.inner.lock().unwrap().failed
    }

    /// Human-readable failure reason, empty unless [`failed`](Self::failed).
    pub fn error_text(&self) -> String {
        self.inner.lock().unwrap().reason.clone()
    }

    /// Cancellation is not supported by either end.
    pub fn start_cancel(&self) {
        warn!("Cancel not implemented");
    }

    /// Always false; see [`start_cancel`](Self::start_cancel).
    pub fn is_canceled(&self) -> bool {
        false
    }

    fn set_failed(&self, reason: &str) {
        let mut state = self.inner.lock().unwrap();
        state.failed = true;
        state.reason = reason.to_string();
    }
}

struct OutstandingCall {
    deadline: Instant,
    controller: Arc<ClientController>,
    response: Box<dyn IpcMessage>,
    done: Option<Completion>,
}

fn complete(call: OutstandingCall) {
    if let Some(done) = call.done {
        done(call.response);
    }
}

fn complete_with_error(call: OutstandingCall, reason: &str) {
    debug!("completing method call with error '{reason}'");

    call.controller.set_failed(reason);
    if let Some(done) = call.done {
        done(call.response);
    }
}

struct ChannelState {
    sock: Option<OwnedFd>,
    calls: HashMap<u64, OutstandingCall>,
}

struct EventEntry {
    tag: i32,
    name: &'static str,
    factory: EventFactory,
    handler: EventCallback,
}

struct EventState {
    // insertion order doubles as dispatch order
    handlers: Vec<Arc<EventEntry>>,
    tag_counter: i32,
}

struct RecvBuffers {
    data: Vec<u8>,
    ctrl: Vec<u8>,
}

/// One outbound connection to a server.
pub struct Channel {
    epoll: Epoll,
    timer: TimerFd,
    wake: EventFd,
    serial: AtomicU64,
    default_timeout: Duration,
    pool: SendBufferPool,
    state: Mutex<ChannelState>,
    events: Mutex<EventState>,
    recv_bufs: Mutex<RecvBuffers>,
}

impl Channel {
    /// Connect a new channel to the listening socket at `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();

        let sock = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| {
            error!("failed to create socket: {e}");
            e
        })?;

        let addr = UnixAddr::new(path)?;
        connect(sock.as_raw_fd(), &addr).map_err(|e| {
            error!("failed to connect to {}: {e}", path.display());
            e
        })?;

        Self::with_socket(sock)
    }

    /// Wrap an already-connected `SOCK_SEQPACKET` socket, taking ownership.
    /// The socket is sanity-checked and switched to non-blocking mode.
    pub fn from_socket(sock: OwnedFd) -> Result<Self, Error> {
        if !transport::check_seqpacket_socket(sock.as_raw_fd()) {
            return Err(Error::ConnectionLost);
        }
        crate::fd::set_nonblocking(&sock)?;

        Self::with_socket(sock)
    }

    fn with_socket(sock: OwnedFd) -> Result<Self, Error> {
        // any failure below drops the fds created so far, unwinding the
        // partially initialized channel
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(&sock, EpollEvent::new(EpollFlags::EPOLLIN, SOCKET_EVENT_ID))?;

        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
        )?;
        epoll.add(&timer, EpollEvent::new(EpollFlags::EPOLLIN, TIMER_EVENT_ID))?;

        let wake = EventFd::from_flags(EfdFlags::EFD_CLOEXEC)?;
        epoll.add(&wake, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_EVENT_ID))?;

        Ok(Self {
            epoll,
            timer,
            wake,
            serial: AtomicU64::new(1),
            default_timeout: DEFAULT_CALL_TIMEOUT,
            pool: SendBufferPool::new(),
            state: Mutex::new(ChannelState {
                sock: Some(sock),
                calls: HashMap::new(),
            }),
            events: Mutex::new(EventState {
                handlers: Vec::new(),
                tag_counter: 1,
            }),
            recv_bufs: Mutex::new(RecvBuffers {
                data: vec![0; MAX_MESSAGE_SIZE],
                ctrl: vec![0; transport::recv_ctrl_capacity()],
            }),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().sock.is_some()
    }

    /// The epoll fd, for callers that integrate the channel into their own
    /// poll loop. Readable whenever [`process`](Self::process) has work.
    pub fn fd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }

    /// Call `method` on the remote service.
    ///
    /// The request's fd fields travel as ancillary data. `done` always runs
    /// exactly once, on the thread driving [`process`](Self::process) for
    /// asynchronous completions or on the calling thread for local failures
    /// and `no_reply` methods; inspect `controller` to tell success from
    /// failure.
    pub fn call_method(
        &self,
        method: &MethodDescriptor,
        controller: Arc<ClientController>,
        request: &dyn IpcMessage,
        response: Box<dyn IpcMessage>,
        done: Completion,
    ) {
        let serial_id = self.serial.fetch_add(1, Ordering::Relaxed);

        let call = OutstandingCall {
            deadline: Instant::now() + self.default_timeout,
            controller,
            response,
            done: Some(done),
        };

        let envelope = MessageToServer::Call(WireCall {
            serial_id,
            service_name: method.service_name.to_string(),
            method_name: method.name.to_string(),
            body: request.serialize_alloc(),
        });
        let wire_bytes = envelope.serialize_alloc();
        if wire_bytes.len() > MAX_MESSAGE_SIZE {
            error!(
                "method call too big to send ({}, max {})",
                wire_bytes.len(),
                MAX_MESSAGE_SIZE
            );
            complete_with_error(call, "Method call too big");
            return;
        }

        // requests carry their real fd numbers in the body; only the server
        // rewrites them after the kernel installs its copies
        let fds = request.fd_fields();

        let mut state = self.state.lock().unwrap();
        let Some(sock) = state.sock.as_ref() else {
            drop(state);
            complete_with_error(call, "Not connected");
            return;
        };

        match transport::send_frame(sock.as_raw_fd(), &self.pool, &wire_bytes, &fds) {
            Err(_) => {
                drop(state);
                complete_with_error(call, "Failed to send message");
            }
            Ok(()) => {
                debug!(
                    "call{{ serial {serial_id} }} - {}.{}",
                    method.service_name, method.name
                );

                if method.no_reply {
                    drop(state);
                    // nothing will ever come back for this serial, but the
                    // caller still learns the datagram was sent
                    complete(call);
                } else {
                    state.calls.insert(serial_id, call);
                    self.update_timeout_timer(&mut state);
                }
            }
        }
    }

    /// Subscribe a handler for events of message type `M`. Multiple handlers
    /// per event are allowed and run in subscription order. Returns a tag for
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe<M, F>(&self, handler: F) -> i32
    where
        M: IpcMessage + Default,
        F: Fn(&M) + Send + Sync + 'static,
    {
        let mut events = self.events.lock().unwrap();
        let tag = events.tag_counter;
        events.tag_counter += 1;

        events.handlers.push(Arc::new(EventEntry {
            tag,
            name: M::default().type_name(),
            factory: Box::new(|| Box::new(M::default())),
            handler: Box::new(move |message| {
                if let Some(message) = message.as_any().downcast_ref::<M>() {
                    handler(message);
                }
            }),
        }));

        tag
    }

    pub fn unsubscribe(&self, tag: i32) -> bool {
        let mut events = self.events.lock().unwrap();
        let before = events.handlers.len();
        events.handlers.retain(|entry| entry.tag != tag);
        events.handlers.len() != before
    }

    /// Ask the server to copy all of its traffic to the supplied socket.
    /// Honoured only for root clients of a server with monitoring enabled.
    /// The caller keeps its copy of the fd.
    pub fn register_monitor(&self, socket: &FileDescriptor) -> Result<(), Error> {
        let wire_bytes = MessageToServer::MonitorRegister.serialize_alloc();

        let state = self.state.lock().unwrap();
        let Some(sock) = state.sock.as_ref() else {
            return Err(Error::ConnectionLost);
        };
        transport::send_frame(sock.as_raw_fd(), &self.pool, &wire_bytes, &[socket.fd()])
    }

    /// Block until the channel has work or `timeout_ms` elapses (negative
    /// means no timeout). Returns whether the channel is still connected;
    /// the driving thread follows up with [`process`](Self::process).
    pub fn wait(&self, timeout_ms: i32) -> bool {
        if !self.is_connected() {
            return false;
        }

        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::NONE);
        let mut fds = [PollFd::new(self.epoll.0.as_fd(), PollFlags::POLLIN)];
        if let Err(e) = retry_eintr(|| poll(&mut fds, timeout)) {
            error!("poll failed: {e}");
            return false;
        }

        self.is_connected()
    }

    /// Non-blocking reactor tick: drain inbound messages, expire timed-out
    /// calls, clear wake-ups. Returns whether the channel is still connected.
    pub fn process(&self) -> bool {
        if !self.is_connected() {
            return false;
        }

        let mut events = [EpollEvent::empty(); 3];
        let n = match retry_eintr(|| self.epoll.wait(&mut events, EpollTimeout::ZERO)) {
            Ok(n) => n,
            Err(e) => {
                error!("epoll_wait failed: {e}");
                return false;
            }
        };

        let mut have_socket = false;
        let mut have_timeout = false;
        let mut have_wake = false;
        for event in &events[..n] {
            match event.data() {
                SOCKET_EVENT_ID => have_socket = true,
                TIMER_EVENT_ID => have_timeout = true,
                WAKE_EVENT_ID => have_wake = true,
                other => error!("epoll event with unknown id {other}"),
            }
        }

        if have_socket && !self.process_socket_event() {
            return false;
        }
        if have_timeout {
            self.process_timeout_event();
        }
        if have_wake {
            self.process_wake_event();
        }

        self.is_connected()
    }

    /// Disconnect from the server. Idempotent; any thread blocked in
    /// [`wait`](Self::wait) is woken. Outstanding calls are not completed
    /// until the channel is dropped.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.sock.is_none() {
                return;
            }
            self.disconnect_no_lock(&mut state);
        }

        let wakeup = 1_u64.to_ne_bytes();
        if nix::unistd::write(&self.wake, &wakeup).is_err() {
            error!("failed to write to wake event fd");
        }
    }

    fn disconnect_no_lock(&self, state: &mut ChannelState) {
        let Some(sock) = state.sock.take() else {
            warn!("not connected");
            return;
        };

        if let Err(e) = self.epoll.delete(&sock) {
            error!("epoll_ctl failed to remove socket: {e}");
        }
        if let Err(e) = nix::sys::socket::shutdown(sock.as_raw_fd(), Shutdown::Both) {
            error!("shutdown error: {e}");
        }
        // closed when `sock` drops here
    }

    fn process_socket_event(&self) -> bool {
        let mut bufs = self.recv_bufs.lock().unwrap();
        let RecvBuffers { data, ctrl } = &mut *bufs;

        // read until the socket runs dry or the peer goes away
        loop {
            let sock = match self.state.lock().unwrap().sock.as_ref() {
                Some(sock) => sock.as_raw_fd(),
                None => return false,
            };

            match transport::recv_frame(sock, data, ctrl, CLIENT_MAX_FDS) {
                Ok(RecvFrame::WouldBlock) => break,
                Ok(RecvFrame::Truncated) => {
                    warn!("received truncated message from server, discarding");
                }
                Ok(RecvFrame::Disconnected) => {
                    info!("socket remote end closed, disconnecting channel");
                    self.disconnect_no_lock(&mut self.state.lock().unwrap());
                    return false;
                }
                Ok(RecvFrame::Message { len, mut fds }) => {
                    self.process_server_message(&data[..len], &mut fds);
                }
                Err(e) => {
                    error!("error reading client socket: {e}");
                    self.disconnect_no_lock(&mut self.state.lock().unwrap());
                    return false;
                }
            }
        }

        true
    }

    fn process_server_message(&self, data: &[u8], fds: &mut Vec<FileDescriptor>) {
        let mut message = MessageFromServer::default();
        let mut input = data;
        if message.deserialize(&mut input).is_err() {
            error!("invalid message from server");
            return;
        }

        match message {
            MessageFromServer::Reply(reply) => self.process_reply(reply, fds),
            MessageFromServer::Error(error) => self.process_error(error),
            MessageFromServer::Event(event) => self.process_event(event, fds),
        }
    }

    fn process_reply(&self, reply: MethodCallReply, fds: &mut Vec<FileDescriptor>) {
        debug!("processing reply from server");

        let mut call = {
            let mut state = self.state.lock().unwrap();
            let Some(call) = state.calls.remove(&reply.reply_id) else {
                error!(
                    "failed to find request for received reply with id {}",
                    reply.reply_id
                );
                return;
            };
            self.update_timeout_timer(&mut state);
            call
        };

        let mut input = reply.body.as_slice();
        if call.response.deserialize(&mut input).is_err() {
            error!("failed to parse method reply from server");
            complete_with_error(call, "Failed to parse reply message");
        } else if transport::attach_message_fds(call.response.as_mut(), fds).is_err() {
            error!("mismatch of file descriptors to the reply");
            complete_with_error(call, "Mismatched file descriptors in message");
        } else {
            debug!("reply{{ serial {} }}", reply.reply_id);
            complete(call);
        }
    }

    fn process_error(&self, error: MethodCallError) {
        debug!("processing error from server");

        let call = {
            let mut state = self.state.lock().unwrap();
            let Some(call) = state.calls.remove(&error.reply_id) else {
                error!(
                    "failed to find request for received error with id {}",
                    error.reply_id
                );
                return;
            };
            self.update_timeout_timer(&mut state);
            call
        };

        debug!("error{{ serial {} }} - {}", error.reply_id, error.reason);
        complete_with_error(call, &error.reason);
    }

    fn process_event(&self, event: EventFromServer, fds: &mut Vec<FileDescriptor>) {
        debug!("processing event from server");

        // collect the matching handlers under the lock, run them outside it
        let matching: Vec<Arc<EventEntry>> = {
            let events = self.events.lock().unwrap();
            events
                .handlers
                .iter()
                .filter(|entry| entry.name == event.name)
                .cloned()
                .collect()
        };

        let Some(first) = matching.first() else {
            warn!("no handler for event {}", event.name);
            return;
        };

        let mut message = (first.factory)();
        let mut input = event.body.as_slice();
        if message.deserialize(&mut input).is_err() {
            error!("failed to parse message for event {}", event.name);
            return;
        }
        if transport::attach_message_fds(message.as_mut(), fds).is_err() {
            error!("mismatch of file descriptors to the event");
            return;
        }

        debug!("event{{ {} }}", event.name);
        for entry in &matching {
            (entry.handler)(message.as_ref());
        }
    }

    fn process_timeout_event(&self) {
        // clear the expiration count first
        let mut expirations = [0_u8; 8];
        if let Err(e) = retry_eintr(|| nix::unistd::read(&self.timer, &mut expirations)) {
            if e != nix::errno::Errno::EAGAIN {
                error!("error reading timerfd: {e}");
            }
            return;
        }

        let timed_out: Vec<OutstandingCall> = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();

            let expired: Vec<u64> = state
                .calls
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(serial, _)| *serial)
                .collect();

            let calls = expired
                .iter()
                .filter_map(|serial| state.calls.remove(serial))
                .collect();

            if !expired.is_empty() {
                self.update_timeout_timer(&mut state);
            }
            calls
        };

        // completions may block arbitrarily, so the lock is gone by now
        for call in timed_out {
            complete_with_error(call, "Timed out");
        }
    }

    fn process_wake_event(&self) {
        let mut ignore = [0_u8; 8];
        if retry_eintr(|| nix::unistd::read(&self.wake, &mut ignore)).is_err() {
            error!("failed to read wake eventfd to clear it");
        }
    }

    /// Re-arm the timerfd to the earliest outstanding deadline, or disarm it
    /// when nothing is outstanding. Called whenever the call map changes,
    /// with the state lock held.
    fn update_timeout_timer(&self, state: &mut ChannelState) {
        let Some(next) = state.calls.values().map(|call| call.deadline).min() else {
            if let Err(e) = self.timer.unset() {
                error!("failed to disarm the call timer: {e}");
            }
            return;
        };

        let now = Instant::now();
        let duration = if next <= now {
            // already late, fire on the next tick
            Duration::from_micros(1)
        } else {
            next - now
        };

        debug!("next timeout in {}us", duration.as_micros());

        if let Err(e) = self.timer.set(
            Expiration::OneShot(TimeSpec::from_duration(duration)),
            TimerSetTimeFlags::empty(),
        ) {
            error!("failed to write to timerfd: {e}");
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let calls: Vec<OutstandingCall> = {
            let mut state = self.state.lock().unwrap();
            if state.sock.is_some() {
                self.disconnect_no_lock(&mut state);
            }
            state.calls.drain().map(|(_, call)| call).collect()
        };

        for call in calls {
            complete_with_error(call, "Channel destructed");
        }
    }
}
