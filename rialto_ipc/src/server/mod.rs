// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Server side of the runtime. One [`Server`] owns any number of listening
//! sockets and their accepted clients on a single epoll reactor. Services
//! are exported per client; a dispatched call hands the service a
//! [`ServerController`] plus a one-shot [`PendingReply`] which may be
//! completed from any thread.
//!
//! Epoll event ids partition the fd space: 0 is the wake eventfd, ids below
//! 10000 are listening sockets, everything above is a client connection.

pub mod monitor;

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use log::*;
use nix::fcntl::{Flock, FlockArg};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::socket::{
    accept4, bind, listen, socket, AddressFamily, Backlog, Shutdown, SockFlag, SockType, UnixAddr,
};
use nix::sys::stat::stat;

use crate::fd::FileDescriptor;
use crate::message::{IpcMessage, MethodDescriptor};
use crate::pool::SendBufferPool;
use crate::transport::{self, RecvFrame};
use crate::wire::{
    EventFromServer, MessageFromServer, MessageToServer, MethodCall as WireCall, MethodCallError,
    MethodCallReply,
};
use crate::{retry_eintr, Error, MAX_MESSAGE_SIZE, SERVER_MAX_FDS};

use monitor::ServerMonitor;

const WAKE_EVENT_ID: u64 = 0;
const FIRST_SOCKET_ID: u64 = 1;
const FIRST_CLIENT_ID: u64 = 10_000;

/// A service exported to clients. Dispatch finds the service by
/// [`name`](Self::name), the method by its descriptor, builds the request
/// and response messages through the factories, and invokes
/// [`call_method`](Self::call_method).
///
/// For two-way methods the handler must eventually call
/// [`PendingReply::complete`] exactly once, possibly from another thread.
/// For `no_reply` methods the reply object is inert and may simply be
/// dropped.
pub trait IpcService: Send + Sync {
    /// Full service name matched against Call envelopes.
    fn name(&self) -> &'static str;

    fn methods(&self) -> &[MethodDescriptor];

    fn new_request(&self, method: &MethodDescriptor) -> Box<dyn IpcMessage>;

    fn new_response(&self, method: &MethodDescriptor) -> Box<dyn IpcMessage>;

    fn call_method(
        &self,
        method: &MethodDescriptor,
        controller: ServerController,
        request: Box<dyn IpcMessage>,
        response: Box<dyn IpcMessage>,
        reply: PendingReply,
    );
}

pub type ConnectCallback = Arc<dyn Fn(&ClientHandle) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&ClientHandle) + Send + Sync>;

/// Describes one connected client. Handed to connect callbacks and service
/// handlers; holds only a weak reference back to the server core, so a
/// retained handle never keeps the reactor alive.
#[derive(Clone)]
pub struct ClientHandle {
    core: Weak<ServerShared>,
    id: u64,
    creds: libc::ucred,
}

impl ClientHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> libc::pid_t {
        self.creds.pid
    }

    pub fn uid(&self) -> libc::uid_t {
        self.creds.uid
    }

    pub fn gid(&self) -> libc::gid_t {
        self.creds.gid
    }

    /// Make `service` callable by this client. Calls naming a service that
    /// was never exported to the calling client get an "Unknown service"
    /// error reply.
    pub fn export_service(&self, service: Arc<dyn IpcService>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let mut clients = core.clients.lock().unwrap();
        if let Some(details) = clients.map.get_mut(&self.id) {
            details.services.insert(service.name(), service);
        }
    }

    /// Push an asynchronous event to this client. Returns false if the
    /// client is gone or the event could not be sent.
    pub fn send_event(&self, message: &mut dyn IpcMessage) -> bool {
        match self.core.upgrade() {
            Some(core) => core.send_event(self.id, message),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self.core.upgrade() {
            Some(core) => core.is_client_connected(self.id),
            None => false,
        }
    }

    /// Queue this client for teardown on the next reactor tick.
    pub fn disconnect(&self) {
        if let Some(core) = self.core.upgrade() {
            core.disconnect_client(self.id);
        }
    }
}

/// Per-call state handed to the service handler. The handler may mark the
/// call failed before completing the reply; the failure reason then travels
/// back as an Error envelope instead of a Reply.
pub struct ServerController {
    client: ClientHandle,
    serial_id: u64,
    failed: bool,
    reason: String,
}

impl ServerController {
    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    pub fn serial_id(&self) -> u64 {
        self.serial_id
    }

    pub fn set_failed(&mut self, reason: impl Into<String>) {
        self.failed = true;
        self.reason = reason.into();
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Always false; neither end implements cancellation.
    pub fn is_canceled(&self) -> bool {
        false
    }
}

/// One-shot completion for a dispatched call.
///
/// Completing reads the controller's final state and sends either the Reply
/// or an Error envelope to the originating client. Safe to complete from any
/// thread. Dropping a two-way reply without completing it sends nothing and
/// leaves the client to time out.
pub struct PendingReply {
    core: Weak<ServerShared>,
    client_id: u64,
    serial_id: u64,
    no_reply: bool,
}

impl PendingReply {
    pub fn complete(self, controller: ServerController, mut response: Box<dyn IpcMessage>) {
        if self.no_reply {
            return;
        }

        let Some(core) = self.core.upgrade() else {
            warn!("server destroyed before reply could be sent");
            return;
        };

        if controller.failed {
            core.send_error_reply(self.client_id, self.serial_id, &controller.reason);
        } else {
            core.send_reply(self.client_id, self.serial_id, response.as_mut());
        }
    }
}

struct ListeningSocket {
    sock: OwnedFd,
    path: PathBuf,
    // held for the server's lifetime; dropping releases the flock
    _lock: Flock<File>,
    lock_path: PathBuf,
    connected_cb: Option<ConnectCallback>,
    disconnected_cb: Option<DisconnectCallback>,
}

struct ClientDetails {
    sock: Option<OwnedFd>,
    handle: ClientHandle,
    services: HashMap<&'static str, Arc<dyn IpcService>>,
    disconnected_cb: Option<DisconnectCallback>,
}

struct Sockets {
    map: HashMap<u64, ListeningSocket>,
    next_id: u64,
}

struct Clients {
    map: HashMap<u64, ClientDetails>,
    condemned: BTreeSet<u64>,
    next_id: u64,
}

struct RecvBuffers {
    data: Vec<u8>,
    ctrl: Vec<u8>,
}

struct ServerShared {
    // handed to client handles and pending replies so they can call back in
    weak_self: Weak<ServerShared>,
    epoll: Epoll,
    wake: EventFd,
    pool: SendBufferPool,
    monitor: Option<ServerMonitor>,
    sockets: Mutex<Sockets>,
    clients: Mutex<Clients>,
    recv_bufs: Mutex<RecvBuffers>,
}

/// The server core: listening sockets, accepted clients, and the dispatch
/// reactor. `add_socket`, `add_client`, `send_event` and
/// `disconnect_client` are thread-safe; `process` and `wait` belong to a
/// single driving thread.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Create a server. Monitor-tap support is switched by the
    /// `RIALTO_IPC_MONITOR` environment variable ("ON" or "1" enables it).
    pub fn new() -> Result<Self, Error> {
        let allow = match std::env::var("RIALTO_IPC_MONITOR") {
            Ok(value) => value.contains("ON") || value.contains('1'),
            Err(_) => false,
        };
        Self::with_monitor_allowed(allow)
    }

    /// Create a server with the monitoring capability decided by the caller
    /// rather than the environment.
    pub fn with_monitor_allowed(allow_monitoring: bool) -> Result<Self, Error> {
        let wake = EventFd::from_flags(EfdFlags::EFD_CLOEXEC).map_err(|e| {
            error!("eventfd failed: {e}");
            e
        })?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| {
            error!("epoll_create1 failed: {e}");
            e
        })?;
        epoll.add(&wake, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_EVENT_ID))?;

        Ok(Self {
            shared: Arc::new_cyclic(|weak| ServerShared {
                weak_self: weak.clone(),
                epoll,
                wake,
                pool: SendBufferPool::new(),
                monitor: allow_monitoring.then(ServerMonitor::new),
                sockets: Mutex::new(Sockets {
                    map: HashMap::new(),
                    next_id: FIRST_SOCKET_ID,
                }),
                clients: Mutex::new(Clients {
                    map: HashMap::new(),
                    condemned: BTreeSet::new(),
                    next_id: FIRST_CLIENT_ID,
                }),
                recv_bufs: Mutex::new(RecvBuffers {
                    data: vec![0; MAX_MESSAGE_SIZE],
                    ctrl: vec![0; transport::recv_ctrl_capacity()],
                }),
            }),
        })
    }

    /// Bind and listen on `path`. A companion `<path>.lock` file is created
    /// and exclusively flock'd for the server's lifetime, so a second
    /// server naming the same path fails here rather than stealing the
    /// socket. Returns false on any failure.
    pub fn add_socket<P: AsRef<Path>>(
        &self,
        path: P,
        connected_cb: Option<ConnectCallback>,
        disconnected_cb: Option<DisconnectCallback>,
    ) -> bool {
        self.shared
            .add_socket(path.as_ref(), connected_cb, disconnected_cb)
    }

    /// Adopt an already-connected client socket (for supervisors that hand
    /// sockets to spawned processes). The fd is validated, dup'd under
    /// cloexec and made non-blocking; the caller keeps its copy.
    pub fn add_client<F: AsFd>(
        &self,
        sock: F,
        disconnected_cb: Option<DisconnectCallback>,
    ) -> Option<ClientHandle> {
        let raw = sock.as_fd().as_raw_fd();
        if !transport::check_seqpacket_socket(raw) {
            return None;
        }

        let mut dup = FileDescriptor::new(raw);
        if !dup.is_valid() {
            error!("failed to dup supplied client socket");
            return None;
        }
        // SAFETY: release() hands over sole ownership of a fd we just dup'd.
        let owned = unsafe { OwnedFd::from_raw_fd(dup.release()) };

        if let Err(e) = crate::fd::set_nonblocking(&owned) {
            error!("failed to set socket to non-blocking mode: {e}");
            return None;
        }

        self.shared
            .add_client_socket(owned, Path::new(""), disconnected_cb)
    }

    pub fn is_client_connected(&self, client_id: u64) -> bool {
        self.shared.is_client_connected(client_id)
    }

    /// Push an event to `client_id`; see [`ClientHandle::send_event`].
    pub fn send_event(&self, client_id: u64, message: &mut dyn IpcMessage) -> bool {
        self.shared.send_event(client_id, message)
    }

    /// Queue a client for teardown on the next reactor tick.
    pub fn disconnect_client(&self, client_id: u64) {
        self.shared.disconnect_client(client_id);
    }

    /// The epoll fd, for embedding the server into an external poll loop.
    pub fn fd(&self) -> RawFd {
        self.shared.epoll.0.as_raw_fd()
    }

    /// Block until the server has work or `timeout_ms` elapses (negative
    /// means no timeout).
    pub fn wait(&self, timeout_ms: i32) -> bool {
        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::NONE);
        let mut fds = [PollFd::new(self.shared.epoll.0.as_fd(), PollFlags::POLLIN)];
        if let Err(e) = retry_eintr(|| poll(&mut fds, timeout)) {
            error!("poll failed: {e}");
            return false;
        }
        true
    }

    /// Non-blocking reactor tick: accept connections, dispatch inbound
    /// calls, then tear down condemned clients.
    pub fn process(&self) -> bool {
        let shared = &self.shared;

        let mut events = [EpollEvent::empty(); 32];
        let n = match retry_eintr(|| shared.epoll.wait(&mut events, EpollTimeout::ZERO)) {
            Ok(n) => n,
            Err(e) => {
                error!("epoll_wait failed: {e}");
                return false;
            }
        };

        for event in &events[..n] {
            let id = event.data();
            if id == WAKE_EVENT_ID {
                let mut ignore = [0_u8; 8];
                if retry_eintr(|| nix::unistd::read(&shared.wake, &mut ignore)).is_err() {
                    error!("failed to read wake eventfd");
                }
            } else if id < FIRST_CLIENT_ID {
                if event.events().contains(EpollFlags::EPOLLIN) {
                    shared.process_new_connection(id);
                }
                if event.events().contains(EpollFlags::EPOLLERR) {
                    error!("error occurred on listening socket");
                }
            } else {
                shared.process_client_socket(id, event.events());
            }
        }

        shared.reap_condemned_clients();

        true
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let mut sockets = self.shared.sockets.lock().unwrap();
        for (_, socket) in sockets.map.drain() {
            if let Err(e) = std::fs::remove_file(&socket.path) {
                error!("failed to remove socket @ '{}': {e}", socket.path.display());
            }
            if let Err(e) = std::fs::remove_file(&socket.lock_path) {
                error!(
                    "failed to remove socket lock file @ '{}': {e}",
                    socket.lock_path.display()
                );
            }
        }
    }
}

impl ServerShared {
    /// Create (if needed) and exclusively lock the `<path>.lock` companion
    /// file, then recycle a stale socket left behind by a crashed server.
    fn take_socket_lock(path: &Path) -> Option<(Flock<File>, PathBuf)> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o660)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) => {
                error!(
                    "failed to create / open lockfile @ '{}' (check permissions): {e}",
                    lock_path.display()
                );
                return None;
            }
        };

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, e)) => {
                error!(
                    "failed to lock lockfile @ '{}', maybe another server is running: {e}",
                    lock_path.display()
                );
                return None;
            }
        };

        // with the lock held, a leftover socket writable by user or group
        // must be from a dead server and can be unlinked before bind
        match stat(path) {
            Ok(st) => {
                if st.st_mode & (libc::S_IWUSR | libc::S_IWGRP) != 0 {
                    let _ = std::fs::remove_file(path);
                }
            }
            Err(nix::errno::Errno::ENOENT) => {}
            Err(e) => {
                error!(
                    "did not manage to stat existing socket @ '{}': {e}",
                    path.display()
                );
                return None;
            }
        }

        Some((lock, lock_path))
    }

    fn add_socket(
        &self,
        path: &Path,
        connected_cb: Option<ConnectCallback>,
        disconnected_cb: Option<DisconnectCallback>,
    ) -> bool {
        let sock = match socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        ) {
            Ok(sock) => sock,
            Err(e) => {
                error!("socket error: {e}");
                return false;
            }
        };

        let Some((lock, lock_path)) = Self::take_socket_lock(path) else {
            return false;
        };

        let addr = match UnixAddr::new(path) {
            Ok(addr) => addr,
            Err(e) => {
                error!("bad socket path '{}': {e}", path.display());
                let _ = std::fs::remove_file(&lock_path);
                return false;
            }
        };

        if let Err(e) = bind(sock.as_raw_fd(), &addr) {
            error!("bind error: {e}");
            let _ = std::fs::remove_file(&lock_path);
            return false;
        }

        let backlog = Backlog::new(1).unwrap_or(Backlog::MAXCONN);
        if let Err(e) = listen(&sock, backlog) {
            error!("listen error: {e}");
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(&lock_path);
            return false;
        }

        let socket_id = {
            let mut sockets = self.sockets.lock().unwrap();
            if sockets.next_id >= FIRST_CLIENT_ID {
                // the fd table would overflow long before 10k listeners
                error!("too many listening sockets");
                let _ = std::fs::remove_file(path);
                let _ = std::fs::remove_file(&lock_path);
                return false;
            }
            let id = sockets.next_id;
            sockets.next_id += 1;
            id
        };

        if let Err(e) = self
            .epoll
            .add(&sock, EpollEvent::new(EpollFlags::EPOLLIN, socket_id))
        {
            error!("epoll_ctl failed to add listening socket: {e}");
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(&lock_path);
            return false;
        }

        let mut sockets = self.sockets.lock().unwrap();
        sockets.map.insert(
            socket_id,
            ListeningSocket {
                sock,
                path: path.to_path_buf(),
                _lock: lock,
                lock_path,
                connected_cb,
                disconnected_cb,
            },
        );

        info!("added listening socket '{}' to server", path.display());

        true
    }

    fn add_client_socket(
        &self,
        sock: OwnedFd,
        socket_path: &Path,
        disconnected_cb: Option<DisconnectCallback>,
    ) -> Option<ClientHandle> {
        let Some(creds) = transport::peer_credentials(sock.as_raw_fd()) else {
            error!("failed to get client's details");
            return None;
        };

        let client_id = {
            let mut clients = self.clients.lock().unwrap();
            let id = clients.next_id;
            clients.next_id += 1;
            id
        };

        if let Err(e) = self
            .epoll
            .add(&sock, EpollEvent::new(EpollFlags::EPOLLIN, client_id))
        {
            error!("epoll_ctl failed to add client socket: {e}");
            return None;
        }

        let handle = ClientHandle {
            core: self.weak_self.clone(),
            id: client_id,
            creds,
        };

        {
            let mut clients = self.clients.lock().unwrap();
            clients.map.insert(
                client_id,
                ClientDetails {
                    sock: Some(sock),
                    handle: handle.clone(),
                    services: HashMap::new(),
                    disconnected_cb,
                },
            );
        }

        if let Some(monitor) = &self.monitor {
            monitor.client_connected(socket_path, client_id, &handle);
        }

        info!("new client connected - giving id {client_id}");

        Some(handle)
    }

    fn process_new_connection(&self, socket_id: u64) {
        debug!("processing new connection");

        let (listen_fd, path, connected_cb, disconnected_cb) = {
            let sockets = self.sockets.lock().unwrap();
            let Some(socket) = sockets.map.get(&socket_id) else {
                error!("failed to find listening socket with id {socket_id}");
                return;
            };
            (
                socket.sock.as_raw_fd(),
                socket.path.clone(),
                socket.connected_cb.clone(),
                socket.disconnected_cb.clone(),
            )
        };

        let client_sock =
            match retry_eintr(|| accept4(listen_fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC)) {
                Ok(fd) => {
                    // SAFETY: accept4 returned a brand new fd we now own.
                    unsafe { OwnedFd::from_raw_fd(fd) }
                }
                Err(e) => {
                    error!("failed to accept client connection: {e}");
                    return;
                }
            };

        let Some(handle) = self.add_client_socket(client_sock, &path, disconnected_cb) else {
            return;
        };

        if let Some(cb) = connected_cb {
            cb(&handle);
        }
    }

    fn process_client_socket(&self, client_id: u64, events: EpollFlags) {
        let (sock, handle) = {
            let clients = self.clients.lock().unwrap();
            let Some(details) = clients.map.get(&client_id) else {
                error!("received an event from a socket with no matching client");
                return;
            };
            // already marked for closure, the data no longer matters
            if clients.condemned.contains(&client_id) {
                return;
            }
            (
                details.sock.as_ref().map(|s| s.as_raw_fd()),
                details.handle.clone(),
            )
        };

        if events.contains(EpollFlags::EPOLLERR) {
            error!("error detected on client socket - disconnecting client");
            self.disconnect_client(client_id);
            return;
        }
        if !events.contains(EpollFlags::EPOLLIN) {
            return;
        }
        let Some(sock) = sock else {
            return;
        };

        let mut bufs = self.recv_bufs.lock().unwrap();
        let RecvBuffers { data, ctrl } = &mut *bufs;

        loop {
            match transport::recv_frame(sock, data, ctrl, SERVER_MAX_FDS) {
                Ok(RecvFrame::WouldBlock) => break,
                Ok(RecvFrame::Truncated) => {
                    warn!("received message from client {client_id} truncated, discarding");
                }
                Ok(RecvFrame::Disconnected) => {
                    self.disconnect_client(client_id);
                    break;
                }
                Ok(RecvFrame::Message { len, mut fds }) => {
                    self.process_client_message(&handle, &data[..len], &mut fds);
                }
                Err(e) => {
                    error!("error reading client socket: {e}");
                    self.disconnect_client(client_id);
                    break;
                }
            }
        }
    }

    fn process_client_message(
        &self,
        client: &ClientHandle,
        data: &[u8],
        fds: &mut Vec<FileDescriptor>,
    ) {
        debug!(
            "processing client message of size {} bytes ({} fds) from client {}",
            data.len(),
            fds.len(),
            client.id()
        );

        let mut message = MessageToServer::default();
        let mut input = data;
        if message.deserialize(&mut input).is_err() {
            error!("invalid request");
            return;
        }

        match message {
            MessageToServer::Call(call) => self.process_method_call(client, call, fds),
            MessageToServer::MonitorRegister => self.process_monitor_request(client, fds),
        }
    }

    fn process_method_call(
        &self,
        client: &ClientHandle,
        call: WireCall,
        fds: &mut Vec<FileDescriptor>,
    ) {
        let service: Option<Arc<dyn IpcService>> = {
            let clients = self.clients.lock().unwrap();
            clients
                .map
                .get(&client.id())
                .and_then(|details| details.services.get(call.service_name.as_str()).cloned())
        };
        let Some(service) = service else {
            error!("unknown service request '{}'", call.service_name);
            self.send_error_reply(
                client.id(),
                call.serial_id,
                &format!("Unknown service '{}'", call.service_name),
            );
            return;
        };

        let Some(method) = service
            .methods()
            .iter()
            .find(|m| m.name == call.method_name)
            .copied()
        else {
            error!("no method with name '{}'", call.method_name);
            self.send_error_reply(
                client.id(),
                call.serial_id,
                &format!("Unknown method '{}'", call.method_name),
            );
            return;
        };

        let mut request = service.new_request(&method);
        let mut input = call.body.as_slice();
        if request.deserialize(&mut input).is_err() {
            error!("failed to parse request for {}.{}", call.service_name, call.method_name);
            return;
        }
        if transport::attach_message_fds(request.as_mut(), fds).is_err() {
            error!("mismatch of file descriptors to the request");
            return;
        }

        if let Some(monitor) = &self.monitor {
            monitor.call(client.id(), &call, method.no_reply);
        }

        debug!(
            "call{{ serial {} }} - {}.{}",
            call.serial_id, call.service_name, call.method_name
        );

        let controller = ServerController {
            client: client.clone(),
            serial_id: call.serial_id,
            failed: false,
            reason: String::new(),
        };
        let response = service.new_response(&method);
        let reply = PendingReply {
            core: self.weak_self.clone(),
            client_id: client.id(),
            serial_id: call.serial_id,
            no_reply: method.no_reply,
        };

        service.call_method(&method, controller, request, response, reply);
    }

    fn process_monitor_request(&self, client: &ClientHandle, fds: &mut Vec<FileDescriptor>) {
        let Some(monitor) = &self.monitor else {
            warn!("received request to enable monitoring but it is disabled");
            return;
        };

        // only root may wiretap the server
        if client.uid() != 0 {
            warn!("request to install monitor received from non-root user, ignoring");
            return;
        }

        if fds.len() != 1 {
            warn!("invalid number of fds passed in register monitor call");
            return;
        }

        monitor.add_monitor_socket(fds.remove(0));
    }

    /// Send the serialized envelope to a client if it is still connected.
    /// Thread-safe; the clients lock pins the socket open across the send.
    fn send_to_client(&self, client_id: u64, wire_bytes: &[u8], fds: &[RawFd]) -> bool {
        let clients = self.clients.lock().unwrap();
        let Some(sock) = clients.map.get(&client_id).and_then(|d| d.sock.as_ref()) else {
            warn!("socket removed before message could be sent");
            return false;
        };

        if let Err(e) = transport::send_frame(sock.as_raw_fd(), &self.pool, wire_bytes, fds) {
            error!("failed to send the complete message: {e}");
            return false;
        }

        true
    }

    fn send_reply(&self, client_id: u64, serial_id: u64, response: &mut dyn IpcMessage) {
        // pull the fds out and scrub the wire copies to -1
        let fds = transport::take_message_fds(response);

        let reply = MethodCallReply {
            reply_id: serial_id,
            body: response.serialize_alloc(),
        };
        let wire_bytes = MessageFromServer::Reply(reply.clone()).serialize_alloc();
        if wire_bytes.len() > MAX_MESSAGE_SIZE {
            error!(
                "reply exceeds maximum message limit ({}, max {})",
                wire_bytes.len(),
                MAX_MESSAGE_SIZE
            );
            // too big to send as-is, degrade to a generic error
            self.send_error_reply(client_id, serial_id, "Internal error - reply message too large");
            return;
        }

        if let Some(monitor) = &self.monitor {
            monitor.reply(client_id, &reply);
        }

        debug!("reply{{ serial {serial_id} }}");

        self.send_to_client(client_id, &wire_bytes, &fds);
    }

    fn send_error_reply(&self, client_id: u64, serial_id: u64, reason: &str) {
        let mut error = MethodCallError {
            reply_id: serial_id,
            reason: reason.to_string(),
        };

        if MessageFromServer::Error(error.clone()).serialize_alloc().len() > MAX_MESSAGE_SIZE {
            error!("error reply exceeds max message size");
            error.reason = "Error message truncated".to_string();
        }

        if let Some(monitor) = &self.monitor {
            monitor.error(client_id, &error);
        }

        debug!("error{{ serial {serial_id} }} - \"{}\"", error.reason);

        let wire_bytes = MessageFromServer::Error(error).serialize_alloc();
        self.send_to_client(client_id, &wire_bytes, &[]);
    }

    fn send_event(&self, client_id: u64, message: &mut dyn IpcMessage) -> bool {
        let fds = transport::take_message_fds(message);

        let event = EventFromServer {
            name: message.type_name().to_string(),
            body: message.serialize_alloc(),
        };

        let wire_bytes = MessageFromServer::Event(event.clone()).serialize_alloc();
        if wire_bytes.len() > MAX_MESSAGE_SIZE {
            error!(
                "event message too big to fit in buffer (size {}, max size {})",
                wire_bytes.len(),
                MAX_MESSAGE_SIZE
            );
            return false;
        }

        if !self.send_to_client(client_id, &wire_bytes, &fds) {
            return false;
        }

        if let Some(monitor) = &self.monitor {
            monitor.event(client_id, &event);
        }

        debug!("event{{ {} }}", event.name);

        true
    }

    fn is_client_connected(&self, client_id: u64) -> bool {
        self.clients.lock().unwrap().map.contains_key(&client_id)
    }

    /// May be called from the reactor on a socket error, or from any thread
    /// through [`ClientHandle::disconnect`]. The actual teardown happens on
    /// the next reactor tick.
    fn disconnect_client(&self, client_id: u64) {
        {
            let mut clients = self.clients.lock().unwrap();
            clients.condemned.insert(client_id);
        }
        self.wake_event_loop();
    }

    fn wake_event_loop(&self) {
        let value = 1_u64.to_ne_bytes();
        if nix::unistd::write(&self.wake, &value).is_err() {
            error!("failed to write to the event fd");
        }
    }

    /// Tear down every condemned client: out of epoll, shutdown, close,
    /// then the disconnect callback and monitor notification with no lock
    /// held.
    fn reap_condemned_clients(&self) {
        loop {
            let (client_id, details) = {
                let mut clients = self.clients.lock().unwrap();
                let Some(&client_id) = clients.condemned.iter().next() else {
                    return;
                };
                clients.condemned.remove(&client_id);

                match clients.map.remove(&client_id) {
                    Some(details) => (client_id, details),
                    None => {
                        error!("failed to find condemned client");
                        continue;
                    }
                }
            };

            if let Some(sock) = &details.sock {
                if let Err(e) = self.epoll.delete(sock) {
                    error!("failed to remove socket from epoll: {e}");
                }
                if let Err(e) = nix::sys::socket::shutdown(sock.as_raw_fd(), Shutdown::Both) {
                    error!("failed to shutdown socket: {e}");
                }
            }

            if let Some(cb) = &details.disconnected_cb {
                cb(&details.handle);
            }

            if let Some(monitor) = &self.monitor {
                monitor.client_disconnected(client_id);
            }

            // the socket closes when `details` drops, outside the lock
        }
    }
}
