// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    os::fd::{AsRawFd, BorrowedFd},
    sync::{Arc, Mutex, Weak},
    thread,
};

use anyhow::{anyhow, Context as _};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use blackbox2_protocol as protocol;
use protocol::{Header, Opcode, PacketType, Status, HEADER_LEN};

use crate::{
    config::Config,
    consts,
    host::{loopback::LoopbackHost, Host, HostAddr, HostEvent, PeerId},
    pipe::{self, WakePipe},
};

/// Completion of an outgoing connect: `Ok` with the live peer, or a
/// failure status with `None`.
pub type ConnectCallback = Box<dyn FnOnce(Status, Option<PeerId>) + Send>;
/// Completion of a locally requested disconnect.
pub type DisconnectCallback = Box<dyn FnOnce(Status) + Send>;
/// Completion of an outgoing request, fired with the response payload.
pub type ResponseCallback = Box<dyn FnOnce(Status, &[u8]) + Send>;
/// Server-side hook for connects that no pending connect claims.
pub type ConnectHandler = Arc<dyn Fn(PeerId) + Send + Sync>;
/// Per-peer hook for a connection lost to the remote side. Fired at most
/// once; it is removed as it fires.
pub type DisconnectHandler = Box<dyn FnOnce() + Send>;
pub type EventHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type RequestHandler = Arc<dyn Fn(&mut RequestContext) + Send + Sync>;

fn build_packet(
    packet_type: PacketType,
    opcode: Opcode,
    session: u32,
    extra_data: u32,
    payload: &[u8],
) -> Vec<u8> {
    let header = Header {
        version: protocol::VERSION,
        packet_type: packet_type as u8,
        opcode: opcode as u8,
        session,
        extra_data,
    };
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    // writing into a Vec cannot fail
    let _ = header.encode_to(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Short-lived view of one incoming request, handed to the registered
/// request handler. Exactly one response goes out per context: either
/// the one the handler set, or a synthesized `Status::Unknown` reply
/// when the context drops with no response set (including on unwind).
pub struct RequestContext {
    transport: Weak<Mutex<TransportInner>>,
    peer: PeerId,
    opcode: Opcode,
    session: u32,
    payload: Vec<u8>,
    response: Option<Vec<u8>>,
    dirty: bool,
}

impl RequestContext {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Stage a bare status response, replacing any prior one.
    pub fn set_response(&mut self, status: Status) -> bool {
        self.set_response_bytes(status, &[])
    }

    /// Stage a response carrying an encoded payload, replacing any
    /// prior one.
    pub fn set_response_with<T>(&mut self, status: Status, payload: &T) -> bool
    where
        T: Serialize,
    {
        match protocol::encode(payload) {
            Ok(bytes) => self.set_response_bytes(status, &bytes),
            Err(err) => {
                error!("failed to serialize response payload: {:?}", err);
                false
            }
        }
    }

    fn set_response_bytes(&mut self, status: Status, payload: &[u8]) -> bool {
        self.response = Some(build_packet(
            PacketType::Response,
            self.opcode,
            self.session,
            status as u32,
            payload,
        ));
        self.dirty = true;
        true
    }

    /// Split the response duty out of this context so it can be
    /// answered after the handler returns. The original context goes
    /// quiet; the returned one carries the exactly-once guarantee.
    pub fn defer(&mut self) -> RequestContext {
        let deferred = RequestContext {
            transport: self.transport.clone(),
            peer: self.peer,
            opcode: self.opcode,
            session: self.session,
            payload: std::mem::take(&mut self.payload),
            response: self.response.take(),
            dirty: self.dirty,
        };
        self.dirty = false;
        deferred
    }

    /// Send the staged response if one is pending. Runs automatically
    /// when the context drops.
    pub fn flush_response(&mut self) {
        if !self.dirty {
            return;
        }
        let packet = self.response.take().unwrap_or_else(|| {
            build_packet(
                PacketType::Response,
                self.opcode,
                self.session,
                Status::Unknown as u32,
                &[],
            )
        });
        match self.transport.upgrade() {
            Some(inner) => {
                let mut inner = inner.lock().unwrap();
                if inner.send_raw(self.peer, packet) {
                    self.dirty = false;
                }
            }
            None => {
                warn!("transport is gone, dropping response for session {}", self.session);
                self.dirty = false;
            }
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        self.flush_response();
    }
}

/// One unit of backend work, extracted from the state tables under the
/// transport lock and executed with the lock released.
enum Step {
    Job(Box<dyn FnOnce() + Send>),
    Skip,
    Idle,
}

struct TransportInner {
    config: Config,
    host: Option<Box<dyn Host>>,
    pipe: WakePipe,
    backend_run: bool,
    backend: Option<thread::JoinHandle<()>>,
    /// Next session id. Monotonic across all peers of this transport.
    session: u32,
    pending_connects: HashMap<PeerId, ConnectCallback>,
    pending_disconnects: HashMap<PeerId, DisconnectCallback>,
    connect_handler: Option<ConnectHandler>,
    disconnect_handlers: HashMap<PeerId, DisconnectHandler>,
    event_handlers: HashMap<PeerId, HashMap<Opcode, EventHandler>>,
    request_handlers: HashMap<PeerId, HashMap<Opcode, RequestHandler>>,
    outstanding: HashMap<PeerId, HashMap<u32, ResponseCallback>>,
}

impl TransportInner {
    fn wakeup_backend(&self) -> bool {
        if !self.backend_run {
            warn!("backend thread is not running");
            return false;
        }
        self.pipe.write_byte(pipe::CMD_WAKEUP)
    }

    fn send_raw(&mut self, peer: PeerId, packet: Vec<u8>) -> bool {
        let Some(host) = self.host.as_mut() else {
            error!("send with no host");
            return false;
        };
        if !host.send(peer, packet) {
            error!("failed to send packet to {}", peer);
            return false;
        }
        self.wakeup_backend();
        true
    }

    fn send_packet(
        &mut self,
        peer: PeerId,
        packet_type: PacketType,
        opcode: Opcode,
        session: u32,
        extra_data: u32,
        payload: &[u8],
    ) -> bool {
        self.send_raw(peer, build_packet(packet_type, opcode, session, extra_data, payload))
    }

    fn handle_async_command(&mut self) {
        let Some(cmd) = self.pipe.read_byte() else {
            return;
        };
        match cmd {
            pipe::CMD_WAKEUP => {
                // nothing to do; the wakeup already did its job
            }
            pipe::CMD_EXIT => {
                info!("backend got exit command");
                self.backend_run = false;
            }
            other => {
                error!("unknown async command: {}", other);
            }
        }
    }

    /// Convert at most one pending host event into a dispatch job.
    /// Handler lookups happen here, after every previously dispatched
    /// handler has run, so a handler registered by one event (say, the
    /// registry reacting to a connect) sees the packets that follow it.
    fn next_step(&mut self, shared: &Arc<Mutex<TransportInner>>) -> Step {
        let event = {
            let Some(host) = self.host.as_mut() else {
                return Step::Idle;
            };
            match host.service() {
                Some(event) => event,
                None => return Step::Idle,
            }
        };
        match event {
            HostEvent::Connect { peer } => self.step_connect(peer),
            HostEvent::Disconnect { peer } => self.step_disconnect(peer),
            HostEvent::Receive { peer, data } => self.step_packet(shared, peer, data),
        }
    }

    fn step_connect(&mut self, peer: PeerId) -> Step {
        if let Some(cb) = self.pending_connects.remove(&peer) {
            debug!("{} connected", peer);
            return Step::Job(Box::new(move || cb(Status::Ok, Some(peer))));
        }
        // Unsolicited connect: an instrumented process dialing into the
        // server role. Accepted peers get the same liveness discipline
        // as dialed ones.
        if let Some(host) = self.host.as_mut() {
            host.set_peer_timeout(
                peer,
                consts::PEER_TIMEOUT_LIMIT,
                consts::PEER_TIMEOUT_MIN_MS,
                consts::PEER_TIMEOUT_MAX_MS,
            );
        }
        match self.connect_handler.clone() {
            Some(handler) => Step::Job(Box::new(move || handler(peer))),
            None => {
                warn!("{}: unsolicited connect with no handler", peer);
                Step::Skip
            }
        }
    }

    fn step_disconnect(&mut self, peer: PeerId) -> Step {
        debug!("{} disconnected", peer);

        // The peer token is dead and will never be seen again, so every
        // table entry it owns goes now. In-flight request continuations
        // are failed rather than leaked.
        self.event_handlers.remove(&peer);
        self.request_handlers.remove(&peer);
        let orphaned: Vec<ResponseCallback> = self
            .outstanding
            .remove(&peer)
            .map(|sessions| sessions.into_values().collect())
            .unwrap_or_default();

        let pending_disconnect = self.pending_disconnects.remove(&peer);
        let pending_connect = self.pending_connects.remove(&peer);
        let disconnect_handler = self.disconnect_handlers.remove(&peer);

        let resolution: Option<Box<dyn FnOnce() + Send>> = if let Some(cb) = pending_disconnect {
            Some(Box::new(move || cb(Status::Ok)))
        } else if let Some(cb) = pending_connect {
            Some(Box::new(move || cb(Status::Timeout, None)))
        } else if let Some(handler) = disconnect_handler {
            Some(Box::new(handler))
        } else {
            None
        };

        Step::Job(Box::new(move || {
            for cb in orphaned {
                cb(Status::Timeout, &[]);
            }
            if let Some(resolution) = resolution {
                resolution();
            }
        }))
    }

    fn step_packet(
        &mut self,
        shared: &Arc<Mutex<TransportInner>>,
        peer: PeerId,
        data: Vec<u8>,
    ) -> Step {
        let header = match Header::decode(&data) {
            Ok(header) => header,
            Err(err) => {
                error!("{}: dropping malformed packet: {}", peer, err);
                return Step::Skip;
            }
        };
        if header.version < protocol::VERSION {
            error!(
                "{}: dropping packet with protocol version {}, need at least {}",
                peer,
                header.version,
                protocol::VERSION
            );
            return Step::Skip;
        }
        let Ok(packet_type) = PacketType::try_from(header.packet_type) else {
            error!("{}: dropping packet with invalid type {}", peer, header.packet_type);
            return Step::Skip;
        };
        let Ok(opcode) = Opcode::try_from(header.opcode) else {
            error!("{}: dropping packet with invalid opcode {}", peer, header.opcode);
            return Step::Skip;
        };

        let mut data = data;
        let payload = data.split_off(HEADER_LEN);

        match packet_type {
            PacketType::Event => {
                let handler =
                    self.event_handlers.get(&peer).and_then(|m| m.get(&opcode)).cloned();
                match handler {
                    Some(handler) => Step::Job(Box::new(move || handler(&payload))),
                    None => {
                        debug!("{}: no handler for event {:?}", peer, opcode);
                        Step::Skip
                    }
                }
            }
            PacketType::Request => {
                let handler =
                    self.request_handlers.get(&peer).and_then(|m| m.get(&opcode)).cloned();
                match handler {
                    Some(handler) => {
                        let mut ctx = RequestContext {
                            transport: Arc::downgrade(shared),
                            peer,
                            opcode,
                            session: header.session,
                            payload,
                            response: None,
                            dirty: true,
                        };
                        Step::Job(Box::new(move || handler(&mut ctx)))
                    }
                    None => {
                        // the transport never answers on a handler's
                        // behalf; the caller's session stays pending
                        warn!("{}: no handler for request {:?}", peer, opcode);
                        Step::Skip
                    }
                }
            }
            PacketType::Response => {
                let status = Status::from_wire(header.extra_data);
                let cb = match self.outstanding.get_mut(&peer) {
                    Some(sessions) => {
                        let cb = sessions.remove(&header.session);
                        if sessions.is_empty() {
                            self.outstanding.remove(&peer);
                        }
                        cb
                    }
                    None => None,
                };
                match cb {
                    Some(cb) => Step::Job(Box::new(move || cb(status, &payload))),
                    None => {
                        debug!("{}: no request session {}", peer, header.session);
                        Step::Skip
                    }
                }
            }
        }
    }
}

/// The reliable transport: one host, one backend thread, and the
/// peer-indexed dispatch state. Shared by every stub or proxy in a
/// process; all operations are asynchronous and complete through
/// continuations run on the backend thread with the transport lock
/// released.
pub struct Transport {
    inner: Arc<Mutex<TransportInner>>,
}

impl Transport {
    pub fn new(config: Config) -> Arc<Transport> {
        Arc::new(Transport {
            inner: Arc::new(Mutex::new(TransportInner {
                config,
                host: None,
                pipe: WakePipe::new(),
                backend_run: false,
                backend: None,
                session: 1,
                pending_connects: HashMap::new(),
                pending_disconnects: HashMap::new(),
                connect_handler: None,
                disconnect_handlers: HashMap::new(),
                event_handlers: HashMap::new(),
                request_handlers: HashMap::new(),
                outstanding: HashMap::new(),
            })),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().config.enabled
    }

    pub fn server_addr(&self) -> HostAddr {
        self.inner.lock().unwrap().config.server.clone()
    }

    /// Bring up the host and backend thread for the client role. Fails
    /// when blackbox2 is disabled by the environment or the transport
    /// is already running.
    #[instrument(skip_all)]
    pub fn start_as_client(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.config.enabled {
            return Err(anyhow!("blackbox2 is not enabled"));
        }
        let host = LoopbackHost::client().context("creating client host")?;
        self.start_locked(&mut inner, Box::new(host))
    }

    /// Bring up the host bound to the configured (or given) address and
    /// install the unsolicited-connect handler, for the server role.
    #[instrument(skip_all)]
    pub fn start_as_server(
        &self,
        on_connect: ConnectHandler,
        addr: Option<&HostAddr>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let addr = addr.cloned().unwrap_or_else(|| inner.config.server.clone());
        let host = LoopbackHost::server(&addr)
            .with_context(|| format!("creating server host on {}", addr))?;
        self.start_locked(&mut inner, Box::new(host))?;
        inner.connect_handler = Some(on_connect);
        inner.wakeup_backend();
        Ok(())
    }

    fn start_locked(
        &self,
        inner: &mut TransportInner,
        host: Box<dyn Host>,
    ) -> anyhow::Result<()> {
        if inner.backend_run && inner.pipe.is_open() {
            return Err(anyhow!("transport already started"));
        }
        inner.pipe.open().context("opening wake pipe")?;
        inner.backend_run = true;
        inner.host = Some(host);

        let shared = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(String::from("blackbox2-backend"))
            .spawn(move || backend_loop(shared));
        match spawned {
            Ok(handle) => {
                inner.backend = Some(handle);
                Ok(())
            }
            Err(err) => {
                inner.backend_run = false;
                inner.host = None;
                inner.pipe.close();
                Err(err).context("spawning backend thread")
            }
        }
    }

    /// Signal the backend thread to exit, join it, then tear down the
    /// host and drop all dispatch state and pending continuations.
    #[instrument(skip_all)]
    pub fn stop(&self) {
        let backend = {
            let mut inner = self.inner.lock().unwrap();
            if inner.backend_run && !inner.pipe.write_byte(pipe::CMD_EXIT) {
                error!("failed to write exit command to wake pipe");
            }
            inner.backend.take()
        };
        // join with the lock released; the backend needs it to wind down
        if let Some(backend) = backend {
            if backend.thread().id() == thread::current().id() {
                // The last reference died inside a backend dispatch.
                // The loop exits on the command just queued; the inner
                // state (host, pipe, tables) goes down with its Arc.
                return;
            }
            if backend.join().is_err() {
                error!("backend thread panicked");
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.backend_run = false;
        inner.pipe.close();
        inner.host = None;
        inner.connect_handler = None;
        inner.pending_connects.clear();
        inner.pending_disconnects.clear();
        inner.disconnect_handlers.clear();
        inner.event_handlers.clear();
        inner.request_handlers.clear();
        inner.outstanding.clear();
    }

    /// Dial the configured server address. The callback fires on the
    /// backend thread once the connect settles either way.
    pub fn connect(&self, cb: ConnectCallback) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let addr = inner.config.server.clone();
        let Some(host) = inner.host.as_mut() else {
            error!("connect with no host");
            return false;
        };
        let Some(peer) = host.connect(&addr) else {
            error!("connect to {} failed", addr);
            return false;
        };
        host.set_peer_timeout(
            peer,
            consts::PEER_TIMEOUT_LIMIT,
            consts::PEER_TIMEOUT_MIN_MS,
            consts::PEER_TIMEOUT_MAX_MS,
        );
        inner.pending_connects.insert(peer, cb);
        inner.wakeup_backend();
        true
    }

    /// Ask for a graceful disconnect. Duplicate requests for a peer
    /// that is already disconnecting are dropped.
    pub fn disconnect(&self, peer: PeerId, cb: Option<DisconnectCallback>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_disconnects.contains_key(&peer) {
            warn!("{} is already disconnecting", peer);
            return true;
        }
        let Some(host) = inner.host.as_mut() else {
            error!("disconnect with no host");
            return false;
        };
        host.disconnect(peer);
        if let Some(cb) = cb {
            inner.pending_disconnects.insert(peer, cb);
        }
        inner.wakeup_backend();
        true
    }

    /// Serialize and enqueue a one-way packet.
    pub fn send_event(&self, peer: PeerId, opcode: Opcode, payload: &[u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.send_packet(peer, PacketType::Event, opcode, 0, 0, payload)
    }

    /// Allocate the next session id, enqueue a request packet, and
    /// record the continuation for the matching response.
    pub fn send_request(
        &self,
        peer: PeerId,
        opcode: Opcode,
        payload: &[u8],
        cb: ResponseCallback,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let session = inner.session;
        if !inner.send_packet(peer, PacketType::Request, opcode, session, 0, payload) {
            return false;
        }
        inner.outstanding.entry(peer).or_default().insert(session, cb);
        inner.session = inner.session.wrapping_add(1);
        true
    }

    /// Install or (with None) clear an event handler.
    pub fn register_event_handler(
        &self,
        peer: PeerId,
        opcode: Opcode,
        handler: Option<EventHandler>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        match handler {
            Some(handler) => {
                inner.event_handlers.entry(peer).or_default().insert(opcode, handler);
            }
            None => {
                if let Some(handlers) = inner.event_handlers.get_mut(&peer) {
                    handlers.remove(&opcode);
                    if handlers.is_empty() {
                        inner.event_handlers.remove(&peer);
                    }
                }
            }
        }
    }

    /// Install or (with None) clear a request handler.
    pub fn register_request_handler(
        &self,
        peer: PeerId,
        opcode: Opcode,
        handler: Option<RequestHandler>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        match handler {
            Some(handler) => {
                inner.request_handlers.entry(peer).or_default().insert(opcode, handler);
            }
            None => {
                if let Some(handlers) = inner.request_handlers.get_mut(&peer) {
                    handlers.remove(&opcode);
                    if handlers.is_empty() {
                        inner.request_handlers.remove(&peer);
                    }
                }
            }
        }
    }

    /// Install the connection-lost hook for a peer. At most one.
    pub fn register_disconnect_handler(&self, peer: PeerId, handler: DisconnectHandler) {
        let mut inner = self.inner.lock().unwrap();
        inner.disconnect_handlers.insert(peer, handler);
    }

    /// The remote endpoint of a live peer.
    pub fn peer_addr(&self, peer: PeerId) -> Option<HostAddr> {
        let inner = self.inner.lock().unwrap();
        inner.host.as_ref().and_then(|host| host.peer_addr(peer))
    }

    /// Drop every piece of per-peer state: handlers, in-flight request
    /// continuations, and pending connect/disconnect continuations.
    pub fn unregister_all(&self, peer: PeerId) {
        debug!("{}: unregister all", peer);
        let mut inner = self.inner.lock().unwrap();
        inner.event_handlers.remove(&peer);
        inner.request_handlers.remove(&peer);
        inner.outstanding.remove(&peer);
        inner.pending_connects.remove(&peer);
        inner.pending_disconnects.remove(&peer);
        inner.disconnect_handlers.remove(&peer);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn backend_loop(shared: Arc<Mutex<TransportInner>>) {
    info!("backend thread started");

    loop {
        // Drain one host event per lock hold and run its dispatch job
        // with the lock released, so handlers are free to call back in.
        // Commands are drained here too: a busy host must not starve
        // the exit command.
        let step = {
            let mut inner = shared.lock().unwrap();
            inner.handle_async_command();
            if !inner.backend_run {
                break;
            }
            inner.next_step(&shared)
        };
        match step {
            Step::Job(job) => {
                job();
                continue;
            }
            Step::Skip => continue,
            Step::Idle => {}
        }

        // Nothing pending: wait for the wake pipe or the host socket.
        let (pipe_fd, host_fd) = {
            let inner = shared.lock().unwrap();
            if !inner.backend_run {
                break;
            }
            (
                inner.pipe.read_fd().map(|fd| fd.as_raw_fd()),
                inner.host.as_ref().map(|host| host.poll_fd().as_raw_fd()),
            )
        };
        let Some(pipe_fd) = pipe_fd else {
            error!("wake pipe closed while the backend is running");
            break;
        };

        // SAFETY: stop() joins this thread before closing the pipe or
        // dropping the host, so both fds outlive the poll call.
        let pipe_bfd = unsafe { BorrowedFd::borrow_raw(pipe_fd) };
        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::new(pipe_bfd, PollFlags::POLLIN));
        if let Some(host_fd) = host_fd {
            let host_bfd = unsafe { BorrowedFd::borrow_raw(host_fd) };
            fds.push(PollFd::new(host_bfd, PollFlags::POLLIN));
        }

        match poll(&mut fds, consts::BACKEND_POLL_MS) {
            Ok(0) => continue,
            Ok(_) => {
                let pipe_ready =
                    fds[0].revents().map(|r| r.contains(PollFlags::POLLIN)).unwrap_or(false);
                if pipe_ready {
                    let mut inner = shared.lock().unwrap();
                    inner.handle_async_command();
                }
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                error!("backend poll failed: {}", errno);
                break;
            }
        }
    }

    info!("backend thread exited");
}

#[cfg(test)]
mod test {
    use std::{
        sync::mpsc,
        time::Duration,
    };

    use super::*;
    use crate::host::loopback::LoopbackHost;

    fn test_config(port: u16) -> Config {
        Config {
            enabled: true,
            server: HostAddr { host: String::from("127.0.0.1"), port },
        }
    }

    fn start_pair(port: u16, on_connect: ConnectHandler) -> (Arc<Transport>, Arc<Transport>) {
        let server = Transport::new(test_config(port));
        server.start_as_server(on_connect, None).unwrap();
        let client = Transport::new(test_config(port));
        client.start_as_client().unwrap();
        (server, client)
    }

    fn connect_peer(client: &Arc<Transport>) -> PeerId {
        let (tx, rx) = mpsc::channel();
        assert!(client.connect(Box::new(move |status, peer| {
            tx.send((status, peer)).unwrap();
        })));
        let (status, peer) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, Status::Ok);
        peer.unwrap()
    }

    #[test]
    fn start_as_client_requires_enable_flag() {
        let transport = Transport::new(Config {
            enabled: false,
            server: HostAddr { host: String::from("127.0.0.1"), port: 62001 },
        });
        assert!(transport.start_as_client().is_err());
    }

    #[test]
    fn double_start_is_rejected() {
        let transport = Transport::new(test_config(62002));
        transport
            .start_as_server(Arc::new(|_| {}), None)
            .unwrap();
        assert!(transport.start_as_client().is_err());
        transport.stop();
    }

    #[test]
    fn connect_to_unbound_port_times_out() {
        let client = Transport::new(test_config(62003));
        client.start_as_client().unwrap();

        let (tx, rx) = mpsc::channel();
        assert!(client.connect(Box::new(move |status, peer| {
            tx.send((status, peer.is_some())).unwrap();
        })));
        let (status, has_peer) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, Status::Timeout);
        assert!(!has_peer);
        client.stop();
    }

    #[test]
    fn event_reaches_registered_handler() {
        let (peer_tx, peer_rx) = mpsc::channel();
        let (server, client) = start_pair(
            62004,
            Arc::new(move |peer| {
                peer_tx.send(peer).unwrap();
            }),
        );

        let client_peer = connect_peer(&client);
        let server_peer = peer_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (tx, rx) = mpsc::channel();
        server.register_event_handler(
            server_peer,
            Opcode::NodeAttach,
            Some(Arc::new(move |payload: &[u8]| {
                tx.send(payload.to_vec()).unwrap();
            })),
        );

        let payload = protocol::encode(&String::from("sensor")).unwrap();
        assert!(client.send_event(client_peer, Opcode::NodeAttach, &payload));
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, payload);

        client.stop();
        server.stop();
    }

    #[test]
    fn responses_correlate_by_session_out_of_order() {
        let (peer_tx, peer_rx) = mpsc::channel();
        let (server, client) = start_pair(
            62005,
            Arc::new(move |peer| {
                peer_tx.send(peer).unwrap();
            }),
        );
        let client_peer = connect_peer(&client);
        let server_peer = peer_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // park every incoming request so we can answer in reverse order
        let parked: Arc<Mutex<Vec<RequestContext>>> = Arc::new(Mutex::new(Vec::new()));
        let parked_in_handler = Arc::clone(&parked);
        server.register_request_handler(
            server_peer,
            Opcode::ProcessGetKeyStat,
            Some(Arc::new(move |ctx: &mut RequestContext| {
                let mut deferred = ctx.defer();
                deferred.set_response_with(Status::Ok, &deferred.session());
                parked_in_handler.lock().unwrap().push(deferred);
            })),
        );

        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let tx = tx.clone();
            assert!(client.send_request(
                client_peer,
                Opcode::ProcessGetKeyStat,
                &[],
                Box::new(move |status, payload| {
                    let echoed: u32 = protocol::decode(payload).unwrap();
                    tx.send((status, echoed)).unwrap();
                }),
            ));
        }

        // wait for both requests to park, then flush them in reverse
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while parked.lock().unwrap().len() < 2 {
            assert!(std::time::Instant::now() < deadline, "requests never arrived");
            thread::sleep(Duration::from_millis(10));
        }
        {
            let mut parked = parked.lock().unwrap();
            let first = parked.pop().unwrap(); // higher session first
            let second = parked.pop().unwrap();
            let (hi, lo) = (first.session(), second.session());
            assert!(hi > lo);
            drop(first);
            drop(second);
        }

        let (s1, echo1) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let (s2, echo2) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(s1, Status::Ok);
        assert_eq!(s2, Status::Ok);
        let mut echoes = vec![echo1, echo2];
        echoes.sort();
        echoes.dedup();
        assert_eq!(echoes.len(), 2, "each continuation saw its own session");

        client.stop();
        server.stop();
    }

    #[test]
    fn unanswered_request_gets_unknown_response() {
        let (peer_tx, peer_rx) = mpsc::channel();
        let (server, client) = start_pair(
            62006,
            Arc::new(move |peer| {
                peer_tx.send(peer).unwrap();
            }),
        );
        let client_peer = connect_peer(&client);
        let server_peer = peer_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // handler returns without ever calling set_response
        server.register_request_handler(
            server_peer,
            Opcode::AttachNode,
            Some(Arc::new(|_ctx: &mut RequestContext| {})),
        );

        let (tx, rx) = mpsc::channel();
        assert!(client.send_request(
            client_peer,
            Opcode::AttachNode,
            &[],
            Box::new(move |status, _payload| {
                tx.send(status).unwrap();
            }),
        ));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Status::Unknown);

        client.stop();
        server.stop();
    }

    #[test]
    fn garbage_packets_are_dropped_and_the_link_survives() {
        let (peer_tx, peer_rx) = mpsc::channel();
        let (server, client) = start_pair(
            62007,
            Arc::new(move |peer| {
                peer_tx.send(peer).unwrap();
            }),
        );
        let client_peer = connect_peer(&client);
        let server_peer = peer_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (tx, rx) = mpsc::channel();
        server.register_event_handler(
            server_peer,
            Opcode::NodeDetach,
            Some(Arc::new(move |_: &[u8]| {
                tx.send(()).unwrap();
            })),
        );

        // a raw host handle lets us bypass the typed send path
        let mut raw = LoopbackHost::client().unwrap();
        let raw_peer = raw.connect(&HostAddr { host: String::from("127.0.0.1"), port: 62007 }).unwrap();
        loop {
            match raw.service() {
                Some(HostEvent::Connect { .. }) => break,
                Some(_) => {}
                None => thread::sleep(Duration::from_millis(5)),
            }
        }
        // too short
        assert!(raw.send(raw_peer, vec![3, 0]));
        // stale version
        assert!(raw.send(raw_peer, build_packet(PacketType::Event, Opcode::NodeDetach, 0, 0, &[])
            .into_iter()
            .enumerate()
            .map(|(i, b)| if i == 0 { 2 } else { b })
            .collect()));
        // unknown type
        let mut bad_type = build_packet(PacketType::Event, Opcode::NodeDetach, 0, 0, &[]);
        bad_type[1] = 7;
        assert!(raw.send(raw_peer, bad_type));
        // unknown opcode
        let mut bad_opcode = build_packet(PacketType::Event, Opcode::NodeDetach, 0, 0, &[]);
        bad_opcode[2] = 0xFE;
        assert!(raw.send(raw_peer, bad_opcode));

        // the typed link still works after all of that
        assert!(client.send_event(client_peer, Opcode::NodeDetach, &[]));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        client.stop();
        server.stop();
    }

    #[test]
    fn disconnect_fails_outstanding_requests_with_timeout() {
        let (peer_tx, peer_rx) = mpsc::channel();
        let (server, client) = start_pair(
            62008,
            Arc::new(move |peer| {
                peer_tx.send(peer).unwrap();
            }),
        );
        let client_peer = connect_peer(&client);
        let server_peer = peer_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // no request handler on the server: the request stays pending
        let (tx, rx) = mpsc::channel();
        assert!(client.send_request(
            client_peer,
            Opcode::ProcessGetKeyStat,
            &[],
            Box::new(move |status, _| {
                tx.send(status).unwrap();
            }),
        ));
        // let the request land before yanking the peer
        thread::sleep(Duration::from_millis(50));
        server.disconnect(server_peer, None);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Status::Timeout);

        client.stop();
        server.stop();
    }

    #[test]
    fn session_ids_increase_across_peers() {
        let (peer_tx, peer_rx) = mpsc::channel();
        let (server, client) = start_pair(
            62009,
            Arc::new(move |peer| {
                peer_tx.send(peer).unwrap();
            }),
        );
        let p1 = connect_peer(&client);
        let _s1 = peer_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let p2 = connect_peer(&client);
        let _s2 = peer_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let sessions = {
            assert!(client.send_request(p1, Opcode::ProcessGetKeyStat, &[], Box::new(|_, _| {})));
            assert!(client.send_request(p2, Opcode::ProcessGetKeyStat, &[], Box::new(|_, _| {})));
            let inner = client.inner.lock().unwrap();
            let mut sessions: Vec<u32> = inner
                .outstanding
                .values()
                .flat_map(|m| m.keys().copied())
                .collect();
            sessions.sort();
            sessions
        };
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1], sessions[0] + 1);

        client.stop();
        server.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let transport = Transport::new(test_config(62010));
        transport.start_as_server(Arc::new(|_| {}), None).unwrap();
        transport.stop();
        transport.stop();
    }
}
