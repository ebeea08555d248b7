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

//! Client-side replicated entities.
//!
//! Every stub owns one peer connection to the server and drives the
//! attach handshake over it: connect, send the entity descriptor, learn
//! the server-assigned instance id, and mirror entity traffic from then
//! on. Connection loss resets the instance id to zero and the machine
//! dials again, indefinitely, until the stub is dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use blackbox2_protocol as protocol;
use protocol::{AttachResponse, Opcode, Status};

use crate::{
    host::PeerId,
    message::MessageLane,
    object::Endpoint,
    signal::{Signal, Subscription},
    transport::{EventHandler, RequestHandler, Transport},
};

pub mod channel;
pub mod executor;
pub mod handle;
pub mod node;

/// The descriptor a stub replicates, tagged by entity kind. Keeping the
/// kinds in one variant puts the attach opcode, the attach payload, and
/// the parent-id rewrite each behind a single match.
pub(crate) enum StubEntity {
    Process(protocol::Process),
    Channel { desc: protocol::Channel, lane: MessageLane },
    Executor(protocol::Executor),
    Node(protocol::Node),
    Handle { desc: protocol::Handle, lane: MessageLane },
}

impl StubEntity {
    fn attach_opcode(&self) -> Opcode {
        match self {
            StubEntity::Process(_) => Opcode::AttachProcess,
            StubEntity::Channel { .. } => Opcode::AttachChannel,
            StubEntity::Executor(_) => Opcode::AttachExecutor,
            StubEntity::Node(_) => Opcode::AttachNode,
            StubEntity::Handle { .. } => Opcode::AttachHandle,
        }
    }

    fn attach_payload(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            StubEntity::Process(desc) => protocol::encode(desc),
            StubEntity::Channel { desc, .. } => protocol::encode(desc),
            StubEntity::Executor(desc) => protocol::encode(desc),
            StubEntity::Node(desc) => protocol::encode(desc),
            StubEntity::Handle { desc, .. } => protocol::encode(desc),
        }
    }

    /// Rewrite the owner reference after the parent's instance id
    /// changed, so the next attach carries the fresh id.
    fn set_parent_instance_id(&mut self, id: u64) {
        match self {
            StubEntity::Process(_) => {}
            StubEntity::Channel { desc, .. } => desc.owner_process.id = id,
            StubEntity::Executor(desc) => desc.owner_process.id = id,
            StubEntity::Node(desc) => desc.owner_process.id = id,
            StubEntity::Handle { desc, .. } => desc.owner_node.id = id,
        }
    }

    pub fn lane(&self) -> Option<&MessageLane> {
        match self {
            StubEntity::Channel { lane, .. } | StubEntity::Handle { lane, .. } => Some(lane),
            _ => None,
        }
    }

    pub fn lane_mut(&mut self) -> Option<&mut MessageLane> {
        match self {
            StubEntity::Channel { lane, .. } | StubEntity::Handle { lane, .. } => Some(lane),
            _ => None,
        }
    }
}

pub(crate) struct StubInner {
    pub endpoint: Endpoint,
    /// False once the stub is stopped; no further dials happen then.
    connectable: bool,
    /// A connect is in flight. Connection loss and a failed attach can
    /// both ask for a reconnect; only one dial may result.
    dialing: bool,
    pub is_activated: bool,
    pub instance_id: u64,
    pub entity: StubEntity,
}

/// The attach state machine. One per replicated entity, shared between
/// the public wrapper, the parent's signal subscription, and the
/// transport callbacks (which hold it weakly).
pub(crate) struct StubCore {
    parent: Option<Arc<StubCore>>,
    pub on_instance_id_changed: Signal<u64>,
    pub inner: Mutex<StubInner>,
    /// Holds the subscription to the parent's instance-id signal for as
    /// long as this stub lives. Set once right after construction.
    parent_sub: Mutex<Option<Subscription>>,
}

impl StubCore {
    pub fn new(
        transport: Arc<Transport>,
        entity: StubEntity,
        parent: Option<Arc<StubCore>>,
    ) -> Arc<StubCore> {
        let core = Arc::new(StubCore {
            parent: parent.clone(),
            on_instance_id_changed: Signal::new(),
            inner: Mutex::new(StubInner {
                endpoint: Endpoint::new(transport),
                connectable: true,
                dialing: false,
                is_activated: true,
                instance_id: 0,
                entity,
            }),
            parent_sub: Mutex::new(None),
        });

        // the server may flip activation at any time
        let weak = Arc::downgrade(&core);
        core.register_event_handler(
            Opcode::Activate,
            Arc::new(move |payload: &[u8]| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match protocol::decode::<bool>(payload) {
                    Ok(value) => {
                        this.inner.lock().unwrap().is_activated = value;
                    }
                    Err(err) => error!("failed to decode activation event: {:?}", err),
                }
            }),
        );

        // a child holds off on attaching until the parent has an id;
        // the parent's signal is what un-blocks it
        if let Some(parent) = &parent {
            let weak = Arc::downgrade(&core);
            let sub = parent.on_instance_id_changed.subscribe(move |id| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                this.handle_parent_instance_id_changed(*id);
            });
            *core.parent_sub.lock().unwrap() = Some(sub);
        }

        core
    }

    /// Kick off the connect/attach machine. Returns false once the stub
    /// has been stopped.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connectable {
            return false;
        }
        self.connect_locked(&mut inner);
        true
    }

    /// Stop dialing. The current connection (if any) stays up until the
    /// stub drops.
    pub fn stop(&self) {
        let inner_id = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.connectable {
                warn!("stub already stopped");
                return;
            }
            inner.connectable = false;
            let id = inner.instance_id;
            inner.instance_id = 0;
            id
        };
        if inner_id != 0 {
            self.on_instance_id_changed.emit(&0);
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.inner.lock().unwrap().instance_id
    }

    pub fn transport(&self) -> Arc<Transport> {
        Arc::clone(self.inner.lock().unwrap().endpoint.transport())
    }

    pub fn register_event_handler(&self, opcode: Opcode, handler: EventHandler) {
        self.inner.lock().unwrap().endpoint.register_event_handler(opcode, handler);
    }

    pub fn register_request_handler(&self, opcode: Opcode, handler: RequestHandler) {
        self.inner.lock().unwrap().endpoint.register_request_handler(opcode, handler);
    }

    fn connect_locked(self: &Arc<Self>, inner: &mut StubInner) -> bool {
        if inner.endpoint.is_connected() || inner.dialing {
            return false;
        }
        let weak = Arc::downgrade(self);
        let transport = Arc::clone(inner.endpoint.transport());
        let dialed = transport.connect(Box::new(move |status, peer| {
            let Some(this) = weak.upgrade() else {
                warn!("stub dropped while connecting");
                return;
            };
            this.handle_connect_result(status, peer);
        }));
        inner.dialing = dialed;
        dialed
    }

    fn handle_connect_result(self: &Arc<Self>, status: Status, peer: Option<PeerId>) {
        let mut inner = self.inner.lock().unwrap();
        inner.dialing = false;
        if status == Status::Ok {
            if let Some(peer) = peer {
                self.set_peer_locked(&mut inner, Some(peer));
                self.try_to_attach(&mut inner);
                return;
            }
        }
        if inner.connectable {
            debug!("connect failed ({:?}), retrying", status);
            self.connect_locked(&mut inner);
        } else {
            debug!("connect failed ({:?}), stub stopped", status);
        }
    }

    fn set_peer_locked(self: &Arc<Self>, inner: &mut StubInner, peer: Option<PeerId>) {
        let hook = peer.map(|_| {
            let weak = Arc::downgrade(self);
            Box::new(move || {
                let Some(this) = weak.upgrade() else {
                    warn!("stub dropped before connection-lost hook ran");
                    return;
                };
                this.handle_connection_lost();
            }) as Box<dyn FnOnce() + Send>
        });
        inner.endpoint.set_peer(peer, hook);
    }

    fn try_to_attach(self: &Arc<Self>, inner: &mut StubInner) {
        if let Some(parent) = &self.parent {
            if parent.instance_id() == 0 {
                debug!("attach deferred, parent is not ready");
                return;
            }
        }
        if inner.instance_id > 0 {
            warn!("attach skipped, already attached");
            return;
        }
        let payload = match inner.entity.attach_payload() {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to serialize attach payload: {:?}", err);
                return;
            }
        };
        info!("attaching...");
        let weak = Arc::downgrade(self);
        let sent = inner.endpoint.send_request(
            inner.entity.attach_opcode(),
            &payload,
            Box::new(move |status, payload| {
                let Some(this) = weak.upgrade() else {
                    warn!("stub dropped while attaching");
                    return;
                };
                this.handle_attach_response(status, payload);
            }),
        );
        if !sent {
            info!("attach send failed, reconnecting");
            self.disconnect_then_reconnect(inner);
        }
    }

    fn handle_attach_response(self: &Arc<Self>, status: Status, payload: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        if status == Status::Ok {
            match protocol::decode::<AttachResponse>(payload) {
                Ok(response) if response.instance.id > 0 => {
                    info!("attached, instance id {}", response.instance.id);
                    inner.is_activated = response.is_activated;
                    self.set_instance_id_locked(inner, response.instance.id);
                    return;
                }
                Ok(_) => error!("attach rejected with instance id 0"),
                Err(err) => error!("failed to decode attach response: {:?}", err),
            }
        } else {
            error!("attach failed: {:?}", status);
        }
        self.disconnect_then_reconnect(&mut inner);
    }

    /// Tear the current connection down and dial again once the
    /// disconnect settles. Used when an attach could not be delivered
    /// or was rejected.
    fn disconnect_then_reconnect(self: &Arc<Self>, inner: &mut StubInner) {
        let Some(peer) = inner.endpoint.take_peer() else {
            if inner.connectable {
                self.connect_locked(inner);
            }
            return;
        };
        let weak = Arc::downgrade(self);
        let transport = Arc::clone(inner.endpoint.transport());
        transport.disconnect(
            peer,
            Some(Box::new(move |_status| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                let mut inner = this.inner.lock().unwrap();
                if inner.connectable {
                    this.connect_locked(&mut inner);
                }
            })),
        );
    }

    fn handle_connection_lost(self: &Arc<Self>) {
        info!("stub connection lost");
        let mut inner = self.inner.lock().unwrap();
        self.set_peer_locked(&mut inner, None);
        let had_id = inner.instance_id != 0;
        inner.instance_id = 0;
        drop(inner);
        if had_id {
            // children subscribed to this signal reset their owner ids
            self.on_instance_id_changed.emit(&0);
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.connectable {
            info!("retrying...");
            self.connect_locked(&mut inner);
        } else {
            debug!("stub stopped, no retry");
        }
    }

    fn handle_parent_instance_id_changed(self: &Arc<Self>, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.entity.set_parent_instance_id(id);
        if id > 0 {
            debug!("parent ready");
            self.try_to_attach(&mut inner);
        }
    }

    /// Store the new instance id and fire the change signal with the
    /// lock released, letting child stubs attach from the callback.
    fn set_instance_id_locked(&self, mut inner: MutexGuard<'_, StubInner>, id: u64) {
        if inner.instance_id == id {
            return;
        }
        inner.instance_id = id;
        drop(inner);
        self.on_instance_id_changed.emit(&id);
    }

    /// Entity traffic goes through here: dropped while the parent is
    /// unattached or the stub is deactivated, delegated otherwise.
    pub fn send_event_locked(&self, inner: &StubInner, opcode: Opcode, payload: &[u8]) -> bool {
        if let Some(parent) = &self.parent {
            if parent.instance_id() == 0 {
                return false;
            }
        }
        if !inner.is_activated {
            return false;
        }
        inner.endpoint.send_event(opcode, payload)
    }

    pub fn send_event_with<T>(&self, opcode: Opcode, payload: &T) -> bool
    where
        T: Serialize,
    {
        let bytes = match protocol::encode(payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("failed to serialize {:?} event: {:?}", opcode, err);
                return false;
            }
        };
        let inner = self.inner.lock().unwrap();
        self.send_event_locked(&inner, opcode, &bytes)
    }
}

impl Drop for StubCore {
    fn drop(&mut self) {
        // no other references exist at this point, but the transport
        // still holds per-peer state for us
        if let Ok(inner) = self.inner.get_mut() {
            inner.connectable = false;
            inner.endpoint.shutdown();
        }
    }
}

/// Current-thread facts recorded into entity descriptors.
pub(crate) fn current_thread_info() -> protocol::ThreadInfo {
    let name = std::thread::current().name().map(String::from).unwrap_or_default();
    #[cfg(target_os = "linux")]
    let id = nix::unistd::gettid().as_raw();
    #[cfg(not(target_os = "linux"))]
    let id = std::process::id() as i32;
    protocol::ThreadInfo { id, name }
}

#[cfg(test)]
mod test {
    use std::{
        thread,
        time::{Duration, Instant},
    };

    use blackbox2_protocol::Instance;

    use super::*;
    use crate::{config::Config, host::HostAddr, transport::RequestContext};

    fn test_config(port: u16) -> Config {
        Config {
            enabled: true,
            server: HostAddr { host: String::from("127.0.0.1"), port },
        }
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// A hand-driven server that parks process attach requests until
    /// the test decides to answer, and records channel attaches.
    struct SlowServer {
        transport: Arc<Transport>,
        parked_process: Arc<Mutex<Vec<RequestContext>>>,
        channel_attaches: Arc<Mutex<Vec<protocol::Channel>>>,
    }

    impl SlowServer {
        fn start(port: u16) -> SlowServer {
            let transport = Transport::new(test_config(port));
            let parked_process: Arc<Mutex<Vec<RequestContext>>> =
                Arc::new(Mutex::new(Vec::new()));
            let channel_attaches: Arc<Mutex<Vec<protocol::Channel>>> =
                Arc::new(Mutex::new(Vec::new()));

            let on_connect_transport = Arc::clone(&transport);
            let parked = Arc::clone(&parked_process);
            let attaches = Arc::clone(&channel_attaches);
            transport
                .start_as_server(
                    Arc::new(move |peer| {
                        let parked = Arc::clone(&parked);
                        on_connect_transport.register_request_handler(
                            peer,
                            Opcode::AttachProcess,
                            Some(Arc::new(move |ctx: &mut RequestContext| {
                                parked.lock().unwrap().push(ctx.defer());
                            })),
                        );
                        let attaches = Arc::clone(&attaches);
                        on_connect_transport.register_request_handler(
                            peer,
                            Opcode::AttachChannel,
                            Some(Arc::new(move |ctx: &mut RequestContext| {
                                let desc: protocol::Channel =
                                    protocol::decode(ctx.payload()).unwrap();
                                attaches.lock().unwrap().push(desc);
                                ctx.set_response_with(
                                    Status::Ok,
                                    &AttachResponse {
                                        is_activated: true,
                                        instance: Instance { id: ctx.peer().0 },
                                    },
                                );
                            })),
                        );
                    }),
                    None,
                )
                .unwrap();

            SlowServer { transport, parked_process, channel_attaches }
        }

        fn answer_process_attach(&self, id: u64) {
            let mut parked = self.parked_process.lock().unwrap();
            let mut ctx = parked.pop().expect("a parked process attach");
            ctx.set_response_with(
                Status::Ok,
                &AttachResponse { is_activated: true, instance: Instance { id } },
            );
            // dropping the context flushes the response
        }
    }

    #[test]
    #[ntest::timeout(30000)]
    fn child_attach_waits_for_parent_instance_id() {
        let server = SlowServer::start(63101);

        let client_transport = Transport::new(test_config(63101));
        client_transport.start_as_client().unwrap();

        let process = StubCore::new(
            Arc::clone(&client_transport),
            StubEntity::Process(protocol::Process::default()),
            None,
        );
        assert!(process.start());

        let channel = StubCore::new(
            Arc::clone(&client_transport),
            StubEntity::Channel {
                desc: protocol::Channel::default(),
                lane: MessageLane::new(None),
            },
            Some(Arc::clone(&process)),
        );
        assert!(channel.start());

        // the process attach arrives and parks; the channel must hold
        // its own attach back while the parent has no instance id
        wait_until("parked process attach", || {
            !server.parked_process.lock().unwrap().is_empty()
        });
        thread::sleep(Duration::from_millis(100));
        assert!(server.channel_attaches.lock().unwrap().is_empty());
        assert_eq!(process.instance_id(), 0);
        assert_eq!(channel.instance_id(), 0);

        // releasing the parent unblocks the child, and the child's
        // descriptor carries the parent's fresh id
        server.answer_process_attach(0xABCD);
        wait_until("process instance id", || process.instance_id() == 0xABCD);
        wait_until("channel attach", || {
            !server.channel_attaches.lock().unwrap().is_empty()
        });
        let desc = server.channel_attaches.lock().unwrap().remove(0);
        assert_eq!(desc.owner_process.id, 0xABCD);
        wait_until("channel instance id", || channel.instance_id() > 0);

        drop(channel);
        drop(process);
        client_transport.stop();
        server.transport.stop();
    }

    #[test]
    #[ntest::timeout(30000)]
    fn attach_rejection_triggers_reconnect_and_retry() {
        let server = SlowServer::start(63102);

        let client_transport = Transport::new(test_config(63102));
        client_transport.start_as_client().unwrap();

        let process = StubCore::new(
            Arc::clone(&client_transport),
            StubEntity::Process(protocol::Process::default()),
            None,
        );
        assert!(process.start());

        // reject the first attach with id 0: the stub must disconnect
        // and come back with a second attach attempt
        wait_until("first process attach", || {
            !server.parked_process.lock().unwrap().is_empty()
        });
        server.answer_process_attach(0);

        wait_until("second process attach", || {
            !server.parked_process.lock().unwrap().is_empty()
        });
        server.answer_process_attach(7);
        wait_until("process attached on retry", || process.instance_id() == 7);

        drop(process);
        client_transport.stop();
        server.transport.stop();
    }

    #[test]
    fn stopped_stub_does_not_start() {
        let transport = Transport::new(test_config(63103));
        // not started: connects will fail, but start() itself is governed
        // by the connectable flag
        let stub = StubCore::new(
            transport,
            StubEntity::Process(protocol::Process::default()),
            None,
        );
        stub.stop();
        assert!(!stub.start());
    }

    #[test]
    fn send_gating_checks_parent_and_activation() {
        let transport = Transport::new(test_config(63104));
        let parent = StubCore::new(
            Arc::clone(&transport),
            StubEntity::Process(protocol::Process::default()),
            None,
        );
        let child = StubCore::new(
            Arc::clone(&transport),
            StubEntity::Node(protocol::Node::default()),
            Some(Arc::clone(&parent)),
        );
        let send = |stub: &StubCore| {
            let inner = stub.inner.lock().unwrap();
            stub.send_event_locked(&inner, Opcode::NodeAttach, &[])
        };

        // parent unattached: dropped before even reaching the endpoint
        assert!(!send(&child));

        // parent attached but child deactivated: still dropped
        parent.inner.lock().unwrap().instance_id = 1;
        child.inner.lock().unwrap().is_activated = false;
        assert!(!send(&child));

        // activated with a ready parent: only the missing peer stops it
        child.inner.lock().unwrap().is_activated = true;
        assert!(!send(&child));
    }
}

