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

//! Server-side mirrors of attached entities.
//!
//! A proxy is constructed from the descriptor carried by an attach
//! request and stays bound to that one peer for its whole life: proxies
//! never reconnect, the client side builds a fresh stub/proxy pair
//! instead. Losing the connection emits `on_disconnected`, which is how
//! the registry entry and any parent's child slot get cleaned up.

use std::{
    sync::{Arc, Mutex, Weak},
    time::SystemTime,
};

use tracing::{debug, error, warn};

use blackbox2_protocol as protocol;
use protocol::{Opcode, Status};

use crate::{
    host::PeerId,
    message::ProxyLane,
    object::Endpoint,
    signal::{Signal, Subscription},
    transport::{EventHandler, Transport},
};

pub mod channel;
pub mod executor;
pub mod handle;
pub mod node;
pub mod process;

pub use channel::ChannelProxy;
pub use executor::ExecutorProxy;
pub use handle::HandleProxy;
pub use node::NodeProxy;
pub use process::ProcessProxy;

/// One child proxy held by its parent, with the subscription that
/// removes the slot when the child's peer drops.
pub(crate) struct ChildSlot<T> {
    pub peer: PeerId,
    pub proxy: T,
    _sub: Subscription,
}

impl<T> ChildSlot<T> {
    pub fn new(peer: PeerId, proxy: T, sub: Subscription) -> ChildSlot<T> {
        ChildSlot { peer, proxy, _sub: sub }
    }
}

/// Per-kind mirror state, updated from entity events.
pub(crate) enum ProxyEntity {
    Process {
        desc: protocol::Process,
        channels: Vec<ChildSlot<ChannelProxy>>,
        executors: Vec<ChildSlot<ExecutorProxy>>,
        nodes: Vec<ChildSlot<NodeProxy>>,
        on_channel_added: Signal<ChannelProxy>,
        on_channel_removed: Signal<ChannelProxy>,
        on_executor_added: Signal<ExecutorProxy>,
        on_executor_removed: Signal<ExecutorProxy>,
        on_node_added: Signal<NodeProxy>,
        on_node_removed: Signal<NodeProxy>,
    },
    Channel {
        desc: protocol::Channel,
        lane: ProxyLane,
    },
    Executor {
        desc: protocol::Executor,
        is_running: bool,
        attached_nodes: Vec<String>,
        on_node_attached: Signal<String>,
        on_node_detached: Signal<String>,
        on_run_begin: Signal<protocol::ThreadInfo>,
        on_run_end: Signal<()>,
        on_task_begin: Signal<protocol::ExecutorTask>,
        on_task_end: Signal<i32>,
    },
    Node {
        desc: protocol::Node,
        is_attached: bool,
        handles: Vec<ChildSlot<HandleProxy>>,
        on_handle_added: Signal<HandleProxy>,
        on_handle_removed: Signal<HandleProxy>,
        on_executor_attached: Signal<()>,
        on_executor_detached: Signal<()>,
    },
    Handle {
        desc: protocol::Handle,
        lane: ProxyLane,
        is_enabled: bool,
        on_enabled: Signal<()>,
        on_disabled: Signal<()>,
    },
}

impl ProxyEntity {
    /// Activation cascades one level down the hierarchy: a process
    /// carries its channels, executors and nodes along, a node carries
    /// its handles.
    fn cascade_targets(&self) -> Vec<Arc<ProxyCore>> {
        match self {
            ProxyEntity::Process { channels, executors, nodes, .. } => channels
                .iter()
                .map(|slot| Arc::clone(&slot.proxy.core))
                .chain(executors.iter().map(|slot| Arc::clone(&slot.proxy.core)))
                .chain(nodes.iter().map(|slot| Arc::clone(&slot.proxy.core)))
                .collect(),
            ProxyEntity::Node { handles, .. } => {
                handles.iter().map(|slot| Arc::clone(&slot.proxy.core)).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn lane(&self) -> Option<&ProxyLane> {
        match self {
            ProxyEntity::Channel { lane, .. } | ProxyEntity::Handle { lane, .. } => Some(lane),
            _ => None,
        }
    }

    pub fn lane_mut(&mut self) -> Option<&mut ProxyLane> {
        match self {
            ProxyEntity::Channel { lane, .. } | ProxyEntity::Handle { lane, .. } => Some(lane),
            _ => None,
        }
    }
}

pub(crate) struct ProxyInner {
    pub endpoint: Endpoint,
    pub is_activated: bool,
    pub entity: ProxyEntity,
}

/// Shared mirror state: connection bookkeeping, activation, and the
/// lifecycle signals every proxy kind carries.
pub(crate) struct ProxyCore {
    host: String,
    port: u16,
    timestamp: SystemTime,
    pub on_disconnected: Signal<()>,
    pub on_activated: Signal<()>,
    pub on_deactivated: Signal<()>,
    pub inner: Mutex<ProxyInner>,
}

impl ProxyCore {
    pub fn new(transport: &Arc<Transport>, peer: PeerId, entity: ProxyEntity) -> Arc<ProxyCore> {
        let (host, port) = match transport.peer_addr(peer) {
            Some(addr) => (addr.host, addr.port),
            None => (String::new(), 0),
        };
        let core = Arc::new(ProxyCore {
            host,
            port,
            timestamp: SystemTime::now(),
            on_disconnected: Signal::new(),
            on_activated: Signal::new(),
            on_deactivated: Signal::new(),
            inner: Mutex::new(ProxyInner {
                endpoint: Endpoint::new(Arc::clone(transport)),
                is_activated: true,
                entity,
            }),
        });

        let weak = Arc::downgrade(&core);
        let hook = Box::new(move || {
            let Some(this) = weak.upgrade() else {
                warn!("proxy dropped before connection-lost hook ran");
                return;
            };
            this.handle_connection_lost();
        });
        core.inner.lock().unwrap().endpoint.set_peer(Some(peer), Some(hook));

        core
    }

    pub fn peer(&self) -> Option<PeerId> {
        self.inner.lock().unwrap().endpoint.peer()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().endpoint.is_connected()
    }

    pub fn host(&self) -> String {
        self.host.clone()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// When the entity attached.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn is_activated(&self) -> bool {
        self.inner.lock().unwrap().is_activated
    }

    /// Flip the activation gate on the remote stub. Emits the matching
    /// signal with the lock released, then carries children along.
    pub fn set_activation(self: &Arc<Self>, value: bool) {
        let cascade = {
            let mut inner = self.inner.lock().unwrap();
            if inner.is_activated == value {
                return;
            }
            inner.is_activated = value;
            match protocol::encode(&value) {
                Ok(bytes) => {
                    inner.endpoint.send_event(Opcode::Activate, &bytes);
                }
                Err(err) => error!("failed to serialize activation event: {:?}", err),
            }
            inner.entity.cascade_targets()
        };

        if value {
            self.on_activated.emit(&());
        } else {
            self.on_deactivated.emit(&());
        }
        for child in cascade {
            child.set_activation(value);
        }
    }

    /// Kick the remote stub off. Its disconnect settles asynchronously;
    /// `on_disconnected` fires once it does, so registry and parent
    /// cleanup happen exactly as they would for a remote drop.
    pub fn disconnect(self: &Arc<Self>) -> bool {
        let (peer, transport) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(peer) = inner.endpoint.take_peer() else {
                return false;
            };
            (peer, Arc::clone(inner.endpoint.transport()))
        };
        let weak = Arc::downgrade(self);
        transport.disconnect(
            peer,
            Some(Box::new(move |_status| {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                debug!("proxy disconnect settled");
                this.on_disconnected.emit(&());
            })),
        )
    }

    fn handle_connection_lost(self: &Arc<Self>) {
        debug!("proxy connection lost");
        {
            let mut inner = self.inner.lock().unwrap();
            inner.endpoint.take_peer();
        }
        self.on_disconnected.emit(&());
    }

    pub fn register_event_handler(&self, opcode: Opcode, handler: EventHandler) {
        self.inner.lock().unwrap().endpoint.register_event_handler(opcode, handler);
    }

    /// Inject one message toward the live entity on the client side.
    pub fn inject_message(&self, message: protocol::Message) -> Status {
        if message.payload.is_none() || message.serialize_type.is_none() {
            return Status::InvalidParameter;
        }
        let inner = self.inner.lock().unwrap();
        match inner.entity.lane() {
            Some(lane) if lane.fields == 0 => return Status::InvalidState,
            Some(_) => {}
            None => return Status::InvalidState,
        }
        let bytes = match protocol::encode(&message) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("failed to serialize injected message: {:?}", err);
                return Status::Unknown;
            }
        };
        if inner.endpoint.send_event(Opcode::Message, &bytes) {
            Status::Ok
        } else {
            Status::Unknown
        }
    }

    pub fn message_fields(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.entity.lane().map(|lane| lane.fields).unwrap_or(0)
    }

    /// Tell the remote stub which message fields to mirror. Only sends
    /// when the mask actually changes.
    pub fn set_message_fields(&self, fields: u32) {
        let mut inner = self.inner.lock().unwrap();
        let Some(lane) = inner.entity.lane_mut() else {
            return;
        };
        if lane.fields == fields {
            return;
        }
        lane.fields = fields;
        let wire = protocol::MessageFields { has_flags: fields };
        match protocol::encode(&wire) {
            Ok(bytes) => {
                inner.endpoint.send_event(Opcode::MessageFields, &bytes);
            }
            Err(err) => error!("failed to serialize message fields event: {:?}", err),
        }
    }

    pub fn on_message(&self) -> Option<Signal<protocol::Message>> {
        let inner = self.inner.lock().unwrap();
        inner.entity.lane().map(|lane| lane.on_message.clone())
    }
}

impl Drop for ProxyCore {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            inner.endpoint.shutdown();
        }
    }
}

/// Install the inbound Message handler on a channel or handle proxy.
pub(crate) fn register_proxy_message_handler(core: &Arc<ProxyCore>) {
    let weak: Weak<ProxyCore> = Arc::downgrade(core);
    core.register_event_handler(
        Opcode::Message,
        Arc::new(move |payload: &[u8]| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            let message: protocol::Message = match protocol::decode(payload) {
                Ok(message) => message,
                Err(err) => {
                    error!("failed to decode message event: {:?}", err);
                    return;
                }
            };
            let signal = {
                let inner = core.inner.lock().unwrap();
                inner.entity.lane().map(|lane| lane.on_message.clone())
            };
            if let Some(signal) = signal {
                signal.emit(&message);
            }
        }),
    );
}
