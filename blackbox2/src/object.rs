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

use std::{collections::BTreeMap, sync::Arc};

use tracing::error;

use blackbox2_protocol::Opcode;

use crate::{
    host::PeerId,
    transport::{
        DisconnectHandler, EventHandler, RequestHandler, ResponseCallback, Transport,
    },
};

/// The peer-bound half of every replicated entity: the current peer slot
/// plus the entity's own copy of its handler maps.
///
/// The transport's per-peer tables die with the peer; the entity's maps
/// here survive, and `set_peer` re-registers every stored handler on the
/// new peer. That is what makes handlers persist across reconnects.
///
/// An Endpoint always lives inside its owner's mutex, so none of these
/// methods lock anything of their own. Transport calls made from here
/// nest the transport mutex inside the owner's mutex, which is the one
/// sanctioned order.
pub(crate) struct Endpoint {
    transport: Arc<Transport>,
    peer: Option<PeerId>,
    event_handlers: BTreeMap<Opcode, EventHandler>,
    request_handlers: BTreeMap<Opcode, RequestHandler>,
}

impl Endpoint {
    pub fn new(transport: Arc<Transport>) -> Endpoint {
        Endpoint {
            transport,
            peer: None,
            event_handlers: BTreeMap::new(),
            request_handlers: BTreeMap::new(),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    /// Re-point this entity at a new peer (or at nothing). The old
    /// peer's transport-side state is dropped wholesale; every handler
    /// stored here is re-registered on the new peer, along with the
    /// given connection-lost hook.
    pub fn set_peer(&mut self, peer: Option<PeerId>, on_disconnect: Option<DisconnectHandler>) {
        if self.peer == peer {
            return;
        }
        if let Some(old) = self.peer {
            self.transport.unregister_all(old);
        }
        self.peer = peer;
        if let Some(peer) = self.peer {
            if let Some(hook) = on_disconnect {
                self.transport.register_disconnect_handler(peer, hook);
            }
            for (opcode, handler) in &self.event_handlers {
                self.transport.register_event_handler(peer, *opcode, Some(Arc::clone(handler)));
            }
            for (opcode, handler) in &self.request_handlers {
                self.transport.register_request_handler(peer, *opcode, Some(Arc::clone(handler)));
            }
        }
    }

    /// Forget the peer without touching its transport-side state. Used
    /// when a disconnect is in flight: the disconnect event itself
    /// sweeps the peer's tables.
    pub fn take_peer(&mut self) -> Option<PeerId> {
        self.peer.take()
    }

    pub fn register_event_handler(&mut self, opcode: Opcode, handler: EventHandler) {
        if let Some(peer) = self.peer {
            self.transport.register_event_handler(peer, opcode, Some(Arc::clone(&handler)));
        }
        self.event_handlers.insert(opcode, handler);
    }

    pub fn register_request_handler(&mut self, opcode: Opcode, handler: RequestHandler) {
        if let Some(peer) = self.peer {
            self.transport.register_request_handler(peer, opcode, Some(Arc::clone(&handler)));
        }
        self.request_handlers.insert(opcode, handler);
    }

    pub fn send_event(&self, opcode: Opcode, payload: &[u8]) -> bool {
        let Some(peer) = self.peer else {
            return false;
        };
        self.transport.send_event(peer, opcode, payload)
    }

    pub fn send_request(&self, opcode: Opcode, payload: &[u8], cb: ResponseCallback) -> bool {
        let Some(peer) = self.peer else {
            return false;
        };
        self.transport.send_request(peer, opcode, payload, cb)
    }

    /// Final teardown: drop the peer's transport-side state and ask for
    /// a graceful disconnect. Called from owners' Drop impls.
    pub fn shutdown(&mut self) {
        if let Some(peer) = self.peer.take() {
            self.transport.unregister_all(peer);
            if !self.transport.disconnect(peer, None) {
                error!("{}: disconnect on teardown failed", peer);
            }
        }
    }
}
