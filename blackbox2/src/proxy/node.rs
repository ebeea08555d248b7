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

use std::{sync::Arc, time::SystemTime};

use tracing::{error, warn};

use blackbox2_protocol as protocol;
use protocol::{Opcode, ThreadInfo};

use crate::{
    host::PeerId,
    proxy::{ChildSlot, HandleProxy, ProxyCore, ProxyEntity},
    signal::Signal,
    transport::Transport,
};

/// Server-side mirror of one node: tracks executor attachment and owns
/// the handle proxies living under it.
#[derive(Clone)]
pub struct NodeProxy {
    pub(crate) core: Arc<ProxyCore>,
}

impl NodeProxy {
    pub(crate) fn new(
        transport: &Arc<Transport>,
        peer: PeerId,
        desc: protocol::Node,
    ) -> NodeProxy {
        let is_attached = desc.is_attached;
        let entity = ProxyEntity::Node {
            desc,
            is_attached,
            handles: Vec::new(),
            on_handle_added: Signal::new(),
            on_handle_removed: Signal::new(),
            on_executor_attached: Signal::new(),
            on_executor_detached: Signal::new(),
        };
        let core = ProxyCore::new(transport, peer, entity);
        let proxy = NodeProxy { core };
        proxy.register_handlers();
        proxy
    }

    fn register_handlers(&self) {
        let weak = Arc::downgrade(&self.core);
        self.core.register_event_handler(
            Opcode::NodeAttach,
            Arc::new(move |_payload: &[u8]| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let signal = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Node { is_attached, on_executor_attached, .. } => {
                            *is_attached = true;
                            Some(on_executor_attached.clone())
                        }
                        _ => None,
                    }
                };
                if let Some(signal) = signal {
                    signal.emit(&());
                }
            }),
        );

        let weak = Arc::downgrade(&self.core);
        self.core.register_event_handler(
            Opcode::NodeDetach,
            Arc::new(move |_payload: &[u8]| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let signal = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Node { is_attached, on_executor_detached, .. } => {
                            *is_attached = false;
                            Some(on_executor_detached.clone())
                        }
                        _ => None,
                    }
                };
                if let Some(signal) = signal {
                    signal.emit(&());
                }
            }),
        );
    }

    pub fn name(&self) -> String {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Node { desc, .. } => desc.name.clone(),
            _ => String::new(),
        }
    }

    pub fn owner_thread(&self) -> ThreadInfo {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Node { desc, .. } => desc.owner_thread.clone(),
            _ => ThreadInfo::default(),
        }
    }

    pub fn is_executor_attached(&self) -> bool {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Node { is_attached, .. } => *is_attached,
            _ => false,
        }
    }

    pub fn handles(&self) -> Vec<HandleProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Node { handles, .. } => {
                handles.iter().map(|slot| slot.proxy.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn is_activated(&self) -> bool {
        self.core.is_activated()
    }

    pub fn host(&self) -> String {
        self.core.host()
    }

    pub fn port(&self) -> u16 {
        self.core.port()
    }

    pub fn timestamp(&self) -> SystemTime {
        self.core.timestamp()
    }

    pub fn set_activation(&self, value: bool) {
        self.core.set_activation(value);
    }

    pub fn disconnect(&self) -> bool {
        self.core.disconnect()
    }

    pub fn on_disconnected(&self) -> Signal<()> {
        self.core.on_disconnected.clone()
    }

    pub fn on_executor_attached(&self) -> Signal<()> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Node { on_executor_attached, .. } => on_executor_attached.clone(),
            _ => Signal::new(),
        }
    }

    pub fn on_executor_detached(&self) -> Signal<()> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Node { on_executor_detached, .. } => on_executor_detached.clone(),
            _ => Signal::new(),
        }
    }

    pub fn on_handle_added(&self) -> Signal<HandleProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Node { on_handle_added, .. } => on_handle_added.clone(),
            _ => Signal::new(),
        }
    }

    pub fn on_handle_removed(&self) -> Signal<HandleProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Node { on_handle_removed, .. } => on_handle_removed.clone(),
            _ => Signal::new(),
        }
    }

    pub(crate) fn add_handle(&self, child: HandleProxy) {
        let Some(child_peer) = child.core.peer() else {
            warn!("handle proxy lost its peer before linking");
            return;
        };
        let (added, emit) = {
            let mut inner = self.core.inner.lock().unwrap();
            let ProxyEntity::Node { handles, on_handle_added, on_handle_removed, .. } =
                &mut inner.entity
            else {
                return;
            };
            if handles.iter().any(|slot| slot.peer == child_peer) {
                error!("duplicated handle under node");
                return;
            }
            let weak = Arc::downgrade(&self.core);
            let removed_signal = on_handle_removed.clone();
            let sub = child.on_disconnected().subscribe(move |_| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let removed = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Node { handles, .. } => {
                            let at = handles.iter().position(|slot| slot.peer == child_peer);
                            at.map(|at| handles.remove(at).proxy)
                        }
                        _ => None,
                    }
                };
                if let Some(proxy) = removed {
                    removed_signal.emit(&proxy);
                }
            });
            handles.push(ChildSlot::new(child_peer, child.clone(), sub));
            (on_handle_added.clone(), child)
        };
        added.emit(&emit);
    }
}
