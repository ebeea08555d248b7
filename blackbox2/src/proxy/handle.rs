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

use std::{collections::BTreeMap, sync::Arc, time::SystemTime};

use blackbox2_protocol as protocol;
use protocol::{HandleKind, Opcode, Status, ThreadInfo};

use crate::{
    host::PeerId,
    message::ProxyLane,
    proxy::{register_proxy_message_handler, ProxyCore, ProxyEntity},
    signal::Signal,
    transport::Transport,
};

/// Server-side mirror of one I/O handle.
#[derive(Clone)]
pub struct HandleProxy {
    pub(crate) core: Arc<ProxyCore>,
}

impl HandleProxy {
    pub(crate) fn new(
        transport: &Arc<Transport>,
        peer: PeerId,
        desc: protocol::Handle,
    ) -> HandleProxy {
        let is_enabled = desc.is_enabled;
        let entity = ProxyEntity::Handle {
            desc,
            lane: ProxyLane::new(),
            is_enabled,
            on_enabled: Signal::new(),
            on_disabled: Signal::new(),
        };
        let core = ProxyCore::new(transport, peer, entity);
        register_proxy_message_handler(&core);
        let proxy = HandleProxy { core };
        proxy.register_handlers();
        proxy
    }

    fn register_handlers(&self) {
        let weak = Arc::downgrade(&self.core);
        self.core.register_event_handler(
            Opcode::HandleEnable,
            Arc::new(move |_payload: &[u8]| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let signal = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Handle { is_enabled, on_enabled, .. } => {
                            *is_enabled = true;
                            Some(on_enabled.clone())
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
            Opcode::HandleDisable,
            Arc::new(move |_payload: &[u8]| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let signal = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Handle { is_enabled, on_disabled, .. } => {
                            *is_enabled = false;
                            Some(on_disabled.clone())
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

    pub fn kind(&self) -> HandleKind {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Handle { desc, .. } => desc.kind,
            _ => HandleKind::Unknown,
        }
    }

    pub fn key(&self) -> String {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Handle { desc, .. } => desc.key.clone(),
            _ => String::new(),
        }
    }

    pub fn owner_thread(&self) -> ThreadInfo {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Handle { desc, .. } => desc.owner_thread.clone(),
            _ => ThreadInfo::default(),
        }
    }

    pub fn mapping_channels(&self) -> BTreeMap<String, String> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Handle { desc, .. } => desc.mapping_channels.clone(),
            _ => BTreeMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Handle { is_enabled, .. } => *is_enabled,
            _ => false,
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

    pub fn on_enabled(&self) -> Signal<()> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Handle { on_enabled, .. } => on_enabled.clone(),
            _ => Signal::new(),
        }
    }

    pub fn on_disabled(&self) -> Signal<()> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Handle { on_disabled, .. } => on_disabled.clone(),
            _ => Signal::new(),
        }
    }

    pub fn inject_message(&self, message: protocol::Message) -> Status {
        self.core.inject_message(message)
    }

    pub fn message_fields(&self) -> u32 {
        self.core.message_fields()
    }

    pub fn set_message_fields(&self, fields: u32) {
        self.core.set_message_fields(fields);
    }

    pub fn on_message(&self) -> Signal<protocol::Message> {
        self.core.on_message().unwrap_or_default()
    }
}
