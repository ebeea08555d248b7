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
use protocol::{Direction, Status, ThreadInfo};

use crate::{
    host::PeerId,
    message::ProxyLane,
    proxy::{register_proxy_message_handler, ProxyCore, ProxyEntity},
    signal::Signal,
    transport::Transport,
};

/// Server-side mirror of one channel.
#[derive(Clone)]
pub struct ChannelProxy {
    pub(crate) core: Arc<ProxyCore>,
}

macro_rules! channel_entity {
    ($inner:expr) => {
        match &$inner.entity {
            ProxyEntity::Channel { desc, .. } => desc,
            _ => unreachable!("channel proxy holds a channel entity"),
        }
    };
}

impl ChannelProxy {
    pub(crate) fn new(
        transport: &Arc<Transport>,
        peer: PeerId,
        desc: protocol::Channel,
    ) -> ChannelProxy {
        let entity = ProxyEntity::Channel { desc, lane: ProxyLane::new() };
        let core = ProxyCore::new(transport, peer, entity);
        register_proxy_message_handler(&core);
        ChannelProxy { core }
    }

    pub fn id(&self) -> String {
        channel_entity!(self.core.inner.lock().unwrap()).id.clone()
    }

    pub fn kind(&self) -> String {
        channel_entity!(self.core.inner.lock().unwrap()).kind.clone()
    }

    pub fn dir(&self) -> Direction {
        channel_entity!(self.core.inner.lock().unwrap()).dir
    }

    pub fn config(&self) -> BTreeMap<String, String> {
        channel_entity!(self.core.inner.lock().unwrap()).config.clone()
    }

    pub fn owner_thread(&self) -> ThreadInfo {
        channel_entity!(self.core.inner.lock().unwrap()).owner_thread.clone()
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

    /// Push one message into the live channel on the client side. The
    /// message must carry a payload and serialize type.
    pub fn inject_message(&self, message: protocol::Message) -> Status {
        self.core.inject_message(message)
    }

    pub fn message_fields(&self) -> u32 {
        self.core.message_fields()
    }

    pub fn set_message_fields(&self, fields: u32) {
        self.core.set_message_fields(fields);
    }

    /// Messages the live channel mirrors up to the server.
    pub fn on_message(&self) -> Signal<protocol::Message> {
        self.core.on_message().unwrap_or_default()
    }
}
