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

use blackbox2_protocol as protocol;
use protocol::Direction;

use crate::{
    message::{self, MessageHandler, MessageInfo, MessageLane},
    recorder::MessageSink,
    stub::{current_thread_info, StubCore, StubEntity},
    transport::Transport,
};

/// Properties of a channel being announced, as key/value pairs. The
/// well-known keys `id`, `type` and `dir` (with values `in`/`out`)
/// populate the typed descriptor fields; the whole map rides along
/// verbatim.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub properties: BTreeMap<String, String>,
}

/// Client-side mirror of one channel. Mirrors observed messages to the
/// server, subject to activation and the server's field mask, and
/// accepts injected messages back.
#[derive(Clone)]
pub struct ChannelStub {
    pub(crate) core: Arc<StubCore>,
}

impl ChannelStub {
    pub(crate) fn new(
        transport: Arc<Transport>,
        config: &ChannelConfig,
        inject_message_handler: Option<MessageHandler>,
        parent: &Arc<StubCore>,
    ) -> ChannelStub {
        let mut desc = protocol::Channel {
            id: config.properties.get("id").cloned().unwrap_or_default(),
            kind: config.properties.get("type").cloned().unwrap_or_default(),
            dir: match config.properties.get("dir").map(String::as_str) {
                Some("in") => Direction::In,
                _ => Direction::Out,
            },
            config: config.properties.clone(),
            owner_thread: current_thread_info(),
            ..Default::default()
        };
        desc.owner_process.id = parent.instance_id();

        let entity = StubEntity::Channel {
            desc,
            lane: MessageLane::new(inject_message_handler),
        };
        let core = StubCore::new(transport, entity, Some(Arc::clone(parent)));
        message::register_stub_message_handlers(&core);
        ChannelStub { core }
    }

    pub fn instance_id(&self) -> u64 {
        self.core.instance_id()
    }

    /// Mirror one message this channel transmitted.
    pub fn send_message(&self, payload: &[u8], serialize_type: &str, info: &MessageInfo) -> bool {
        message::stub_send_message(&self.core, Direction::Out, payload, serialize_type, info)
    }

    /// Mirror one message this channel received.
    pub fn receive_message(
        &self,
        payload: &[u8],
        serialize_type: &str,
        info: &MessageInfo,
    ) -> bool {
        message::stub_send_message(&self.core, Direction::In, payload, serialize_type, info)
    }

    pub fn set_local_recorder(&self, recorder: Option<Arc<dyn MessageSink>>) {
        let mut inner = self.core.inner.lock().unwrap();
        if let Some(lane) = inner.entity.lane_mut() {
            lane.recorder = recorder;
        }
    }

    pub fn set_local_player(&self, player: Option<Arc<dyn MessageSink>>) {
        let mut inner = self.core.inner.lock().unwrap();
        if let Some(lane) = inner.entity.lane_mut() {
            lane.player = player;
        }
    }
}
