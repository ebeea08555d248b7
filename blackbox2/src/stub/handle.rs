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
use protocol::{Direction, HandleKind, Opcode};

use crate::{
    message::{self, MessageHandler, MessageInfo, MessageLane},
    stub::{current_thread_info, StubCore, StubEntity},
    transport::Transport,
};

/// Client-side mirror of one I/O handle, parented to a node.
#[derive(Clone)]
pub struct HandleStub {
    pub(crate) core: Arc<StubCore>,
}

impl HandleStub {
    pub(crate) fn new(
        transport: Arc<Transport>,
        kind: HandleKind,
        key: &str,
        mapping_channels: &BTreeMap<String, String>,
        inject_message_handler: Option<MessageHandler>,
        parent: &Arc<StubCore>,
    ) -> HandleStub {
        let mut desc = protocol::Handle {
            key: String::from(key),
            kind,
            is_enabled: true,
            mapping_channels: mapping_channels.clone(),
            owner_thread: current_thread_info(),
            ..Default::default()
        };
        desc.owner_node.id = parent.instance_id();

        let entity = StubEntity::Handle {
            desc,
            lane: MessageLane::new(inject_message_handler),
        };
        let core = StubCore::new(transport, entity, Some(Arc::clone(parent)));
        message::register_stub_message_handlers(&core);
        HandleStub { core }
    }

    pub fn instance_id(&self) -> u64 {
        self.core.instance_id()
    }

    pub fn enable(&self) {
        self.core.send_event_with(Opcode::HandleEnable, &true);
    }

    pub fn disable(&self) {
        self.core.send_event_with(Opcode::HandleDisable, &false);
    }

    /// Mirror one message this handle transmitted.
    pub fn send_message(&self, payload: &[u8], serialize_type: &str, info: &MessageInfo) -> bool {
        message::stub_send_message(&self.core, Direction::Out, payload, serialize_type, info)
    }

    /// Mirror one message this handle received.
    pub fn receive_message(
        &self,
        payload: &[u8],
        serialize_type: &str,
        info: &MessageInfo,
    ) -> bool {
        message::stub_send_message(&self.core, Direction::In, payload, serialize_type, info)
    }
}
