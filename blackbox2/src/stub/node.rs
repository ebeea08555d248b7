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

use tracing::info;

use blackbox2_protocol as protocol;
use protocol::{HandleKind, Opcode};

use crate::{
    message::MessageHandler,
    stub::{current_thread_info, handle::HandleStub, StubCore, StubEntity},
    transport::Transport,
};

/// Client-side mirror of one node: announces executor attachment and
/// fathers the I/O handle stubs created under it.
#[derive(Clone)]
pub struct NodeStub {
    pub(crate) core: Arc<StubCore>,
}

impl NodeStub {
    pub(crate) fn new(
        transport: Arc<Transport>,
        name: &str,
        parent: &Arc<StubCore>,
    ) -> NodeStub {
        let mut desc = protocol::Node {
            name: String::from(name),
            is_attached: false,
            owner_thread: current_thread_info(),
            ..Default::default()
        };
        desc.owner_process.id = parent.instance_id();

        let core = StubCore::new(transport, StubEntity::Node(desc), Some(Arc::clone(parent)));
        NodeStub { core }
    }

    pub fn name(&self) -> String {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            StubEntity::Node(desc) => desc.name.clone(),
            _ => String::new(),
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.core.instance_id()
    }

    /// Announce that an executor picked this node up.
    pub fn attach(&self) {
        let mut inner = self.core.inner.lock().unwrap();
        if let StubEntity::Node(desc) = &mut inner.entity {
            desc.is_attached = true;
        }
        self.core.send_event_locked(&inner, Opcode::NodeAttach, &[]);
    }

    /// Announce that this node was dropped by its executor.
    pub fn detach(&self) {
        let mut inner = self.core.inner.lock().unwrap();
        if let StubEntity::Node(desc) = &mut inner.entity {
            desc.is_attached = false;
        }
        self.core.send_event_locked(&inner, Opcode::NodeDetach, &[]);
    }

    /// Announce an I/O handle living under this node. Returns None when
    /// blackbox2 is disabled.
    pub fn create_handle_stub(
        &self,
        kind: HandleKind,
        key: &str,
        mapping_channels: &BTreeMap<String, String>,
        inject_message_handler: Option<MessageHandler>,
    ) -> Option<HandleStub> {
        let transport = self.core.transport();
        if !transport.is_enabled() {
            return None;
        }
        let stub =
            HandleStub::new(transport, kind, key, mapping_channels, inject_message_handler, &self.core);
        if !stub.core.start() {
            return None;
        }
        info!("handle stub created for key '{}'", key);
        Some(stub)
    }
}
