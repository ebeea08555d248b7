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

use std::sync::Arc;

use blackbox2_protocol as protocol;
use protocol::Opcode;

use crate::{
    stub::{current_thread_info, node::NodeStub, StubCore, StubEntity},
    transport::Transport,
};

/// Client-side mirror of one executor: announces node attachment and
/// run/task spans to the server.
#[derive(Clone)]
pub struct ExecutorStub {
    pub(crate) core: Arc<StubCore>,
}

impl ExecutorStub {
    pub(crate) fn new(
        transport: Arc<Transport>,
        thread_pool_size: usize,
        parent: &Arc<StubCore>,
    ) -> ExecutorStub {
        let mut desc = protocol::Executor {
            thread_pool_size: thread_pool_size as u64,
            is_running: false,
            owner_thread: current_thread_info(),
            ..Default::default()
        };
        desc.owner_process.id = parent.instance_id();

        let core =
            StubCore::new(transport, StubEntity::Executor(desc), Some(Arc::clone(parent)));
        ExecutorStub { core }
    }

    pub fn instance_id(&self) -> u64 {
        self.core.instance_id()
    }

    pub fn attach_node(&self, node: &NodeStub) {
        let name = node.name();
        let mut inner = self.core.inner.lock().unwrap();
        let bytes = match protocol::encode(&name) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        self.core.send_event_locked(&inner, Opcode::ExecutorAttachNode, &bytes);
        if let StubEntity::Executor(desc) = &mut inner.entity {
            desc.attached_nodes.push(name);
        }
    }

    pub fn detach_node(&self, node: &NodeStub) {
        let name = node.name();
        let mut inner = self.core.inner.lock().unwrap();
        let bytes = match protocol::encode(&name) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        self.core.send_event_locked(&inner, Opcode::ExecutorDetachNode, &bytes);
        if let StubEntity::Executor(desc) = &mut inner.entity {
            desc.attached_nodes.retain(|n| *n != name);
        }
    }

    pub fn run_begin(&self) {
        let thread = current_thread_info();
        let mut inner = self.core.inner.lock().unwrap();
        if let Ok(bytes) = protocol::encode(&thread) {
            self.core.send_event_locked(&inner, Opcode::ExecutorRunBegin, &bytes);
        }
        if let StubEntity::Executor(desc) = &mut inner.entity {
            desc.is_running = true;
        }
    }

    pub fn run_end(&self) {
        let thread = current_thread_info();
        let mut inner = self.core.inner.lock().unwrap();
        if let Ok(bytes) = protocol::encode(&thread) {
            self.core.send_event_locked(&inner, Opcode::ExecutorRunEnd, &bytes);
        }
        if let StubEntity::Executor(desc) = &mut inner.entity {
            desc.is_running = false;
        }
    }

    pub fn task_begin(&self, task_id: i32) {
        self.send_task_span(Opcode::ExecutorTaskBegin, task_id);
    }

    pub fn task_end(&self, task_id: i32) {
        self.send_task_span(Opcode::ExecutorTaskEnd, task_id);
    }

    fn send_task_span(&self, opcode: Opcode, task_id: i32) {
        let task = protocol::ExecutorTask { task_id, thread: current_thread_info() };
        self.core.send_event_with(opcode, &task);
    }
}
