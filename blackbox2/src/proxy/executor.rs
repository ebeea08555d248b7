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

use tracing::error;

use blackbox2_protocol as protocol;
use protocol::{Opcode, ThreadInfo};

use crate::{
    host::PeerId,
    proxy::{ProxyCore, ProxyEntity},
    signal::Signal,
    transport::Transport,
};

/// Server-side mirror of one executor: tracks which nodes it drives and
/// the run/task spans it reports.
#[derive(Clone)]
pub struct ExecutorProxy {
    pub(crate) core: Arc<ProxyCore>,
}

impl ExecutorProxy {
    pub(crate) fn new(
        transport: &Arc<Transport>,
        peer: PeerId,
        desc: protocol::Executor,
    ) -> ExecutorProxy {
        let is_running = desc.is_running;
        let attached_nodes = desc.attached_nodes.clone();
        let entity = ProxyEntity::Executor {
            desc,
            is_running,
            attached_nodes,
            on_node_attached: Signal::new(),
            on_node_detached: Signal::new(),
            on_run_begin: Signal::new(),
            on_run_end: Signal::new(),
            on_task_begin: Signal::new(),
            on_task_end: Signal::new(),
        };
        let core = ProxyCore::new(transport, peer, entity);
        let proxy = ExecutorProxy { core };
        proxy.register_handlers();
        proxy
    }

    fn register_handlers(&self) {
        let weak = Arc::downgrade(&self.core);
        self.core.register_event_handler(
            Opcode::ExecutorAttachNode,
            Arc::new(move |payload: &[u8]| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let name: String = match protocol::decode(payload) {
                    Ok(name) => name,
                    Err(err) => {
                        error!("failed to decode executor attach node event: {:?}", err);
                        return;
                    }
                };
                let signal = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Executor { attached_nodes, on_node_attached, .. } => {
                            attached_nodes.push(name.clone());
                            Some(on_node_attached.clone())
                        }
                        _ => None,
                    }
                };
                if let Some(signal) = signal {
                    signal.emit(&name);
                }
            }),
        );

        let weak = Arc::downgrade(&self.core);
        self.core.register_event_handler(
            Opcode::ExecutorDetachNode,
            Arc::new(move |payload: &[u8]| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let name: String = match protocol::decode(payload) {
                    Ok(name) => name,
                    Err(err) => {
                        error!("failed to decode executor detach node event: {:?}", err);
                        return;
                    }
                };
                let signal = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Executor { attached_nodes, on_node_detached, .. } => {
                            attached_nodes.retain(|n| *n != name);
                            Some(on_node_detached.clone())
                        }
                        _ => None,
                    }
                };
                if let Some(signal) = signal {
                    signal.emit(&name);
                }
            }),
        );

        let weak = Arc::downgrade(&self.core);
        self.core.register_event_handler(
            Opcode::ExecutorRunBegin,
            Arc::new(move |payload: &[u8]| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let thread: ThreadInfo = match protocol::decode(payload) {
                    Ok(thread) => thread,
                    Err(err) => {
                        error!("failed to decode executor run begin event: {:?}", err);
                        return;
                    }
                };
                let signal = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Executor { is_running, on_run_begin, .. } => {
                            *is_running = true;
                            Some(on_run_begin.clone())
                        }
                        _ => None,
                    }
                };
                if let Some(signal) = signal {
                    signal.emit(&thread);
                }
            }),
        );

        let weak = Arc::downgrade(&self.core);
        self.core.register_event_handler(
            Opcode::ExecutorRunEnd,
            Arc::new(move |_payload: &[u8]| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                // only a running executor can stop running
                let signal = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Executor { is_running, on_run_end, .. } if *is_running => {
                            *is_running = false;
                            Some(on_run_end.clone())
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
            Opcode::ExecutorTaskBegin,
            Arc::new(move |payload: &[u8]| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let task: protocol::ExecutorTask = match protocol::decode(payload) {
                    Ok(task) => task,
                    Err(err) => {
                        error!("failed to decode executor task begin event: {:?}", err);
                        return;
                    }
                };
                let signal = {
                    let inner = core.inner.lock().unwrap();
                    match &inner.entity {
                        ProxyEntity::Executor { on_task_begin, .. } => Some(on_task_begin.clone()),
                        _ => None,
                    }
                };
                if let Some(signal) = signal {
                    signal.emit(&task);
                }
            }),
        );

        let weak = Arc::downgrade(&self.core);
        self.core.register_event_handler(
            Opcode::ExecutorTaskEnd,
            Arc::new(move |payload: &[u8]| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let task: protocol::ExecutorTask = match protocol::decode(payload) {
                    Ok(task) => task,
                    Err(err) => {
                        error!("failed to decode executor task end event: {:?}", err);
                        return;
                    }
                };
                let signal = {
                    let inner = core.inner.lock().unwrap();
                    match &inner.entity {
                        ProxyEntity::Executor { on_task_end, .. } => Some(on_task_end.clone()),
                        _ => None,
                    }
                };
                if let Some(signal) = signal {
                    signal.emit(&task.task_id);
                }
            }),
        );
    }

    pub fn thread_pool_size(&self) -> u64 {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Executor { desc, .. } => desc.thread_pool_size,
            _ => 0,
        }
    }

    pub fn owner_thread(&self) -> ThreadInfo {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Executor { desc, .. } => desc.owner_thread.clone(),
            _ => ThreadInfo::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Executor { is_running, .. } => *is_running,
            _ => false,
        }
    }

    pub fn attached_nodes(&self) -> Vec<String> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Executor { attached_nodes, .. } => attached_nodes.clone(),
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

    pub fn on_node_attached(&self) -> Signal<String> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Executor { on_node_attached, .. } => on_node_attached.clone(),
            _ => Signal::new(),
        }
    }

    pub fn on_node_detached(&self) -> Signal<String> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Executor { on_node_detached, .. } => on_node_detached.clone(),
            _ => Signal::new(),
        }
    }

    pub fn on_run_begin(&self) -> Signal<ThreadInfo> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Executor { on_run_begin, .. } => on_run_begin.clone(),
            _ => Signal::new(),
        }
    }

    pub fn on_run_end(&self) -> Signal<()> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Executor { on_run_end, .. } => on_run_end.clone(),
            _ => Signal::new(),
        }
    }

    pub fn on_task_begin(&self) -> Signal<protocol::ExecutorTask> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Executor { on_task_begin, .. } => on_task_begin.clone(),
            _ => Signal::new(),
        }
    }

    pub fn on_task_end(&self) -> Signal<i32> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Executor { on_task_end, .. } => on_task_end.clone(),
            _ => Signal::new(),
        }
    }
}
