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

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{error, warn};

use blackbox2_protocol as protocol;
use protocol::{KeyStat, Opcode, Status, VersionInfo};

use crate::{
    proxy::{ChannelProxy, ChildSlot, ExecutorProxy, NodeProxy, ProxyCore, ProxyEntity},
    signal::Signal,
    stats::Stat,
    transport::Transport,
};

use crate::host::PeerId;

/// Server-side mirror of one attached process: the root of the entity
/// hierarchy for that process, and the parent of its channel, executor
/// and node proxies.
#[derive(Clone)]
pub struct ProcessProxy {
    pub(crate) core: Arc<ProxyCore>,
}

macro_rules! process_entity {
    ($inner:expr) => {
        match &$inner.entity {
            ProxyEntity::Process { desc, .. } => desc,
            _ => unreachable!("process proxy holds a process entity"),
        }
    };
}

impl ProcessProxy {
    pub(crate) fn new(
        transport: &Arc<Transport>,
        peer: PeerId,
        desc: protocol::Process,
    ) -> ProcessProxy {
        let entity = ProxyEntity::Process {
            desc,
            channels: Vec::new(),
            executors: Vec::new(),
            nodes: Vec::new(),
            on_channel_added: Signal::new(),
            on_channel_removed: Signal::new(),
            on_executor_added: Signal::new(),
            on_executor_removed: Signal::new(),
            on_node_added: Signal::new(),
            on_node_removed: Signal::new(),
        };
        ProcessProxy { core: ProxyCore::new(transport, peer, entity) }
    }

    pub fn name(&self) -> String {
        process_entity!(self.core.inner.lock().unwrap()).name.clone()
    }

    pub fn pid(&self) -> i32 {
        process_entity!(self.core.inner.lock().unwrap()).pid
    }

    pub fn cmdline(&self) -> String {
        process_entity!(self.core.inner.lock().unwrap()).cmdline.clone()
    }

    pub fn working_directory(&self) -> String {
        process_entity!(self.core.inner.lock().unwrap()).working_directory.clone()
    }

    pub fn environments(&self) -> String {
        process_entity!(self.core.inner.lock().unwrap()).environments.clone()
    }

    pub fn config_filename(&self) -> String {
        process_entity!(self.core.inner.lock().unwrap()).config_filename.clone()
    }

    pub fn startup_time(&self) -> SystemTime {
        let micros = process_entity!(self.core.inner.lock().unwrap()).startup_timestamp;
        UNIX_EPOCH + Duration::from_micros(micros.max(0) as u64)
    }

    pub fn version(&self) -> VersionInfo {
        process_entity!(self.core.inner.lock().unwrap()).version
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

    pub fn on_activated(&self) -> Signal<()> {
        self.core.on_activated.clone()
    }

    pub fn on_deactivated(&self) -> Signal<()> {
        self.core.on_deactivated.clone()
    }

    pub fn channels(&self) -> Vec<ChannelProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Process { channels, .. } => {
                channels.iter().map(|slot| slot.proxy.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn executors(&self) -> Vec<ExecutorProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Process { executors, .. } => {
                executors.iter().map(|slot| slot.proxy.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn nodes(&self) -> Vec<NodeProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Process { nodes, .. } => {
                nodes.iter().map(|slot| slot.proxy.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn on_channel_added(&self) -> Signal<ChannelProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Process { on_channel_added, .. } => on_channel_added.clone(),
            _ => unreachable!("process proxy holds a process entity"),
        }
    }

    pub fn on_channel_removed(&self) -> Signal<ChannelProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Process { on_channel_removed, .. } => on_channel_removed.clone(),
            _ => unreachable!("process proxy holds a process entity"),
        }
    }

    pub fn on_executor_added(&self) -> Signal<ExecutorProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Process { on_executor_added, .. } => on_executor_added.clone(),
            _ => unreachable!("process proxy holds a process entity"),
        }
    }

    pub fn on_executor_removed(&self) -> Signal<ExecutorProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Process { on_executor_removed, .. } => on_executor_removed.clone(),
            _ => unreachable!("process proxy holds a process entity"),
        }
    }

    pub fn on_node_added(&self) -> Signal<NodeProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Process { on_node_added, .. } => on_node_added.clone(),
            _ => unreachable!("process proxy holds a process entity"),
        }
    }

    pub fn on_node_removed(&self) -> Signal<NodeProxy> {
        let inner = self.core.inner.lock().unwrap();
        match &inner.entity {
            ProxyEntity::Process { on_node_removed, .. } => on_node_removed.clone(),
            _ => unreachable!("process proxy holds a process entity"),
        }
    }

    /// Tell the live process to start replaying captured traffic.
    pub fn start_local_player(&self) -> bool {
        self.send_control(Opcode::ProcessStartLocalPlayer)
    }

    pub fn stop_local_player(&self) -> bool {
        self.send_control(Opcode::ProcessStopLocalPlayer)
    }

    /// Tell the live process to start capturing traffic locally.
    pub fn start_local_recorder(&self) -> bool {
        self.send_control(Opcode::ProcessStartLocalRecorder)
    }

    pub fn stop_local_recorder(&self) -> bool {
        self.send_control(Opcode::ProcessStopLocalRecorder)
    }

    fn send_control(&self, opcode: Opcode) -> bool {
        let inner = self.core.inner.lock().unwrap();
        inner.endpoint.send_event(opcode, &[])
    }

    /// Ask the live process for the traffic statistics of one key. The
    /// callback fires on the backend thread with the decoded block, or
    /// with the failure status and None.
    pub fn get_key_stat<F>(&self, key: &str, cb: F) -> bool
    where
        F: FnOnce(Status, Option<Stat>) + Send + 'static,
    {
        let payload = match protocol::encode(&key) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to serialize key stat request: {:?}", err);
                return false;
            }
        };
        let inner = self.core.inner.lock().unwrap();
        inner.endpoint.send_request(
            Opcode::ProcessGetKeyStat,
            &payload,
            Box::new(move |status, payload| {
                if status != Status::Ok {
                    cb(status, None);
                    return;
                }
                match protocol::decode::<KeyStat>(payload) {
                    Ok(stat) if stat.valid => cb(Status::Ok, Some(Stat::from_wire(&stat))),
                    Ok(_) => cb(Status::Unknown, None),
                    Err(err) => {
                        error!("failed to decode key stat response: {:?}", err);
                        cb(Status::DeserializeError, None);
                    }
                }
            }),
        )
    }

    pub(crate) fn add_channel(&self, child: ChannelProxy) {
        let Some(child_peer) = child.core.peer() else {
            warn!("channel proxy lost its peer before linking");
            return;
        };
        let (added, emit) = {
            let mut inner = self.core.inner.lock().unwrap();
            let ProxyEntity::Process {
                channels, on_channel_added, on_channel_removed, ..
            } = &mut inner.entity
            else {
                return;
            };
            if channels.iter().any(|slot| slot.peer == child_peer) {
                error!("duplicated channel under process");
                return;
            }
            let weak = Arc::downgrade(&self.core);
            let removed_signal = on_channel_removed.clone();
            let sub = child.on_disconnected().subscribe(move |_| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let removed = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Process { channels, .. } => {
                            let at = channels.iter().position(|slot| slot.peer == child_peer);
                            at.map(|at| channels.remove(at).proxy)
                        }
                        _ => None,
                    }
                };
                if let Some(proxy) = removed {
                    removed_signal.emit(&proxy);
                }
            });
            channels.push(ChildSlot::new(child_peer, child.clone(), sub));
            (on_channel_added.clone(), child)
        };
        added.emit(&emit);
    }

    pub(crate) fn add_executor(&self, child: ExecutorProxy) {
        let Some(child_peer) = child.core.peer() else {
            warn!("executor proxy lost its peer before linking");
            return;
        };
        let (added, emit) = {
            let mut inner = self.core.inner.lock().unwrap();
            let ProxyEntity::Process {
                executors, on_executor_added, on_executor_removed, ..
            } = &mut inner.entity
            else {
                return;
            };
            if executors.iter().any(|slot| slot.peer == child_peer) {
                error!("duplicated executor under process");
                return;
            }
            let weak = Arc::downgrade(&self.core);
            let removed_signal = on_executor_removed.clone();
            let sub = child.on_disconnected().subscribe(move |_| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let removed = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Process { executors, .. } => {
                            let at = executors.iter().position(|slot| slot.peer == child_peer);
                            at.map(|at| executors.remove(at).proxy)
                        }
                        _ => None,
                    }
                };
                if let Some(proxy) = removed {
                    removed_signal.emit(&proxy);
                }
            });
            executors.push(ChildSlot::new(child_peer, child.clone(), sub));
            (on_executor_added.clone(), child)
        };
        added.emit(&emit);
    }

    pub(crate) fn add_node(&self, child: NodeProxy) {
        let Some(child_peer) = child.core.peer() else {
            warn!("node proxy lost its peer before linking");
            return;
        };
        let (added, emit) = {
            let mut inner = self.core.inner.lock().unwrap();
            let ProxyEntity::Process { nodes, on_node_added, on_node_removed, .. } =
                &mut inner.entity
            else {
                return;
            };
            if nodes.iter().any(|slot| slot.peer == child_peer) {
                error!("duplicated node under process");
                return;
            }
            let weak = Arc::downgrade(&self.core);
            let removed_signal = on_node_removed.clone();
            let sub = child.on_disconnected().subscribe(move |_| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                let removed = {
                    let mut inner = core.inner.lock().unwrap();
                    match &mut inner.entity {
                        ProxyEntity::Process { nodes, .. } => {
                            let at = nodes.iter().position(|slot| slot.peer == child_peer);
                            at.map(|at| nodes.remove(at).proxy)
                        }
                        _ => None,
                    }
                };
                if let Some(proxy) = removed {
                    removed_signal.emit(&proxy);
                }
            });
            nodes.push(ChildSlot::new(child_peer, child.clone(), sub));
            (on_node_added.clone(), child)
        };
        added.emit(&emit);
    }
}
