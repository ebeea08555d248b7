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

//! The client role: one process-scoped stub plus the factories for the
//! entity stubs living under it.

use std::{
    env, fs,
    sync::{Arc, Mutex, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{error, info, instrument, warn};

use blackbox2_protocol as protocol;
use protocol::{Opcode, Status, VersionInfo};

use crate::{
    config::Config,
    message::MessageHandler,
    recorder::{LocalPlayer, LocalRecorder, MessageSink},
    signal::Signal,
    stats::StatProvider,
    stub::{
        channel::{ChannelConfig, ChannelStub},
        executor::ExecutorStub,
        node::NodeStub,
        StubCore, StubEntity,
    },
    transport::{RequestContext, Transport},
};

fn current_exe_name() -> String {
    env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

fn parse_version_component(raw: &str) -> u32 {
    raw.parse().unwrap_or(0)
}

/// Facts about the running process, drawn from the OS.
fn current_process_descriptor() -> protocol::Process {
    let mut version_parts = env!("CARGO_PKG_VERSION").splitn(3, '.');
    let version = VersionInfo {
        major: parse_version_component(version_parts.next().unwrap_or("0")),
        minor: parse_version_component(version_parts.next().unwrap_or("0")),
        patch: parse_version_component(version_parts.next().unwrap_or("0")),
    };

    let environments: Vec<String> =
        env::vars().map(|(k, v)| format!("{}={}", k, v)).collect();
    let cmdline = match fs::read_to_string("/proc/self/cmdline") {
        Ok(raw) => raw.split('\0').filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" "),
        Err(_) => env::args().collect::<Vec<_>>().join(" "),
    };

    let startup_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);

    protocol::Process {
        pid: std::process::id() as i32,
        name: current_exe_name(),
        cmdline,
        working_directory: env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default(),
        environments: environments.join("\n"),
        config_filename: String::new(),
        startup_timestamp,
        version,
    }
}

struct ClientShared {
    core: Arc<StubCore>,
    /// Live channel stubs, re-pointed when the server starts or stops
    /// the local recorder/player. Dead entries are pruned as the list
    /// is walked.
    channels: Mutex<Vec<Weak<StubCore>>>,
    recorder: Arc<LocalRecorder>,
    player: Arc<LocalPlayer>,
    stats: Arc<dyn StatProvider>,
    /// Declared last: the stubs above disconnect through it on drop.
    transport: Arc<Transport>,
}

impl ClientShared {
    /// Walk the live channels, applying `f` to each and pruning the
    /// dead.
    fn for_each_channel(&self, f: impl Fn(&ChannelStub)) {
        let mut channels = self.channels.lock().unwrap();
        channels.retain(|weak| match weak.upgrade() {
            Some(core) => {
                f(&ChannelStub { core });
                true
            }
            None => false,
        });
    }

    fn handle_get_key_stat(&self, ctx: &mut RequestContext) {
        let key: String = match protocol::decode(ctx.payload()) {
            Ok(key) => key,
            Err(err) => {
                error!("failed to decode key stat request: {:?}", err);
                ctx.set_response(Status::DeserializeError);
                return;
            }
        };
        match self.stats.get(&key) {
            Some(stat) => {
                ctx.set_response_with(Status::Ok, &stat.to_wire());
            }
            None => {
                error!("no stat for key '{}'", key);
                ctx.set_response(Status::InvalidParameter);
            }
        }
    }

    fn handle_start_local_player(&self) {
        info!("starting local player");
        self.player.start(None);
        let player: Arc<dyn MessageSink> = Arc::clone(&self.player) as Arc<dyn MessageSink>;
        self.for_each_channel(|channel| channel.set_local_player(Some(Arc::clone(&player))));
    }

    fn handle_stop_local_player(&self) {
        info!("stopping local player");
        self.for_each_channel(|channel| channel.set_local_player(None));
        self.player.stop();
    }

    fn handle_start_local_recorder(&self) {
        info!("starting local recorder");
        self.recorder.start(None);
        let recorder: Arc<dyn MessageSink> = Arc::clone(&self.recorder) as Arc<dyn MessageSink>;
        self.for_each_channel(|channel| channel.set_local_recorder(Some(Arc::clone(&recorder))));
    }

    fn handle_stop_local_recorder(&self) {
        info!("stopping local recorder");
        self.for_each_channel(|channel| channel.set_local_recorder(None));
        self.recorder.stop();
    }
}

/// The client role. Announces the running process to the blackbox
/// server and hands out entity stubs parented to it. When blackbox2 is
/// disabled by the environment the client is inert: every factory
/// returns None and nothing ever dials out.
pub struct Client {
    shared: Option<Arc<ClientShared>>,
}

impl Client {
    /// Build a client from the environment.
    pub fn new(stats: Arc<dyn StatProvider>) -> Client {
        Client::with_config(Config::from_env(), stats)
    }

    #[instrument(skip_all)]
    pub fn with_config(config: Config, stats: Arc<dyn StatProvider>) -> Client {
        if !config.enabled {
            return Client { shared: None };
        }

        let transport = Transport::new(config);
        if let Err(err) = transport.start_as_client() {
            error!("failed to start client transport: {:?}", err);
            return Client { shared: None };
        }

        let core = StubCore::new(
            Arc::clone(&transport),
            StubEntity::Process(current_process_descriptor()),
            None,
        );
        let shared = Arc::new(ClientShared {
            core: Arc::clone(&core),
            channels: Mutex::new(Vec::new()),
            recorder: Arc::new(LocalRecorder::new()),
            player: Arc::new(LocalPlayer::new()),
            stats,
            transport,
        });

        let weak = Arc::downgrade(&shared);
        core.register_request_handler(
            Opcode::ProcessGetKeyStat,
            Arc::new(move |ctx: &mut RequestContext| {
                // a dropped client answers Unknown via the context drop
                if let Some(shared) = weak.upgrade() {
                    shared.handle_get_key_stat(ctx);
                }
            }),
        );

        let weak = Arc::downgrade(&shared);
        core.register_event_handler(
            Opcode::ProcessStartLocalPlayer,
            Arc::new(move |_: &[u8]| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_start_local_player();
                }
            }),
        );
        let weak = Arc::downgrade(&shared);
        core.register_event_handler(
            Opcode::ProcessStopLocalPlayer,
            Arc::new(move |_: &[u8]| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_stop_local_player();
                }
            }),
        );
        let weak = Arc::downgrade(&shared);
        core.register_event_handler(
            Opcode::ProcessStartLocalRecorder,
            Arc::new(move |_: &[u8]| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_start_local_recorder();
                }
            }),
        );
        let weak = Arc::downgrade(&shared);
        core.register_event_handler(
            Opcode::ProcessStopLocalRecorder,
            Arc::new(move |_: &[u8]| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_stop_local_recorder();
                }
            }),
        );

        core.start();
        info!("client initialized");
        Client { shared: Some(shared) }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_some()
    }

    /// The server-assigned instance id of this process, 0 while
    /// unattached.
    pub fn instance_id(&self) -> u64 {
        self.shared.as_ref().map(|s| s.core.instance_id()).unwrap_or(0)
    }

    pub fn on_instance_id_changed(&self) -> Option<Signal<u64>> {
        self.shared.as_ref().map(|s| s.core.on_instance_id_changed.clone())
    }

    /// Whether the server has the local recorder running.
    pub fn is_recorder_started(&self) -> bool {
        self.shared.as_ref().map(|s| s.recorder.is_started()).unwrap_or(false)
    }

    /// Whether the server has the local player running.
    pub fn is_player_started(&self) -> bool {
        self.shared.as_ref().map(|s| s.player.is_started()).unwrap_or(false)
    }

    /// Record which config file the process was started with.
    pub fn set_config_filename(&self, filename: &str) {
        let Some(shared) = &self.shared else {
            return;
        };
        let mut inner = shared.core.inner.lock().unwrap();
        if let StubEntity::Process(desc) = &mut inner.entity {
            desc.config_filename = String::from(filename);
            desc.startup_timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as i64)
                .unwrap_or(0);
        }
    }

    /// Announce a channel. Returns None when blackbox2 is disabled.
    pub fn create_channel_stub(
        &self,
        config: &ChannelConfig,
        inject_message_handler: Option<MessageHandler>,
    ) -> Option<ChannelStub> {
        let shared = self.shared.as_ref()?;
        if !shared.transport.is_enabled() {
            return None;
        }
        let stub = ChannelStub::new(
            Arc::clone(&shared.transport),
            config,
            inject_message_handler,
            &shared.core,
        );
        if !stub.core.start() {
            warn!("channel stub failed to start");
            return None;
        }
        shared.channels.lock().unwrap().push(Arc::downgrade(&stub.core));
        Some(stub)
    }

    /// Announce an executor. Returns None when blackbox2 is disabled.
    pub fn create_executor_stub(&self, thread_pool_size: usize) -> Option<ExecutorStub> {
        let shared = self.shared.as_ref()?;
        if !shared.transport.is_enabled() {
            return None;
        }
        let stub = ExecutorStub::new(Arc::clone(&shared.transport), thread_pool_size, &shared.core);
        if !stub.core.start() {
            warn!("executor stub failed to start");
            return None;
        }
        Some(stub)
    }

    /// Announce a node. Returns None when blackbox2 is disabled.
    pub fn create_node_stub(&self, name: &str) -> Option<NodeStub> {
        let shared = self.shared.as_ref()?;
        if !shared.transport.is_enabled() {
            return None;
        }
        let stub = NodeStub::new(Arc::clone(&shared.transport), name, &shared.core);
        if !stub.core.start() {
            warn!("node stub failed to start");
            return None;
        }
        Some(stub)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.core.stop();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{consts, host::HostAddr, stats::NullStatProvider};

    #[test]
    fn disabled_client_is_inert() {
        let config = Config {
            enabled: false,
            server: HostAddr { host: String::from(consts::DEFAULT_HOST), port: 63001 },
        };
        let client = Client::with_config(config, Arc::new(NullStatProvider));
        assert!(!client.is_enabled());
        assert_eq!(client.instance_id(), 0);
        assert!(client.create_channel_stub(&ChannelConfig::default(), None).is_none());
        assert!(client.create_executor_stub(4).is_none());
        assert!(client.create_node_stub("n").is_none());
    }

    #[test]
    fn process_descriptor_carries_os_facts() {
        let desc = current_process_descriptor();
        assert_eq!(desc.pid, std::process::id() as i32);
        assert!(desc.startup_timestamp > 0);
        assert!(!desc.working_directory.is_empty());
    }
}
