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

//! The server role: accepts peers, turns attach requests into proxies,
//! and keeps the registry of everything currently mirrored.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use anyhow::Context as _;
use tracing::{error, info, instrument};

use blackbox2_protocol as protocol;
use protocol::{AttachResponse, Instance, Opcode, Status};

use crate::{
    config::Config,
    host::{HostAddr, PeerId},
    proxy::{ChannelProxy, ExecutorProxy, HandleProxy, NodeProxy, ProcessProxy},
    signal::{Signal, Subscription},
    transport::{RequestContext, Transport},
};

#[derive(Default)]
struct Registry {
    processes: HashMap<PeerId, (ProcessProxy, Subscription)>,
    channels: HashMap<PeerId, (ChannelProxy, Subscription)>,
    executors: HashMap<PeerId, (ExecutorProxy, Subscription)>,
    nodes: HashMap<PeerId, (NodeProxy, Subscription)>,
    handles: HashMap<PeerId, (HandleProxy, Subscription)>,
}

struct ServerShared {
    transport: Arc<Transport>,
    addr: HostAddr,
    on_process_added: Signal<ProcessProxy>,
    on_process_removed: Signal<ProcessProxy>,
    registry: Mutex<Registry>,
}

/// Remove `peer`'s entry from one registry table when its proxy signals
/// disconnect, handing the removed proxy back for notification.
macro_rules! removal_subscription {
    ($shared:expr, $proxy:expr, $table:ident, $peer:expr) => {{
        let weak = Arc::downgrade($shared);
        let peer = $peer;
        $proxy.on_disconnected().subscribe(move |_| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let removed = {
                let mut registry = shared.registry.lock().unwrap();
                registry.$table.remove(&peer).is_some()
            };
            if removed {
                info!("{} detached, removed from the {} table", peer, stringify!($table));
            }
        })
    }};
}

impl ServerShared {
    /// Every accepted peer gets the five attach handlers; everything
    /// else the registry reacts to comes through proxy signals.
    fn handle_connect(self: &Arc<Self>, peer: PeerId) {
        info!("new peer {}", peer);
        let attach_handlers: [(Opcode, fn(&Arc<Self>, &mut RequestContext)); 5] = [
            (Opcode::AttachProcess, Self::handle_attach_process),
            (Opcode::AttachChannel, Self::handle_attach_channel),
            (Opcode::AttachExecutor, Self::handle_attach_executor),
            (Opcode::AttachNode, Self::handle_attach_node),
            (Opcode::AttachHandle, Self::handle_attach_handle),
        ];
        for (opcode, handler) in attach_handlers {
            let weak = Arc::downgrade(self);
            self.transport.register_request_handler(
                peer,
                opcode,
                Some(Arc::new(move |ctx: &mut RequestContext| {
                    // a dropped server answers Unknown via the context
                    if let Some(shared) = weak.upgrade() {
                        handler(&shared, ctx);
                    }
                })),
            );
        }
    }

    fn attach_ok_response(ctx: &mut RequestContext, is_activated: bool) {
        let response = AttachResponse {
            is_activated,
            instance: Instance { id: ctx.peer().0 },
        };
        ctx.set_response_with(Status::Ok, &response);
    }

    fn handle_attach_process(self: &Arc<Self>, ctx: &mut RequestContext) {
        info!("new process attaching...");
        let peer = ctx.peer();
        let proxy = {
            let mut registry = self.registry.lock().unwrap();
            if registry.processes.contains_key(&peer) {
                error!("duplicated process attach from {}", peer);
                ctx.set_response(Status::Existed);
                return;
            }
            let desc: protocol::Process = match protocol::decode(ctx.payload()) {
                Ok(desc) => desc,
                Err(err) => {
                    error!("failed to decode attach process request: {:?}", err);
                    ctx.set_response(Status::DeserializeError);
                    return;
                }
            };
            let proxy = ProcessProxy::new(&self.transport, peer, desc);

            let weak = Arc::downgrade(self);
            let sub = proxy.on_disconnected().subscribe(move |_| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let removed = {
                    let mut registry = shared.registry.lock().unwrap();
                    registry.processes.remove(&peer).map(|(proxy, _sub)| proxy)
                };
                if let Some(proxy) = removed {
                    info!("process {} disconnected, removing", peer);
                    shared.on_process_removed.emit(&proxy);
                }
            });
            registry.processes.insert(peer, (proxy.clone(), sub));

            Self::attach_ok_response(ctx, proxy.is_activated());
            proxy
        };
        self.on_process_added.emit(&proxy);
        info!("new process attached: {}[{}]", proxy.name(), proxy.pid());
    }

    fn handle_attach_channel(self: &Arc<Self>, ctx: &mut RequestContext) {
        info!("new channel attaching...");
        let peer = ctx.peer();
        let (parent, proxy) = {
            let mut registry = self.registry.lock().unwrap();
            if registry.channels.contains_key(&peer) {
                error!("duplicated channel attach from {}", peer);
                ctx.set_response(Status::Existed);
                return;
            }
            let desc: protocol::Channel = match protocol::decode(ctx.payload()) {
                Ok(desc) => desc,
                Err(err) => {
                    error!("failed to decode attach channel request: {:?}", err);
                    ctx.set_response(Status::DeserializeError);
                    return;
                }
            };
            let Some(parent) = Self::resolve_process(&registry, desc.owner_process.id) else {
                error!("channel attach with unknown process id {}", desc.owner_process.id);
                ctx.set_response(Status::InvalidParameter);
                return;
            };
            let proxy = ChannelProxy::new(&self.transport, peer, desc);
            let sub = removal_subscription!(self, proxy, channels, peer);
            registry.channels.insert(peer, (proxy.clone(), sub));

            Self::attach_ok_response(ctx, proxy.is_activated());
            (parent, proxy)
        };
        parent.add_channel(proxy.clone());
        info!("new channel attached: '{}'", proxy.id());
    }

    fn handle_attach_executor(self: &Arc<Self>, ctx: &mut RequestContext) {
        info!("new executor attaching...");
        let peer = ctx.peer();
        let (parent, proxy) = {
            let mut registry = self.registry.lock().unwrap();
            if registry.executors.contains_key(&peer) {
                error!("duplicated executor attach from {}", peer);
                ctx.set_response(Status::Existed);
                return;
            }
            let desc: protocol::Executor = match protocol::decode(ctx.payload()) {
                Ok(desc) => desc,
                Err(err) => {
                    error!("failed to decode attach executor request: {:?}", err);
                    ctx.set_response(Status::DeserializeError);
                    return;
                }
            };
            let Some(parent) = Self::resolve_process(&registry, desc.owner_process.id) else {
                error!("executor attach with unknown process id {}", desc.owner_process.id);
                ctx.set_response(Status::InvalidParameter);
                return;
            };
            let proxy = ExecutorProxy::new(&self.transport, peer, desc);
            let sub = removal_subscription!(self, proxy, executors, peer);
            registry.executors.insert(peer, (proxy.clone(), sub));

            Self::attach_ok_response(ctx, proxy.is_activated());
            (parent, proxy)
        };
        parent.add_executor(proxy);
        info!("new executor attached");
    }

    fn handle_attach_node(self: &Arc<Self>, ctx: &mut RequestContext) {
        info!("new node attaching...");
        let peer = ctx.peer();
        let (parent, proxy) = {
            let mut registry = self.registry.lock().unwrap();
            if registry.nodes.contains_key(&peer) {
                error!("duplicated node attach from {}", peer);
                ctx.set_response(Status::Existed);
                return;
            }
            let desc: protocol::Node = match protocol::decode(ctx.payload()) {
                Ok(desc) => desc,
                Err(err) => {
                    error!("failed to decode attach node request: {:?}", err);
                    ctx.set_response(Status::DeserializeError);
                    return;
                }
            };
            let Some(parent) = Self::resolve_process(&registry, desc.owner_process.id) else {
                error!("node attach with unknown process id {}", desc.owner_process.id);
                ctx.set_response(Status::InvalidParameter);
                return;
            };
            let proxy = NodeProxy::new(&self.transport, peer, desc);
            let sub = removal_subscription!(self, proxy, nodes, peer);
            registry.nodes.insert(peer, (proxy.clone(), sub));

            Self::attach_ok_response(ctx, proxy.is_activated());
            (parent, proxy)
        };
        parent.add_node(proxy.clone());
        info!("new node attached: '{}'", proxy.name());
    }

    fn handle_attach_handle(self: &Arc<Self>, ctx: &mut RequestContext) {
        info!("new handle attaching...");
        let peer = ctx.peer();
        let (parent, proxy) = {
            let mut registry = self.registry.lock().unwrap();
            if registry.handles.contains_key(&peer) {
                error!("duplicated handle attach from {}", peer);
                ctx.set_response(Status::Existed);
                return;
            }
            let desc: protocol::Handle = match protocol::decode(ctx.payload()) {
                Ok(desc) => desc,
                Err(err) => {
                    error!("failed to decode attach handle request: {:?}", err);
                    ctx.set_response(Status::DeserializeError);
                    return;
                }
            };
            let node_id = desc.owner_node.id;
            let parent = match registry.nodes.get(&PeerId(node_id)) {
                Some((proxy, _sub)) if node_id != 0 => proxy.clone(),
                _ => {
                    error!("handle attach with unknown node id {}", node_id);
                    ctx.set_response(Status::InvalidParameter);
                    return;
                }
            };
            let proxy = HandleProxy::new(&self.transport, peer, desc);
            let sub = removal_subscription!(self, proxy, handles, peer);
            registry.handles.insert(peer, (proxy.clone(), sub));

            Self::attach_ok_response(ctx, proxy.is_activated());
            (parent, proxy)
        };
        parent.add_handle(proxy.clone());
        info!("new handle attached: {:?} '{}'", proxy.kind(), proxy.key());
    }

    fn resolve_process(registry: &Registry, owner_id: u64) -> Option<ProcessProxy> {
        if owner_id == 0 {
            return None;
        }
        registry.processes.get(&PeerId(owner_id)).map(|(proxy, _sub)| proxy.clone())
    }
}

/// The blackbox server: binds the configured address, mirrors every
/// attaching process, and exposes the live hierarchy.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// A server listening on `addr`.
    pub fn new(addr: HostAddr) -> Server {
        let config = Config::with_server(addr.clone());
        Server {
            shared: Arc::new(ServerShared {
                transport: Transport::new(config),
                addr,
                on_process_added: Signal::new(),
                on_process_removed: Signal::new(),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    #[instrument(skip_all)]
    pub fn start(&self) -> anyhow::Result<()> {
        info!("starting blackbox server on {}", self.shared.addr);
        let weak: Weak<ServerShared> = Arc::downgrade(&self.shared);
        self.shared
            .transport
            .start_as_server(
                Arc::new(move |peer| {
                    if let Some(shared) = weak.upgrade() {
                        shared.handle_connect(peer);
                    }
                }),
                Some(&self.shared.addr),
            )
            .context("starting server transport")
    }

    #[instrument(skip_all)]
    pub fn stop(&self) {
        info!("stopping blackbox server");
        self.shared.transport.stop();
    }

    /// Snapshot of the currently attached processes.
    pub fn processes(&self) -> Vec<ProcessProxy> {
        let registry = self.shared.registry.lock().unwrap();
        registry.processes.values().map(|(proxy, _sub)| proxy.clone()).collect()
    }

    pub fn on_process_added(&self) -> Signal<ProcessProxy> {
        self.shared.on_process_added.clone()
    }

    pub fn on_process_removed(&self) -> Signal<ProcessProxy> {
        self.shared.on_process_removed.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
