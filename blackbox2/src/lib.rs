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

//! The runtime core of the message-bus blackbox observability fabric.
//!
//! Instrumented applications embed the [`Client`] role: it announces
//! the process and its channels, executors, nodes and I/O handles to a
//! central server, mirrors runtime traffic, and answers control
//! requests. A monitoring tool embeds the [`Server`] role and observes
//! the live hierarchy through [`ProcessProxy`] and friends.
//!
//! Everything rides on one [`Transport`] per process: a reliable-packet
//! layer with a session-correlated request/response protocol, driven by
//! a single backend thread. Entities attach through a parent-child
//! handshake that assigns server-side instance ids, and reconnect (with
//! fresh ids) whenever the connection drops.
//!
//! The client role is off unless `SF_MSGBUS_BLACKBOX2_ENABLE=1`;
//! `SF_MSGBUS_BLACKBOX2_HOST`/`_PORT` point it at the server.

pub mod client;
pub mod config;
pub mod consts;
pub mod host;
pub mod message;
pub mod proxy;
pub mod recorder;
pub mod server;
pub mod signal;
pub mod stats;
pub mod stub;
pub mod transport;

mod object;
mod pipe;

pub use blackbox2_protocol as protocol;

pub use client::Client;
pub use config::Config;
pub use host::{Host, HostAddr, HostEvent, PeerId};
pub use message::{MessageHandler, MessageInfo};
pub use proxy::{ChannelProxy, ExecutorProxy, HandleProxy, NodeProxy, ProcessProxy};
pub use recorder::{LocalPlayer, LocalRecorder, MessageSink};
pub use server::Server;
pub use signal::{Signal, Subscription};
pub use stats::{NullStatProvider, Stat, StatProvider};
pub use stub::{
    channel::{ChannelConfig, ChannelStub},
    executor::ExecutorStub,
    handle::HandleStub,
    node::NodeStub,
};
pub use transport::{RequestContext, Transport};
