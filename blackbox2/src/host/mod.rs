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

use std::{fmt, os::fd::BorrowedFd};

pub mod loopback;

/// Transport-level identity of one connection. Tokens are never reused
/// within a process, which lets the server use them verbatim as entity
/// instance ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// A host endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One event drained from a host.
#[derive(Debug)]
pub enum HostEvent {
    /// A dialed or accepted connection became live.
    Connect { peer: PeerId },
    /// The peer disconnected, gracefully or by timeout.
    Disconnect { peer: PeerId },
    /// One reliable, ordered packet arrived.
    Receive { peer: PeerId, data: Vec<u8> },
}

/// The seam for the reliable-packet library.
///
/// The runtime treats the connection-oriented reliable-UDP layer as an
/// external collaborator: anything that can hand out peer tokens,
/// deliver per-peer FIFO packets, and surface connect/disconnect events
/// through a pollable readiness handle can carry the blackbox protocol.
/// The bundled [`loopback::LoopbackHost`] wires transports together
/// inside one process; a UDP binding implements the same trait.
pub trait Host: Send {
    /// Begin an outgoing connect. The returned token identifies the
    /// connection immediately; success or failure arrives later as a
    /// `Connect` or `Disconnect` event.
    fn connect(&mut self, addr: &HostAddr) -> Option<PeerId>;

    /// Begin a graceful disconnect. Completion arrives as a
    /// `Disconnect` event.
    fn disconnect(&mut self, peer: PeerId);

    /// Queue one packet for reliable, ordered delivery.
    fn send(&mut self, peer: PeerId, data: Vec<u8>) -> bool;

    /// Drain one pending event, without blocking.
    fn service(&mut self) -> Option<HostEvent>;

    /// Readiness handle for the backend's poll set: readable whenever
    /// `service` has something to return.
    fn poll_fd(&self) -> BorrowedFd<'_>;

    /// Tune the liveness discipline of one peer: give up after `limit`
    /// unacknowledged retransmissions, with retransmit intervals scaled
    /// between `min_ms` and `max_ms`.
    fn set_peer_timeout(&mut self, peer: PeerId, limit: u32, min_ms: u32, max_ms: u32);

    /// The remote endpoint of a live peer.
    fn peer_addr(&self, peer: PeerId) -> Option<HostAddr>;
}
