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

//! The in-process host fabric.
//!
//! Hosts exchange frames over crossbeam mailboxes; every queued frame is
//! paired with one byte written to the receiving host's wake fd so that
//! readiness polling behaves exactly like a socket. Delivery is per-peer
//! FIFO. Connecting to a port nobody bound surfaces as a `Disconnect`
//! event on the dialing side, which the transport reports as a connect
//! timeout.

use std::{
    collections::HashMap,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Context};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use lazy_static::lazy_static;
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    unistd,
};
use tracing::warn;

use super::{Host, HostAddr, HostEvent, PeerId};

lazy_static! {
    /// Bound server ports, process wide.
    static ref FABRIC: Mutex<HashMap<u16, Mailbox>> = Mutex::new(HashMap::new());
}

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_EPHEMERAL_PORT: AtomicU64 = AtomicU64::new(40000);

fn next_peer_id() -> PeerId {
    PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
}

enum Frame {
    /// A dialing host announces itself to a bound host.
    Dial { reply: Mailbox, reply_addr: HostAddr, caller_peer: PeerId, callee_peer: PeerId },
    /// The bound host's answer; the caller's end of the link is live.
    Accept { peer: PeerId },
    /// The named peer is gone.
    Bye { peer: PeerId },
    /// One reliable, ordered packet.
    Packet { peer: PeerId, data: Vec<u8> },
}

/// The ingress side of a host: a frame queue plus the wake fd that makes
/// the queue pollable.
#[derive(Clone)]
struct Mailbox {
    tx: Sender<Frame>,
    wake: Arc<OwnedFd>,
}

impl Mailbox {
    fn push(&self, frame: Frame) -> bool {
        if self.tx.send(frame).is_err() {
            return false;
        }
        // One byte per frame keeps the fd readable while the queue is
        // non-empty. A failed write means the pipe buffer is already
        // full of unread wakeups, so readiness is guaranteed anyway.
        let _ = unistd::write(&*self.wake, &[1u8]);
        true
    }
}

struct Link {
    remote: Mailbox,
    remote_peer: PeerId,
    remote_addr: HostAddr,
}

pub struct LoopbackHost {
    mailbox: Mailbox,
    rx: Receiver<Frame>,
    wake_read: OwnedFd,
    local_addr: HostAddr,
    bound_port: Option<u16>,
    links: HashMap<PeerId, Link>,
}

impl LoopbackHost {
    /// A host with no listening address, for the client role.
    pub fn client() -> anyhow::Result<LoopbackHost> {
        let port = NEXT_EPHEMERAL_PORT.fetch_add(1, Ordering::Relaxed) as u16;
        LoopbackHost::new(HostAddr { host: String::from("127.0.0.1"), port })
    }

    /// A host bound to `addr`'s port, for the server role. Fails if the
    /// port is already bound within this process.
    pub fn server(addr: &HostAddr) -> anyhow::Result<LoopbackHost> {
        let mut host = LoopbackHost::new(addr.clone())?;
        {
            let mut fabric = FABRIC.lock().unwrap();
            if fabric.contains_key(&addr.port) {
                return Err(anyhow!("port {} is already bound", addr.port));
            }
            fabric.insert(addr.port, host.mailbox.clone());
        }
        // only a host that actually owns the binding unbinds on drop
        host.bound_port = Some(addr.port);
        Ok(host)
    }

    fn new(local_addr: HostAddr) -> anyhow::Result<LoopbackHost> {
        let (wake_read, wake_write) = unistd::pipe().context("creating host wake pipe")?;
        // Wake bytes and frames race benignly; a non-blocking read end
        // lets service() shrug off a byte that has not landed yet.
        fcntl(&wake_read, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .context("making host wake pipe non-blocking")?;
        let (tx, rx) = crossbeam_channel::unbounded();
        Ok(LoopbackHost {
            mailbox: Mailbox { tx, wake: Arc::new(wake_write) },
            rx,
            wake_read,
            local_addr,
            bound_port: None,
            links: HashMap::new(),
        })
    }

    /// Tear down one link locally and queue our own disconnect event.
    fn drop_link(&mut self, peer: PeerId) {
        self.links.remove(&peer);
        self.mailbox.push(Frame::Bye { peer });
    }
}

impl Host for LoopbackHost {
    fn connect(&mut self, addr: &HostAddr) -> Option<PeerId> {
        let caller_peer = next_peer_id();
        let callee_peer = next_peer_id();

        let listener = FABRIC.lock().unwrap().get(&addr.port).cloned();
        match listener {
            Some(remote) => {
                self.links.insert(
                    caller_peer,
                    Link { remote: remote.clone(), remote_peer: callee_peer, remote_addr: addr.clone() },
                );
                let dial = Frame::Dial {
                    reply: self.mailbox.clone(),
                    reply_addr: self.local_addr.clone(),
                    caller_peer,
                    callee_peer,
                };
                if !remote.push(dial) {
                    // the listening host is mid-teardown
                    self.drop_link(caller_peer);
                }
            }
            None => {
                // nobody listening: the dial times out
                self.mailbox.push(Frame::Bye { peer: caller_peer });
            }
        }

        Some(caller_peer)
    }

    fn disconnect(&mut self, peer: PeerId) {
        if let Some(link) = self.links.remove(&peer) {
            link.remote.push(Frame::Bye { peer: link.remote_peer });
        }
        // our own side observes the disconnect as an event too
        self.mailbox.push(Frame::Bye { peer });
    }

    fn send(&mut self, peer: PeerId, data: Vec<u8>) -> bool {
        let Some(link) = self.links.get(&peer) else {
            return false;
        };
        let delivered = link.remote.push(Frame::Packet { peer: link.remote_peer, data });
        if !delivered {
            warn!("{}: remote host is gone, dropping link", peer);
            self.drop_link(peer);
        }
        delivered
    }

    fn service(&mut self) -> Option<HostEvent> {
        loop {
            let frame = match self.rx.try_recv() {
                Ok(frame) => frame,
                Err(TryRecvError::Empty) => return None,
                // we hold a sender ourselves, so this cannot happen
                Err(TryRecvError::Disconnected) => return None,
            };
            let mut wake_buf = [0u8; 1];
            let _ = unistd::read(&self.wake_read, &mut wake_buf);

            match frame {
                Frame::Dial { reply, reply_addr, caller_peer, callee_peer } => {
                    self.links.insert(
                        callee_peer,
                        Link { remote: reply.clone(), remote_peer: caller_peer, remote_addr: reply_addr },
                    );
                    reply.push(Frame::Accept { peer: caller_peer });
                    return Some(HostEvent::Connect { peer: callee_peer });
                }
                Frame::Accept { peer } => {
                    return Some(HostEvent::Connect { peer });
                }
                Frame::Bye { peer } => {
                    self.links.remove(&peer);
                    return Some(HostEvent::Disconnect { peer });
                }
                Frame::Packet { peer, data } => {
                    if self.links.contains_key(&peer) {
                        return Some(HostEvent::Receive { peer, data });
                    }
                    // link already torn down locally; drop the packet
                }
            }
        }
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.wake_read.as_fd()
    }

    fn set_peer_timeout(&mut self, _peer: PeerId, _limit: u32, _min_ms: u32, _max_ms: u32) {
        // loopback delivery cannot be lost, so there is nothing to tune
    }

    fn peer_addr(&self, peer: PeerId) -> Option<HostAddr> {
        self.links.get(&peer).map(|link| link.remote_addr.clone())
    }
}

impl Drop for LoopbackHost {
    fn drop(&mut self) {
        if let Some(port) = self.bound_port {
            FABRIC.lock().unwrap().remove(&port);
        }
        for (_, link) in self.links.drain() {
            link.remote.push(Frame::Bye { peer: link.remote_peer });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_addr(port: u16) -> HostAddr {
        HostAddr { host: String::from("127.0.0.1"), port }
    }

    fn drain_connect(host: &mut LoopbackHost) -> PeerId {
        match host.service() {
            Some(HostEvent::Connect { peer }) => peer,
            other => panic!("expected connect event, got {:?}", other),
        }
    }

    #[test]
    fn dial_accept_and_deliver() {
        let addr = test_addr(61001);
        let mut server = LoopbackHost::server(&addr).unwrap();
        let mut client = LoopbackHost::client().unwrap();

        let client_peer = client.connect(&addr).unwrap();
        let server_peer = drain_connect(&mut server);
        assert_eq!(drain_connect(&mut client), client_peer);

        assert!(client.send(client_peer, vec![1, 2, 3]));
        assert!(client.send(client_peer, vec![4]));
        match server.service() {
            Some(HostEvent::Receive { peer, data }) => {
                assert_eq!(peer, server_peer);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("expected receive, got {:?}", other),
        }
        match server.service() {
            Some(HostEvent::Receive { data, .. }) => assert_eq!(data, vec![4]),
            other => panic!("expected second receive, got {:?}", other),
        }
        assert!(server.service().is_none());
    }

    #[test]
    fn peer_ids_are_unique_across_links() {
        let addr = test_addr(61002);
        let mut server = LoopbackHost::server(&addr).unwrap();
        let mut c1 = LoopbackHost::client().unwrap();
        let mut c2 = LoopbackHost::client().unwrap();

        let p1 = c1.connect(&addr).unwrap();
        let p2 = c2.connect(&addr).unwrap();
        let s1 = drain_connect(&mut server);
        let s2 = drain_connect(&mut server);
        let mut all = vec![p1, p2, s1, s2];
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn dialing_an_unbound_port_reports_disconnect() {
        let mut client = LoopbackHost::client().unwrap();
        let peer = client.connect(&test_addr(61003)).unwrap();
        match client.service() {
            Some(HostEvent::Disconnect { peer: p }) => assert_eq!(p, peer),
            other => panic!("expected disconnect, got {:?}", other),
        }
    }

    #[test]
    fn graceful_disconnect_reaches_both_sides() {
        let addr = test_addr(61004);
        let mut server = LoopbackHost::server(&addr).unwrap();
        let mut client = LoopbackHost::client().unwrap();

        let client_peer = client.connect(&addr).unwrap();
        let server_peer = drain_connect(&mut server);
        drain_connect(&mut client);

        client.disconnect(client_peer);
        match client.service() {
            Some(HostEvent::Disconnect { peer }) => assert_eq!(peer, client_peer),
            other => panic!("expected local disconnect, got {:?}", other),
        }
        match server.service() {
            Some(HostEvent::Disconnect { peer }) => assert_eq!(peer, server_peer),
            other => panic!("expected remote disconnect, got {:?}", other),
        }
        // the link is gone; further sends fail
        assert!(!client.send(client_peer, vec![9]));
    }

    #[test]
    fn dropping_the_server_fails_client_sends() {
        let addr = test_addr(61005);
        let mut server = LoopbackHost::server(&addr).unwrap();
        let mut client = LoopbackHost::client().unwrap();

        let client_peer = client.connect(&addr).unwrap();
        drain_connect(&mut server);
        drain_connect(&mut client);

        drop(server);
        match client.service() {
            Some(HostEvent::Disconnect { peer }) => assert_eq!(peer, client_peer),
            other => panic!("expected disconnect after server drop, got {:?}", other),
        }
        assert!(!client.send(client_peer, vec![1]));
        // and the port can be bound again
        let _server = LoopbackHost::server(&addr).unwrap();
    }

    #[test]
    fn double_bind_is_rejected() {
        let addr = test_addr(61006);
        let _server = LoopbackHost::server(&addr).unwrap();
        assert!(LoopbackHost::server(&addr).is_err());
    }

    #[test]
    fn peer_addr_reports_the_remote_endpoint() {
        let addr = test_addr(61007);
        let mut server = LoopbackHost::server(&addr).unwrap();
        let mut client = LoopbackHost::client().unwrap();

        let client_peer = client.connect(&addr).unwrap();
        let server_peer = drain_connect(&mut server);
        drain_connect(&mut client);

        assert_eq!(client.peer_addr(client_peer), Some(addr));
        let remote = server.peer_addr(server_peer).unwrap();
        assert_eq!(remote.host, "127.0.0.1");
    }
}
