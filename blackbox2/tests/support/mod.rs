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

// not every test binary uses every helper
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU16, Ordering},
    thread,
    time::{Duration, Instant},
};

use blackbox2::{Config, HostAddr, Server, Stat, StatProvider};

/// Every test gets its own fabric port so they can run concurrently.
pub fn next_port() -> u16 {
    static NEXT: AtomicU16 = AtomicU16::new(64100);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub fn addr(port: u16) -> HostAddr {
    HostAddr { host: String::from("127.0.0.1"), port }
}

pub fn client_config(port: u16) -> Config {
    Config { enabled: true, server: addr(port) }
}

/// Spin until `cond` holds, panicking with `what` after five seconds.
/// The fabric delivers quickly; the generous deadline only matters on
/// loaded CI machines.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Hook test output up to tracing. Safe to call repeatedly; only the
/// first call installs a subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn start_server(port: u16) -> Server {
    init_logging();
    let server = Server::new(addr(port));
    server.start().expect("starting test server");
    server
}

/// A provider backed by a fixed key table.
pub struct MapStatProvider {
    stats: HashMap<String, Stat>,
}

impl MapStatProvider {
    pub fn new(entries: Vec<(&str, Stat)>) -> MapStatProvider {
        MapStatProvider {
            stats: entries.into_iter().map(|(k, v)| (String::from(k), v)).collect(),
        }
    }
}

impl StatProvider for MapStatProvider {
    fn get(&self, key: &str) -> Option<Stat> {
        self.stats.get(key).copied()
    }
}
