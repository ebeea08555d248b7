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

use blackbox2_protocol::KeyStat;

/// Receive-side counters of one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStat {
    pub rx_bytes: u64,
    pub rx_length_errors: u64,
    pub rx_multicast: u64,
    pub rx_no_buffer: u64,
    pub rx_no_reader: u64,
    pub rx_packets: u64,
    pub rx_subscriber: u64,
    pub rx_unsubscriber: u64,
}

/// Transmit-side counters of one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStat {
    pub tx_bytes: u64,
    pub tx_length_errors: u64,
    pub tx_multicast: u64,
    pub tx_no_buffer: u64,
    pub tx_no_channel: u64,
    pub tx_no_endpoint: u64,
    pub tx_no_subscriber: u64,
    pub tx_no_transmit: u64,
    pub tx_packets: u64,
    pub tx_subscriber: u64,
    pub tx_unsubscriber: u64,
}

/// Traffic statistics of one key, as tracked by the message bus inside
/// an instrumented process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub rx: RxStat,
    pub tx: TxStat,
}

impl Stat {
    pub fn to_wire(&self) -> KeyStat {
        KeyStat {
            valid: true,
            rx_bytes: self.rx.rx_bytes,
            rx_length_errors: self.rx.rx_length_errors,
            rx_multicast: self.rx.rx_multicast,
            rx_no_buffer: self.rx.rx_no_buffer,
            rx_no_reader: self.rx.rx_no_reader,
            rx_packets: self.rx.rx_packets,
            rx_subscriber: self.rx.rx_subscriber,
            rx_unsubscriber: self.rx.rx_unsubscriber,
            tx_bytes: self.tx.tx_bytes,
            tx_length_errors: self.tx.tx_length_errors,
            tx_multicast: self.tx.tx_multicast,
            tx_no_buffer: self.tx.tx_no_buffer,
            tx_no_channel: self.tx.tx_no_channel,
            tx_no_endpoint: self.tx.tx_no_endpoint,
            tx_no_subscriber: self.tx.tx_no_subscriber,
            tx_no_transmit: self.tx.tx_no_transmit,
            tx_packets: self.tx.tx_packets,
            tx_subscriber: self.tx.tx_subscriber,
            tx_unsubscriber: self.tx.tx_unsubscriber,
        }
    }

    pub fn from_wire(wire: &KeyStat) -> Stat {
        Stat {
            rx: RxStat {
                rx_bytes: wire.rx_bytes,
                rx_length_errors: wire.rx_length_errors,
                rx_multicast: wire.rx_multicast,
                rx_no_buffer: wire.rx_no_buffer,
                rx_no_reader: wire.rx_no_reader,
                rx_packets: wire.rx_packets,
                rx_subscriber: wire.rx_subscriber,
                rx_unsubscriber: wire.rx_unsubscriber,
            },
            tx: TxStat {
                tx_bytes: wire.tx_bytes,
                tx_length_errors: wire.tx_length_errors,
                tx_multicast: wire.tx_multicast,
                tx_no_buffer: wire.tx_no_buffer,
                tx_no_channel: wire.tx_no_channel,
                tx_no_endpoint: wire.tx_no_endpoint,
                tx_no_subscriber: wire.tx_no_subscriber,
                tx_no_transmit: wire.tx_no_transmit,
                tx_packets: wire.tx_packets,
                tx_subscriber: wire.tx_subscriber,
                tx_unsubscriber: wire.tx_unsubscriber,
            },
        }
    }
}

/// Where the client role looks up per-key statistics when the server
/// asks. The message bus plugs its own tracker in here.
pub trait StatProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<Stat>;
}

/// A provider with no keys, for processes that do not track traffic.
#[derive(Debug, Default)]
pub struct NullStatProvider;

impl StatProvider for NullStatProvider {
    fn get(&self, _key: &str) -> Option<Stat> {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let stat = Stat {
            rx: RxStat { rx_bytes: 7, rx_packets: 2, ..Default::default() },
            tx: TxStat { tx_bytes: 11, tx_no_channel: 1, ..Default::default() },
        };
        let wire = stat.to_wire();
        assert!(wire.valid);
        assert_eq!(Stat::from_wire(&wire), stat);
    }
}
