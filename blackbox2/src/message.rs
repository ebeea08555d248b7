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

//! The replicated message lane shared by channel and handle entities:
//! field-mask gating of what gets mirrored, the local recorder tap, and
//! inbound message injection.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{error, warn};

use blackbox2_protocol as protocol;
use protocol::{message_fields, Direction, Opcode};

use crate::{recorder::MessageSink, signal::Signal, stub::StubCore};

/// Sink for messages the server injects back into a live channel or
/// handle.
pub type MessageHandler = Arc<dyn Fn(protocol::Message) + Send + Sync>;

pub(crate) fn system_time_micros(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(_) => 0,
    }
}

/// Timestamps riding along with one observed message.
#[derive(Debug, Clone, Default)]
pub struct MessageInfo {
    /// Microseconds since the unix epoch, when the producer stamped one.
    pub gen_timestamp: Option<i64>,
    pub tx_timestamp: Option<SystemTime>,
    pub rx_timestamp: Option<SystemTime>,
}

/// Stub-side lane state, guarded by the owning stub's mutex.
pub(crate) struct MessageLane {
    /// Which message fields the server wants mirrored.
    pub fields: u32,
    pub inject: Option<MessageHandler>,
    pub recorder: Option<Arc<dyn MessageSink>>,
    /// Held while the server has replay running. The player feeds
    /// replayed traffic through the inject handler on its own; the
    /// lane only keeps it alive.
    #[allow(dead_code)]
    pub player: Option<Arc<dyn MessageSink>>,
}

impl MessageLane {
    pub fn new(inject: Option<MessageHandler>) -> MessageLane {
        MessageLane {
            fields: message_fields::DEFAULT,
            inject,
            recorder: None,
            player: None,
        }
    }

    /// Build the wire record for one observed message, honoring the
    /// field mask. The recorder taps the full message first; a mask of
    /// zero then suppresses the mirror entirely.
    pub fn build_outgoing(
        &self,
        dir: Direction,
        payload: &[u8],
        serialize_type: &str,
        info: &MessageInfo,
    ) -> Option<protocol::Message> {
        if let Some(recorder) = &self.recorder {
            if recorder.is_started() {
                recorder.record(&protocol::Message {
                    dir,
                    gen_timestamp: info.gen_timestamp,
                    tx_timestamp: info.tx_timestamp.map(system_time_micros),
                    rx_timestamp: info.rx_timestamp.map(system_time_micros),
                    payload: Some(payload.to_vec()),
                    serialize_type: Some(String::from(serialize_type)),
                });
            }
        }

        if self.fields == 0 {
            return None;
        }
        let mut message = protocol::Message { dir, ..Default::default() };
        if self.fields & message_fields::GEN_TIMESTAMP != 0 {
            message.gen_timestamp = info.gen_timestamp;
        }
        if self.fields & message_fields::TX_TIMESTAMP != 0 {
            message.tx_timestamp = info.tx_timestamp.map(system_time_micros);
        }
        if self.fields & message_fields::RX_TIMESTAMP != 0 {
            message.rx_timestamp = info.rx_timestamp.map(system_time_micros);
        }
        if self.fields & message_fields::PAYLOAD_AND_SERIALIZE_TYPE != 0 {
            message.payload = Some(payload.to_vec());
            message.serialize_type = Some(String::from(serialize_type));
        }
        Some(message)
    }
}

/// Proxy-side lane state.
pub(crate) struct ProxyLane {
    pub fields: u32,
    pub on_message: Signal<protocol::Message>,
}

impl ProxyLane {
    pub fn new() -> ProxyLane {
        ProxyLane { fields: message_fields::DEFAULT, on_message: Signal::new() }
    }
}

/// Mirror one observed message through a channel or handle stub,
/// subject to the field mask and the stub's send gate.
pub(crate) fn stub_send_message(
    core: &Arc<StubCore>,
    dir: Direction,
    payload: &[u8],
    serialize_type: &str,
    info: &MessageInfo,
) -> bool {
    let inner = core.inner.lock().unwrap();
    let Some(lane) = inner.entity.lane() else {
        return false;
    };
    // the recorder tap inside build_outgoing runs even while the stub
    // is unactivated; only the mirror to the server is gated
    let Some(message) = lane.build_outgoing(dir, payload, serialize_type, info) else {
        return false;
    };
    let bytes = match protocol::encode(&message) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("failed to serialize message event: {:?}", err);
            return false;
        }
    };
    core.send_event_locked(&inner, Opcode::Message, &bytes)
}

/// Install the Message and MessageFields event handlers on a channel or
/// handle stub.
pub(crate) fn register_stub_message_handlers(core: &Arc<StubCore>) {
    let weak = Arc::downgrade(core);
    core.register_event_handler(
        Opcode::Message,
        Arc::new(move |payload: &[u8]| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            let message: protocol::Message = match protocol::decode(payload) {
                Ok(message) => message,
                Err(err) => {
                    error!("failed to decode message event: {:?}", err);
                    return;
                }
            };
            // take the handler out under the lock, call it unlocked
            let handler = {
                let inner = core.inner.lock().unwrap();
                inner.entity.lane().and_then(|lane| lane.inject.clone())
            };
            match handler {
                Some(handler) => handler(message),
                None => warn!("no inject message handler"),
            }
        }),
    );

    let weak = Arc::downgrade(core);
    core.register_event_handler(
        Opcode::MessageFields,
        Arc::new(move |payload: &[u8]| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            match protocol::decode::<protocol::MessageFields>(payload) {
                Ok(fields) => {
                    let mut inner = core.inner.lock().unwrap();
                    if let Some(lane) = inner.entity.lane_mut() {
                        lane.fields = fields.has_flags;
                    }
                }
                Err(err) => error!("failed to decode message fields event: {:?}", err),
            }
        }),
    );
}
