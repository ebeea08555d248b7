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

use std::{collections::BTreeMap, io, io::Write};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_derive::{Deserialize, Serialize};

/// The protocol version stamped into every packet header. Peers reject
/// packets carrying anything older.
pub const VERSION: u8 = 3;

/// Size of the fixed packet header on the wire.
pub const HEADER_LEN: usize = 12;

/// The kind of a packet, the second byte of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Event = 0,
    Request = 1,
    Response = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(PacketType::Event),
            1 => Ok(PacketType::Request),
            2 => Ok(PacketType::Response),
            _ => Err(anyhow!("invalid packet type: {}", v)),
        }
    }
}

/// The operation catalog. Values are stable wire identifiers; never
/// renumber an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Opcode {
    Activate = 0,

    AttachProcess = 1,
    AttachChannel = 2,
    AttachExecutor = 3,
    AttachNode = 4,
    AttachHandle = 5,

    Message = 6,
    MessageFields = 7,

    ProcessGetKeyStat = 8,
    ProcessStartLocalPlayer = 9,
    ProcessStopLocalPlayer = 10,
    ProcessStartLocalRecorder = 11,
    ProcessStopLocalRecorder = 12,

    ExecutorAttachNode = 13,
    ExecutorDetachNode = 14,
    ExecutorRunBegin = 15,
    ExecutorRunEnd = 16,
    ExecutorTaskBegin = 17,
    ExecutorTaskEnd = 18,

    NodeAttach = 19,
    NodeDetach = 20,

    HandleEnable = 21,
    HandleDisable = 22,
}

impl TryFrom<u8> for Opcode {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Ok(match v {
            0 => Activate,
            1 => AttachProcess,
            2 => AttachChannel,
            3 => AttachExecutor,
            4 => AttachNode,
            5 => AttachHandle,
            6 => Message,
            7 => MessageFields,
            8 => ProcessGetKeyStat,
            9 => ProcessStartLocalPlayer,
            10 => ProcessStopLocalPlayer,
            11 => ProcessStartLocalRecorder,
            12 => ProcessStopLocalRecorder,
            13 => ExecutorAttachNode,
            14 => ExecutorDetachNode,
            15 => ExecutorRunBegin,
            16 => ExecutorRunEnd,
            17 => ExecutorTaskBegin,
            18 => ExecutorTaskEnd,
            19 => NodeAttach,
            20 => NodeDetach,
            21 => HandleEnable,
            22 => HandleDisable,
            _ => return Err(anyhow!("invalid opcode: {}", v)),
        })
    }
}

/// Result codes carried in the extra_data field of response packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    Unknown = 1,
    InvalidParameter = 2,
    InvalidState = 3,
    Existed = 4,
    NotFound = 5,
    Timeout = 6,
    DeserializeError = 7,
}

impl Status {
    /// Decode a wire value. Values outside the catalog collapse to
    /// `Unknown` rather than failing; the connection stays usable no
    /// matter what a newer peer sends.
    pub fn from_wire(v: u32) -> Status {
        match v {
            0 => Status::Ok,
            1 => Status::Unknown,
            2 => Status::InvalidParameter,
            3 => Status::InvalidState,
            4 => Status::Existed,
            5 => Status::NotFound,
            6 => Status::Timeout,
            7 => Status::DeserializeError,
            _ => Status::Unknown,
        }
    }
}

/// The fixed header that starts every packet.
///
/// Layout on the wire (network byte order for the two u32 fields):
///
/// ```text
/// offset 0  u8  version
/// offset 1  u8  type
/// offset 2  u8  opcode
/// offset 3  u8  pad
/// offset 4  u32 session
/// offset 8  u32 extra_data   (responses: result code)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub packet_type: u8,
    pub opcode: u8,
    pub session: u32,
    pub extra_data: u32,
}

impl Header {
    pub fn encode_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        w.write_u8(self.version)?;
        w.write_u8(self.packet_type)?;
        w.write_u8(self.opcode)?;
        w.write_u8(0)?;
        w.write_u32::<BigEndian>(self.session)?;
        w.write_u32::<BigEndian>(self.extra_data)?;
        Ok(())
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Header> {
        if data.len() < HEADER_LEN {
            return Err(anyhow!("packet too small: {} bytes", data.len()));
        }
        let mut r = data;
        let version = r.read_u8()?;
        let packet_type = r.read_u8()?;
        let opcode = r.read_u8()?;
        let _pad = r.read_u8()?;
        let session = r.read_u32::<BigEndian>()?;
        let extra_data = r.read_u32::<BigEndian>()?;
        Ok(Header { version, packet_type, opcode, session, extra_data })
    }
}

/// The centralized encoding function that should be used for all payload
/// serialization.
pub fn encode<T>(d: &T) -> anyhow::Result<Vec<u8>>
where
    T: Serialize,
{
    // Struct-map encoding keeps the records self describing, so a peer
    // running a newer schema can skip fields it does not know about.
    let mut buf = Vec::new();
    let mut serializer = rmp_serde::Serializer::new(&mut buf).with_struct_map();
    d.serialize(&mut serializer).context("serializing payload")?;
    Ok(buf)
}

/// The centralized decoding function that should be used for all payload
/// deserialization.
pub fn decode<T>(data: &[u8]) -> anyhow::Result<T>
where
    T: DeserializeOwned,
{
    rmp_serde::from_slice(data).context("deserializing payload")
}

/// A server-assigned entity identity. An id of 0 means "unattached";
/// child descriptors reference their parent through one of these.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Instance {
    pub id: u64,
}

/// The thread an entity was created on.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: i32,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Descriptor an instrumented process announces when attaching.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Process {
    pub pid: i32,
    pub name: String,
    pub cmdline: String,
    pub working_directory: String,
    pub environments: String,
    pub config_filename: String,
    /// Microseconds since the unix epoch.
    pub startup_timestamp: i64,
    pub version: VersionInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    In,
    #[default]
    Out,
}

/// Descriptor for a channel attaching under a process.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Channel {
    pub id: String,
    pub kind: String,
    pub dir: Direction,
    pub config: BTreeMap<String, String>,
    pub owner_thread: ThreadInfo,
    pub owner_process: Instance,
}

/// Descriptor for an executor attaching under a process.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Executor {
    pub thread_pool_size: u64,
    pub is_running: bool,
    pub attached_nodes: Vec<String>,
    pub owner_thread: ThreadInfo,
    pub owner_process: Instance,
}

/// Descriptor for a node attaching under a process.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Node {
    pub name: String,
    pub is_attached: bool,
    pub owner_thread: ThreadInfo,
    pub owner_process: Instance,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandleKind {
    #[default]
    Unknown,
    Reader,
    Writer,
    Client,
    Server,
}

/// Descriptor for an I/O handle attaching under a node.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Handle {
    pub key: String,
    pub kind: HandleKind,
    pub is_enabled: bool,
    pub mapping_channels: BTreeMap<String, String>,
    pub owner_thread: ThreadInfo,
    pub owner_node: Instance,
}

/// One task span inside an executor run.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExecutorTask {
    pub task_id: i32,
    pub thread: ThreadInfo,
}

/// The payload of every successful attach response.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
pub struct AttachResponse {
    pub is_activated: bool,
    pub instance: Instance,
}

/// One observed message, mirrored between a stub and its proxy. Which
/// fields are populated is governed by the message field mask.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Message {
    pub dir: Direction,
    /// Microseconds since the unix epoch, when present.
    pub gen_timestamp: Option<i64>,
    pub tx_timestamp: Option<i64>,
    pub rx_timestamp: Option<i64>,
    pub payload: Option<Vec<u8>>,
    pub serialize_type: Option<String>,
}

/// Mask of message fields a proxy wants mirrored.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFields {
    pub has_flags: u32,
}

pub mod message_fields {
    pub const GEN_TIMESTAMP: u32 = 1 << 0;
    pub const TX_TIMESTAMP: u32 = 1 << 1;
    pub const RX_TIMESTAMP: u32 = 1 << 2;
    pub const PAYLOAD_AND_SERIALIZE_TYPE: u32 = 1 << 3;

    /// Timestamps only. Mirroring payload bytes is opt-in since it can
    /// multiply the traffic the fabric itself generates.
    pub const DEFAULT: u32 = GEN_TIMESTAMP | TX_TIMESTAMP | RX_TIMESTAMP;
}

/// Per-key traffic statistics, the answer to a ProcessGetKeyStat request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyStat {
    pub valid: bool,
    pub rx_bytes: u64,
    pub rx_length_errors: u64,
    pub rx_multicast: u64,
    pub rx_no_buffer: u64,
    pub rx_no_reader: u64,
    pub rx_packets: u64,
    pub rx_subscriber: u64,
    pub rx_unsubscriber: u64,
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
