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

// "1" enables the client role; anything else leaves it disabled and the
// entity factories return None.
pub const ENABLE_VAR: &str = "SF_MSGBUS_BLACKBOX2_ENABLE";

pub const HOST_VAR: &str = "SF_MSGBUS_BLACKBOX2_HOST";
pub const PORT_VAR: &str = "SF_MSGBUS_BLACKBOX2_PORT";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 17821;

/// How long the backend thread blocks in its readiness wait before
/// re-checking for work on its own.
pub const BACKEND_POLL_MS: u16 = 1000;

// Retransmission discipline applied to every peer, dialed or accepted.
pub const PEER_TIMEOUT_LIMIT: u32 = 3;
pub const PEER_TIMEOUT_MIN_MS: u32 = 1000;
pub const PEER_TIMEOUT_MAX_MS: u32 = 4000;
