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

use std::env;

use tracing::{info, warn};

use crate::{consts, host::HostAddr};

/// Runtime configuration for one transport, normally drawn from the
/// environment. An explicit address always wins over the env vars.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether the client role is enabled for this process.
    pub enabled: bool,
    /// Where the blackbox server listens.
    pub server: HostAddr,
}

impl Config {
    pub fn from_env() -> Config {
        let enabled = matches!(env::var(consts::ENABLE_VAR).as_deref(), Ok("1"));
        if enabled {
            info!("blackbox2 is enabled");
        }

        let host = env::var(consts::HOST_VAR)
            .unwrap_or_else(|_| String::from(consts::DEFAULT_HOST));
        let port = match env::var(consts::PORT_VAR) {
            Ok(raw) => match raw.parse::<u16>() {
                Ok(p) => p,
                Err(_) => {
                    warn!("ignoring unparsable {}: '{}'", consts::PORT_VAR, raw);
                    consts::DEFAULT_PORT
                }
            },
            Err(_) => consts::DEFAULT_PORT,
        };

        let server = HostAddr { host, port };
        info!("blackbox2 server: {}:{}", server.host, server.port);
        Config { enabled, server }
    }

    /// Env-derived config with the server address pinned.
    pub fn with_server(addr: HostAddr) -> Config {
        let mut config = Config::from_env();
        config.server = addr;
        config
    }
}
