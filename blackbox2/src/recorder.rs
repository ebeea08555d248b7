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

use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use tracing::trace;

use blackbox2_protocol as protocol;

/// The seam for local message capture and replay. The server drives
/// these through the ProcessStartLocalRecorder/Player control events;
/// an on-disk implementation plugs in here.
pub trait MessageSink: Send + Sync {
    fn start(&self, path: Option<&Path>) -> bool;
    fn stop(&self);
    fn is_started(&self) -> bool;
    /// Hand one observed message to the sink. Returns false when the
    /// sink is not running.
    fn record(&self, message: &protocol::Message) -> bool;
}

/// Local capture integration point. Tracks its running state; actual
/// persistence belongs to the embedding message bus.
#[derive(Debug, Default)]
pub struct LocalRecorder {
    started: AtomicBool,
}

impl LocalRecorder {
    pub fn new() -> LocalRecorder {
        LocalRecorder { started: AtomicBool::new(false) }
    }
}

impl MessageSink for LocalRecorder {
    fn start(&self, _path: Option<&Path>) -> bool {
        self.started.store(true, Ordering::SeqCst);
        true
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn record(&self, message: &protocol::Message) -> bool {
        if !self.is_started() {
            return false;
        }
        trace!(
            "recorder tap: dir {:?}, {} payload bytes",
            message.dir,
            message.payload.as_ref().map(Vec::len).unwrap_or(0)
        );
        true
    }
}

/// Local replay integration point.
#[derive(Debug, Default)]
pub struct LocalPlayer {
    started: AtomicBool,
}

impl LocalPlayer {
    pub fn new() -> LocalPlayer {
        LocalPlayer { started: AtomicBool::new(false) }
    }
}

impl MessageSink for LocalPlayer {
    fn start(&self, _path: Option<&Path>) -> bool {
        self.started.store(true, Ordering::SeqCst);
        true
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn record(&self, _message: &protocol::Message) -> bool {
        false
    }
}
