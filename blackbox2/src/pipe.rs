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

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use anyhow::Context;
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    unistd,
};
use tracing::error;

/// Idle command, used to interrupt the backend's readiness wait so it
/// re-reads its state.
pub const CMD_WAKEUP: u8 = b'w';
/// Tells the backend thread to exit its loop.
pub const CMD_EXIT: u8 = b'x';

/// The kernel-backed byte channel used to interrupt the backend thread's
/// readiness wait from any thread. The read end lands in the same poll
/// set as the host socket; one byte carries one command.
///
/// Commands are idempotent in effect, so there is no backpressure
/// handling: a pile of wakeup bytes just spins the backend loop a few
/// extra times.
#[derive(Debug, Default)]
pub struct WakePipe {
    // (read end, write end)
    ends: Option<(OwnedFd, OwnedFd)>,
}

impl WakePipe {
    pub fn new() -> WakePipe {
        WakePipe { ends: None }
    }

    pub fn open(&mut self) -> anyhow::Result<()> {
        self.close();
        let (read_end, write_end) = unistd::pipe().context("creating wake pipe")?;
        // A non-blocking read end lets the backend drain commands
        // opportunistically between dispatches, so an exit command gets
        // through even when host traffic never lets the loop go idle.
        fcntl(&read_end, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .context("making wake pipe non-blocking")?;
        self.ends = Some((read_end, write_end));
        Ok(())
    }

    pub fn close(&mut self) {
        // OwnedFd closes on drop
        self.ends = None;
    }

    pub fn is_open(&self) -> bool {
        self.ends.is_some()
    }

    /// The pollable read end. None when the pipe is closed.
    pub fn read_fd(&self) -> Option<BorrowedFd<'_>> {
        self.ends.as_ref().map(|(r, _)| r.as_fd())
    }

    /// Pull one command byte off the pipe, or None when no command is
    /// pending.
    pub fn read_byte(&self) -> Option<u8> {
        let (r, _) = self.ends.as_ref()?;
        let mut buf = [0u8; 1];
        match unistd::read(r, &mut buf) {
            Ok(1) => Some(buf[0]),
            Ok(_) => None,
            Err(Errno::EAGAIN) => None,
            Err(errno) => {
                error!("reading wake pipe: {}", errno);
                None
            }
        }
    }

    /// Push one command byte. Single-byte writes are atomic with respect
    /// to the backend's single-byte reads.
    pub fn write_byte(&self, cmd: u8) -> bool {
        let Some((_, w)) = self.ends.as_ref() else {
            return false;
        };
        match unistd::write(w, &[cmd]) {
            Ok(1) => true,
            Ok(_) => false,
            Err(errno) => {
                error!("writing wake pipe: {}", errno);
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_close() {
        let mut pipe = WakePipe::new();
        assert!(!pipe.is_open());
        pipe.open().unwrap();
        assert!(pipe.is_open());
        assert!(pipe.read_fd().is_some());
        pipe.close();
        assert!(!pipe.is_open());
        assert!(pipe.read_fd().is_none());
    }

    #[test]
    fn commands_round_trip_in_order() {
        let mut pipe = WakePipe::new();
        pipe.open().unwrap();
        assert!(pipe.write_byte(CMD_WAKEUP));
        assert!(pipe.write_byte(CMD_EXIT));
        assert_eq!(pipe.read_byte(), Some(CMD_WAKEUP));
        assert_eq!(pipe.read_byte(), Some(CMD_EXIT));
    }

    #[test]
    fn write_on_closed_pipe_reports_failure() {
        let pipe = WakePipe::new();
        assert!(!pipe.write_byte(CMD_WAKEUP));
    }

    #[test]
    fn reopen_replaces_ends() {
        let mut pipe = WakePipe::new();
        pipe.open().unwrap();
        assert!(pipe.write_byte(CMD_WAKEUP));
        pipe.open().unwrap();
        // the old command went down with the old pipe
        assert!(pipe.write_byte(CMD_EXIT));
        assert_eq!(pipe.read_byte(), Some(CMD_EXIT));
    }
}
