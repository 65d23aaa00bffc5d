// Copyright (c) 2023 Huawei Device Co., Ltd.
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

//! Per-stream send and recv window definition.

use h2_frame::{ErrorCode, Frame, FrameFlags, H2Error, Payload, StreamId, WindowUpdate};

pub(crate) const MAX_FLOW_CONTROL_WINDOW: u32 = (1 << 31) - 1;

/// The outbound window the peer grants us for one stream. Only the size
/// visible locally is retained; it shrinks as DATA leaves the multiplexer
/// and grows on window updates from the connection layer.
pub(crate) struct SendWindow {
    size: i32,
}

impl SendWindow {
    pub(crate) fn new(size: i32) -> Self {
        Self { size }
    }

    pub(crate) fn size_available(&self) -> u32 {
        if self.size < 0 {
            0
        } else {
            self.size as u32
        }
    }

    pub(crate) fn set_size(&mut self, size: u32) -> Result<(), H2Error> {
        if size > MAX_FLOW_CONTROL_WINDOW {
            return Err(H2Error::ConnectionError(ErrorCode::FlowControlError));
        }
        self.size = size as i32;
        Ok(())
    }

    pub(crate) fn send_data(&mut self, size: u32) {
        self.size -= size as i32;
    }
}

/// The inbound window for one stream, compared against the configured
/// target. The connection layer reports the remaining window through
/// lifecycle events; once it drops to half the target or less, the
/// multiplexer tops it back up with a WINDOW_UPDATE.
pub(crate) struct RecvWindow {
    target: i32,
    current: i32,
}

impl RecvWindow {
    pub(crate) fn new(target: u32) -> Self {
        Self {
            target: target as i32,
            current: target as i32,
        }
    }

    pub(crate) fn set_current(&mut self, size: u32) {
        self.current = size as i32;
    }

    pub(crate) fn current(&self) -> i32 {
        self.current
    }

    /// Returns the WINDOW_UPDATE frame restoring the window to its target,
    /// if the remaining window has dropped to `target / 2` or less.
    pub(crate) fn check_window_update(&mut self, id: StreamId) -> Option<Frame> {
        if self.current > self.target / 2 {
            return None;
        }
        let increment = (self.target - self.current) as u32;
        self.current = self.target;
        let window_update = WindowUpdate::new(increment);
        Some(Frame::new(
            id,
            FrameFlags::new(0),
            Payload::WindowUpdate(window_update),
        ))
    }
}
