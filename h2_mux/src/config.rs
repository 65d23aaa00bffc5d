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

//! Multiplexer configure module.

const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;
const DEFAULT_LOW_WATERMARK: usize = 32 * 1024;
const DEFAULT_TARGET_WINDOW_SIZE: u32 = 65535;
const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// The role this endpoint plays on the connection. It decides the parity of
/// locally-initiated stream identifiers and which inbound parity may open
/// new streams.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MuxMode {
    /// Locally-initiated streams use odd identifiers starting at 1.
    Client,
    /// Locally-initiated streams use even identifiers starting at 2.
    Server,
}

/// Options which can be used to configure a stream multiplexer. This is a
/// closed set; there is no dynamic key-value option surface.
#[derive(Clone)]
pub struct MuxConfig {
    high_watermark: usize,
    low_watermark: usize,
    target_window_size: u32,
    max_concurrent_streams: u32,
}

impl MuxConfig {
    /// `MuxConfig` constructor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the buffered-bytes level above which a child stream stops
    /// reporting itself writable.
    pub fn set_high_watermark(&mut self, bytes: usize) {
        self.high_watermark = bytes;
    }

    /// Sets the buffered-bytes level at or below which an unwritable child
    /// stream becomes writable again after a flush.
    pub fn set_low_watermark(&mut self, bytes: usize) {
        self.low_watermark = bytes;
    }

    /// Sets the inbound window size the multiplexer tries to keep open per
    /// stream with WINDOW_UPDATE frames.
    pub fn set_target_window_size(&mut self, size: u32) {
        self.target_window_size = size;
    }

    /// Sets the cap on concurrently open locally-initiated streams. Streams
    /// flushed past the cap wait for a slot before anything is released.
    pub fn set_max_concurrent_streams(&mut self, num: u32) {
        self.max_concurrent_streams = num;
    }

    /// Gets the high watermark.
    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    /// Gets the low watermark.
    pub fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    /// Gets the target inbound window size.
    pub fn target_window_size(&self) -> u32 {
        self.target_window_size
    }

    /// Gets the cap on concurrently open locally-initiated streams.
    pub fn max_concurrent_streams(&self) -> u32 {
        self.max_concurrent_streams
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
            target_window_size: DEFAULT_TARGET_WINDOW_SIZE,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
        }
    }
}
