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

//! The child-channel user surface: per-stream handlers, the context they
//! operate through, and stream initializers.

use h2_frame::{Frame, FrameFlags, Payload, StreamId};

use crate::completion::Completion;
use crate::error::MuxError;
use crate::multiplexer::StreamMultiplexer;
use crate::streams::StreamKey;

/// The per-stream pipeline installed when a stream's initializer completes.
/// All callbacks run on the connection loop; re-entrant operations on the
/// own stream go through the provided [`StreamContext`].
pub trait StreamHandler {
    /// One inbound frame reached this stream.
    fn frame_received(&mut self, ctx: &mut StreamContext<'_>, frame: Frame);

    /// The read burst that delivered at least one frame to this stream
    /// ended, or an explicit `read` drained the deferral queue.
    fn read_complete(&mut self, _ctx: &mut StreamContext<'_>) {}

    /// A stream-scoped error was fired into the pipeline, e.g. a remote
    /// reset reported by the terminal `StreamClosed` event.
    fn error_received(&mut self, _ctx: &mut StreamContext<'_>, _error: MuxError) {}

    /// The derived writability of this stream flipped.
    fn writability_changed(&mut self, _ctx: &mut StreamContext<'_>, _writable: bool) {}

    /// The stream reached `closed` and the handler is being removed. Runs
    /// on the loop iteration after the terminal event.
    fn handler_removed(&mut self) {}
}

/// What a stream initializer produced.
pub enum InitState {
    /// Setup finished; install the handler and go active.
    Ready(Box<dyn StreamHandler + Send>),
    /// Setup continues elsewhere; the stream stays in `setup-pending` and
    /// defers inbound frames until
    /// [`StreamMultiplexer::complete_setup`] is called.
    Pending,
}

/// User-supplied stream setup. Runs once per stream, before any frame is
/// delivered; outbound writes issued here are held until the stream goes
/// active.
pub type StreamInitializer =
    Box<dyn FnMut(&mut StreamContext<'_>) -> Result<InitState, MuxError> + Send>;

/// Borrowed operation surface for one stream, handed to initializers and
/// handler callbacks.
pub struct StreamContext<'a> {
    key: StreamKey,
    mux: &'a mut StreamMultiplexer,
}

impl<'a> StreamContext<'a> {
    pub(crate) fn new(key: StreamKey, mux: &'a mut StreamMultiplexer) -> Self {
        Self { key, mux }
    }

    /// The key of the stream this context operates on.
    pub fn key(&self) -> StreamKey {
        self.key
    }

    /// Reads the `stream_id` option; fails with `NoStreamIdAvailable` before
    /// the first flush of a locally-created stream.
    pub fn stream_id(&self) -> Result<StreamId, MuxError> {
        self.mux.stream_id(self.key)
    }

    /// Enqueues one outbound frame on this stream.
    pub fn write(&mut self, flags: FrameFlags, payload: Payload) -> Result<Completion<()>, MuxError> {
        self.mux.write(self.key, flags, payload)
    }

    /// Releases queued writes towards the connection.
    pub fn flush(&mut self) -> Result<(), MuxError> {
        self.mux.flush(self.key)
    }

    /// Requests one deferred inbound frame, or a read from the parent.
    pub fn read(&mut self) -> Result<(), MuxError> {
        self.mux.read(self.key)
    }

    /// Initiates shutdown of this stream.
    pub fn close(&mut self) -> Result<Completion<()>, MuxError> {
        self.mux.close(self.key)
    }

    /// Sets the `autoread` option.
    pub fn set_autoread(&mut self, autoread: bool) -> Result<(), MuxError> {
        self.mux.set_autoread(self.key, autoread)
    }

    /// Gets the `autoread` option.
    pub fn autoread(&self) -> Result<bool, MuxError> {
        self.mux.autoread(self.key)
    }

    /// The derived writability of this stream.
    pub fn is_writable(&self) -> bool {
        self.mux.is_writable(self.key)
    }

    /// Whether the stream is currently active.
    pub fn is_active(&self) -> bool {
        self.mux.is_active(self.key)
    }
}
