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

//! Lifecycle events delivered by the connection layer. Events are typed
//! signals distinct from frames; the multiplexer never synthesizes stream
//! closure on its own and instead waits for the matching [`StreamEvent`].

use h2_frame::{ErrorCode, StreamId};

/// Inbound lifecycle signals from the connection layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A stream became known to the connection layer. Seeds the per-stream
    /// window accounting.
    Created {
        /// The stream identifier.
        id: StreamId,
        /// The initial inbound (receive) window for the stream.
        local_window: u32,
        /// The initial outbound (send) window for the stream.
        remote_window: u32,
    },

    /// Terminal event for a stream. Repeated events for an already-closed
    /// identifier are ignored.
    Closed {
        /// The stream identifier.
        id: StreamId,
        /// The reset reason, absent for an orderly end of stream.
        reason: Option<ErrorCode>,
    },

    /// The connection layer observed a change of one or both per-stream
    /// windows. Both sizes absent is a no-op.
    WindowUpdated {
        /// The stream identifier.
        id: StreamId,
        /// The remaining inbound window, if it changed.
        inbound: Option<u32>,
        /// The remaining outbound window, if it changed.
        outbound: Option<u32>,
    },

    /// The parent connection channel flipped its writability.
    WritabilityChanged {
        /// Whether the parent is now writable.
        writable: bool,
    },
}
