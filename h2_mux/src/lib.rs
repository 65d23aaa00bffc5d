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

//! `h2_mux` demultiplexes a single framed HTTP/2 connection into a set of
//! independently-managed per-stream child channels, and remultiplexes their
//! outbound writes back onto the connection.
//!
//! The multiplexer consumes typed [`h2_frame::Frame`]s that already carry a
//! stream identifier and emits the same; the byte-level codec, HPACK, TLS
//! and the connection preface all live in the connection layer.
//!
//! -[`StreamMultiplexer`] is the loop-serialized core: inbound router,
//! outbound collector, lifecycle coordinator and stream factory.
//! -[`StreamHandler`] is the per-stream user pipeline installed by an
//! initializer when a stream opens.
//! -[`MuxManager`] drives a [`StreamMultiplexer`] from channels so it can be
//! embedded on a connection task.

mod allocator;
mod completion;
mod config;
mod error;
mod events;
mod handler;
mod multiplexer;
mod streams;
mod window;

#[cfg(any(feature = "tokio_base", feature = "ylong_base"))]
mod manager;

pub use completion::{Completion, CompletionState};
pub use config::{MuxConfig, MuxMode};
pub use error::MuxError;
pub use events::StreamEvent;
pub use handler::{InitState, StreamContext, StreamHandler, StreamInitializer};
#[cfg(any(feature = "tokio_base", feature = "ylong_base"))]
pub use manager::{ConnMessage, ManagerError, MuxManager, MuxRequest};
pub use multiplexer::{IngestOutcome, StreamMultiplexer};
pub use streams::{StreamKey, StreamPhase};

// Runtime components import adapter. The multiplexer core is runtime-free;
// only the channel-driven `MuxManager` needs these.
#[cfg(any(feature = "tokio_base", feature = "ylong_base"))]
pub mod runtime {
    //! Re-exports of the channel primitives of the selected runtime, so that
    //! embedders can wire a [`crate::MuxManager`] without naming the runtime
    //! themselves.

    #[cfg(feature = "tokio_base")]
    pub use tokio::sync::mpsc::{
        channel as bounded_channel, unbounded_channel, Receiver as BoundedReceiver,
        Sender as BoundedSender, UnboundedReceiver, UnboundedSender,
    };
    #[cfg(feature = "ylong_base")]
    pub use ylong_runtime::sync::mpsc::{
        bounded_channel, unbounded_channel, BoundedReceiver, BoundedSender, UnboundedReceiver,
        UnboundedSender,
    };
}
