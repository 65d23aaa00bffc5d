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

//! `h2_frame` provides the typed [`HTTP/2`] frame model used by the stream
//! multiplexer. Frames enter and leave the multiplexer already parsed; the
//! byte-level codec lives in the connection layer and is not part of this
//! crate.
//!
//! -[`Frame`] is the fundamental unit exchanged with the connection layer.
//! -[`Payload`] distinguishes the frame types the multiplexer understands.
//! -[`ErrorCode`] and [`H2Error`] carry the RFC 9113 error vocabulary.
//!
//! [`HTTP/2`]: https://httpwg.org/specs/rfc9113.html

mod error;
mod frame;

pub use error::{ErrorCode, H2Error};
pub use frame::{
    Data, Frame, FrameFlags, FrameType, Goaway, Headers, Payload, Ping, Priority, RstStream,
    Setting, Settings, SettingsBuilder, StreamId, WindowUpdate,
};
