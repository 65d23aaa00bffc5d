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

//! Errors surfaced by the stream multiplexer.

use std::fmt;

use h2_frame::{ErrorCode, H2Error, StreamId};

/// Errors produced by multiplexer operations. Local policy violations are
/// returned on the caller's `Result` or completion and are never fired into
/// a child pipeline; stream-scoped protocol errors travel both ways.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// An inbound frame addressed a stream identifier that is unknown or
    /// already closed. Surfaced on the connection inbound path; the stream
    /// is never opened implicitly.
    NoSuchStream(StreamId),

    /// A write addressed a closed stream, or a close promise failed because
    /// the stream was reset with the carried error code.
    StreamClosed(StreamId, ErrorCode),

    /// The `stream_id` option was read on a locally-created stream before
    /// its first flush assigned one.
    NoStreamIdAvailable,

    /// An operation addressed a child whose handlers have already been torn
    /// down.
    IoOnClosedChannel,

    /// Unflushed writes were discarded by a close that carried no error.
    Eof,

    /// A new locally-initiated stream was requested after the peer sent
    /// GOAWAY.
    GoingAway,

    /// The local stream identifier space is exhausted.
    StreamIdExhausted,

    /// A connection-level HTTP/2 error, e.g. a flow-control window overflow.
    Connection(H2Error),

    /// A caller-supplied failure, typically out of a stream initializer.
    Other(&'static str),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::NoSuchStream(id) => write!(f, "no such stream: {id}"),
            MuxError::StreamClosed(id, code) => {
                write!(f, "stream {id} closed: {:?}", code)
            }
            MuxError::NoStreamIdAvailable => write!(f, "no stream id assigned yet"),
            MuxError::IoOnClosedChannel => write!(f, "operation on closed channel"),
            MuxError::Eof => write!(f, "eof"),
            MuxError::GoingAway => write!(f, "connection is going away"),
            MuxError::StreamIdExhausted => write!(f, "stream id space exhausted"),
            MuxError::Connection(e) => write!(f, "{e}"),
            MuxError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for MuxError {}

impl From<H2Error> for MuxError {
    fn from(err: H2Error) -> Self {
        MuxError::Connection(err)
    }
}
