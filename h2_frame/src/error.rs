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

//! The HTTP/2 error vocabulary: the 32-bit codes RST_STREAM and GOAWAY
//! frames carry to say why a stream or a connection ended, plus the
//! stream/connection scoping the multiplexer attaches to them. Codes and
//! numeric values are fixed by [RFC 9113 §7]; a code outside that table is
//! itself a protocol error.
//!
//! [RFC 9113 §7]: https://httpwg.org/specs/rfc9113.html#ErrorCodes

use std::fmt;

use crate::frame::StreamId;

/// An HTTP/2 error together with its blast radius: a single stream, or the
/// whole connection. The multiplexer only ever originates stream-scoped
/// errors; connection-scoped ones reach it from the connection layer.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum H2Error {
    /// Only the carried stream is affected; the connection lives on.
    StreamError(StreamId, ErrorCode),

    /// The whole connection is poisoned.
    ConnectionError(ErrorCode),
}

/// The RFC 9113 error codes.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ErrorCode {
    /// Not actually an error. GOAWAY carries it for a graceful shutdown;
    /// RST_STREAM carries it when a stream simply ran to completion.
    NoError = 0x00,

    /// A protocol violation with no more precise code available.
    ProtocolError = 0x01,

    /// The sender tripped over an unexpected condition of its own.
    InternalError = 0x02,

    /// A flow-control limit was not respected.
    FlowControlError = 0x03,

    /// A SETTINGS frame went unacknowledged for too long.
    SettingsTimeout = 0x04,

    /// A frame arrived on a stream already half-closed in that direction.
    StreamClosed = 0x05,

    /// A frame length violated the negotiated limits.
    FrameSizeError = 0x06,

    /// The stream was turned away before any application processing; safe
    /// for the initiator to retry elsewhere.
    RefusedStream = 0x07,

    /// The stream is no longer wanted. This is the code the multiplexer
    /// puts in every RST_STREAM it synthesizes for a local close or a
    /// failed stream setup.
    Cancel = 0x08,

    /// The shared header-compression state can no longer be maintained.
    CompressionError = 0x09,

    /// The tunnel behind a CONNECT request was reset or dropped.
    ConnectError = 0x0a,

    /// The sender considers its peer to be generating excessive load.
    EnhanceYourCalm = 0x0b,

    /// The transport underneath does not meet security requirements.
    InadequateSecurity = 0x0c,

    /// The sender insists on HTTP/1.1 for this request.
    Http1_1Required = 0x0d,
}

impl ErrorCode {
    /// The 32-bit value carried on the wire.
    pub fn into_code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = H2Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        // The code space is contiguous, so the wire value indexes it.
        const CODES: [ErrorCode; 14] = [
            ErrorCode::NoError,
            ErrorCode::ProtocolError,
            ErrorCode::InternalError,
            ErrorCode::FlowControlError,
            ErrorCode::SettingsTimeout,
            ErrorCode::StreamClosed,
            ErrorCode::FrameSizeError,
            ErrorCode::RefusedStream,
            ErrorCode::Cancel,
            ErrorCode::CompressionError,
            ErrorCode::ConnectError,
            ErrorCode::EnhanceYourCalm,
            ErrorCode::InadequateSecurity,
            ErrorCode::Http1_1Required,
        ];
        CODES
            .get(value as usize)
            .copied()
            .ok_or(H2Error::ConnectionError(ErrorCode::ProtocolError))
    }
}

impl fmt::Display for H2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            H2Error::StreamError(id, code) => {
                write!(f, "stream {id} error: {:?}", code)
            }
            H2Error::ConnectionError(code) => write!(f, "connection error: {:?}", code),
        }
    }
}

impl std::error::Error for H2Error {}

#[cfg(test)]
mod ut_h2_error {
    use super::*;

    /// UT test case for the code/value round trip.
    ///
    /// # Brief
    /// 1. Walks the whole contiguous code space and converts each value.
    /// 2. Checks every conversion succeeds and survives the round trip
    ///    through `into_code`.
    /// 3. Converts the first value past the table and checks it is
    ///    rejected as a connection-level protocol error.
    #[test]
    fn ut_error_code_try_from() {
        for i in 0x00..=0x0d {
            let error_code = ErrorCode::try_from(i);
            assert!(error_code.is_ok());
            assert_eq!(error_code.unwrap().into_code(), i);
        }

        assert_eq!(
            ErrorCode::try_from(0x0e),
            Err(H2Error::ConnectionError(ErrorCode::ProtocolError))
        );
    }

    /// UT test case for `H2Error` display.
    ///
    /// # Brief
    /// 1. Formats a stream-scoped and a connection-scoped error.
    /// 2. Checks the rendered text names the scope.
    #[test]
    fn ut_h2_error_display() {
        let err = H2Error::StreamError(1, ErrorCode::Cancel);
        assert_eq!(format!("{err}"), "stream 1 error: Cancel");
        let err = H2Error::ConnectionError(ErrorCode::ProtocolError);
        assert_eq!(format!("{err}"), "connection error: ProtocolError");
    }
}
