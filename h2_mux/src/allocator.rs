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

//! Local stream identifier allocation.

use h2_frame::StreamId;

use crate::config::MuxMode;
use crate::error::MuxError;

const MAX_ASSIGNABLE_STREAM_ID: StreamId = u32::MAX >> 1;

/// Hands out locally-initiated stream identifiers: odd for a client, even
/// for a server, increasing by two. Identifiers are requested lazily, at the
/// moment a stream's first flushed frame is about to leave the multiplexer,
/// so release order decides identifier order.
pub(crate) struct StreamIdAllocator {
    next: StreamId,
}

impl StreamIdAllocator {
    pub(crate) fn new(mode: MuxMode) -> Self {
        let next = match mode {
            MuxMode::Client => 1,
            MuxMode::Server => 2,
        };
        Self { next }
    }

    pub(crate) fn generate_id(&mut self) -> Result<StreamId, MuxError> {
        let id = self.next;
        if id < MAX_ASSIGNABLE_STREAM_ID {
            self.next += 2;
            Ok(id)
        } else {
            Err(MuxError::StreamIdExhausted)
        }
    }
}

/// Whether `id` carries the parity the peer uses for streams it initiates.
pub(crate) fn is_peer_initiated(mode: MuxMode, id: StreamId) -> bool {
    match mode {
        MuxMode::Client => id % 2 == 0,
        MuxMode::Server => id % 2 == 1,
    }
}
