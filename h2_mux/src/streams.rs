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

//! Per-stream state and the stream store.

use std::collections::{HashMap, VecDeque};

use h2_frame::{ErrorCode, Frame, FrameFlags, Payload, StreamId};

use crate::completion::Completion;
use crate::handler::StreamHandler;
use crate::window::{RecvWindow, SendWindow};

pub(crate) const DEFAULT_SEND_WINDOW_SIZE: u32 = 65535;

/// Opaque handle to one child stream inside a multiplexer. Keys outlive
/// identifier assignment: a locally-created stream is addressable before its
/// first flush hands it a wire identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey(pub(crate) u64);

/// Which side opened the stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StreamRole {
    Inbound,
    Outbound,
}

//  idle --------(initializer runs)--------> setup-pending
//  setup-pending --(initializer success)--> active
//  setup-pending --(initializer failure)--> closing
//  active -------(END_STREAM sent)--------> half-closed (local)
//  active -------(END_STREAM received)----> half-closed (remote)
//  any ----------(local close)------------> closing
//  any ----------(StreamClosed event)-----> closed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamPhase {
    /// Created, initializer not yet run.
    Idle,
    /// Initializer pending; inbound frames defer, outbound writes are held.
    SetupPending,
    /// Fully operational.
    Active,
    /// END_STREAM left the multiplexer for this stream.
    LocalHalfClosed,
    /// END_STREAM arrived for this stream.
    RemoteHalfClosed,
    /// Shutdown initiated, awaiting the terminal `StreamClosed` event.
    Closing,
    /// Terminal.
    Closed,
}

/// A queued outbound frame awaiting flush (and possibly identifier
/// assignment), together with its write completion.
pub(crate) struct PendingFrame {
    pub(crate) flags: FrameFlags,
    pub(crate) payload: Payload,
    pub(crate) completion: Completion<()>,
}

impl PendingFrame {
    pub(crate) fn data_size(&self) -> usize {
        match &self.payload {
            Payload::Data(data) => data.size(),
            _ => 0,
        }
    }
}

pub(crate) struct Stream {
    pub(crate) id: Option<StreamId>,
    pub(crate) role: StreamRole,
    pub(crate) phase: StreamPhase,
    pub(crate) deferred: VecDeque<Frame>,
    pub(crate) pending_out: VecDeque<PendingFrame>,
    pub(crate) buffered_bytes: usize,
    // Watermark half of the derived writability; edge-triggered with
    // high/low hysteresis.
    pub(crate) below_watermark: bool,
    // Last writability value reported to the handler.
    pub(crate) reported_writable: bool,
    pub(crate) autoread: bool,
    pub(crate) read_pending: bool,
    pub(crate) recv_window: RecvWindow,
    pub(crate) send_window: SendWindow,
    pub(crate) close_completions: Vec<Completion<()>>,
    pub(crate) close_future: Completion<()>,
    pub(crate) setup_completion: Completion<()>,
    pub(crate) setup_done: bool,
    pub(crate) rst_sent: bool,
    // A flush could not release everything; retried on window updates,
    // concurrency slots and setup completion.
    pub(crate) flush_parked: bool,
    pub(crate) remote_ended: bool,
    pub(crate) local_ended: bool,
    pub(crate) in_burst: bool,
    pub(crate) pumping: bool,
    pub(crate) close_reason: Option<ErrorCode>,
    pub(crate) handler: Option<Box<dyn StreamHandler + Send>>,
}

impl Stream {
    fn new(role: StreamRole, id: Option<StreamId>, target_window: u32) -> Self {
        Self {
            id,
            role,
            phase: StreamPhase::Idle,
            deferred: VecDeque::new(),
            pending_out: VecDeque::new(),
            buffered_bytes: 0,
            below_watermark: true,
            reported_writable: true,
            autoread: true,
            read_pending: false,
            recv_window: RecvWindow::new(target_window),
            send_window: SendWindow::new(DEFAULT_SEND_WINDOW_SIZE as i32),
            close_completions: Vec::new(),
            close_future: Completion::new(),
            setup_completion: Completion::new(),
            setup_done: false,
            rst_sent: false,
            flush_parked: false,
            remote_ended: false,
            local_ended: false,
            in_burst: false,
            pumping: false,
            close_reason: None,
            handler: None,
        }
    }

    /// Charges DATA payload bytes against the watermark gauge. Returns true
    /// when the charge flipped the stream over the high watermark.
    pub(crate) fn charge(&mut self, bytes: usize, high: usize) -> bool {
        self.buffered_bytes += bytes;
        if self.below_watermark && self.buffered_bytes > high {
            self.below_watermark = false;
            return true;
        }
        false
    }

    /// Discharges released DATA payload bytes. Returns true when the
    /// discharge brought an unwritable stream back to or below the low
    /// watermark.
    pub(crate) fn discharge(&mut self, bytes: usize, low: usize) -> bool {
        self.buffered_bytes = self.buffered_bytes.saturating_sub(bytes);
        if !self.below_watermark && self.buffered_bytes <= low {
            self.below_watermark = true;
            return true;
        }
        false
    }

    /// The derived writability. Children without an assigned identifier
    /// ignore the parent.
    pub(crate) fn computed_writable(&self, parent_writable: bool) -> bool {
        let parent = if self.id.is_some() {
            parent_writable
        } else {
            true
        };
        parent && self.below_watermark
    }

    /// Whether inbound frames may currently be handed to the handler.
    pub(crate) fn is_delivering(&self) -> bool {
        self.setup_done
            && matches!(
                self.phase,
                StreamPhase::Active | StreamPhase::LocalHalfClosed | StreamPhase::RemoteHalfClosed
            )
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(
            self.phase,
            StreamPhase::Active | StreamPhase::LocalHalfClosed | StreamPhase::RemoteHalfClosed
        )
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        matches!(self.phase, StreamPhase::Closing | StreamPhase::Closed)
    }

    /// Re-derives the half-closed phases from the END_STREAM bookkeeping.
    pub(crate) fn refresh_half_closed(&mut self) {
        match self.phase {
            StreamPhase::Active => {
                if self.remote_ended && !self.local_ended {
                    self.phase = StreamPhase::RemoteHalfClosed;
                } else if self.local_ended && !self.remote_ended {
                    self.phase = StreamPhase::LocalHalfClosed;
                }
            }
            StreamPhase::LocalHalfClosed | StreamPhase::RemoteHalfClosed => {}
            _ => {}
        }
    }
}

/// The `StreamKey → Stream` store plus the wire-identifier index and the
/// concurrency gate for locally-initiated streams.
pub(crate) struct Streams {
    map: HashMap<StreamKey, Stream>,
    ids: HashMap<StreamId, StreamKey>,
    next_key: u64,
    // Highest peer-initiated identifier ever opened; frames below it for an
    // unknown identifier belong to a dead stream, not a new one.
    pub(crate) latest_remote_id: StreamId,
    max_concurrent: u32,
    local_active: u32,
    pending_concurrency: VecDeque<StreamKey>,
}

impl Streams {
    pub(crate) fn new(max_concurrent: u32) -> Self {
        Self {
            map: HashMap::new(),
            ids: HashMap::new(),
            next_key: 1,
            latest_remote_id: 0,
            max_concurrent,
            local_active: 0,
            pending_concurrency: VecDeque::new(),
        }
    }

    fn next_key(&mut self) -> StreamKey {
        let key = StreamKey(self.next_key);
        self.next_key += 1;
        key
    }

    pub(crate) fn insert_inbound(&mut self, id: StreamId, target_window: u32) -> StreamKey {
        let key = self.next_key();
        self.map
            .insert(key, Stream::new(StreamRole::Inbound, Some(id), target_window));
        self.ids.insert(id, key);
        if id > self.latest_remote_id {
            self.latest_remote_id = id;
        }
        key
    }

    pub(crate) fn insert_outbound(&mut self, target_window: u32) -> StreamKey {
        let key = self.next_key();
        self.map
            .insert(key, Stream::new(StreamRole::Outbound, None, target_window));
        key
    }

    pub(crate) fn get(&self, key: StreamKey) -> Option<&Stream> {
        self.map.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: StreamKey) -> Option<&mut Stream> {
        self.map.get_mut(&key)
    }

    pub(crate) fn key_of_id(&self, id: StreamId) -> Option<StreamKey> {
        self.ids.get(&id).copied()
    }

    pub(crate) fn bind_id(&mut self, key: StreamKey, id: StreamId) {
        if let Some(stream) = self.map.get_mut(&key) {
            stream.id = Some(id);
        }
        self.ids.insert(id, key);
    }

    pub(crate) fn unbind_id(&mut self, id: StreamId) {
        self.ids.remove(&id);
    }

    pub(crate) fn remove_slot(&mut self, key: StreamKey) -> Option<Stream> {
        self.map.remove(&key)
    }

    /// Keys of every stream that has not reached `closed`, in creation
    /// order.
    pub(crate) fn unclosed_keys(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self
            .map
            .iter()
            .filter(|(_, s)| s.phase != StreamPhase::Closed)
            .map(|(k, _)| *k)
            .collect();
        keys.sort();
        keys
    }

    pub(crate) fn has_concurrency_slot(&self) -> bool {
        self.local_active < self.max_concurrent && self.pending_concurrency.is_empty()
    }

    pub(crate) fn acquire_concurrency(&mut self) {
        self.local_active += 1;
    }

    pub(crate) fn release_concurrency(&mut self) {
        self.local_active = self.local_active.saturating_sub(1);
    }

    pub(crate) fn park_concurrency(&mut self, key: StreamKey) {
        self.pending_concurrency.push_back(key);
    }

    /// Pops the next parked stream if a slot is free.
    pub(crate) fn next_unparked(&mut self) -> Option<StreamKey> {
        if self.local_active < self.max_concurrent {
            self.pending_concurrency.pop_front()
        } else {
            None
        }
    }
}
