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

//! The stream multiplexer core.
//!
//! A module that routes inbound frames of one HTTP/2 connection to child
//! streams and collects their outbound writes back onto the connection.
//!
//! -[`StreamMultiplexer`] is the loop-serialized state machine combining the
//! inbound router, the outbound collector, the lifecycle coordinator and
//! the stream factory.
//! -[`IngestOutcome`] distinguishes routed frames from connection-level
//! frames that pass through the multiplexer untouched.

use std::collections::VecDeque;
use std::mem;

use h2_frame::{ErrorCode, Frame, FrameFlags, Payload, RstStream, StreamId};
use tracing::{debug, trace, warn};

use crate::allocator::{is_peer_initiated, StreamIdAllocator};
use crate::completion::Completion;
use crate::config::{MuxConfig, MuxMode};
use crate::error::MuxError;
use crate::events::StreamEvent;
use crate::handler::{InitState, StreamContext, StreamHandler, StreamInitializer};
use crate::streams::{PendingFrame, StreamKey, StreamPhase, StreamRole, Streams};
use crate::window::RecvWindow;

/// What `ingest` did with a frame.
pub enum IngestOutcome {
    /// The frame was routed to (or opened) a child stream.
    Routed,
    /// A connection-level or PRIORITY frame; forward it to the next inbound
    /// stage unchanged.
    Passthrough(Frame),
}

enum Task {
    Teardown(StreamKey),
}

enum FlushGate {
    Skip,
    NeedsId,
    Ready,
}

enum CloseAction {
    EmitRst(StreamId),
    AwaitEvent,
    CloseNow,
}

/// The HTTP/2 stream multiplexer. Consumes typed frames and lifecycle
/// events from the connection layer, demultiplexes them into per-stream
/// child channels, and remultiplexes child writes into an outbound frame
/// queue the connection layer drains.
///
/// All operations must run on the connection's event loop; the multiplexer
/// performs no locking of its own.
pub struct StreamMultiplexer {
    mode: MuxMode,
    config: MuxConfig,
    streams: Streams,
    allocator: StreamIdAllocator,
    inbound_init: StreamInitializer,
    // Frames released towards the connection, in release order.
    outbound: VecDeque<Frame>,
    conn_flushes: usize,
    parent_writable: bool,
    in_read_burst: bool,
    burst_children: Vec<StreamKey>,
    burst_child_flushed: bool,
    read_requested: bool,
    tasks: VecDeque<Task>,
    goaway: Option<StreamId>,
}

impl StreamMultiplexer {
    /// Creates a multiplexer for one connection. `inbound_init` runs once
    /// for every peer-initiated stream before any frame is delivered to it.
    pub fn new(mode: MuxMode, config: MuxConfig, inbound_init: StreamInitializer) -> Self {
        Self {
            mode,
            streams: Streams::new(config.max_concurrent_streams()),
            allocator: StreamIdAllocator::new(mode),
            inbound_init,
            outbound: VecDeque::new(),
            conn_flushes: 0,
            parent_writable: true,
            in_read_burst: false,
            burst_children: Vec::new(),
            burst_child_flushed: false,
            read_requested: false,
            tasks: VecDeque::new(),
            goaway: None,
            config,
        }
    }

    // ------------------------------------------------------------------
    // Inbound router.
    // ------------------------------------------------------------------

    /// Routes one inbound frame. Connection-level frames (stream 0) and
    /// PRIORITY frames pass through untouched; HEADERS with the peer's
    /// parity for a fresh identifier opens a stream; frames for unknown or
    /// dead identifiers fail with `NoSuchStream` and never open one.
    pub fn ingest(&mut self, frame: Frame) -> Result<IngestOutcome, MuxError> {
        self.in_read_burst = true;

        if let Payload::Priority(_) = frame.payload() {
            return Ok(IngestOutcome::Passthrough(frame));
        }
        let id = frame.stream_id();
        if id == 0 {
            if let Payload::Goaway(goaway) = frame.payload() {
                debug!(
                    last_stream_id = goaway.last_stream_id(),
                    "peer going away"
                );
                self.goaway = Some(goaway.last_stream_id());
            }
            return Ok(IngestOutcome::Passthrough(frame));
        }

        if let Some(key) = self.streams.key_of_id(id) {
            self.route_frame(key, frame);
            return Ok(IngestOutcome::Routed);
        }

        let opens = matches!(frame.payload(), Payload::Headers(_))
            && is_peer_initiated(self.mode, id)
            && id > self.streams.latest_remote_id;
        if opens {
            self.open_inbound_stream(id, frame);
            return Ok(IngestOutcome::Routed);
        }

        warn!(id, "frame for unknown or closed stream");
        Err(MuxError::NoSuchStream(id))
    }

    fn route_frame(&mut self, key: StreamKey, frame: Frame) {
        let pump = {
            let stream = match self.streams.get_mut(key) {
                Some(stream) => stream,
                None => return,
            };
            if stream.phase == StreamPhase::Closed {
                return;
            }
            if frame.flags().is_end_stream()
                && matches!(frame.payload(), Payload::Headers(_) | Payload::Data(_))
            {
                stream.remote_ended = true;
                stream.refresh_half_closed();
            }
            stream.deferred.push_back(frame);
            stream.is_delivering() && (stream.autoread || stream.read_pending)
        };
        if pump {
            self.pump_inbound(key);
        }
    }

    fn open_inbound_stream(&mut self, id: StreamId, frame: Frame) {
        trace!(id, "opening inbound stream");
        let key = self
            .streams
            .insert_inbound(id, self.config.target_window_size());
        if let Some(stream) = self.streams.get_mut(key) {
            stream.phase = StreamPhase::SetupPending;
            if frame.flags().is_end_stream() {
                stream.remote_ended = true;
            }
            stream.deferred.push_back(frame);
        }

        // The initializer is a field of `self`, so it is parked on a
        // placeholder while it runs against the borrowed context.
        let mut init = mem::replace(
            &mut self.inbound_init,
            Box::new(|_: &mut StreamContext<'_>| Ok(InitState::Pending)),
        );
        let outcome = init(&mut StreamContext::new(key, self));
        self.inbound_init = init;

        match outcome {
            Ok(InitState::Ready(handler)) => self.install_handler(key, handler),
            Ok(InitState::Pending) => {}
            Err(e) => self.fail_inbound_setup(key, e),
        }
    }

    // ------------------------------------------------------------------
    // Delivery pump.
    // ------------------------------------------------------------------

    fn pump_inbound(&mut self, key: StreamKey) {
        {
            let stream = match self.streams.get_mut(key) {
                Some(stream) => stream,
                None => return,
            };
            if stream.pumping {
                return;
            }
            stream.pumping = true;
        }
        let delivered = self.deliver_loop(key, false);
        let drained = match self.streams.get_mut(key) {
            Some(stream) => {
                stream.pumping = false;
                stream.deferred.is_empty()
            }
            None => false,
        };
        // Inside a parent read burst the read-complete is fanned out once,
        // at the end of the burst.
        if delivered > 0 && drained && !self.in_read_burst {
            self.fire_read_complete(key);
        }
    }

    // Pops deliverable frames and hands them to the handler. `replay` mode
    // ignores autoread: setup completion replays every deferred frame.
    fn deliver_loop(&mut self, key: StreamKey, replay: bool) -> usize {
        let mut delivered = 0usize;
        loop {
            let frame = {
                let stream = match self.streams.get_mut(key) {
                    Some(stream) => stream,
                    None => break,
                };
                if !stream.is_delivering() || stream.handler.is_none() {
                    None
                } else if replay || stream.autoread {
                    stream.deferred.pop_front()
                } else if stream.read_pending {
                    let frame = stream.deferred.pop_front();
                    if frame.is_some() {
                        stream.read_pending = false;
                    }
                    frame
                } else {
                    None
                }
            };
            let frame = match frame {
                Some(frame) => frame,
                None => break,
            };
            self.dispatch_frame(key, frame);
            delivered += 1;
        }
        delivered
    }

    fn dispatch_frame(&mut self, key: StreamKey, frame: Frame) {
        let mut handler = {
            let stream = match self.streams.get_mut(key) {
                Some(stream) => stream,
                None => return,
            };
            if self.in_read_burst && !stream.in_burst {
                stream.in_burst = true;
                self.burst_children.push(key);
            }
            match stream.handler.take() {
                Some(handler) => handler,
                None => {
                    stream.deferred.push_front(frame);
                    return;
                }
            }
        };
        handler.frame_received(&mut StreamContext::new(key, self), frame);
        if let Some(stream) = self.streams.get_mut(key) {
            if stream.handler.is_none() {
                stream.handler = Some(handler);
            }
        }
    }

    fn fire_read_complete(&mut self, key: StreamKey) {
        let mut handler = match self.streams.get_mut(key).and_then(|s| s.handler.take()) {
            Some(handler) => handler,
            None => return,
        };
        handler.read_complete(&mut StreamContext::new(key, self));
        if let Some(stream) = self.streams.get_mut(key) {
            if stream.handler.is_none() {
                stream.handler = Some(handler);
            }
        }
    }

    /// Ends the current parent read burst: fans out `read_complete` to every
    /// child that received at least one frame in the burst and issues the
    /// coalesced connection flush, if any child flushed.
    pub fn read_complete(&mut self) {
        let children = mem::take(&mut self.burst_children);
        for key in children {
            let fire = match self.streams.get_mut(key) {
                Some(stream) => {
                    stream.in_burst = false;
                    stream.is_delivering()
                }
                None => false,
            };
            if fire {
                self.fire_read_complete(key);
            }
        }
        if self.burst_child_flushed {
            self.burst_child_flushed = false;
            self.conn_flushes += 1;
        }
        self.in_read_burst = false;
    }

    // ------------------------------------------------------------------
    // Stream factory.
    // ------------------------------------------------------------------

    /// Creates a locally-initiated stream. The initializer runs immediately;
    /// the returned completion resolves when setup finishes. No identifier
    /// exists until the first flushed frame is released.
    pub fn create_stream(
        &mut self,
        mut initializer: StreamInitializer,
    ) -> Result<(StreamKey, Completion<()>), MuxError> {
        if self.goaway.is_some() {
            return Err(MuxError::GoingAway);
        }
        let key = self
            .streams
            .insert_outbound(self.config.target_window_size());
        let setup = match self.streams.get_mut(key) {
            Some(stream) => {
                stream.phase = StreamPhase::SetupPending;
                stream.setup_completion.clone()
            }
            None => return Err(MuxError::IoOnClosedChannel),
        };
        trace!(?key, "creating outbound stream");

        match initializer(&mut StreamContext::new(key, self)) {
            Ok(InitState::Ready(handler)) => self.install_handler(key, handler),
            Ok(InitState::Pending) => {}
            Err(e) => self.fail_outbound_setup(key, e),
        }
        Ok((key, setup))
    }

    /// Finishes a deferred setup started by an initializer that returned
    /// [`InitState::Pending`]. Success installs the handler, replays the
    /// deferred inbound frames in arrival order and activates the stream;
    /// failure tears the stream down (with a `RST_STREAM(CANCEL)` if it is
    /// known to the peer).
    pub fn complete_setup(
        &mut self,
        key: StreamKey,
        result: Result<Box<dyn StreamHandler + Send>, MuxError>,
    ) -> Result<(), MuxError> {
        let (done, shutdown, role) = match self.streams.get(key) {
            Some(stream) => (stream.setup_done, stream.is_shutdown(), stream.role),
            None => return Err(MuxError::IoOnClosedChannel),
        };
        if done || shutdown {
            trace!(?key, "late setup completion ignored");
            return Ok(());
        }
        match result {
            Ok(handler) => self.install_handler(key, handler),
            Err(e) => match role {
                StreamRole::Inbound => self.fail_inbound_setup(key, e),
                StreamRole::Outbound => self.fail_outbound_setup(key, e),
            },
        }
        Ok(())
    }

    fn install_handler(&mut self, key: StreamKey, handler: Box<dyn StreamHandler + Send>) {
        {
            let stream = match self.streams.get_mut(key) {
                Some(stream) => stream,
                None => return,
            };
            stream.handler = Some(handler);
            stream.setup_done = true;
            stream.phase = StreamPhase::Active;
            stream.refresh_half_closed();
            stream.setup_completion.complete(Ok(()));
            stream.pumping = true;
        }
        // Replay everything deferred during setup, in arrival order.
        let delivered = self.deliver_loop(key, true);
        let (drained, parked) = match self.streams.get_mut(key) {
            Some(stream) => {
                stream.pumping = false;
                (stream.deferred.is_empty(), stream.flush_parked)
            }
            None => (false, false),
        };
        if delivered > 0 && drained && !self.in_read_burst {
            self.fire_read_complete(key);
        }
        // Writes held during setup are released now.
        if parked {
            let _ = self.flush(key);
        }
    }

    fn fail_inbound_setup(&mut self, key: StreamKey, error: MuxError) {
        debug!(?key, %error, "inbound stream setup failed");
        let id = {
            let stream = match self.streams.get_mut(key) {
                Some(stream) => stream,
                None => return,
            };
            stream.deferred.clear();
            stream.buffered_bytes = 0;
            stream.phase = StreamPhase::Closing;
            stream.setup_completion.complete(Err(error.clone()));
            while let Some(pending) = stream.pending_out.pop_front() {
                pending.completion.complete(Err(error.clone()));
            }
            stream.rst_sent = true;
            stream.id
        };
        if let Some(id) = id {
            self.outbound
                .push_back(rst_stream_frame(id, ErrorCode::Cancel));
        }
        // The stream stays in `closing` until the connection layer reports
        // the matching StreamClosed event.
    }

    fn fail_outbound_setup(&mut self, key: StreamKey, error: MuxError) {
        debug!(?key, %error, "outbound stream setup failed");
        if let Some(stream) = self.streams.get_mut(key) {
            stream.setup_completion.complete(Err(error.clone()));
            while let Some(pending) = stream.pending_out.pop_front() {
                pending.completion.complete(Err(error.clone()));
            }
            stream.buffered_bytes = 0;
            stream.phase = StreamPhase::Closed;
            stream.close_future.complete(Ok(()));
            for completion in stream.close_completions.drain(..) {
                completion.complete(Ok(()));
            }
        }
        // Never reached the wire, so there is no RST_STREAM and no terminal
        // event to wait for.
        self.tasks.push_back(Task::Teardown(key));
    }

    // ------------------------------------------------------------------
    // Child-channel operations.
    // ------------------------------------------------------------------

    /// Enqueues one outbound frame on a stream. DATA payload bytes charge
    /// the watermark gauge; the returned completion resolves when the frame
    /// is released to the connection, or fails if the stream closes first.
    pub fn write(
        &mut self,
        key: StreamKey,
        flags: FrameFlags,
        payload: Payload,
    ) -> Result<Completion<()>, MuxError> {
        let high = self.config.high_watermark();
        let (completion, flipped) = {
            let stream = self
                .streams
                .get_mut(key)
                .ok_or(MuxError::IoOnClosedChannel)?;
            if stream.is_shutdown() {
                return Err(MuxError::StreamClosed(
                    stream.id.unwrap_or(0),
                    stream.close_reason.unwrap_or(ErrorCode::Cancel),
                ));
            }
            let completion = Completion::new();
            let size = match &payload {
                Payload::Data(data) => data.size(),
                _ => 0,
            };
            let flipped = stream.charge(size, high);
            stream.pending_out.push_back(PendingFrame {
                flags,
                payload,
                completion: completion.clone(),
            });
            (completion, flipped)
        };
        if flipped {
            self.sync_writability(key);
        }
        Ok(completion)
    }

    /// Releases queued writes of a stream towards the connection, as far as
    /// the flow-control policy allows. The first release of a locally-
    /// created stream assigns its identifier. Flushes issued during a
    /// parent read burst coalesce into one connection flush.
    pub fn flush(&mut self, key: StreamKey) -> Result<(), MuxError> {
        let gate = {
            let stream = self
                .streams
                .get_mut(key)
                .ok_or(MuxError::IoOnClosedChannel)?;
            if stream.is_shutdown() {
                FlushGate::Skip
            } else if !stream.setup_done {
                // No outbound frame may be released while setup is pending.
                stream.flush_parked = true;
                FlushGate::Skip
            } else if stream.id.is_some() {
                FlushGate::Ready
            } else if stream.pending_out.is_empty() {
                FlushGate::Skip
            } else {
                FlushGate::NeedsId
            }
        };
        match gate {
            FlushGate::Skip => return Ok(()),
            FlushGate::NeedsId => {
                if !self.streams.has_concurrency_slot() {
                    // Over the concurrent-stream cap: the identifier stays
                    // unassigned so that release order keeps deciding
                    // identifier order.
                    if let Some(stream) = self.streams.get_mut(key) {
                        stream.flush_parked = true;
                    }
                    self.streams.park_concurrency(key);
                    return Ok(());
                }
                self.assign_stream_id(key)?;
            }
            FlushGate::Ready => {}
        }
        self.release_writes(key);
        self.note_child_flush();
        Ok(())
    }

    fn assign_stream_id(&mut self, key: StreamKey) -> Result<(), MuxError> {
        let id = self.allocator.generate_id()?;
        self.streams.bind_id(key, id);
        self.streams.acquire_concurrency();
        trace!(?key, id, "assigned stream id");
        Ok(())
    }

    fn note_child_flush(&mut self) {
        if self.in_read_burst {
            self.burst_child_flushed = true;
        } else {
            self.conn_flushes += 1;
        }
    }

    fn release_writes(&mut self, key: StreamKey) -> usize {
        let low = self.config.low_watermark();
        let mut released = 0usize;
        loop {
            let frame = {
                let stream = match self.streams.get_mut(key) {
                    Some(stream) => stream,
                    None => break,
                };
                let id = match stream.id {
                    Some(id) => id,
                    None => break,
                };
                let size = match stream.pending_out.front() {
                    Some(pending) => pending.data_size(),
                    None => {
                        stream.flush_parked = false;
                        break;
                    }
                };
                if size > 0 && (stream.send_window.size_available() as usize) < size {
                    // Window exhausted: the rest stays queued and is retried
                    // on the next window update.
                    stream.flush_parked = true;
                    break;
                }
                let pending = match stream.pending_out.pop_front() {
                    Some(pending) => pending,
                    None => break,
                };
                if size > 0 {
                    stream.send_window.send_data(size as u32);
                }
                stream.discharge(size, low);
                if pending.flags.is_end_stream() {
                    stream.local_ended = true;
                    stream.refresh_half_closed();
                }
                pending.completion.complete(Ok(()));
                Frame::new(id, pending.flags, pending.payload)
            };
            self.outbound.push_back(frame);
            released += 1;
        }
        self.sync_writability(key);
        released
    }

    /// Requests inbound data on a stream: delivers exactly one deferred
    /// frame if any is queued, otherwise records the demand and asks the
    /// parent channel for a read.
    pub fn read(&mut self, key: StreamKey) -> Result<(), MuxError> {
        let backlog = {
            let stream = self
                .streams
                .get_mut(key)
                .ok_or(MuxError::IoOnClosedChannel)?;
            if stream.phase == StreamPhase::Closed {
                return Err(MuxError::IoOnClosedChannel);
            }
            stream.read_pending = true;
            !stream.deferred.is_empty()
        };
        if backlog {
            self.pump_inbound(key);
        } else {
            self.read_requested = true;
        }
        Ok(())
    }

    /// Initiates shutdown: emits one `RST_STREAM(CANCEL)` for the stream
    /// (streams that never reached the wire close immediately) and returns
    /// a completion satisfied by the terminal `StreamClosed` event.
    pub fn close(&mut self, key: StreamKey) -> Result<Completion<()>, MuxError> {
        let (completion, action) = {
            let stream = self
                .streams
                .get_mut(key)
                .ok_or(MuxError::IoOnClosedChannel)?;
            if stream.phase == StreamPhase::Closed {
                return Ok(match stream.close_reason {
                    Some(code) => Completion::done(Err(MuxError::StreamClosed(
                        stream.id.unwrap_or(0),
                        code,
                    ))),
                    None => Completion::done(Ok(())),
                });
            }
            let completion = Completion::new();
            stream.close_completions.push(completion.clone());
            let action = match stream.id {
                Some(id) if !stream.rst_sent => {
                    stream.rst_sent = true;
                    stream.phase = StreamPhase::Closing;
                    CloseAction::EmitRst(id)
                }
                // Only the first close of a stream produces a RST_STREAM.
                Some(_) => CloseAction::AwaitEvent,
                None => CloseAction::CloseNow,
            };
            (completion, action)
        };
        match action {
            CloseAction::EmitRst(id) => {
                debug!(id, "closing stream locally");
                self.outbound
                    .push_back(rst_stream_frame(id, ErrorCode::Cancel));
            }
            CloseAction::AwaitEvent => {}
            CloseAction::CloseNow => {
                // Nothing ever left for this stream; no terminal event will
                // come from the connection layer.
                self.finish_close(key, None);
            }
        }
        Ok(completion)
    }

    /// The completion resolved when the stream reaches `closed`. Never
    /// fails.
    pub fn close_future(&self, key: StreamKey) -> Result<Completion<()>, MuxError> {
        self.streams
            .get(key)
            .map(|stream| stream.close_future.clone())
            .ok_or(MuxError::IoOnClosedChannel)
    }

    // ------------------------------------------------------------------
    // Lifecycle coordinator.
    // ------------------------------------------------------------------

    /// Applies one lifecycle event from the connection layer.
    pub fn handle_event(&mut self, event: StreamEvent) -> Result<(), MuxError> {
        match event {
            StreamEvent::Created {
                id,
                local_window,
                remote_window,
            } => self.on_stream_created(id, local_window, remote_window),
            StreamEvent::Closed { id, reason } => {
                match self.streams.key_of_id(id) {
                    Some(key) => self.finish_close(key, reason),
                    // Repeated terminal events for a dead stream are legal.
                    None => trace!(id, "StreamClosed for unknown stream ignored"),
                }
                Ok(())
            }
            StreamEvent::WindowUpdated {
                id,
                inbound,
                outbound,
            } => self.on_window_updated(id, inbound, outbound),
            StreamEvent::WritabilityChanged { writable } => {
                self.parent_writable = writable;
                for key in self.streams.unclosed_keys() {
                    self.sync_writability(key);
                }
                Ok(())
            }
        }
    }

    fn on_stream_created(
        &mut self,
        id: StreamId,
        local_window: u32,
        remote_window: u32,
    ) -> Result<(), MuxError> {
        let key = match self.streams.key_of_id(id) {
            Some(key) => key,
            None => {
                trace!(id, "StreamCreated for unknown stream ignored");
                return Ok(());
            }
        };
        let parked = match self.streams.get_mut(key) {
            Some(stream) => {
                let mut window = RecvWindow::new(self.config.target_window_size());
                window.set_current(local_window);
                stream.recv_window = window;
                stream.send_window.set_size(remote_window)?;
                stream.setup_done && stream.flush_parked
            }
            None => false,
        };
        if parked && self.release_writes(key) > 0 {
            self.note_child_flush();
        }
        Ok(())
    }

    fn on_window_updated(
        &mut self,
        id: StreamId,
        inbound: Option<u32>,
        outbound: Option<u32>,
    ) -> Result<(), MuxError> {
        let key = match self.streams.key_of_id(id) {
            Some(key) => key,
            None => return Ok(()),
        };
        // Both sizes absent is a no-op by contract.
        if inbound.is_none() && outbound.is_none() {
            return Ok(());
        }
        if let Some(window) = inbound {
            let update = match self.streams.get_mut(key) {
                Some(stream) if stream.phase != StreamPhase::Closed => {
                    stream.recv_window.set_current(window);
                    stream.recv_window.check_window_update(id)
                }
                _ => None,
            };
            if let Some(frame) = update {
                trace!(id, "topping up inbound window");
                self.outbound.push_back(frame);
            }
        }
        if let Some(window) = outbound {
            let parked = match self.streams.get_mut(key) {
                Some(stream) => {
                    stream.send_window.set_size(window)?;
                    stream.setup_done && stream.flush_parked
                }
                None => false,
            };
            if parked && self.release_writes(key) > 0 {
                self.note_child_flush();
            }
        }
        Ok(())
    }

    fn finish_close(&mut self, key: StreamKey, reason: Option<ErrorCode>) {
        let (id, releases_slot, error) = {
            let stream = match self.streams.get_mut(key) {
                Some(stream) => stream,
                None => return,
            };
            if stream.phase == StreamPhase::Closed {
                return;
            }
            stream.phase = StreamPhase::Closed;
            stream.close_reason = reason;
            let id = stream.id;
            let error = match reason {
                Some(code) => MuxError::StreamClosed(id.unwrap_or(0), code),
                None => MuxError::Eof,
            };
            // Unflushed writes are failed, never silently dropped.
            while let Some(pending) = stream.pending_out.pop_front() {
                pending.completion.complete(Err(error.clone()));
            }
            stream.buffered_bytes = 0;
            stream.deferred.clear();
            if !stream.setup_done {
                stream.setup_completion.complete(Err(error.clone()));
            }
            for completion in stream.close_completions.drain(..) {
                match reason {
                    Some(code) => {
                        completion.complete(Err(MuxError::StreamClosed(id.unwrap_or(0), code)))
                    }
                    None => completion.complete(Ok(())),
                }
            }
            stream.close_future.complete(Ok(()));
            let releases_slot = stream.role == StreamRole::Outbound && id.is_some();
            (id, releases_slot, reason.map(|_| error))
        };
        debug!(?key, ?id, ?reason, "stream closed");
        if let Some(id) = id {
            self.streams.unbind_id(id);
        }
        if releases_slot {
            self.streams.release_concurrency();
        }
        // A reset is also an inbound error on the child pipeline.
        if let Some(error) = error {
            let mut handler = self.streams.get_mut(key).and_then(|s| s.handler.take());
            if let Some(handler) = handler.as_mut() {
                handler.error_received(&mut StreamContext::new(key, self), error);
            }
            if let (Some(stream), Some(handler)) = (self.streams.get_mut(key), handler) {
                stream.handler = Some(handler);
            }
        }
        self.tasks.push_back(Task::Teardown(key));
        self.unpark_concurrency();
    }

    fn unpark_concurrency(&mut self) {
        while let Some(key) = self.streams.next_unparked() {
            let alive = self
                .streams
                .get(key)
                .map(|s| !s.is_shutdown() && s.flush_parked)
                .unwrap_or_default();
            if !alive {
                continue;
            }
            if let Err(e) = self.assign_stream_id(key) {
                warn!(?key, %e, "could not assign stream id");
                self.finish_close(key, None);
                continue;
            }
            if self.release_writes(key) > 0 {
                self.note_child_flush();
            }
        }
    }

    /// Fails every stream that has not reached `closed`, e.g. when the
    /// connection dies. Terminal-event choreography is skipped; handlers
    /// are torn down on the next `run_pending_tasks`.
    pub fn fail_all_streams(&mut self, reason: Option<ErrorCode>) {
        for key in self.streams.unclosed_keys() {
            self.finish_close(key, reason);
        }
    }

    /// Runs the post-event task queue: handler teardown scheduled by
    /// terminal events. Exposed as an explicit hook so embedders (and
    /// tests) control the loop-iteration boundary.
    pub fn run_pending_tasks(&mut self) {
        while let Some(task) = self.tasks.pop_front() {
            match task {
                Task::Teardown(key) => {
                    if let Some(mut stream) = self.streams.remove_slot(key) {
                        if let Some(mut handler) = stream.handler.take() {
                            handler.handler_removed();
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Options and derived state.
    // ------------------------------------------------------------------

    /// Reads the `stream_id` option.
    pub fn stream_id(&self, key: StreamKey) -> Result<StreamId, MuxError> {
        let stream = self.streams.get(key).ok_or(MuxError::IoOnClosedChannel)?;
        stream.id.ok_or(MuxError::NoStreamIdAvailable)
    }

    /// Sets the `autoread` option. Turning it on drains the deferral queue.
    pub fn set_autoread(&mut self, key: StreamKey, autoread: bool) -> Result<(), MuxError> {
        {
            let stream = self
                .streams
                .get_mut(key)
                .ok_or(MuxError::IoOnClosedChannel)?;
            stream.autoread = autoread;
        }
        if autoread {
            self.pump_inbound(key);
        }
        Ok(())
    }

    /// Gets the `autoread` option.
    pub fn autoread(&self, key: StreamKey) -> Result<bool, MuxError> {
        self.streams
            .get(key)
            .map(|stream| stream.autoread)
            .ok_or(MuxError::IoOnClosedChannel)
    }

    /// The derived writability of a child: parent writability AND the
    /// buffered-bytes watermark state.
    pub fn is_writable(&self, key: StreamKey) -> bool {
        self.streams
            .get(key)
            .map(|stream| stream.computed_writable(self.parent_writable))
            .unwrap_or_default()
    }

    /// Whether the stream is active (setup finished, not shut down).
    pub fn is_active(&self, key: StreamKey) -> bool {
        self.streams
            .get(key)
            .map(|stream| stream.is_active())
            .unwrap_or_default()
    }

    /// The phase a stream is currently in.
    pub fn phase(&self, key: StreamKey) -> Option<StreamPhase> {
        self.streams.get(key).map(|stream| stream.phase)
    }

    fn sync_writability(&mut self, key: StreamKey) {
        let change = {
            let stream = match self.streams.get_mut(key) {
                Some(stream) => stream,
                None => return,
            };
            let writable = stream.computed_writable(self.parent_writable);
            if writable == stream.reported_writable {
                None
            } else {
                stream.reported_writable = writable;
                Some(writable)
            }
        };
        let writable = match change {
            Some(writable) => writable,
            None => return,
        };
        let mut handler = self.streams.get_mut(key).and_then(|s| s.handler.take());
        if let Some(handler) = handler.as_mut() {
            handler.writability_changed(&mut StreamContext::new(key, self), writable);
        }
        if let (Some(stream), Some(handler)) = (self.streams.get_mut(key), handler) {
            stream.handler = Some(handler);
        }
    }

    // ------------------------------------------------------------------
    // Connection-side surface.
    // ------------------------------------------------------------------

    /// Forwards a connection-level or PRIORITY frame towards the connection
    /// unchanged.
    pub fn pass_through(&mut self, frame: Frame) {
        self.outbound.push_back(frame);
    }

    /// Pops the next frame released towards the connection.
    pub fn pop_outbound(&mut self) -> Option<Frame> {
        self.outbound.pop_front()
    }

    /// Whether any released frame is waiting for the connection layer.
    pub fn outbound_is_empty(&self) -> bool {
        self.outbound.is_empty()
    }

    /// Number of flush signals issued to the parent channel so far.
    pub fn conn_flush_count(&self) -> usize {
        self.conn_flushes
    }

    /// Takes the pending parent-read request recorded by child `read`s that
    /// found no deferred frame.
    pub fn take_read_request(&mut self) -> bool {
        mem::take(&mut self.read_requested)
    }

    /// Whether the peer announced it is going away.
    pub fn is_goaway(&self) -> bool {
        self.goaway.is_some()
    }

    /// The last stream identifier carried by the peer's GOAWAY.
    pub fn goaway_last_stream_id(&self) -> Option<StreamId> {
        self.goaway
    }
}

fn rst_stream_frame(id: StreamId, code: ErrorCode) -> Frame {
    Frame::new(
        id,
        FrameFlags::empty(),
        Payload::RstStream(RstStream::new(code.into_code())),
    )
}

#[cfg(test)]
mod ut_multiplexer {
    use std::sync::{Arc, Mutex};

    use h2_frame::{Data, Goaway, Headers, Ping};

    use super::*;

    #[derive(Default)]
    struct Log {
        frames: Vec<Frame>,
        read_completes: usize,
        errors: Vec<MuxError>,
        writability: Vec<bool>,
        removed: bool,
    }

    type SharedLog = Arc<Mutex<Log>>;

    struct Recorder {
        log: SharedLog,
    }

    impl StreamHandler for Recorder {
        fn frame_received(&mut self, _ctx: &mut StreamContext<'_>, frame: Frame) {
            self.log.lock().unwrap().frames.push(frame);
        }

        fn read_complete(&mut self, _ctx: &mut StreamContext<'_>) {
            self.log.lock().unwrap().read_completes += 1;
        }

        fn error_received(&mut self, _ctx: &mut StreamContext<'_>, error: MuxError) {
            self.log.lock().unwrap().errors.push(error);
        }

        fn writability_changed(&mut self, _ctx: &mut StreamContext<'_>, writable: bool) {
            self.log.lock().unwrap().writability.push(writable);
        }

        fn handler_removed(&mut self) {
            self.log.lock().unwrap().removed = true;
        }
    }

    // Echoes one DATA frame (and flushes) for every frame it receives.
    struct Echo;

    impl StreamHandler for Echo {
        fn frame_received(&mut self, ctx: &mut StreamContext<'_>, _frame: Frame) {
            ctx.write(FrameFlags::empty(), Payload::Data(Data::new(b"ok".to_vec())))
                .unwrap();
            ctx.flush().unwrap();
        }
    }

    type Registry = Arc<Mutex<Vec<(StreamKey, SharedLog)>>>;

    fn recorder_registry_init(registry: &Registry) -> StreamInitializer {
        let registry = registry.clone();
        Box::new(move |ctx: &mut StreamContext<'_>| {
            let log = SharedLog::default();
            registry.lock().unwrap().push((ctx.key(), log.clone()));
            Ok(InitState::Ready(Box::new(Recorder { log })))
        })
    }

    fn pending_registry_init(registry: &Registry) -> StreamInitializer {
        let registry = registry.clone();
        Box::new(move |ctx: &mut StreamContext<'_>| {
            registry
                .lock()
                .unwrap()
                .push((ctx.key(), SharedLog::default()));
            Ok(InitState::Pending)
        })
    }

    fn refusing_init() -> StreamInitializer {
        Box::new(|_ctx: &mut StreamContext<'_>| Ok(InitState::Pending))
    }

    fn headers_frame(id: StreamId, end_stream: bool) -> Frame {
        let mut flags = FrameFlags::empty();
        flags.set_end_headers(true);
        flags.set_end_stream(end_stream);
        Frame::new(id, flags, Payload::Headers(Headers::empty()))
    }

    fn data_frame(id: StreamId, payload: &[u8], end_stream: bool) -> Frame {
        let mut flags = FrameFlags::empty();
        flags.set_end_stream(end_stream);
        Frame::new(id, flags, Payload::Data(Data::new(payload.to_vec())))
    }

    fn drain_outbound(mux: &mut StreamMultiplexer) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = mux.pop_outbound() {
            frames.push(frame);
        }
        frames
    }

    /// UT test case for opening many inbound streams and closing them via
    /// lifecycle events.
    ///
    /// # Brief
    /// 1. Ingests HEADERS for stream ids 1, 3, ..., 99 on a server
    ///    multiplexer.
    /// 2. Checks that 50 child streams are active, none closed, and that no
    ///    outbound frame was produced.
    /// 3. Fires `StreamClosed` for each and checks all close futures
    ///    resolve; outbound stays empty.
    #[test]
    fn ut_mux_open_streams_and_close() {
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            recorder_registry_init(&registry),
        );

        for id in (1..=99).step_by(2) {
            assert!(matches!(
                mux.ingest(headers_frame(id, false)),
                Ok(IngestOutcome::Routed)
            ));
        }
        mux.read_complete();

        let entries: Vec<(StreamKey, SharedLog)> = registry.lock().unwrap().clone();
        assert_eq!(entries.len(), 50);
        let mut close_futures = Vec::new();
        for (key, log) in &entries {
            assert!(mux.is_active(*key));
            assert_eq!(log.lock().unwrap().frames.len(), 1);
            close_futures.push(mux.close_future(*key).unwrap());
        }
        assert!(mux.outbound_is_empty());

        for id in (1..=99).step_by(2) {
            mux.handle_event(StreamEvent::Closed { id, reason: None })
                .unwrap();
        }
        for future in &close_futures {
            assert_eq!(future.result(), Some(Ok(())));
        }
        assert!(mux.outbound_is_empty());

        mux.run_pending_tasks();
        for (_, log) in &entries {
            assert!(log.lock().unwrap().removed);
        }
    }

    /// UT test case for frames addressing a closed stream.
    ///
    /// # Brief
    /// 1. Opens stream 5 and closes it with a lifecycle event.
    /// 2. Ingests DATA for stream 5 and checks the `NoSuchStream` error.
    /// 3. Checks that no child saw the DATA frame.
    #[test]
    fn ut_mux_frame_for_closed_stream() {
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            recorder_registry_init(&registry),
        );

        mux.ingest(headers_frame(5, false)).unwrap();
        mux.read_complete();
        mux.handle_event(StreamEvent::Closed {
            id: 5,
            reason: None,
        })
        .unwrap();
        mux.run_pending_tasks();

        let res = mux.ingest(data_frame(5, b"Hello, world!", false));
        assert_eq!(res.err(), Some(MuxError::NoSuchStream(5)));
        let entries = registry.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.lock().unwrap().frames.len(), 1);
    }

    /// UT test case for deferred delivery while setup is pending.
    ///
    /// # Brief
    /// 1. Opens stream 1 with an initializer that never completes and
    ///    ingests five DATA frames plus a connection-level PING.
    /// 2. Checks the PING passes through and nothing reaches the child.
    /// 3. Completes the setup and checks exactly six frames arrive in
    ///    order.
    #[test]
    fn ut_mux_setup_deferral() {
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            pending_registry_init(&registry),
        );

        mux.ingest(headers_frame(1, false)).unwrap();
        for _ in 0..5 {
            mux.ingest(data_frame(1, b"Hello, world!", false)).unwrap();
        }
        let ping = Frame::new(0, FrameFlags::empty(), Payload::Ping(Ping::new([1; 8])));
        match mux.ingest(ping).unwrap() {
            IngestOutcome::Passthrough(frame) => {
                assert_eq!(frame.payload().frame_type(), h2_frame::FrameType::Ping)
            }
            _ => panic!("PING must pass through"),
        }
        mux.read_complete();

        let key = registry.lock().unwrap()[0].0;
        assert!(!mux.is_active(key));

        let log = SharedLog::default();
        mux.complete_setup(key, Ok(Box::new(Recorder { log: log.clone() })))
            .unwrap();
        assert!(mux.is_active(key));

        let delivered = log.lock().unwrap();
        let frames = &delivered.frames;
        assert_eq!(frames.len(), 6);
        assert_eq!(
            frames[0].payload().frame_type(),
            h2_frame::FrameType::Headers
        );
        for frame in &frames[1..] {
            match frame.payload() {
                Payload::Data(data) => assert_eq!(data.data(), b"Hello, world!"),
                _ => panic!("expected DATA"),
            }
        }
    }

    /// UT test case for watermark-driven writability.
    ///
    /// # Brief
    /// 1. Creates a client stream with watermarks 100/50 and assigns its id
    ///    via the first flush.
    /// 2. Buffers 90 then 110 DATA bytes and checks the writability edge.
    /// 3. Buffers zero-charge trailers, flushes, and checks the flip back.
    #[test]
    fn ut_mux_watermark_writability() {
        let mut config = MuxConfig::new();
        config.set_high_watermark(100);
        config.set_low_watermark(50);
        let mut mux = StreamMultiplexer::new(MuxMode::Client, config, refusing_init());

        let log = SharedLog::default();
        let handler_log = log.clone();
        let (key, setup) = mux
            .create_stream(Box::new(move |_ctx: &mut StreamContext<'_>| {
                Ok(InitState::Ready(Box::new(Recorder {
                    log: handler_log.clone(),
                })))
            }))
            .unwrap();
        assert_eq!(setup.result(), Some(Ok(())));
        assert_eq!(mux.stream_id(key), Err(MuxError::NoStreamIdAvailable));

        mux.write(key, FrameFlags::empty(), Payload::Headers(Headers::empty()))
            .unwrap();
        mux.flush(key).unwrap();
        assert_eq!(mux.stream_id(key), Ok(1));

        mux.write(
            key,
            FrameFlags::empty(),
            Payload::Data(Data::new(vec![0; 90])),
        )
        .unwrap();
        assert!(mux.is_writable(key));
        mux.write(
            key,
            FrameFlags::empty(),
            Payload::Data(Data::new(vec![0; 20])),
        )
        .unwrap();
        assert!(!mux.is_writable(key));

        let mut trailer_flags = FrameFlags::empty();
        trailer_flags.set_end_headers(true);
        trailer_flags.set_end_stream(true);
        mux.write(key, trailer_flags, Payload::Headers(Headers::empty()))
            .unwrap();
        assert!(!mux.is_writable(key));

        mux.flush(key).unwrap();
        assert!(mux.is_writable(key));
        assert_eq!(log.lock().unwrap().writability, vec![false, true]);
    }

    /// UT test case for a failing inbound initializer.
    ///
    /// # Brief
    /// 1. Opens stream 1 with a deferred setup and buffers frames.
    /// 2. Fails the setup and checks exactly one `RST_STREAM(CANCEL)` is
    ///    emitted and the child never activates.
    /// 3. Fires the terminal event and checks teardown on the next tick.
    #[test]
    fn ut_mux_setup_failure() {
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            pending_registry_init(&registry),
        );

        mux.ingest(headers_frame(1, false)).unwrap();
        for _ in 0..5 {
            mux.ingest(data_frame(1, b"Hello, world!", false)).unwrap();
        }
        mux.read_complete();

        let key = registry.lock().unwrap()[0].0;
        let pending_write = mux
            .write(
                key,
                FrameFlags::empty(),
                Payload::Data(Data::new(vec![0; 4])),
            )
            .unwrap();
        mux.complete_setup(key, Err(MuxError::Other("boom"))).unwrap();

        let frames = drain_outbound(&mut mux);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id(), 1);
        match frames[0].payload() {
            Payload::RstStream(rst) => {
                assert_eq!(rst.error_code(), ErrorCode::Cancel.into_code())
            }
            _ => panic!("expected RST_STREAM"),
        }
        assert!(!mux.is_active(key));
        assert_eq!(mux.phase(key), Some(StreamPhase::Closing));
        assert_eq!(
            pending_write.result(),
            Some(Err(MuxError::Other("boom")))
        );

        mux.handle_event(StreamEvent::Closed {
            id: 1,
            reason: Some(ErrorCode::Cancel),
        })
        .unwrap();
        assert_eq!(mux.phase(key), Some(StreamPhase::Closed));
        mux.run_pending_tasks();
        assert_eq!(mux.stream_id(key), Err(MuxError::IoOnClosedChannel));
    }

    /// UT test case for the WINDOW_UPDATE emission threshold.
    ///
    /// # Brief
    /// 1. Creates a client stream with a 1024-byte target window.
    /// 2. Reports a remaining inbound window of 513 and checks nothing is
    ///    emitted.
    /// 3. Reports 512 and checks a WINDOW_UPDATE with increment 512.
    #[test]
    fn ut_mux_window_update_threshold() {
        let mut config = MuxConfig::new();
        config.set_target_window_size(1024);
        let mut mux = StreamMultiplexer::new(MuxMode::Client, config, refusing_init());

        let (key, _) = mux
            .create_stream(Box::new(|_ctx: &mut StreamContext<'_>| {
                Ok(InitState::Ready(Box::new(Recorder {
                    log: SharedLog::default(),
                })))
            }))
            .unwrap();
        mux.write(key, FrameFlags::empty(), Payload::Headers(Headers::empty()))
            .unwrap();
        mux.flush(key).unwrap();
        drain_outbound(&mut mux);

        mux.handle_event(StreamEvent::WindowUpdated {
            id: 1,
            inbound: Some(513),
            outbound: None,
        })
        .unwrap();
        assert!(mux.outbound_is_empty());

        mux.handle_event(StreamEvent::WindowUpdated {
            id: 1,
            inbound: Some(512),
            outbound: None,
        })
        .unwrap();
        let frames = drain_outbound(&mut mux);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id(), 1);
        match frames[0].payload() {
            Payload::WindowUpdate(update) => assert_eq!(update.increment(), 512),
            _ => panic!("expected WINDOW_UPDATE"),
        }

        // Both sizes absent is a no-op.
        mux.handle_event(StreamEvent::WindowUpdated {
            id: 1,
            inbound: None,
            outbound: None,
        })
        .unwrap();
        assert!(mux.outbound_is_empty());
    }

    /// UT test case for lazy identifier assignment order.
    ///
    /// # Brief
    /// 1. Creates streams A then B without flushing.
    /// 2. Flushes B first and checks it takes the lower identifier.
    #[test]
    fn ut_mux_lazy_id_ordering() {
        let mut mux = StreamMultiplexer::new(MuxMode::Client, MuxConfig::new(), refusing_init());
        let ready = || {
            Box::new(|_ctx: &mut StreamContext<'_>| {
                Ok(InitState::Ready(Box::new(Recorder {
                    log: SharedLog::default(),
                }) as Box<dyn StreamHandler + Send>))
            }) as StreamInitializer
        };

        let (first, _) = mux.create_stream(ready()).unwrap();
        let (second, _) = mux.create_stream(ready()).unwrap();
        for key in [first, second] {
            mux.write(key, FrameFlags::empty(), Payload::Headers(Headers::empty()))
                .unwrap();
        }

        mux.flush(second).unwrap();
        mux.flush(first).unwrap();
        assert_eq!(mux.stream_id(second), Ok(1));
        assert_eq!(mux.stream_id(first), Ok(3));

        let frames = drain_outbound(&mut mux);
        assert_eq!(frames[0].stream_id(), 1);
        assert_eq!(frames[1].stream_id(), 3);
    }

    /// UT test case for local close emitting exactly one reset.
    ///
    /// # Brief
    /// 1. Opens an inbound stream and closes it three times.
    /// 2. Checks a single `RST_STREAM(CANCEL)` and that every close
    ///    completion resolves on the terminal event.
    /// 3. Repeats with an error reason and checks the promises fail while
    ///    the close future still succeeds.
    #[test]
    fn ut_mux_close_once() {
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            recorder_registry_init(&registry),
        );

        mux.ingest(headers_frame(1, false)).unwrap();
        mux.read_complete();
        let key = registry.lock().unwrap()[0].0;

        let completions: Vec<_> = (0..3).map(|_| mux.close(key).unwrap()).collect();
        let frames = drain_outbound(&mut mux);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0].payload(), Payload::RstStream(_)));
        assert!(completions.iter().all(|c| !c.is_done()));

        mux.handle_event(StreamEvent::Closed {
            id: 1,
            reason: None,
        })
        .unwrap();
        for completion in &completions {
            assert_eq!(completion.result(), Some(Ok(())));
        }

        // Reset with a reason fails the per-call promises.
        mux.run_pending_tasks();
        mux.ingest(headers_frame(3, false)).unwrap();
        mux.read_complete();
        let key = registry.lock().unwrap()[1].0;
        let completion = mux.close(key).unwrap();
        let close_future = mux.close_future(key).unwrap();
        drain_outbound(&mut mux);
        mux.handle_event(StreamEvent::Closed {
            id: 3,
            reason: Some(ErrorCode::Cancel),
        })
        .unwrap();
        assert_eq!(
            completion.result(),
            Some(Err(MuxError::StreamClosed(3, ErrorCode::Cancel)))
        );
        assert_eq!(close_future.result(), Some(Ok(())));
        let log = registry.lock().unwrap()[1].1.clone();
        assert_eq!(
            log.lock().unwrap().errors,
            vec![MuxError::StreamClosed(3, ErrorCode::Cancel)]
        );
    }

    /// UT test case for flush coalescing inside a read burst.
    ///
    /// # Brief
    /// 1. Installs an echo handler and ingests two frames in one burst.
    /// 2. Checks no connection flush is issued until the burst ends, then
    ///    exactly one.
    /// 3. Checks the child saw exactly one read-complete for the burst and
    ///    that a flush outside a burst propagates immediately.
    #[test]
    fn ut_mux_flush_coalescing() {
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            Box::new(|_ctx: &mut StreamContext<'_>| Ok(InitState::Ready(Box::new(Echo)))),
        );

        mux.ingest(headers_frame(1, false)).unwrap();
        mux.ingest(data_frame(1, b"a", false)).unwrap();
        assert_eq!(mux.conn_flush_count(), 0);
        mux.read_complete();
        assert_eq!(mux.conn_flush_count(), 1);
        let frames = drain_outbound(&mut mux);
        assert_eq!(frames.len(), 2);

        // Outside a burst the flush propagates immediately.
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            recorder_registry_init(&registry),
        );
        mux.ingest(headers_frame(1, false)).unwrap();
        mux.read_complete();
        let key = registry.lock().unwrap()[0].0;
        let log = registry.lock().unwrap()[0].1.clone();
        assert_eq!(log.lock().unwrap().read_completes, 1);

        assert_eq!(mux.conn_flush_count(), 0);
        mux.write(
            key,
            FrameFlags::empty(),
            Payload::Data(Data::new(b"x".to_vec())),
        )
        .unwrap();
        mux.flush(key).unwrap();
        assert_eq!(mux.conn_flush_count(), 1);
    }

    /// UT test case for autoread and explicit reads.
    ///
    /// # Brief
    /// 1. Opens a stream, turns autoread off and buffers two DATA frames.
    /// 2. Checks nothing is delivered until `read` is called, one frame per
    ///    call, with a read-complete when the queue drains.
    /// 3. Checks a read on an empty queue records a parent read request.
    #[test]
    fn ut_mux_autoread() {
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            recorder_registry_init(&registry),
        );

        mux.ingest(headers_frame(1, false)).unwrap();
        mux.read_complete();
        let (key, log) = registry.lock().unwrap()[0].clone();
        assert_eq!(log.lock().unwrap().frames.len(), 1);

        mux.set_autoread(key, false).unwrap();
        assert_eq!(mux.autoread(key), Ok(false));
        mux.ingest(data_frame(1, b"a", false)).unwrap();
        mux.ingest(data_frame(1, b"b", false)).unwrap();
        mux.read_complete();
        assert_eq!(log.lock().unwrap().frames.len(), 1);

        mux.read(key).unwrap();
        assert_eq!(log.lock().unwrap().frames.len(), 2);
        let completes = log.lock().unwrap().read_completes;
        mux.read(key).unwrap();
        assert_eq!(log.lock().unwrap().frames.len(), 3);
        assert_eq!(log.lock().unwrap().read_completes, completes + 1);

        assert!(!mux.take_read_request());
        mux.read(key).unwrap();
        assert!(mux.take_read_request());
    }

    /// UT test case for parent writability propagation.
    ///
    /// # Brief
    /// 1. Opens an active stream and flips parent writability both ways.
    /// 2. Checks the child reports the combined value with edge-triggered
    ///    notifications only.
    /// 3. Checks an identifier-less child ignores the parent.
    #[test]
    fn ut_mux_parent_writability() {
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            recorder_registry_init(&registry),
        );
        mux.ingest(headers_frame(1, false)).unwrap();
        mux.read_complete();
        let (key, log) = registry.lock().unwrap()[0].clone();

        mux.handle_event(StreamEvent::WritabilityChanged { writable: false })
            .unwrap();
        assert!(!mux.is_writable(key));
        mux.handle_event(StreamEvent::WritabilityChanged { writable: false })
            .unwrap();
        mux.handle_event(StreamEvent::WritabilityChanged { writable: true })
            .unwrap();
        assert!(mux.is_writable(key));
        assert_eq!(log.lock().unwrap().writability, vec![false, true]);

        // Pre-assignment children stay writable regardless of the parent.
        let (outbound, _) = mux
            .create_stream(Box::new(|_ctx: &mut StreamContext<'_>| {
                Ok(InitState::Ready(Box::new(Recorder {
                    log: SharedLog::default(),
                })))
            }))
            .unwrap();
        mux.handle_event(StreamEvent::WritabilityChanged { writable: false })
            .unwrap();
        assert!(mux.is_writable(outbound));
        assert!(!mux.is_writable(key));
    }

    /// UT test case for GOAWAY handling.
    ///
    /// # Brief
    /// 1. Ingests a GOAWAY on the root stream.
    /// 2. Checks it passes through, is not delivered to children, and that
    ///    new local streams are refused afterwards.
    #[test]
    fn ut_mux_goaway() {
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            recorder_registry_init(&registry),
        );
        mux.ingest(headers_frame(1, false)).unwrap();
        mux.read_complete();

        let goaway = Frame::new(
            0,
            FrameFlags::empty(),
            Payload::Goaway(Goaway::new(0, 1, vec![])),
        );
        assert!(matches!(
            mux.ingest(goaway),
            Ok(IngestOutcome::Passthrough(_))
        ));
        assert!(mux.is_goaway());
        assert_eq!(mux.goaway_last_stream_id(), Some(1));
        // The GOAWAY itself is never delivered to a child.
        let log = registry.lock().unwrap()[0].1.clone();
        assert_eq!(log.lock().unwrap().frames.len(), 1);

        let res = mux.create_stream(refusing_init());
        assert!(matches!(res, Err(MuxError::GoingAway)));
    }

    /// UT test case for the outbound concurrency gate.
    ///
    /// # Brief
    /// 1. Caps local concurrency at one and flushes two created streams.
    /// 2. Checks the second stays identifier-less until the first closes,
    ///    then is released with the next identifier.
    #[test]
    fn ut_mux_concurrency_gate() {
        let mut config = MuxConfig::new();
        config.set_max_concurrent_streams(1);
        let mut mux = StreamMultiplexer::new(MuxMode::Client, config, refusing_init());
        let ready = || {
            Box::new(|_ctx: &mut StreamContext<'_>| {
                Ok(InitState::Ready(Box::new(Recorder {
                    log: SharedLog::default(),
                }) as Box<dyn StreamHandler + Send>))
            }) as StreamInitializer
        };

        let (first, _) = mux.create_stream(ready()).unwrap();
        let (second, _) = mux.create_stream(ready()).unwrap();
        for key in [first, second] {
            mux.write(key, FrameFlags::empty(), Payload::Headers(Headers::empty()))
                .unwrap();
        }
        mux.flush(first).unwrap();
        mux.flush(second).unwrap();

        assert_eq!(mux.stream_id(first), Ok(1));
        assert_eq!(mux.stream_id(second), Err(MuxError::NoStreamIdAvailable));
        assert_eq!(drain_outbound(&mut mux).len(), 1);

        mux.handle_event(StreamEvent::Closed {
            id: 1,
            reason: None,
        })
        .unwrap();
        assert_eq!(mux.stream_id(second), Ok(3));
        let frames = drain_outbound(&mut mux);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id(), 3);
    }

    /// UT test case for the outbound window gating DATA release.
    ///
    /// # Brief
    /// 1. Shrinks a stream's send window below a queued DATA frame.
    /// 2. Checks the flush holds the frame and a later window update
    ///    releases it.
    #[test]
    fn ut_mux_send_window_gating() {
        let mut mux = StreamMultiplexer::new(MuxMode::Client, MuxConfig::new(), refusing_init());
        let (key, _) = mux
            .create_stream(Box::new(|_ctx: &mut StreamContext<'_>| {
                Ok(InitState::Ready(Box::new(Recorder {
                    log: SharedLog::default(),
                })))
            }))
            .unwrap();
        mux.write(key, FrameFlags::empty(), Payload::Headers(Headers::empty()))
            .unwrap();
        mux.flush(key).unwrap();
        drain_outbound(&mut mux);

        mux.handle_event(StreamEvent::WindowUpdated {
            id: 1,
            inbound: None,
            outbound: Some(10),
        })
        .unwrap();
        let write = mux
            .write(
                key,
                FrameFlags::empty(),
                Payload::Data(Data::new(vec![0; 100])),
            )
            .unwrap();
        mux.flush(key).unwrap();
        assert!(mux.outbound_is_empty());
        assert!(!write.is_done());

        mux.handle_event(StreamEvent::WindowUpdated {
            id: 1,
            inbound: None,
            outbound: Some(200),
        })
        .unwrap();
        let frames = drain_outbound(&mut mux);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0].payload(), Payload::Data(_)));
        assert_eq!(write.result(), Some(Ok(())));
    }

    /// UT test case for failing unflushed writes on close.
    ///
    /// # Brief
    /// 1. Buffers a write without flushing and closes the stream with a
    ///    plain terminal event.
    /// 2. Checks the write completion fails with `Eof`.
    /// 3. Checks a write after closure fails with `StreamClosed`.
    #[test]
    fn ut_mux_unflushed_writes_fail() {
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            recorder_registry_init(&registry),
        );
        mux.ingest(headers_frame(1, false)).unwrap();
        mux.read_complete();
        let key = registry.lock().unwrap()[0].0;

        let write = mux
            .write(
                key,
                FrameFlags::empty(),
                Payload::Data(Data::new(b"late".to_vec())),
            )
            .unwrap();
        mux.handle_event(StreamEvent::Closed {
            id: 1,
            reason: None,
        })
        .unwrap();
        assert_eq!(write.result(), Some(Err(MuxError::Eof)));

        let res = mux.write(
            key,
            FrameFlags::empty(),
            Payload::Data(Data::new(b"x".to_vec())),
        );
        assert!(matches!(res, Err(MuxError::StreamClosed(1, _))));

        mux.run_pending_tasks();
        let res = mux.write(
            key,
            FrameFlags::empty(),
            Payload::Data(Data::new(b"x".to_vec())),
        );
        assert_eq!(res.err(), Some(MuxError::IoOnClosedChannel));
    }

    /// UT test case for wrong-parity and stale HEADERS.
    ///
    /// # Brief
    /// 1. Sends HEADERS with the local parity to a server multiplexer and
    ///    checks `NoSuchStream`.
    /// 2. Opens and closes stream 5, then re-sends HEADERS for id 5 and
    ///    checks it is not re-opened.
    #[test]
    fn ut_mux_no_implicit_open() {
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            recorder_registry_init(&registry),
        );

        let res = mux.ingest(headers_frame(2, false));
        assert_eq!(res.err(), Some(MuxError::NoSuchStream(2)));

        mux.ingest(headers_frame(5, false)).unwrap();
        mux.read_complete();
        mux.handle_event(StreamEvent::Closed {
            id: 5,
            reason: None,
        })
        .unwrap();
        mux.run_pending_tasks();
        let res = mux.ingest(headers_frame(5, false));
        assert_eq!(res.err(), Some(MuxError::NoSuchStream(5)));
        assert_eq!(registry.lock().unwrap().len(), 1);
    }

    /// UT test case for a HEADERS frame carrying END_STREAM.
    ///
    /// # Brief
    /// 1. Opens a stream with HEADERS+END_STREAM.
    /// 2. Checks the stream still opens, goes half-closed (remote), and
    ///    closes only on the terminal event.
    #[test]
    fn ut_mux_headers_end_stream_opens() {
        let registry: Registry = Registry::default();
        let mut mux = StreamMultiplexer::new(
            MuxMode::Server,
            MuxConfig::new(),
            recorder_registry_init(&registry),
        );
        mux.ingest(headers_frame(1, true)).unwrap();
        mux.read_complete();
        let (key, log) = registry.lock().unwrap()[0].clone();
        assert_eq!(log.lock().unwrap().frames.len(), 1);
        assert_eq!(mux.phase(key), Some(StreamPhase::RemoteHalfClosed));
        assert!(mux.is_active(key));

        mux.handle_event(StreamEvent::Closed {
            id: 1,
            reason: None,
        })
        .unwrap();
        assert_eq!(mux.phase(key), Some(StreamPhase::Closed));
    }
}
