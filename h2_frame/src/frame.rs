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

//! Typed HTTP/2 frames. The connection layer decodes wire bytes into these
//! values before they reach the multiplexer and encodes them again on the
//! way out; nothing here touches the wire format itself.

/// A stream identifier: an unsigned 31-bit integer. `0` addresses the
/// connection itself (the root stream) and never a child stream. Peer
/// streams arrive with an identifier already attached; locally-created
/// streams receive theirs lazily, at their first flushed frame.
pub type StreamId = u32;

// Flag bits, shared across the frame types that define them. ACK reuses
// the END_STREAM bit position on SETTINGS and PING.
const FLAG_END_STREAM: u8 = 0x01;
const FLAG_ACK: u8 = 0x01;
const FLAG_END_HEADERS: u8 = 0x04;
const FLAG_PADDED: u8 = 0x08;

/// The flag octet of a frame. Which bits mean anything depends on the
/// frame type; the multiplexer itself only ever looks at END_STREAM and
/// ACK.
#[derive(Clone)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Wraps a raw flag octet.
    pub fn new(flags: u8) -> Self {
        Self(flags)
    }

    /// A flag octet with every bit clear.
    pub fn empty() -> Self {
        Self(0)
    }

    fn toggle(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    /// Whether the sender promised no further frames on this stream.
    pub fn is_end_stream(&self) -> bool {
        self.0 & FLAG_END_STREAM != 0
    }

    /// Whether this frame carries a complete header block.
    pub fn is_end_headers(&self) -> bool {
        self.0 & FLAG_END_HEADERS != 0
    }

    /// Whether the payload was followed by padding on the wire.
    pub fn is_padded(&self) -> bool {
        self.0 & FLAG_PADDED != 0
    }

    /// Whether this SETTINGS or PING frame acknowledges an earlier one.
    pub fn is_ack(&self) -> bool {
        self.0 & FLAG_ACK != 0
    }

    /// The raw flag octet.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Sets or clears the END_STREAM bit.
    pub fn set_end_stream(&mut self, end_stream: bool) {
        self.toggle(FLAG_END_STREAM, end_stream);
    }

    /// Sets or clears the END_HEADERS bit.
    pub fn set_end_headers(&mut self, end_headers: bool) {
        self.toggle(FLAG_END_HEADERS, end_headers);
    }
}

/// One frame as the multiplexer sees it: the stream identifier it
/// addresses, its flag octet, and a typed payload. Frames are what the
/// multiplexer consumes from and emits to the connection layer, in both
/// directions.
#[derive(Clone)]
pub struct Frame {
    id: StreamId,
    flags: FrameFlags,
    payload: Payload,
}

impl Frame {
    /// Assembles a frame from its parts.
    pub fn new(id: StreamId, flags: FrameFlags, payload: Payload) -> Self {
        Self { id, flags, payload }
    }

    /// The stream this frame addresses; `0` is the root stream.
    pub fn stream_id(&self) -> StreamId {
        self.id
    }

    /// Replaces the stream identifier. The multiplexer uses this when a
    /// locally-created stream gets its identifier at first flush, after
    /// its frames were already queued.
    pub fn set_stream_id(&mut self, id: StreamId) {
        self.id = id;
    }

    /// The flag octet.
    pub fn flags(&self) -> &FrameFlags {
        &self.flags
    }

    /// The typed payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

/// The typed payload of a frame, one variant per frame type the
/// multiplexer understands. PUSH_PROMISE and CONTINUATION never reach the
/// multiplexer (push is not negotiated and header fragments are joined by
/// the codec), so they have no variant.
#[derive(Clone)]
pub enum Payload {
    /// A header block opening or trailing a stream.
    Headers(Headers),
    /// Stream payload bytes; the only kind charged against flow control.
    Data(Data),
    /// Sender-advised priority; passes through the multiplexer untouched.
    Priority(Priority),
    /// Immediate stream termination.
    RstStream(RstStream),
    /// Root-stream liveness probe.
    Ping(Ping),
    /// Root-stream configuration parameters.
    Settings(Settings),
    /// Orderly connection shutdown announcement.
    Goaway(Goaway),
    /// A flow-control credit grant.
    WindowUpdate(WindowUpdate),
}

impl Payload {
    /// The frame type this payload belongs to.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Payload::Headers(_) => FrameType::Headers,
            Payload::Data(_) => FrameType::Data,
            Payload::Priority(_) => FrameType::Priority,
            Payload::Ping(_) => FrameType::Ping,
            Payload::RstStream(_) => FrameType::RstStream,
            Payload::Settings(_) => FrameType::Settings,
            Payload::Goaway(_) => FrameType::Goaway,
            Payload::WindowUpdate(_) => FrameType::WindowUpdate,
        }
    }

    /// The DATA payload, if this is a DATA frame.
    pub fn as_data(&self) -> Option<&Data> {
        if let Payload::Data(data) = self {
            Some(data)
        } else {
            None
        }
    }
}

/// Frame types by their RFC 9113 type codes.
#[derive(PartialEq, Eq, Debug)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x03,
    Settings = 0x4,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
}

/// An already-decoded header block. Field compression is the codec's
/// concern, so fields arrive here as plain name/value pairs; the
/// multiplexer treats the block as opaque and forwards it to the child
/// stream unchanged. Header bytes never count against flow control.
#[derive(Clone)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// A header block from decoded field pairs.
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Self { fields }
    }

    /// A header block with no fields.
    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    /// The decoded field pairs, in wire order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }
}

/// The payload bytes of a DATA frame, padding already stripped. The byte
/// count of a DATA payload is exactly what the multiplexer charges to a
/// child stream's flow-control gauge while the frame sits in its outbound
/// queue.
#[derive(Clone)]
pub struct Data {
    data: Vec<u8>,
}

impl Data {
    /// Wraps payload bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// The payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// How many payload bytes this frame carries.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Immediate stream termination. The multiplexer synthesizes exactly one
/// `RST_STREAM(CANCEL)` per locally-closed stream; inbound resets are
/// routed to the addressed child like any other stream frame, with closure
/// itself driven by the terminal lifecycle event.
#[derive(Clone)]
pub struct RstStream {
    error_code: u32,
}

impl RstStream {
    /// A reset carrying the given error code.
    pub fn new(error_code: u32) -> Self {
        Self { error_code }
    }

    /// The raw error code.
    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    /// Whether this reset carries `NO_ERROR`.
    pub fn is_no_error(&self) -> bool {
        self.error_code == 0
    }
}

/// Sender-advised stream priority. PRIORITY frames may address any
/// identifier but never create or touch a stream; the multiplexer passes
/// them through in both directions.
#[derive(Clone)]
pub struct Priority {
    exclusive: bool,
    stream_dependency: u32,
    weight: u8,
}

impl Priority {
    /// A priority advice from its parts.
    pub fn new(exclusive: bool, stream_dependency: u32, weight: u8) -> Self {
        Self {
            exclusive,
            stream_dependency,
            weight,
        }
    }

    /// Whether the dependency is exclusive.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// The stream this one is declared to depend on.
    pub fn stream_dependency(&self) -> u32 {
        self.stream_dependency
    }

    /// The declared weight.
    pub fn weight(&self) -> u8 {
        self.weight
    }
}

/// A root-stream liveness probe. PING frames pass through the multiplexer
/// unchanged; answering them is the connection layer's job.
#[derive(Clone)]
pub struct Ping {
    /// The eight opaque bytes echoed back by the acknowledgement.
    pub data: [u8; 8],
}

impl Ping {
    /// A probe carrying the given opaque bytes.
    pub fn new(data: [u8; 8]) -> Self {
        Self { data }
    }

    /// The opaque bytes.
    pub fn data(&self) -> [u8; 8] {
        self.data
    }

    /// The acknowledgement frame echoing this probe.
    pub fn ack(self) -> Frame {
        Frame::new(0, FrameFlags::new(0x1), Payload::Ping(self))
    }
}

/// An orderly connection shutdown announcement. The multiplexer records an
/// inbound GOAWAY (refusing new locally-initiated streams from then on)
/// and passes the frame through; it is never delivered to a child stream
/// and no per-stream closure is synthesized from it.
#[derive(Clone)]
pub struct Goaway {
    error_code: u32,
    last_stream_id: StreamId,
    debug_data: Vec<u8>,
}

impl Goaway {
    /// A shutdown announcement from its parts.
    pub fn new(error_code: u32, last_stream_id: StreamId, debug_data: Vec<u8>) -> Self {
        Self {
            error_code,
            last_stream_id,
            debug_data,
        }
    }

    /// The highest stream identifier the sender may still process.
    pub fn last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    /// The raw error code.
    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    /// Free-form diagnostic bytes.
    pub fn debug_data(&self) -> &[u8] {
        &self.debug_data
    }
}

/// A flow-control credit grant. On a child stream the multiplexer emits
/// one whenever the reported inbound window falls to half its target or
/// less, restoring the window to the target; root-stream grants pass
/// through untouched.
#[derive(Clone)]
pub struct WindowUpdate {
    window_size_increment: u32,
}

impl WindowUpdate {
    /// A grant of the given number of bytes.
    pub fn new(window_size_increment: u32) -> Self {
        Self {
            window_size_increment,
        }
    }

    /// How many bytes of credit this grant adds.
    pub fn increment(&self) -> u32 {
        self.window_size_increment
    }
}

/// Root-stream configuration parameters. The multiplexer does not
/// negotiate settings (that is the connection layer's business); the type
/// exists so SETTINGS frames can traverse it unchanged.
#[derive(Clone)]
pub struct Settings {
    settings: Vec<Setting>,
}

impl Settings {
    /// A SETTINGS payload from a parameter list.
    pub fn new(settings: Vec<Setting>) -> Self {
        Self { settings }
    }

    /// The parameters, in the order they were listed.
    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// An empty acknowledgement frame for a received SETTINGS.
    pub fn ack() -> Frame {
        Frame::new(
            0,
            FrameFlags::new(0x1),
            Payload::Settings(Settings::new(vec![])),
        )
    }
}

/// A single SETTINGS parameter.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Setting {
    /// SETTINGS_HEADER_TABLE_SIZE (0x01).
    HeaderTableSize(u32),
    /// SETTINGS_ENABLE_PUSH (0x02).
    EnablePush(bool),
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x03).
    MaxConcurrentStreams(u32),
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x04).
    InitialWindowSize(u32),
    /// SETTINGS_MAX_FRAME_SIZE (0x05).
    MaxFrameSize(u32),
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x06).
    MaxHeaderListSize(u32),
}

impl Setting {
    /// The wire identifier of this parameter.
    pub fn setting_identifier(&self) -> u16 {
        match self {
            Setting::HeaderTableSize(_) => 0x01,
            Setting::EnablePush(_) => 0x02,
            Setting::MaxConcurrentStreams(_) => 0x03,
            Setting::InitialWindowSize(_) => 0x04,
            Setting::MaxFrameSize(_) => 0x05,
            Setting::MaxHeaderListSize(_) => 0x06,
        }
    }
}

/// Assembles a SETTINGS payload parameter by parameter.
pub struct SettingsBuilder {
    settings: Vec<Setting>,
}

impl SettingsBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self { settings: vec![] }
    }

    fn with(mut self, setting: Setting) -> Self {
        self.settings.push(setting);
        self
    }

    /// Adds SETTINGS_HEADER_TABLE_SIZE.
    pub fn header_table_size(self, size: u32) -> Self {
        self.with(Setting::HeaderTableSize(size))
    }

    /// Adds SETTINGS_ENABLE_PUSH.
    pub fn enable_push(self, is_enable: bool) -> Self {
        self.with(Setting::EnablePush(is_enable))
    }

    /// Adds SETTINGS_MAX_CONCURRENT_STREAMS.
    pub fn max_concurrent_streams(self, num: u32) -> Self {
        self.with(Setting::MaxConcurrentStreams(num))
    }

    /// Adds SETTINGS_INITIAL_WINDOW_SIZE.
    pub fn initial_window_size(self, size: u32) -> Self {
        self.with(Setting::InitialWindowSize(size))
    }

    /// Adds SETTINGS_MAX_FRAME_SIZE.
    pub fn max_frame_size(self, size: u32) -> Self {
        self.with(Setting::MaxFrameSize(size))
    }

    /// Adds SETTINGS_MAX_HEADER_LIST_SIZE.
    pub fn max_header_list_size(self, size: u32) -> Self {
        self.with(Setting::MaxHeaderListSize(size))
    }

    /// Finishes the payload.
    pub fn build(self) -> Settings {
        Settings::new(self.settings)
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
