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

//! Multiplexer drive coroutine.
//!
//! [`MuxManager`] owns a [`StreamMultiplexer`] and pumps it from channels:
//! inbound frames and lifecycle events arrive from the connection codec,
//! released frames leave towards it, and users commit new outbound streams
//! through a request channel. One manager runs per connection, on that
//! connection's task.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use h2_frame::{ErrorCode, Frame, H2Error};
use tracing::{debug, warn};

use crate::completion::Completion;
use crate::error::MuxError;
use crate::events::StreamEvent;
use crate::handler::StreamInitializer;
use crate::multiplexer::{IngestOutcome, StreamMultiplexer};
use crate::runtime::{BoundedReceiver, UnboundedReceiver, UnboundedSender};
use crate::streams::StreamKey;

/// Messages from the connection layer to the manager.
pub enum ConnMessage {
    /// A decoded inbound frame.
    Frame(Frame),
    /// A lifecycle event.
    Event(StreamEvent),
    /// The connection ended in an orderly way.
    Shutdown,
}

/// User requests to the manager.
pub enum MuxRequest {
    /// Commit a new locally-initiated stream. The completion resolves with
    /// the stream key once the multiplexer accepted the stream.
    CreateStream {
        /// Setup for the new stream.
        initializer: StreamInitializer,
        /// Resolved with the key of the created stream.
        completion: Completion<StreamKey>,
    },
}

/// Why the manager exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// A connection-scoped multiplexer error.
    Mux(MuxError),
    /// A channel to the connection layer closed underneath the manager.
    ChannelClosed,
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerError::Mux(e) => write!(f, "{e}"),
            ManagerError::ChannelClosed => write!(f, "connection channel closed"),
        }
    }
}

impl std::error::Error for ManagerError {}

/// Drives one [`StreamMultiplexer`] from channels. Poll it on the
/// connection task until it resolves.
pub struct MuxManager {
    mux: StreamMultiplexer,
    // Channel receiver between the connection codec and the manager.
    conn_rx: BoundedReceiver<ConnMessage>,
    // Channel receiver between user handles and the manager.
    req_rx: UnboundedReceiver<MuxRequest>,
    // Channel transmitter towards the connection codec.
    input_tx: UnboundedSender<Frame>,
    // Channel transmitter for frames that pass through the multiplexer
    // unchanged (connection-level and PRIORITY frames).
    ctrl_tx: UnboundedSender<Frame>,
    in_burst: bool,
    req_closed: bool,
}

impl Future for MuxManager {
    type Output = Result<(), ManagerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let manager = self.get_mut();
        loop {
            manager.poll_recv_requests(cx);

            let message = match manager.poll_recv_conn(cx) {
                Poll::Ready(Some(message)) => message,
                Poll::Ready(None) => {
                    manager.mux.fail_all_streams(Some(ErrorCode::InternalError));
                    manager.mux.run_pending_tasks();
                    return Poll::Ready(Err(ManagerError::ChannelClosed));
                }
                Poll::Pending => {
                    if manager.in_burst {
                        manager.in_burst = false;
                        manager.mux.read_complete();
                        manager.flush_outbound()?;
                        manager.mux.run_pending_tasks();
                    }
                    return Poll::Pending;
                }
            };

            match message {
                ConnMessage::Frame(frame) => {
                    manager.in_burst = true;
                    match manager.mux.ingest(frame) {
                        Ok(IngestOutcome::Routed) => {}
                        Ok(IngestOutcome::Passthrough(frame)) => {
                            if manager.ctrl_tx.send(frame).is_err() {
                                manager.mux.fail_all_streams(Some(ErrorCode::InternalError));
                                manager.mux.run_pending_tasks();
                                return Poll::Ready(Err(ManagerError::ChannelClosed));
                            }
                        }
                        // Unknown-stream frames are reported on the
                        // connection inbound path, not to any child.
                        Err(e) => warn!(%e, "inbound frame rejected"),
                    }
                }
                ConnMessage::Event(event) => {
                    if let Err(e) = manager.mux.handle_event(event) {
                        let reason = match e {
                            MuxError::Connection(H2Error::ConnectionError(code)) => Some(code),
                            _ => Some(ErrorCode::InternalError),
                        };
                        manager.mux.fail_all_streams(reason);
                        let _ = manager.flush_outbound();
                        manager.mux.run_pending_tasks();
                        return Poll::Ready(Err(ManagerError::Mux(e)));
                    }
                }
                ConnMessage::Shutdown => {
                    debug!("connection shut down");
                    manager.mux.fail_all_streams(None);
                    let _ = manager.flush_outbound();
                    manager.mux.run_pending_tasks();
                    return Poll::Ready(Ok(()));
                }
            }

            manager.flush_outbound()?;
            manager.mux.run_pending_tasks();
        }
    }
}

impl MuxManager {
    /// Creates a manager around a multiplexer and its channels.
    pub fn new(
        mux: StreamMultiplexer,
        conn_rx: BoundedReceiver<ConnMessage>,
        req_rx: UnboundedReceiver<MuxRequest>,
        input_tx: UnboundedSender<Frame>,
        ctrl_tx: UnboundedSender<Frame>,
    ) -> Self {
        Self {
            mux,
            conn_rx,
            req_rx,
            input_tx,
            ctrl_tx,
            in_burst: false,
            req_closed: false,
        }
    }

    /// The multiplexer being driven. Useful between polls in tests.
    pub fn mux_mut(&mut self) -> &mut StreamMultiplexer {
        &mut self.mux
    }

    fn poll_recv_requests(&mut self, cx: &mut Context<'_>) {
        if self.req_closed {
            return;
        }
        loop {
            #[cfg(feature = "tokio_base")]
            let request = match self.req_rx.poll_recv(cx) {
                Poll::Ready(Some(request)) => request,
                Poll::Ready(None) => {
                    self.req_closed = true;
                    return;
                }
                Poll::Pending => return,
            };
            #[cfg(feature = "ylong_base")]
            let request = match self.req_rx.poll_recv(cx) {
                Poll::Ready(Ok(request)) => request,
                Poll::Ready(Err(_)) => {
                    self.req_closed = true;
                    return;
                }
                Poll::Pending => return,
            };
            match request {
                MuxRequest::CreateStream {
                    initializer,
                    completion,
                } => match self.mux.create_stream(initializer) {
                    Ok((key, _setup)) => completion.complete(Ok(key)),
                    Err(e) => completion.complete(Err(e)),
                },
            }
            let _ = self.flush_outbound();
        }
    }

    fn poll_recv_conn(&mut self, cx: &mut Context<'_>) -> Poll<Option<ConnMessage>> {
        #[cfg(feature = "tokio_base")]
        return self.conn_rx.poll_recv(cx);
        #[cfg(feature = "ylong_base")]
        match self.conn_rx.poll_recv(cx) {
            Poll::Ready(Ok(message)) => Poll::Ready(Some(message)),
            Poll::Ready(Err(_)) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn flush_outbound(&mut self) -> Result<(), ManagerError> {
        while let Some(frame) = self.mux.pop_outbound() {
            self.input_tx
                .send(frame)
                .map_err(|_| ManagerError::ChannelClosed)?;
        }
        Ok(())
    }
}
