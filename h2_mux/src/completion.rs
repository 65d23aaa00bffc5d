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

//! Completion slots handed out by child-channel operations.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::MuxError;

/// Observable state of a [`Completion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionState<T> {
    /// The operation has not finished yet.
    Pending,
    /// The operation finished with the carried result.
    Done(Result<T, MuxError>),
}

struct Inner<T> {
    state: CompletionState<T>,
    waker: Option<Waker>,
}

/// A shared completion slot. The multiplexer resolves it exactly once; the
/// holder may inspect it synchronously with [`Completion::state`] or await
/// it as a `Future`. Clones observe the same slot.
pub struct Completion<T = ()> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Completion<T> {
    /// Creates a pending completion.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: CompletionState::Pending,
                waker: None,
            })),
        }
    }

    /// Creates an already-resolved completion.
    pub fn done(result: Result<T, MuxError>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: CompletionState::Done(result),
                waker: None,
            })),
        }
    }

    /// Resolves the completion. Later calls on an already-resolved slot are
    /// ignored, so racing resolvers keep the first result.
    pub(crate) fn complete(&self, result: Result<T, MuxError>) {
        let mut inner = self.inner.lock().unwrap();
        if let CompletionState::Done(_) = inner.state {
            return;
        }
        inner.state = CompletionState::Done(result);
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> CompletionState<T> {
        self.inner.lock().unwrap().state.clone()
    }

    /// Returns whether the completion has been resolved.
    pub fn is_done(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, CompletionState::Done(_))
    }

    /// Returns the result if the completion has been resolved.
    pub fn result(&self) -> Option<Result<T, MuxError>> {
        match self.state() {
            CompletionState::Pending => None,
            CompletionState::Done(res) => Some(res),
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Future for Completion<T> {
    type Output = Result<T, MuxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock().unwrap();
        match &inner.state {
            CompletionState::Done(res) => Poll::Ready(res.clone()),
            CompletionState::Pending => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
