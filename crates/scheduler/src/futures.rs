// FerroDB
// Copyright (C) 2025 FerroDB Contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Futures returned by the scheduler's async entry points.

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::cron::WorkHandle;
use crate::error::SchedulerError;
use crate::lane::RequestLane;
use crate::scheduler::SchedulerInner;

/// Completes when a delayed task fires.
///
/// Resolves `Ok(())` on a normal fire and `Err(Cancelled)` when the delay was
/// cancelled, e.g. because the scheduler shut down first. Dropping the future
/// drops the embedded work handle and thereby cancels the delay.
pub struct DelayFuture {
    state: DelayState,
}

enum DelayState {
    Immediate,
    Pending {
        receiver: oneshot::Receiver<bool>,
        _handle: WorkHandle,
    },
}

impl DelayFuture {
    pub(crate) fn immediate() -> Self {
        Self {
            state: DelayState::Immediate,
        }
    }

    pub(crate) fn pending(receiver: oneshot::Receiver<bool>, handle: WorkHandle) -> Self {
        Self {
            state: DelayState::Pending {
                receiver,
                _handle: handle,
            },
        }
    }
}

impl Future for DelayFuture {
    type Output = Result<(), SchedulerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            DelayState::Immediate => Poll::Ready(Ok(())),
            DelayState::Pending { receiver, .. } => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(false)) => Poll::Ready(Ok(())),
                Poll::Ready(Ok(true)) | Poll::Ready(Err(_)) => Poll::Ready(Err(SchedulerError::Cancelled)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Cooperative reschedule: suspends once and wakes from a worker of the
/// target lane's pool.
pub struct YieldFuture {
    scheduler: Weak<SchedulerInner>,
    lane: RequestLane,
    yielded: bool,
}

impl YieldFuture {
    pub(crate) fn new(scheduler: Weak<SchedulerInner>, lane: RequestLane) -> Self {
        Self {
            scheduler,
            lane,
            yielded: false,
        }
    }
}

impl Future for YieldFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        this.yielded = true;
        if let Some(inner) = this.scheduler.upgrade() {
            let waker = cx.waker().clone();
            if inner.queue_boxed(this.lane, Box::new(move || waker.wake())).is_ok() {
                return Poll::Pending;
            }
        }
        // scheduler gone or stopping: nothing to reschedule onto
        Poll::Ready(())
    }
}

/// Result of `submit_with_future`: the closure's return value, or
/// `Cancelled` when the task was dropped unexecuted at shutdown.
pub struct SubmitFuture<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> SubmitFuture<R> {
    pub(crate) fn new(receiver: oneshot::Receiver<R>) -> Self {
        Self { receiver }
    }
}

impl<R> Future for SubmitFuture<R> {
    type Output = Result<R, SchedulerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().receiver).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SchedulerError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
