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

//! Scheduler error types.

use thiserror::Error;

use crate::lane::RequestPriority;

/// Errors observable at the scheduler boundary.
///
/// Business errors never appear here; the scheduler only reports scheduling
/// failures. Admission failure of bounded submissions is reported by a plain
/// `bool` on the submit path, cancellation by `Cancelled` through the delay
/// future.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("queue for priority {0} is full")]
    QueueFull(RequestPriority),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("delayed work was cancelled")]
    Cancelled,

    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
}
