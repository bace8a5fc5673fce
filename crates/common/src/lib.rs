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

//! Process-wide observability primitives shared by the FerroDB subsystems.
//!
//! The server keeps its hot-path metrics as plain atomics that the owning
//! subsystem can both update and read back (admission control and overload
//! detection read the same values that are exported). This crate provides
//! those primitives plus mutex wrappers that account for waiters and holders.

pub mod instrumented_mutex;
pub mod metrics;

pub use instrumented_mutex::{InstrumentedAsyncMutex, InstrumentedMutex, InstrumentedRwLock, MutexMetrics};
pub use metrics::{Counter, Gauge, GaugeCounterGuard};
