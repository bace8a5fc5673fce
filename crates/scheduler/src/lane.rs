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

//! Request lanes and their mapping to scheduler priorities.
//!
//! A lane names the logical origin of a task (client request, replication,
//! cluster-internal traffic, delayed futures, ...). Lanes are stable
//! identifiers: their names are metric labels, so adding or renaming one is a
//! breaking change to the metrics contract.

use std::fmt;

/// Logical origin of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestLane {
    /// Requests that do not block or wait for anything.
    ClientFast,
    /// Requests that execute a query or are tightly related to one.
    ClientAql,
    /// Requests executed within a scripting context.
    ClientV8,
    /// Requests that might block or wait, and are neither AQL nor V8.
    ClientSlow,
    /// Requests sent by the web UI.
    ClientUi,
    /// Requests between agents, i.e. the consensus traffic itself.
    AgencyInternal,
    /// Requests from DB servers or coordinators accessing the agency.
    AgencyCluster,
    /// Coordinator/DB-server traffic that is neither AQL nor V8.
    ClusterInternal,
    /// Coordinator/DB-server traffic carrying AQL.
    ClusterAql,
    /// Coordinator-to-DB-server traffic using V8.
    ClusterV8,
    /// Administration and diagnostics between cluster nodes.
    ClusterAdmin,
    /// Leader/follower replication state comparison.
    ServerReplication,
    /// Replication catch-up (log tailing back to in-sync mode).
    ServerReplicationCatchup,
    /// Synchronous replication between leader and followers.
    ServerSynchronousReplication,
    /// Periodic or one-off V8-based tasks executed by the scheduler.
    TaskV8,
    /// Internal tasks with low priority.
    InternalLow,
    /// Continuations of tasks that yielded.
    Continuation,
    /// Futures that have been delayed via the scheduler.
    DelayedFuture,
    /// Fallback for tasks without a meaningful origin.
    Undefined,
}

/// Priority class of a pool. Numeric order is urgency order: small values are
/// more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestPriority {
    Maintenance = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

pub const NUM_PRIORITIES: usize = 4;

impl RequestLane {
    pub const ALL: [RequestLane; 19] = [
        RequestLane::ClientFast,
        RequestLane::ClientAql,
        RequestLane::ClientV8,
        RequestLane::ClientSlow,
        RequestLane::ClientUi,
        RequestLane::AgencyInternal,
        RequestLane::AgencyCluster,
        RequestLane::ClusterInternal,
        RequestLane::ClusterAql,
        RequestLane::ClusterV8,
        RequestLane::ClusterAdmin,
        RequestLane::ServerReplication,
        RequestLane::ServerReplicationCatchup,
        RequestLane::ServerSynchronousReplication,
        RequestLane::TaskV8,
        RequestLane::InternalLow,
        RequestLane::Continuation,
        RequestLane::DelayedFuture,
        RequestLane::Undefined,
    ];

    /// Stable metric label for this lane.
    pub fn name(self) -> &'static str {
        match self {
            Self::ClientFast => "client_fast",
            Self::ClientAql => "client_aql",
            Self::ClientV8 => "client_v8",
            Self::ClientSlow => "client_slow",
            Self::ClientUi => "client_ui",
            Self::AgencyInternal => "agency_internal",
            Self::AgencyCluster => "agency_cluster",
            Self::ClusterInternal => "cluster_internal",
            Self::ClusterAql => "cluster_aql",
            Self::ClusterV8 => "cluster_v8",
            Self::ClusterAdmin => "cluster_admin",
            Self::ServerReplication => "server_replication",
            Self::ServerReplicationCatchup => "server_replication_catchup",
            Self::ServerSynchronousReplication => "server_synchronous_replication",
            Self::TaskV8 => "task_v8",
            Self::InternalLow => "internal_low",
            Self::Continuation => "continuation",
            Self::DelayedFuture => "delayed_future",
            Self::Undefined => "undefined",
        }
    }

    /// Dense index for metric arrays.
    pub fn as_index(self) -> usize {
        match self {
            Self::ClientFast => 0,
            Self::ClientAql => 1,
            Self::ClientV8 => 2,
            Self::ClientSlow => 3,
            Self::ClientUi => 4,
            Self::AgencyInternal => 5,
            Self::AgencyCluster => 6,
            Self::ClusterInternal => 7,
            Self::ClusterAql => 8,
            Self::ClusterV8 => 9,
            Self::ClusterAdmin => 10,
            Self::ServerReplication => 11,
            Self::ServerReplicationCatchup => 12,
            Self::ServerSynchronousReplication => 13,
            Self::TaskV8 => 14,
            Self::InternalLow => 15,
            Self::Continuation => 16,
            Self::DelayedFuture => 17,
            Self::Undefined => 18,
        }
    }
}

impl fmt::Display for RequestLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} with priority: {}", self.name(), priority_for_lane(*self))
    }
}

impl RequestPriority {
    pub const ALL: [RequestPriority; NUM_PRIORITIES] = [
        RequestPriority::Maintenance,
        RequestPriority::High,
        RequestPriority::Medium,
        RequestPriority::Low,
    ];

    pub fn as_index(self) -> usize {
        self as usize
    }

    /// Stable metric label for this priority class.
    pub fn name(self) -> &'static str {
        match self {
            Self::Maintenance => "maintenance",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Total lane-to-priority map, fixed at build time.
///
/// `Continuation` maps to the default here; the scheduler resolves it through
/// its configuration instead.
pub fn priority_for_lane(lane: RequestLane) -> RequestPriority {
    match lane {
        RequestLane::ClientFast => RequestPriority::High,
        RequestLane::ClientAql => RequestPriority::Low,
        RequestLane::ClientV8 => RequestPriority::Low,
        RequestLane::ClientSlow => RequestPriority::Low,
        RequestLane::ClientUi => RequestPriority::Low,
        RequestLane::AgencyInternal => RequestPriority::High,
        RequestLane::AgencyCluster => RequestPriority::Low,
        RequestLane::ClusterInternal => RequestPriority::High,
        RequestLane::ClusterAql => RequestPriority::Medium,
        RequestLane::ClusterV8 => RequestPriority::Low,
        RequestLane::ClusterAdmin => RequestPriority::Maintenance,
        RequestLane::ServerReplication => RequestPriority::Low,
        RequestLane::ServerReplicationCatchup => RequestPriority::Medium,
        RequestLane::ServerSynchronousReplication => RequestPriority::High,
        RequestLane::TaskV8 => RequestPriority::Low,
        RequestLane::InternalLow => RequestPriority::Low,
        RequestLane::Continuation => RequestPriority::Medium,
        RequestLane::DelayedFuture => RequestPriority::High,
        RequestLane::Undefined => RequestPriority::Low,
    }
}
