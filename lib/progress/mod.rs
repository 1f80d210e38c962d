//! Persisted progress of the repair loop.
//!
//! A [`ProgressSnapshot`] is an immutable-by-convention value: every transition consumes the
//! snapshot and returns the next one. Nothing here performs I/O; the orchestrator decides when a
//! snapshot is written to the store.

use serde::{Deserialize, Serialize};
use std::time::{Duration, UNIX_EPOCH};
use tracing::warn;

use crate::executor::RepairJob;

/// Most recent fragment folded into a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LastFragment {
    pub keyspace: String,
    pub table: String,
    pub id: u64,
    pub endpoint: String,
    pub start: String,
    pub end: String,
    pub command: Option<i32>,
    /// `None` when the fragment was repaired.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSnapshot {
    pub cluster: String,
    pub keyspace: String,
    pub table: String,
    pub host: String,

    pub cluster_total: u64,
    pub keyspace_total: u64,
    pub table_total: u64,

    /// Fragments visited in `table` since it was last cleared.
    pub table_cursor: u64,

    pub table_completed: u64,
    pub table_errors: u64,
    pub keyspace_completed: u64,
    pub keyspace_errors: u64,
    pub cluster_completed: u64,
    pub cluster_errors: u64,

    pub table_finished: bool,
    pub pass_finished: bool,
    pub passes_completed: u64,

    pub last_elapsed_ms: u64,
    pub updated_at_ms: u64,
    pub last_fragment: Option<LastFragment>,
}

/// One table of the current pass, in pass order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableScope<'a> {
    pub keyspace: &'a str,
    pub table: &'a str,
    pub total: u64,
}

/// Where a pass picks up: the ordinal of the first table to visit and the number of fragments to
/// skip inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumePoint {
    pub scope: usize,
    pub cursor: u64,
}

impl ResumePoint {
    pub const START: ResumePoint = ResumePoint { scope: 0, cursor: 0 };
}

impl ProgressSnapshot {
    /// Decodes a stored document. Absent, empty or malformed documents yield a zero snapshot.
    pub fn load_or_default(raw: Option<&[u8]>) -> Self {
        let Some(bytes) = raw else {
            return Self::default();
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Self::default();
        }

        match serde_json::from_slice(bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    event = "progress_snapshot_decode_failed",
                    error = %err,
                    bytes = bytes.len(),
                    "stored progress is unreadable; starting from zero"
                );
                Self::default()
            }
        }
    }

    pub fn with_identity(mut self, cluster: &str, host: &str, cluster_total: u64) -> Self {
        self.cluster = cluster.to_string();
        self.host = host.to_string();
        self.cluster_total = cluster_total;
        self
    }

    /// Points the snapshot at the table about to be walked.
    pub fn with_live_totals(
        mut self,
        cluster: &str,
        cluster_total: u64,
        keyspace: &str,
        keyspace_total: u64,
        table: &str,
        table_total: u64,
    ) -> Self {
        self.cluster = cluster.to_string();
        self.cluster_total = cluster_total;
        self.keyspace = keyspace.to_string();
        self.keyspace_total = keyspace_total;
        self.table = table.to_string();
        self.table_total = table_total;
        self.table_finished = false;
        self
    }

    /// Decides where the pass described by `scopes` resumes, resetting whatever the stored
    /// position can no longer be trusted for.
    pub fn resume_cursor(self, cluster: &str, scopes: &[TableScope<'_>]) -> (Self, ResumePoint) {
        let foreign_cluster = !self.cluster.is_empty() && self.cluster != cluster;
        if self.pass_finished || self.table.is_empty() || foreign_cluster {
            return (self.reset_position(), ResumePoint::START);
        }

        let Some(index) = scopes
            .iter()
            .position(|scope| scope.keyspace == self.keyspace && scope.table == self.table)
        else {
            return (self.reset_position(), ResumePoint::START);
        };

        if self.table_finished {
            let next = index + 1;
            let leaves_keyspace = scopes
                .get(next)
                .map_or(true, |scope| scope.keyspace != self.keyspace);
            let snapshot = if leaves_keyspace {
                self.clear_keyspace()
            } else {
                self
            };
            return (
                snapshot,
                ResumePoint {
                    scope: next,
                    cursor: 0,
                },
            );
        }

        if self.table_cursor > scopes[index].total {
            let mut snapshot = self.clear_table();
            snapshot.table_finished = false;
            return (
                snapshot,
                ResumePoint {
                    scope: index,
                    cursor: 0,
                },
            );
        }

        let cursor = self.table_cursor;
        (
            self,
            ResumePoint {
                scope: index,
                cursor,
            },
        )
    }

    pub fn complete_fragment(mut self, job: &RepairJob, elapsed: Duration) -> Self {
        self.table_completed += 1;
        self.keyspace_completed += 1;
        self.cluster_completed += 1;
        self.record_fragment(job, elapsed, None)
    }

    pub fn error_fragment(
        mut self,
        job: &RepairJob,
        elapsed: Duration,
        message: impl Into<String>,
    ) -> Self {
        self.table_errors += 1;
        self.keyspace_errors += 1;
        self.cluster_errors += 1;
        self.record_fragment(job, elapsed, Some(message.into()))
    }

    pub fn clear_table(mut self) -> Self {
        self.table_cursor = 0;
        self.table_completed = 0;
        self.table_errors = 0;
        self.table_finished = true;
        self
    }

    pub fn clear_keyspace(mut self) -> Self {
        self.keyspace_completed = 0;
        self.keyspace_errors = 0;
        self
    }

    pub fn clear_cluster(mut self) -> Self {
        self.cluster_completed = 0;
        self.cluster_errors = 0;
        self.keyspace.clear();
        self.table.clear();
        self.keyspace_total = 0;
        self.table_total = 0;
        self.table_finished = false;
        self.pass_finished = false;
        self
    }

    pub fn finish_pass(mut self) -> Self {
        self.pass_finished = true;
        self.passes_completed += 1;
        self
    }

    pub fn to_document(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Share of the cluster pass already visited, successful or not.
    pub fn cluster_progress_percent(&self) -> u64 {
        if self.cluster_total == 0 {
            return 0;
        }
        let visited = self.cluster_completed + self.cluster_errors;
        (visited.saturating_mul(100) / self.cluster_total).min(100)
    }

    fn record_fragment(mut self, job: &RepairJob, elapsed: Duration, error: Option<String>) -> Self {
        self.table_cursor += 1;
        self.last_elapsed_ms = millis(elapsed);
        self.updated_at_ms = job
            .started_at
            .checked_add(elapsed)
            .and_then(|finished| finished.duration_since(UNIX_EPOCH).ok())
            .map_or(0, millis);
        self.last_fragment = Some(LastFragment {
            keyspace: job.keyspace.clone(),
            table: job.table.clone(),
            id: job.fragment_id,
            endpoint: job.endpoint.clone(),
            start: job.range.start.to_string(),
            end: job.range.end.to_string(),
            command: job.command,
            error,
        });
        self
    }

    fn reset_position(self) -> Self {
        Self {
            host: self.host,
            passes_completed: self.passes_completed,
            last_elapsed_ms: self.last_elapsed_ms,
            updated_at_ms: self.updated_at_ms,
            last_fragment: self.last_fragment,
            ..Self::default()
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
