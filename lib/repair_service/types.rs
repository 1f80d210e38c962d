use std::time::Duration;

use crate::executor::ExecutorError;
use crate::progress::{ProgressSnapshot, TableScope};
use crate::topology::{Table, TokenGroup};

/// How a fragment that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairResult {
    Completed,
    /// The node returned a handle `<= 0`.
    NothingToRepair,
}

/// Result of executing one fragment, owned by the call that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentOutcome {
    pub result: Result<RepairResult, ExecutorError>,
    pub elapsed: Duration,
}

/// How a pass ended. Both variants carry the last snapshot the pass persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(ProgressSnapshot),
    Stopped(ProgressSnapshot),
}

impl PassOutcome {
    pub fn snapshot(&self) -> &ProgressSnapshot {
        match self {
            PassOutcome::Completed(snapshot) | PassOutcome::Stopped(snapshot) => snapshot,
        }
    }
}

/// Tally of one `run` of the repair loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passes_completed: u64,
    pub passes_abandoned: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct TablePlan {
    pub table: Table,
    pub groups: Vec<TokenGroup>,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct KeyspacePlan {
    pub name: String,
    pub tables: Vec<TablePlan>,
    pub total: u64,
}

/// The tables and rings of one pass, captured once so fragment order cannot shift mid-pass.
#[derive(Debug, Clone, Default)]
pub(crate) struct PassPlan {
    pub keyspaces: Vec<KeyspacePlan>,
    pub total: u64,
}

impl PassPlan {
    pub fn scopes(&self) -> Vec<TableScope<'_>> {
        self.keyspaces
            .iter()
            .flat_map(|keyspace| {
                keyspace.tables.iter().map(move |table| TableScope {
                    keyspace: &keyspace.name,
                    table: &table.table.name,
                    total: table.total,
                })
            })
            .collect()
    }

    pub fn table_count(&self) -> usize {
        self.keyspaces.iter().map(|keyspace| keyspace.tables.len()).sum()
    }
}
