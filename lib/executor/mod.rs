//! Repair submission seam.
//!
//! The orchestrator never talks to a node directly. It hands a [`RepairJob`] to a
//! [`RepairExecutor`], gets back a command handle plus a one-shot completion channel, and blocks
//! on that channel.

mod agent;

pub use agent::AgentRepairExecutor;

use futures::future::BoxFuture;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::segmenter::RepairRange;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("no node agent configured for endpoint {0}")]
    UnknownEndpoint(String),
    #[error("repair submission failed: {0}")]
    Submit(String),
    #[error("repair command {command} failed: {message}")]
    Failed { command: i32, message: String },
    #[error("lost track of repair command {command}: {message}")]
    Status { command: i32, message: String },
    #[error("completion channel for repair command {0} closed before it reported")]
    CompletionDropped(i32),
    #[error("repair command {command} did not complete within {timeout:?}")]
    TimedOut { command: i32, timeout: Duration },
    #[error("could not abort repair command {command}: {message}")]
    Abort { command: i32, message: String },
}

/// Validation strategy requested from the node for one repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RepairParallelism {
    #[default]
    #[serde(rename = "sequential")]
    Sequential,
    #[serde(rename = "parallel")]
    Parallel,
    #[serde(rename = "dc_parallel")]
    DatacenterAware,
}

impl RepairParallelism {
    pub fn as_str(self) -> &'static str {
        match self {
            RepairParallelism::Sequential => "sequential",
            RepairParallelism::Parallel => "parallel",
            RepairParallelism::DatacenterAware => "dc_parallel",
        }
    }
}

impl FromStr for RepairParallelism {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(RepairParallelism::Sequential),
            "parallel" => Ok(RepairParallelism::Parallel),
            "dc_parallel" | "dc-parallel" => Ok(RepairParallelism::DatacenterAware),
            other => Err(format!(
                "unknown repair parallelism `{other}` (expected sequential, parallel or dc_parallel)"
            )),
        }
    }
}

/// Cluster-wide repair settings applied to every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepairSettings {
    pub parallelism: RepairParallelism,
    pub incremental: bool,
}

/// Options map sent with a repair submission, keyed the way the node's repair service expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOptions {
    pub parallelism: RepairParallelism,
    pub incremental: bool,
    pub primary_range: bool,
    pub column_families: Vec<String>,
    /// `start:end` token pairs.
    pub ranges: Vec<String>,
}

impl RepairOptions {
    pub fn for_range(settings: RepairSettings, table: &str, range: &RepairRange) -> Self {
        Self {
            parallelism: settings.parallelism,
            incremental: settings.incremental,
            primary_range: false,
            column_families: vec![table.to_string()],
            ranges: vec![format!("{}:{}", range.start, range.end)],
        }
    }
}

/// Everything known about one fragment execution. Built fresh per fragment and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairJob {
    pub fragment_id: u64,
    pub cluster: String,
    pub keyspace: String,
    pub table: String,
    pub endpoint: String,
    pub range: RepairRange,
    pub started_at: SystemTime,
    pub options: RepairOptions,
    /// Handle assigned by the executor once the job is submitted.
    pub command: Option<i32>,
}

pub type CompletionReceiver = oneshot::Receiver<Result<(), ExecutorError>>;
pub type CompletionSender = oneshot::Sender<Result<(), ExecutorError>>;

/// Result of a submission.
///
/// A handle `<= 0` means the node found nothing to repair; such commands carry no completion
/// channel.
#[derive(Debug)]
pub struct RepairCommand {
    pub handle: i32,
    pub completion: Option<CompletionReceiver>,
}

impl RepairCommand {
    pub fn nothing_to_repair(handle: i32) -> Self {
        Self {
            handle,
            completion: None,
        }
    }

    /// Creates a running command and the sender its completion must be reported on.
    pub fn pending(handle: i32) -> (Self, CompletionSender) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                handle,
                completion: Some(receiver),
            },
            sender,
        )
    }
}

/// Submits repairs to the cluster.
///
/// Kept as a trait so the orchestrator can be driven by scripted executors in tests.
pub trait RepairExecutor: Send + Sync {
    fn submit<'a>(&'a self, job: &'a RepairJob) -> BoxFuture<'a, Result<RepairCommand, ExecutorError>>;

    /// Requests termination of a running command. Its completion channel still reports the
    /// terminal state once the node has stopped it.
    fn abort<'a>(&'a self, job: &'a RepairJob, command: i32) -> BoxFuture<'a, Result<(), ExecutorError>>;
}

impl<T> RepairExecutor for Arc<T>
where
    T: RepairExecutor + ?Sized,
{
    fn submit<'a>(&'a self, job: &'a RepairJob) -> BoxFuture<'a, Result<RepairCommand, ExecutorError>> {
        (**self).submit(job)
    }

    fn abort<'a>(&'a self, job: &'a RepairJob, command: i32) -> BoxFuture<'a, Result<(), ExecutorError>> {
        (**self).abort(job, command)
    }
}
