use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use num::BigInt;

use super::{RepairOrchestratorConfig, StopSignal};
use crate::agent_client::AgentError;
use crate::executor::{
    CompletionSender, ExecutorError, RepairCommand, RepairExecutor, RepairJob,
};
use crate::progress::ProgressSnapshot;
use crate::segmenter::RepairRange;
use crate::store::{MemoryProgressStore, ProgressStore, StoreError};
use crate::topology::{Fragment, Table, TokenGroup, Topology, TopologyError};

pub(super) fn test_config(keyspaces: &[&str]) -> RepairOrchestratorConfig {
    let mut config = RepairOrchestratorConfig::new(
        "test",
        keyspaces.iter().map(|keyspace| keyspace.to_string()).collect(),
    );
    config.host = "worker-1".to_string();
    config.retry_delay = Duration::from_millis(10);
    config
}

/// Topology with fixed tables; each table's fragments are spread over two token groups.
#[derive(Default)]
pub(super) struct ScriptedTopology {
    tables: HashMap<String, Vec<(Table, u64)>>,
    fail: AtomicBool,
}

impl ScriptedTopology {
    pub(super) fn with_table(mut self, keyspace: &str, table: &str, fragments: u64) -> Self {
        self.tables.entry(keyspace.to_string()).or_default().push((
            Table {
                name: table.to_string(),
                slices: fragments,
            },
            fragments,
        ));
        self
    }

    pub(super) fn failing() -> Self {
        let topology = Self::default();
        topology.fail.store(true, Ordering::SeqCst);
        topology
    }

    fn groups_for(&self, keyspace: &str, table: &Table) -> Vec<TokenGroup> {
        let count = self
            .tables
            .get(keyspace)
            .and_then(|tables| tables.iter().find(|(known, _)| known.name == table.name))
            .map_or(0, |(_, count)| *count);

        let fragments: Vec<Fragment> = (0..count)
            .map(|id| {
                let start = BigInt::from(id * 10);
                let end = BigInt::from(id * 10 + 10);
                Fragment {
                    id,
                    endpoint: format!("10.0.0.{}", id % 2 + 1),
                    range: RepairRange::new(start, end),
                }
            })
            .collect();

        let split = fragments.len() / 2;
        let (first, second) = fragments.split_at(split);
        [first, second]
            .into_iter()
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| TokenGroup {
                endpoint: chunk[0].endpoint.clone(),
                arc: RepairRange::new(
                    chunk[0].range.start.clone(),
                    chunk[chunk.len() - 1].range.end.clone(),
                ),
                fragments: chunk.to_vec(),
            })
            .collect()
    }
}

impl Topology for ScriptedTopology {
    fn list_tables<'a>(&'a self, keyspace: &'a str) -> BoxFuture<'a, Result<Vec<Table>, TopologyError>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TopologyError::Agent(AgentError::UnexpectedStatus {
                    resource: format!("tables of {keyspace}"),
                    status: 503,
                }));
            }
            Ok(self
                .tables
                .get(keyspace)
                .map(|tables| tables.iter().map(|(table, _)| table.clone()).collect())
                .unwrap_or_default())
        })
    }

    fn describe_ring<'a>(
        &'a self,
        keyspace: &'a str,
        table: &'a Table,
    ) -> BoxFuture<'a, Result<Vec<TokenGroup>, TopologyError>> {
        Box::pin(async move { Ok(self.groups_for(keyspace, table)) })
    }
}

pub(super) enum Step {
    Complete,
    NothingToRepair,
    RejectSubmit,
    FailCompletion,
    DropCompletion,
    /// Keeps the command running until it is aborted; the abort settles it at once.
    Hang,
    /// Like [`Step::Hang`], but the command reports its terminal state only this long after
    /// the abort was accepted.
    HangSettlingAfter(Duration),
    /// Rejects the abort; the command finishes on its own this long afterwards.
    HangRefusingAbort(Duration),
}

struct HeldCommand {
    handle: i32,
    sender: CompletionSender,
    settle_after: Duration,
    refuse_abort: bool,
}

/// Executor that plays back scripted steps, defaulting to [`Step::Complete`] once exhausted.
#[derive(Default)]
pub(super) struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    submitted: Mutex<Vec<RepairJob>>,
    held: Mutex<Vec<HeldCommand>>,
    settling: Arc<AtomicUsize>,
    aborted: Mutex<Vec<i32>>,
    overlapped: AtomicBool,
    next_handle: AtomicI32,
    stop_after: Option<(usize, Arc<StopSignal>)>,
}

impl ScriptedExecutor {
    pub(super) fn with_steps(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Requests a stop while the `calls`-th submission is being made.
    pub(super) fn stop_after(mut self, calls: usize, stop: Arc<StopSignal>) -> Self {
        self.stop_after = Some((calls, stop));
        self
    }

    pub(super) fn submitted(&self) -> Vec<(String, u64)> {
        self.submitted
            .lock()
            .expect("submitted mutex poisoned")
            .iter()
            .map(|job| (job.table.clone(), job.fragment_id))
            .collect()
    }

    pub(super) fn submitted_jobs(&self) -> Vec<RepairJob> {
        self.submitted
            .lock()
            .expect("submitted mutex poisoned")
            .clone()
    }

    pub(super) fn aborted(&self) -> Vec<i32> {
        self.aborted.lock().expect("aborted mutex poisoned").clone()
    }

    /// Whether a submission was made while an earlier command was still running.
    pub(super) fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn hold(&self, handle: i32, settle_after: Duration, refuse_abort: bool) -> RepairCommand {
        let (command, sender) = RepairCommand::pending(handle);
        self.held.lock().expect("held mutex poisoned").push(HeldCommand {
            handle,
            sender,
            settle_after,
            refuse_abort,
        });
        command
    }

    fn settle_later(&self, sender: CompletionSender, after: Duration, result: Result<(), ExecutorError>) {
        let settling = self.settling.clone();
        settling.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            settling.fetch_sub(1, Ordering::SeqCst);
            let _ = sender.send(result);
        });
    }

    fn abort_held(&self, handle: i32) -> Result<(), ExecutorError> {
        self.aborted.lock().expect("aborted mutex poisoned").push(handle);
        let held = {
            let mut held = self.held.lock().expect("held mutex poisoned");
            match held.iter().position(|command| command.handle == handle) {
                Some(index) => held.remove(index),
                None => return Ok(()),
            }
        };

        if held.refuse_abort {
            self.settle_later(held.sender, held.settle_after, Ok(()));
            return Err(ExecutorError::Abort {
                command: handle,
                message: "agent unreachable".to_string(),
            });
        }
        let aborted = Err(ExecutorError::Failed {
            command: handle,
            message: "repair aborted".to_string(),
        });
        if held.settle_after.is_zero() {
            let _ = held.sender.send(aborted);
        } else {
            self.settle_later(held.sender, held.settle_after, aborted);
        }
        Ok(())
    }

    fn play(&self, job: &RepairJob) -> Result<RepairCommand, ExecutorError> {
        let still_running = !self.held.lock().expect("held mutex poisoned").is_empty()
            || self.settling.load(Ordering::SeqCst) > 0;
        if still_running {
            self.overlapped.store(true, Ordering::SeqCst);
        }

        let calls = {
            let mut submitted = self.submitted.lock().expect("submitted mutex poisoned");
            submitted.push(job.clone());
            submitted.len()
        };
        if let Some((after, stop)) = &self.stop_after {
            if calls == *after {
                stop.request_stop();
            }
        }

        let step = self
            .steps
            .lock()
            .expect("steps mutex poisoned")
            .pop_front()
            .unwrap_or(Step::Complete);
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;

        match step {
            Step::Complete => {
                let (command, sender) = RepairCommand::pending(handle);
                let _ = sender.send(Ok(()));
                Ok(command)
            }
            Step::NothingToRepair => Ok(RepairCommand::nothing_to_repair(0)),
            Step::RejectSubmit => Err(ExecutorError::Submit("connection refused".to_string())),
            Step::FailCompletion => {
                let (command, sender) = RepairCommand::pending(handle);
                let _ = sender.send(Err(ExecutorError::Failed {
                    command: handle,
                    message: "merkle tree mismatch".to_string(),
                }));
                Ok(command)
            }
            Step::DropCompletion => {
                let (command, _sender) = RepairCommand::pending(handle);
                Ok(command)
            }
            Step::Hang => Ok(self.hold(handle, Duration::ZERO, false)),
            Step::HangSettlingAfter(after) => Ok(self.hold(handle, after, false)),
            Step::HangRefusingAbort(after) => Ok(self.hold(handle, after, true)),
        }
    }
}

impl RepairExecutor for ScriptedExecutor {
    fn submit<'a>(&'a self, job: &'a RepairJob) -> BoxFuture<'a, Result<RepairCommand, ExecutorError>> {
        let result = self.play(job);
        Box::pin(async move { result })
    }

    fn abort<'a>(&'a self, _job: &'a RepairJob, command: i32) -> BoxFuture<'a, Result<(), ExecutorError>> {
        let result = self.abort_held(command);
        Box::pin(async move { result })
    }
}

/// In-memory store that also keeps every snapshot written to it.
#[derive(Default)]
pub(super) struct RecordingStore {
    inner: MemoryProgressStore,
    history: Mutex<Vec<ProgressSnapshot>>,
}

impl RecordingStore {
    pub(super) fn seeded(key: &str, snapshot: &ProgressSnapshot) -> Self {
        Self::seeded_raw(key, snapshot.to_document().expect("encode seed"))
    }

    pub(super) fn seeded_raw(key: &str, raw: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: MemoryProgressStore::with_entry(key, raw),
            history: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn history(&self) -> Vec<ProgressSnapshot> {
        self.history.lock().expect("history mutex poisoned").clone()
    }

    pub(super) fn current(&self, key: &str) -> Option<ProgressSnapshot> {
        self.inner
            .get(key)
            .map(|raw| ProgressSnapshot::load_or_default(Some(raw.as_slice())))
    }
}

impl ProgressStore for RecordingStore {
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        self.inner.read(key)
    }

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>> {
        self.history
            .lock()
            .expect("history mutex poisoned")
            .push(ProgressSnapshot::load_or_default(Some(value.as_slice())));
        self.inner.write(key, value)
    }
}

/// Store whose every call fails.
pub(super) struct UnavailableStore;

impl ProgressStore for UnavailableStore {
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(async move {
            Err(StoreError::UnexpectedStatus {
                key: key.to_string(),
                status: 503,
            })
        })
    }

    fn write<'a>(&'a self, key: &'a str, _value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            Err(StoreError::UnexpectedStatus {
                key: key.to_string(),
                status: 503,
            })
        })
    }
}

pub(super) fn positioned(keyspace: &str, table: &str, cursor: u64) -> ProgressSnapshot {
    ProgressSnapshot {
        cluster: "test".to_string(),
        keyspace: keyspace.to_string(),
        table: table.to_string(),
        table_cursor: cursor,
        table_completed: cursor,
        keyspace_completed: cursor,
        cluster_completed: cursor,
        ..ProgressSnapshot::default()
    }
}
