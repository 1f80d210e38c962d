use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

use super::error::Error;
use super::stop::StopSignal;
use super::types::{
    FragmentOutcome, KeyspacePlan, PassOutcome, PassPlan, RepairResult, RunSummary, TablePlan,
};
use crate::executor::{
    CompletionReceiver, ExecutorError, RepairExecutor, RepairJob, RepairOptions, RepairSettings,
};
use crate::progress::ProgressSnapshot;
use crate::server::monitoring::REPAIR_METRICS;
use crate::store::ProgressStore;
use crate::topology::{fragment_count, Fragment, Topology};

/// Configuration for the repair loop.
#[derive(Debug, Clone)]
pub struct RepairOrchestratorConfig {
    pub cluster: String,
    /// Walked in this order every pass.
    pub keyspaces: Vec<String>,
    /// Reported in the snapshot so operators can tell which worker wrote it.
    pub host: String,
    pub progress_key: String,
    /// Sleep between the end of one pass and the start of the next.
    pub interval: Duration,
    /// Sleep before planning again after the topology could not be read.
    pub retry_delay: Duration,
    /// Upper bound on waiting for one repair command. `None` waits forever.
    pub completion_timeout: Option<Duration>,
    pub repair: RepairSettings,
}

impl RepairOrchestratorConfig {
    pub fn new(cluster: impl Into<String>, keyspaces: Vec<String>) -> Self {
        let cluster = cluster.into();
        Self {
            progress_key: default_progress_key(&cluster),
            cluster,
            keyspaces,
            host: "localhost".to_string(),
            interval: Duration::from_secs(3600),
            retry_delay: Duration::from_secs(60),
            completion_timeout: None,
            repair: RepairSettings::default(),
        }
    }
}

pub fn default_progress_key(cluster: &str) -> String {
    format!("ring_repair/{cluster}/progress")
}

enum TableOutcome {
    Finished,
    Stopped,
}

/// Walks keyspaces, tables and fragments, repairing one fragment at a time and persisting the
/// snapshot after every step so a restart resumes where the last run stopped.
pub struct RepairOrchestrator<T, E, S> {
    topology: T,
    executor: E,
    store: S,
    config: RepairOrchestratorConfig,
    stop: Arc<StopSignal>,
}

impl<T, E, S> RepairOrchestrator<T, E, S>
where
    T: Topology,
    E: RepairExecutor,
    S: ProgressStore,
{
    pub fn new(
        topology: T,
        executor: E,
        store: S,
        config: RepairOrchestratorConfig,
        stop: Arc<StopSignal>,
    ) -> Self {
        Self {
            topology,
            executor,
            store,
            config,
            stop,
        }
    }

    pub fn config(&self) -> &RepairOrchestratorConfig {
        &self.config
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        self.stop.clone()
    }

    /// Runs passes back to back until a stop is requested.
    pub async fn run(&self) -> RunSummary {
        let mut summary = RunSummary::default();

        while !self.stop.is_stop_requested() {
            match self.run_pass().await {
                Ok(PassOutcome::Completed(snapshot)) => {
                    summary.passes_completed += 1;
                    if let Some(metrics) = REPAIR_METRICS.get() {
                        metrics.passes_completed_total.inc();
                    }
                    info!(
                        event = "repair_pass_completed",
                        cluster = %self.config.cluster,
                        repaired = snapshot.cluster_completed,
                        failed = snapshot.cluster_errors,
                        passes_completed = snapshot.passes_completed,
                        next_pass_in_secs = self.config.interval.as_secs(),
                        "repair pass finished"
                    );

                    if self.stop.sleep(self.config.interval).await {
                        break;
                    }
                    self.persist(&snapshot.clear_cluster()).await;
                }
                Ok(PassOutcome::Stopped(snapshot)) => {
                    info!(
                        event = "repair_pass_stopped",
                        cluster = %self.config.cluster,
                        keyspace = %snapshot.keyspace,
                        table = %snapshot.table,
                        table_cursor = snapshot.table_cursor,
                        "stop observed; progress kept for the next run"
                    );
                    break;
                }
                Err(err) => {
                    summary.passes_abandoned += 1;
                    if let Some(metrics) = REPAIR_METRICS.get() {
                        metrics.passes_abandoned_total.inc();
                    }
                    error!(
                        event = "repair_pass_abandoned",
                        cluster = %self.config.cluster,
                        retry_in_secs = self.config.retry_delay.as_secs(),
                        error = %err,
                        "could not plan repair pass"
                    );
                    if self.stop.sleep(self.config.retry_delay).await {
                        break;
                    }
                }
            }
        }

        info!(
            event = "repair_loop_stopped",
            cluster = %self.config.cluster,
            passes_completed = summary.passes_completed,
            passes_abandoned = summary.passes_abandoned,
            "repair loop exited"
        );
        summary
    }

    /// Runs one pass, resuming from the stored snapshot.
    ///
    /// Fails only when the topology cannot be planned; per-fragment and store failures are
    /// absorbed into the snapshot and metrics.
    pub async fn run_pass(&self) -> Result<PassOutcome, Error> {
        let stored = self.load_snapshot().await;
        let plan = self.plan_pass().await?;

        let (snapshot, resume) = stored.resume_cursor(&self.config.cluster, &plan.scopes());
        let mut snapshot =
            snapshot.with_identity(&self.config.cluster, &self.config.host, plan.total);

        if let Some(metrics) = REPAIR_METRICS.get() {
            metrics.cluster_total_fragments.set(saturating_i64(plan.total));
        }
        info!(
            event = "repair_pass_started",
            cluster = %self.config.cluster,
            keyspaces = plan.keyspaces.len(),
            tables = plan.table_count(),
            fragments = plan.total,
            resume_scope = resume.scope,
            resume_cursor = resume.cursor,
            "starting repair pass"
        );

        let mut ordinal = 0usize;
        for keyspace in &plan.keyspaces {
            for table in &keyspace.tables {
                let scope = ordinal;
                ordinal += 1;
                if scope < resume.scope {
                    debug!(
                        event = "repair_table_skipped",
                        keyspace = %keyspace.name,
                        table = %table.table.name,
                        "table finished by an earlier run"
                    );
                    continue;
                }

                let cursor = if scope == resume.scope { resume.cursor } else { 0 };
                snapshot = snapshot.with_live_totals(
                    &self.config.cluster,
                    plan.total,
                    &keyspace.name,
                    keyspace.total,
                    &table.table.name,
                    table.total,
                );

                let (walked, outcome) = self.run_table(snapshot, keyspace, table, cursor).await;
                snapshot = walked;
                if let TableOutcome::Stopped = outcome {
                    return Ok(PassOutcome::Stopped(snapshot));
                }

                snapshot = snapshot.clear_table();
                self.persist(&snapshot).await;
                info!(
                    event = "repair_table_finished",
                    keyspace = %keyspace.name,
                    table = %table.table.name,
                    fragments = table.total,
                    "table repaired"
                );

                if self.stop.is_stop_requested() {
                    return Ok(PassOutcome::Stopped(snapshot));
                }
            }

            // Keyspaces wholly before the resume point were cleared by the run that walked them.
            if ordinal > resume.scope {
                snapshot = snapshot.clear_keyspace();
                self.persist(&snapshot).await;
            }
            if self.stop.is_stop_requested() {
                return Ok(PassOutcome::Stopped(snapshot));
            }
        }

        snapshot = snapshot.finish_pass();
        self.persist(&snapshot).await;
        Ok(PassOutcome::Completed(snapshot))
    }

    async fn run_table(
        &self,
        mut snapshot: ProgressSnapshot,
        keyspace: &KeyspacePlan,
        table: &TablePlan,
        cursor: u64,
    ) -> (ProgressSnapshot, TableOutcome) {
        let mut index = 0u64;
        for group in &table.groups {
            for fragment in &group.fragments {
                if index < cursor {
                    index += 1;
                    if let Some(metrics) = REPAIR_METRICS.get() {
                        metrics.fragments_skipped_total.inc();
                    }
                    continue;
                }
                if self.stop.is_stop_requested() {
                    return (snapshot, TableOutcome::Stopped);
                }

                let mut job = self.build_job(&keyspace.name, &table.table.name, fragment);
                let outcome = self.execute_fragment(&mut job).await;
                snapshot = match &outcome.result {
                    Ok(_) => snapshot.complete_fragment(&job, outcome.elapsed),
                    Err(err) => snapshot.error_fragment(&job, outcome.elapsed, err.to_string()),
                };
                self.persist(&snapshot).await;
                index += 1;

                if self.stop.is_stop_requested() {
                    return (snapshot, TableOutcome::Stopped);
                }
            }

            if self.stop.is_stop_requested() {
                return (snapshot, TableOutcome::Stopped);
            }
        }

        (snapshot, TableOutcome::Finished)
    }

    fn build_job(&self, keyspace: &str, table: &str, fragment: &Fragment) -> RepairJob {
        RepairJob {
            fragment_id: fragment.id,
            cluster: self.config.cluster.clone(),
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            endpoint: fragment.endpoint.clone(),
            range: fragment.range.clone(),
            started_at: SystemTime::now(),
            options: RepairOptions::for_range(self.config.repair, table, &fragment.range),
            command: None,
        }
    }

    /// Submits one fragment and waits for it to settle.
    pub async fn execute_fragment(&self, job: &mut RepairJob) -> FragmentOutcome {
        let started = Instant::now();
        if let Some(metrics) = REPAIR_METRICS.get() {
            metrics.fragment_in_flight.set(1);
        }
        debug!(
            event = "repair_fragment_started",
            keyspace = %job.keyspace,
            table = %job.table,
            fragment = job.fragment_id,
            endpoint = %job.endpoint,
            range = %job.range,
            "submitting repair"
        );

        let result = self.submit_and_wait(job).await;
        let outcome = FragmentOutcome {
            result,
            elapsed: started.elapsed(),
        };
        self.report_fragment(job, &outcome);
        outcome
    }

    async fn submit_and_wait(&self, job: &mut RepairJob) -> Result<RepairResult, ExecutorError> {
        let command = self.executor.submit(job).await?;
        let handle = command.handle;
        job.command = Some(handle);

        if handle <= 0 {
            return Ok(RepairResult::NothingToRepair);
        }
        let mut completion = command
            .completion
            .ok_or(ExecutorError::CompletionDropped(handle))?;

        let received = match self.config.completion_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut completion).await {
                Ok(received) => received,
                Err(_) => {
                    self.abort_and_settle(job, handle, completion).await;
                    return Err(ExecutorError::TimedOut {
                        command: handle,
                        timeout,
                    });
                }
            },
            None => completion.await,
        };
        received.map_err(|_| ExecutorError::CompletionDropped(handle))??;
        Ok(RepairResult::Completed)
    }

    /// Aborts a command that outlived the completion timeout, then blocks until it reaches a
    /// terminal state so the next fragment never runs alongside it.
    async fn abort_and_settle(&self, job: &RepairJob, handle: i32, completion: CompletionReceiver) {
        if let Err(err) = self.executor.abort(job, handle).await {
            warn!(
                event = "repair_abort_failed",
                keyspace = %job.keyspace,
                table = %job.table,
                fragment = job.fragment_id,
                command = handle,
                error = %err,
                "waiting for timed out repair to finish on its own"
            );
        }

        let settled = completion.await;
        debug!(
            event = "repair_command_settled",
            keyspace = %job.keyspace,
            table = %job.table,
            fragment = job.fragment_id,
            command = handle,
            outcome = ?settled,
            "timed out repair reached a terminal state"
        );
    }

    fn report_fragment(&self, job: &RepairJob, outcome: &FragmentOutcome) {
        let elapsed_ms =
            saturating_i64(u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX));
        if let Some(metrics) = REPAIR_METRICS.get() {
            metrics.fragment_in_flight.set(0);
            metrics.last_fragment_elapsed_ms.set(elapsed_ms);
            match &outcome.result {
                Ok(RepairResult::Completed) => {
                    metrics.fragments_completed_total.inc();
                }
                Ok(RepairResult::NothingToRepair) => {
                    metrics.fragments_completed_total.inc();
                    metrics.fragments_nothing_to_repair_total.inc();
                }
                Err(_) => {
                    metrics.fragments_failed_total.inc();
                }
            }
        }

        match &outcome.result {
            Ok(RepairResult::Completed) => info!(
                event = "repair_fragment_completed",
                keyspace = %job.keyspace,
                table = %job.table,
                fragment = job.fragment_id,
                endpoint = %job.endpoint,
                range = %job.range,
                command = job.command,
                elapsed_ms,
                "fragment repaired"
            ),
            Ok(RepairResult::NothingToRepair) => warn!(
                event = "repair_fragment_nothing_to_repair",
                keyspace = %job.keyspace,
                table = %job.table,
                fragment = job.fragment_id,
                endpoint = %job.endpoint,
                range = %job.range,
                command = job.command,
                "node reported nothing to repair"
            ),
            Err(err) => error!(
                event = "repair_fragment_failed",
                keyspace = %job.keyspace,
                table = %job.table,
                fragment = job.fragment_id,
                endpoint = %job.endpoint,
                range = %job.range,
                command = job.command,
                elapsed_ms,
                error = %err,
                "fragment repair failed"
            ),
        }
    }

    async fn plan_pass(&self) -> Result<PassPlan, Error> {
        let mut plan = PassPlan::default();
        for keyspace in &self.config.keyspaces {
            let tables = self.topology.list_tables(keyspace).await?;
            let mut keyspace_plan = KeyspacePlan {
                name: keyspace.clone(),
                tables: Vec::with_capacity(tables.len()),
                total: 0,
            };
            for table in tables {
                let groups = self.topology.describe_ring(keyspace, &table).await?;
                let total = fragment_count(&groups);
                keyspace_plan.total += total;
                keyspace_plan.tables.push(TablePlan {
                    table,
                    groups,
                    total,
                });
            }
            plan.total += keyspace_plan.total;
            plan.keyspaces.push(keyspace_plan);
        }
        Ok(plan)
    }

    async fn load_snapshot(&self) -> ProgressSnapshot {
        match self.store.read(&self.config.progress_key).await {
            Ok(raw) => ProgressSnapshot::load_or_default(raw.as_deref()),
            Err(err) => {
                if let Some(metrics) = REPAIR_METRICS.get() {
                    metrics.store_read_failures_total.inc();
                }
                error!(
                    event = "progress_read_failed",
                    key = %self.config.progress_key,
                    error = %err,
                    "could not read stored progress; starting from zero"
                );
                ProgressSnapshot::default()
            }
        }
    }

    async fn persist(&self, snapshot: &ProgressSnapshot) {
        if let Some(metrics) = REPAIR_METRICS.get() {
            metrics.table_cursor.set(saturating_i64(snapshot.table_cursor));
            metrics
                .cluster_progress_percent
                .set(saturating_i64(snapshot.cluster_progress_percent()));
        }

        let written = match snapshot.to_document() {
            Ok(document) => self
                .store
                .write(&self.config.progress_key, document)
                .await,
            Err(err) => Err(err.into()),
        };

        if let Err(err) = written {
            if let Some(metrics) = REPAIR_METRICS.get() {
                metrics.store_write_failures_total.inc();
            }
            error!(
                event = "progress_write_failed",
                key = %self.config.progress_key,
                table_cursor = snapshot.table_cursor,
                error = %err,
                "could not persist progress"
            );
        }
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
