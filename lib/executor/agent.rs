use futures::future::BoxFuture;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CompletionSender, ExecutorError, RepairCommand, RepairExecutor, RepairJob};
use crate::agent_client::{NodeAgentClient, RepairState};

/// Consecutive status lookups that may fail before a command is given up on.
const MAX_STATUS_FAILURES: u32 = 5;

/// Submits each job to the agent running on the fragment's owning endpoint and polls that agent
/// until the command settles.
pub struct AgentRepairExecutor {
    agents: HashMap<String, NodeAgentClient>,
    poll_interval: Duration,
}

impl AgentRepairExecutor {
    pub fn new(agents: HashMap<String, NodeAgentClient>, poll_interval: Duration) -> Self {
        Self {
            agents,
            poll_interval,
        }
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    fn agent_for(&self, job: &RepairJob) -> Result<&NodeAgentClient, ExecutorError> {
        self.agents
            .get(&job.endpoint)
            .ok_or_else(|| ExecutorError::UnknownEndpoint(job.endpoint.clone()))
    }

    async fn cancel_on_agent(&self, job: &RepairJob, command: i32) -> Result<(), ExecutorError> {
        self.agent_for(job)?
            .cancel_repair(&job.keyspace, command)
            .await
            .map_err(|err| ExecutorError::Abort {
                command,
                message: err.to_string(),
            })
    }

    async fn submit_to_agent(&self, job: &RepairJob) -> Result<RepairCommand, ExecutorError> {
        let agent = self.agent_for(job)?;

        let handle = agent
            .submit_repair(&job.keyspace, &job.options)
            .await
            .map_err(|err| ExecutorError::Submit(err.to_string()))?;

        if handle <= 0 {
            return Ok(RepairCommand::nothing_to_repair(handle));
        }

        let (command, sender) = RepairCommand::pending(handle);
        let agent = agent.clone();
        let keyspace = job.keyspace.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            watch_command(agent, keyspace, handle, poll_interval, sender).await;
        });

        Ok(command)
    }
}

impl RepairExecutor for AgentRepairExecutor {
    fn submit<'a>(&'a self, job: &'a RepairJob) -> BoxFuture<'a, Result<RepairCommand, ExecutorError>> {
        Box::pin(self.submit_to_agent(job))
    }

    fn abort<'a>(&'a self, job: &'a RepairJob, command: i32) -> BoxFuture<'a, Result<(), ExecutorError>> {
        Box::pin(self.cancel_on_agent(job, command))
    }
}

/// Polls a running command and reports its terminal state on `sender`.
///
/// Returns early without reporting when the receiving side went away.
async fn watch_command(
    agent: NodeAgentClient,
    keyspace: String,
    command: i32,
    poll_interval: Duration,
    mut sender: CompletionSender,
) {
    let mut consecutive_failures = 0u32;

    let outcome = loop {
        tokio::select! {
            _ = sender.closed() => {
                debug!(event = "repair_watch_abandoned", command, "completion receiver dropped");
                return;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        match agent.repair_status(&keyspace, command).await {
            Ok(report) => {
                consecutive_failures = 0;
                match report.state {
                    RepairState::Running => continue,
                    RepairState::Success => break Ok(()),
                    RepairState::Failed => {
                        break Err(ExecutorError::Failed {
                            command,
                            message: report
                                .message
                                .unwrap_or_else(|| "node reported failure".to_string()),
                        })
                    }
                }
            }
            Err(err) => {
                consecutive_failures += 1;
                warn!(
                    event = "repair_status_poll_failed",
                    command,
                    attempt = consecutive_failures,
                    agent = agent.base_url(),
                    error = %err,
                    "could not fetch repair status"
                );
                if consecutive_failures >= MAX_STATUS_FAILURES {
                    break Err(ExecutorError::Status {
                        command,
                        message: err.to_string(),
                    });
                }
            }
        }
    };

    let _ = sender.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{RepairOptions, RepairSettings};
    use crate::segmenter::RepairRange;
    use axum::extract::{Path, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use num::BigInt;
    use serde_json::{json, Value};
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::SystemTime;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    struct MockAgent {
        base_url: String,
        handle: JoinHandle<()>,
    }

    impl Drop for MockAgent {
        fn drop(&mut self) {
            self.handle.abort();
        }
    }

    #[derive(Clone)]
    struct AgentScript {
        command: i32,
        running_polls: u32,
        terminal: &'static str,
        polls: Arc<AtomicU32>,
        cancelled: Arc<AtomicBool>,
    }

    impl AgentScript {
        fn new(command: i32, running_polls: u32, terminal: &'static str) -> Self {
            Self {
                command,
                running_polls,
                terminal,
                polls: Arc::new(AtomicU32::new(0)),
                cancelled: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    async fn submit(State(script): State<AgentScript>) -> Json<Value> {
        Json(json!({ "command": script.command }))
    }

    async fn status(
        State(script): State<AgentScript>,
        Path((_keyspace, _command)): Path<(String, i32)>,
    ) -> Json<Value> {
        let seen = script.polls.fetch_add(1, Ordering::SeqCst);
        if script.cancelled.load(Ordering::SeqCst) {
            Json(json!({ "state": "failed", "message": "repair aborted" }))
        } else if seen < script.running_polls {
            Json(json!({ "state": "running" }))
        } else {
            Json(json!({ "state": script.terminal, "message": "validation failed" }))
        }
    }

    async fn cancel(
        State(script): State<AgentScript>,
        Path((_keyspace, command)): Path<(String, i32)>,
    ) -> StatusCode {
        if command != script.command {
            return StatusCode::NOT_FOUND;
        }
        script.cancelled.store(true, Ordering::SeqCst);
        StatusCode::NO_CONTENT
    }

    async fn spawn_agent(script: AgentScript) -> MockAgent {
        let app = Router::new()
            .route("/keyspaces/{keyspace}/repair", post(submit))
            .route("/keyspaces/{keyspace}/repair/{command}", get(status).delete(cancel))
            .with_state(script);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock agent");
        let addr = listener.local_addr().expect("mock agent addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock agent serve");
        });
        MockAgent {
            base_url: format!("http://{addr}"),
            handle,
        }
    }

    fn job(endpoint: &str) -> RepairJob {
        let range = RepairRange::new(BigInt::from(0), BigInt::from(100));
        RepairJob {
            fragment_id: 0,
            cluster: "test".to_string(),
            keyspace: "ks".to_string(),
            table: "events".to_string(),
            endpoint: endpoint.to_string(),
            options: RepairOptions::for_range(RepairSettings::default(), "events", &range),
            range,
            started_at: SystemTime::now(),
            command: None,
        }
    }

    fn executor_for(agent: &MockAgent) -> AgentRepairExecutor {
        let mut agents = HashMap::new();
        agents.insert(
            "10.0.0.1".to_string(),
            NodeAgentClient::new(agent.base_url.clone()).expect("client"),
        );
        AgentRepairExecutor::new(agents, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn polls_until_success() {
        let script = AgentScript::new(12, 2, "success");
        let polls = script.polls.clone();
        let agent = spawn_agent(script).await;
        let executor = executor_for(&agent);

        let command = executor.submit(&job("10.0.0.1")).await.expect("submitted");
        assert_eq!(command.handle, 12);
        let completion = command.completion.expect("running command has a channel");
        assert_eq!(completion.await, Ok(Ok(())));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_status_is_reported_on_completion() {
        let agent = spawn_agent(AgentScript::new(4, 0, "failed")).await;
        let executor = executor_for(&agent);

        let command = executor.submit(&job("10.0.0.1")).await.expect("submitted");
        let completion = command.completion.expect("running command has a channel");
        assert_eq!(
            completion.await,
            Ok(Err(ExecutorError::Failed {
                command: 4,
                message: "validation failed".to_string()
            }))
        );
    }

    #[tokio::test]
    async fn zero_handle_means_nothing_to_repair() {
        let agent = spawn_agent(AgentScript::new(0, 0, "success")).await;
        let executor = executor_for(&agent);

        let command = executor.submit(&job("10.0.0.1")).await.expect("submitted");
        assert_eq!(command.handle, 0);
        assert!(command.completion.is_none());
    }

    #[tokio::test]
    async fn abort_cancels_the_command_and_completion_reports_it() {
        let script = AgentScript::new(9, u32::MAX, "success");
        let cancelled = script.cancelled.clone();
        let agent = spawn_agent(script).await;
        let executor = executor_for(&agent);
        let job = job("10.0.0.1");

        let command = executor.submit(&job).await.expect("submitted");
        executor.abort(&job, command.handle).await.expect("abort accepted");
        assert!(cancelled.load(Ordering::SeqCst));

        let completion = command.completion.expect("running command has a channel");
        assert_eq!(
            completion.await,
            Ok(Err(ExecutorError::Failed {
                command: 9,
                message: "repair aborted".to_string()
            }))
        );
    }

    #[tokio::test]
    async fn abort_of_an_unknown_command_is_an_error() {
        let agent = spawn_agent(AgentScript::new(9, 0, "success")).await;
        let executor = executor_for(&agent);

        let err = executor
            .abort(&job("10.0.0.1"), 77)
            .await
            .expect_err("agent does not know command 77");
        assert!(matches!(err, ExecutorError::Abort { command: 77, .. }));
    }

    #[tokio::test]
    async fn unknown_endpoint_is_rejected() {
        let executor = AgentRepairExecutor::new(HashMap::new(), Duration::from_millis(5));
        let err = executor
            .submit(&job("10.9.9.9"))
            .await
            .expect_err("no agent for endpoint");
        assert_eq!(err, ExecutorError::UnknownEndpoint("10.9.9.9".to_string()));
    }
}
