//! HTTP client for the node agent sidecar.
//!
//! Every database node runs an agent that describes the ring, lists tables and accepts repair
//! submissions. Tokens travel as decimal strings because RandomPartitioner tokens do not fit a
//! JSON number.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::executor::RepairOptions;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("unexpected HTTP status while fetching {resource}: {status}")]
    UnexpectedStatus { resource: String, status: u16 },
    #[error("parse error: {0}")]
    ParseError(String),
    #[error(transparent)]
    RequestError(#[from] reqwest::Error),
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PartitionerInfo {
    pub partitioner: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AgentTable {
    pub name: String,
    /// Per-table override of the requested segment count.
    #[serde(default)]
    pub slices: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RingEntry {
    pub token: String,
    pub endpoint: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmittedCommand {
    pub command: i32,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepairState {
    Running,
    Success,
    Failed,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RepairStatusReport {
    pub state: RepairState,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NodeAgentClient {
    client: reqwest::Client,
    base_url: String,
}

impl NodeAgentClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn partitioner(&self) -> Result<String, AgentError> {
        let info: PartitionerInfo = self.get_json("/partitioner", "partitioner").await?;
        Ok(info.partitioner)
    }

    pub async fn list_tables(&self, keyspace: &str) -> Result<Vec<AgentTable>, AgentError> {
        self.get_json(
            &format!("/keyspaces/{keyspace}/tables"),
            &format!("tables of {keyspace}"),
        )
        .await
    }

    pub async fn describe_ring(&self, keyspace: &str) -> Result<Vec<RingEntry>, AgentError> {
        self.get_json(
            &format!("/keyspaces/{keyspace}/ring"),
            &format!("ring of {keyspace}"),
        )
        .await
    }

    pub async fn submit_repair(
        &self,
        keyspace: &str,
        options: &RepairOptions,
    ) -> Result<i32, AgentError> {
        let url = format!("{}/keyspaces/{keyspace}/repair", self.base_url);
        let response = self.client.post(&url).json(options).send().await?;
        let submitted: SubmittedCommand =
            Self::decode(response, &format!("repair of {keyspace}")).await?;
        Ok(submitted.command)
    }

    pub async fn repair_status(
        &self,
        keyspace: &str,
        command: i32,
    ) -> Result<RepairStatusReport, AgentError> {
        self.get_json(
            &format!("/keyspaces/{keyspace}/repair/{command}"),
            &format!("repair command {command}"),
        )
        .await
    }

    /// Asks the agent to terminate a running repair. The command then reports `failed` on its
    /// status endpoint.
    pub async fn cancel_repair(&self, keyspace: &str, command: i32) -> Result<(), AgentError> {
        let url = format!("{}/keyspaces/{keyspace}/repair/{command}", self.base_url);
        let response = self.client.delete(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::UnexpectedStatus {
                resource: format!("cancel of repair command {command}"),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        resource: &str,
    ) -> Result<T, AgentError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await?;
        Self::decode(response, resource).await
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
        resource: &str,
    ) -> Result<T, AgentError> {
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::UnexpectedStatus {
                resource: resource.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|err| AgentError::ParseError(format!("{resource}: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_report_accepts_missing_message() {
        let report: RepairStatusReport =
            serde_json::from_str(r#"{"state":"running"}"#).expect("report decodes");
        assert_eq!(report.state, RepairState::Running);
        assert_eq!(report.message, None);
    }

    #[test]
    fn table_slices_are_optional() {
        let tables: Vec<AgentTable> =
            serde_json::from_str(r#"[{"name":"events"},{"name":"users","slices":8}]"#)
                .expect("tables decode");
        assert_eq!(tables[0].slices, None);
        assert_eq!(tables[1].slices, Some(8));
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let client = NodeAgentClient::with_client(reqwest::Client::new(), "http://agent:7199/");
        assert_eq!(client.base_url(), "http://agent:7199");
    }
}
