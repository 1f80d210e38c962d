use futures::future::BoxFuture;
use tracing::{debug, info};

use super::{build_token_groups, Table, Topology, TopologyError, TokenGroup};
use crate::agent_client::NodeAgentClient;
use crate::segmenter::{parse_token, RangeSegmenter, SegmentCountPolicy, MAX_SLICES};

/// Topology read from a single seed node agent.
pub struct AgentTopology {
    seed: NodeAgentClient,
    segmenter: RangeSegmenter,
    default_slices: u64,
}

impl AgentTopology {
    /// Resolves the partitioner (from `partitioner_override` or the seed agent) and builds the
    /// segmenter every table will be split with.
    ///
    /// An unsupported partitioner surfaces as [`TopologyError::Segmenter`].
    pub async fn connect(
        seed: NodeAgentClient,
        partitioner_override: Option<&str>,
        policy: SegmentCountPolicy,
        default_slices: u64,
    ) -> Result<Self, TopologyError> {
        let partitioner = match partitioner_override {
            Some(name) => name.to_string(),
            None => seed.partitioner().await?,
        };
        let segmenter = RangeSegmenter::new(&partitioner)?.with_policy(policy);

        info!(
            event = "topology_connected",
            seed = seed.base_url(),
            partitioner = segmenter.partitioner().class_name(),
            policy = policy.as_str(),
            default_slices,
            "resolved cluster partitioner"
        );

        Ok(Self {
            seed,
            segmenter,
            default_slices,
        })
    }

    async fn fetch_tables(&self, keyspace: &str) -> Result<Vec<Table>, TopologyError> {
        let tables = self.seed.list_tables(keyspace).await?;
        tables
            .into_iter()
            .map(|table| {
                let slices = table.slices.unwrap_or(self.default_slices);
                if slices > MAX_SLICES {
                    return Err(TopologyError::SlicesOutOfRange {
                        keyspace: keyspace.to_string(),
                        table: table.name,
                        slices,
                        max: MAX_SLICES,
                    });
                }
                Ok(Table {
                    name: table.name,
                    slices,
                })
            })
            .collect()
    }

    async fn fetch_ring(
        &self,
        keyspace: &str,
        table: &Table,
    ) -> Result<Vec<TokenGroup>, TopologyError> {
        let entries = self.seed.describe_ring(keyspace).await?;
        if entries.is_empty() {
            return Err(TopologyError::EmptyRing(keyspace.to_string()));
        }

        let ring = entries
            .into_iter()
            .map(|entry| Ok((parse_token(&entry.token)?, entry.endpoint)))
            .collect::<Result<Vec<_>, TopologyError>>()?;
        let groups = build_token_groups(&self.segmenter, ring, table.slices)?;

        debug!(
            event = "table_ring_described",
            keyspace,
            table = %table.name,
            groups = groups.len(),
            fragments = super::fragment_count(&groups),
            "split table ring"
        );
        Ok(groups)
    }
}

impl Topology for AgentTopology {
    fn list_tables<'a>(&'a self, keyspace: &'a str) -> BoxFuture<'a, Result<Vec<Table>, TopologyError>> {
        Box::pin(self.fetch_tables(keyspace))
    }

    fn describe_ring<'a>(
        &'a self,
        keyspace: &'a str,
        table: &'a Table,
    ) -> BoxFuture<'a, Result<Vec<TokenGroup>, TopologyError>> {
        Box::pin(self.fetch_ring(keyspace, table))
    }
}
