//! Cluster shape as seen by the orchestrator: the tables of a keyspace and, per table, the ring
//! split into token groups of repairable fragments.

mod agent;

pub use agent::AgentTopology;

use futures::future::BoxFuture;
use num::BigInt;
use std::sync::Arc;
use thiserror::Error;

use crate::agent_client::AgentError;
use crate::segmenter::{RangeSegmenter, RepairRange, SegmenterError};

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("node agent request failed: {0}")]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Segmenter(#[from] SegmenterError),
    #[error("ring of keyspace {0} has no tokens")]
    EmptyRing(String),
    #[error("token {token} is outside the partitioner range")]
    TokenOutOfRange { token: String },
    #[error("table {keyspace}.{table} asks for {slices} slices, at most {max} are allowed")]
    SlicesOutOfRange {
        keyspace: String,
        table: String,
        slices: u64,
        max: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    /// Requested segment count for the whole ring.
    pub slices: u64,
}

/// One repairable slice of a table, addressed to the node that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Ordinal inside the table, stable for the duration of a pass.
    pub id: u64,
    pub endpoint: String,
    pub range: RepairRange,
}

/// The fragments of one ring arc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGroup {
    pub endpoint: String,
    pub arc: RepairRange,
    pub fragments: Vec<Fragment>,
}

pub trait Topology: Send + Sync {
    fn list_tables<'a>(&'a self, keyspace: &'a str) -> BoxFuture<'a, Result<Vec<Table>, TopologyError>>;

    fn describe_ring<'a>(
        &'a self,
        keyspace: &'a str,
        table: &'a Table,
    ) -> BoxFuture<'a, Result<Vec<TokenGroup>, TopologyError>>;
}

impl<T> Topology for Arc<T>
where
    T: Topology + ?Sized,
{
    fn list_tables<'a>(&'a self, keyspace: &'a str) -> BoxFuture<'a, Result<Vec<Table>, TopologyError>> {
        (**self).list_tables(keyspace)
    }

    fn describe_ring<'a>(
        &'a self,
        keyspace: &'a str,
        table: &'a Table,
    ) -> BoxFuture<'a, Result<Vec<TokenGroup>, TopologyError>> {
        (**self).describe_ring(keyspace, table)
    }
}

/// Splits a ring of `(token, endpoint)` pairs into token groups.
///
/// Tokens are sorted and de-duplicated first. The arc `[t_i, t_{i+1})` belongs to the endpoint
/// holding `t_{i+1}`; fragment ids run across groups in ring order.
pub fn build_token_groups(
    segmenter: &RangeSegmenter,
    mut ring: Vec<(BigInt, String)>,
    slices: u64,
) -> Result<Vec<TokenGroup>, TopologyError> {
    ring.sort_by(|left, right| left.0.cmp(&right.0));
    ring.dedup_by(|later, earlier| later.0 == earlier.0);

    if let Some((token, _)) = ring.iter().find(|(token, _)| !segmenter.contains(token)) {
        return Err(TopologyError::TokenOutOfRange {
            token: token.to_string(),
        });
    }

    let tokens: Vec<BigInt> = ring.iter().map(|(token, _)| token.clone()).collect();
    let arcs = segmenter.generate_arcs(&tokens, slices)?;

    let mut next_id = 0u64;
    let groups = arcs
        .into_iter()
        .enumerate()
        .map(|(index, arc)| {
            let endpoint = ring[(index + 1) % ring.len()].1.clone();
            let fragments = arc
                .ranges
                .into_iter()
                .map(|range| {
                    let fragment = Fragment {
                        id: next_id,
                        endpoint: endpoint.clone(),
                        range,
                    };
                    next_id += 1;
                    fragment
                })
                .collect();
            TokenGroup {
                endpoint,
                arc: RepairRange::new(arc.start, arc.stop),
                fragments,
            }
        })
        .collect();

    Ok(groups)
}

/// Fragment count of a described table.
pub fn fragment_count(groups: &[TokenGroup]) -> u64 {
    groups.iter().map(|group| group.fragments.len() as u64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::SegmentCountPolicy;

    fn ring(entries: &[(i64, &str)]) -> Vec<(BigInt, String)> {
        entries
            .iter()
            .map(|(token, endpoint)| (BigInt::from(*token), endpoint.to_string()))
            .collect()
    }

    fn murmur3() -> RangeSegmenter {
        RangeSegmenter::new("Murmur3Partitioner").expect("murmur3 is supported")
    }

    #[test]
    fn huge_slice_request_fails_instead_of_splitting() {
        let err = build_token_groups(&murmur3(), ring(&[(0, "a")]), 1_000_000_000_000)
            .expect_err("slices above the limit");
        assert!(matches!(
            err,
            TopologyError::Segmenter(SegmenterError::SlicesOutOfRange { .. })
        ));
    }

    #[test]
    fn arc_belongs_to_owner_of_its_stop_token() {
        let groups = build_token_groups(
            &murmur3(),
            ring(&[(-100, "a"), (0, "b"), (100, "c")]),
            3,
        )
        .expect("groups");

        let owners: Vec<&str> = groups.iter().map(|group| group.endpoint.as_str()).collect();
        assert_eq!(owners, vec!["b", "c", "a"]);
        assert_eq!(groups[0].arc, RepairRange::new(BigInt::from(-100), BigInt::from(0)));
        assert_eq!(groups[2].arc, RepairRange::new(BigInt::from(100), BigInt::from(-100)));
    }

    #[test]
    fn unsorted_ring_with_duplicates_is_normalized() {
        let groups = build_token_groups(
            &murmur3(),
            ring(&[(100, "c"), (-100, "a"), (0, "b"), (100, "c")]),
            3,
        )
        .expect("groups");

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].arc.start, BigInt::from(-100));
    }

    #[test]
    fn fragment_ids_run_across_groups() {
        let segmenter = murmur3().with_policy(SegmentCountPolicy::PerArc);
        let groups = build_token_groups(&segmenter, ring(&[(-100, "a"), (0, "b")]), 2)
            .expect("groups");

        let ids: Vec<u64> = groups
            .iter()
            .flat_map(|group| group.fragments.iter().map(|fragment| fragment.id))
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(fragment_count(&groups), 4);
        assert!(groups[1]
            .fragments
            .iter()
            .all(|fragment| fragment.endpoint == "a"));
    }

    #[test]
    fn token_outside_partitioner_is_rejected() {
        let random = RangeSegmenter::new("RandomPartitioner").expect("random is supported");
        let err = build_token_groups(&random, ring(&[(-5, "a"), (10, "b")]), 4)
            .expect_err("negative token is invalid for RandomPartitioner");
        assert!(matches!(err, TopologyError::TokenOutOfRange { token } if token == "-5"));
    }

    #[test]
    fn empty_ring_surfaces_segmenter_error() {
        let err = build_token_groups(&murmur3(), Vec::new(), 4).expect_err("empty ring");
        assert!(matches!(
            err,
            TopologyError::Segmenter(SegmenterError::EmptyRing)
        ));
    }
}
