use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping.
///
/// Encoded as a labeled gauge with value `1` so the build labels survive text exposition.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "ring_repair",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone)]
pub struct RepairMetrics {
    /// Fragments the node repaired, including ones it found nothing to do for.
    pub fragments_completed_total: Counter,
    /// Fragments whose submission or completion failed.
    pub fragments_failed_total: Counter,
    /// Fragments that came back with a handle `<= 0`.
    pub fragments_nothing_to_repair_total: Counter,
    /// Fragments passed over because an earlier run already visited them.
    pub fragments_skipped_total: Counter,
    pub passes_completed_total: Counter,
    /// Passes given up because the topology could not be read.
    pub passes_abandoned_total: Counter,
    pub store_read_failures_total: Counter,
    pub store_write_failures_total: Counter,
    /// 1 while a fragment is being repaired.
    pub fragment_in_flight: Gauge,
    pub last_fragment_elapsed_ms: Gauge,
    /// Fragment count of the current pass.
    pub cluster_total_fragments: Gauge,
    pub table_cursor: Gauge,
    /// Integer percent (0-100) of the current pass visited.
    pub cluster_progress_percent: Gauge,
    /// 1 once a stop was requested.
    pub stop_requested: Gauge,
}

impl RepairMetrics {
    fn init() -> Self {
        Self {
            fragments_completed_total: Counter::default(),
            fragments_failed_total: Counter::default(),
            fragments_nothing_to_repair_total: Counter::default(),
            fragments_skipped_total: Counter::default(),
            passes_completed_total: Counter::default(),
            passes_abandoned_total: Counter::default(),
            store_read_failures_total: Counter::default(),
            store_write_failures_total: Counter::default(),
            fragment_in_flight: Gauge::default(),
            last_fragment_elapsed_ms: Gauge::default(),
            cluster_total_fragments: Gauge::default(),
            table_cursor: Gauge::default(),
            cluster_progress_percent: Gauge::default(),
            stop_requested: Gauge::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "fragments_completed",
            "Total number of fragments repaired",
            metrics.fragments_completed_total.clone(),
        );
        sub_registry.register(
            "fragments_failed",
            "Total number of fragments whose repair failed",
            metrics.fragments_failed_total.clone(),
        );
        sub_registry.register(
            "fragments_nothing_to_repair",
            "Total number of fragments the node reported nothing to repair for",
            metrics.fragments_nothing_to_repair_total.clone(),
        );
        sub_registry.register(
            "fragments_skipped",
            "Total number of fragments skipped while resuming a pass",
            metrics.fragments_skipped_total.clone(),
        );
        sub_registry.register(
            "passes_completed",
            "Total number of full repair passes completed",
            metrics.passes_completed_total.clone(),
        );
        sub_registry.register(
            "passes_abandoned",
            "Total number of passes abandoned on topology failure",
            metrics.passes_abandoned_total.clone(),
        );
        sub_registry.register(
            "store_read_failures",
            "Total number of failed progress store reads",
            metrics.store_read_failures_total.clone(),
        );
        sub_registry.register(
            "store_write_failures",
            "Total number of failed progress store writes",
            metrics.store_write_failures_total.clone(),
        );
        sub_registry.register(
            "fragment_in_flight",
            "1 while a fragment repair is outstanding",
            metrics.fragment_in_flight.clone(),
        );
        sub_registry.register(
            "last_fragment_elapsed_ms",
            "Wall time of the most recent fragment in milliseconds",
            metrics.last_fragment_elapsed_ms.clone(),
        );
        sub_registry.register(
            "cluster_total_fragments",
            "Number of fragments in the current pass",
            metrics.cluster_total_fragments.clone(),
        );
        sub_registry.register(
            "table_cursor",
            "Fragments visited in the current table",
            metrics.table_cursor.clone(),
        );
        sub_registry.register(
            "cluster_progress_percent",
            "Integer percent of the current pass visited",
            metrics.cluster_progress_percent.clone(),
        );
        sub_registry.register(
            "stop_requested",
            "1 once a stop has been requested",
            metrics.stop_requested.clone(),
        );
        metrics
    }
}

pub static REPAIR_METRICS: OnceCell<RepairMetrics> = OnceCell::const_new();

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn registered_metrics_are_exposed_with_prefix() {
        let mut registry = Registry::default();
        let metrics = RepairMetrics::register(&mut registry, "repair");
        register_build_info_metric(&mut registry, "worker");
        metrics.fragments_completed_total.inc();
        metrics.cluster_progress_percent.set(42);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).expect("encode metrics");

        assert!(buffer.contains("repair_fragments_completed_total 1"));
        assert!(buffer.contains("repair_cluster_progress_percent 42"));
        assert!(buffer.contains("worker_build_info{"));
        assert!(buffer.contains("service=\"ring_repair\""));
    }
}
