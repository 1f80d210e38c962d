use crate::{
    agent_client::NodeAgentClient,
    cli::{RunArgs, SegmentsArgs, StatusArgs},
    config::{resolve_status_store, Config},
    executor::AgentRepairExecutor,
    logging::{format_error_report, init_logging},
    progress::ProgressSnapshot,
    repair_service::{run_repair_worker, RepairOrchestrator, RepairOrchestratorConfig, StopSignal},
    segmenter::{
        parse_token, RangeSegmenter, SegmentCountPolicy, SegmenterError, TokenArc, MAX_SLICES,
    },
    server::{monitoring::REPAIR_METRICS, setup_server_with_addr},
    state::AppState,
    store::{open_store, ProgressStore},
    topology::{AgentTopology, TopologyError},
};
use dotenv::dotenv;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

const SERVICE_NAME: &str = "ring_repair";

/// Requests a cooperative stop on SIGTERM or SIGINT.
async fn stop_on_signals(stop: Arc<StopSignal>) {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(err), _) | (_, Err(err)) => {
            error!(
                event = "signal_handler_failed",
                error = %err,
                "could not register shutdown signal handlers; use /repair/stop"
            );
            return;
        }
    };

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(
        event = "repair_stop_requested",
        source = received,
        "stop requested; the loop exits after the current fragment"
    );
    if let Some(metrics) = REPAIR_METRICS.get() {
        metrics.stop_requested.set(1);
    }
    stop.request_stop();
}

fn report_failure(event: &'static str, message: &str, err: &(dyn std::error::Error + 'static)) {
    let error_report = format_error_report(err);
    error!(
        event,
        error = %err,
        error_debug = ?err,
        error_report = %error_report,
        "{message}"
    );
    eprintln!("{message}: {err}");
    eprintln!("{error_report}");
}

/// Runs the repair loop until stopped. Returns the process exit code.
pub async fn run_worker(args: RunArgs) -> i32 {
    dotenv().ok();

    let logging_context = init_logging(SERVICE_NAME, "run", &args.log_level);
    let run_span = logging_context.run_span();
    run_worker_in_span(args).instrument(run_span).await
}

async fn run_worker_in_span(args: RunArgs) -> i32 {
    let config = match Config::resolve(&args) {
        Ok(config) => config,
        Err(err) => {
            error!(event = "config_invalid", error = %err, "refusing to start");
            eprintln!("{err}");
            return 2;
        }
    };
    info!(
        event = "repair_worker_starting",
        cluster = %config.cluster,
        keyspaces = ?config.keyspaces,
        host = %config.service_host,
        progress_key = %config.store.progress_key,
        parallelism = config.repair.parallelism.as_str(),
        incremental = config.repair.incremental,
        "starting repair worker"
    );

    let store = match open_store(&config.store.backend).await {
        Ok(store) => store,
        Err(err) => {
            report_failure("progress_store_open_failed", "could not open progress store", &err);
            return 1;
        }
    };

    let seed = match NodeAgentClient::new(config.seed_agent_url.clone()) {
        Ok(seed) => seed,
        Err(err) => {
            report_failure("seed_agent_client_failed", "could not build seed agent client", &err);
            return 1;
        }
    };
    let topology = match AgentTopology::connect(
        seed,
        config.partitioner.as_deref(),
        config.segment_policy,
        config.slices,
    )
    .await
    {
        Ok(topology) => topology,
        Err(TopologyError::Segmenter(err)) => {
            error!(event = "config_invalid", error = %err, "refusing to start");
            eprintln!("{err}");
            return 2;
        }
        Err(err) => {
            report_failure("topology_connect_failed", "could not reach the seed agent", &err);
            return 1;
        }
    };

    let mut agents = HashMap::with_capacity(config.nodes.len());
    for (endpoint, url) in &config.nodes {
        match NodeAgentClient::new(url.clone()) {
            Ok(client) => {
                agents.insert(endpoint.clone(), client);
            }
            Err(err) => {
                report_failure("node_agent_client_failed", "could not build node agent client", &err);
                return 1;
            }
        }
    }
    let executor = AgentRepairExecutor::new(agents, config.poll_interval);
    let mut endpoints: Vec<&str> = executor.endpoints().collect();
    endpoints.sort_unstable();
    info!(
        event = "node_agents_configured",
        endpoints = ?endpoints,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "repair commands go to the owning endpoint's agent"
    );

    let orchestrator = RepairOrchestrator::new(
        topology,
        executor,
        store,
        RepairOrchestratorConfig {
            cluster: config.cluster.clone(),
            keyspaces: config.keyspaces.clone(),
            host: config.service_host.clone(),
            progress_key: config.store.progress_key.clone(),
            interval: config.interval,
            retry_delay: config.retry_delay,
            completion_timeout: config.completion_timeout,
            repair: config.repair,
        },
        Arc::new(StopSignal::new()),
    );
    let stop = orchestrator.stop_signal();

    let app_state = Arc::new(AppState::new(stop.clone(), CancellationToken::new()));
    let server_handle = match setup_server_with_addr(app_state.clone(), config.bind).await {
        Ok(handle) => handle,
        Err(err) => {
            report_failure("control_server_start_failed", "could not start control server", &err);
            return 1;
        }
    };
    info!(event = "control_server_started", bind = %config.bind, "control server listening");

    let signal_handle = tokio::spawn(stop_on_signals(stop));
    let result = run_repair_worker(Arc::new(orchestrator)).await;

    signal_handle.abort();
    app_state.shutdown_token.cancel();
    if let Err(err) = server_handle.await {
        error!(event = "control_server_join_failed", error = %err, "control server task failed");
    }

    match result {
        Ok(summary) => {
            info!(
                event = "repair_worker_stopped",
                passes_completed = summary.passes_completed,
                passes_abandoned = summary.passes_abandoned,
                "repair worker stopped"
            );
            0
        }
        Err(err) => {
            report_failure("repair_worker_failed", "repair worker failed", &err);
            1
        }
    }
}

#[derive(Debug)]
enum SegmentsError {
    Usage(String),
    Segmenter(SegmenterError),
}

impl From<SegmenterError> for SegmentsError {
    fn from(err: SegmenterError) -> Self {
        match err {
            SegmenterError::UnsupportedPartitioner(_)
            | SegmenterError::InvalidToken(_)
            | SegmenterError::SlicesOutOfRange { .. }
            | SegmenterError::TooManySegments { .. } => Self::Usage(err.to_string()),
            other => Self::Segmenter(other),
        }
    }
}

fn render_segments(args: &SegmentsArgs) -> Result<String, SegmentsError> {
    if args.count > MAX_SLICES {
        return Err(SegmentsError::Usage(format!(
            "--count {} exceeds the limit of {MAX_SLICES}",
            args.count
        )));
    }
    let policy = args
        .segment_policy
        .parse::<SegmentCountPolicy>()
        .map_err(SegmentsError::Usage)?;
    let segmenter = RangeSegmenter::new(&args.partitioner)?.with_policy(policy);
    let tokens = args
        .tokens
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(parse_token)
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(token) = tokens.iter().find(|token| !segmenter.contains(token)) {
        return Err(SegmentsError::Usage(format!(
            "token {token} is outside the {} range",
            segmenter.partitioner().class_name()
        )));
    }

    let arcs = segmenter.generate_arcs(&tokens, args.count)?;
    if args.json {
        return Ok(segments_json(&segmenter, &arcs).to_string());
    }
    Ok(arcs
        .iter()
        .flat_map(|arc| arc.ranges.iter())
        .map(|range| format!("{range}\n"))
        .collect())
}

fn segments_json(segmenter: &RangeSegmenter, arcs: &[TokenArc]) -> serde_json::Value {
    json!({
        "partitioner": segmenter.partitioner().class_name(),
        "policy": segmenter.policy().as_str(),
        "arcs": arcs
            .iter()
            .map(|arc| json!({
                "start": arc.start.to_string(),
                "stop": arc.stop.to_string(),
                "size": arc.size.to_string(),
                "ranges": arc
                    .ranges
                    .iter()
                    .map(|range| json!({
                        "start": range.start.to_string(),
                        "end": range.end.to_string(),
                        "span": segmenter.span(range).to_string(),
                    }))
                    .collect::<Vec<_>>(),
            }))
            .collect::<Vec<_>>(),
    })
}

/// Prints how a token list would be split. Returns the process exit code.
pub fn run_segments(args: SegmentsArgs) -> i32 {
    match render_segments(&args) {
        Ok(output) => {
            print!("{output}");
            if args.json {
                println!();
            }
            0
        }
        Err(SegmentsError::Usage(message)) => {
            eprintln!("{message}");
            2
        }
        Err(SegmentsError::Segmenter(err)) => {
            eprintln!("segmentation failed: {err}");
            1
        }
    }
}

/// Prints the stored progress snapshot. Returns the process exit code.
pub async fn run_status(args: StatusArgs) -> i32 {
    dotenv().ok();
    let logging_context = init_logging(SERVICE_NAME, "status", &args.log_level);

    async move {
        let settings = match resolve_status_store(&args) {
            Ok(settings) => settings,
            Err(err) => {
                eprintln!("{err}");
                return 2;
            }
        };
        let store = match open_store(&settings.backend).await {
            Ok(store) => store,
            Err(err) => {
                report_failure("progress_store_open_failed", "could not open progress store", &err);
                return 1;
            }
        };

        let raw = match store.read(&settings.progress_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                println!("no progress recorded under {}", settings.progress_key);
                return 0;
            }
            Err(err) => {
                report_failure("progress_read_failed", "could not read progress", &err);
                return 1;
            }
        };

        match serde_json::from_slice::<ProgressSnapshot>(&raw) {
            Ok(snapshot) => {
                println!("{}", status_report(&settings.progress_key, &snapshot));
                0
            }
            Err(err) => {
                report_failure("progress_decode_failed", "stored progress is not readable", &err);
                1
            }
        }
    }
    .instrument(logging_context.run_span())
    .await
}

fn status_report(key: &str, snapshot: &ProgressSnapshot) -> serde_json::Value {
    json!({
        "key": key,
        "cluster_progress_percent": snapshot.cluster_progress_percent(),
        "snapshot": snapshot,
    })
}
