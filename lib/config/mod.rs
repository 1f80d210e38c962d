//! Settings for the `run` and `status` subcommands.
//!
//! Every setting resolves flag, then environment variable, then default. Values are validated
//! here so the worker refuses to start on a bad configuration instead of failing mid-pass.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::cli::{RunArgs, StatusArgs, StoreArgs};
use crate::executor::{RepairParallelism, RepairSettings};
use crate::repair_service::default_progress_key;
use crate::segmenter::{Partitioner, SegmentCountPolicy, MAX_SLICES};

const DEFAULT_INTERVAL_SECS: u64 = 3600;
const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
const DEFAULT_SLICES: u64 = 64;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_CONSUL_URL: &str = "http://127.0.0.1:8500";
const DEFAULT_BIND: &str = "0.0.0.0:3000";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{setting} is required ({hint})")]
    Missing {
        setting: &'static str,
        hint: &'static str,
    },
    #[error("invalid {setting}: {message}")]
    Invalid {
        setting: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    Consul { url: String, token: Option<String> },
    Postgres { database_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub backend: StoreConfig,
    pub progress_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub cluster: String,
    pub keyspaces: Vec<String>,
    pub interval: Duration,
    pub retry_delay: Duration,
    pub service_host: String,
    pub store: StoreSettings,
    pub seed_agent_url: String,
    /// Ring endpoint to node agent URL.
    pub nodes: HashMap<String, String>,
    pub partitioner: Option<String>,
    pub slices: u64,
    pub segment_policy: SegmentCountPolicy,
    pub repair: RepairSettings,
    pub completion_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub bind: SocketAddr,
}

impl Config {
    pub fn resolve(args: &RunArgs) -> Result<Self, ConfigError> {
        Self::resolve_with(args, |key| env::var(key).ok())
    }

    /// Resolves against an arbitrary environment lookup.
    pub fn resolve_with(
        args: &RunArgs,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = Lookup(&lookup);

        let cluster = env
            .text(&args.cluster, "REPAIR_CLUSTER")
            .ok_or(ConfigError::Missing {
                setting: "cluster",
                hint: "--cluster or REPAIR_CLUSTER",
            })?;
        let keyspaces = env
            .text(&args.keyspaces, "REPAIR_KEYSPACES")
            .map(|raw| split_list(&raw))
            .filter(|keyspaces| !keyspaces.is_empty())
            .ok_or(ConfigError::Missing {
                setting: "keyspaces",
                hint: "--keyspaces or REPAIR_KEYSPACES",
            })?;

        let interval_secs = env
            .parsed(&args.interval_secs, "REPAIR_INTERVAL_SECS", "interval")?
            .unwrap_or(DEFAULT_INTERVAL_SECS);
        let retry_delay_secs = env
            .parsed(&args.retry_delay_secs, "REPAIR_RETRY_DELAY_SECS", "retry delay")?
            .unwrap_or(DEFAULT_RETRY_DELAY_SECS);
        let service_host = env
            .text(&args.service_host, "REPAIR_SERVICE_HOST")
            .or_else(|| lookup("HOSTNAME").filter(|host| !host.trim().is_empty()))
            .unwrap_or_else(|| "localhost".to_string());

        let store = resolve_store_with(&args.store, &cluster, &lookup)?;

        let seed_agent_url = env
            .text(&args.seed_agent_url, "REPAIR_SEED_AGENT_URL")
            .ok_or(ConfigError::Missing {
                setting: "seed agent url",
                hint: "--seed-agent-url or REPAIR_SEED_AGENT_URL",
            })?;
        let nodes = env
            .text(&args.nodes, "REPAIR_NODES")
            .ok_or(ConfigError::Missing {
                setting: "nodes",
                hint: "--nodes or REPAIR_NODES as endpoint=url,...",
            })
            .and_then(|raw| parse_nodes(&raw))?;

        let partitioner = env.text(&args.partitioner, "REPAIR_PARTITIONER");
        let slices = env
            .parsed(&args.slices, "REPAIR_SLICES", "slices")?
            .unwrap_or(DEFAULT_SLICES);
        let segment_policy = match &args.segment_policy {
            Some(raw) => parse_value(raw, "segment policy")?,
            None => env
                .parsed::<SegmentCountPolicy>(&None, "REPAIR_SEGMENT_POLICY", "segment policy")?
                .unwrap_or_default(),
        };
        let parallelism = match &args.parallelism {
            Some(raw) => parse_value(raw, "parallelism")?,
            None => env
                .parsed::<RepairParallelism>(&None, "REPAIR_PARALLELISM", "parallelism")?
                .unwrap_or_default(),
        };
        let incremental = args.incremental
            || env
                .text(&None, "REPAIR_INCREMENTAL")
                .map(|raw| parse_flag(&raw, "incremental"))
                .transpose()?
                .unwrap_or(false);
        let completion_timeout = env
            .parsed(
                &args.completion_timeout_secs,
                "REPAIR_COMPLETION_TIMEOUT_SECS",
                "completion timeout",
            )?
            .map(Duration::from_secs);
        let poll_interval_ms = env
            .parsed(&args.poll_interval_ms, "REPAIR_POLL_INTERVAL_MS", "poll interval")?
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let bind = env
            .text(&args.bind, "REPAIR_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = parse_value::<SocketAddr>(&bind, "bind address")?;

        let config = Self {
            cluster,
            keyspaces,
            interval: Duration::from_secs(interval_secs),
            retry_delay: Duration::from_secs(retry_delay_secs),
            service_host,
            store,
            seed_agent_url,
            nodes,
            partitioner,
            slices,
            segment_policy,
            repair: RepairSettings {
                parallelism,
                incremental,
            },
            completion_timeout,
            poll_interval: Duration::from_millis(poll_interval_ms),
            bind,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slices == 0 {
            return Err(invalid("slices", "must be > 0"));
        }
        if self.slices > MAX_SLICES {
            return Err(invalid("slices", format!("must be at most {MAX_SLICES}")));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll interval", "must be > 0"));
        }
        if self.completion_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(invalid("completion timeout", "must be > 0 when set"));
        }
        if let Some(name) = &self.partitioner {
            Partitioner::from_class_name(name).map_err(|err| invalid("partitioner", err))?;
        }
        if let Some(duplicate) = first_duplicate(&self.keyspaces) {
            return Err(invalid(
                "keyspaces",
                format!("`{duplicate}` is listed more than once"),
            ));
        }
        Ok(())
    }
}

/// Resolves the store for the `status` subcommand.
pub fn resolve_status_store(args: &StatusArgs) -> Result<StoreSettings, ConfigError> {
    let lookup = |key: &str| env::var(key).ok();
    let cluster = Lookup(&lookup).text(&args.cluster, "REPAIR_CLUSTER");
    match (&args.store.progress_key, cluster) {
        (None, None) => Err(ConfigError::Missing {
            setting: "cluster",
            hint: "--cluster, REPAIR_CLUSTER or --progress-key",
        }),
        (_, cluster) => {
            resolve_store_with(&args.store, cluster.as_deref().unwrap_or_default(), &lookup)
        }
    }
}

fn resolve_store_with(
    args: &StoreArgs,
    cluster: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<StoreSettings, ConfigError> {
    let env = Lookup(lookup);
    let backend = env
        .text(&args.store, "REPAIR_STORE")
        .unwrap_or_else(|| "consul".to_string());

    let backend = match backend.trim().to_ascii_lowercase().as_str() {
        "memory" => StoreConfig::Memory,
        "consul" => StoreConfig::Consul {
            url: env
                .text(&args.consul_url, "CONSUL_HTTP_ADDR")
                .map(|url| with_scheme(&url))
                .unwrap_or_else(|| DEFAULT_CONSUL_URL.to_string()),
            token: env.text(&None, "CONSUL_HTTP_TOKEN"),
        },
        "postgres" | "pg" => StoreConfig::Postgres {
            database_url: env.text(&args.database_url, "DATABASE_URL").ok_or(
                ConfigError::Missing {
                    setting: "database url",
                    hint: "--database-url or DATABASE_URL for the postgres store",
                },
            )?,
        },
        other => {
            return Err(invalid(
                "store",
                format!("unknown backend `{other}` (expected consul, postgres or memory)"),
            ))
        }
    };

    let progress_key = env
        .text(&args.progress_key, "REPAIR_PROGRESS_KEY")
        .unwrap_or_else(|| default_progress_key(cluster));

    Ok(StoreSettings {
        backend,
        progress_key,
    })
}

struct Lookup<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn text(&self, flag: &Option<String>, key: &str) -> Option<String> {
        flag.clone()
            .or_else(|| (self.0)(key))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T>(
        &self,
        flag: &Option<T>,
        key: &str,
        setting: &'static str,
    ) -> Result<Option<T>, ConfigError>
    where
        T: FromStr + Clone,
        T::Err: ToString,
    {
        if let Some(value) = flag {
            return Ok(Some(value.clone()));
        }
        match self.text(&None, key) {
            Some(raw) => parse_value(&raw, setting).map(Some),
            None => Ok(None),
        }
    }
}

fn parse_value<T>(raw: &str, setting: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| invalid(setting, format!("`{raw}`: {}", err.to_string())))
}

/// Boolean switch from the environment: `1/0`, `true/false`, `yes/no` or `on/off`, any case.
fn parse_flag(raw: &str, setting: &'static str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(
            setting,
            format!("`{raw}`: expected one of 1/0, true/false, yes/no, on/off"),
        )),
    }
}

fn invalid(setting: &'static str, message: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        setting,
        message: message.to_string(),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `endpoint=url,endpoint=url`.
pub fn parse_nodes(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut nodes = HashMap::new();
    for entry in split_list(raw) {
        let Some((endpoint, url)) = entry.split_once('=') else {
            return Err(invalid("nodes", format!("`{entry}` is not endpoint=url")));
        };
        let (endpoint, url) = (endpoint.trim(), url.trim());
        if endpoint.is_empty() || url.is_empty() {
            return Err(invalid("nodes", format!("`{entry}` is not endpoint=url")));
        }
        if nodes
            .insert(endpoint.to_string(), with_scheme(url))
            .is_some()
        {
            return Err(invalid(
                "nodes",
                format!("endpoint `{endpoint}` is listed more than once"),
            ));
        }
    }
    if nodes.is_empty() {
        return Err(invalid("nodes", "no endpoint=url entries"));
    }
    Ok(nodes)
}

fn with_scheme(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

fn first_duplicate(items: &[String]) -> Option<&str> {
    items
        .iter()
        .enumerate()
        .find(|(index, item)| items[..*index].contains(item))
        .map(|(_, item)| item.as_str())
}
