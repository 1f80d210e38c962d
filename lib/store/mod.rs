//! Durable home of the progress snapshot.
//!
//! The store is a plain key/value seam: it knows nothing about the snapshot's shape, only bytes
//! under a key.

mod consul;
mod pg;

pub use consul::ConsulProgressStore;
pub use pg::PgProgressStore;

use diesel::result::Error as DieselError;
use diesel_async::pooled_connection::deadpool::PoolError;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::config::StoreConfig;
use crate::db::{self, DbSetupError};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unexpected HTTP status for key {key}: {status}")]
    UnexpectedStatus { key: String, status: u16 },
    #[error(transparent)]
    RequestError(#[from] reqwest::Error),
    #[error(transparent)]
    DieselError(#[from] DieselError),
    #[error(transparent)]
    DBPoolError(#[from] PoolError),
    #[error(transparent)]
    DbSetup(#[from] DbSetupError),
    #[error("could not encode progress snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait ProgressStore: Send + Sync {
    /// Returns `None` when nothing was ever written under `key`.
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>>;

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>>;
}

impl<T> ProgressStore for Arc<T>
where
    T: ProgressStore + ?Sized,
{
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        (**self).read(key)
    }

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).write(key, value)
    }
}

/// Process-local store. Progress does not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        let store = Self::new();
        store
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.into(), value.into());
        store
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn put(&self, key: &str, value: Vec<u8>) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value);
    }
}

impl ProgressStore for MemoryProgressStore {
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        let value = self.get(key);
        Box::pin(async move { Ok(value) })
    }

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>> {
        self.put(key, value);
        Box::pin(async { Ok(()) })
    }
}

/// Builds the configured backend. Postgres runs pending migrations first.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ProgressStore>, StoreError> {
    let store: Arc<dyn ProgressStore> = match config {
        StoreConfig::Memory => Arc::new(MemoryProgressStore::new()),
        StoreConfig::Consul { url, token } => {
            Arc::new(ConsulProgressStore::new(url.clone(), token.clone())?)
        }
        StoreConfig::Postgres { database_url } => {
            Arc::new(PgProgressStore::new(db::connect(database_url).await?))
        }
    };
    Ok(store)
}
