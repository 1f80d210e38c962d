use diesel::{pg::PgConnection, Connection};
use diesel_async::{
    pg::AsyncPgConnection,
    pooled_connection::{
        deadpool::{BuildError, Pool},
        AsyncDieselConnectionManager,
    },
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use thiserror::Error;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// The worker holds at most one connection while persisting; the second covers `status` reads
/// issued while a write is in flight.
const POOL_MAX_SIZE: usize = 2;

#[derive(Error, Debug)]
pub enum DbSetupError {
    #[error("could not connect to database: {0}")]
    Connect(#[from] diesel::ConnectionError),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error(transparent)]
    PoolBuild(#[from] BuildError),
    #[error("migration task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub async fn build_db_pool(db_url: &str) -> Result<Pool<AsyncPgConnection>, BuildError> {
    let pool_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    let pool = Pool::builder(pool_config).max_size(POOL_MAX_SIZE).build()?;

    Ok(pool)
}

/// Applies pending migrations over a short-lived synchronous connection.
pub async fn run_migrations(db_url: &str) -> Result<(), DbSetupError> {
    let db_url = db_url.to_string();
    tokio::task::spawn_blocking(move || -> Result<(), DbSetupError> {
        let mut connection = PgConnection::establish(&db_url)?;
        connection
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| DbSetupError::Migration(err.to_string()))?;
        Ok(())
    })
    .await?
}

/// Runs migrations and builds the pool the Postgres progress store uses.
pub async fn connect(db_url: &str) -> Result<Pool<AsyncPgConnection>, DbSetupError> {
    run_migrations(db_url).await?;
    Ok(build_db_pool(db_url).await?)
}
