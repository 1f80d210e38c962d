use diesel::sql_types::Text;
use diesel::{sql_query, QueryableByName};
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use futures::future::BoxFuture;

use super::{ProgressStore, StoreError};

#[derive(Debug, QueryableByName)]
struct ValueRow {
    #[diesel(sql_type = Text)]
    value: String,
}

/// Postgres backed store, one row per key in `repair_progress`.
#[derive(Clone)]
pub struct PgProgressStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgProgressStore {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }

    async fn load_value(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.pool.get().await?;
        let mut rows = sql_query("SELECT value FROM repair_progress WHERE key = $1")
            .bind::<Text, _>(key)
            .load::<ValueRow>(&mut conn)
            .await?;

        Ok(rows.pop().map(|row| row.value.into_bytes()))
    }

    async fn save_value(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let value = String::from_utf8_lossy(&value).into_owned();
        let mut conn = self.pool.get().await?;
        sql_query(
            "INSERT INTO repair_progress (key, value, updated_at) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (key) DO UPDATE \
             SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind::<Text, _>(key)
        .bind::<Text, _>(value)
        .execute(&mut conn)
        .await?;
        Ok(())
    }
}

impl ProgressStore for PgProgressStore {
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(self.load_value(key))
    }

    fn write<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.save_value(key, value))
    }
}
