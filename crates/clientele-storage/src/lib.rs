//! Master-record persistence for Clientele: Postgres store plus an
//! in-memory store used by tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clientele_core::{Field, MasterRecord, SourceId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "clientele-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("output store unavailable: {0}")]
    Unavailable(String),
    #[error("write conflict on master {id}")]
    WriteConflict { id: Uuid },
    #[error("master {id} not found")]
    NotFound { id: Uuid },
    #[error("corrupt master row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl StoreError {
    /// Conflicts are worth retrying; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::WriteConflict { .. })
    }
}

/// Exponential backoff with a hard cap, shared by page loads and upserts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Persistence seam for master records.
///
/// `update` takes the `updated_at` the caller last observed; a mismatch means
/// someone else wrote in between and surfaces as `WriteConflict`.
#[async_trait]
pub trait MasterStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<MasterRecord>, StoreError>;

    /// Every master holding at least one of the given match keys.
    async fn find_by_keys(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<Vec<MasterRecord>, StoreError>;

    async fn insert(&self, master: &MasterRecord) -> Result<(), StoreError>;

    async fn update(
        &self,
        master: &MasterRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    async fn all(&self) -> Result<Vec<MasterRecord>, StoreError>;
}

/// In-memory store with the same conflict semantics as the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryMasterStore {
    masters: Mutex<BTreeMap<Uuid, MasterRecord>>,
}

impl MemoryMasterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MasterStore for MemoryMasterStore {
    async fn get(&self, id: Uuid) -> Result<Option<MasterRecord>, StoreError> {
        Ok(self.masters.lock().await.get(&id).cloned())
    }

    async fn find_by_keys(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<Vec<MasterRecord>, StoreError> {
        let masters = self.masters.lock().await;
        Ok(masters
            .values()
            .filter(|m| m.match_keys.iter().any(|k| keys.contains(k)))
            .cloned()
            .collect())
    }

    async fn insert(&self, master: &MasterRecord) -> Result<(), StoreError> {
        let mut masters = self.masters.lock().await;
        masters.insert(master.id, master.clone());
        Ok(())
    }

    async fn update(
        &self,
        master: &MasterRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut masters = self.masters.lock().await;
        let existing = masters
            .get_mut(&master.id)
            .ok_or(StoreError::NotFound { id: master.id })?;
        if existing.updated_at != expected_updated_at {
            return Err(StoreError::WriteConflict { id: master.id });
        }
        *existing = master.clone();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.masters.lock().await.remove(&id);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<MasterRecord>, StoreError> {
        Ok(self.masters.lock().await.values().cloned().collect())
    }
}

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    Ok(())
}

/// Postgres-backed store: `masters` table plus an append-only `master_keys`
/// index used for lookup-by-any-key.
#[derive(Debug, Clone)]
pub struct PgMasterStore {
    pool: PgPool,
}

impl PgMasterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_master(row: &sqlx::postgres::PgRow) -> Result<MasterRecord, StoreError> {
        let tags: Vec<String> = row.try_get("source_tags")?;
        let source_tags = tags
            .iter()
            .map(|t| SourceId::from_str(t))
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let member_count: i32 = row.try_get("member_count")?;
        Ok(MasterRecord {
            id: row.try_get("id")?,
            name: Self::row_field(row, "name", "name_source")?,
            email: Self::row_field(row, "email", "email_source")?,
            phone: Self::row_field(row, "phone", "phone_source")?,
            whatsapp: Self::row_field(row, "whatsapp", "whatsapp_source")?,
            source_tags,
            match_keys: BTreeSet::new(),
            member_count: member_count.max(0) as u32,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_field(
        row: &sqlx::postgres::PgRow,
        value_col: &str,
        source_col: &str,
    ) -> Result<Field<String>, StoreError> {
        let value: Option<String> = row.try_get(value_col)?;
        let source: Option<String> = row.try_get(source_col)?;
        let source = source
            .map(|s| SourceId::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Field { value, source })
    }

    async fn load_keys(&self, master: &mut MasterRecord) -> Result<(), StoreError> {
        let rows = sqlx::query("SELECT match_key FROM master_keys WHERE master_id = $1")
            .bind(master.id)
            .fetch_all(&self.pool)
            .await?;
        master.match_keys = rows
            .iter()
            .map(|r| r.try_get::<String, _>("match_key"))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(())
    }

    async fn write_keys(&self, master: &MasterRecord) -> Result<(), StoreError> {
        for key in &master.match_keys {
            sqlx::query(
                "INSERT INTO master_keys (master_id, match_key) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(master.id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    fn tags_column(master: &MasterRecord) -> Vec<String> {
        master
            .source_tags
            .iter()
            .map(|s| s.as_str().to_string())
            .collect()
    }
}

#[async_trait]
impl MasterStore for PgMasterStore {
    async fn get(&self, id: Uuid) -> Result<Option<MasterRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM masters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut master = Self::row_to_master(&row)?;
        self.load_keys(&mut master).await?;
        Ok(Some(master))
    }

    async fn find_by_keys(
        &self,
        keys: &BTreeSet<String>,
    ) -> Result<Vec<MasterRecord>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let key_list: Vec<String> = keys.iter().cloned().collect();
        let rows = sqlx::query(
            "SELECT DISTINCT m.* FROM masters m \
             JOIN master_keys k ON k.master_id = m.id \
             WHERE k.match_key = ANY($1) \
             ORDER BY m.created_at, m.id",
        )
        .bind(&key_list)
        .fetch_all(&self.pool)
        .await?;
        let mut masters = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut master = Self::row_to_master(row)?;
            self.load_keys(&mut master).await?;
            masters.push(master);
        }
        Ok(masters)
    }

    async fn insert(&self, master: &MasterRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO masters \
             (id, name, name_source, email, email_source, phone, phone_source, \
              whatsapp, whatsapp_source, source_tags, member_count, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(master.id)
        .bind(&master.name.value)
        .bind(master.name.source.map(|s| s.as_str()))
        .bind(&master.email.value)
        .bind(master.email.source.map(|s| s.as_str()))
        .bind(&master.phone.value)
        .bind(master.phone.source.map(|s| s.as_str()))
        .bind(&master.whatsapp.value)
        .bind(master.whatsapp.source.map(|s| s.as_str()))
        .bind(Self::tags_column(master))
        .bind(master.member_count as i32)
        .bind(master.created_at)
        .bind(master.updated_at)
        .execute(&self.pool)
        .await?;
        self.write_keys(master).await?;
        debug!(master_id = %master.id, "master inserted");
        Ok(())
    }

    async fn update(
        &self,
        master: &MasterRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE masters SET \
             name = $2, name_source = $3, email = $4, email_source = $5, \
             phone = $6, phone_source = $7, whatsapp = $8, whatsapp_source = $9, \
             source_tags = $10, member_count = $11, updated_at = $12 \
             WHERE id = $1 AND updated_at = $13",
        )
        .bind(master.id)
        .bind(&master.name.value)
        .bind(master.name.source.map(|s| s.as_str()))
        .bind(&master.email.value)
        .bind(master.email.source.map(|s| s.as_str()))
        .bind(&master.phone.value)
        .bind(master.phone.source.map(|s| s.as_str()))
        .bind(&master.whatsapp.value)
        .bind(master.whatsapp.source.map(|s| s.as_str()))
        .bind(Self::tags_column(master))
        .bind(master.member_count as i32)
        .bind(master.updated_at)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM masters WHERE id = $1")
                .bind(master.id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            if exists {
                return Err(StoreError::WriteConflict { id: master.id });
            }
            return Err(StoreError::NotFound { id: master.id });
        }
        self.write_keys(master).await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM masters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!(master_id = %id, "master deleted");
        Ok(())
    }

    async fn all(&self) -> Result<Vec<MasterRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM masters ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        let mut masters = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut master = Self::row_to_master(row)?;
            self.load_keys(&mut master).await?;
            masters.push(master);
        }
        Ok(masters)
    }
}
