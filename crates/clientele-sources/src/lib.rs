//! Source loader contracts + fixture-first and Postgres loader implementations.
//!
//! Loaders return records verbatim in the common `RawRecord` shape; no
//! source-specific column layout leaks past this crate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clientele_core::{RawRecord, SourceId};
use clientele_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "clientele-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {source_id} unavailable: {reason}")]
    Unavailable { source_id: SourceId, reason: String },
}

/// A record the loader could see but not turn into a `RawRecord`. Counted and
/// reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedRecord {
    pub source: SourceId,
    pub native_id: String,
    pub reason: String,
}

/// One page of loader output.
#[derive(Debug, Clone, Default)]
pub struct LoadedBatch {
    pub records: Vec<RawRecord>,
    pub malformed: Vec<MalformedRecord>,
}

impl LoadedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.malformed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.malformed.len()
    }

    pub fn extend(&mut self, other: LoadedBatch) {
        self.records.extend(other.records);
        self.malformed.extend(other.malformed);
    }
}

/// Paged, read-only access to one source system's current snapshot.
#[async_trait]
pub trait SourceLoader: Send + Sync {
    fn source(&self) -> SourceId;

    async fn load_page(&self, offset: u64, limit: u64) -> Result<LoadedBatch, SourceError>;
}

/// Drain a loader page by page until it returns an empty page, retrying each
/// page under the given backoff policy before giving the source up.
pub async fn load_all(
    loader: &dyn SourceLoader,
    page_size: u64,
    backoff: &BackoffPolicy,
) -> Result<LoadedBatch, SourceError> {
    let mut out = LoadedBatch::default();
    let mut offset = 0u64;
    loop {
        let page = load_page_with_retries(loader, offset, page_size, backoff).await?;
        if page.is_empty() {
            break;
        }
        offset += page.len() as u64;
        out.extend(page);
    }
    debug!(
        source = %loader.source(),
        records = out.records.len(),
        malformed = out.malformed.len(),
        "source drained"
    );
    Ok(out)
}

async fn load_page_with_retries(
    loader: &dyn SourceLoader,
    offset: u64,
    limit: u64,
    backoff: &BackoffPolicy,
) -> Result<LoadedBatch, SourceError> {
    let mut attempt = 0usize;
    loop {
        match loader.load_page(offset, limit).await {
            Ok(page) => return Ok(page),
            Err(err) if attempt < backoff.max_retries => {
                warn!(
                    source = %loader.source(),
                    offset,
                    attempt,
                    error = %err,
                    "page load failed, retrying"
                );
                tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Registry of configured sources, read from `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: SourceId,
    pub display_name: String,
    pub enabled: bool,
    pub mode: LoadMode,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub columns: Option<ColumnMap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    Fixture,
    Postgres,
}

/// Source-specific column names mapped onto the common record shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMap {
    pub native_id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    #[serde(default)]
    pub whatsapp: Option<String>,
    pub created_at: String,
}

pub fn load_source_registry(path: impl AsRef<Path>) -> Result<SourceRegistry> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Build a loader for one registry entry. Postgres mode needs a pool plus a
/// table and column map in the entry.
pub fn build_loader(
    config: &SourceConfig,
    fixtures_dir: &Path,
    pool: Option<&PgPool>,
) -> Result<Box<dyn SourceLoader>> {
    match config.mode {
        LoadMode::Fixture => Ok(Box::new(FixtureSourceLoader::new(
            config.source,
            fixtures_dir.join(config.source.as_str()),
        ))),
        LoadMode::Postgres => {
            let pool = pool
                .with_context(|| format!("{}: postgres mode needs a database pool", config.source))?
                .clone();
            let table = config
                .table
                .clone()
                .with_context(|| format!("{}: postgres mode needs `table`", config.source))?;
            let columns = config
                .columns
                .clone()
                .with_context(|| format!("{}: postgres mode needs `columns`", config.source))?;
            Ok(Box::new(PgSourceLoader::new(
                config.source,
                pool,
                table,
                columns,
            )?))
        }
    }
}

/// Loader backed by a `records.json` fixture file, mirroring how the rest of
/// the workspace tests run without live infrastructure.
#[derive(Debug, Clone)]
pub struct FixtureSourceLoader {
    source: SourceId,
    dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureRecord {
    native_id: JsonValue,
    #[serde(default)]
    name: Option<JsonValue>,
    #[serde(default)]
    email: Option<JsonValue>,
    #[serde(default)]
    phone: Option<JsonValue>,
    #[serde(default)]
    whatsapp: Option<JsonValue>,
    created_at: JsonValue,
    #[serde(flatten)]
    extra: BTreeMap<String, JsonValue>,
}

impl FixtureSourceLoader {
    pub fn new(source: SourceId, dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            dir: dir.into(),
        }
    }

    fn records_path(&self) -> PathBuf {
        self.dir.join("records.json")
    }

    fn convert(&self, fixture: FixtureRecord) -> Result<RawRecord, String> {
        let native_id = value_to_text(&fixture.native_id)
            .ok_or_else(|| "missing native_id".to_string())?;
        let created_at = fixture
            .created_at
            .as_str()
            .ok_or_else(|| "created_at is not a string".to_string())
            .and_then(|s| {
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| format!("bad created_at: {e}"))
            })?;
        Ok(RawRecord {
            source: self.source,
            native_id,
            name: fixture.name.as_ref().and_then(value_to_text),
            email: fixture.email.as_ref().and_then(value_to_text),
            phone_raw: fixture.phone.as_ref().and_then(value_to_text),
            whatsapp_raw: fixture.whatsapp.as_ref().and_then(value_to_text),
            created_at,
            extra: fixture.extra,
        })
    }
}

/// JSON null stays absent; the literal string `"null"` is preserved for the
/// normalizer, which owns sentinel handling.
fn value_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl SourceLoader for FixtureSourceLoader {
    fn source(&self) -> SourceId {
        self.source
    }

    async fn load_page(&self, offset: u64, limit: u64) -> Result<LoadedBatch, SourceError> {
        let path = self.records_path();
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            SourceError::Unavailable {
                source_id: self.source,
                reason: format!("reading {}: {e}", path.display()),
            }
        })?;
        let fixtures: Vec<FixtureRecord> =
            serde_json::from_str(&text).map_err(|e| SourceError::Unavailable {
                source_id: self.source,
                reason: format!("parsing {}: {e}", path.display()),
            })?;

        let mut batch = LoadedBatch::default();
        let start = (offset as usize).min(fixtures.len());
        let end = (start + limit as usize).min(fixtures.len());
        for fixture in &fixtures[start..end] {
            let native_id = value_to_text(&fixture.native_id).unwrap_or_default();
            match self.convert(fixture.clone()) {
                Ok(record) => batch.records.push(record),
                Err(reason) => batch.malformed.push(MalformedRecord {
                    source: self.source,
                    native_id,
                    reason,
                }),
            }
        }
        Ok(batch)
    }
}

/// Loader over one relational source table, using bound offset/limit
/// parameters and a validated identifier map.
#[derive(Debug, Clone)]
pub struct PgSourceLoader {
    source: SourceId,
    pool: PgPool,
    query: String,
}

impl PgSourceLoader {
    pub fn new(
        source: SourceId,
        pool: PgPool,
        table: String,
        columns: ColumnMap,
    ) -> Result<Self> {
        let table = checked_ident(&table)?;
        let native_id = checked_ident(&columns.native_id)?;
        let name = checked_ident(&columns.name)?;
        let email = checked_ident(&columns.email)?;
        let phone = checked_ident(&columns.phone)?;
        let created_at = checked_ident(&columns.created_at)?;
        let whatsapp_expr = match &columns.whatsapp {
            Some(col) => format!("{}::text", checked_ident(col)?),
            None => "NULL::text".to_string(),
        };
        // Identifiers cannot be bound parameters; they are validated above and
        // interpolated once here. Offset/limit are bound.
        let query = format!(
            "SELECT {native_id}::text AS native_id, {name}::text AS name, \
             {email}::text AS email, {phone}::text AS phone, \
             {whatsapp_expr} AS whatsapp, {created_at} AS created_at \
             FROM {table} ORDER BY {native_id} OFFSET $1 LIMIT $2"
        );
        Ok(Self {
            source,
            pool,
            query,
        })
    }
}

/// Reject anything that is not a plain SQL identifier.
fn checked_ident(ident: &str) -> Result<&str> {
    let mut chars = ident.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if head_ok && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(ident)
    } else {
        anyhow::bail!("invalid SQL identifier: {ident:?}")
    }
}

#[async_trait]
impl SourceLoader for PgSourceLoader {
    fn source(&self) -> SourceId {
        self.source
    }

    async fn load_page(&self, offset: u64, limit: u64) -> Result<LoadedBatch, SourceError> {
        let rows = sqlx::query(&self.query)
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SourceError::Unavailable {
                source_id: self.source,
                reason: e.to_string(),
            })?;

        let mut batch = LoadedBatch::default();
        for row in rows {
            let native_id: String = match row.try_get::<Option<String>, _>("native_id") {
                Ok(Some(id)) => id,
                Ok(None) | Err(_) => {
                    batch.malformed.push(MalformedRecord {
                        source: self.source,
                        native_id: String::new(),
                        reason: "missing native_id".to_string(),
                    });
                    continue;
                }
            };
            let created_at: DateTime<Utc> =
                match row.try_get::<Option<DateTime<Utc>>, _>("created_at") {
                    Ok(Some(ts)) => ts,
                    Ok(None) => {
                        batch.malformed.push(MalformedRecord {
                            source: self.source,
                            native_id,
                            reason: "missing created_at".to_string(),
                        });
                        continue;
                    }
                    Err(e) => {
                        batch.malformed.push(MalformedRecord {
                            source: self.source,
                            native_id,
                            reason: format!("bad created_at: {e}"),
                        });
                        continue;
                    }
                };
            batch.records.push(RawRecord {
                source: self.source,
                native_id,
                name: row.try_get("name").unwrap_or(None),
                email: row.try_get("email").unwrap_or(None),
                phone_raw: row.try_get("phone").unwrap_or(None),
                whatsapp_raw: row.try_get("whatsapp").unwrap_or(None),
                created_at,
                extra: BTreeMap::new(),
            });
        }
        Ok(batch)
    }
}
