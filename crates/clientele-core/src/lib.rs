//! Core domain model for the Clientele consolidation engine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "clientele-core";

/// The four fixed source systems, declared in descending data-quality order.
///
/// The derived `Ord` therefore doubles as the merge priority: a variant that
/// sorts earlier outranks one that sorts later.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SourceId {
    CrmLeads,
    LandingPage,
    MarketingExport,
    LegacyErp,
}

impl SourceId {
    pub const ALL: [SourceId; 4] = [
        SourceId::CrmLeads,
        SourceId::LandingPage,
        SourceId::MarketingExport,
        SourceId::LegacyErp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::CrmLeads => "crm-leads",
            SourceId::LandingPage => "landing-page",
            SourceId::MarketingExport => "marketing-export",
            SourceId::LegacyErp => "legacy-erp",
        }
    }

    /// 1 is the highest quality rank, 4 the lowest.
    pub fn priority_rank(&self) -> u8 {
        match self {
            SourceId::CrmLeads => 1,
            SourceId::LandingPage => 2,
            SourceId::MarketingExport => 3,
            SourceId::LegacyErp => 4,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = UnknownSourceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crm-leads" => Ok(SourceId::CrmLeads),
            "landing-page" => Ok(SourceId::LandingPage),
            "marketing-export" => Ok(SourceId::MarketingExport),
            "legacy-erp" => Ok(SourceId::LegacyErp),
            other => Err(UnknownSourceId(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSourceId(pub String);

impl fmt::Display for UnknownSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown source id: {}", self.0)
    }
}

impl std::error::Error for UnknownSourceId {}

/// One record exactly as it exists in a single source system.
///
/// Field values are kept verbatim, placeholder sentinels included; cleanup
/// is the normalizer's job, not the loader's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: SourceId,
    pub native_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone_raw: Option<String>,
    pub whatsapp_raw: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Source-specific attributes carried along but never matched on.
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Canonical matching keys derived from one `RawRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedIdentity {
    pub phone_variants: BTreeSet<String>,
    pub email_key: Option<String>,
}

impl NormalizedIdentity {
    /// A record with no usable phone and no usable email can never match
    /// anything; it stays in the pipeline as a singleton.
    pub fn is_unmatchable(&self) -> bool {
        self.phone_variants.is_empty() && self.email_key.is_none()
    }

    /// Namespaced match keys, suitable for a single shared index.
    pub fn match_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self
            .phone_variants
            .iter()
            .map(|v| format!("p:{v}"))
            .collect();
        if let Some(email) = &self.email_key {
            keys.insert(format!("e:{email}"));
        }
        keys
    }
}

/// A raw record paired with its derived identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRecord {
    pub record: RawRecord,
    pub identity: NormalizedIdentity,
}

/// A cluster of records believed to describe the same real-world customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityGroup {
    pub members: Vec<MatchedRecord>,
}

impl IdentityGroup {
    /// Union of every member's match keys.
    ///
    /// A group of unmatchable records has no phone or email keys, so it gets
    /// a synthetic `u:{source}/{native_id}` key per member instead. Without
    /// one, a re-run could never find the master it created last time and
    /// would insert a duplicate on every pass.
    pub fn match_keys(&self) -> BTreeSet<String> {
        let keys: BTreeSet<String> = self
            .members
            .iter()
            .flat_map(|m| m.identity.match_keys())
            .collect();
        if !keys.is_empty() {
            return keys;
        }
        self.members
            .iter()
            .map(|m| format!("u:{}/{}", m.record.source, m.record.native_id))
            .collect()
    }

    pub fn source_tags(&self) -> BTreeSet<SourceId> {
        self.members.iter().map(|m| m.record.source).collect()
    }
}

/// Master field wrapper: the chosen value plus the source that supplied it.
///
/// The source is persisted so that a later run can refuse to overwrite a
/// higher-priority value with a lower-priority one even after the
/// higher-priority upstream record has disappeared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Field<T> {
    pub value: Option<T>,
    pub source: Option<SourceId>,
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            source: None,
        }
    }

    pub fn from_source(value: T, source: SourceId) -> Self {
        Self {
            value: Some(value),
            source: Some(source),
        }
    }

    /// Rank of the source backing the current value; empty fields rank below
    /// every real source so any candidate may fill them.
    pub fn source_rank(&self) -> u8 {
        match (&self.value, self.source) {
            (Some(_), Some(source)) => source.priority_rank(),
            _ => u8::MAX,
        }
    }
}

/// The consolidated, persisted record for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub id: Uuid,
    pub name: Field<String>,
    pub email: Field<String>,
    pub phone: Field<String>,
    pub whatsapp: Field<String>,
    /// Append-only: a tag is never removed once a source has contributed.
    pub source_tags: BTreeSet<SourceId>,
    /// Append-only index of every match key ever observed for this identity.
    pub match_keys: BTreeSet<String>,
    pub member_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MasterRecord {
    pub fn new(id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: Field::empty(),
            email: Field::empty(),
            phone: Field::empty(),
            whatsapp: Field::empty(),
            source_tags: BTreeSet::new(),
            match_keys: BTreeSet::new(),
            member_count: 0,
            created_at,
            updated_at: created_at,
        }
    }
}

/// Per-source outcome of the load stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub loaded: usize,
    pub malformed: usize,
    pub failed: bool,
    pub error: Option<String>,
}

/// Error counts by taxonomy category, reported in every run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub source_unavailable: usize,
    pub malformed_record: usize,
    pub write_conflict: usize,
}

/// The always-produced run summary; silent partial success is not allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: BTreeMap<String, SourceOutcome>,
    pub records_loaded: usize,
    pub groups_formed: usize,
    pub unmatchable_records: usize,
    pub masters_created: usize,
    pub masters_updated: usize,
    pub masters_unchanged: usize,
    pub masters_superseded: usize,
    pub failed_groups: usize,
    pub errors: ErrorCounts,
    /// A few `source/native_id` pairs of records that failed normalization,
    /// so the summary is actionable without grepping logs.
    pub malformed_samples: Vec<String>,
}
