//! End-to-end pipeline tests over fixture loaders and the in-memory store.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clientele_core::{MasterRecord, SourceId};
use clientele_engine::{ConsolidateConfig, ConsolidationPipeline, PipelineError};
use clientele_sources::{FixtureSourceLoader, SourceLoader};
use clientele_storage::{BackoffPolicy, MasterStore, MemoryMasterStore, StoreError};
use serde_json::json;
use uuid::Uuid;

fn test_config(root: &Path) -> ConsolidateConfig {
    ConsolidateConfig {
        database_url: "unused".to_string(),
        workspace_root: root.to_path_buf(),
        page_size: 50,
        backoff: BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        group_size_alert: 8,
    }
}

fn write_fixture(root: &Path, source: SourceId, records: serde_json::Value) {
    let dir = root.join("fixtures").join(source.as_str());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("records.json"),
        serde_json::to_vec_pretty(&records).unwrap(),
    )
    .unwrap();
}

fn loaders_for(root: &Path, sources: &[SourceId]) -> Vec<Box<dyn SourceLoader>> {
    sources
        .iter()
        .map(|s| {
            Box::new(FixtureSourceLoader::new(
                *s,
                root.join("fixtures").join(s.as_str()),
            )) as Box<dyn SourceLoader>
        })
        .collect()
}

/// In-memory store that fails `update` with a write conflict a configurable
/// number of times before delegating. `usize::MAX` conflicts forever.
struct ContentiousStore {
    inner: MemoryMasterStore,
    conflicts_left: AtomicUsize,
}

impl ContentiousStore {
    fn new() -> Self {
        Self {
            inner: MemoryMasterStore::new(),
            conflicts_left: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MasterStore for ContentiousStore {
    async fn get(&self, id: Uuid) -> Result<Option<MasterRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn find_by_keys(&self, keys: &BTreeSet<String>) -> Result<Vec<MasterRecord>, StoreError> {
        self.inner.find_by_keys(keys).await
    }

    async fn insert(&self, master: &MasterRecord) -> Result<(), StoreError> {
        self.inner.insert(master).await
    }

    async fn update(
        &self,
        master: &MasterRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let left = self.conflicts_left.load(Ordering::SeqCst);
        if left > 0 {
            if left != usize::MAX {
                self.conflicts_left.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(StoreError::WriteConflict { id: master.id });
        }
        self.inner.update(master, expected_updated_at).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn all(&self) -> Result<Vec<MasterRecord>, StoreError> {
        self.inner.all().await
    }
}

#[tokio::test]
async fn transitive_group_produces_one_master_with_all_tags() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    write_fixture(
        root,
        SourceId::CrmLeads,
        json!([{"native_id": "a", "name": "Ana Souza", "phone": "11991524049",
                "created_at": "2026-01-01T09:00:00Z"}]),
    );
    write_fixture(
        root,
        SourceId::LandingPage,
        json!([{"native_id": "b", "name": "Ana S.", "email": "ana@x.com",
                "phone": "5511991524049", "created_at": "2026-01-02T09:00:00Z"}]),
    );
    write_fixture(
        root,
        SourceId::LegacyErp,
        json!([{"native_id": "c", "name": "ANA SOUZA", "email": "Ana@X.com",
                "created_at": "2020-06-01T09:00:00Z"}]),
    );

    let store = Arc::new(MemoryMasterStore::new());
    let loaders = loaders_for(
        root,
        &[SourceId::CrmLeads, SourceId::LandingPage, SourceId::LegacyErp],
    );
    let pipeline = ConsolidationPipeline::new(test_config(root), loaders, store.clone());
    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.records_loaded, 3);
    assert_eq!(summary.groups_formed, 1);
    assert_eq!(summary.masters_created, 1);

    let masters = store.all().await.unwrap();
    assert_eq!(masters.len(), 1);
    let master = &masters[0];
    assert_eq!(master.member_count, 3);
    assert_eq!(master.source_tags.len(), 3);
    assert_eq!(master.name.value.as_deref(), Some("Ana Souza"));
    assert_eq!(master.name.source, Some(SourceId::CrmLeads));
    assert_eq!(master.email.value.as_deref(), Some("ana@x.com"));
    assert_eq!(master.email.source, Some(SourceId::LandingPage));

    let reports = root.join("reports").join(summary.run_id.to_string());
    assert!(reports.join("run_summary.json").exists());
    assert!(reports.join("consolidation_brief.md").exists());
}

#[tokio::test]
async fn rerun_on_unchanged_snapshot_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    write_fixture(
        root,
        SourceId::CrmLeads,
        json!([
            {"native_id": "1", "name": "Ana", "phone": "11991524049",
             "created_at": "2026-01-01T09:00:00Z"},
            {"native_id": "2", "name": "Bruno", "email": "bruno@x.com",
             "created_at": "2026-01-03T09:00:00Z"}
        ]),
    );
    write_fixture(
        root,
        SourceId::MarketingExport,
        json!([{"native_id": "m9", "name": "Bruno Dias", "email": "BRUNO@x.com",
                "created_at": "2026-01-04T09:00:00Z"}]),
    );

    let store = Arc::new(MemoryMasterStore::new());
    let loaders = loaders_for(root, &[SourceId::CrmLeads, SourceId::MarketingExport]);
    let pipeline = ConsolidationPipeline::new(test_config(root), loaders, store.clone());

    let first = pipeline.run_once().await.unwrap();
    assert_eq!(first.masters_created, 2);
    let snapshot_one = store.all().await.unwrap();

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.masters_created, 0);
    assert_eq!(second.masters_updated, 0);
    assert_eq!(second.masters_unchanged, 2);
    let snapshot_two = store.all().await.unwrap();

    // Same ids, same fields, same tags, same timestamps.
    assert_eq!(snapshot_one, snapshot_two);
}

#[tokio::test]
async fn priority_upgrade_sticks_after_upstream_record_disappears() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let crm = json!([{"native_id": "1", "name": "Carla", "email": null,
                      "phone": "11991524049", "created_at": "2026-01-01T09:00:00Z"}]);
    let erp = json!([{"native_id": "77", "name": "CARLA", "email": "old@x.com",
                      "phone": "011991524049", "created_at": "2019-05-01T09:00:00Z"}]);
    write_fixture(root, SourceId::CrmLeads, crm.clone());
    write_fixture(root, SourceId::LegacyErp, erp.clone());
    write_fixture(root, SourceId::LandingPage, json!([]));

    let store = Arc::new(MemoryMasterStore::new());
    let sources = [SourceId::CrmLeads, SourceId::LandingPage, SourceId::LegacyErp];
    let pipeline =
        ConsolidationPipeline::new(test_config(root), loaders_for(root, &sources), store.clone());

    pipeline.run_once().await.unwrap();
    let master = &store.all().await.unwrap()[0];
    assert_eq!(master.email.value.as_deref(), Some("old@x.com"));
    assert_eq!(master.email.source, Some(SourceId::LegacyErp));

    // A landing-page capture shows up with a fresher address.
    write_fixture(
        root,
        SourceId::LandingPage,
        json!([{"native_id": "lp1", "name": "Carla M.", "email": "new@x.com",
                "phone": "5511991524049", "created_at": "2026-02-01T09:00:00Z"}]),
    );
    pipeline.run_once().await.unwrap();
    let master = &store.all().await.unwrap()[0];
    assert_eq!(master.email.value.as_deref(), Some("new@x.com"));
    assert_eq!(master.email.source, Some(SourceId::LandingPage));

    // The capture disappears upstream; the legacy value must not win back.
    write_fixture(root, SourceId::LandingPage, json!([]));
    pipeline.run_once().await.unwrap();
    let masters = store.all().await.unwrap();
    assert_eq!(masters.len(), 1);
    let master = &masters[0];
    assert_eq!(master.email.value.as_deref(), Some("new@x.com"));
    assert_eq!(master.email.source, Some(SourceId::LandingPage));
    // Tags are historical facts and never shrink.
    assert!(master.source_tags.contains(&SourceId::LandingPage));
}

#[tokio::test]
async fn bridging_record_consolidates_two_masters_into_one_survivor() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    write_fixture(
        root,
        SourceId::CrmLeads,
        json!([{"native_id": "1", "name": "Diego", "phone": "11988887777",
                "created_at": "2026-01-01T09:00:00Z"}]),
    );
    write_fixture(
        root,
        SourceId::LegacyErp,
        json!([{"native_id": "500", "name": "DIEGO R", "email": "diego@x.com",
                "created_at": "2018-01-01T09:00:00Z"}]),
    );
    write_fixture(root, SourceId::LandingPage, json!([]));

    let store = Arc::new(MemoryMasterStore::new());
    let sources = [SourceId::CrmLeads, SourceId::LandingPage, SourceId::LegacyErp];
    let pipeline =
        ConsolidationPipeline::new(test_config(root), loaders_for(root, &sources), store.clone());

    pipeline.run_once().await.unwrap();
    let masters = store.all().await.unwrap();
    assert_eq!(masters.len(), 2);
    let survivor_id = masters
        .iter()
        .min_by_key(|m| (m.created_at, m.id))
        .unwrap()
        .id;

    // New capture shares the phone of one master and the email of the other.
    write_fixture(
        root,
        SourceId::LandingPage,
        json!([{"native_id": "lp2", "name": "Diego Rocha", "email": "diego@x.com",
                "phone": "5511988887777", "created_at": "2026-02-10T09:00:00Z"}]),
    );
    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.masters_superseded, 1);

    let masters = store.all().await.unwrap();
    assert_eq!(masters.len(), 1);
    let master = &masters[0];
    assert_eq!(master.id, survivor_id);
    assert!(master.source_tags.contains(&SourceId::CrmLeads));
    assert!(master.source_tags.contains(&SourceId::LegacyErp));
    assert!(master.source_tags.contains(&SourceId::LandingPage));
    assert!(master.match_keys.contains("p:11988887777"));
    assert!(master.match_keys.contains("e:diego@x.com"));
}

#[tokio::test]
async fn one_unreachable_source_does_not_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    write_fixture(
        root,
        SourceId::CrmLeads,
        json!([{"native_id": "1", "name": "Eva", "email": "eva@x.com",
                "created_at": "2026-01-01T09:00:00Z"}]),
    );
    // legacy-erp gets no records.json at all.
    let store = Arc::new(MemoryMasterStore::new());
    let sources = [SourceId::CrmLeads, SourceId::LegacyErp];
    let pipeline =
        ConsolidationPipeline::new(test_config(root), loaders_for(root, &sources), store.clone());

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.errors.source_unavailable, 1);
    assert!(summary.sources["legacy-erp"].failed);
    assert!(!summary.sources["crm-leads"].failed);
    assert_eq!(summary.masters_created, 1);
}

#[tokio::test]
async fn all_sources_unreachable_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let store = Arc::new(MemoryMasterStore::new());
    let sources = [SourceId::CrmLeads, SourceId::LegacyErp];
    let pipeline =
        ConsolidationPipeline::new(test_config(root), loaders_for(root, &sources), store);

    let err = pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, PipelineError::NoSourceAvailable));
}

#[tokio::test]
async fn keyless_record_keeps_one_master_across_reruns() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    // No usable phone, and "null" counts as no email.
    write_fixture(
        root,
        SourceId::CrmLeads,
        json!([{"native_id": "9", "name": "Fabio", "email": "null", "phone": "123",
                "created_at": "2026-01-05T09:00:00Z"}]),
    );

    let store = Arc::new(MemoryMasterStore::new());
    let loaders = loaders_for(root, &[SourceId::CrmLeads]);
    let pipeline = ConsolidationPipeline::new(test_config(root), loaders, store.clone());

    let first = pipeline.run_once().await.unwrap();
    assert_eq!(first.masters_created, 1);
    assert_eq!(first.unmatchable_records, 1);
    let snapshot_one = store.all().await.unwrap();
    assert_eq!(snapshot_one.len(), 1);
    assert!(snapshot_one[0].match_keys.contains("u:crm-leads/9"));

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.masters_created, 0);
    assert_eq!(second.masters_unchanged, 1);
    let snapshot_two = store.all().await.unwrap();
    assert_eq!(snapshot_two.len(), 1);
    assert_eq!(snapshot_one, snapshot_two);
}

#[tokio::test]
async fn write_conflict_is_retried_and_the_update_lands() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    write_fixture(
        root,
        SourceId::CrmLeads,
        json!([{"native_id": "1", "name": "Gil", "phone": "11977776666",
                "created_at": "2026-01-01T09:00:00Z"}]),
    );

    let store = Arc::new(ContentiousStore::new());
    let loaders = loaders_for(root, &[SourceId::CrmLeads]);
    let pipeline = ConsolidationPipeline::new(test_config(root), loaders, store.clone());
    pipeline.run_once().await.unwrap();

    // The record gains an email upstream; the first write attempt loses the
    // race and must be retried against a re-read master.
    write_fixture(
        root,
        SourceId::CrmLeads,
        json!([{"native_id": "1", "name": "Gil", "email": "gil@x.com",
                "phone": "11977776666", "created_at": "2026-01-01T09:00:00Z"}]),
    );
    store.conflicts_left.store(1, Ordering::SeqCst);

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.errors.write_conflict, 1);
    assert_eq!(summary.masters_updated, 1);
    assert_eq!(summary.failed_groups, 0);

    let masters = store.all().await.unwrap();
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].email.value.as_deref(), Some("gil@x.com"));
}

#[tokio::test]
async fn exhausted_write_conflicts_count_the_group_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    write_fixture(
        root,
        SourceId::CrmLeads,
        json!([{"native_id": "1", "name": "Gil", "phone": "11977776666",
                "created_at": "2026-01-01T09:00:00Z"}]),
    );

    let store = Arc::new(ContentiousStore::new());
    let loaders = loaders_for(root, &[SourceId::CrmLeads]);
    let pipeline = ConsolidationPipeline::new(test_config(root), loaders, store.clone());
    pipeline.run_once().await.unwrap();
    let before = store.all().await.unwrap();

    write_fixture(
        root,
        SourceId::CrmLeads,
        json!([{"native_id": "1", "name": "Gil", "email": "gil@x.com",
                "phone": "11977776666", "created_at": "2026-01-01T09:00:00Z"}]),
    );
    store.conflicts_left.store(usize::MAX, Ordering::SeqCst);

    // Contention never clears: the run still succeeds, the group is reported
    // failed, and the stored master is untouched.
    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.failed_groups, 1);
    assert_eq!(summary.masters_updated, 0);
    // One conflict per attempt: the initial try plus max_retries retries.
    assert_eq!(
        summary.errors.write_conflict,
        test_config(root).backoff.max_retries + 1
    );
    assert_eq!(store.all().await.unwrap(), before);
}
