//! Sync pipeline orchestration: collect, normalize, append per-source tables,
//! rebuild the unified viz table and write run reports.

mod config;
mod merge;
mod reports;
mod table;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use swm_adapters::{
    read_object_records, CollectStats, HttpRecordSource, Normalizer, ObjectStoreSource, RecordSource,
};
use swm_core::{SiteDirectory, SiteMapping, UnifiedVizRow, WeighbridgeRecord};
use swm_storage::{GcsObjectStore, HttpClientConfig, HttpFetcher, LocalObjectStore, ObjectStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{SourceConfig, SourceKind, SourceRegistry, StoreConfig, SyncConfig};
pub use merge::{
    join_with_mapping, parse_mapping_csv, sort_viz_rows, viz_from_csv, viz_to_csv, JoinOutcome,
    MappingError, UnmatchedSite,
};
pub use reports::{write_run_report, ParquetManifest, ParquetManifestFile};
pub use table::{append, DedupStrategy, RecordTable};

pub const CRATE_NAME: &str = "swm-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no records collected from any of the {sources} enabled sources for {date}")]
    NoRecords { sources: usize, date: NaiveDate },
    #[error("site mapping table not found at {path}")]
    MappingMissing { path: String },
    #[error("site mapping table {path} is unusable: {source}")]
    MappingInvalid {
        path: String,
        #[source]
        source: MappingError,
    },
    #[error("no per-source tables found in the object store")]
    NoSourceTables,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("csv error in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of appending one batch to a per-source table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableUpdate {
    pub table_path: String,
    pub existing_rows: usize,
    pub new_rows: usize,
    pub duplicates_removed: usize,
    pub total_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VizSummary {
    pub viz_path: String,
    pub source_tables: usize,
    pub missing_tables: Vec<String>,
    pub combined_rows: usize,
    pub viz_rows: usize,
    pub dropped_rows: usize,
    pub unmatched_sites: Vec<UnmatchedSite>,
    /// `false` when the join produced nothing and the previous viz table was kept.
    pub written: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunSummary {
    pub source_id: String,
    pub company: String,
    pub raw_records: usize,
    pub stats: CollectStats,
    pub table: Option<TableUpdate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub target_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub raw_records: usize,
    pub failed_files: usize,
    pub failed_endpoints: usize,
    pub sources: Vec<SourceRunSummary>,
    pub viz: VizSummary,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

/// A bucket notification: one object created or replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEvent {
    #[serde(alias = "bucketId", default)]
    pub bucket: String,
    #[serde(alias = "objectId", default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    InvalidEvent,
    DifferentBucket,
    OutsideWatchPaths,
    NonJson,
    TempFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum ObjectRoute {
    Process { source_id: String, folder: String },
    Ignored { reason: IgnoreReason },
}

/// Decide whether a bucket event belongs to an enabled object-store source.
pub fn route_object_event(registry: &SourceRegistry, event: &ObjectEvent) -> ObjectRoute {
    let ignored = |reason| ObjectRoute::Ignored { reason };
    let name = event.name.as_str();
    if event.bucket.is_empty() || name.is_empty() {
        return ignored(IgnoreReason::InvalidEvent);
    }
    if event.bucket != registry.store.bucket() {
        return ignored(IgnoreReason::DifferentBucket);
    }
    let Some(source) = registry
        .enabled_sources()
        .find(|s| s.watch_prefixes().iter().any(|p| name.starts_with(p)))
    else {
        return ignored(IgnoreReason::OutsideWatchPaths);
    };
    if name.contains("/.tmp") || name.ends_with(".tmp") {
        return ignored(IgnoreReason::TempFile);
    }
    if !name.ends_with(".json") {
        return ignored(IgnoreReason::NonJson);
    }
    ObjectRoute::Process {
        source_id: source.source_id.clone(),
        folder: source.folder_for_object(name),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Ignored {
        reason: IgnoreReason,
    },
    Processed {
        source_id: String,
        records: usize,
        table: TableUpdate,
        viz: VizSummary,
    },
}

pub fn build_object_store(registry: &SourceRegistry, config: &SyncConfig) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match &registry.store {
        StoreConfig::Local { root, bucket } => {
            let root = if root.is_absolute() {
                root.clone()
            } else {
                config.workspace_root.join(root)
            };
            Arc::new(LocalObjectStore::new(bucket.clone(), root))
        }
        StoreConfig::Gcs { bucket, api_base } => {
            let mut store = GcsObjectStore::new(
                bucket.clone(),
                config.gcs_access_token.clone(),
                Duration::from_secs(config.http_timeout_secs),
            )?;
            if let Some(base) = api_base {
                store = store.with_api_base(base.clone());
            }
            Arc::new(store)
        }
    };
    Ok(store)
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    store: Arc<dyn ObjectStore>,
    http: Arc<HttpFetcher>,
    directory: SiteDirectory,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_path())?;
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: SyncConfig, registry: SourceRegistry) -> Result<Self> {
        let store = build_object_store(&registry, &config)?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let directory = registry.site_directory();
        Ok(Self {
            config,
            registry,
            store,
            http: Arc::new(http),
            directory,
            run_lock: Mutex::new(()),
        })
    }

    /// Replace the object store built from the registry.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = store;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    /// Fresh per run so `_processed_timestamp` reflects the run.
    fn normalizer(&self) -> Normalizer {
        Normalizer::new(self.directory.clone())
    }

    fn record_source(&self, source: &SourceConfig) -> Box<dyn RecordSource> {
        match &source.kind {
            SourceKind::ObjectStore {
                base_folders,
                include_undated_backups,
                ..
            } => Box::new(ObjectStoreSource::new(
                source.source_id.clone(),
                Arc::clone(&self.store),
                base_folders.clone(),
                *include_undated_backups,
            )),
            SourceKind::Http {
                endpoints,
                agency_override,
                folder_source,
            } => Box::new(HttpRecordSource::new(
                source.source_id.clone(),
                Arc::clone(&self.http),
                endpoints.clone(),
                folder_source.clone(),
                agency_override.clone(),
            )),
        }
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_for_date(self.config.effective_target_date()).await
    }

    pub async fn run_for_date(&self, target_date: NaiveDate) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let enabled = self.registry.enabled_sources().collect::<Vec<_>>();
        info!(%run_id, %target_date, sources = enabled.len(), "sync run starting");

        let mut batches = Vec::with_capacity(enabled.len());
        for source in &enabled {
            let span = info_span!("collect_source", source_id = %source.source_id);
            let batch = self.record_source(source).collect(target_date).instrument(span).await;
            batches.push((*source, batch));
        }

        let raw_records = batches.iter().map(|(_, b)| b.records.len()).sum::<usize>();
        if raw_records == 0 {
            error!(%target_date, "no records from any source; leaving tables untouched");
            return Err(SyncError::NoRecords {
                sources: enabled.len(),
                date: target_date,
            }
            .into());
        }

        let normalizer = self.normalizer();
        let mut sources = Vec::with_capacity(batches.len());
        for (source, batch) in batches {
            let records = batch
                .records
                .iter()
                .map(|raw| normalizer.normalize_raw(raw))
                .collect::<Vec<_>>();
            let table = if records.is_empty() {
                None
            } else {
                Some(self.append_to_table(source, records).await?)
            };
            sources.push(SourceRunSummary {
                source_id: source.source_id.clone(),
                company: source.company.clone(),
                raw_records: batch.records.len(),
                stats: batch.stats,
                table,
            });
        }

        let (viz, viz_rows) = self.rebuild_viz_rows().await?;
        let finished_at = Utc::now();

        let run_dir = self.reports_root().join(run_id.to_string());
        let summary = SyncRunSummary {
            run_id,
            target_date,
            started_at,
            finished_at,
            enabled_sources: enabled.len(),
            raw_records,
            failed_files: sources.iter().map(|s| s.stats.failed_files).sum(),
            failed_endpoints: sources.iter().map(|s| s.stats.failed_endpoints).sum(),
            sources,
            viz,
            reports_dir: run_dir.display().to_string(),
            parquet_manifest: run_dir.join("snapshots").join("manifest.json").display().to_string(),
        };
        write_run_report(&run_dir, &summary, &viz_rows).await?;

        info!(
            %run_id,
            raw_records,
            viz_rows = summary.viz.viz_rows,
            failed_files = summary.failed_files,
            failed_endpoints = summary.failed_endpoints,
            "sync run complete"
        );
        Ok(summary)
    }

    fn reports_root(&self) -> PathBuf {
        let dir = &self.registry.reports_dir;
        if dir.is_absolute() {
            dir.clone()
        } else {
            self.config.workspace_root.join(dir)
        }
    }

    async fn read_table(&self, source: &SourceConfig) -> Result<Option<RecordTable>> {
        let bytes = match self.store.read(&source.table_path).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(SyncError::Store(err).into()),
        };
        let mut table = RecordTable::from_csv(&bytes).map_err(|source_err| SyncError::Csv {
            path: source.table_path.clone(),
            source: source_err,
        })?;
        table.fill_source_company(&source.company);
        Ok(Some(table))
    }

    /// Append normalized records to the source's CSV table, deduplicating.
    pub async fn append_to_table(
        &self,
        source: &SourceConfig,
        mut records: Vec<WeighbridgeRecord>,
    ) -> Result<TableUpdate> {
        for record in &mut records {
            record.source_company = source.company.clone();
        }
        let existing = self.read_table(source).await?.unwrap_or_default();
        let existing_rows = existing.len();
        let new_rows = records.len();

        let (merged, duplicates_removed) = append(existing, records, source.dedup);
        if duplicates_removed > 0 {
            info!(source_id = %source.source_id, duplicates_removed, "removed duplicate records");
        }

        let bytes = merged.to_csv().map_err(|err| SyncError::Csv {
            path: source.table_path.clone(),
            source: err,
        })?;
        self.store
            .write(&source.table_path, &bytes, "text/csv")
            .await
            .map_err(SyncError::Store)
            .with_context(|| format!("writing {}", source.table_path))?;

        info!(
            source_id = %source.source_id,
            table = %source.table_path,
            existing_rows,
            new_rows,
            total_rows = merged.len(),
            "source table updated"
        );
        Ok(TableUpdate {
            table_path: source.table_path.clone(),
            existing_rows,
            new_rows,
            duplicates_removed,
            total_rows: merged.len(),
        })
    }

    /// Concatenate every stored per-source table.
    pub async fn combined_records(&self) -> Result<(RecordTable, Vec<String>, usize)> {
        let mut combined = RecordTable::new();
        let mut missing = Vec::new();
        let mut found = 0usize;
        for source in &self.registry.sources {
            match self.read_table(source).await? {
                Some(table) => {
                    found += 1;
                    combined.concat(table);
                }
                None => {
                    warn!(source_id = %source.source_id, table = %source.table_path, "source table not found");
                    missing.push(source.source_id.clone());
                }
            }
        }
        Ok((combined, missing, found))
    }

    async fn load_mapping(&self) -> Result<Vec<SiteMapping>> {
        let path = &self.registry.mapping_path;
        let bytes = match self.store.read(path).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => {
                return Err(SyncError::MappingMissing { path: path.clone() }.into())
            }
            Err(err) => return Err(SyncError::Store(err).into()),
        };
        let mappings = parse_mapping_csv(&bytes).map_err(|source| SyncError::MappingInvalid {
            path: path.clone(),
            source,
        })?;
        info!(path = %path, rows = mappings.len(), "loaded site mapping");
        Ok(mappings)
    }

    pub async fn rebuild_viz(&self) -> Result<VizSummary> {
        Ok(self.rebuild_viz_rows().await?.0)
    }

    async fn rebuild_viz_rows(&self) -> Result<(VizSummary, Vec<UnifiedVizRow>)> {
        let mappings = self.load_mapping().await?;
        let (combined, missing_tables, source_tables) = self.combined_records().await?;
        if source_tables == 0 {
            return Err(SyncError::NoSourceTables.into());
        }

        let outcome = join_with_mapping(combined.rows(), &mappings);
        for unmatched in &outcome.unmatched_sites {
            warn!(
                site = %unmatched.site,
                rows = unmatched.rows,
                closest = unmatched.closest_known.as_deref().unwrap_or("-"),
                "site has no mapping row; dropped from viz"
            );
        }

        let viz_path = self.registry.viz_path.clone();
        let written = if outcome.rows.is_empty() {
            warn!(combined = outcome.combined_rows, "no records matched the site mapping; viz table left as is");
            false
        } else {
            let bytes = viz_to_csv(&outcome.rows).map_err(|err| SyncError::Csv {
                path: viz_path.clone(),
                source: err,
            })?;
            self.store
                .write(&viz_path, &bytes, "text/csv")
                .await
                .map_err(SyncError::Store)
                .with_context(|| format!("writing {viz_path}"))?;
            true
        };

        let mut per_company: BTreeMap<&str, usize> = BTreeMap::new();
        for row in &outcome.rows {
            *per_company.entry(row.source_company.as_str()).or_default() += 1;
        }
        info!(
            viz_rows = outcome.rows.len(),
            dropped = outcome.dropped_rows,
            companies = ?per_company,
            "viz table rebuilt"
        );

        let summary = VizSummary {
            viz_path,
            source_tables,
            missing_tables,
            combined_rows: outcome.combined_rows,
            viz_rows: outcome.rows.len(),
            dropped_rows: outcome.dropped_rows,
            unmatched_sites: outcome.unmatched_sites,
            written,
        };
        Ok((summary, outcome.rows))
    }

    /// Process one newly written backup object: append it to its source table
    /// and rebuild the viz table.
    pub async fn ingest_object(&self, event: &ObjectEvent) -> Result<IngestOutcome> {
        let _guard = self.run_lock.lock().await;
        let (source_id, folder) = match route_object_event(&self.registry, event) {
            ObjectRoute::Ignored { reason } => {
                info!(object = %event.name, ?reason, "object event ignored");
                return Ok(IngestOutcome::Ignored { reason });
            }
            ObjectRoute::Process { source_id, folder } => (source_id, folder),
        };
        let source = self
            .registry
            .source(&source_id)
            .ok_or_else(|| SyncError::Config(format!("unknown source {source_id}")))?;

        let raw = read_object_records(self.store.as_ref(), &event.name, &folder)
            .await
            .with_context(|| format!("reading {}", event.name))?;
        let normalizer = self.normalizer();
        let records = raw.iter().map(|r| normalizer.normalize_raw(r)).collect::<Vec<_>>();
        if records.is_empty() {
            warn!(object = %event.name, "object held no records");
        }
        let count = records.len();
        let table = self.append_to_table(source, records).await?;
        let viz = self.rebuild_viz().await?;
        Ok(IngestOutcome::Processed {
            source_id,
            records: count,
            table,
            viz,
        })
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync complete"),
                    Err(err) => error!("scheduled sync failed: {err:#}"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}
