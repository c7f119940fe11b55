use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use swm_core::{UnifiedVizRow, WeighbridgeRecord};
use swm_storage::StoreError;
use swm_sync::{viz_from_csv, SyncPipeline};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub viz_rows: usize,
    pub record_rows: usize,
}

/// In-memory copy of the viz table and the combined per-source tables.
///
/// Nothing is read until [`DashboardStore::load`] or [`DashboardStore::refresh`]
/// is called, and every instance owns its own rows.
pub struct DashboardStore {
    pipeline: Option<Arc<SyncPipeline>>,
    viz: Vec<UnifiedVizRow>,
    records: Vec<WeighbridgeRecord>,
    loaded_at: Option<DateTime<Utc>>,
}

impl DashboardStore {
    /// Empty store backed by the pipeline's object store and registry.
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            pipeline: Some(pipeline),
            viz: Vec::new(),
            records: Vec::new(),
            loaded_at: None,
        }
    }

    /// Fixed rows with no backing store; `refresh` keeps them as they are.
    pub fn from_rows(viz: Vec<UnifiedVizRow>, records: Vec<WeighbridgeRecord>) -> Self {
        Self {
            pipeline: None,
            viz,
            records,
            loaded_at: Some(Utc::now()),
        }
    }

    pub async fn load(pipeline: Arc<SyncPipeline>) -> Result<Self> {
        let mut store = Self::new(pipeline);
        store.refresh().await?;
        Ok(store)
    }

    pub fn pipeline(&self) -> Option<Arc<SyncPipeline>> {
        self.pipeline.clone()
    }

    pub async fn refresh(&mut self) -> Result<StoreCounts> {
        let Some(pipeline) = self.pipeline.clone() else {
            return Ok(self.counts());
        };
        *self = Self::fetch(pipeline).await?;
        Ok(self.counts())
    }

    async fn fetch(pipeline: Arc<SyncPipeline>) -> Result<Self> {
        let viz_path = pipeline.registry().viz_path.clone();
        let viz = match pipeline.store().read(&viz_path).await {
            Ok(bytes) => viz_from_csv(&bytes).with_context(|| format!("parsing {viz_path}"))?,
            Err(StoreError::NotFound(_)) => {
                warn!(path = %viz_path, "viz table not found; dashboard starts empty");
                Vec::new()
            }
            Err(err) => return Err(err).with_context(|| format!("reading {viz_path}")),
        };
        let (combined, missing, _) = pipeline.combined_records().await?;

        let store = Self {
            pipeline: Some(pipeline),
            viz,
            records: combined.into_rows(),
            loaded_at: Some(Utc::now()),
        };
        info!(
            viz_rows = store.viz.len(),
            record_rows = store.records.len(),
            missing_tables = missing.len(),
            "dashboard store refreshed"
        );
        Ok(store)
    }

    pub fn viz(&self) -> &[UnifiedVizRow] {
        &self.viz
    }

    pub fn records(&self) -> &[WeighbridgeRecord] {
        &self.records
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            viz_rows: self.viz.len(),
            record_rows: self.records.len(),
        }
    }
}
