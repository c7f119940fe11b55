use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use swm_core::SiteDirectory;

use crate::table::DedupStrategy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    Local {
        root: PathBuf,
        #[serde(default = "default_bucket")]
        bucket: String,
    },
    Gcs {
        bucket: String,
        #[serde(default)]
        api_base: Option<String>,
    },
}

impl StoreConfig {
    pub fn bucket(&self) -> &str {
        match self {
            Self::Local { bucket, .. } | Self::Gcs { bucket, .. } => bucket,
        }
    }
}

fn default_bucket() -> String {
    "advitia-weighbridge-data".to_string()
}

fn default_mapping_path() -> String {
    "csv_outputs/data/mapping.csv".to_string()
}

fn default_viz_path() -> String {
    "csv_outputs/data/viz.csv".to_string()
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_true() -> bool {
    true
}

fn default_folder_source() -> String {
    "zigmaglobal_api".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    ObjectStore {
        base_folders: Vec<String>,
        #[serde(default)]
        include_undated_backups: bool,
        /// Object-name prefixes routed to this source; defaults to the base folders.
        #[serde(default)]
        watch_prefixes: Vec<String>,
    },
    Http {
        endpoints: Vec<String>,
        #[serde(default)]
        agency_override: Option<String>,
        #[serde(default = "default_folder_source")]
        folder_source: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub company: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Object name of this source's CSV table.
    pub table_path: String,
    #[serde(default)]
    pub dedup: DedupStrategy,
    #[serde(flatten)]
    pub kind: SourceKind,
}

impl SourceConfig {
    pub fn watch_prefixes(&self) -> Vec<&str> {
        match &self.kind {
            SourceKind::ObjectStore {
                base_folders,
                watch_prefixes,
                ..
            } if watch_prefixes.is_empty() => base_folders.iter().map(String::as_str).collect(),
            SourceKind::ObjectStore { watch_prefixes, .. } => {
                watch_prefixes.iter().map(String::as_str).collect()
            }
            SourceKind::Http { .. } => Vec::new(),
        }
    }

    /// Base folder an object belongs to, used as its `_folder_source`.
    pub fn folder_for_object(&self, name: &str) -> String {
        if let SourceKind::ObjectStore { base_folders, .. } = &self.kind {
            let rest = name.strip_prefix("Default_Agency/").unwrap_or(name);
            if let Some(folder) = base_folders
                .iter()
                .find(|f| rest.starts_with(&format!("{f}/")))
            {
                return folder.clone();
            }
        }
        name.split('/').next().unwrap_or(name).to_string()
    }
}

/// Contents of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub store: StoreConfig,
    #[serde(default = "default_mapping_path")]
    pub mapping_path: String,
    #[serde(default = "default_viz_path")]
    pub viz_path: String,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default)]
    pub site_renames: BTreeMap<String, String>,
    #[serde(default)]
    pub site_clusters: BTreeMap<String, String>,
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                anyhow::bail!(crate::SyncError::Config(format!(
                    "duplicate source_id {}",
                    source.source_id
                )));
            }
            if source.table_path.trim().is_empty() {
                anyhow::bail!(crate::SyncError::Config(format!(
                    "source {} has an empty table_path",
                    source.source_id
                )));
            }
        }
        Ok(())
    }

    pub fn site_directory(&self) -> SiteDirectory {
        SiteDirectory::standard().with_overrides(&self.site_renames, &self.site_clusters)
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub sources_file: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub target_date: Option<NaiveDate>,
    pub gcs_access_token: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            sources_file: PathBuf::from("sources.yaml"),
            http_timeout_secs: 15,
            user_agent: "swm-sync/0.1".to_string(),
            scheduler_enabled: false,
            sync_cron: "0 30 1 * * *".to_string(),
            target_date: None,
            gcs_access_token: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workspace_root = std::env::var("SWM_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_root);
        Self {
            sources_file: std::env::var("SWM_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            http_timeout_secs: std::env::var("SWM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("SWM_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: std::env::var("SWM_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SWM_SYNC_CRON").unwrap_or(defaults.sync_cron),
            target_date: std::env::var("SWM_TARGET_DATE")
                .ok()
                .and_then(|v| NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok()),
            gcs_access_token: std::env::var("GCS_ACCESS_TOKEN").ok().filter(|t| !t.is_empty()),
            workspace_root,
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        if self.sources_file.is_absolute() {
            self.sources_file.clone()
        } else {
            self.workspace_root.join(&self.sources_file)
        }
    }

    /// Explicit target date, else yesterday in local time.
    pub fn effective_target_date(&self) -> NaiveDate {
        self.target_date
            .unwrap_or_else(|| Local::now().date_naive() - ChronoDuration::days(1))
    }
}
