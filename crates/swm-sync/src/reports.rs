//! Run reports: `summary.json` plus a parquet snapshot of the viz table.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use swm_core::UnifiedVizRow;
use swm_storage::sha256_hex;
use tokio::fs;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `summary.json` and the viz snapshot under `run_dir`; returns the manifest path.
pub async fn write_run_report<S: Serialize>(
    run_dir: &Path,
    summary: &S,
    viz_rows: &[UnifiedVizRow],
) -> Result<std::path::PathBuf> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    let summary_path = run_dir.join("summary.json");
    fs::write(&summary_path, summary_json)
        .await
        .with_context(|| format!("writing {}", summary_path.display()))?;

    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let viz_path = snapshot_dir.join("viz.parquet");
    write_viz_parquet(&viz_path, viz_rows)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("viz", run_dir, &viz_path, viz_rows.len())?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn text_column<'a>(rows: &'a [UnifiedVizRow], get: impl Fn(&'a UnifiedVizRow) -> &'a str) -> StringArray {
    StringArray::from(rows.iter().map(|r| Some(get(r))).collect::<Vec<_>>())
}

fn write_viz_parquet(path: &Path, rows: &[UnifiedVizRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("Agency", DataType::Utf8, false),
        ArrowField::new("Sub_contractor", DataType::Utf8, false),
        ArrowField::new("Cluster", DataType::Utf8, false),
        ArrowField::new("Site", DataType::Utf8, false),
        ArrowField::new("Machines", DataType::Utf8, false),
        ArrowField::new("Total_capacity_per_day", DataType::Utf8, false),
        ArrowField::new("Total_waste_to_be_remediated", DataType::Utf8, false),
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("ticket_no", DataType::Utf8, false),
        ArrowField::new("net_weight_calculated", DataType::Float64, false),
        ArrowField::new("_source_company", DataType::Utf8, false),
    ]));

    let weights = Float64Array::from(rows.iter().map(|r| r.net_weight_calculated).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text_column(rows, |r| r.agency.as_str())),
            Arc::new(text_column(rows, |r| r.sub_contractor.as_str())),
            Arc::new(text_column(rows, |r| r.cluster.as_str())),
            Arc::new(text_column(rows, |r| r.site.as_str())),
            Arc::new(text_column(rows, |r| r.machines.as_str())),
            Arc::new(text_column(rows, |r| r.total_capacity_per_day.as_str())),
            Arc::new(text_column(rows, |r| r.total_waste_to_be_remediated.as_str())),
            Arc::new(text_column(rows, |r| r.date.as_str())),
            Arc::new(text_column(rows, |r| r.ticket_no.as_str())),
            Arc::new(weights),
            Arc::new(text_column(rows, |r| r.source_company.as_str())),
        ],
    )
    .context("building viz record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
