//! Source collectors + the schema normalizer that maps raw payloads onto
//! [`WeighbridgeRecord`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use swm_core::{is_canonical_column, SiteDirectory, WeighbridgeRecord};
use swm_storage::{HttpFetcher, ObjectStore};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "swm-adapters";

pub type JsonObject = Map<String, JsonValue>;

/// Ordered alias lists; the first key present in the payload wins.
pub const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("date", &["date", "Date"]),
    ("time", &["time", "Time"]),
    ("site_name", &["site_name", "Site", "site"]),
    ("agency_name", &["agency_name", "Agency", "agency"]),
    ("material", &["material", "Material", "Material Name"]),
    ("ticket_no", &["ticket_no", "Ticket No", "ticket_number"]),
    ("vehicle_no", &["vehicle_no", "Vehicle No", "vehicle_number"]),
    ("transfer_party_name", &["transfer_party_name", "Transfer Party"]),
    ("first_weight", &["first_weight", "Loaded Weight", "loaded_weight"]),
    ("first_timestamp", &["first_timestamp", "Load Weight Time"]),
    ("second_weight", &["second_weight", "Empty Weight", "empty_weight"]),
    ("second_timestamp", &["second_timestamp", "Empty Weight Time"]),
    ("net_weight", &["net_weight", "Net Weight"]),
    (
        "material_type",
        &["material_type", "Material Type", "material", "Material Name"],
    ),
    ("first_front_image", &["first_front_image", "First Front Image"]),
    ("first_back_image", &["first_back_image", "First Back Image"]),
    ("second_front_image", &["second_front_image", "Second Front Image"]),
    ("second_back_image", &["second_back_image", "Second Back Image"]),
    ("site_incharge", &["site_incharge", "Site Incharge"]),
    ("user_name", &["user_name", "User Name"]),
    ("cloud_upload_timestamp", &["cloud_upload_timestamp", "Upload Time"]),
    ("record_status", &["record_status", "Status"]),
    (
        "net_weight_calculated",
        &["net_weight_calculated", "Calculated Weight"],
    ),
];

fn is_alias_key(key: &str) -> bool {
    FIELD_ALIASES
        .iter()
        .any(|(_, aliases)| aliases.contains(&key))
}

fn lookup_alias<'a>(raw: &'a JsonObject, column: &str) -> Option<&'a JsonValue> {
    let (_, aliases) = FIELD_ALIASES.iter().find(|(c, _)| *c == column)?;
    aliases.iter().find_map(|alias| raw.get(*alias))
}

/// Text form of a loosely-typed JSON value, trimmed; `null` becomes `""`.
pub fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
enum DateLayout {
    YearFirst(char),
    DayFirst(char),
    Compact,
}

const DATE_LAYOUTS: [DateLayout; 7] = [
    DateLayout::YearFirst('-'),
    DateLayout::DayFirst('-'),
    DateLayout::YearFirst('/'),
    DateLayout::DayFirst('/'),
    DateLayout::Compact,
    DateLayout::DayFirst('.'),
    DateLayout::YearFirst('.'),
];

fn digits(part: &str, min: usize, max: usize) -> Option<u32> {
    if part.len() < min || part.len() > max || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    let year = digits(year, 4, 4)?;
    let month = digits(month, 1, 2)?;
    let day = digits(day, 1, 2)?;
    if year == 0 {
        return None;
    }
    NaiveDate::from_ymd_opt(year as i32, month, day)
}

impl DateLayout {
    fn parse(self, text: &str) -> Option<NaiveDate> {
        match self {
            Self::Compact => {
                if text.len() != 8 {
                    return None;
                }
                ymd(text.get(0..4)?, text.get(4..6)?, text.get(6..8)?)
            }
            Self::YearFirst(sep) | Self::DayFirst(sep) => {
                let parts = text.split(sep).collect::<Vec<_>>();
                let [a, b, c] = parts.as_slice() else {
                    return None;
                };
                match self {
                    Self::YearFirst(_) => ymd(a, b, c),
                    _ => ymd(c, b, a),
                }
            }
        }
    }
}

/// Parse a loosely formatted date into a calendar date.
///
/// Text after the first space is discarded and only digits plus `-`, `/`, `.`
/// survive. The seven supported layouts are tried in a fixed order, then the
/// first run of eight digits is read as `YYYYMMDD`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if matches!(trimmed.to_ascii_lowercase().as_str(), "" | "nan" | "none" | "null") {
        return None;
    }
    let head = trimmed.split(' ').next().unwrap_or(trimmed);
    let cleaned = head
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '-' | '/' | '.'))
        .collect::<String>();

    if let Some(date) = DATE_LAYOUTS.iter().find_map(|layout| layout.parse(&cleaned)) {
        return Some(date);
    }

    let bytes = cleaned.as_bytes();
    let mut run_start = None;
    for (idx, b) in bytes.iter().enumerate() {
        if b.is_ascii_digit() {
            let start = *run_start.get_or_insert(idx);
            if idx + 1 - start == 8 {
                return DateLayout::Compact.parse(&cleaned[start..=idx]);
            }
        } else {
            run_start = None;
        }
    }
    None
}

/// Canonical `YYYY-MM-DD` text, or `""` when the input is not a date.
pub fn normalize_date(raw: &str) -> String {
    parse_date(raw)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Maps raw payload objects onto the canonical schema.
#[derive(Debug, Clone)]
pub struct Normalizer {
    directory: SiteDirectory,
    processed_at: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(SiteDirectory::standard())
    }
}

impl Normalizer {
    pub fn new(directory: SiteDirectory) -> Self {
        Self {
            directory,
            processed_at: Utc::now().to_rfc3339(),
        }
    }

    /// Fix the `_processed_timestamp` stamped on every record.
    pub fn with_processed_at(mut self, processed_at: impl Into<String>) -> Self {
        self.processed_at = processed_at.into();
        self
    }

    pub fn directory(&self) -> &SiteDirectory {
        &self.directory
    }

    pub fn normalize(&self, raw: &JsonObject, source_file: &str, folder_source: &str) -> WeighbridgeRecord {
        let mut record = WeighbridgeRecord::default();

        for (column, _) in FIELD_ALIASES {
            let Some(value) = lookup_alias(raw, column) else {
                continue;
            };
            let text = value_text(value);
            if !record.set_cell(column, &text) {
                warn!(
                    field = *column,
                    raw = %text,
                    source_file,
                    "unparseable weight, using 0"
                );
            }
        }

        record.date = normalize_date(&record.date);
        record.site_name = self.directory.canonical_site(&record.site_name);
        record.cluster = self.directory.cluster_for(&record.site_name).to_string();

        if lookup_alias(raw, "net_weight_calculated").is_none() {
            record.net_weight_calculated = recompute_net_weight(&record);
        }

        for (key, value) in raw {
            if key.starts_with('_') || is_alias_key(key) || is_canonical_column(key) {
                continue;
            }
            record.extra.insert(key.clone(), value_text(value));
        }

        record.source_file = source_file.to_string();
        record.processed_timestamp = self.processed_at.clone();
        record.folder_source = folder_source.to_string();
        record
    }

    pub fn normalize_raw(&self, raw: &RawRecord) -> WeighbridgeRecord {
        let mut record = self.normalize(&raw.payload, &raw.source_file, &raw.folder_source);
        if let Some(agency) = &raw.agency_override {
            record.agency_name = agency.clone();
        }
        record
    }
}

fn recompute_net_weight(record: &WeighbridgeRecord) -> f64 {
    let (first, second) = (record.first_weight, record.second_weight);
    if first > 0.0 && second > 0.0 && first >= second {
        first - second
    } else {
        record.net_weight
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized payload structure: {0}")]
    Unrecognized(&'static str),
}

/// A decoded file or response body: one record or many.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonPayload {
    SingleRecord(JsonObject),
    RecordArray(Vec<JsonObject>),
}

impl JsonPayload {
    /// Object-store files hold a single object or an array of objects.
    pub fn from_file_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        match serde_json::from_slice::<JsonValue>(bytes)? {
            JsonValue::Object(obj) => Ok(Self::SingleRecord(obj)),
            JsonValue::Array(items) => Ok(Self::RecordArray(objects_only(items))),
            _ => Err(PayloadError::Unrecognized("expected object or array")),
        }
    }

    /// HTTP bodies hold an array, or an object whose first array-valued field is the records.
    pub fn from_response_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        match serde_json::from_slice::<JsonValue>(bytes)? {
            JsonValue::Array(items) => Ok(Self::RecordArray(objects_only(items))),
            JsonValue::Object(obj) => obj
                .into_iter()
                .find_map(|(_, v)| match v {
                    JsonValue::Array(items) => Some(Self::RecordArray(objects_only(items))),
                    _ => None,
                })
                .ok_or(PayloadError::Unrecognized("object without an array field")),
            _ => Err(PayloadError::Unrecognized("expected array or object")),
        }
    }

    pub fn into_records(self) -> Vec<JsonObject> {
        match self {
            Self::SingleRecord(obj) => vec![obj],
            Self::RecordArray(items) => items,
        }
    }
}

fn objects_only(items: Vec<JsonValue>) -> Vec<JsonObject> {
    let total = items.len();
    let objects = items
        .into_iter()
        .filter_map(|item| match item {
            JsonValue::Object(obj) => Some(obj),
            _ => None,
        })
        .collect::<Vec<_>>();
    if objects.len() < total {
        debug!(skipped = total - objects.len(), "ignoring non-object array entries");
    }
    objects
}

/// Raw payload object tagged with its lineage.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub payload: JsonObject,
    pub source_file: String,
    pub folder_source: String,
    pub agency_override: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectStats {
    pub files_read: usize,
    pub failed_files: usize,
    pub endpoints_polled: usize,
    pub failed_endpoints: usize,
    pub folders_without_backups: Vec<String>,
    pub skipped_other_dates: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub records: Vec<RawRecord>,
    pub stats: CollectStats,
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Gather raw records for `target_date`. Unit failures are logged and counted, never returned.
    async fn collect(&self, target_date: NaiveDate) -> SourceBatch;
}

/// Candidate backup prefixes for one base folder, in the order they are tried.
///
/// The flag marks the undated `{folder}/json_backups/` prefix whose records
/// are filtered by date after reading.
pub fn candidate_prefixes(folder: &str, date: &str, include_undated: bool) -> Vec<(String, bool)> {
    let mut prefixes = vec![
        (format!("{folder}/json_backups/{date}/"), false),
        (format!("{folder}/{date}/json_backups/"), false),
        (format!("Default_Agency/{folder}/{date}/json_backups/"), false),
        (format!("{folder}/{date}/json_backups/{folder}/"), false),
    ];
    if include_undated {
        prefixes.push((format!("{folder}/json_backups/"), true));
    }
    prefixes
}

const DATE_FIELDS: [&str; 5] = ["date", "Date", "record_date", "timestamp", "created_date"];
const TIMESTAMP_FIELDS: [&str; 3] = ["cloud_upload_timestamp", "first_timestamp", "second_timestamp"];

/// Whether any date-bearing field of a raw payload falls on `target`.
pub fn is_target_date_record(raw: &JsonObject, target: NaiveDate) -> bool {
    let direct = DATE_FIELDS
        .iter()
        .filter_map(|f| raw.get(*f))
        .any(|v| parse_date(&value_text(v)) == Some(target));
    direct
        || TIMESTAMP_FIELDS
            .iter()
            .filter_map(|f| raw.get(*f))
            .map(value_text)
            .filter_map(|text| text.split_once(' ').map(|(day, _)| day.to_string()))
            .any(|day| parse_date(&day) == Some(target))
}

/// Read and decode one backup object into raw records.
pub async fn read_object_records(
    store: &dyn ObjectStore,
    name: &str,
    folder_source: &str,
) -> anyhow::Result<Vec<RawRecord>> {
    let bytes = store.read(name).await?;
    let payload = JsonPayload::from_file_bytes(&bytes)?;
    Ok(payload
        .into_records()
        .into_iter()
        .map(|payload| RawRecord {
            payload,
            source_file: name.to_string(),
            folder_source: folder_source.to_string(),
            agency_override: None,
        })
        .collect())
}

/// Crawls dated JSON backup folders in an object store.
pub struct ObjectStoreSource {
    source_id: String,
    store: Arc<dyn ObjectStore>,
    base_folders: Vec<String>,
    include_undated_backups: bool,
}

impl ObjectStoreSource {
    pub fn new(
        source_id: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        base_folders: Vec<String>,
        include_undated_backups: bool,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            store,
            base_folders,
            include_undated_backups,
        }
    }

    /// Object names to read for one folder; `true` means date filtering applies.
    async fn discover(&self, folder: &str, date: &str) -> BTreeMap<String, bool> {
        let mut found: BTreeMap<String, bool> = BTreeMap::new();
        for (prefix, undated) in candidate_prefixes(folder, date, self.include_undated_backups) {
            match self.store.list(&prefix, Some(5)).await {
                Ok(sample) if !sample.is_empty() => {
                    info!(prefix = %prefix, "backup prefix found");
                }
                Ok(_) => {
                    debug!(prefix = %prefix, "backup prefix empty");
                    continue;
                }
                Err(err) => {
                    debug!(prefix = %prefix, "listing backup prefix failed: {err}");
                    continue;
                }
            }

            let objects = match self.store.list(&prefix, None).await {
                Ok(objects) => objects,
                Err(err) => {
                    warn!(prefix = %prefix, "listing backup prefix failed: {err}");
                    continue;
                }
            };
            for meta in objects
                .into_iter()
                .filter(|m| m.name.ends_with(".json") && m.size > 0)
            {
                let needs_filter = found.entry(meta.name).or_insert(undated);
                *needs_filter &= undated;
            }
        }
        found
    }

    async fn collect_folder(&self, folder: &str, target_date: NaiveDate, batch: &mut SourceBatch) {
        let date = target_date.format("%Y-%m-%d").to_string();
        let objects = self.discover(folder, &date).await;
        if objects.is_empty() {
            warn!(folder, date = %date, "no json_backups folders found");
            batch.stats.folders_without_backups.push(folder.to_string());
            return;
        }

        for (name, filter_by_date) in objects {
            match read_object_records(self.store.as_ref(), &name, folder).await {
                Ok(records) => {
                    batch.stats.files_read += 1;
                    for record in records {
                        if filter_by_date && !is_target_date_record(&record.payload, target_date) {
                            batch.stats.skipped_other_dates += 1;
                            continue;
                        }
                        batch.records.push(record);
                    }
                }
                Err(err) => {
                    warn!(object = %name, "failed to process backup file: {err:#}");
                    batch.stats.failed_files += 1;
                }
            }
        }
    }
}

#[async_trait]
impl RecordSource for ObjectStoreSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn collect(&self, target_date: NaiveDate) -> SourceBatch {
        let mut batch = SourceBatch::default();
        for folder in &self.base_folders {
            let span = info_span!("crawl_folder", source_id = %self.source_id, folder = %folder);
            self.collect_folder(folder, target_date, &mut batch)
                .instrument(span)
                .await;
        }
        info!(
            source_id = %self.source_id,
            records = batch.records.len(),
            files = batch.stats.files_read,
            failed = batch.stats.failed_files,
            "object store crawl complete"
        );
        batch
    }
}

/// Fill `{from_date}`/`{to_date}` in an endpoint template.
pub fn render_endpoint(template: &str, from: NaiveDate, to: NaiveDate) -> String {
    template
        .replace("{from_date}", &from.format("%Y-%m-%d").to_string())
        .replace("{to_date}", &to.format("%Y-%m-%d").to_string())
}

/// Polls per-site REST endpoints for one day of records.
pub struct HttpRecordSource {
    source_id: String,
    http: Arc<HttpFetcher>,
    endpoints: Vec<String>,
    folder_source: String,
    agency_override: Option<String>,
}

impl HttpRecordSource {
    pub fn new(
        source_id: impl Into<String>,
        http: Arc<HttpFetcher>,
        endpoints: Vec<String>,
        folder_source: impl Into<String>,
        agency_override: Option<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            http,
            endpoints,
            folder_source: folder_source.into(),
            agency_override,
        }
    }

    async fn fetch_endpoint(&self, url: &str) -> Result<Vec<JsonObject>, anyhow::Error> {
        let resp = self.http.fetch_bytes(&self.source_id, url).await?;
        Ok(JsonPayload::from_response_bytes(&resp.body)?.into_records())
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn collect(&self, target_date: NaiveDate) -> SourceBatch {
        let mut batch = SourceBatch::default();
        for template in &self.endpoints {
            let url = render_endpoint(template, target_date, target_date);
            batch.stats.endpoints_polled += 1;
            match self.fetch_endpoint(&url).await {
                Ok(records) => {
                    debug!(url = %url, count = records.len(), "endpoint fetched");
                    batch.records.extend(records.into_iter().map(|payload| RawRecord {
                        payload,
                        source_file: url.clone(),
                        folder_source: self.folder_source.clone(),
                        agency_override: self.agency_override.clone(),
                    }));
                }
                Err(err) => {
                    warn!(url = %url, "endpoint failed, treating as empty: {err:#}");
                    batch.stats.failed_endpoints += 1;
                }
            }
        }
        info!(
            source_id = %self.source_id,
            records = batch.records.len(),
            failed = batch.stats.failed_endpoints,
            "endpoint poll complete"
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use swm_storage::{BackoffPolicy, HttpClientConfig, LocalObjectStore};

    fn obj(value: JsonValue) -> JsonObject {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn all_supported_date_layouts_normalize() {
        for raw in [
            "2025-06-29",
            "29-06-2025",
            "2025/06/29",
            "29/06/2025",
            "20250629",
            "29.06.2025",
            "2025.06.29",
        ] {
            assert_eq!(normalize_date(raw), "2025-06-29", "input {raw}");
        }
    }

    #[test]
    fn date_cleaning_drops_time_and_noise() {
        assert_eq!(normalize_date("2025-06-29 10:15:00"), "2025-06-29");
        assert_eq!(normalize_date(" 29/6/2025 "), "2025-06-29");
        assert_eq!(normalize_date("backup_20250629.json"), "2025-06-29");
        assert_eq!(normalize_date("not-a-date"), "");
        assert_eq!(normalize_date("NaN"), "");
        assert_eq!(normalize_date("null"), "");
        assert_eq!(normalize_date("31-02-2025"), "");
    }

    #[test]
    fn normalizer_maps_aliases_and_derives_cluster() {
        let raw = obj(json!({
            "Date": "23-05-2025",
            "Site": "madanapalle",
            "Net Weight": "11,540",
            "Ticket No": 42,
            "Vehicle No": "AP03 TX 1234",
        }));
        let record = Normalizer::default()
            .with_processed_at("2025-05-24T00:00:00Z")
            .normalize(&raw, "Tharuni/json_backups/2025-05-23/a.json", "Tharuni");

        assert_eq!(record.date, "2025-05-23");
        assert_eq!(record.site_name, "madanapalle");
        assert_eq!(record.cluster, "Chittoor");
        assert_eq!(record.net_weight, 11540.0);
        assert_eq!(record.net_weight_calculated, 11540.0);
        assert_eq!(record.ticket_no, "42");
        assert_eq!(record.vehicle_no, "AP03 TX 1234");
        assert_eq!(record.agency_name, "");
        assert_eq!(record.first_weight, 0.0);
        assert_eq!(record.source_file, "Tharuni/json_backups/2025-05-23/a.json");
        assert_eq!(record.folder_source, "Tharuni");
        assert_eq!(record.processed_timestamp, "2025-05-24T00:00:00Z");
    }

    #[test]
    fn first_alias_wins_and_unknown_fields_are_kept() {
        let raw = obj(json!({
            "site_name": "kuppam",
            "Site": "puttur",
            "operator_shift": "B",
            "_endpoint": "ignored",
        }));
        let record = Normalizer::default().normalize(&raw, "f.json", "Folder");
        assert_eq!(record.site_name, "kuppam");
        assert_eq!(record.extra.get("operator_shift").map(String::as_str), Some("B"));
        assert!(!record.extra.contains_key("_endpoint"));
        assert!(!record.extra.contains_key("Site"));
    }

    #[test]
    fn site_renames_apply_before_cluster_lookup() {
        let raw = obj(json!({ "Site": "Visag" }));
        let record = Normalizer::default().normalize(&raw, "u", "zigmaglobal_api");
        assert_eq!(record.site_name, "GVMC");
        assert_eq!(record.cluster, "GVMC");

        let unknown = Normalizer::default().normalize(&obj(json!({ "Site": "Atlantis" })), "u", "f");
        assert_eq!(unknown.cluster, "");
    }

    #[test]
    fn net_weight_is_recomputed_from_load_and_empty_weights() {
        let n = Normalizer::default();
        let computed = n.normalize(
            &obj(json!({ "Loaded Weight": "15000", "Empty Weight": "5000", "Net Weight": "9000" })),
            "f",
            "d",
        );
        assert_eq!(computed.net_weight_calculated, 10000.0);

        let inverted = n.normalize(
            &obj(json!({ "Loaded Weight": "5000", "Empty Weight": "15000", "Net Weight": "9000" })),
            "f",
            "d",
        );
        assert_eq!(inverted.net_weight_calculated, 9000.0);

        let explicit = n.normalize(
            &obj(json!({ "Loaded Weight": "15000", "Empty Weight": "5000", "Calculated Weight": 1 })),
            "f",
            "d",
        );
        assert_eq!(explicit.net_weight_calculated, 1.0);
    }

    #[test]
    fn garbage_weights_degrade_to_zero() {
        let record = Normalizer::default().normalize(
            &obj(json!({ "Net Weight": "heavy", "Date": "garbage" })),
            "f",
            "d",
        );
        assert_eq!(record.net_weight, 0.0);
        assert_eq!(record.net_weight_calculated, 0.0);
        assert_eq!(record.date, "");
    }

    #[test]
    fn agency_override_replaces_payload_agency() {
        let raw = RawRecord {
            payload: obj(json!({ "Agency": "upstream", "Site": "tpty" })),
            source_file: "https://example.test/tpty".to_string(),
            folder_source: "zigmaglobal_api".to_string(),
            agency_override: Some("zigma".to_string()),
        };
        let record = Normalizer::default().normalize_raw(&raw);
        assert_eq!(record.agency_name, "zigma");
        assert_eq!(record.site_name, "Tirupati");
        assert_eq!(record.cluster, "Tirupati");
    }

    #[test]
    fn zigma_response_body_normalizes_to_one_record() {
        let body = std::fs::read(
            std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/weighbridge/zigma_response.json"),
        )
        .expect("fixture");
        let payload = JsonPayload::from_response_bytes(&body).expect("payload");
        let normalizer = Normalizer::default();
        let records = payload
            .into_records()
            .into_iter()
            .map(|payload| {
                normalizer.normalize_raw(&RawRecord {
                    payload,
                    source_file: "https://zigmaglobal.in/tpty/api/product/search.php".to_string(),
                    folder_source: "zigmaglobal_api".to_string(),
                    agency_override: Some("zigma".to_string()),
                })
            })
            .collect::<Vec<_>>();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.site_name, "Tirupati");
        assert_eq!(record.cluster, "Tirupati");
        assert_eq!(record.agency_name, "zigma");
        assert_eq!(record.material, "MSW");
        assert_eq!(record.first_weight, 15000.0);
        assert_eq!(record.second_weight, 6000.0);
        assert_eq!(record.net_weight_calculated, 9000.0);
        assert_eq!(record.folder_source, "zigmaglobal_api");
    }

    #[test]
    fn payload_union_resolves_files_and_responses() {
        let single = JsonPayload::from_file_bytes(br#"{"Site":"kuppam"}"#).expect("single");
        assert!(matches!(single, JsonPayload::SingleRecord(_)));
        assert_eq!(single.into_records().len(), 1);

        let many = JsonPayload::from_file_bytes(br#"[{"a":1},{"a":2},3]"#).expect("array");
        assert_eq!(many.into_records().len(), 2);

        let wrapped = JsonPayload::from_response_bytes(br#"{"status":"ok","records":[{"a":1}]}"#)
            .expect("wrapped");
        assert_eq!(wrapped.into_records().len(), 1);

        assert!(JsonPayload::from_response_bytes(br#"{"status":"ok"}"#).is_err());
        assert!(JsonPayload::from_file_bytes(b"42").is_err());
        assert!(JsonPayload::from_file_bytes(b"{broken").is_err());
    }

    #[test]
    fn undated_backups_are_filtered_by_any_date_field() {
        let target = day(2025, 6, 29);
        assert!(is_target_date_record(&obj(json!({ "Date": "29-06-2025" })), target));
        assert!(is_target_date_record(
            &obj(json!({ "cloud_upload_timestamp": "2025-06-29 08:00:00" })),
            target
        ));
        assert!(!is_target_date_record(&obj(json!({ "date": "2025-06-28" })), target));
        assert!(!is_target_date_record(&obj(json!({ "Site": "kuppam" })), target));
    }

    #[test]
    fn endpoint_templates_are_filled() {
        let d = day(2025, 6, 29);
        assert_eq!(
            render_endpoint("https://z.test/kuppam/api?from_date={from_date}&to_date={to_date}", d, d),
            "https://z.test/kuppam/api?from_date=2025-06-29&to_date=2025-06-29"
        );
    }

    #[tokio::test]
    async fn crawler_reads_dated_folders_and_skips_bad_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalObjectStore::new("bucket", dir.path()));
        store
            .write(
                "Tharuni/json_backups/2025-06-29/a.json",
                br#"[{"Site":"kuppam","Ticket No":"1"},{"Site":"kuppam","Ticket No":"2"}]"#,
                "application/json",
            )
            .await
            .expect("write a");
        store
            .write("Tharuni/json_backups/2025-06-29/broken.json", b"{oops", "application/json")
            .await
            .expect("write broken");
        store
            .write("Tharuni/json_backups/2025-06-29/empty.json", b"", "application/json")
            .await
            .expect("write empty");
        store
            .write("Default_Agency/Tharuni/2025-06-29/json_backups/b.json", br#"{"Site":"puttur"}"#, "application/json")
            .await
            .expect("write b");
        store
            .write("Tharuni/json_backups/2025-06-29/notes.txt", b"hello", "text/plain")
            .await
            .expect("write txt");

        let source = ObjectStoreSource::new(
            "advitia",
            store,
            vec!["Tharuni".to_string(), "Ghost".to_string()],
            false,
        );
        let batch = source.collect(day(2025, 6, 29)).await;

        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.stats.files_read, 2);
        assert_eq!(batch.stats.failed_files, 1);
        assert_eq!(batch.stats.folders_without_backups, vec!["Ghost".to_string()]);
        assert!(batch.records.iter().all(|r| r.folder_source == "Tharuni"));
    }

    #[tokio::test]
    async fn undated_backup_prefix_reads_each_object_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalObjectStore::new("bucket", dir.path()));
        store
            .write(
                "Tharuni/json_backups/2025-06-29/a.json",
                br#"{"Site":"kuppam","Date":"2025-06-20"}"#,
                "application/json",
            )
            .await
            .expect("write dated");
        store
            .write(
                "Tharuni/json_backups/loose.json",
                br#"[{"Date":"2025-06-29"},{"Date":"2025-06-28"}]"#,
                "application/json",
            )
            .await
            .expect("write undated");

        let source = ObjectStoreSource::new("advitia", store, vec!["Tharuni".to_string()], true);
        let batch = source.collect(day(2025, 6, 29)).await;

        // dated folder contents are taken whole; the loose file is date-filtered
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.stats.files_read, 2);
        assert_eq!(batch.stats.skipped_other_dates, 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_yields_empty_batch() {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
        })
        .expect("client");
        let source = HttpRecordSource::new(
            "zigma",
            Arc::new(http),
            vec!["http://127.0.0.1:9/api?from_date={from_date}&to_date={to_date}".to_string()],
            "zigmaglobal_api",
            Some("zigma".to_string()),
        );
        let batch = source.collect(day(2025, 6, 29)).await;
        assert!(batch.records.is_empty());
        assert_eq!(batch.stats.endpoints_polled, 1);
        assert_eq!(batch.stats.failed_endpoints, 1);
    }
}
