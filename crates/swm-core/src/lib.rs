//! Core weighbridge data model, column schema and site directory for SWM.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "swm-core";

/// Sentinel used by filters and option lists for "no constraint".
pub const ALL: &str = "all";

/// Weight columns that default to `0` instead of `""`.
pub const NUMERIC_COLUMNS: [&str; 4] = [
    "first_weight",
    "second_weight",
    "net_weight",
    "net_weight_calculated",
];

/// Column order of every per-source table.
pub const CANONICAL_COLUMNS: [&str; 28] = [
    "date",
    "time",
    "site_name",
    "cluster",
    "agency_name",
    "material",
    "ticket_no",
    "vehicle_no",
    "transfer_party_name",
    "first_weight",
    "first_timestamp",
    "second_weight",
    "second_timestamp",
    "net_weight",
    "material_type",
    "first_front_image",
    "first_back_image",
    "second_front_image",
    "second_back_image",
    "site_incharge",
    "user_name",
    "cloud_upload_timestamp",
    "record_status",
    "net_weight_calculated",
    "_source_file",
    "_processed_timestamp",
    "_folder_source",
    "_source_company",
];

/// Column order of the unified viz table.
pub const VIZ_COLUMNS: [&str; 11] = [
    "Agency",
    "Sub_contractor",
    "Cluster",
    "Site",
    "Machines",
    "Total_capacity_per_day",
    "Total_waste_to_be_remediated",
    "date",
    "ticket_no",
    "net_weight_calculated",
    "_source_company",
];

pub fn is_numeric_column(column: &str) -> bool {
    NUMERIC_COLUMNS.contains(&column)
}

pub fn is_canonical_column(column: &str) -> bool {
    CANONICAL_COLUMNS.contains(&column)
}

/// Default cell text for a column that is absent from a row.
pub fn default_cell(column: &str) -> &'static str {
    if is_numeric_column(column) {
        "0"
    } else {
        ""
    }
}

/// Lenient weight parser: thousands separators are stripped, blank means zero.
///
/// Returns `None` for text that is not a finite number; callers substitute `0`.
pub fn parse_weight(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace(',', "");
    if cleaned.is_empty() {
        return Some(0.0);
    }
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => None,
    }
}

/// Integral weights render without a fractional part (`11540`, not `11540.0`).
pub fn format_weight(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// One truck-weighing transaction in canonical form.
///
/// Every field is always populated: strings default to `""`, weights to `0`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WeighbridgeRecord {
    pub date: String,
    pub time: String,
    pub site_name: String,
    pub cluster: String,
    pub agency_name: String,
    pub material: String,
    pub ticket_no: String,
    pub vehicle_no: String,
    pub transfer_party_name: String,
    pub first_weight: f64,
    pub first_timestamp: String,
    pub second_weight: f64,
    pub second_timestamp: String,
    pub net_weight: f64,
    pub material_type: String,
    pub first_front_image: String,
    pub first_back_image: String,
    pub second_front_image: String,
    pub second_back_image: String,
    pub site_incharge: String,
    pub user_name: String,
    pub cloud_upload_timestamp: String,
    pub record_status: String,
    pub net_weight_calculated: f64,
    #[serde(rename = "_source_file")]
    pub source_file: String,
    #[serde(rename = "_processed_timestamp")]
    pub processed_timestamp: String,
    #[serde(rename = "_folder_source")]
    pub folder_source: String,
    #[serde(rename = "_source_company")]
    pub source_company: String,
    /// Payload fields outside the canonical schema, kept as text columns.
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl WeighbridgeRecord {
    fn text_field(&self, column: &str) -> Option<&String> {
        let field = match column {
            "date" => &self.date,
            "time" => &self.time,
            "site_name" => &self.site_name,
            "cluster" => &self.cluster,
            "agency_name" => &self.agency_name,
            "material" => &self.material,
            "ticket_no" => &self.ticket_no,
            "vehicle_no" => &self.vehicle_no,
            "transfer_party_name" => &self.transfer_party_name,
            "first_timestamp" => &self.first_timestamp,
            "second_timestamp" => &self.second_timestamp,
            "material_type" => &self.material_type,
            "first_front_image" => &self.first_front_image,
            "first_back_image" => &self.first_back_image,
            "second_front_image" => &self.second_front_image,
            "second_back_image" => &self.second_back_image,
            "site_incharge" => &self.site_incharge,
            "user_name" => &self.user_name,
            "cloud_upload_timestamp" => &self.cloud_upload_timestamp,
            "record_status" => &self.record_status,
            "_source_file" => &self.source_file,
            "_processed_timestamp" => &self.processed_timestamp,
            "_folder_source" => &self.folder_source,
            "_source_company" => &self.source_company,
            _ => return None,
        };
        Some(field)
    }

    fn text_field_mut(&mut self, column: &str) -> Option<&mut String> {
        let field = match column {
            "date" => &mut self.date,
            "time" => &mut self.time,
            "site_name" => &mut self.site_name,
            "cluster" => &mut self.cluster,
            "agency_name" => &mut self.agency_name,
            "material" => &mut self.material,
            "ticket_no" => &mut self.ticket_no,
            "vehicle_no" => &mut self.vehicle_no,
            "transfer_party_name" => &mut self.transfer_party_name,
            "first_timestamp" => &mut self.first_timestamp,
            "second_timestamp" => &mut self.second_timestamp,
            "material_type" => &mut self.material_type,
            "first_front_image" => &mut self.first_front_image,
            "first_back_image" => &mut self.first_back_image,
            "second_front_image" => &mut self.second_front_image,
            "second_back_image" => &mut self.second_back_image,
            "site_incharge" => &mut self.site_incharge,
            "user_name" => &mut self.user_name,
            "cloud_upload_timestamp" => &mut self.cloud_upload_timestamp,
            "record_status" => &mut self.record_status,
            "_source_file" => &mut self.source_file,
            "_processed_timestamp" => &mut self.processed_timestamp,
            "_folder_source" => &mut self.folder_source,
            "_source_company" => &mut self.source_company,
            _ => return None,
        };
        Some(field)
    }

    pub fn weight(&self, column: WeightColumn) -> f64 {
        match column {
            WeightColumn::FirstWeight => self.first_weight,
            WeightColumn::SecondWeight => self.second_weight,
            WeightColumn::NetWeight => self.net_weight,
            WeightColumn::NetWeightCalculated => self.net_weight_calculated,
        }
    }

    fn weight_mut(&mut self, column: WeightColumn) -> &mut f64 {
        match column {
            WeightColumn::FirstWeight => &mut self.first_weight,
            WeightColumn::SecondWeight => &mut self.second_weight,
            WeightColumn::NetWeight => &mut self.net_weight,
            WeightColumn::NetWeightCalculated => &mut self.net_weight_calculated,
        }
    }

    /// Cell text for `column`, falling back to the column default.
    pub fn cell(&self, column: &str) -> String {
        if let Some(weight) = WeightColumn::from_column(column) {
            return format_weight(self.weight(weight));
        }
        if let Some(text) = self.text_field(column) {
            return text.clone();
        }
        self.extra
            .get(column)
            .cloned()
            .unwrap_or_else(|| default_cell(column).to_string())
    }

    /// Assign a cell by column name. Unknown columns land in `extra`.
    ///
    /// Returns `false` when a weight column received unparseable text; the
    /// weight is then set to `0`.
    pub fn set_cell(&mut self, column: &str, value: &str) -> bool {
        if let Some(weight) = WeightColumn::from_column(column) {
            return match parse_weight(value) {
                Some(v) => {
                    *self.weight_mut(weight) = v;
                    true
                }
                None => {
                    *self.weight_mut(weight) = 0.0;
                    false
                }
            };
        }
        if let Some(field) = self.text_field_mut(column) {
            *field = value.to_string();
        } else {
            self.extra.insert(column.to_string(), value.to_string());
        }
        true
    }
}

/// Weight columns a query can aggregate over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightColumn {
    FirstWeight,
    SecondWeight,
    NetWeight,
    #[default]
    NetWeightCalculated,
}

impl WeightColumn {
    pub fn from_column(column: &str) -> Option<Self> {
        match column {
            "first_weight" => Some(Self::FirstWeight),
            "second_weight" => Some(Self::SecondWeight),
            "net_weight" => Some(Self::NetWeight),
            "net_weight_calculated" => Some(Self::NetWeightCalculated),
            _ => None,
        }
    }

    pub fn column_name(self) -> &'static str {
        match self {
            Self::FirstWeight => "first_weight",
            Self::SecondWeight => "second_weight",
            Self::NetWeight => "net_weight",
            Self::NetWeightCalculated => "net_weight_calculated",
        }
    }
}

/// Static reference row joined against `WeighbridgeRecord::site_name`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SiteMapping {
    #[serde(rename = "Site", default)]
    pub site: String,
    #[serde(rename = "Agency", default)]
    pub agency: String,
    #[serde(rename = "Sub_contractor", default)]
    pub sub_contractor: String,
    #[serde(rename = "Cluster", default)]
    pub cluster: String,
    #[serde(rename = "Machines", default)]
    pub machines: String,
    #[serde(rename = "Total_capacity_per_day", default)]
    pub total_capacity_per_day: String,
    #[serde(rename = "Total_waste_to_be_remediated", default)]
    pub total_waste_to_be_remediated: String,
}

/// One row of the unified viz table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnifiedVizRow {
    #[serde(rename = "Agency")]
    pub agency: String,
    #[serde(rename = "Sub_contractor")]
    pub sub_contractor: String,
    #[serde(rename = "Cluster")]
    pub cluster: String,
    #[serde(rename = "Site")]
    pub site: String,
    #[serde(rename = "Machines")]
    pub machines: String,
    #[serde(rename = "Total_capacity_per_day")]
    pub total_capacity_per_day: String,
    #[serde(rename = "Total_waste_to_be_remediated")]
    pub total_waste_to_be_remediated: String,
    pub date: String,
    pub ticket_no: String,
    pub net_weight_calculated: f64,
    #[serde(rename = "_source_company")]
    pub source_company: String,
}

impl UnifiedVizRow {
    pub fn join(record: &WeighbridgeRecord, mapping: &SiteMapping) -> Self {
        Self {
            agency: mapping.agency.trim().to_string(),
            sub_contractor: mapping.sub_contractor.trim().to_string(),
            cluster: mapping.cluster.trim().to_string(),
            site: mapping.site.trim().to_string(),
            machines: mapping.machines.clone(),
            total_capacity_per_day: mapping.total_capacity_per_day.clone(),
            total_waste_to_be_remediated: mapping.total_waste_to_be_remediated.clone(),
            date: record.date.clone(),
            ticket_no: record.ticket_no.clone(),
            net_weight_calculated: record.net_weight_calculated,
            source_company: record.source_company.clone(),
        }
    }

    pub fn cell(&self, column: &str) -> String {
        match column {
            "Agency" => self.agency.clone(),
            "Sub_contractor" => self.sub_contractor.clone(),
            "Cluster" => self.cluster.clone(),
            "Site" => self.site.clone(),
            "Machines" => self.machines.clone(),
            "Total_capacity_per_day" => self.total_capacity_per_day.clone(),
            "Total_waste_to_be_remediated" => self.total_waste_to_be_remediated.clone(),
            "date" => self.date.clone(),
            "ticket_no" => self.ticket_no.clone(),
            "net_weight_calculated" => format_weight(self.net_weight_calculated),
            "_source_company" => self.source_company.clone(),
            _ => String::new(),
        }
    }

    /// Returns `false` when `net_weight_calculated` was not a number.
    pub fn set_cell(&mut self, column: &str, value: &str) -> bool {
        let field = match column {
            "Agency" => &mut self.agency,
            "Sub_contractor" => &mut self.sub_contractor,
            "Cluster" => &mut self.cluster,
            "Site" => &mut self.site,
            "Machines" => &mut self.machines,
            "Total_capacity_per_day" => &mut self.total_capacity_per_day,
            "Total_waste_to_be_remediated" => &mut self.total_waste_to_be_remediated,
            "date" => &mut self.date,
            "ticket_no" => &mut self.ticket_no,
            "_source_company" => &mut self.source_company,
            "net_weight_calculated" => {
                let parsed = parse_weight(value);
                self.net_weight_calculated = parsed.unwrap_or(0.0);
                return parsed.is_some();
            }
            _ => return true,
        };
        *field = value.to_string();
        true
    }
}

/// Read-only view used by the filter engine over either table shape.
pub trait DimensionRow {
    fn agency(&self) -> &str;
    fn cluster(&self) -> &str;
    fn site(&self) -> &str;
    fn date(&self) -> &str;
    /// `None` when the table carries no vehicle column.
    fn vehicle(&self) -> Option<&str>;
    /// `None` when the table carries no such weight column.
    fn weight(&self, column: WeightColumn) -> Option<f64>;
}

impl DimensionRow for UnifiedVizRow {
    fn agency(&self) -> &str {
        &self.agency
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn site(&self) -> &str {
        &self.site
    }

    fn date(&self) -> &str {
        &self.date
    }

    fn vehicle(&self) -> Option<&str> {
        None
    }

    fn weight(&self, column: WeightColumn) -> Option<f64> {
        match column {
            WeightColumn::NetWeightCalculated => Some(self.net_weight_calculated),
            _ => None,
        }
    }
}

impl DimensionRow for WeighbridgeRecord {
    fn agency(&self) -> &str {
        &self.agency_name
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }

    fn site(&self) -> &str {
        &self.site_name
    }

    fn date(&self) -> &str {
        &self.date
    }

    fn vehicle(&self) -> Option<&str> {
        Some(&self.vehicle_no)
    }

    fn weight(&self, column: WeightColumn) -> Option<f64> {
        Some(WeighbridgeRecord::weight(self, column))
    }
}

/// A categorical filter value: either unconstrained or one exact value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Selector {
    #[default]
    All,
    Value(String),
}

impl Selector {
    /// `"all"`, blank and absent all mean no constraint.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Self::All,
            Some(v) if v == ALL => Self::All,
            Some(v) => Self::Value(v.to_string()),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Surrounding whitespace in the row value is ignored.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::All => true,
            Self::Value(v) => v == value.trim(),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::All => ALL,
            Self::Value(v) => v,
        }
    }
}

impl From<String> for Selector {
    fn from(value: String) -> Self {
        Self::parse(Some(&value))
    }
}

impl From<Selector> for String {
    fn from(value: Selector) -> Self {
        value.as_str().to_string()
    }
}

/// Transient filter over agency, cluster, site and an inclusive date range.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterQuery {
    pub agency: Selector,
    pub cluster: Selector,
    pub site: Selector,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl FilterQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn agency(mut self, agency: &str) -> Self {
        self.agency = Selector::parse(Some(agency));
        self
    }

    pub fn cluster(mut self, cluster: &str) -> Self {
        self.cluster = Selector::parse(Some(cluster));
        self
    }

    pub fn site(mut self, site: &str) -> Self {
        self.site = Selector::parse(Some(site));
        self
    }

    pub fn between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn has_date_bounds(&self) -> bool {
        self.start_date.is_some() || self.end_date.is_some()
    }
}

const SITE_RENAMES: &[(&str, &str)] = &[
    ("visag", "GVMC"),
    ("tpty", "Tirupati"),
    ("donthalli", "Donthali"),
];

const CLUSTER_MAPPING: &[(&str, &str)] = &[
    ("Bethamcherla", "Nandyal"),
    ("Yemmiganur", "Kurnool"),
    ("Nandyal", "Nandyal"),
    ("Kurnool", "Kurnool"),
    ("GVMC", "GVMC"),
    ("Donthali", "Nellore Municipal Corporation"),
    ("kuppam", "Chittoor"),
    ("madanapalle", "Chittoor"),
    ("palamaner", "Chittoor"),
    ("punganuru", "Chittoor"),
    ("puttur", "Tirupati"),
    ("Tirupati", "Tirupati"),
    ("venkatagiri", "Tirupati"),
    ("srikalahasti", "Tirupati"),
];

/// Site rename table plus the site → cluster lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDirectory {
    renames: BTreeMap<String, String>,
    clusters: BTreeMap<String, String>,
}

impl Default for SiteDirectory {
    fn default() -> Self {
        Self::standard()
    }
}

impl SiteDirectory {
    pub fn standard() -> Self {
        Self {
            renames: SITE_RENAMES
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            clusters: CLUSTER_MAPPING
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Layer configured entries on top of the current tables.
    pub fn with_overrides(
        mut self,
        renames: &BTreeMap<String, String>,
        clusters: &BTreeMap<String, String>,
    ) -> Self {
        for (from, to) in renames {
            self.renames.insert(from.trim().to_lowercase(), to.clone());
        }
        for (site, cluster) in clusters {
            self.clusters.insert(site.clone(), cluster.clone());
        }
        self
    }

    /// Display name for a raw upstream site name; rename keys match case-insensitively.
    pub fn canonical_site(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        self.renames
            .get(&trimmed.to_lowercase())
            .cloned()
            .unwrap_or_else(|| trimmed.to_string())
    }

    /// Cluster for an already-renamed site, `""` when unknown.
    pub fn cluster_for(&self, site: &str) -> &str {
        self.clusters.get(site).map(String::as_str).unwrap_or("")
    }

    pub fn known_sites(&self) -> impl Iterator<Item = &str> {
        self.clusters.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_strip_thousands_separators() {
        assert_eq!(parse_weight("11,540"), Some(11540.0));
        assert_eq!(parse_weight("  "), Some(0.0));
        assert_eq!(parse_weight("12.5"), Some(12.5));
        assert_eq!(parse_weight("heavy"), None);
        assert_eq!(parse_weight("NaN"), None);
    }

    #[test]
    fn integral_weights_render_without_fraction() {
        assert_eq!(format_weight(11540.0), "11540");
        assert_eq!(format_weight(12.25), "12.25");
        assert_eq!(format_weight(0.0), "0");
    }

    #[test]
    fn cells_round_trip_through_column_names() {
        let mut record = WeighbridgeRecord::default();
        assert!(record.set_cell("ticket_no", "T1"));
        assert!(record.set_cell("net_weight", "1,200"));
        assert!(!record.set_cell("first_weight", "n/a"));
        assert!(record.set_cell("operator", "ravi"));

        assert_eq!(record.cell("ticket_no"), "T1");
        assert_eq!(record.cell("net_weight"), "1200");
        assert_eq!(record.cell("first_weight"), "0");
        assert_eq!(record.cell("operator"), "ravi");
        assert_eq!(record.cell("missing_numeric_free_column"), "");
        assert_eq!(record.cell("_source_company"), "");
    }

    #[test]
    fn selector_treats_all_and_blank_as_unconstrained() {
        assert!(Selector::parse(None).is_all());
        assert!(Selector::parse(Some("all")).is_all());
        assert!(Selector::parse(Some("  ")).is_all());
        let s = Selector::parse(Some("Chittoor"));
        assert!(s.matches("Chittoor"));
        assert!(!s.matches("chittoor"));
        assert!(s.matches(" Chittoor "));
    }

    #[test]
    fn joined_rows_carry_trimmed_mapping_values() {
        let mapping = SiteMapping {
            site: "kuppam ".to_string(),
            agency: " Zigma".to_string(),
            cluster: "Chittoor ".to_string(),
            ..Default::default()
        };
        let row = UnifiedVizRow::join(&WeighbridgeRecord::default(), &mapping);
        assert_eq!(row.site, "kuppam");
        assert_eq!(row.agency, "Zigma");
        assert_eq!(row.cluster, "Chittoor");
    }

    #[test]
    fn directory_renames_before_cluster_lookup() {
        let dir = SiteDirectory::standard();
        let site = dir.canonical_site("Visag");
        assert_eq!(site, "GVMC");
        assert_eq!(dir.cluster_for(&site), "GVMC");
        assert_eq!(dir.cluster_for("madanapalle"), "Chittoor");
        assert_eq!(dir.cluster_for("Atlantis"), "");
    }

    #[test]
    fn directory_overrides_extend_static_tables() {
        let renames = BTreeMap::from([("KNL".to_string(), "Kurnool".to_string())]);
        let clusters = BTreeMap::from([("Adoni".to_string(), "Kurnool".to_string())]);
        let dir = SiteDirectory::standard().with_overrides(&renames, &clusters);
        assert_eq!(dir.canonical_site("knl"), "Kurnool");
        assert_eq!(dir.cluster_for("Adoni"), "Kurnool");
        assert_eq!(dir.cluster_for("Nandyal"), "Nandyal");
    }
}
