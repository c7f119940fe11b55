//! Filter/query engine over any table whose rows expose agency, cluster, site and date.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use swm_core::{DimensionRow, FilterQuery, WeightColumn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Aggregates {
    pub record_count: usize,
    pub total_weight: f64,
    pub vehicle_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<'a, R> {
    pub rows: Vec<&'a R>,
    pub aggregates: Aggregates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    #[default]
    Agency,
    Cluster,
    Site,
}

impl Dimension {
    pub fn value_of<'r, R: DimensionRow>(self, row: &'r R) -> &'r str {
        match self {
            Self::Agency => row.agency(),
            Self::Cluster => row.cluster(),
            Self::Site => row.site(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownRow {
    pub key: String,
    #[serde(flatten)]
    pub aggregates: Aggregates,
}

fn row_date(row: &impl DimensionRow) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(row.date().trim(), "%Y-%m-%d").ok()
}

/// Categorical predicates are exact matches; date bounds are inclusive and a
/// row whose date does not parse never satisfies a bound.
pub fn matches<R: DimensionRow>(row: &R, filter: &FilterQuery) -> bool {
    if !filter.agency.matches(row.agency())
        || !filter.cluster.matches(row.cluster())
        || !filter.site.matches(row.site())
    {
        return false;
    }
    if !filter.has_date_bounds() {
        return true;
    }
    let Some(date) = row_date(row) else {
        return false;
    };
    filter.start_date.map_or(true, |start| date >= start) && filter.end_date.map_or(true, |end| date <= end)
}

pub fn aggregate<R: DimensionRow>(rows: &[&R], weight: WeightColumn) -> Aggregates {
    let mut vehicles = BTreeSet::new();
    let mut total_weight = 0.0;
    for row in rows {
        total_weight += row.weight(weight).unwrap_or(0.0);
        if let Some(vehicle) = row.vehicle().map(str::trim).filter(|v| !v.is_empty()) {
            vehicles.insert(vehicle);
        }
    }
    Aggregates {
        record_count: rows.len(),
        total_weight,
        vehicle_count: vehicles.len(),
    }
}

pub fn query<'a, R: DimensionRow>(rows: &'a [R], filter: &FilterQuery, weight: WeightColumn) -> QueryResult<'a, R> {
    let rows = rows.iter().filter(|r| matches(*r, filter)).collect::<Vec<_>>();
    let aggregates = aggregate(&rows, weight);
    QueryResult { rows, aggregates }
}

/// Filtered rows grouped by one dimension, sorted by key.
pub fn breakdown<R: DimensionRow>(
    rows: &[R],
    filter: &FilterQuery,
    weight: WeightColumn,
    group_by: Dimension,
) -> Vec<BreakdownRow> {
    let mut groups: BTreeMap<&str, Vec<&R>> = BTreeMap::new();
    for row in rows.iter().filter(|r| matches(*r, filter)) {
        groups.entry(group_by.value_of(row).trim()).or_default().push(row);
    }
    groups
        .into_iter()
        .map(|(key, rows)| BreakdownRow {
            key: key.to_string(),
            aggregates: aggregate(&rows, weight),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use swm_core::{UnifiedVizRow, WeighbridgeRecord};

    fn viz(agency: &str, cluster: &str, site: &str, date: &str, weight: f64) -> UnifiedVizRow {
        UnifiedVizRow {
            agency: agency.to_string(),
            cluster: cluster.to_string(),
            site: site.to_string(),
            date: date.to_string(),
            net_weight_calculated: weight,
            ..Default::default()
        }
    }

    fn record(agency: &str, site: &str, vehicle: &str, net: f64) -> WeighbridgeRecord {
        WeighbridgeRecord {
            agency_name: agency.to_string(),
            site_name: site.to_string(),
            vehicle_no: vehicle.to_string(),
            date: "2025-05-23".to_string(),
            net_weight: net,
            net_weight_calculated: net,
            ..Default::default()
        }
    }

    fn table() -> Vec<UnifiedVizRow> {
        vec![
            viz("Zigma", "Chittoor", "kuppam", "2025-05-21", 100.0),
            viz("Zigma", "Chittoor", "madanapalle", "2025-05-23", 250.5),
            viz("Saurashtra", "Kurnool", "Kurnool", "2025-05-23", 40.0),
            viz("Zigma", "Tirupati", "Tirupati", "", 9.0),
        ]
    }

    #[test]
    fn agency_filter_counts_and_sums_exactly_the_matching_rows() {
        let rows = table();
        let result = query(&rows, &FilterQuery::all().agency("Zigma"), WeightColumn::NetWeightCalculated);
        assert_eq!(result.aggregates.record_count, 3);
        assert_eq!(result.aggregates.total_weight, 359.5);
        assert_eq!(result.aggregates.vehicle_count, 0);
        assert!(result.rows.iter().all(|r| r.agency == "Zigma"));
    }

    #[test]
    fn no_match_and_empty_table_return_zeroed_aggregates() {
        let rows = table();
        let none = query(&rows, &FilterQuery::all().agency("Nobody"), WeightColumn::NetWeightCalculated);
        assert!(none.rows.is_empty());
        assert_eq!(none.aggregates, Aggregates::default());

        let empty: Vec<UnifiedVizRow> = Vec::new();
        let result = query(&empty, &FilterQuery::all(), WeightColumn::NetWeightCalculated);
        assert_eq!(result.aggregates, Aggregates::default());
    }

    #[test]
    fn date_bounds_are_inclusive_and_skip_undated_rows() {
        let rows = table();
        let filter = FilterQuery::all().between(
            NaiveDate::from_ymd_opt(2025, 5, 22),
            NaiveDate::from_ymd_opt(2025, 5, 23),
        );
        let result = query(&rows, &filter, WeightColumn::NetWeightCalculated);
        let sites = result.rows.iter().map(|r| r.site.as_str()).collect::<Vec<_>>();
        assert_eq!(sites, vec!["madanapalle", "Kurnool"]);

        let unbounded = query(&rows, &FilterQuery::all(), WeightColumn::NetWeightCalculated);
        assert_eq!(unbounded.aggregates.record_count, 4);
    }

    #[test]
    fn absent_weight_column_counts_as_zero() {
        let rows = table();
        let result = query(&rows, &FilterQuery::all(), WeightColumn::FirstWeight);
        assert_eq!(result.aggregates.record_count, 4);
        assert_eq!(result.aggregates.total_weight, 0.0);
    }

    #[test]
    fn vehicle_count_is_distinct_and_ignores_blanks() {
        let rows = vec![
            record("zigma", "kuppam", "AP03 1234", 10.0),
            record("zigma", "kuppam", "AP03 1234", 5.0),
            record("zigma", "kuppam", "", 1.0),
            record("zigma", "madanapalle", "AP03 9999", 2.0),
        ];
        let result = query(&rows, &FilterQuery::all(), WeightColumn::NetWeight);
        assert_eq!(result.aggregates.vehicle_count, 2);
        assert_eq!(result.aggregates.total_weight, 18.0);
    }

    #[test]
    fn breakdown_groups_filtered_rows_by_key() {
        let rows = table();
        let groups = breakdown(
            &rows,
            &FilterQuery::all().agency("Zigma"),
            WeightColumn::NetWeightCalculated,
            Dimension::Cluster,
        );
        let keys = groups.iter().map(|g| g.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["Chittoor", "Tirupati"]);
        assert_eq!(groups[0].aggregates.record_count, 2);
        assert_eq!(groups[0].aggregates.total_weight, 350.5);
    }
}
