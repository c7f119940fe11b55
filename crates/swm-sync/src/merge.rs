//! Join of the combined record tables against the site mapping table.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;
use strsim::jaro_winkler;
use swm_core::{SiteMapping, UnifiedVizRow, WeighbridgeRecord, VIZ_COLUMNS};
use thiserror::Error;

const CLOSEST_SITE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("mapping table has no Site column (columns: {0:?})")]
    NoSiteColumn(Vec<String>),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// Parse the site mapping CSV. Header whitespace is ignored; extra columns are dropped.
pub fn parse_mapping_csv(bytes: &[u8]) -> Result<Vec<SiteMapping>, MappingError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_reader(bytes);
    let headers = reader.headers()?.clone();
    if !headers.iter().any(|h| h == "Site") {
        return Err(MappingError::NoSiteColumn(
            headers.iter().map(str::to_string).collect(),
        ));
    }

    let mut mappings = Vec::new();
    for result in reader.deserialize::<SiteMapping>() {
        let mapping = result?;
        if !mapping.site.trim().is_empty() {
            mappings.push(mapping);
        }
    }
    Ok(mappings)
}

fn join_key(site: &str) -> String {
    site.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmatchedSite {
    pub site: String,
    pub rows: usize,
    pub closest_known: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinOutcome {
    pub rows: Vec<UnifiedVizRow>,
    pub combined_rows: usize,
    pub dropped_rows: usize,
    pub unmatched_sites: Vec<UnmatchedSite>,
}

/// Inner-join records to mappings on trimmed, case-folded site name, then
/// project and sort into viz order.
pub fn join_with_mapping(records: &[WeighbridgeRecord], mappings: &[SiteMapping]) -> JoinOutcome {
    let mut by_site: BTreeMap<String, Vec<&SiteMapping>> = BTreeMap::new();
    for mapping in mappings {
        by_site.entry(join_key(&mapping.site)).or_default().push(mapping);
    }

    let mut rows = Vec::new();
    let mut unmatched: BTreeMap<String, usize> = BTreeMap::new();
    let mut dropped_rows = 0usize;
    for record in records {
        match by_site.get(&join_key(&record.site_name)) {
            Some(matches) => rows.extend(matches.iter().map(|m| UnifiedVizRow::join(record, m))),
            None => {
                dropped_rows += 1;
                *unmatched.entry(record.site_name.trim().to_string()).or_default() += 1;
            }
        }
    }
    sort_viz_rows(&mut rows);

    let unmatched_sites = unmatched
        .into_iter()
        .map(|(site, count)| UnmatchedSite {
            closest_known: closest_site(&site, mappings),
            site,
            rows: count,
        })
        .collect();

    JoinOutcome {
        rows,
        combined_rows: records.len(),
        dropped_rows,
        unmatched_sites,
    }
}

fn closest_site(site: &str, mappings: &[SiteMapping]) -> Option<String> {
    let needle = join_key(site);
    if needle.is_empty() {
        return None;
    }
    mappings
        .iter()
        .map(|m| (jaro_winkler(&needle, &join_key(&m.site)), m.site.trim()))
        .filter(|(score, _)| *score >= CLOSEST_SITE_THRESHOLD)
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal))
        .map(|(_, name)| name.to_string())
}

/// Integer tickets first in numeric order, then everything else as text.
fn compare_tickets(a: &str, b: &str) -> Ordering {
    let key = |t: &str| t.trim().parse::<u64>().ok();
    match (key(a), key(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// `_source_company` ascending, `date` descending, `ticket_no` ascending.
pub fn sort_viz_rows(rows: &mut [UnifiedVizRow]) {
    rows.sort_by(|a, b| {
        a.source_company
            .cmp(&b.source_company)
            .then_with(|| b.date.cmp(&a.date))
            .then_with(|| compare_tickets(&a.ticket_no, &b.ticket_no))
    });
}

pub fn viz_to_csv(rows: &[UnifiedVizRow]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(VIZ_COLUMNS)?;
    for row in rows {
        writer.write_record(VIZ_COLUMNS.iter().map(|c| row.cell(c)))?;
    }
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

pub fn viz_from_csv(bytes: &[u8]) -> Result<Vec<UnifiedVizRow>, csv::Error> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_reader(bytes);
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let mut row = UnifiedVizRow::default();
        for (column, value) in headers.iter().zip(record.iter()) {
            row.set_cell(column, value);
        }
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = "Site , Agency,Sub_contractor,Cluster,Machines,Total_capacity_per_day,Total_waste_to_be_remediated,Notes\n\
        Madanapalle ,Zigma,Sub A,Chittoor,2,500,12000,x\n\
        Kuppam,Zigma,Sub B,Chittoor,1,300,8000,y\n";

    fn rec(site: &str, company: &str, date: &str, ticket: &str, weight: f64) -> WeighbridgeRecord {
        WeighbridgeRecord {
            site_name: site.to_string(),
            source_company: company.to_string(),
            date: date.to_string(),
            ticket_no: ticket.to_string(),
            net_weight_calculated: weight,
            ..Default::default()
        }
    }

    #[test]
    fn mapping_headers_are_trimmed_and_extra_columns_ignored() {
        let mappings = parse_mapping_csv(MAPPING.as_bytes()).expect("mapping");
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].site, "Madanapalle ");
        assert_eq!(mappings[0].agency, "Zigma");
        assert_eq!(mappings[1].total_waste_to_be_remediated, "8000");
    }

    #[test]
    fn mapping_without_site_column_is_rejected() {
        let err = parse_mapping_csv(b"Agency,Cluster\nZigma,Chittoor\n").unwrap_err();
        assert!(matches!(err, MappingError::NoSiteColumn(_)));
    }

    #[test]
    fn unmatched_sites_are_dropped_with_a_hint() {
        let mappings = parse_mapping_csv(MAPPING.as_bytes()).expect("mapping");
        let records = vec![
            rec(" madanapalle", "Zigma", "2025-05-23", "7", 11540.0),
            rec("Kupam", "Zigma", "2025-05-23", "8", 10.0),
            rec("Atlantis", "Zigma", "2025-05-23", "9", 10.0),
        ];
        let outcome = join_with_mapping(&records, &mappings);

        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].site, "Madanapalle");
        assert_eq!(outcome.rows[0].cluster, "Chittoor");
        assert_eq!(outcome.rows[0].net_weight_calculated, 11540.0);
        assert_eq!(outcome.dropped_rows, 2);
        let kupam = outcome
            .unmatched_sites
            .iter()
            .find(|u| u.site == "Kupam")
            .expect("kupam unmatched");
        assert_eq!(kupam.closest_known.as_deref(), Some("Kuppam"));
        let atlantis = outcome
            .unmatched_sites
            .iter()
            .find(|u| u.site == "Atlantis")
            .expect("atlantis unmatched");
        assert_eq!(atlantis.closest_known, None);
    }

    #[test]
    fn viz_rows_sort_by_company_then_newest_date_then_ticket() {
        let mappings = parse_mapping_csv(MAPPING.as_bytes()).expect("mapping");
        let records = vec![
            rec("kuppam", "Zigma", "2025-05-22", "10", 1.0),
            rec("kuppam", "Zigma", "2025-05-23", "10", 1.0),
            rec("kuppam", "Zigma", "2025-05-23", "9", 1.0),
            rec("kuppam", "Advitia", "2025-05-01", "1", 1.0),
        ];
        let rows = join_with_mapping(&records, &mappings).rows;
        let order = rows
            .iter()
            .map(|r| (r.source_company.as_str(), r.date.as_str(), r.ticket_no.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![
                ("Advitia", "2025-05-01", "1"),
                ("Zigma", "2025-05-23", "9"),
                ("Zigma", "2025-05-23", "10"),
                ("Zigma", "2025-05-22", "10"),
            ]
        );
    }

    #[test]
    fn mixed_ticket_formats_sort_without_panicking() {
        let tickets = ["2", "10", "1a", " 7", "B-3", "007", "", "1a"];
        let mut rows = (0..200)
            .map(|i| UnifiedVizRow {
                source_company: "Zigma".to_string(),
                date: "2025-05-23".to_string(),
                ticket_no: tickets[i % tickets.len()].to_string(),
                ..Default::default()
            })
            .collect::<Vec<_>>();
        sort_viz_rows(&mut rows);

        let mut order = rows.iter().map(|r| r.ticket_no.as_str()).collect::<Vec<_>>();
        order.dedup();
        assert_eq!(order, vec!["2", " 7", "007", "10", "", "1a", "B-3"]);
    }

    #[test]
    fn join_is_deterministic_for_the_same_inputs() {
        let mappings = parse_mapping_csv(MAPPING.as_bytes()).expect("mapping");
        let records = vec![
            rec("kuppam", "Zigma", "2025-05-22", "3", 1.0),
            rec("madanapalle", "Zigma", "2025-05-22", "4", 2.5),
        ];
        let first = viz_to_csv(&join_with_mapping(&records, &mappings).rows).expect("csv");
        let second = viz_to_csv(&join_with_mapping(&records, &mappings).rows).expect("csv");
        assert_eq!(first, second);

        let text = String::from_utf8(first.clone()).expect("utf8");
        assert!(text.starts_with("Agency,Sub_contractor,Cluster,Site,"));
        let reread = viz_from_csv(&first).expect("reread");
        assert_eq!(reread.len(), 2);
        assert_eq!(reread[1].net_weight_calculated, 2.5);
    }
}
