//! Per-source record tables: column union, deduplication and the CSV codec.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use swm_core::{WeighbridgeRecord, CANONICAL_COLUMNS};
use tracing::debug;

/// How duplicate rows are recognised when a batch is appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    /// `(ticket_no, cloud_upload_timestamp)` when both are set, else `_source_file`.
    #[default]
    TicketAndUpload,
    /// One row per `_source_file`.
    SourceFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Ticket(String, String),
    File(String),
}

impl DedupStrategy {
    fn key_for(self, record: &WeighbridgeRecord) -> Option<DedupKey> {
        let ticket = record.ticket_no.trim();
        let uploaded = record.cloud_upload_timestamp.trim();
        let file = record.source_file.trim();
        match self {
            Self::TicketAndUpload if !ticket.is_empty() && !uploaded.is_empty() => {
                Some(DedupKey::Ticket(ticket.to_string(), uploaded.to_string()))
            }
            _ if !file.is_empty() => Some(DedupKey::File(file.to_string())),
            _ => None,
        }
    }
}

/// A rectangular table of canonical records plus any extra payload columns.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordTable {
    columns: Vec<String>,
    rows: Vec<WeighbridgeRecord>,
}

impl Default for RecordTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordTable {
    pub fn new() -> Self {
        Self {
            columns: CANONICAL_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn from_records(records: Vec<WeighbridgeRecord>) -> Self {
        let mut table = Self::new();
        table.append(records);
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[WeighbridgeRecord] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<WeighbridgeRecord> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn add_column(&mut self, column: &str) {
        if !self.columns.iter().any(|c| c == column) {
            self.columns.push(column.to_string());
        }
    }

    /// Append rows; their extra columns join the table's column set.
    pub fn append(&mut self, records: Vec<WeighbridgeRecord>) {
        for record in &records {
            for column in record.extra.keys() {
                self.add_column(column);
            }
        }
        self.rows.extend(records);
    }

    /// Concatenate another table after the union of both column sets.
    pub fn concat(&mut self, other: RecordTable) {
        for column in &other.columns {
            self.add_column(column);
        }
        self.rows.extend(other.rows);
    }

    /// Drop earlier occurrences of a repeated key; the last one stays where it was.
    ///
    /// Rows with no usable key are always kept. Returns the number removed.
    pub fn dedupe(&mut self, strategy: DedupStrategy) -> usize {
        let before = self.rows.len();
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(before);
        for record in self.rows.drain(..).rev() {
            if let Some(key) = strategy.key_for(&record) {
                if !seen.insert(key) {
                    continue;
                }
            }
            kept.push(record);
        }
        kept.reverse();
        self.rows = kept;
        before - self.rows.len()
    }

    /// Stamp rows whose `_source_company` is blank.
    pub fn fill_source_company(&mut self, company: &str) {
        for row in self.rows.iter_mut().filter(|r| r.source_company.is_empty()) {
            row.source_company = company.to_string();
        }
    }

    pub fn from_csv(bytes: &[u8]) -> Result<Self, csv::Error> {
        let mut table = Self::new();
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(table);
        }

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::Headers)
            .flexible(true)
            .from_reader(bytes);
        let headers = reader.headers()?.clone();

        let mut columns = headers.iter().map(str::to_string).collect::<Vec<_>>();
        for canonical in CANONICAL_COLUMNS {
            if !columns.iter().any(|c| c == canonical) {
                columns.push(canonical.to_string());
            }
        }
        table.columns = columns;

        for (line, result) in reader.records().enumerate() {
            let row = result?;
            let mut record = WeighbridgeRecord::default();
            for (column, value) in headers.iter().zip(row.iter()) {
                if column.is_empty() {
                    continue;
                }
                if !record.set_cell(column, value) {
                    debug!(line, column, value, "non-numeric weight in stored table, using 0");
                }
            }
            table.rows.push(record);
        }
        Ok(table)
    }

    pub fn to_csv(&self) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(self.columns.iter().map(|c| row.cell(c)))?;
        }
        writer
            .into_inner()
            .map_err(|err| csv::Error::from(err.into_error()))
    }
}

/// Merge a batch into an existing table and deduplicate. Returns the merged
/// table with the number of rows removed.
pub fn append(
    existing: RecordTable,
    new_records: Vec<WeighbridgeRecord>,
    strategy: DedupStrategy,
) -> (RecordTable, usize) {
    let mut merged = existing;
    merged.append(new_records);
    let removed = merged.dedupe(strategy);
    (merged, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(ticket: &str, uploaded: &str, file: &str, net: f64) -> WeighbridgeRecord {
        WeighbridgeRecord {
            ticket_no: ticket.to_string(),
            cloud_upload_timestamp: uploaded.to_string(),
            source_file: file.to_string(),
            net_weight: net,
            net_weight_calculated: net,
            ..Default::default()
        }
    }

    #[test]
    fn later_duplicate_replaces_earlier() {
        let existing = RecordTable::from_records(vec![
            rec("T1", "2025-01-01T10:00:00", "a.json", 100.0),
            rec("T2", "2025-01-01T11:00:00", "a.json", 50.0),
        ]);
        let (merged, removed) = append(
            existing,
            vec![rec("T1", "2025-01-01T10:00:00", "b.json", 250.0)],
            DedupStrategy::TicketAndUpload,
        );

        assert_eq!(removed, 1);
        assert_eq!(merged.len(), 2);
        let t1 = merged.rows().iter().filter(|r| r.ticket_no == "T1").collect::<Vec<_>>();
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].net_weight, 250.0);
        assert_eq!(merged.rows()[0].ticket_no, "T2");
    }

    #[test]
    fn merging_the_same_batch_twice_is_idempotent() {
        let batch = vec![
            rec("T1", "2025-01-01T10:00:00", "a.json", 100.0),
            rec("", "", "b.json", 10.0),
            rec("T3", "", "c.json", 30.0),
        ];
        let (once, _) = append(RecordTable::new(), batch.clone(), DedupStrategy::TicketAndUpload);
        let (twice, removed) = append(once.clone(), batch, DedupStrategy::TicketAndUpload);
        assert_eq!(removed, 3);
        assert_eq!(once, twice);
    }

    #[test]
    fn rows_without_any_key_are_kept() {
        let (merged, removed) = append(
            RecordTable::new(),
            vec![rec("", "", "", 1.0), rec("", "", "", 1.0)],
            DedupStrategy::TicketAndUpload,
        );
        assert_eq!(removed, 0);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn source_file_strategy_keeps_one_row_per_file() {
        let (merged, removed) = append(
            RecordTable::new(),
            vec![rec("T1", "x", "a.json", 1.0), rec("T2", "y", "a.json", 2.0)],
            DedupStrategy::SourceFile,
        );
        assert_eq!(removed, 1);
        assert_eq!(merged.rows()[0].ticket_no, "T2");
    }

    #[test]
    fn disjoint_extra_columns_union_with_defaults() {
        let mut left = rec("T1", "u1", "a.json", 1.0);
        left.extra.insert("shift".to_string(), "A".to_string());
        let mut right = rec("T2", "u2", "b.json", 2.0);
        right.extra.insert("operator".to_string(), "ravi".to_string());

        let mut table = RecordTable::from_records(vec![left]);
        table.concat(RecordTable::from_records(vec![right]));

        let columns = table.columns();
        assert!(columns.iter().any(|c| c == "shift"));
        assert!(columns.iter().any(|c| c == "operator"));

        let csv = String::from_utf8(table.to_csv().expect("csv")).expect("utf8");
        let parsed = RecordTable::from_csv(csv.as_bytes()).expect("parse");
        assert_eq!(parsed.rows()[0].cell("operator"), "");
        assert_eq!(parsed.rows()[1].cell("shift"), "");
        assert_eq!(parsed.rows()[1].cell("first_weight"), "0");
        assert_eq!(parsed.rows()[1].cell("operator"), "ravi");
    }

    #[test]
    fn stored_tables_missing_columns_read_rectangular() {
        let csv = " ticket_no ,net_weight,site_name\nT9,\"1,200\",kuppam\nT10,n/a,puttur\n";
        let table = RecordTable::from_csv(csv.as_bytes()).expect("parse");
        assert_eq!(table.len(), 2);
        assert_eq!(table.columns()[0], "ticket_no");
        assert!(table.columns().iter().any(|c| c == "net_weight_calculated"));
        assert_eq!(table.rows()[0].net_weight, 1200.0);
        assert_eq!(table.rows()[1].net_weight, 0.0);
        assert_eq!(table.rows()[1].cell("second_weight"), "0");
        assert_eq!(table.rows()[1].cell("cluster"), "");
    }

    #[test]
    fn empty_stored_table_reads_as_empty() {
        assert!(RecordTable::from_csv(b"").expect("empty").is_empty());
    }
}
