use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Status value the solver reports when it ran out of time. Every other
/// status is an achieved schedule length.
pub const TIMEOUT_STATUS: i64 = -2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub instance_path: String,
    pub node_count: u32,
    pub machine_count: u32,
    pub status: i64,
    pub elapsed_seconds: f64,
    pub bound_variant: String,
}

impl TrialRecord {
    pub fn is_timeout(&self) -> bool {
        self.status == TIMEOUT_STATUS
    }

    /// Renders the record in the results-log format: the solver's own
    /// comma-separated fields with the bound variant appended by the harness.
    pub fn to_log_line(&self) -> String {
        format!(
            "{}, {}, {}, {}, {}, {}",
            self.instance_path,
            self.node_count,
            self.machine_count,
            self.status,
            self.elapsed_seconds,
            self.bound_variant,
        )
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("expected {expected} comma-separated fields, got {got}: {line:?}")]
    FieldCount {
        expected: usize,
        got: usize,
        line: String,
    },
    #[error("bad {field} field {value:?} in line {line:?}")]
    Field {
        field: &'static str,
        value: String,
        line: String,
    },
}

fn parse_field<T: std::str::FromStr>(
    raw: &str,
    field: &'static str,
    line: &str,
) -> Result<T, ParseError> {
    raw.trim().parse().map_err(|_| ParseError::Field {
        field,
        value: raw.trim().to_string(),
        line: line.to_string(),
    })
}

fn parse_fields(line: &str, expected: usize) -> Result<Vec<&str>, ParseError> {
    let fields: Vec<&str> = line.trim_end().split(',').collect();
    if fields.len() != expected {
        return Err(ParseError::FieldCount {
            expected,
            got: fields.len(),
            line: line.to_string(),
        });
    }
    Ok(fields)
}

/// Parses one results-log line:
/// `instance_path, node_count, machine_count, status, elapsed_seconds, bound_variant`.
/// Each field is trimmed, which also drops the one-character marker the
/// harness leaves in front of the appended bound field.
pub fn parse_log_line(line: &str) -> Result<TrialRecord, ParseError> {
    let fields = parse_fields(line, 6)?;
    Ok(TrialRecord {
        instance_path: fields[0].trim().to_string(),
        node_count: parse_field(fields[1], "node_count", line)?,
        machine_count: parse_field(fields[2], "machine_count", line)?,
        status: parse_field(fields[3], "status", line)?,
        elapsed_seconds: parse_field(fields[4], "elapsed_seconds", line)?,
        bound_variant: fields[5].trim().to_string(),
    })
}

/// Parses the solver's raw five-field output line and attaches the bound
/// variant the harness ran it under.
pub fn parse_solver_line(line: &str, bound_variant: &str) -> Result<TrialRecord, ParseError> {
    let fields = parse_fields(line, 5)?;
    Ok(TrialRecord {
        instance_path: fields[0].trim().to_string(),
        node_count: parse_field(fields[1], "node_count", line)?,
        machine_count: parse_field(fields[2], "machine_count", line)?,
        status: parse_field(fields[3], "status", line)?,
        elapsed_seconds: parse_field(fields[4], "elapsed_seconds", line)?,
        bound_variant: bound_variant.to_string(),
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Bucket {
    pub finished: Vec<f64>,
    pub timeout: Vec<f64>,
}

impl Bucket {
    pub fn total(&self) -> usize {
        self.finished.len() + self.timeout.len()
    }

    /// Completion percentage over the trials in this bucket, or `None` when
    /// the bucket holds no trials at all.
    pub fn completion_pct(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.finished.len() as f64 / total as f64 * 100.0),
        }
    }
}

/// Nested index keyed node_count -> bound_variant -> machine_count. The key
/// triple does not identify a single trial; each bucket accumulates every
/// record observed for it. Absent keys stay absent ("no data"), which is
/// distinct from a bucket that holds only timeouts.
#[derive(Debug, Default)]
pub struct AggregationIndex {
    buckets: BTreeMap<u32, BTreeMap<String, BTreeMap<u32, Bucket>>>,
}

impl AggregationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: &TrialRecord) {
        let bucket = self
            .buckets
            .entry(record.node_count)
            .or_default()
            .entry(record.bound_variant.clone())
            .or_default()
            .entry(record.machine_count)
            .or_default();
        if record.is_timeout() {
            bucket.timeout.push(record.elapsed_seconds);
        } else {
            bucket.finished.push(record.elapsed_seconds);
        }
    }

    pub fn bucket(&self, node_count: u32, bound_variant: &str, machine_count: u32) -> Option<&Bucket> {
        self.buckets
            .get(&node_count)?
            .get(bound_variant)?
            .get(&machine_count)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Distinct node counts observed, ascending.
    pub fn node_counts(&self) -> Vec<u32> {
        self.buckets.keys().copied().collect()
    }

    /// Distinct bound variants observed anywhere in the index, sorted.
    pub fn bound_variants(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for by_bound in self.buckets.values() {
            for bound in by_bound.keys() {
                if !out.iter().any(|b| b == bound) {
                    out.push(bound.clone());
                }
            }
        }
        out.sort();
        out
    }

    /// Distinct machine counts observed anywhere in the index, ascending.
    pub fn machine_counts(&self) -> Vec<u32> {
        let mut out: Vec<u32> = Vec::new();
        for by_bound in self.buckets.values() {
            for by_machines in by_bound.values() {
                for m in by_machines.keys() {
                    if !out.contains(m) {
                        out.push(*m);
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub index: AggregationIndex,
    pub records: usize,
    pub malformed: usize,
}

/// Folds a closed results log into an index. Malformed lines are warned
/// about and counted; they never enter the index and never stop the fold.
pub fn load_log(path: &Path) -> std::io::Result<LoadOutcome> {
    let contents = fs::read_to_string(path)?;
    let mut outcome = LoadOutcome {
        index: AggregationIndex::new(),
        records: 0,
        malformed: 0,
    };
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_log_line(line) {
            Ok(record) => {
                outcome.index.insert(&record);
                outcome.records += 1;
            }
            Err(err) => {
                warn!(line = lineno + 1, %err, "skipping malformed result line");
                outcome.malformed += 1;
            }
        }
    }
    Ok(outcome)
}

/// One completion-table cell: either a computed percentage or an explicit
/// absence. A key with only timeouts is `Rate(0.0)`, never `NoData`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionCell {
    NoData,
    Rate(f64),
}

#[derive(Debug, Serialize)]
pub struct CompletionRow {
    pub node_count: u32,
    /// One cell per entry of the table's `bound_variants`, in order.
    pub cells: Vec<CompletionCell>,
}

#[derive(Debug, Serialize)]
pub struct CompletionTable {
    pub machine_count: u32,
    pub bound_variants: Vec<String>,
    pub rows: Vec<CompletionRow>,
}

/// One table per machine count, rows per node count ascending, cells per
/// bound variant in sorted order.
pub fn completion_tables(index: &AggregationIndex) -> Vec<CompletionTable> {
    let bounds = index.bound_variants();
    let node_counts = index.node_counts();
    index
        .machine_counts()
        .into_iter()
        .map(|machine_count| {
            let rows = node_counts
                .iter()
                .map(|&node_count| {
                    let cells = bounds
                        .iter()
                        .map(|bound| {
                            match index
                                .bucket(node_count, bound, machine_count)
                                .and_then(Bucket::completion_pct)
                            {
                                Some(pct) => CompletionCell::Rate(pct),
                                None => CompletionCell::NoData,
                            }
                        })
                        .collect();
                    CompletionRow { node_count, cells }
                })
                .collect();
            CompletionTable {
                machine_count,
                bound_variants: bounds.clone(),
                rows,
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct TimeEntry {
    pub node_count: u32,
    /// Elapsed times of finished runs only.
    pub finished_seconds: Vec<f64>,
    /// Timeouts are excluded from the distribution but counted here.
    pub timed_out: usize,
}

#[derive(Debug, Serialize)]
pub struct TimeDistribution {
    pub machine_count: u32,
    pub bound_variant: String,
    pub entries: Vec<TimeEntry>,
}

/// Per-node-count elapsed-time collections for a fixed machine count and
/// bound variant. Node counts the index knows but that have no bucket at
/// this key are listed empty rather than dropped, so the consumer sees the
/// gap explicitly.
pub fn time_distribution(
    index: &AggregationIndex,
    machine_count: u32,
    bound_variant: &str,
) -> TimeDistribution {
    let entries = index
        .node_counts()
        .into_iter()
        .map(|node_count| match index.bucket(node_count, bound_variant, machine_count) {
            Some(bucket) => TimeEntry {
                node_count,
                finished_seconds: bucket.finished.clone(),
                timed_out: bucket.timeout.len(),
            },
            None => {
                warn!(node_count, machine_count, bound_variant, "no data for key");
                TimeEntry {
                    node_count,
                    finished_seconds: Vec::new(),
                    timed_out: 0,
                }
            }
        })
        .collect();
    TimeDistribution {
        machine_count,
        bound_variant: bound_variant.to_string(),
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(node_count: u32, bound: &str, machine_count: u32, status: i64, t: f64) -> TrialRecord {
        TrialRecord {
            instance_path: format!("series/data{}01/Pat0.rcp", node_count),
            node_count,
            machine_count,
            status,
            elapsed_seconds: t,
            bound_variant: bound.to_string(),
        }
    }

    #[test]
    fn parse_log_line_reads_all_fields() {
        let rec = parse_log_line("series/data1201/Pat3.rcp, 12, 8, 47, 1.25, Fujita")
            .expect("valid line");
        assert_eq!(rec.instance_path, "series/data1201/Pat3.rcp");
        assert_eq!(rec.node_count, 12);
        assert_eq!(rec.machine_count, 8);
        assert_eq!(rec.status, 47);
        assert_eq!(rec.elapsed_seconds, 1.25);
        assert_eq!(rec.bound_variant, "Fujita");
        assert!(!rec.is_timeout());
    }

    #[test]
    fn parse_log_line_strips_bound_marker() {
        // The append step leaves a leading marker character on the bound field.
        let rec = parse_log_line("p.rcp,12,8,-2,60.01, Fernandez").expect("valid line");
        assert_eq!(rec.bound_variant, "Fernandez");
        assert!(rec.is_timeout());
    }

    #[test]
    fn parse_log_line_rejects_wrong_field_count() {
        let err = parse_log_line("p.rcp, 12, 8, 47").expect_err("four fields");
        match err {
            ParseError::FieldCount { expected: 6, got: 4, .. } => {}
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn parse_log_line_rejects_bad_numeric() {
        let err = parse_log_line("p.rcp, twelve, 8, 47, 1.0, Fujita").expect_err("bad n");
        match err {
            ParseError::Field { field: "node_count", .. } => {}
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn parse_solver_line_attaches_variant() {
        let rec = parse_solver_line("p.rcp, 14, 16, -2, 60.002", "Fujita").expect("valid line");
        assert_eq!(rec.bound_variant, "Fujita");
        assert_eq!(rec.status, TIMEOUT_STATUS);
        assert!(parse_solver_line("p.rcp, 14, 16, -2", "Fujita").is_err());
    }

    #[test]
    fn log_line_round_trips() {
        let rec = record(18, "Fernandez", 4, TIMEOUT_STATUS, 60.5);
        let back = parse_log_line(&rec.to_log_line()).expect("own output parses");
        assert_eq!(back, rec);
    }

    #[test]
    fn insert_classifies_by_timeout_sentinel() {
        let mut index = AggregationIndex::new();
        index.insert(&record(12, "Fujita", 8, TIMEOUT_STATUS, 60.0));
        index.insert(&record(12, "Fujita", 8, 33, 2.5));
        index.insert(&record(12, "Fujita", 8, 0, 0.1));
        let bucket = index.bucket(12, "Fujita", 8).expect("bucket exists");
        assert_eq!(bucket.timeout, vec![60.0]);
        assert_eq!(bucket.finished, vec![2.5, 0.1]);
    }

    #[test]
    fn axes_are_sorted_and_distinct() {
        let mut index = AggregationIndex::new();
        index.insert(&record(20, "Fujita", 16, 1, 1.0));
        index.insert(&record(12, "Fernandez", 4, 1, 1.0));
        index.insert(&record(12, "Fujita", 8, 1, 1.0));
        index.insert(&record(20, "Fujita", 4, 1, 1.0));
        assert_eq!(index.node_counts(), vec![12, 20]);
        assert_eq!(index.bound_variants(), vec!["Fernandez", "Fujita"]);
        assert_eq!(index.machine_counts(), vec![4, 8, 16]);
    }

    #[test]
    fn completion_distinguishes_zero_from_no_data() {
        let mut index = AggregationIndex::new();
        // Only timeouts at this key: a true 0%, not absence.
        index.insert(&record(24, "Fujita", 4, TIMEOUT_STATUS, 60.0));
        index.insert(&record(24, "Fujita", 4, TIMEOUT_STATUS, 60.1));
        index.insert(&record(12, "Fujita", 4, 9, 0.4));
        let tables = completion_tables(&index);
        assert_eq!(tables.len(), 1);
        let table = &tables[0];
        assert_eq!(table.machine_count, 4);
        assert_eq!(table.rows[1].node_count, 24);
        assert_eq!(table.rows[1].cells, vec![CompletionCell::Rate(0.0)]);
        assert_eq!(table.rows[0].cells, vec![CompletionCell::Rate(100.0)]);
    }

    #[test]
    fn completion_marks_absent_keys_no_data() {
        let mut index = AggregationIndex::new();
        index.insert(&record(12, "Fujita", 8, 5, 1.0));
        index.insert(&record(14, "Fernandez", 16, 5, 1.0));
        // (12, Fernandez, 8) was never run; the cell must say so rather
        // than divide by zero.
        let tables = completion_tables(&index);
        let table_m8 = tables.iter().find(|t| t.machine_count == 8).expect("m=8 table");
        let row_12 = table_m8.rows.iter().find(|r| r.node_count == 12).expect("n=12 row");
        assert_eq!(table_m8.bound_variants, vec!["Fernandez", "Fujita"]);
        assert_eq!(
            row_12.cells,
            vec![CompletionCell::NoData, CompletionCell::Rate(100.0)]
        );
    }

    #[test]
    fn completion_scenario_three_finished_two_timeouts() {
        let mut index = AggregationIndex::new();
        for t in [1.2, 3.4, 5.6] {
            index.insert(&record(12, "Fujita", 16, 40, t));
        }
        for _ in 0..2 {
            index.insert(&record(12, "Fujita", 16, TIMEOUT_STATUS, 60.0));
        }
        let bucket = index.bucket(12, "Fujita", 16).expect("bucket exists");
        assert_eq!(bucket.completion_pct(), Some(60.0));
    }

    #[test]
    fn synthetic_lines_round_trip_through_the_pipeline() {
        // 4 finished + 6 timeouts for Fujita, 10 finished for Fernandez.
        let mut lines = Vec::new();
        for i in 0..10 {
            let status = if i < 4 { 30 + i } else { TIMEOUT_STATUS };
            lines.push(format!("series/data1601/Pat{}.rcp, 16, 8, {}, 12.5, Fujita", i, status));
            lines.push(format!("series/data1601/Pat{}.rcp, 16, 8, {}, 3.5, Fernandez", i, 30));
        }
        let mut index = AggregationIndex::new();
        for line in &lines {
            index.insert(&parse_log_line(line).expect("synthetic line parses"));
        }
        let fujita = index.bucket(16, "Fujita", 8).expect("fujita bucket");
        assert_eq!(fujita.finished.len(), 4);
        assert_eq!(fujita.timeout.len(), 6);
        assert_eq!(fujita.completion_pct(), Some(40.0));
        let fernandez = index.bucket(16, "Fernandez", 8).expect("fernandez bucket");
        assert_eq!(fernandez.completion_pct(), Some(100.0));
        let tables = completion_tables(&index);
        assert_eq!(tables[0].rows[0].cells, vec![
            CompletionCell::Rate(100.0),
            CompletionCell::Rate(40.0),
        ]);
    }

    #[test]
    fn time_distribution_excludes_timeouts_but_counts_them() {
        let mut index = AggregationIndex::new();
        index.insert(&record(12, "Fujita", 16, 10, 1.5));
        index.insert(&record(12, "Fujita", 16, TIMEOUT_STATUS, 60.0));
        index.insert(&record(13, "Fujita", 16, 11, 2.5));
        index.insert(&record(14, "Fujita", 4, 11, 2.5));
        let dist = time_distribution(&index, 16, "Fujita");
        assert_eq!(dist.entries.len(), 3);
        assert_eq!(dist.entries[0].finished_seconds, vec![1.5]);
        assert_eq!(dist.entries[0].timed_out, 1);
        assert_eq!(dist.entries[1].finished_seconds, vec![2.5]);
        assert_eq!(dist.entries[1].timed_out, 0);
        // n=14 only ran at m=4; the m=16 view lists it empty.
        assert_eq!(dist.entries[2].node_count, 14);
        assert!(dist.entries[2].finished_seconds.is_empty());
        assert_eq!(dist.entries[2].timed_out, 0);
    }

    #[test]
    fn load_log_skips_malformed_lines_and_keeps_counting() {
        let dir = std::env::temp_dir().join(format!(
            "bbsweep_load_test_{}",
            std::process::id(),
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        let log = dir.join("results.log");
        let contents = "\
p.rcp, 12, 8, 5, 1.0, Fujita
p.rcp, 12, 8, 5
not a record at all
p.rcp, 12, 8, -2, 60.0, Fujita

p.rcp, 13, 8, 6, 2.0, Fujita
";
        fs::write(&log, contents).expect("write log");
        let outcome = load_log(&log).expect("load");
        assert_eq!(outcome.records, 3);
        assert_eq!(outcome.malformed, 2);
        assert_eq!(outcome.index.node_counts(), vec![12, 13]);
        let bucket = outcome.index.bucket(12, "Fujita", 8).expect("bucket");
        assert_eq!(bucket.completion_pct(), Some(50.0));
        let _ = fs::remove_dir_all(dir);
    }
}
