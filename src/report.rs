//! Run results output formatting (CSV).

use std::fmt;
use std::io::Write;

use crate::error::Result;
use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Destination,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Source => "source",
            Role::Destination => "destination",
        })
    }
}

/// What one conduit end on one process did during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub rank: usize,
    pub role: Role,
    pub replica: usize,
    pub frames: u64,
    pub elements: u64,
    /// Elements (or tags) that did not hold the expected value.
    pub mismatches: u64,
}

/// Write per-process results as CSV, sorted by rank then role.
///
/// Format:
/// ```csv
/// Rank,Role,Replica,Frames,Elements,Mismatches
/// 0,source,0,10,250,0
/// 4,destination,0,10,340,0
/// ```
pub fn write_run_csv<W: Write>(reports: &[ProcessReport], writer: &mut W) -> Result<()> {
    let mut rows: Vec<&ProcessReport> = reports.iter().collect();
    rows.sort_by_key(|r| (r.rank, r.role == Role::Destination));

    writeln!(writer, "Rank,Role,Replica,Frames,Elements,Mismatches")?;
    for r in rows {
        writeln!(
            writer,
            "{},{},{},{},{},{}",
            r.rank, r.role, r.replica, r.frames, r.elements, r.mismatches
        )?;
    }
    Ok(())
}

/// Write transfer counters as CSV.
///
/// Format:
/// ```csv
/// Counter,Value
/// frames_inserted,10
/// ```
pub fn write_stats_csv<W: Write>(stats: &StatsSnapshot, writer: &mut W) -> Result<()> {
    writeln!(writer, "Counter,Value")?;
    let rows = [
        ("frames_inserted", stats.frames_inserted),
        ("frames_extracted", stats.frames_extracted),
        ("bytes_sent", stats.bytes_sent),
        ("bytes_received", stats.bytes_received),
        ("remote_transfers", stats.remote_transfers),
        ("local_transfers", stats.local_transfers),
        ("intra_task_transfers", stats.intra_task_transfers),
        ("sequence_errors", stats.sequence_errors),
        ("cancellations", stats.cancellations),
    ];
    for (name, value) in rows {
        writeln!(writer, "{name},{value}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_csv_rows_sorted() {
        let reports = vec![
            ProcessReport {
                rank: 1,
                role: Role::Destination,
                replica: 0,
                frames: 3,
                elements: 6,
                mismatches: 0,
            },
            ProcessReport {
                rank: 0,
                role: Role::Source,
                replica: 0,
                frames: 3,
                elements: 12,
                mismatches: 0,
            },
        ];
        let mut buf = Vec::new();
        write_run_csv(&reports, &mut buf).unwrap();
        let csv = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Rank,Role,Replica,Frames,Elements,Mismatches");
        assert_eq!(lines[1], "0,source,0,3,12,0");
        assert_eq!(lines[2], "1,destination,0,3,6,0");
    }

    #[test]
    fn stats_csv_lists_every_counter() {
        let snapshot = StatsSnapshot {
            frames_inserted: 4,
            ..StatsSnapshot::default()
        };
        let mut buf = Vec::new();
        write_stats_csv(&snapshot, &mut buf).unwrap();
        let csv = String::from_utf8(buf).unwrap();
        assert!(csv.starts_with("Counter,Value\n"));
        assert!(csv.contains("frames_inserted,4\n"));
        assert_eq!(csv.lines().count(), 10);
    }
}
