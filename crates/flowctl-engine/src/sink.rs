//! Telemetry sinks
//!
//! Records are appended per switch and per statistic kind. The CSV sink keeps
//! one file per (kind, dpid) under a directory, writes the header once, and
//! leads every row with the schema version.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowctl_core::{Dpid, Error, PortNo, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Version of the record layouts below
pub const SCHEMA_VERSION: u32 = 1;

pub const PORT_HEADER: &[&str] = &[
    "schema_version",
    "timestamp",
    "dpid",
    "port",
    "rx_bytes",
    "tx_bytes",
    "rx_pkts",
    "tx_pkts",
    "rx_bps",
    "tx_bps",
    "rx_pps",
    "tx_pps",
];

pub const FLOW_HEADER: &[&str] = &[
    "schema_version",
    "timestamp",
    "dpid",
    "cookie",
    "priority",
    "packet_count",
    "byte_count",
    "match",
];

/// Rates derived from two consecutive samples of one port
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateRecord {
    pub rx_bps: f64,
    pub tx_bps: f64,
    pub rx_pps: f64,
    pub tx_pps: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortRow {
    pub timestamp: DateTime<Utc>,
    pub dpid: Dpid,
    pub port: PortNo,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_pkts: u64,
    pub tx_pkts: u64,
    /// Absent for the first sample of a port and after a counter reset
    pub rate: Option<RateRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRow {
    pub timestamp: DateTime<Utc>,
    pub dpid: Dpid,
    pub cookie: u64,
    pub priority: u16,
    pub packet_count: u64,
    pub byte_count: u64,
    /// JSON rendering of the match fields
    pub match_desc: String,
}

/// Durable destination for telemetry records
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn append_port_rows(&self, dpid: Dpid, rows: &[PortRow]) -> Result<()>;
    async fn append_flow_rows(&self, dpid: Dpid, rows: &[FlowRow]) -> Result<()>;
}

// ============================================================================
// CSV directory sink
// ============================================================================

#[derive(Debug)]
pub struct CsvDirSink {
    dir: PathBuf,
    // serialises header checks with appends
    write_lock: Mutex<()>,
}

impl CsvDirSink {
    /// Create the sink, creating `dir` if needed
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::sink(format!(
                "cannot create telemetry directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn port_path(&self, dpid: Dpid) -> PathBuf {
        self.dir.join(format!("port_stats_{}.csv", dpid))
    }

    pub fn flow_path(&self, dpid: Dpid) -> PathBuf {
        self.dir.join(format!("flow_stats_{}.csv", dpid))
    }

    async fn append(&self, path: &Path, header: &[&str], lines: Vec<String>) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let needs_header = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };

        let mut buf = String::new();
        if needs_header {
            buf.push_str(&header.join(","));
            buf.push('\n');
        }
        for line in &lines {
            buf.push_str(line);
            buf.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        debug!("Appended {} rows to {}", lines.len(), path.display());
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for CsvDirSink {
    async fn append_port_rows(&self, dpid: Dpid, rows: &[PortRow]) -> Result<()> {
        let lines = rows.iter().map(port_line).collect();
        self.append(&self.port_path(dpid), PORT_HEADER, lines).await
    }

    async fn append_flow_rows(&self, dpid: Dpid, rows: &[FlowRow]) -> Result<()> {
        let lines = rows.iter().map(flow_line).collect();
        self.append(&self.flow_path(dpid), FLOW_HEADER, lines).await
    }
}

/// Seconds since the epoch with microsecond precision
fn epoch_secs(ts: &DateTime<Utc>) -> String {
    format!("{:.6}", ts.timestamp_micros() as f64 / 1_000_000.0)
}

fn rate_field(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_default()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn port_line(row: &PortRow) -> String {
    let rate = row.rate.as_ref();
    [
        SCHEMA_VERSION.to_string(),
        epoch_secs(&row.timestamp),
        row.dpid.to_string(),
        row.port.to_string(),
        row.rx_bytes.to_string(),
        row.tx_bytes.to_string(),
        row.rx_pkts.to_string(),
        row.tx_pkts.to_string(),
        rate_field(rate.map(|r| r.rx_bps)),
        rate_field(rate.map(|r| r.tx_bps)),
        rate_field(rate.map(|r| r.rx_pps)),
        rate_field(rate.map(|r| r.tx_pps)),
    ]
    .join(",")
}

fn flow_line(row: &FlowRow) -> String {
    [
        SCHEMA_VERSION.to_string(),
        epoch_secs(&row.timestamp),
        row.dpid.to_string(),
        row.cookie.to_string(),
        row.priority.to_string(),
        row.packet_count.to_string(),
        row.byte_count.to_string(),
        csv_field(&row.match_desc),
    ]
    .join(",")
}

// ============================================================================
// In-memory sink
// ============================================================================

/// Sink keeping every record in memory, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemorySink {
    ports: Mutex<HashMap<Dpid, Vec<PortRow>>>,
    flows: Mutex<HashMap<Dpid, Vec<FlowRow>>>,
    writes: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn port_rows(&self, dpid: Dpid) -> Vec<PortRow> {
        self.ports.lock().await.get(&dpid).cloned().unwrap_or_default()
    }

    pub async fn flow_rows(&self, dpid: Dpid) -> Vec<FlowRow> {
        self.flows.lock().await.get(&dpid).cloned().unwrap_or_default()
    }

    /// Number of non-empty appends received
    pub async fn writes(&self) -> usize {
        *self.writes.lock().await
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn append_port_rows(&self, dpid: Dpid, rows: &[PortRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.ports
            .lock()
            .await
            .entry(dpid)
            .or_default()
            .extend_from_slice(rows);
        *self.writes.lock().await += 1;
        Ok(())
    }

    async fn append_flow_rows(&self, dpid: Dpid, rows: &[FlowRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.flows
            .lock()
            .await
            .entry(dpid)
            .or_default()
            .extend_from_slice(rows);
        *self.writes.lock().await += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn port_row(port: PortNo, rate: Option<RateRecord>) -> PortRow {
        PortRow {
            timestamp: ts(1_700_000_000),
            dpid: 1,
            port,
            rx_bytes: 3000,
            tx_bytes: 500,
            rx_pkts: 30,
            tx_pkts: 5,
            rate,
        }
    }

    #[test]
    fn test_port_line_format() {
        let first = port_line(&port_row(1, None));
        assert_eq!(first, "1,1700000000.000000,1,1,3000,500,30,5,,,,");

        let rated = port_line(&port_row(
            2,
            Some(RateRecord {
                rx_bps: 8000.0,
                tx_bps: 1333.3333,
                rx_pps: 10.0,
                tx_pps: 0.006,
            }),
        ));
        assert!(rated.ends_with(",8000.00,1333.33,10.00,0.01"), "{}", rated);
    }

    #[test]
    fn test_match_is_quoted() {
        let line = flow_line(&FlowRow {
            timestamp: ts(0),
            dpid: 1,
            cookie: 0,
            priority: 100,
            packet_count: 4,
            byte_count: 392,
            match_desc: r#"{"eth_type":2048,"ip_proto":1}"#.to_string(),
        });
        assert_eq!(
            line,
            r#"1,0.000000,1,0,100,4,392,"{""eth_type"":2048,""ip_proto"":1}""#
        );
    }

    #[tokio::test]
    async fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvDirSink::new(dir.path().join("logs")).await.unwrap();

        sink.append_port_rows(1, &[port_row(1, None)]).await.unwrap();
        sink.append_port_rows(1, &[port_row(1, None), port_row(2, None)])
            .await
            .unwrap();

        let content = std::fs::read_to_string(sink.port_path(1)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], PORT_HEADER.join(","));
        assert_eq!(content.matches("schema_version").count(), 1);
    }

    #[tokio::test]
    async fn test_empty_rows_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvDirSink::new(dir.path()).await.unwrap();
        sink.append_port_rows(7, &[]).await.unwrap();
        sink.append_flow_rows(7, &[]).await.unwrap();
        assert!(!sink.port_path(7).exists());
        assert!(!sink.flow_path(7).exists());
    }

    #[tokio::test]
    async fn test_files_are_per_switch() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvDirSink::new(dir.path()).await.unwrap();
        let mut row = port_row(1, None);
        sink.append_port_rows(1, &[row.clone()]).await.unwrap();
        row.dpid = 2;
        sink.append_port_rows(2, &[row]).await.unwrap();
        assert!(dir.path().join("port_stats_1.csv").exists());
        assert!(dir.path().join("port_stats_2.csv").exists());
    }

    #[tokio::test]
    async fn test_memory_sink_counts_writes() {
        let sink = MemorySink::new();
        sink.append_port_rows(1, &[]).await.unwrap();
        assert_eq!(sink.writes().await, 0);
        sink.append_port_rows(1, &[port_row(1, None)]).await.unwrap();
        assert_eq!(sink.writes().await, 1);
        assert_eq!(sink.port_rows(1).await.len(), 1);
        assert!(sink.flow_rows(1).await.is_empty());
    }
}
