//! Telemetry collector
//!
//! Polls every connected switch for port and flow counters on a fixed
//! interval, turns consecutive port samples into bps/pps rates and appends the
//! results to a `TelemetrySink`.

use chrono::{DateTime, Utc};
use flowctl_core::{Dpid, PortNo};
use flowctl_network::openflow::{format_dpid, is_reserved_port};
use flowctl_network::{ControllerMessage, FlowStatsEntry, PortStats};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::registry::SessionRegistry;
use crate::sink::{FlowRow, PortRow, RateRecord, TelemetrySink};

/// Smallest elapsed time used as a rate denominator, in seconds
pub const MIN_ELAPSED_SECS: f64 = 1e-9;

/// Counters of one port at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

impl TelemetrySample {
    pub fn from_stats(stats: &PortStats, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            rx_bytes: stats.rx_bytes,
            tx_bytes: stats.tx_bytes,
            rx_packets: stats.rx_packets,
            tx_packets: stats.tx_packets,
        }
    }

    /// Rates between `prev` and this sample. `None` when any counter went
    /// backwards.
    pub fn rate_since(&self, prev: &TelemetrySample) -> Option<RateRecord> {
        let rx_bytes = self.rx_bytes.checked_sub(prev.rx_bytes)?;
        let tx_bytes = self.tx_bytes.checked_sub(prev.tx_bytes)?;
        let rx_packets = self.rx_packets.checked_sub(prev.rx_packets)?;
        let tx_packets = self.tx_packets.checked_sub(prev.tx_packets)?;

        let elapsed = (self.timestamp - prev.timestamp)
            .num_nanoseconds()
            .map_or(f64::MAX, |ns| ns as f64 / 1e9)
            .max(MIN_ELAPSED_SECS);

        Some(RateRecord {
            rx_bps: 8.0 * rx_bytes as f64 / elapsed,
            tx_bps: 8.0 * tx_bytes as f64 / elapsed,
            rx_pps: rx_packets as f64 / elapsed,
            tx_pps: tx_packets as f64 / elapsed,
        })
    }
}

pub struct TelemetryCollector {
    baselines: Mutex<HashMap<Dpid, HashMap<PortNo, TelemetrySample>>>,
    sink: Arc<dyn TelemetrySink>,
}

impl TelemetryCollector {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            baselines: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Send port and flow stats requests to every connected switch.
    /// Returns how many switches were asked.
    pub async fn poll_once(&self, registry: &SessionRegistry) -> usize {
        let mut polled = 0;
        for session in registry.snapshot().await {
            let requests = [
                ControllerMessage::all_port_stats(),
                ControllerMessage::all_flow_stats(),
            ];
            let mut ok = true;
            for req in requests {
                if let Err(e) = session.channel.send(req) {
                    error!(
                        dpid = %format_dpid(session.dpid),
                        error = %e,
                        "Telemetry: stats request failed"
                    );
                    ok = false;
                    break;
                }
            }
            if ok {
                polled += 1;
            }
        }
        debug!("Telemetry: polled {} switches", polled);
        polled
    }

    /// Poll forever every `interval`. The first poll happens immediately.
    pub async fn run(self: Arc<Self>, registry: Arc<SessionRegistry>, interval: Duration) {
        info!("Telemetry: polling every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once(&registry).await;
        }
    }

    /// Turn a port stats reply received at `now` into rows and append them
    pub async fn handle_port_stats(
        &self,
        dpid: Dpid,
        ports: &[PortStats],
        now: DateTime<Utc>,
    ) -> Vec<PortRow> {
        let rows = {
            let mut baselines = self.baselines.lock().await;
            let prev = baselines.entry(dpid).or_default();
            let mut rows = Vec::with_capacity(ports.len());

            for stats in ports {
                if is_reserved_port(stats.port_no) {
                    continue;
                }
                let sample = TelemetrySample::from_stats(stats, now);
                let rate = match prev.insert(stats.port_no, sample) {
                    Some(before) => {
                        let rate = sample.rate_since(&before);
                        if rate.is_none() {
                            debug!(
                                dpid = %format_dpid(dpid),
                                port = stats.port_no,
                                "Counters went backwards, starting new baseline"
                            );
                        }
                        rate
                    }
                    None => None,
                };

                rows.push(PortRow {
                    timestamp: now,
                    dpid,
                    port: stats.port_no,
                    rx_bytes: stats.rx_bytes,
                    tx_bytes: stats.tx_bytes,
                    rx_pkts: stats.rx_packets,
                    tx_pkts: stats.tx_packets,
                    rate,
                });
            }
            rows
        };

        if let Err(e) = self.sink.append_port_rows(dpid, &rows).await {
            warn!(dpid = %format_dpid(dpid), error = %e, "Telemetry: failed to write port rows");
        }
        rows
    }

    /// Turn a flow stats reply into rows, skipping the table-miss entry
    pub async fn handle_flow_stats(
        &self,
        dpid: Dpid,
        flows: &[FlowStatsEntry],
        now: DateTime<Utc>,
    ) -> Vec<FlowRow> {
        let rows: Vec<FlowRow> = flows
            .iter()
            .filter(|f| f.priority != 0)
            .map(|f| FlowRow {
                timestamp: now,
                dpid,
                cookie: f.cookie,
                priority: f.priority,
                packet_count: f.packet_count,
                byte_count: f.byte_count,
                match_desc: serde_json::to_string(&f.match_fields)
                    .unwrap_or_else(|_| f.match_fields.to_string()),
            })
            .collect();

        if let Err(e) = self.sink.append_flow_rows(dpid, &rows).await {
            warn!(dpid = %format_dpid(dpid), error = %e, "Telemetry: failed to write flow rows");
        }
        rows
    }

    /// Forget the rate baselines of a switch
    pub async fn purge(&self, dpid: Dpid) {
        self.baselines.lock().await.remove(&dpid);
    }

    pub async fn has_baseline(&self, dpid: Dpid, port: PortNo) -> bool {
        self.baselines
            .lock()
            .await
            .get(&dpid)
            .is_some_and(|ports| ports.contains_key(&port))
    }
}
