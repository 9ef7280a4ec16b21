//! In-memory flow table and a simulated switch
//!
//! `FlowTable` applies flow modifications with switch semantics (same match
//! and priority replaces) and answers highest-priority lookups.
//! `SimulatedSwitch` is a `ControlChannel` that keeps such a table, records
//! packet-outs and stats requests, and can be told to start failing. It lets
//! the controller run end to end without a datapath.

use flowctl_core::{Dpid, PortNo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::of_error::OfError;
use crate::openflow::{FlowMatch, FlowMod, FlowStatsEntry, PacketOut};
use crate::packet::ParsedPacket;
use crate::wire::ControllerMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEntry {
    pub flow_mod: FlowMod,
    pub packet_count: u64,
    pub byte_count: u64,
}

#[derive(Debug, Default, Clone)]
pub struct FlowTable {
    entries: Vec<FlowEntry>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, replacing one with identical match and priority.
    /// Returns true when an existing entry was replaced.
    pub fn apply(&mut self, flow_mod: FlowMod) -> bool {
        let mut flow_mod = flow_mod;
        // the buffer is released once, it is not part of the entry
        flow_mod.buffer_id = None;

        if let Some(existing) = self.entries.iter_mut().find(|e| {
            e.flow_mod.priority == flow_mod.priority && e.flow_mod.match_fields == flow_mod.match_fields
        }) {
            *existing = FlowEntry {
                flow_mod,
                packet_count: 0,
                byte_count: 0,
            };
            return true;
        }

        self.entries.push(FlowEntry {
            flow_mod,
            packet_count: 0,
            byte_count: 0,
        });
        false
    }

    /// Highest-priority entry matching the packet. Among equal priorities the
    /// first installed wins.
    pub fn lookup(&self, in_port: PortNo, pkt: &ParsedPacket) -> Option<&FlowEntry> {
        let mut best: Option<&FlowEntry> = None;
        for entry in &self.entries {
            if !entry.flow_mod.match_fields.matches(in_port, pkt) {
                continue;
            }
            if best.map_or(true, |b| entry.flow_mod.priority > b.flow_mod.priority) {
                best = Some(entry);
            }
        }
        best
    }

    /// Look a packet up and count it against the entry that matched
    pub fn process(&mut self, in_port: PortNo, pkt: &ParsedPacket, len: usize) -> Option<FlowMod> {
        let idx = {
            let hit = self.lookup(in_port, pkt)?;
            self.entries.iter().position(|e| std::ptr::eq(e, hit))?
        };
        let entry = &mut self.entries[idx];
        entry.packet_count += 1;
        entry.byte_count += len as u64;
        Some(entry.flow_mod.clone())
    }

    pub fn find(&self, priority: u16, match_fields: &FlowMatch) -> Option<&FlowEntry> {
        self.entries
            .iter()
            .find(|e| e.flow_mod.priority == priority && &e.flow_mod.match_fields == match_fields)
    }

    pub fn entries(&self) -> &[FlowEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn flow_stats(&self) -> Vec<FlowStatsEntry> {
        self.entries
            .iter()
            .map(|e| FlowStatsEntry {
                table_id: e.flow_mod.table_id,
                priority: e.flow_mod.priority,
                cookie: e.flow_mod.cookie,
                packet_count: e.packet_count,
                byte_count: e.byte_count,
                match_fields: e.flow_mod.match_fields.clone(),
            })
            .collect()
    }
}

/// Switch stand-in that records everything the controller sends it
#[derive(Debug)]
pub struct SimulatedSwitch {
    dpid: Dpid,
    table: Mutex<FlowTable>,
    packet_outs: Mutex<Vec<PacketOut>>,
    stats_requests: Mutex<Vec<ControllerMessage>>,
    reject_flows: AtomicBool,
    closed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedSwitch {
    pub fn new(dpid: Dpid) -> Self {
        Self {
            dpid,
            table: Mutex::new(FlowTable::new()),
            packet_outs: Mutex::new(Vec::new()),
            stats_requests: Mutex::new(Vec::new()),
            reject_flows: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn dpid(&self) -> Dpid {
        self.dpid
    }

    /// Make every following flow modification fail
    pub fn set_reject_flows(&self, reject: bool) {
        self.reject_flows.store(reject, Ordering::SeqCst);
    }

    /// Make every following send fail as if the connection dropped
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn table(&self) -> MutexGuard<'_, FlowTable> {
        lock(&self.table)
    }

    pub fn flows(&self) -> Vec<FlowMod> {
        lock(&self.table)
            .entries()
            .iter()
            .map(|e| e.flow_mod.clone())
            .collect()
    }

    pub fn packet_outs(&self) -> Vec<PacketOut> {
        lock(&self.packet_outs).clone()
    }

    pub fn take_packet_outs(&self) -> Vec<PacketOut> {
        std::mem::take(&mut *lock(&self.packet_outs))
    }

    pub fn stats_requests(&self) -> Vec<ControllerMessage> {
        lock(&self.stats_requests).clone()
    }
}

impl crate::channel::ControlChannel for SimulatedSwitch {
    fn send(&self, msg: ControllerMessage) -> Result<(), OfError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OfError::ChannelClosed(self.dpid));
        }
        match msg {
            ControllerMessage::FlowMod(fm) => {
                if self.reject_flows.load(Ordering::SeqCst) {
                    return Err(OfError::FlowRejected(format!(
                        "priority {} match {}",
                        fm.priority, fm.match_fields
                    )));
                }
                lock(&self.table).apply(fm);
            }
            ControllerMessage::PacketOut(po) => lock(&self.packet_outs).push(po),
            req @ (ControllerMessage::PortStatsRequest { .. }
            | ControllerMessage::FlowStatsRequest { .. }) => lock(&self.stats_requests).push(req),
        }
        Ok(())
    }
}
