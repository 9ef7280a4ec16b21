//! Controller context and event dispatch
//!
//! `Controller` owns every piece of shared state (session registry, MAC
//! tables, VIP pools, address cache, telemetry baselines). Events enter
//! through `dispatch`, one at a time per switch connection. A packet-in has
//! its source MAC learned, then runs through `PACKET_PIPELINE` in order and
//! the first stage that takes the packet decides its fate.

use chrono::Utc;
use flowctl_core::{ControllerConfig, Dpid};
use flowctl_network::openflow::format_dpid;
use flowctl_network::{FlowMatch, FlowStatsEntry, PacketIn, ParsedPacket, PortStats};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::firewall::FirewallRuleSet;
use crate::learning::{ForwardDecision, Learned, MacLearning};
use crate::registry::{SessionRegistry, SwitchSession};
use crate::sink::TelemetrySink;
use crate::telemetry::TelemetryCollector;
use crate::vip::{VipDecision, VipEngine};

// ============================================================================
// Events
// ============================================================================

/// Everything that can happen on a switch connection
#[derive(Debug, Clone)]
pub enum ControlEvent {
    SwitchConnected(SwitchSession),
    SwitchDisconnected {
        dpid: Dpid,
        session_id: Uuid,
    },
    PacketIn {
        dpid: Dpid,
        session_id: Uuid,
        packet: PacketIn,
    },
    PortStatsReply {
        dpid: Dpid,
        session_id: Uuid,
        ports: Vec<PortStats>,
    },
    FlowStatsReply {
        dpid: Dpid,
        session_id: Uuid,
        flows: Vec<FlowStatsEntry>,
    },
}

/// Result of dispatching one event
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Connected {
        replaced: bool,
        firewall_rules: usize,
        table_miss: bool,
    },
    Disconnected {
        purged: bool,
    },
    Packet(PacketDisposition),
    PortRows(usize),
    FlowRows(usize),
    /// Event from a session that is no longer current
    Stale,
}

// ============================================================================
// Packet pipeline
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Firewall,
    Vip,
    Learning,
}

/// Stages a packet-in visits, highest priority first
pub const PACKET_PIPELINE: [Stage; 3] = [Stage::Firewall, Stage::Vip, Stage::Learning];

#[derive(Debug, Clone, PartialEq)]
pub enum PacketDisposition {
    /// Frame could not be decoded
    Malformed,
    /// Matches a firewall rule
    Dropped { rule: FlowMatch },
    Vip(VipDecision),
    Forwarded(ForwardDecision),
    /// No stage took the packet
    Ignored,
    /// The session was replaced while the packet was queued
    Stale,
}

// ============================================================================
// Controller
// ============================================================================

pub struct Controller {
    registry: Arc<SessionRegistry>,
    learning: MacLearning,
    firewall: FirewallRuleSet,
    vips: VipEngine,
    telemetry: Arc<TelemetryCollector>,
}

impl Controller {
    pub fn new(firewall: FirewallRuleSet, vips: VipEngine, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            learning: MacLearning::new(),
            firewall,
            vips,
            telemetry: Arc::new(TelemetryCollector::new(sink)),
        }
    }

    /// Build from runtime configuration, loading firewall rules from its source
    pub fn from_config(config: &ControllerConfig, sink: Arc<dyn TelemetrySink>) -> Self {
        let firewall = FirewallRuleSet::load(config.rules_source.as_deref());
        let vips = VipEngine::from_config(&config.vips);
        info!(
            firewall_rules = firewall.len(),
            vips = vips.vips().len(),
            "Controller initialized"
        );
        Self::new(firewall, vips, sink)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn learning(&self) -> &MacLearning {
        &self.learning
    }

    pub fn firewall(&self) -> &FirewallRuleSet {
        &self.firewall
    }

    pub fn vips(&self) -> &VipEngine {
        &self.vips
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.telemetry
    }

    pub async fn dispatch(&self, event: ControlEvent) -> EventOutcome {
        match event {
            ControlEvent::SwitchConnected(session) => self.switch_connected(session).await,
            ControlEvent::SwitchDisconnected { dpid, session_id } => {
                self.switch_disconnected(dpid, session_id).await
            }
            ControlEvent::PacketIn {
                dpid,
                session_id,
                packet,
            } => match self.current_session(dpid, session_id).await {
                Some(session) => match self.packet_in(&session, &packet).await {
                    PacketDisposition::Stale => EventOutcome::Stale,
                    disposition => EventOutcome::Packet(disposition),
                },
                None => EventOutcome::Stale,
            },
            ControlEvent::PortStatsReply {
                dpid,
                session_id,
                ports,
            } => {
                if !self.registry.is_current(dpid, session_id).await {
                    return EventOutcome::Stale;
                }
                let rows = self.telemetry.handle_port_stats(dpid, &ports, Utc::now()).await;
                EventOutcome::PortRows(rows.len())
            }
            ControlEvent::FlowStatsReply {
                dpid,
                session_id,
                flows,
            } => {
                if !self.registry.is_current(dpid, session_id).await {
                    return EventOutcome::Stale;
                }
                let rows = self.telemetry.handle_flow_stats(dpid, &flows, Utc::now()).await;
                EventOutcome::FlowRows(rows.len())
            }
        }
    }

    /// Dispatch events in arrival order until every sender is gone.
    /// Returns the number of events processed.
    pub async fn process_events(&self, mut events: mpsc::UnboundedReceiver<ControlEvent>) -> usize {
        let mut processed = 0;
        while let Some(event) = events.recv().await {
            self.dispatch(event).await;
            processed += 1;
        }
        processed
    }

    async fn current_session(&self, dpid: Dpid, session_id: Uuid) -> Option<SwitchSession> {
        self.registry
            .get(dpid)
            .await
            .filter(|s| s.session_id == session_id)
    }

    /// Register the switch, then install firewall rules and the table-miss rule
    async fn switch_connected(&self, session: SwitchSession) -> EventOutcome {
        let dpid = session.dpid;
        let replaced = self.registry.register(session.clone()).await.is_some();
        // a fresh table owned by this session; writes from the old one are refused
        let macs = self.learning.attach(&session).await;
        if replaced {
            self.telemetry.purge(dpid).await;
            debug!(dpid = %format_dpid(dpid), macs, "Purged state of the replaced session");
        }

        let firewall_rules = self.firewall.install(&session);
        let table_miss = self.learning.install_table_miss(&session);

        info!(
            dpid = %format_dpid(dpid),
            firewall_rules,
            table_miss,
            "Switch provisioned"
        );
        EventOutcome::Connected {
            replaced,
            firewall_rules,
            table_miss,
        }
    }

    async fn switch_disconnected(&self, dpid: Dpid, session_id: Uuid) -> EventOutcome {
        let purged = match self.registry.unregister(dpid, session_id).await {
            Some(_) => {
                let macs = self.learning.detach(dpid, session_id).await;
                self.telemetry.purge(dpid).await;
                debug!(dpid = %format_dpid(dpid), macs, "Purged switch state");
                true
            }
            None => false,
        };
        EventOutcome::Disconnected { purged }
    }

    /// Run a packet-in through the pipeline
    pub async fn packet_in(&self, session: &SwitchSession, pin: &PacketIn) -> PacketDisposition {
        let pkt = match ParsedPacket::parse(&pin.data) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(
                    dpid = %format_dpid(session.dpid),
                    in_port = pin.in_port,
                    error = %e,
                    "Discarding malformed packet"
                );
                return PacketDisposition::Malformed;
            }
        };

        // sources are learned whichever stage takes the packet
        if !MacLearning::ignores(&pkt)
            && self.learning.learn(session, pkt.eth.src, pin.in_port).await == Learned::Stale
        {
            return PacketDisposition::Stale;
        }

        for stage in PACKET_PIPELINE {
            if let Some(disposition) = self.run_stage(stage, session, pin, &pkt).await {
                return disposition;
            }
        }
        PacketDisposition::Ignored
    }

    async fn run_stage(
        &self,
        stage: Stage,
        session: &SwitchSession,
        pin: &PacketIn,
        pkt: &ParsedPacket,
    ) -> Option<PacketDisposition> {
        match stage {
            Stage::Firewall => self.firewall.matching_rule(pin.in_port, pkt).map(|rule| {
                warn!(
                    dpid = %format_dpid(session.dpid),
                    in_port = pin.in_port,
                    rule = %rule,
                    "Dropping packet covered by firewall rule"
                );
                PacketDisposition::Dropped { rule: rule.clone() }
            }),
            Stage::Vip => {
                let decision = self
                    .vips
                    .handle_packet(session, pin, pkt, &self.learning)
                    .await;
                decision
                    .is_handled()
                    .then_some(PacketDisposition::Vip(decision))
            }
            Stage::Learning => {
                if MacLearning::ignores(pkt) {
                    return None;
                }
                let decision = self.learning.forward(session, pin, pkt).await;
                Some(PacketDisposition::Forwarded(decision))
            }
        }
    }
}
