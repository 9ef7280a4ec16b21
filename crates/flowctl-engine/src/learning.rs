//! MAC learning
//!
//! Per-switch `MAC -> port` tables fed by every packet-in. Known destinations
//! get a priority-1 `eth_dst` rule so later packets stay in the datapath;
//! unknown destinations are flooded without installing anything. Entries never
//! age out, a table lives exactly as long as the switch session: it is created
//! by `attach` on connect, and a write from any other session is refused.

use flowctl_core::{Dpid, MacAddr, PortNo};
use flowctl_network::openflow::format_dpid;
use flowctl_network::{FlowAction, FlowMatch, FlowMod, PacketIn, PacketOut, ParsedPacket};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::SwitchSession;
use crate::{LEARNED_PRIORITY, TABLE_MISS_PRIORITY};

/// What the learning stage did with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    /// Control-plane or reserved multicast frame, neither learned nor forwarded
    Ignored,
    /// Destination unknown, sent out every port but the ingress
    Flood,
    /// Destination known, rule installed and packet sent to the port
    Unicast(PortNo),
    /// The session was replaced or closed while the packet was in flight
    Stale,
}

/// Result of recording a source address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    New,
    /// Same port as before
    Refreshed,
    Moved { from: PortNo },
    /// No table for this session; nothing recorded
    Stale,
}

#[derive(Debug)]
struct SwitchTable {
    session_id: Uuid,
    macs: HashMap<MacAddr, PortNo>,
}

#[derive(Debug, Default)]
pub struct MacLearning {
    tables: Mutex<HashMap<Dpid, SwitchTable>>,
}

impl MacLearning {
    pub fn new() -> Self {
        Self::default()
    }

    /// Priority-0 catch-all sending unmatched packets to the controller unbuffered
    pub fn table_miss_rule() -> FlowMod {
        FlowMod::apply(
            TABLE_MISS_PRIORITY,
            FlowMatch::any(),
            vec![FlowAction::controller()],
        )
    }

    pub fn install_table_miss(&self, session: &SwitchSession) -> bool {
        match session.channel.install_flow(Self::table_miss_rule()) {
            Ok(()) => {
                info!(dpid = %format_dpid(session.dpid), "Installed table-miss rule");
                true
            }
            Err(e) => {
                warn!(
                    dpid = %format_dpid(session.dpid),
                    error = %e,
                    "Failed to install table-miss rule: {}",
                    e.suggestion()
                );
                false
            }
        }
    }

    /// Start an empty table owned by `session`. Returns the number of entries
    /// dropped from the table of the session it replaces.
    pub async fn attach(&self, session: &SwitchSession) -> usize {
        let fresh = SwitchTable {
            session_id: session.session_id,
            macs: HashMap::new(),
        };
        self.tables
            .lock()
            .await
            .insert(session.dpid, fresh)
            .map_or(0, |old| old.macs.len())
    }

    /// Drop the table of a closing session. A table already taken over by a
    /// newer session is left alone. Returns the number of entries removed.
    pub async fn detach(&self, dpid: Dpid, session_id: Uuid) -> usize {
        let mut tables = self.tables.lock().await;
        if !tables.get(&dpid).is_some_and(|t| t.session_id == session_id) {
            return 0;
        }
        tables.remove(&dpid).map_or(0, |t| t.macs.len())
    }

    /// Record where `mac` was last seen on the session's switch
    pub async fn learn(&self, session: &SwitchSession, mac: MacAddr, port: PortNo) -> Learned {
        let mut tables = self.tables.lock().await;
        let table = match tables.get_mut(&session.dpid) {
            Some(table) if table.session_id == session.session_id => table,
            _ => {
                debug!(
                    dpid = %format_dpid(session.dpid),
                    session_id = %session.session_id,
                    %mac,
                    "Not learning for a replaced session"
                );
                return Learned::Stale;
            }
        };
        match table.macs.insert(mac, port) {
            None => Learned::New,
            Some(previous) if previous == port => Learned::Refreshed,
            Some(previous) => {
                debug!(dpid = %format_dpid(session.dpid), %mac, from = previous, to = port, "MAC moved");
                Learned::Moved { from: previous }
            }
        }
    }

    pub async fn lookup(&self, dpid: Dpid, mac: MacAddr) -> Option<PortNo> {
        self.tables.lock().await.get(&dpid)?.macs.get(&mac).copied()
    }

    pub async fn len(&self, dpid: Dpid) -> usize {
        self.tables
            .lock()
            .await
            .get(&dpid)
            .map_or(0, |table| table.macs.len())
    }

    /// Whether the learning stage skips this frame entirely
    pub fn ignores(pkt: &ParsedPacket) -> bool {
        pkt.is_lldp() || pkt.eth.dst.is_reserved_multicast()
    }

    /// Learn the source of a packet-in, then forward it
    pub async fn handle_packet(
        &self,
        session: &SwitchSession,
        pin: &PacketIn,
        pkt: &ParsedPacket,
    ) -> ForwardDecision {
        if Self::ignores(pkt) {
            return ForwardDecision::Ignored;
        }
        if self.learn(session, pkt.eth.src, pin.in_port).await == Learned::Stale {
            return ForwardDecision::Stale;
        }
        self.forward(session, pin, pkt).await
    }

    /// Forward a packet whose source is already learned: unicast with a
    /// priority-1 rule when the destination is known, flood otherwise
    pub async fn forward(
        &self,
        session: &SwitchSession,
        pin: &PacketIn,
        pkt: &ParsedPacket,
    ) -> ForwardDecision {
        let dpid = session.dpid;
        let in_port = pin.in_port;
        let (src, dst) = (pkt.eth.src, pkt.eth.dst);

        match self.lookup(dpid, dst).await {
            Some(port) => {
                debug!(dpid = %format_dpid(dpid), %src, %dst, in_port, out_port = port, "Unicast");
                let rule = FlowMod::apply(
                    LEARNED_PRIORITY,
                    FlowMatch::any().with_eth_dst(dst),
                    vec![FlowAction::output(port)],
                )
                .with_buffer_id(pin.buffer_id);
                if let Err(e) = session.channel.install_flow(rule) {
                    warn!(dpid = %format_dpid(dpid), %dst, error = %e, "Failed to install learned rule");
                }
                // a buffered packet is released by the rule itself
                if pin.buffer_id.is_none() {
                    send(session, PacketOut::for_packet_in(pin, vec![FlowAction::output(port)]));
                }
                ForwardDecision::Unicast(port)
            }
            None => {
                debug!(dpid = %format_dpid(dpid), %src, %dst, in_port, "Flood");
                send(session, PacketOut::for_packet_in(pin, vec![FlowAction::flood()]));
                ForwardDecision::Flood
            }
        }
    }
}

fn send(session: &SwitchSession, packet_out: PacketOut) {
    if let Err(e) = session.channel.packet_out(packet_out) {
        warn!(dpid = %format_dpid(session.dpid), error = %e, "Packet-out failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SwitchSession;
    use flowctl_network::openflow::{OFPP_CONTROLLER, OFPP_FLOOD};
    use flowctl_network::packet::{build, ETH_TYPE_LLDP};
    use flowctl_network::{SimulatedSwitch, SwitchFeatures};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    const HOST_A: MacAddr = MacAddr::new(0, 0, 0, 0, 0, 0xaa);
    const HOST_B: MacAddr = MacAddr::new(0, 0, 0, 0, 0, 0xbb);

    fn session_for(dpid: Dpid) -> (Arc<SimulatedSwitch>, SwitchSession) {
        let sw = Arc::new(SimulatedSwitch::new(dpid));
        let features = SwitchFeatures {
            dpid,
            n_tables: 1,
            capabilities: 0,
        };
        let session = SwitchSession::new(&features, sw.clone());
        (sw, session)
    }

    /// Learning state with switch 1 attached
    async fn setup() -> (MacLearning, Arc<SimulatedSwitch>, SwitchSession) {
        let learning = MacLearning::new();
        let (sw, session) = session_for(1);
        learning.attach(&session).await;
        (learning, sw, session)
    }

    fn frame(dst: MacAddr, src: MacAddr) -> Vec<u8> {
        build::icmp_echo(dst, src, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
    }

    async fn deliver(
        learning: &MacLearning,
        session: &SwitchSession,
        in_port: PortNo,
        data: Vec<u8>,
        buffer_id: Option<u32>,
    ) -> ForwardDecision {
        let mut pin = PacketIn::new(in_port, data);
        pin.buffer_id = buffer_id;
        let pkt = ParsedPacket::parse(&pin.data).unwrap();
        learning.handle_packet(session, &pin, &pkt).await
    }

    #[test]
    fn test_table_miss_rule() {
        let rule = MacLearning::table_miss_rule();
        assert_eq!(rule.priority, 0);
        assert!(rule.match_fields.is_wildcard());
        assert_eq!(rule.actions()[0].output_port(), Some(OFPP_CONTROLLER));
    }

    #[tokio::test]
    async fn test_unknown_destination_floods_without_rule() {
        let (learning, sw, session) = setup().await;

        let decision = deliver(&learning, &session, 1, frame(HOST_B, HOST_A), None).await;
        assert_eq!(decision, ForwardDecision::Flood);
        assert_eq!(learning.lookup(1, HOST_A).await, Some(1));
        assert!(sw.flows().is_empty());
        assert_eq!(sw.packet_outs()[0].output_ports(), vec![OFPP_FLOOD]);
    }

    #[tokio::test]
    async fn test_known_destination_installs_rule_and_sends() {
        let (learning, sw, session) = setup().await;
        learning.learn(&session, HOST_A, 1).await;

        let decision = deliver(&learning, &session, 2, frame(HOST_A, HOST_B), None).await;
        assert_eq!(decision, ForwardDecision::Unicast(1));

        let flows = sw.flows();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].priority, 1);
        assert_eq!(flows[0].match_fields, FlowMatch::any().with_eth_dst(HOST_A));
        assert_eq!(sw.packet_outs()[0].output_ports(), vec![1]);
    }

    #[tokio::test]
    async fn test_buffered_packet_is_released_by_rule() {
        let (learning, sw, session) = setup().await;
        learning.learn(&session, HOST_A, 1).await;

        deliver(&learning, &session, 2, frame(HOST_A, HOST_B), Some(77)).await;
        assert!(sw.packet_outs().is_empty());
        assert_eq!(sw.flows().len(), 1);
    }

    #[tokio::test]
    async fn test_relearn_overwrites_port() {
        let (learning, _sw, session) = setup().await;
        assert_eq!(learning.learn(&session, HOST_A, 1).await, Learned::New);
        assert_eq!(learning.learn(&session, HOST_A, 1).await, Learned::Refreshed);
        assert_eq!(learning.len(1).await, 1);
        assert_eq!(
            learning.learn(&session, HOST_A, 4).await,
            Learned::Moved { from: 1 }
        );
        assert_eq!(learning.lookup(1, HOST_A).await, Some(4));
        assert_eq!(learning.len(1).await, 1);

        // tables are per switch
        assert_eq!(learning.lookup(2, HOST_A).await, None);
    }

    #[tokio::test]
    async fn test_detach_only_drops_own_table() {
        let (learning, _sw, one) = setup().await;
        let (_sw2, two) = session_for(2);
        learning.attach(&two).await;
        learning.learn(&one, HOST_A, 1).await;
        learning.learn(&one, HOST_B, 2).await;
        learning.learn(&two, HOST_A, 3).await;

        assert_eq!(learning.detach(1, Uuid::new_v4()).await, 0);
        assert_eq!(learning.detach(1, one.session_id).await, 2);
        assert_eq!(learning.lookup(1, HOST_A).await, None);
        assert_eq!(learning.lookup(2, HOST_A).await, Some(3));
    }

    #[tokio::test]
    async fn test_replaced_session_cannot_write() {
        let (learning, sw, old) = setup().await;
        learning.learn(&old, HOST_A, 1).await;

        let (_sw, new) = session_for(1);
        assert_eq!(learning.attach(&new).await, 1);
        assert_eq!(learning.len(1).await, 0);

        // a packet of the old session still in flight after the reconnect
        let decision = deliver(&learning, &old, 3, frame(HOST_A, HOST_B), None).await;
        assert_eq!(decision, ForwardDecision::Stale);
        assert_eq!(learning.learn(&old, HOST_B, 3).await, Learned::Stale);
        assert_eq!(learning.len(1).await, 0);
        assert!(sw.packet_outs().is_empty());

        // and nothing is recorded once the switch is gone
        learning.detach(1, new.session_id).await;
        assert_eq!(learning.learn(&new, HOST_B, 3).await, Learned::Stale);
        assert_eq!(learning.len(1).await, 0);
    }

    #[tokio::test]
    async fn test_control_frames_are_ignored() {
        let (learning, sw, session) = setup().await;

        let lldp = build::ethernet("01:80:c2:00:00:0e".parse().unwrap(), HOST_A, ETH_TYPE_LLDP, &[0; 8]);
        let v6_mcast = frame("33:33:00:00:00:01".parse().unwrap(), HOST_A);
        for data in [lldp, v6_mcast] {
            let decision = deliver(&learning, &session, 1, data, None).await;
            assert_eq!(decision, ForwardDecision::Ignored);
        }
        assert_eq!(learning.len(1).await, 0);
        assert!(sw.packet_outs().is_empty());
    }
}
