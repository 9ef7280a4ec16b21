//! End-to-end controller scenarios against simulated switches

use chrono::{TimeZone, Utc};
use flowctl_core::{ControllerConfig, Dpid, MacAddr};
use flowctl_engine::{
    ControlEvent, Controller, EventOutcome, FirewallRuleSet, ForwardDecision, MemorySink,
    PacketDisposition, SwitchSession, VipDecision, VipEngine, VipMapping,
};
use flowctl_engine::vip::Backend;
use flowctl_network::openflow::{OFPP_CONTROLLER, OFPP_FLOOD};
use flowctl_network::packet::{build, ARP_REPLY};
use flowctl_network::{FlowMatch, PacketIn, ParsedPacket, PortStats, SimulatedSwitch, SwitchFeatures};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;

const ICMP_DROP: &str = r#"[{"eth_type": 2048, "ip_proto": 1}]"#;

const VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 100);
const VIP_MAC: MacAddr = MacAddr::new(0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee);
const SRV1: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
const SRV2: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 2);
const SRV1_MAC: MacAddr = MacAddr::new(0, 0, 0, 0, 1, 1);
const SRV2_MAC: MacAddr = MacAddr::new(0, 0, 0, 0, 1, 2);

const HOST_AA: MacAddr = MacAddr::new(0, 0, 0, 0, 0, 0xaa);
const HOST_BB: MacAddr = MacAddr::new(0, 0, 0, 0, 0, 0xbb);

struct Harness {
    controller: Controller,
    sink: Arc<MemorySink>,
}

impl Harness {
    fn new(rules: &str) -> Self {
        let sink = Arc::new(MemorySink::new());
        let controller = Controller::new(
            FirewallRuleSet::from_json_str(rules),
            VipEngine::from_config(&ControllerConfig::default().vips),
            sink.clone(),
        );
        Self { controller, sink }
    }

    async fn connect(&self, dpid: Dpid) -> (Arc<SimulatedSwitch>, SwitchSession) {
        let sw = Arc::new(SimulatedSwitch::new(dpid));
        let session = self.connect_to(&sw).await;
        (sw, session)
    }

    async fn connect_to(&self, sw: &Arc<SimulatedSwitch>) -> SwitchSession {
        let features = SwitchFeatures {
            dpid: sw.dpid(),
            n_tables: 254,
            capabilities: 0,
        };
        let session = SwitchSession::new(&features, sw.clone());
        self.controller
            .dispatch(ControlEvent::SwitchConnected(session.clone()))
            .await;
        session
    }

    async fn packet(&self, session: &SwitchSession, in_port: u32, data: Vec<u8>) -> PacketDisposition {
        let event = ControlEvent::PacketIn {
            dpid: session.dpid,
            session_id: session.session_id,
            packet: PacketIn::new(in_port, data),
        };
        match self.controller.dispatch(event).await {
            EventOutcome::Packet(disposition) => disposition,
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}

fn http_syn(dst: MacAddr, src: MacAddr) -> Vec<u8> {
    build::tcp_syn(dst, src, Ipv4Addr::new(10, 0, 2, 1), Ipv4Addr::new(10, 0, 2, 2), 40000, 80)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn scenario_connect_installs_table_miss_and_firewall() {
    let h = Harness::new(ICMP_DROP);
    let (sw, _) = h.connect(1).await;

    let table = sw.table();
    let miss = table.find(0, &FlowMatch::any()).expect("table-miss rule");
    assert_eq!(miss.flow_mod.actions()[0].output_port(), Some(OFPP_CONTROLLER));

    let icmp = FlowMatch {
        eth_type: Some(0x0800),
        ip_proto: Some(1),
        ..FlowMatch::default()
    };
    let drop = table.find(100, &icmp).expect("ICMP drop rule");
    assert!(drop.flow_mod.is_drop());
}

#[tokio::test]
async fn scenario_unknown_destination_floods_and_learns() {
    let h = Harness::new("[]");
    let (sw, session) = h.connect(1).await;

    let disposition = h.packet(&session, 1, http_syn(HOST_BB, HOST_AA)).await;
    assert_eq!(disposition, PacketDisposition::Forwarded(ForwardDecision::Flood));
    assert_eq!(sw.packet_outs()[0].output_ports(), vec![OFPP_FLOOD]);
    assert_eq!(h.controller.learning().lookup(1, HOST_AA).await, Some(1));
}

#[tokio::test]
async fn scenario_known_destination_unicasts_and_installs_rule() {
    let h = Harness::new("[]");
    let (sw, session) = h.connect(1).await;
    h.packet(&session, 1, http_syn(HOST_BB, HOST_AA)).await;
    sw.take_packet_outs();

    let disposition = h.packet(&session, 2, http_syn(HOST_AA, HOST_BB)).await;
    assert_eq!(disposition, PacketDisposition::Forwarded(ForwardDecision::Unicast(1)));
    assert_eq!(sw.packet_outs()[0].output_ports(), vec![1]);

    let table = sw.table();
    let rule = table
        .find(1, &FlowMatch::any().with_eth_dst(HOST_AA))
        .expect("learned rule");
    assert_eq!(rule.flow_mod.actions()[0].output_port(), Some(1));
}

#[tokio::test]
async fn scenario_arp_for_vip_is_answered() {
    let h = Harness::new("[]");
    let (sw, session) = h.connect(1).await;

    let req = build::arp_request(HOST_AA, Ipv4Addr::new(10, 0, 1, 10), VIP);
    let disposition = h.packet(&session, 4, req).await;
    assert_eq!(disposition, PacketDisposition::Vip(VipDecision::ArpReplied { vip: VIP }));

    let out = &sw.packet_outs()[0];
    assert_eq!(out.output_ports(), vec![4]);
    let reply = ParsedPacket::parse(&out.data).unwrap();
    let arp = reply.arp.unwrap();
    assert_eq!(arp.opcode, ARP_REPLY);
    assert_eq!(arp.sender_mac, VIP_MAC);
    assert_eq!(arp.sender_ip, VIP);
}

#[tokio::test]
async fn scenario_consecutive_vip_flows_rotate_backends() {
    let h = Harness::new("[]");
    let (_, session) = h.connect(1).await;

    // backends announce themselves so their MACs are known
    h.packet(&session, 5, build::arp_request(SRV1_MAC, SRV1, Ipv4Addr::new(10, 0, 1, 254))).await;
    h.packet(&session, 6, build::arp_request(SRV2_MAC, SRV2, Ipv4Addr::new(10, 0, 1, 254))).await;

    let mut picked = Vec::new();
    for (i, client) in [Ipv4Addr::new(10, 0, 1, 10), Ipv4Addr::new(10, 0, 1, 11)]
        .into_iter()
        .enumerate()
    {
        let client_mac = MacAddr::new(0, 0, 0, 0, 2, i as u8);
        let data = build::tcp_syn(VIP_MAC, client_mac, client, VIP, 40000, 80);
        match h.packet(&session, 1 + i as u32, data).await {
            PacketDisposition::Vip(VipDecision::Balanced { selection, .. }) => {
                picked.push((selection.index, selection.ip))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(picked, vec![(0, SRV1), (1, SRV2)]);
}

#[tokio::test]
async fn scenario_port_rates() {
    let h = Harness::new("[]");
    let stats = |rx_bytes| PortStats {
        port_no: 1,
        rx_packets: 0,
        tx_packets: 0,
        rx_bytes,
        tx_bytes: 0,
    };
    let t0 = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
    let t2 = Utc.timestamp_opt(1_700_000_002, 0).single().unwrap();

    let telemetry = h.controller.telemetry();
    let first = telemetry.handle_port_stats(1, &[stats(1000)], t0).await;
    assert!(first[0].rate.is_none());
    let second = telemetry.handle_port_stats(1, &[stats(3000)], t2).await;
    assert_eq!(second[0].rate.unwrap().rx_bps, 8000.0);

    let rows = h.sink.port_rows(1).await;
    assert_eq!(rows.len(), 2);
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn firewall_rule_beats_learning_and_vip_rules_in_switch() {
    let rules = r#"[{"eth_type": 2048, "ip_proto": 6, "tcp_dst": 80}]"#;
    let h = Harness::new(rules);
    let (sw, session) = h.connect(1).await;

    // learned rule for HOST_AA plus VIP NAT rules on the same switch
    h.packet(&session, 1, build::arp_request(HOST_AA, Ipv4Addr::new(10, 0, 2, 1), Ipv4Addr::new(10, 0, 2, 9))).await;
    let to_aa = build::icmp_echo(HOST_AA, HOST_BB, Ipv4Addr::new(10, 0, 2, 2), Ipv4Addr::new(10, 0, 2, 1));
    h.packet(&session, 2, to_aa).await;
    h.packet(&session, 5, build::arp_request(SRV1_MAC, SRV1, Ipv4Addr::new(10, 0, 1, 254))).await;
    let https = build::tcp_syn(VIP_MAC, HOST_BB, Ipv4Addr::new(10, 0, 1, 10), VIP, 40000, 443);
    assert!(matches!(
        h.packet(&session, 3, https).await,
        PacketDisposition::Vip(VipDecision::Balanced { .. })
    ));
    assert!(sw.table().find(1, &FlowMatch::any().with_eth_dst(HOST_AA)).is_some());
    assert_eq!(sw.flows().iter().filter(|f| f.priority == 10).count(), 2);

    for data in [
        http_syn(HOST_AA, HOST_BB),
        build::tcp_syn(VIP_MAC, HOST_BB, Ipv4Addr::new(10, 0, 1, 10), VIP, 40000, 80),
    ] {
        let pkt = ParsedPacket::parse(&data).unwrap();
        let hit = sw.table().lookup(2, &pkt).map(|e| e.flow_mod.clone()).unwrap();
        assert_eq!(hit.priority, 100);
        assert!(hit.is_drop());

        // and the controller refuses to forward it too
        assert!(matches!(
            h.packet(&session, 2, data).await,
            PacketDisposition::Dropped { .. }
        ));
    }
}

#[tokio::test]
async fn round_robin_is_fair_from_any_start() {
    for n in 1..=4usize {
        let backends = (0..n)
            .map(|i| Backend {
                ip: Ipv4Addr::new(10, 0, 1, i as u8 + 1),
                mac: None,
            })
            .collect();
        let vip = VipMapping::new(VIP, VIP_MAC, backends);
        let cache = flowctl_engine::AddressCache::new();

        // leave the pointer somewhere in the middle first
        vip.select(&cache).await;

        for k in 0..=11usize {
            let start = vip.pointer().await;
            let mut counts = vec![0usize; n];
            let mut order = Vec::new();
            for _ in 0..k {
                let sel = vip.select(&cache).await.unwrap();
                counts[sel.index] += 1;
                order.push(sel.index);
            }
            for c in &counts {
                assert!(*c == k / n || *c == k.div_ceil(n), "n={} k={} counts={:?}", n, k, counts);
            }
            let expected: Vec<usize> = (0..k).map(|j| (start + j) % n).collect();
            assert_eq!(order, expected);
        }
    }
}

#[tokio::test]
async fn reinstall_replaces_instead_of_duplicating() {
    let h = Harness::new(ICMP_DROP);
    let sw = Arc::new(SimulatedSwitch::new(1));
    let first = h.connect_to(&sw).await;
    let second = h.connect_to(&sw).await;
    assert_ne!(first.session_id, second.session_id);
    assert_eq!(sw.flows().len(), 2);

    // the same VIP flow twice reissues both NAT rules
    h.packet(&second, 5, build::arp_request(SRV1_MAC, SRV1, Ipv4Addr::new(10, 0, 1, 254))).await;
    h.packet(&second, 6, build::arp_request(SRV2_MAC, SRV2, Ipv4Addr::new(10, 0, 1, 254))).await;
    let flow = build::tcp_syn(VIP_MAC, HOST_AA, Ipv4Addr::new(10, 0, 1, 10), VIP, 40000, 80);
    for _ in 0..4 {
        h.packet(&second, 1, flow.clone()).await;
    }
    let vip_rules: Vec<_> = sw.flows().into_iter().filter(|f| f.priority == 10).collect();
    // one forward rule plus one reverse rule per backend
    assert_eq!(vip_rules.len(), 3);
}

#[tokio::test]
async fn reconnect_purges_previous_session_state() {
    let h = Harness::new("[]");
    let sw = Arc::new(SimulatedSwitch::new(1));
    let first = h.connect_to(&sw).await;
    h.packet(&first, 1, http_syn(HOST_BB, HOST_AA)).await;
    assert_eq!(h.controller.learning().len(1).await, 1);

    let second = h.connect_to(&sw).await;
    assert_eq!(h.controller.learning().len(1).await, 0);

    // the old connection's events no longer count
    let stale = ControlEvent::PacketIn {
        dpid: 1,
        session_id: first.session_id,
        packet: PacketIn::new(1, http_syn(HOST_BB, HOST_AA)),
    };
    assert_eq!(h.controller.dispatch(stale).await, EventOutcome::Stale);
    assert_eq!(h.controller.learning().len(1).await, 0);
    assert!(h.controller.registry().is_current(1, second.session_id).await);
}

#[tokio::test]
async fn vip_traffic_still_teaches_the_client_port() {
    let h = Harness::new("[]");
    let (sw, session) = h.connect(1).await;
    let client = Ipv4Addr::new(10, 0, 1, 10);

    let req = build::arp_request(HOST_AA, client, VIP);
    assert_eq!(
        h.packet(&session, 3, req).await,
        PacketDisposition::Vip(VipDecision::ArpReplied { vip: VIP })
    );
    assert_eq!(h.controller.learning().lookup(1, HOST_AA).await, Some(3));

    // a SYN from another port, balanced to a backend whose MAC is unknown
    let syn = build::tcp_syn(VIP_MAC, HOST_BB, Ipv4Addr::new(10, 0, 1, 11), VIP, 40000, 80);
    assert!(matches!(
        h.packet(&session, 4, syn).await,
        PacketDisposition::Vip(VipDecision::Deferred { .. })
    ));
    assert_eq!(h.controller.learning().lookup(1, HOST_BB).await, Some(4));

    // traffic back to the client is now unicast instead of flooded
    sw.take_packet_outs();
    let reply = build::tcp_syn(HOST_AA, SRV1_MAC, SRV1, client, 80, 40000);
    assert_eq!(
        h.packet(&session, 5, reply).await,
        PacketDisposition::Forwarded(ForwardDecision::Unicast(3))
    );
}

#[tokio::test]
async fn packet_in_flight_across_reconnect_is_not_learned() {
    let h = Harness::new("[]");
    let sw = Arc::new(SimulatedSwitch::new(1));
    let first = h.connect_to(&sw).await;

    // the old connection passed its session check, then the switch reconnected
    let second = h.connect_to(&sw).await;
    let pin = PacketIn::new(1, http_syn(HOST_BB, HOST_AA));
    let disposition = h.controller.packet_in(&first, &pin).await;

    assert_eq!(disposition, PacketDisposition::Stale);
    assert_eq!(h.controller.learning().lookup(1, HOST_AA).await, None);
    assert_eq!(h.controller.learning().len(1).await, 0);

    // the live session learns normally
    h.packet(&second, 2, http_syn(HOST_BB, HOST_AA)).await;
    assert_eq!(h.controller.learning().lookup(1, HOST_AA).await, Some(2));
}

#[tokio::test]
async fn stale_disconnect_leaves_live_session_alone() {
    let h = Harness::new("[]");
    let sw = Arc::new(SimulatedSwitch::new(1));
    let first = h.connect_to(&sw).await;
    let second = h.connect_to(&sw).await;
    h.packet(&second, 1, http_syn(HOST_BB, HOST_AA)).await;

    let outcome = h
        .controller
        .dispatch(ControlEvent::SwitchDisconnected {
            dpid: 1,
            session_id: first.session_id,
        })
        .await;
    assert_eq!(outcome, EventOutcome::Disconnected { purged: false });
    assert!(h.controller.registry().is_current(1, second.session_id).await);
    assert_eq!(h.controller.learning().lookup(1, HOST_AA).await, Some(1));
}

#[tokio::test]
async fn truncated_frames_leave_no_trace() {
    let h = Harness::new(ICMP_DROP);
    let (sw, session) = h.connect(1).await;
    let flows = sw.flows();

    let frame = http_syn(HOST_BB, HOST_AA);
    for len in [0, 6, 13, 20, 33] {
        let disposition = h.packet(&session, 1, frame[..len].to_vec()).await;
        assert_eq!(disposition, PacketDisposition::Malformed, "len {}", len);
    }
    assert_eq!(sw.flows(), flows);
    assert!(sw.packet_outs().is_empty());
    assert_eq!(h.controller.learning().len(1).await, 0);
    assert_eq!(h.controller.vips().cache().len().await, 0);
}

/// Inbound events queue without bound: a burst queued before the dispatcher
/// runs is processed in full, none are dropped or refused.
#[tokio::test]
async fn packet_in_burst_is_queued_without_backpressure() {
    let h = Harness::new("[]");
    let sw = Arc::new(SimulatedSwitch::new(1));
    let features = SwitchFeatures {
        dpid: 1,
        n_tables: 1,
        capabilities: 0,
    };
    let session = SwitchSession::new(&features, sw.clone());

    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(ControlEvent::SwitchConnected(session.clone())).unwrap();
    const BURST: usize = 5_000;
    for _ in 0..BURST {
        let broadcast = build::arp_request(HOST_AA, Ipv4Addr::new(10, 0, 2, 1), Ipv4Addr::new(10, 0, 2, 9));
        tx.send(ControlEvent::PacketIn {
            dpid: 1,
            session_id: session.session_id,
            packet: PacketIn::new(1, broadcast),
        })
        .unwrap();
    }
    drop(tx);

    let processed = h.controller.process_events(rx).await;
    assert_eq!(processed, BURST + 1);
    assert_eq!(sw.packet_outs().len(), BURST);
}
