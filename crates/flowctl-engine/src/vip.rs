//! Virtual IP load balancing with proxy ARP
//!
//! - ARP requests for a VIP are answered by the controller with the VIP's MAC
//! - IPv4 flows to a VIP are spread round robin over the backend pool with a
//!   forward NAT rule (VIP -> backend) and a reverse rule (backend -> client)
//! - Backend MACs are resolved from a passive `AddressCache` fed by every
//!   observed ARP sender and IPv4 source

use flowctl_core::{MacAddr, PortNo, VipConfig};
use flowctl_network::openflow::{format_dpid, OFPP_FLOOD};
use flowctl_network::packet::{build_arp_reply, ETH_TYPE_IPV4};
use flowctl_network::{FlowAction, FlowMatch, FlowMod, PacketIn, PacketOut, ParsedPacket};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::learning::MacLearning;
use crate::registry::SwitchSession;
use crate::{VIP_IDLE_TIMEOUT, VIP_PRIORITY};

// ============================================================================
// Address cache
// ============================================================================

/// Passively learned `IP -> MAC` bindings, shared by all switches
#[derive(Debug, Default)]
pub struct AddressCache {
    entries: RwLock<HashMap<Ipv4Addr, MacAddr>>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn observe(&self, ip: Ipv4Addr, mac: MacAddr) {
        if ip.is_unspecified() || ip.is_broadcast() || mac.is_multicast() || mac == MacAddr::ZERO {
            return;
        }
        self.entries.write().await.insert(ip, mac);
    }

    pub async fn resolve(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.entries.read().await.get(&ip).copied()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

// ============================================================================
// VIP mapping
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub ip: Ipv4Addr,
    pub mac: Option<MacAddr>,
}

#[derive(Debug)]
struct Pool {
    backends: Vec<Backend>,
    next: usize,
}

/// Backend picked for one flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    pub ip: Ipv4Addr,
    pub mac: Option<MacAddr>,
}

#[derive(Debug)]
pub struct VipMapping {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pool: Mutex<Pool>,
}

impl VipMapping {
    pub fn new(ip: Ipv4Addr, mac: MacAddr, backends: Vec<Backend>) -> Self {
        Self {
            ip,
            mac,
            pool: Mutex::new(Pool { backends, next: 0 }),
        }
    }

    pub fn from_config(config: &VipConfig) -> Self {
        let backends = config
            .backends
            .iter()
            .map(|b| Backend { ip: b.ip, mac: b.mac })
            .collect();
        Self::new(config.ip, config.mac, backends)
    }

    /// Pick the next backend and resolve its MAC.
    ///
    /// The pointer moves by one under the pool lock, so concurrent flows see
    /// consecutive backends. A MAC found in `cache` is remembered on the
    /// backend. An empty pool selects nothing and leaves the pointer alone.
    pub async fn select(&self, cache: &AddressCache) -> Option<Selection> {
        let mut pool = self.pool.lock().await;
        if pool.backends.is_empty() {
            return None;
        }

        let index = pool.next;
        pool.next = (index + 1) % pool.backends.len();

        let backend = &mut pool.backends[index];
        if backend.mac.is_none() {
            backend.mac = cache.resolve(backend.ip).await;
        }

        Some(Selection {
            index,
            ip: backend.ip,
            mac: backend.mac,
        })
    }

    /// Index the next selection will use
    pub async fn pointer(&self) -> usize {
        self.pool.lock().await.next
    }

    pub async fn backends(&self) -> Vec<Backend> {
        self.pool.lock().await.backends.clone()
    }

    /// Rewrite actions sending a packet for this VIP to `backend`
    fn to_backend(backend_ip: Ipv4Addr, backend_mac: MacAddr, out_port: PortNo) -> Vec<FlowAction> {
        vec![
            FlowAction::SetIpv4Dst { ip: backend_ip },
            FlowAction::SetEthDst { mac: backend_mac },
            FlowAction::output(out_port),
        ]
    }

    /// Forward NAT rule: anything for the VIP goes to the backend
    pub fn forward_rule(&self, backend_ip: Ipv4Addr, backend_mac: MacAddr, out_port: PortNo) -> FlowMod {
        FlowMod::apply(
            VIP_PRIORITY,
            FlowMatch::any()
                .with_eth_type(ETH_TYPE_IPV4)
                .with_ipv4_dst(self.ip),
            Self::to_backend(backend_ip, backend_mac, out_port),
        )
        .with_idle_timeout(VIP_IDLE_TIMEOUT)
    }

    /// Reverse NAT rule: backend replies to `client_ip` appear to come from the VIP
    pub fn reverse_rule(&self, backend_ip: Ipv4Addr, client_ip: Ipv4Addr, client_port: PortNo) -> FlowMod {
        FlowMod::apply(
            VIP_PRIORITY,
            FlowMatch::any()
                .with_eth_type(ETH_TYPE_IPV4)
                .with_ipv4_src(backend_ip)
                .with_ipv4_dst(client_ip),
            vec![
                FlowAction::SetIpv4Src { ip: self.ip },
                FlowAction::SetEthSrc { mac: self.mac },
                FlowAction::output(client_port),
            ],
        )
        .with_idle_timeout(VIP_IDLE_TIMEOUT)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// What the VIP stage did with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VipDecision {
    /// Not ARP for a VIP and not IPv4 to a VIP
    NotHandled,
    /// ARP request for a VIP answered by the controller
    ArpReplied { vip: Ipv4Addr },
    /// Backend MAC unknown, packet flooded unchanged
    Deferred { vip: Ipv4Addr, backend: Ipv4Addr },
    /// NAT rules installed and packet re-sent rewritten
    Balanced { vip: Ipv4Addr, selection: Selection },
    /// VIP has no backends, packet dropped
    NoBackends { vip: Ipv4Addr },
}

impl VipDecision {
    pub fn is_handled(&self) -> bool {
        !matches!(self, VipDecision::NotHandled)
    }
}

#[derive(Debug, Default)]
pub struct VipEngine {
    vips: Vec<VipMapping>,
    cache: AddressCache,
}

impl VipEngine {
    pub fn new(vips: Vec<VipMapping>) -> Self {
        Self {
            vips,
            cache: AddressCache::new(),
        }
    }

    pub fn from_config(configs: &[VipConfig]) -> Self {
        Self::new(configs.iter().map(VipMapping::from_config).collect())
    }

    pub fn vip(&self, ip: Ipv4Addr) -> Option<&VipMapping> {
        self.vips.iter().find(|v| v.ip == ip)
    }

    pub fn vips(&self) -> &[VipMapping] {
        &self.vips
    }

    pub fn cache(&self) -> &AddressCache {
        &self.cache
    }

    /// Feed the address cache from a packet's ARP sender and IPv4 source
    pub async fn observe(&self, pkt: &ParsedPacket) {
        if let Some(ip) = &pkt.ipv4 {
            self.cache.observe(ip.src, pkt.eth.src).await;
        }
        if let Some(arp) = &pkt.arp {
            self.cache.observe(arp.sender_ip, arp.sender_mac).await;
        }
    }

    pub async fn handle_packet(
        &self,
        session: &SwitchSession,
        pin: &PacketIn,
        pkt: &ParsedPacket,
        learning: &MacLearning,
    ) -> VipDecision {
        self.observe(pkt).await;

        if let Some(arp) = pkt.arp.filter(|a| a.is_request()) {
            return match self.vip(arp.target_ip) {
                Some(vip) => {
                    info!(
                        dpid = %format_dpid(session.dpid),
                        vip = %vip.ip,
                        client = %arp.sender_ip,
                        client_mac = %arp.sender_mac,
                        "Answering ARP request for VIP"
                    );
                    let reply = build_arp_reply(vip.mac, vip.ip, arp.sender_mac, arp.sender_ip);
                    send(
                        session,
                        PacketOut::from_controller(reply, vec![FlowAction::output(pin.in_port)]),
                    );
                    VipDecision::ArpReplied { vip: vip.ip }
                }
                None => VipDecision::NotHandled,
            };
        }

        let Some(ip) = pkt.ipv4 else {
            return VipDecision::NotHandled;
        };
        let Some(vip) = self.vip(ip.dst) else {
            return VipDecision::NotHandled;
        };

        let Some(selection) = vip.select(&self.cache).await else {
            warn!(
                dpid = %format_dpid(session.dpid),
                vip = %vip.ip,
                client = %ip.src,
                "VIP has no backends, dropping packet"
            );
            return VipDecision::NoBackends { vip: vip.ip };
        };

        let Some(backend_mac) = selection.mac else {
            info!(
                dpid = %format_dpid(session.dpid),
                vip = %vip.ip,
                backend = %selection.ip,
                "Backend MAC unknown, flooding packet"
            );
            send(session, PacketOut::for_packet_in(pin, vec![FlowAction::flood()]));
            return VipDecision::Deferred {
                vip: vip.ip,
                backend: selection.ip,
            };
        };

        let out_port = learning
            .lookup(session.dpid, backend_mac)
            .await
            .unwrap_or(OFPP_FLOOD);
        let client_ip = ip.src;

        for rule in [
            vip.forward_rule(selection.ip, backend_mac, out_port),
            vip.reverse_rule(selection.ip, client_ip, pin.in_port),
        ] {
            if let Err(e) = session.channel.install_flow(rule) {
                warn!(dpid = %format_dpid(session.dpid), vip = %vip.ip, error = %e, "Failed to install VIP rule");
            }
        }

        // the in-flight packet is flooded once with the rewrite applied
        send(
            session,
            PacketOut::for_packet_in(pin, VipMapping::to_backend(selection.ip, backend_mac, OFPP_FLOOD)),
        );

        info!(
            dpid = %format_dpid(session.dpid),
            client = %client_ip,
            vip = %vip.ip,
            backend = %selection.ip,
            backend_mac = %backend_mac,
            "VIP flow mapped to backend {}",
            selection.index
        );
        debug!(out_port, client_port = pin.in_port, "VIP rules installed");

        VipDecision::Balanced {
            vip: vip.ip,
            selection,
        }
    }
}

fn send(session: &SwitchSession, packet_out: PacketOut) {
    if let Err(e) = session.channel.packet_out(packet_out) {
        warn!(dpid = %format_dpid(session.dpid), error = %e, "Packet-out failed");
    }
}
