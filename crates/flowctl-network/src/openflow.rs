//! OpenFlow-style message model
//!
//! Matches, actions and instructions follow OpenFlow 1.3 field naming
//! (`eth_dst`, `ipv4_src`, `tcp_dst`, ...) so firewall rule documents can use
//! the same keys a switch would. The byte-level encoding of these messages is
//! left to the transport; the engine only ever builds these values.

use flowctl_core::{MacAddr, PortNo};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::packet::{L4Header, ParsedPacket};

// ============================================================================
// Reserved ports
// ============================================================================
/// Highest number usable for a physical port
pub const OFPP_MAX: PortNo = 0xffff_ff00;
pub const OFPP_IN_PORT: PortNo = 0xffff_fff8;
pub const OFPP_NORMAL: PortNo = 0xffff_fffa;
/// All physical ports except the ingress port
pub const OFPP_FLOOD: PortNo = 0xffff_fffb;
pub const OFPP_ALL: PortNo = 0xffff_fffc;
pub const OFPP_CONTROLLER: PortNo = 0xffff_fffd;
pub const OFPP_LOCAL: PortNo = 0xffff_fffe;
pub const OFPP_ANY: PortNo = 0xffff_ffff;

/// Send the whole packet to the controller instead of buffering it
pub const OFPCML_NO_BUFFER: u16 = 0xffff;

/// Wildcard table id for flow stats requests
pub const OFPTT_ALL: u8 = 0xff;

pub fn is_reserved_port(port: PortNo) -> bool {
    port >= OFPP_MAX
}

// ============================================================================
// IPv4 prefix
// ============================================================================

/// IPv4 address with prefix length, written `a.b.c.d` or `a.b.c.d/len`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Option<Self> {
        if prefix_len > 32 {
            return None;
        }
        let mask = Self::mask_for(prefix_len);
        Some(Self {
            addr: Ipv4Addr::from(u32::from(addr) & mask),
            prefix_len,
        })
    }

    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            prefix_len: 32,
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn mask_for(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_len))
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = Self::mask_for(self.prefix_len);
        u32::from(ip) & mask == u32::from(self.addr)
    }
}

impl From<Ipv4Addr> for Ipv4Net {
    fn from(addr: Ipv4Addr) -> Self {
        Self::host(addr)
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix_len == 32 {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.prefix_len)
        }
    }
}

impl FromStr for Ipv4Net {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, prefix_part) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };
        let addr: Ipv4Addr = addr_part
            .parse()
            .map_err(|e| format!("invalid IPv4 address '{}': {}", addr_part, e))?;
        let prefix_len = match prefix_part {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .map_err(|e| format!("invalid prefix '{}': {}", p, e))?,
            None => 32,
        };
        Ipv4Net::new(addr, prefix_len)
            .ok_or_else(|| format!("prefix {} exceeds IPv4 width", prefix_len))
    }
}

impl Serialize for Ipv4Net {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Net {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Match
// ============================================================================

/// Match fields of a flow entry. Absent fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_port: Option<PortNo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_src: Option<MacAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_dst: Option<MacAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_type: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_proto: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_src: Option<Ipv4Net>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_dst: Option<Ipv4Net>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_src: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_dst: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_src: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_dst: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icmpv4_type: Option<u8>,
}

impl FlowMatch {
    /// Match everything (the table-miss match)
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_wildcard(&self) -> bool {
        *self == Self::default()
    }

    pub fn with_eth_dst(mut self, mac: MacAddr) -> Self {
        self.eth_dst = Some(mac);
        self
    }

    pub fn with_eth_type(mut self, eth_type: u16) -> Self {
        self.eth_type = Some(eth_type);
        self
    }

    pub fn with_ipv4_src(mut self, ip: impl Into<Ipv4Net>) -> Self {
        self.ipv4_src = Some(ip.into());
        self
    }

    pub fn with_ipv4_dst(mut self, ip: impl Into<Ipv4Net>) -> Self {
        self.ipv4_dst = Some(ip.into());
        self
    }

    /// Does a packet that arrived on `in_port` satisfy every field of this match?
    /// A field naming a layer the packet does not carry never matches.
    pub fn matches(&self, in_port: PortNo, pkt: &ParsedPacket) -> bool {
        fn check<T: PartialEq>(want: Option<T>, have: Option<T>) -> bool {
            match want {
                None => true,
                Some(w) => have == Some(w),
            }
        }

        let ip = pkt.ipv4.as_ref();
        let (tcp, udp, icmp) = match pkt.l4 {
            Some(L4Header::Tcp { src_port, dst_port }) => (Some((src_port, dst_port)), None, None),
            Some(L4Header::Udp { src_port, dst_port }) => (None, Some((src_port, dst_port)), None),
            Some(L4Header::Icmp { icmp_type, .. }) => (None, None, Some(icmp_type)),
            None => (None, None, None),
        };

        check(self.in_port, Some(in_port))
            && check(self.eth_src, Some(pkt.eth.src))
            && check(self.eth_dst, Some(pkt.eth.dst))
            && check(self.eth_type, Some(pkt.eth.ethertype))
            && check(self.ip_proto, ip.map(|h| h.protocol))
            && self
                .ipv4_src
                .map_or(true, |net| ip.is_some_and(|h| net.contains(h.src)))
            && self
                .ipv4_dst
                .map_or(true, |net| ip.is_some_and(|h| net.contains(h.dst)))
            && check(self.tcp_src, tcp.map(|p| p.0))
            && check(self.tcp_dst, tcp.map(|p| p.1))
            && check(self.udp_src, udp.map(|p| p.0))
            && check(self.udp_dst, udp.map(|p| p.1))
            && check(self.icmpv4_type, icmp)
    }
}

impl fmt::Display for FlowMatch {
    /// ovs-ofctl style field list, `*` for the wildcard match
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields: Vec<String> = Vec::new();
        if let Some(v) = self.in_port {
            fields.push(format!("in_port={}", v));
        }
        if let Some(v) = self.eth_src {
            fields.push(format!("eth_src={}", v));
        }
        if let Some(v) = self.eth_dst {
            fields.push(format!("eth_dst={}", v));
        }
        if let Some(v) = self.eth_type {
            fields.push(format!("eth_type={:#06x}", v));
        }
        if let Some(v) = self.ip_proto {
            fields.push(format!("ip_proto={}", v));
        }
        if let Some(v) = self.ipv4_src {
            fields.push(format!("ipv4_src={}", v));
        }
        if let Some(v) = self.ipv4_dst {
            fields.push(format!("ipv4_dst={}", v));
        }
        if let Some(v) = self.tcp_src {
            fields.push(format!("tcp_src={}", v));
        }
        if let Some(v) = self.tcp_dst {
            fields.push(format!("tcp_dst={}", v));
        }
        if let Some(v) = self.udp_src {
            fields.push(format!("udp_src={}", v));
        }
        if let Some(v) = self.udp_dst {
            fields.push(format!("udp_dst={}", v));
        }
        if let Some(v) = self.icmpv4_type {
            fields.push(format!("icmpv4_type={}", v));
        }
        if fields.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", fields.join(","))
        }
    }
}

// ============================================================================
// Actions and instructions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowAction {
    Output {
        port: PortNo,
        #[serde(default)]
        max_len: u16,
    },
    SetEthSrc {
        mac: MacAddr,
    },
    SetEthDst {
        mac: MacAddr,
    },
    SetIpv4Src {
        ip: Ipv4Addr,
    },
    SetIpv4Dst {
        ip: Ipv4Addr,
    },
}

impl FlowAction {
    pub fn output(port: PortNo) -> Self {
        FlowAction::Output { port, max_len: 0 }
    }

    pub fn flood() -> Self {
        Self::output(OFPP_FLOOD)
    }

    /// Output to the controller carrying the full packet
    pub fn controller() -> Self {
        FlowAction::Output {
            port: OFPP_CONTROLLER,
            max_len: OFPCML_NO_BUFFER,
        }
    }

    pub fn output_port(&self) -> Option<PortNo> {
        match self {
            FlowAction::Output { port, .. } => Some(*port),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    ApplyActions(Vec<FlowAction>),
    /// Clear the action set; with nothing else, the packet is dropped
    ClearActions,
}

// ============================================================================
// Flow modification
// ============================================================================

/// Add-or-replace request for a flow entry.
///
/// A switch holding an entry with the same `match` and `priority` replaces
/// its instructions, timeouts and cookie instead of adding a second entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMod {
    #[serde(default)]
    pub table_id: u8,
    pub priority: u16,
    #[serde(rename = "match")]
    pub match_fields: FlowMatch,
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub idle_timeout: u16,
    #[serde(default)]
    pub hard_timeout: u16,
    #[serde(default)]
    pub cookie: u64,
    /// Buffered packet to release through the new entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_id: Option<u32>,
}

impl FlowMod {
    /// Entry applying `actions` to matching packets
    pub fn apply(priority: u16, match_fields: FlowMatch, actions: Vec<FlowAction>) -> Self {
        Self {
            table_id: 0,
            priority,
            match_fields,
            instructions: vec![Instruction::ApplyActions(actions)],
            idle_timeout: 0,
            hard_timeout: 0,
            cookie: 0,
            buffer_id: None,
        }
    }

    /// Entry dropping matching packets
    pub fn drop(priority: u16, match_fields: FlowMatch) -> Self {
        Self {
            instructions: vec![Instruction::ClearActions],
            ..Self::apply(priority, match_fields, Vec::new())
        }
    }

    pub fn with_idle_timeout(mut self, secs: u16) -> Self {
        self.idle_timeout = secs;
        self
    }

    pub fn with_hard_timeout(mut self, secs: u16) -> Self {
        self.hard_timeout = secs;
        self
    }

    pub fn with_buffer_id(mut self, buffer_id: Option<u32>) -> Self {
        self.buffer_id = buffer_id;
        self
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    /// Actions applied by this entry, in order
    pub fn actions(&self) -> Vec<&FlowAction> {
        self.instructions
            .iter()
            .filter_map(|inst| match inst {
                Instruction::ApplyActions(actions) => Some(actions.iter()),
                Instruction::ClearActions => None,
            })
            .flatten()
            .collect()
    }

    /// True when matching packets leave through no port
    pub fn is_drop(&self) -> bool {
        self.actions().iter().all(|a| a.output_port().is_none())
    }
}

// ============================================================================
// Packet in / out
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketInReason {
    #[default]
    NoMatch,
    Action,
    InvalidTtl,
}

/// Packet delivered to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketIn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_id: Option<u32>,
    pub in_port: PortNo,
    #[serde(default)]
    pub reason: PacketInReason,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl PacketIn {
    pub fn new(in_port: PortNo, data: Vec<u8>) -> Self {
        Self {
            buffer_id: None,
            in_port,
            reason: PacketInReason::NoMatch,
            data,
        }
    }
}

/// One-shot packet send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketOut {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_id: Option<u32>,
    pub in_port: PortNo,
    pub actions: Vec<FlowAction>,
    /// Packet bytes; empty when a buffered packet is released
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl PacketOut {
    /// Send the packet a switch handed us, releasing its buffer when it has one
    pub fn for_packet_in(pkt: &PacketIn, actions: Vec<FlowAction>) -> Self {
        Self {
            buffer_id: pkt.buffer_id,
            in_port: pkt.in_port,
            actions,
            data: if pkt.buffer_id.is_some() {
                Vec::new()
            } else {
                pkt.data.clone()
            },
        }
    }

    /// Send a controller-generated frame
    pub fn from_controller(data: Vec<u8>, actions: Vec<FlowAction>) -> Self {
        Self {
            buffer_id: None,
            in_port: OFPP_CONTROLLER,
            actions,
            data,
        }
    }

    pub fn output_ports(&self) -> Vec<PortNo> {
        self.actions.iter().filter_map(FlowAction::output_port).collect()
    }
}

// ============================================================================
// Features and statistics
// ============================================================================

/// What a switch announced about itself when it connected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchFeatures {
    pub dpid: u64,
    #[serde(default = "default_n_tables")]
    pub n_tables: u8,
    #[serde(default)]
    pub capabilities: u32,
}

fn default_n_tables() -> u8 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortStats {
    pub port_no: PortNo,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatsEntry {
    #[serde(default)]
    pub table_id: u8,
    pub priority: u16,
    #[serde(default)]
    pub cookie: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    #[serde(rename = "match")]
    pub match_fields: FlowMatch,
}

/// Datapath ids are rendered as 16 hex digits in logs, like `ovs-ofctl show`
pub fn format_dpid(dpid: u64) -> String {
    format!("{:016x}", dpid)
}

/// Serde adapter carrying packet bytes as base64 strings
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build, ETH_TYPE_IPV4, IP_PROTO_ICMP, IP_PROTO_TCP};

    const HOST_A: MacAddr = MacAddr::new(0, 0, 0, 0, 0, 0xaa);
    const HOST_B: MacAddr = MacAddr::new(0, 0, 0, 0, 0, 0xbb);

    #[test]
    fn test_ipv4_net_parse() {
        let net: Ipv4Net = "10.0.1.77/24".parse().unwrap();
        assert_eq!(net.addr(), Ipv4Addr::new(10, 0, 1, 0));
        assert_eq!(net.to_string(), "10.0.1.0/24");
        assert!(net.contains(Ipv4Addr::new(10, 0, 1, 200)));
        assert!(!net.contains(Ipv4Addr::new(10, 0, 2, 1)));

        let host: Ipv4Net = "10.0.1.5".parse().unwrap();
        assert_eq!(host.prefix_len(), 32);
        assert_eq!(host.to_string(), "10.0.1.5");

        assert!("10.0.1.0/33".parse::<Ipv4Net>().is_err());
        assert!("10.0.1/24".parse::<Ipv4Net>().is_err());
    }

    #[test]
    fn test_flow_match_from_rule_json() {
        let m: FlowMatch =
            serde_json::from_str(r#"{"eth_type": 2048, "ip_proto": 6, "tcp_dst": 22}"#).unwrap();
        assert_eq!(m.eth_type, Some(ETH_TYPE_IPV4));
        assert_eq!(m.ip_proto, Some(IP_PROTO_TCP));
        assert_eq!(m.tcp_dst, Some(22));
        assert_eq!(m.to_string(), "eth_type=0x0800,ip_proto=6,tcp_dst=22");

        assert!(serde_json::from_str::<FlowMatch>(r#"{"tcp_port": 22}"#).is_err());
    }

    #[test]
    fn test_flow_match_matches() {
        let icmp = build::icmp_echo(
            HOST_B,
            HOST_A,
            Ipv4Addr::new(10, 0, 1, 5),
            Ipv4Addr::new(10, 0, 2, 5),
        );
        let pkt = ParsedPacket::parse(&icmp).unwrap();

        let drop_icmp = FlowMatch {
            eth_type: Some(ETH_TYPE_IPV4),
            ip_proto: Some(IP_PROTO_ICMP),
            ..FlowMatch::default()
        };
        assert!(drop_icmp.matches(1, &pkt));
        assert!(FlowMatch::any().matches(1, &pkt));

        let host_pair = FlowMatch::any()
            .with_ipv4_src(Ipv4Addr::new(10, 0, 1, 5))
            .with_ipv4_dst("10.0.2.0/24".parse::<Ipv4Net>().unwrap());
        assert!(host_pair.matches(3, &pkt));

        let ssh = FlowMatch {
            tcp_dst: Some(22),
            ..FlowMatch::default()
        };
        assert!(!ssh.matches(1, &pkt));

        let wrong_port = FlowMatch {
            in_port: Some(2),
            ..FlowMatch::default()
        };
        assert!(!wrong_port.matches(1, &pkt));
    }

    #[test]
    fn test_match_on_missing_layer_fails() {
        let arp = build::arp_request(HOST_A, Ipv4Addr::new(10, 0, 1, 5), Ipv4Addr::new(10, 0, 1, 6));
        let pkt = ParsedPacket::parse(&arp).unwrap();
        let m = FlowMatch::any().with_ipv4_src(Ipv4Addr::new(10, 0, 1, 5));
        assert!(!m.matches(1, &pkt));
    }

    #[test]
    fn test_flow_mod_builders() {
        let drop = FlowMod::drop(100, FlowMatch::any().with_eth_type(ETH_TYPE_IPV4));
        assert!(drop.is_drop());
        assert_eq!(drop.instructions, vec![Instruction::ClearActions]);

        let fwd = FlowMod::apply(1, FlowMatch::any().with_eth_dst(HOST_A), vec![FlowAction::output(3)])
            .with_idle_timeout(30)
            .with_buffer_id(Some(7));
        assert!(!fwd.is_drop());
        assert_eq!(fwd.actions(), vec![&FlowAction::output(3)]);
        assert_eq!(fwd.idle_timeout, 30);
        assert_eq!(fwd.buffer_id, Some(7));
    }

    #[test]
    fn test_packet_out_for_buffered_packet_omits_data() {
        let mut pin = PacketIn::new(4, vec![1, 2, 3]);
        let unbuffered = PacketOut::for_packet_in(&pin, vec![FlowAction::flood()]);
        assert_eq!(unbuffered.data, vec![1, 2, 3]);
        assert_eq!(unbuffered.in_port, 4);
        assert_eq!(unbuffered.output_ports(), vec![OFPP_FLOOD]);

        pin.buffer_id = Some(9);
        let buffered = PacketOut::for_packet_in(&pin, vec![FlowAction::flood()]);
        assert!(buffered.data.is_empty());
        assert_eq!(buffered.buffer_id, Some(9));
    }

    #[test]
    fn test_packet_in_data_is_base64_on_the_wire() {
        let pin = PacketIn::new(1, vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_value(&pin).unwrap();
        assert_eq!(json["data"], "3q2+7w==");
        let back: PacketIn = serde_json::from_value(json).unwrap();
        assert_eq!(back, pin);
    }

    #[test]
    fn test_format_dpid() {
        assert_eq!(format_dpid(1), "0000000000000001");
        assert_eq!(format_dpid(0xabcdef), "0000000000abcdef");
    }

    #[test]
    fn test_reserved_ports() {
        assert!(is_reserved_port(OFPP_LOCAL));
        assert!(is_reserved_port(OFPP_MAX));
        assert!(!is_reserved_port(48));
    }
}
