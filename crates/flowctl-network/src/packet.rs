//! Frame codec for packet-in payloads
//!
//! Decodes the headers the controller makes decisions on (Ethernet with an
//! optional 802.1Q tag, ARP, IPv4 and the first bytes of TCP/UDP/ICMP) and
//! synthesizes ARP replies for proxy ARP. Everything is big-endian on the wire.

use byteorder::{BigEndian, ByteOrder};
use flowctl_core::MacAddr;
use std::net::Ipv4Addr;

use crate::of_error::PacketError;

// ============================================================================
// EtherTypes and protocol numbers
// ============================================================================
pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_IPV6: u16 = 0x86dd;
pub const ETH_TYPE_LLDP: u16 = 0x88cc;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const ARP_LEN: usize = 28;
const IPV4_MIN_HEADER_LEN: usize = 20;
const ARP_HTYPE_ETHERNET: u16 = 1;

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// VLAN id of a single 802.1Q tag, if present
    pub vlan: Option<u16>,
    /// EtherType of the payload (inner type when tagged)
    pub ethertype: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub opcode: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn is_request(&self) -> bool {
        self.opcode == ARP_REQUEST
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub header_len: usize,
    /// True for the first (or only) fragment, the only one carrying L4 ports
    pub first_fragment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Header {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
    Icmp { icmp_type: u8, code: u8 },
}

/// Decoded view of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket {
    pub eth: EthernetHeader,
    pub arp: Option<ArpPacket>,
    pub ipv4: Option<Ipv4Header>,
    pub l4: Option<L4Header>,
}

impl ParsedPacket {
    /// Decode a raw frame. Truncated headers of any recognised layer are an error.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        let (eth, offset) = parse_ethernet(data)?;
        let payload = &data[offset..];

        let mut packet = ParsedPacket {
            eth,
            arp: None,
            ipv4: None,
            l4: None,
        };

        match eth.ethertype {
            ETH_TYPE_ARP => packet.arp = Some(parse_arp(payload)?),
            ETH_TYPE_IPV4 => {
                let ip = parse_ipv4(payload)?;
                if ip.first_fragment {
                    packet.l4 = parse_l4(ip.protocol, &payload[ip.header_len..])?;
                }
                packet.ipv4 = Some(ip);
            }
            _ => {}
        }

        Ok(packet)
    }

    pub fn is_lldp(&self) -> bool {
        self.eth.ethertype == ETH_TYPE_LLDP
    }
}

// ============================================================================
// Decoders
// ============================================================================

fn ensure_len(layer: &'static str, data: &[u8], needed: usize) -> Result<(), PacketError> {
    if data.len() < needed {
        return Err(PacketError::Truncated {
            layer,
            needed,
            got: data.len(),
        });
    }
    Ok(())
}

fn read_mac(bytes: &[u8]) -> MacAddr {
    // callers have already checked the length
    MacAddr::from_slice(bytes).unwrap_or_default()
}

fn read_ipv4(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::from(BigEndian::read_u32(bytes))
}

fn parse_ethernet(data: &[u8]) -> Result<(EthernetHeader, usize), PacketError> {
    ensure_len("ethernet", data, ETH_HEADER_LEN)?;

    let dst = read_mac(&data[0..6]);
    let src = read_mac(&data[6..12]);
    let mut ethertype = BigEndian::read_u16(&data[12..14]);
    let mut offset = ETH_HEADER_LEN;
    let mut vlan = None;

    if ethertype == ETH_TYPE_VLAN {
        ensure_len("vlan", data, ETH_HEADER_LEN + VLAN_TAG_LEN)?;
        vlan = Some(BigEndian::read_u16(&data[14..16]) & 0x0fff);
        ethertype = BigEndian::read_u16(&data[16..18]);
        offset += VLAN_TAG_LEN;
    }

    Ok((
        EthernetHeader {
            dst,
            src,
            vlan,
            ethertype,
        },
        offset,
    ))
}

fn parse_arp(data: &[u8]) -> Result<ArpPacket, PacketError> {
    ensure_len("arp", data, ARP_LEN)?;

    let htype = BigEndian::read_u16(&data[0..2]);
    let ptype = BigEndian::read_u16(&data[2..4]);
    if htype != ARP_HTYPE_ETHERNET || ptype != ETH_TYPE_IPV4 || data[4] != 6 || data[5] != 4 {
        return Err(PacketError::UnsupportedArp { htype, ptype });
    }

    Ok(ArpPacket {
        opcode: BigEndian::read_u16(&data[6..8]),
        sender_mac: read_mac(&data[8..14]),
        sender_ip: read_ipv4(&data[14..18]),
        target_mac: read_mac(&data[18..24]),
        target_ip: read_ipv4(&data[24..28]),
    })
}

fn parse_ipv4(data: &[u8]) -> Result<Ipv4Header, PacketError> {
    ensure_len("ipv4", data, IPV4_MIN_HEADER_LEN)?;

    let version = data[0] >> 4;
    if version != 4 {
        return Err(PacketError::InvalidIpv4(format!("version {}", version)));
    }
    let header_len = usize::from(data[0] & 0x0f) * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(PacketError::InvalidIpv4(format!(
            "header length {}",
            header_len
        )));
    }
    ensure_len("ipv4", data, header_len)?;

    let frag_offset = BigEndian::read_u16(&data[6..8]) & 0x1fff;

    Ok(Ipv4Header {
        src: read_ipv4(&data[12..16]),
        dst: read_ipv4(&data[16..20]),
        protocol: data[9],
        ttl: data[8],
        header_len,
        first_fragment: frag_offset == 0,
    })
}

fn parse_l4(protocol: u8, data: &[u8]) -> Result<Option<L4Header>, PacketError> {
    Ok(match protocol {
        IP_PROTO_TCP => {
            ensure_len("tcp", data, 4)?;
            Some(L4Header::Tcp {
                src_port: BigEndian::read_u16(&data[0..2]),
                dst_port: BigEndian::read_u16(&data[2..4]),
            })
        }
        IP_PROTO_UDP => {
            ensure_len("udp", data, 4)?;
            Some(L4Header::Udp {
                src_port: BigEndian::read_u16(&data[0..2]),
                dst_port: BigEndian::read_u16(&data[2..4]),
            })
        }
        IP_PROTO_ICMP => {
            ensure_len("icmp", data, 2)?;
            Some(L4Header::Icmp {
                icmp_type: data[0],
                code: data[1],
            })
        }
        _ => None,
    })
}

// ============================================================================
// Encoders
// ============================================================================

/// Build an Ethernet+ARP reply frame announcing `sender_ip is-at sender_mac`
/// to the host that asked.
pub fn build_arp_reply(
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut buf = vec![0u8; ETH_HEADER_LEN + ARP_LEN];

    // Ethernet header
    buf[0..6].copy_from_slice(&target_mac.octets());
    buf[6..12].copy_from_slice(&sender_mac.octets());
    BigEndian::write_u16(&mut buf[12..14], ETH_TYPE_ARP);

    // ARP payload
    let arp = &mut buf[ETH_HEADER_LEN..];
    BigEndian::write_u16(&mut arp[0..2], ARP_HTYPE_ETHERNET);
    BigEndian::write_u16(&mut arp[2..4], ETH_TYPE_IPV4);
    arp[4] = 6;
    arp[5] = 4;
    BigEndian::write_u16(&mut arp[6..8], ARP_REPLY);
    arp[8..14].copy_from_slice(&sender_mac.octets());
    arp[14..18].copy_from_slice(&sender_ip.octets());
    arp[18..24].copy_from_slice(&target_mac.octets());
    arp[24..28].copy_from_slice(&target_ip.octets());

    buf
}

/// Frame builders shared by the unit tests of every crate in the workspace
pub mod build {
    use super::*;

    pub fn ethernet(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ETH_HEADER_LEN + payload.len());
        buf.extend_from_slice(&dst.octets());
        buf.extend_from_slice(&src.octets());
        buf.extend_from_slice(&ethertype.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    pub fn arp_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
        let mut arp = [0u8; ARP_LEN];
        BigEndian::write_u16(&mut arp[0..2], ARP_HTYPE_ETHERNET);
        BigEndian::write_u16(&mut arp[2..4], ETH_TYPE_IPV4);
        arp[4] = 6;
        arp[5] = 4;
        BigEndian::write_u16(&mut arp[6..8], ARP_REQUEST);
        arp[8..14].copy_from_slice(&sender_mac.octets());
        arp[14..18].copy_from_slice(&sender_ip.octets());
        arp[24..28].copy_from_slice(&target_ip.octets());
        ethernet(MacAddr::BROADCAST, sender_mac, ETH_TYPE_ARP, &arp)
    }

    /// IPv4 frame with a minimal header and the given L4 bytes
    pub fn ipv4(
        dst_mac: MacAddr,
        src_mac: MacAddr,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        l4: &[u8],
    ) -> Vec<u8> {
        let mut ip = vec![0u8; IPV4_MIN_HEADER_LEN];
        ip[0] = 0x45;
        BigEndian::write_u16(&mut ip[2..4], (IPV4_MIN_HEADER_LEN + l4.len()) as u16);
        ip[8] = 64;
        ip[9] = protocol;
        ip[12..16].copy_from_slice(&src.octets());
        ip[16..20].copy_from_slice(&dst.octets());
        ip.extend_from_slice(l4);
        ethernet(dst_mac, src_mac, ETH_TYPE_IPV4, &ip)
    }

    pub fn icmp_echo(dst_mac: MacAddr, src_mac: MacAddr, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        ipv4(dst_mac, src_mac, src, dst, IP_PROTO_ICMP, &[8, 0, 0, 0, 0, 1, 0, 1])
    }

    pub fn tcp_syn(
        dst_mac: MacAddr,
        src_mac: MacAddr,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Vec<u8> {
        let mut tcp = vec![0u8; 20];
        BigEndian::write_u16(&mut tcp[0..2], src_port);
        BigEndian::write_u16(&mut tcp[2..4], dst_port);
        tcp[12] = 0x50;
        tcp[13] = 0x02;
        ipv4(dst_mac, src_mac, src, dst, IP_PROTO_TCP, &tcp)
    }
}
