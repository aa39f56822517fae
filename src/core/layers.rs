//! Network layer types
//!
//! Strongly-typed structs for each decoded layer:
//! - Layer 2: Ethernet (EthernetInfo)
//! - Layer 3: IPv4, IPv6 (Layer3)
//! - Layer 4: TCP, UDP (Layer4)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

// ============================================================================
// Layer 2 - Data Link
// ============================================================================

/// Ethernet frame information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EthernetInfo {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub vlan: Option<u16>,
}

impl EthernetInfo {
    pub fn src_mac_string(&self) -> String {
        format_mac(&self.src_mac)
    }

    pub fn dst_mac_string(&self) -> String {
        format_mac(&self.dst_mac)
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

// ============================================================================
// Layer 3 - Network
// ============================================================================

/// Layer 3 protocol variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Layer3 {
    Ipv4(Ipv4Info),
    Ipv6(Ipv6Info),
}

impl Layer3 {
    /// Get source IP address (works for both IPv4 and IPv6)
    pub fn src_ip(&self) -> IpAddr {
        match self {
            Layer3::Ipv4(info) => IpAddr::V4(info.src_addr),
            Layer3::Ipv6(info) => IpAddr::V6(info.src_addr),
        }
    }

    /// Get destination IP address (works for both IPv4 and IPv6)
    pub fn dst_ip(&self) -> IpAddr {
        match self {
            Layer3::Ipv4(info) => IpAddr::V4(info.dst_addr),
            Layer3::Ipv6(info) => IpAddr::V6(info.dst_addr),
        }
    }

    /// Get next protocol number
    pub fn protocol(&self) -> u8 {
        match self {
            Layer3::Ipv4(info) => info.protocol,
            Layer3::Ipv6(info) => info.next_header,
        }
    }

    /// Layer name for flow records
    pub fn name(&self) -> &'static str {
        match self {
            Layer3::Ipv4(_) => "IPv4",
            Layer3::Ipv6(_) => "IPv6",
        }
    }

    pub fn as_ipv4(&self) -> Option<&Ipv4Info> {
        match self {
            Layer3::Ipv4(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_ipv6(&self) -> Option<&Ipv6Info> {
        match self {
            Layer3::Ipv6(info) => Some(info),
            _ => None,
        }
    }
}

/// IPv4 header information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv4Info {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub identification: u16,
    /// DF, MF bits
    pub flags: u8,
    /// In 8-byte units, as carried on the wire
    pub fragment_offset: u16,
    pub total_length: u16,
    /// IP payload bytes; populated by the capture layer only for
    /// fragmented datagrams, since their transport layer cannot be decoded
    /// until reassembly
    pub fragment_data: Vec<u8>,
}

impl Default for Ipv4Info {
    fn default() -> Self {
        Self {
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            protocol: 0,
            ttl: 64,
            identification: 0,
            flags: 0,
            fragment_offset: 0,
            total_length: 0,
            fragment_data: Vec::new(),
        }
    }
}

impl Ipv4Info {
    /// Check if More Fragments flag is set
    pub fn more_fragments(&self) -> bool {
        self.flags & 0x01 != 0
    }

    /// Check if packet is fragmented
    pub fn is_fragmented(&self) -> bool {
        self.fragment_offset > 0 || self.more_fragments()
    }
}

/// IPv6 header information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv6Info {
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
    pub payload_length: u16,
}

impl Default for Ipv6Info {
    fn default() -> Self {
        Self {
            src_addr: Ipv6Addr::UNSPECIFIED,
            dst_addr: Ipv6Addr::UNSPECIFIED,
            next_header: 0,
            hop_limit: 64,
            payload_length: 0,
        }
    }
}

// ============================================================================
// Layer 4 - Transport
// ============================================================================

/// Layer 4 protocol variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Layer4 {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    /// Unknown or unsupported protocol
    Unknown { protocol: u8 },
}

impl Layer4 {
    /// Get source port (TCP/UDP only)
    pub fn src_port(&self) -> Option<u16> {
        match self {
            Layer4::Tcp(info) => Some(info.src_port),
            Layer4::Udp(info) => Some(info.src_port),
            _ => None,
        }
    }

    /// Get destination port (TCP/UDP only)
    pub fn dst_port(&self) -> Option<u16> {
        match self {
            Layer4::Tcp(info) => Some(info.dst_port),
            Layer4::Udp(info) => Some(info.dst_port),
            _ => None,
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpInfo> {
        match self {
            Layer4::Tcp(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_tcp_mut(&mut self) -> Option<&mut TcpInfo> {
        match self {
            Layer4::Tcp(info) => Some(info),
            _ => None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Layer4::Tcp(_))
    }

    /// Get payload reference
    pub fn payload(&self) -> &[u8] {
        match self {
            Layer4::Tcp(info) => &info.payload,
            Layer4::Udp(info) => &info.payload,
            Layer4::Unknown { .. } => &[],
        }
    }

    /// Layer name for flow records
    pub fn name(&self) -> &'static str {
        match self {
            Layer4::Tcp(_) => "TCP",
            Layer4::Udp(_) => "UDP",
            Layer4::Unknown { .. } => "Unknown",
        }
    }
}

impl Default for Layer4 {
    fn default() -> Self {
        Layer4::Unknown { protocol: 0 }
    }
}

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
        }
    }

    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// TCP segment information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// MSS option value, present only on SYN segments
    pub mss: Option<u16>,
    /// TSval from the timestamp option, if present
    pub tsval: Option<u32>,
    /// Checksum verdict from the capture layer, when it computed one
    pub checksum_valid: Option<bool>,
    pub payload: Vec<u8>,
}

impl Default for TcpInfo {
    fn default() -> Self {
        Self {
            src_port: 0,
            dst_port: 0,
            seq: 0,
            ack: 0,
            flags: TcpFlags::default(),
            window: 0,
            mss: None,
            tsval: None,
            checksum_valid: None,
            payload: Vec::new(),
        }
    }
}

impl TcpInfo {
    /// Check if this is a SYN packet (SYN only, not SYN-ACK)
    pub fn is_syn(&self) -> bool {
        self.flags.is_syn()
    }

    /// Check if this is a SYN-ACK packet
    pub fn is_syn_ack(&self) -> bool {
        self.flags.is_syn_ack()
    }
}

/// UDP datagram information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_flags() {
        let flags = TcpFlags::from_u8(0x12); // SYN+ACK
        assert!(flags.syn);
        assert!(flags.ack);
        assert!(!flags.fin);
        assert!(flags.is_syn_ack());
        assert!(!flags.is_syn());
    }

    #[test]
    fn test_ipv4_fragmented() {
        let mut info = Ipv4Info::default();
        assert!(!info.is_fragmented());

        info.flags = 0x01; // MF
        assert!(info.is_fragmented());

        info.flags = 0;
        info.fragment_offset = 185;
        assert!(info.is_fragmented());
    }

    #[test]
    fn test_mac_formatting() {
        let eth = EthernetInfo {
            src_mac: [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01],
            ..Default::default()
        };
        assert_eq!(eth.src_mac_string(), "de:ad:be:ef:00:01");
    }
}
