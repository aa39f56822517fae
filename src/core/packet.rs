//! Unified packet representation
//!
//! The engine never parses raw bytes itself; a capture front-end hands in
//! packets with their layers already decoded. Any layer may be absent.

use std::net::IpAddr;

use chrono::{DateTime, Utc};

use super::layers::{EthernetInfo, Layer3, Layer4, TcpFlags, TcpInfo};

/// A captured packet with decoded layers
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,

    /// Layer 2 (optional)
    pub ethernet: Option<EthernetInfo>,

    /// Layer 3 (optional)
    pub layer3: Option<Layer3>,

    /// Layer 4 (optional)
    pub layer4: Option<Layer4>,

    /// Raw packet length on the wire, including headers
    pub raw_len: u32,
}

impl Packet {
    /// Create a packet from decoded layers
    pub fn from_layers(
        timestamp: DateTime<Utc>,
        ethernet: Option<EthernetInfo>,
        layer3: Option<Layer3>,
        layer4: Option<Layer4>,
        raw_len: u32,
    ) -> Self {
        Self {
            timestamp,
            ethernet,
            layer3,
            layer4,
            raw_len,
        }
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.layer3.as_ref().map(|l3| l3.src_ip())
    }

    pub fn dst_ip(&self) -> Option<IpAddr> {
        self.layer3.as_ref().map(|l3| l3.dst_ip())
    }

    pub fn src_port(&self) -> Option<u16> {
        self.layer4.as_ref().and_then(|l4| l4.src_port())
    }

    pub fn dst_port(&self) -> Option<u16> {
        self.layer4.as_ref().and_then(|l4| l4.dst_port())
    }

    pub fn tcp(&self) -> Option<&TcpInfo> {
        self.layer4.as_ref().and_then(|l4| l4.as_tcp())
    }

    pub fn tcp_flags(&self) -> Option<TcpFlags> {
        self.tcp().map(|t| t.flags)
    }

    pub fn is_tcp(&self) -> bool {
        self.layer4.as_ref().map(|l4| l4.is_tcp()).unwrap_or(false)
    }

    pub fn payload(&self) -> &[u8] {
        self.layer4.as_ref().map(|l4| l4.payload()).unwrap_or(&[])
    }

    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or(0)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use crate::core::layers::TcpFlags;

    #[test]
    fn test_packet_accessors() {
        let pkt = tcp_packet(
            client_ip(),
            server_ip(),
            54321,
            80,
            TcpFlags { syn: true, ..Default::default() },
            1000,
            b"",
            0,
        );

        assert_eq!(pkt.src_port(), Some(54321));
        assert_eq!(pkt.dst_port(), Some(80));
        assert!(pkt.is_tcp());
        assert!(pkt.tcp_flags().unwrap().is_syn());
        assert_eq!(pkt.src_ip().unwrap().to_string(), "192.168.1.100");
    }

    #[test]
    fn test_empty_packet() {
        let pkt = super::Packet::from_layers(ts(0), None, None, None, 0);
        assert!(pkt.src_ip().is_none());
        assert!(pkt.src_port().is_none());
        assert!(!pkt.is_tcp());
        assert!(pkt.payload().is_empty());
    }
}
