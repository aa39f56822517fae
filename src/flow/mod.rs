//! Flow aggregation tables
//!
//! Tracks packet aggregates at link, network, transport and connection
//! granularity. Each granularity reuses the same table engine with a
//! differently-scoped key.

pub mod table;

pub use table::FlowTable;

use std::hash::{Hash, Hasher};

use crate::core::record::FlowScope;
use crate::core::Packet;

/// Flow identity
///
/// Holds one hash per layer tuple; unused layers stay zero. The pair hash
/// is symmetric, so both directions of a conversation share one entry;
/// the record itself keeps the orientation of the first observed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub scope: FlowScope,
    pub link: u64,
    pub network: u64,
    pub transport: u64,
}

impl FlowKey {
    /// Key over link + network + transport, identifying a full connection
    pub fn connection(pkt: &Packet) -> Self {
        Self {
            scope: FlowScope::Connection,
            link: link_hash(pkt),
            network: network_hash(pkt),
            transport: transport_hash(pkt),
        }
    }

    pub fn link(pkt: &Packet) -> Self {
        Self {
            scope: FlowScope::Link,
            link: link_hash(pkt),
            network: 0,
            transport: 0,
        }
    }

    pub fn network(pkt: &Packet) -> Self {
        Self {
            scope: FlowScope::Network,
            link: 0,
            network: network_hash(pkt),
            transport: 0,
        }
    }

    pub fn transport(pkt: &Packet) -> Self {
        Self {
            scope: FlowScope::Transport,
            link: 0,
            network: 0,
            transport: transport_hash(pkt),
        }
    }

    pub fn for_scope(scope: FlowScope, pkt: &Packet) -> Self {
        match scope {
            FlowScope::Link => Self::link(pkt),
            FlowScope::Network => Self::network(pkt),
            FlowScope::Transport => Self::transport(pkt),
            FlowScope::Connection => Self::connection(pkt),
        }
    }
}

fn hash_pair<T: Hash + Ord>(src: T, dst: T) -> u64 {
    // normalized ordering makes the hash direction-insensitive
    let (a, b) = if src <= dst { (src, dst) } else { (dst, src) };
    let mut h = std::collections::hash_map::DefaultHasher::new();
    a.hash(&mut h);
    b.hash(&mut h);
    h.finish()
}

fn link_hash(pkt: &Packet) -> u64 {
    match &pkt.ethernet {
        Some(eth) => hash_pair(eth.src_mac, eth.dst_mac),
        None => 0,
    }
}

fn network_hash(pkt: &Packet) -> u64 {
    match (pkt.src_ip(), pkt.dst_ip()) {
        (Some(src), Some(dst)) => hash_pair(src, dst),
        _ => 0,
    }
}

fn transport_hash(pkt: &Packet) -> u64 {
    match (pkt.src_port(), pkt.dst_port()) {
        (Some(src), Some(dst)) => hash_pair(src, dst),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layers::TcpFlags;
    use crate::core::packet::testutil::*;

    #[test]
    fn test_key_bidirectional() {
        let fwd = tcp_packet(client_ip(), server_ip(), 50000, 80, TcpFlags::default(), 0, b"", 0);
        let rev = tcp_packet(server_ip(), client_ip(), 80, 50000, TcpFlags::default(), 0, b"", 0);
        let other = tcp_packet(client_ip(), server_ip(), 50001, 80, TcpFlags::default(), 0, b"", 0);

        // both directions of one conversation share the key
        assert_eq!(FlowKey::connection(&fwd), FlowKey::connection(&rev));
        assert_ne!(FlowKey::connection(&fwd), FlowKey::connection(&other));
    }

    #[test]
    fn test_scope_keys_differ() {
        let pkt = tcp_packet(client_ip(), server_ip(), 50000, 80, TcpFlags::default(), 0, b"", 0);
        assert_ne!(FlowKey::network(&pkt), FlowKey::transport(&pkt));
        assert_ne!(FlowKey::network(&pkt), FlowKey::connection(&pkt));
    }
}
