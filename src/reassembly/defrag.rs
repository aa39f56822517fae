//! IPv4 defragmentation
//!
//! Fragment sets are keyed (src, dst, protocol, identification). Only
//! fully reassembled datagrams are released; incomplete sets are discarded
//! once they exceed the defrag timeout.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::layers::{Ipv4Info, TcpFlags, TcpInfo};

/// Fragment set identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    identification: u16,
}

#[derive(Debug)]
struct Fragment {
    /// Byte offset within the original datagram
    offset: usize,
    more_fragments: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
struct FragmentSet {
    fragments: Vec<Fragment>,
    first_seen: DateTime<Utc>,
}

impl FragmentSet {
    /// Attempt to assemble the full datagram payload. Requires an offset-0
    /// fragment, a final fragment, and contiguous coverage in between.
    fn assemble(&self) -> Option<Vec<u8>> {
        let mut frags: Vec<&Fragment> = self.fragments.iter().collect();
        frags.sort_by_key(|f| f.offset);

        let first = frags.first()?;
        if first.offset != 0 {
            return None;
        }

        let last = frags.last()?;
        if last.more_fragments {
            return None;
        }

        let mut out = Vec::new();
        for frag in frags {
            if frag.offset > out.len() {
                // hole
                return None;
            }
            if frag.offset + frag.data.len() <= out.len() {
                // fully overlapping duplicate
                continue;
            }
            let skip = out.len() - frag.offset;
            out.extend_from_slice(&frag.data[skip..]);
        }

        Some(out)
    }
}

/// IPv4 defragmenter
#[derive(Debug, Default)]
pub struct Ipv4Defragmenter {
    sets: HashMap<FragmentKey, FragmentSet>,
    /// Datagrams reassembled so far
    pub reassembled: u64,
}

impl Ipv4Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the rebuilt header info and full payload
    /// once the datagram is complete.
    pub fn process(
        &mut self,
        ip4: &Ipv4Info,
        timestamp: DateTime<Utc>,
    ) -> Option<(Ipv4Info, Vec<u8>)> {
        if !ip4.is_fragmented() {
            return None;
        }

        let key = FragmentKey {
            src: ip4.src_addr,
            dst: ip4.dst_addr,
            protocol: ip4.protocol,
            identification: ip4.identification,
        };

        let set = self.sets.entry(key).or_insert_with(|| FragmentSet {
            fragments: Vec::new(),
            first_seen: timestamp,
        });

        set.fragments.push(Fragment {
            offset: ip4.fragment_offset as usize * 8,
            more_fragments: ip4.more_fragments(),
            data: ip4.fragment_data.clone(),
        });

        let payload = set.assemble()?;

        self.sets.remove(&key);
        self.reassembled += 1;
        debug!(
            id = ip4.identification,
            len = payload.len(),
            "reassembled IPv4 datagram"
        );

        let mut rebuilt = ip4.clone();
        rebuilt.flags = 0;
        rebuilt.fragment_offset = 0;
        rebuilt.fragment_data = Vec::new();
        rebuilt.total_length = (payload.len() + 20) as u16;

        Some((rebuilt, payload))
    }

    /// Drop incomplete fragment sets older than the cutoff.
    /// Returns the number of discarded sets.
    pub fn discard_older(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.sets.len();
        self.sets.retain(|_, set| set.first_seen >= cutoff);
        before - self.sets.len()
    }

    pub fn pending_sets(&self) -> usize {
        self.sets.len()
    }
}

/// Decode a TCP segment from a reassembled datagram payload.
///
/// Reassembled datagrams have no capture-layer decoding, so the small
/// amount of header parsing lives here rather than in an external library.
pub fn parse_tcp_segment(data: &[u8]) -> Option<TcpInfo> {
    if data.len() < 20 {
        return None;
    }

    let data_offset = ((data[12] >> 4) & 0x0f) as usize * 4;
    if data_offset < 20 || data.len() < data_offset {
        return None;
    }

    Some(TcpInfo {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        flags: TcpFlags::from_u8(data[13]),
        window: u16::from_be_bytes([data[14], data[15]]),
        payload: data[data_offset..].to_vec(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn frag(offset_units: u16, mf: bool, data: &[u8]) -> Ipv4Info {
        Ipv4Info {
            src_addr: Ipv4Addr::new(192, 168, 1, 1),
            dst_addr: Ipv4Addr::new(10, 0, 0, 1),
            protocol: 6,
            identification: 42,
            flags: if mf { 0x01 } else { 0 },
            fragment_offset: offset_units,
            fragment_data: data.to_vec(),
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_nanos(0)
    }

    #[test]
    fn test_in_order_reassembly() {
        let mut defrag = Ipv4Defragmenter::new();

        assert!(defrag.process(&frag(0, true, &[1u8; 8]), now()).is_none());
        let (info, payload) = defrag.process(&frag(1, false, &[2u8; 4]), now()).unwrap();

        assert_eq!(payload.len(), 12);
        assert_eq!(&payload[..8], &[1u8; 8]);
        assert_eq!(&payload[8..], &[2u8; 4]);
        assert!(!info.is_fragmented());
        assert_eq!(defrag.pending_sets(), 0);
        assert_eq!(defrag.reassembled, 1);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut defrag = Ipv4Defragmenter::new();

        assert!(defrag.process(&frag(1, false, &[2u8; 8]), now()).is_none());
        let (_, payload) = defrag.process(&frag(0, true, &[1u8; 8]), now()).unwrap();
        assert_eq!(payload.len(), 16);
    }

    #[test]
    fn test_hole_blocks_release() {
        let mut defrag = Ipv4Defragmenter::new();

        assert!(defrag.process(&frag(0, true, &[1u8; 8]), now()).is_none());
        // offset 2 leaves a hole at offset 1
        assert!(defrag.process(&frag(2, false, &[3u8; 8]), now()).is_none());
        assert_eq!(defrag.pending_sets(), 1);
    }

    #[test]
    fn test_discard_older() {
        let mut defrag = Ipv4Defragmenter::new();
        defrag.process(&frag(0, true, &[1u8; 8]), Utc.timestamp_nanos(0));

        let discarded = defrag.discard_older(Utc.timestamp_nanos(1_000_000_000));
        assert_eq!(discarded, 1);
        assert_eq!(defrag.pending_sets(), 0);
    }

    #[test]
    fn test_parse_tcp_segment() {
        let mut seg = vec![0u8; 20];
        seg[0..2].copy_from_slice(&50000u16.to_be_bytes());
        seg[2..4].copy_from_slice(&80u16.to_be_bytes());
        seg[4..8].copy_from_slice(&1000u32.to_be_bytes());
        seg[12] = 5 << 4; // header length 20
        seg[13] = 0x18; // PSH+ACK
        seg.extend_from_slice(b"hello");

        let tcp = parse_tcp_segment(&seg).unwrap();
        assert_eq!(tcp.src_port, 50000);
        assert_eq!(tcp.dst_port, 80);
        assert_eq!(tcp.seq, 1000);
        assert!(tcp.flags.psh && tcp.flags.ack);
        assert_eq!(tcp.payload, b"hello");
    }
}
