//! Out-of-order segment buffering
//!
//! Each direction of a session owns one `StreamBuffer`. In-order payload
//! is released immediately as a scatter-gather [`Span`]; future segments
//! are parked in a bounded map until the gap fills. Retransmitted and
//! overlapping bytes are deduplicated and counted, never delivered twice.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// A contiguous run of reassembled bytes released to the session
#[derive(Debug, Clone)]
pub struct Span {
    pub data: Vec<u8>,
    /// Capture timestamp of the segment that completed the span
    pub timestamp: DateTime<Utc>,
    /// Bytes skipped ahead of this span; -1 when the stream start was
    /// never observed (missing-init pickup)
    pub skipped: i64,
    /// Bytes deduplicated from overlapping segments
    pub overlap_bytes: usize,
    /// Number of segments merged into this span
    pub chunks: usize,
    /// True for the first span of a stream whose SYN was seen
    pub start: bool,
    /// True when this span ends the stream
    pub end: bool,
}

/// Per-call accounting for one `add_segment`
#[derive(Debug, Default)]
pub struct SegmentOutcome {
    pub span: Option<Span>,
    /// Bytes parked out of order by this call
    pub queued_bytes: usize,
    /// Bytes discarded as duplicates by this call
    pub overlap_bytes: usize,
    /// Bytes dropped because the pending buffer was full or the gap too big
    pub dropped_bytes: usize,
}

/// Sequence-ordered reassembly buffer for one direction
#[derive(Debug, Default)]
pub struct StreamBuffer {
    /// Next expected sequence number, unset until initialized
    next_seq: Option<u32>,
    /// SYN was observed for this direction
    start_seen: bool,
    /// First span has been delivered
    delivered_first: bool,
    /// Out-of-order segments: seq -> (data, timestamp)
    pending: BTreeMap<u32, (Vec<u8>, DateTime<Utc>)>,
    pending_bytes: usize,

    max_seq_gap: u32,
    max_pending_bytes: usize,

    /// Total in-order bytes delivered
    pub delivered_bytes: u64,
}

fn seq_before(a: u32, b: u32) -> bool {
    let diff = b.wrapping_sub(a);
    diff > 0 && diff < (1 << 31)
}

impl StreamBuffer {
    pub fn new(max_seq_gap: u32, max_pending_bytes: usize) -> Self {
        Self {
            max_seq_gap,
            max_pending_bytes,
            ..Default::default()
        }
    }

    /// Record the ISN from a SYN segment. The SYN consumes one sequence
    /// number.
    pub fn set_initial_seq(&mut self, seq: u32) {
        self.next_seq = Some(seq.wrapping_add(1));
        self.start_seen = true;
    }

    /// Feed one segment; any released contiguous run comes back as a span.
    pub fn add_segment(&mut self, seq: u32, data: &[u8], ts: DateTime<Utc>) -> SegmentOutcome {
        let mut outcome = SegmentOutcome::default();
        if data.is_empty() {
            return outcome;
        }

        let next = match self.next_seq {
            Some(n) => n,
            None => {
                // stream picked up mid-connection
                self.next_seq = Some(seq);
                seq
            }
        };

        let (seq, data) = if seq_before(seq, next) {
            // segment starts behind the delivery point
            let overlap = next.wrapping_sub(seq) as usize;
            if overlap >= data.len() {
                // full retransmission
                outcome.overlap_bytes = data.len();
                return outcome;
            }
            outcome.overlap_bytes = overlap;
            (next, &data[overlap..])
        } else {
            (seq, data)
        };

        if seq == next {
            let mut merged = data.to_vec();
            let mut chunks = 1;
            let mut overlap = outcome.overlap_bytes;
            let mut new_next = next.wrapping_add(data.len() as u32);

            // drain parked segments that are now contiguous
            while let Some((&pseq, _)) = self.pending.first_key_value() {
                if seq_before(pseq, new_next) || pseq == new_next {
                    let (pdata, _pts) = self.pending.remove(&pseq).unwrap();
                    self.pending_bytes -= pdata.len();

                    let skip = new_next.wrapping_sub(pseq) as usize;
                    if skip >= pdata.len() {
                        overlap += pdata.len();
                        continue;
                    }
                    overlap += skip;
                    merged.extend_from_slice(&pdata[skip..]);
                    new_next = new_next.wrapping_add((pdata.len() - skip) as u32);
                    chunks += 1;
                } else {
                    break;
                }
            }

            self.next_seq = Some(new_next);
            self.delivered_bytes += merged.len() as u64;

            let first = !self.delivered_first;
            self.delivered_first = true;

            outcome.overlap_bytes = overlap;
            outcome.span = Some(Span {
                data: merged,
                timestamp: ts,
                skipped: if first && !self.start_seen { -1 } else { 0 },
                overlap_bytes: overlap,
                chunks,
                start: first && self.start_seen,
                end: false,
            });

            return outcome;
        }

        // future segment, park it when the gap is plausible
        let gap = seq.wrapping_sub(next);
        if gap <= self.max_seq_gap && self.pending_bytes + data.len() <= self.max_pending_bytes {
            if let Some((old, _)) = self.pending.get(&seq) {
                // duplicate of a parked segment, keep the longer one
                outcome.overlap_bytes += old.len().min(data.len());
                if data.len() <= old.len() {
                    return outcome;
                }
                self.pending_bytes -= old.len();
            }
            self.pending_bytes += data.len();
            self.pending.insert(seq, (data.to_vec(), ts));
            outcome.queued_bytes = data.len();
        } else {
            outcome.dropped_bytes = data.len();
        }

        outcome
    }

    /// Jump over the current gap and release whatever is parked behind it.
    /// Used by timeout-driven flushing; the returned span reports the
    /// skipped byte count so the caller can decide to drop it.
    pub fn skip_gap(&mut self) -> Option<Span> {
        let next = self.next_seq?;
        let (&first_seq, _) = self.pending.first_key_value()?;

        let skipped = first_seq.wrapping_sub(next) as i64;
        self.next_seq = Some(first_seq);

        // re-feed through the in-order path
        let (data, ts) = self.pending.remove(&first_seq)?;
        self.pending_bytes -= data.len();

        let mut outcome = self.add_segment(first_seq, &data, ts);
        if let Some(span) = outcome.span.as_mut() {
            span.skipped = skipped;
        }

        outcome.span
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Timestamp of the oldest parked segment
    pub fn oldest_pending(&self) -> Option<DateTime<Utc>> {
        self.pending.values().map(|(_, ts)| *ts).min()
    }
}
