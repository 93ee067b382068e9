//! Send-side sliding window.
//!
//! [`SendWindow`] tracks the state of every file segment for one outbound
//! transfer: whether it was sent, acknowledged, when it was last (re)sent,
//! and the Karn retransmission flag.  Segments are addressed by their
//! 1-based relative index `k ∈ [1, N]`; the sender adds the connection ISN
//! when putting a segment on the wire.
//!
//! # Window layout
//!
//! ```text
//!       base              next
//!        │                  │
//!   ─────┼──────────────────┼──────────────────▶ segment index k
//!  acked │ ◀── in flight ──▶│ ◀── never sent ──▶
//! ```
//!
//! Invariant: `1 ≤ base ≤ next ≤ N + 1`; everything below `base` is
//! acknowledged, nothing at or above `next` has been sent.
//!
//! Storage is sparse: segment state is materialised on first touch and the
//! payload is read lazily from the backing source, then dropped again once
//! the segment is acknowledged.  Only the in-flight span ever occupies
//! memory, which keeps large transfers cheap.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::time::Instant;

use crate::packet::MAX_PAYLOAD;

/// Byte source a window can slice segments out of.  Blanket-implemented for
/// anything seekable, notably `std::fs::File` and `io::Cursor`.
pub trait SegmentSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> SegmentSource for T {}

/// Per-segment bookkeeping.
#[derive(Debug, Default)]
pub struct Segment {
    /// Payload bytes; empty once acknowledged or before first load.
    pub data: Vec<u8>,
    loaded: bool,
    /// Transmitted at least once.
    pub sent: bool,
    /// Covered by a cumulative or selective acknowledgment.
    pub acked: bool,
    /// Most recent transmission, for the RTO scan.
    pub last_send: Option<Instant>,
    /// Most recent SACK-gap retransmission, for gap pacing.
    pub last_sack_retx: Option<Instant>,
    /// First transmission, for RTT sampling.
    pub first_send: Option<Instant>,
    /// Total retransmissions of this segment.
    pub retrans_count: u32,
    /// Karn flag: an RTT sample must never be taken from this segment.
    pub is_retransmitted: bool,
}

/// Sliding-window state for one outbound file transfer.
pub struct SendWindow {
    source: Box<dyn SegmentSource>,
    file_size: u64,
    total_segments: u32,
    base_seq: u32,
    next_seq: u32,
    segments: HashMap<u32, Segment>,
}

impl std::fmt::Debug for SendWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendWindow")
            .field("file_size", &self.file_size)
            .field("total_segments", &self.total_segments)
            .field("base_seq", &self.base_seq)
            .field("next_seq", &self.next_seq)
            .field("tracked", &self.segments.len())
            .finish()
    }
}

impl SendWindow {
    /// Build a window over `file_size` bytes of `source`.
    ///
    /// `N = ⌈file_size / MAX_PAYLOAD⌉`; a zero-byte file has zero segments
    /// and the window starts out fully acknowledged.
    pub fn new(source: Box<dyn SegmentSource>, file_size: u64) -> Self {
        let total_segments = file_size.div_ceil(MAX_PAYLOAD as u64) as u32;
        Self {
            source,
            file_size,
            total_segments,
            base_seq: 1,
            next_seq: 1,
            segments: HashMap::new(),
        }
    }

    pub fn total_segments(&self) -> u32 {
        self.total_segments
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Window left edge: smallest unacknowledged segment index.
    pub fn base_seq(&self) -> u32 {
        self.base_seq
    }

    /// Right edge of the transmitted region: smallest index never sent.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn advance_next_seq(&mut self) {
        self.next_seq += 1;
    }

    /// Payload length of segment `k`, without touching the source.
    pub fn segment_len(&self, seq: u32) -> usize {
        debug_assert!(seq >= 1 && seq <= self.total_segments);
        let start = u64::from(seq - 1) * MAX_PAYLOAD as u64;
        (self.file_size - start).min(MAX_PAYLOAD as u64) as usize
    }

    /// Access segment state, materialising it (and its payload) on first
    /// touch.  Acknowledged segments are returned without reloading data.
    pub fn segment(&mut self, seq: u32) -> io::Result<&mut Segment> {
        debug_assert!(seq >= 1 && seq <= self.total_segments);
        let seg = self.segments.entry(seq).or_default();
        if !seg.loaded && !seg.acked {
            let start = u64::from(seq - 1) * MAX_PAYLOAD as u64;
            let len = (self.file_size - start).min(MAX_PAYLOAD as u64) as usize;
            let mut data = vec![0u8; len];
            self.source.seek(SeekFrom::Start(start))?;
            self.source.read_exact(&mut data)?;
            seg.data = data;
            seg.loaded = true;
        }
        Ok(seg)
    }

    /// Inspect segment state without materialising it or loading payload.
    ///
    /// `None` means the segment was never touched (equivalently: never
    /// sent) or has already been released past the window's left edge.
    pub fn peek(&self, seq: u32) -> Option<&Segment> {
        self.segments.get(&seq)
    }

    /// Mark segment `k` acknowledged and drop its payload.  Idempotent;
    /// out-of-range indices are ignored.
    pub fn mark_acked(&mut self, seq: u32) {
        if seq == 0 || seq > self.total_segments {
            return;
        }
        let seg = self.segments.entry(seq).or_default();
        if !seg.acked {
            seg.acked = true;
            seg.loaded = true; // never reload a freed payload
            seg.data = Vec::new();
            seg.last_sack_retx = None;
        }
    }

    /// Slide the left edge forward over the acknowledged prefix, releasing
    /// per-segment state as it goes.
    pub fn advance_base_seq(&mut self) {
        while self.base_seq <= self.total_segments
            && self
                .segments
                .get(&self.base_seq)
                .is_some_and(|seg| seg.acked)
        {
            self.segments.remove(&self.base_seq);
            self.base_seq += 1;
        }
    }

    /// Jump the left edge to `seq` (a cumulative ACK value), erasing all
    /// state below it.  A no-op when `seq` is not ahead of `base`.
    pub fn set_base_seq(&mut self, seq: u32) {
        if seq <= self.base_seq {
            return;
        }
        self.segments.retain(|&k, _| k >= seq);
        self.base_seq = seq.min(self.total_segments + 1);
    }

    /// Every segment acknowledged: the left edge has passed the last one.
    pub fn all_acked(&self) -> bool {
        self.base_seq > self.total_segments
    }

    /// Sent-but-unacknowledged segment count.
    pub fn inflight(&self) -> usize {
        self.next_seq.saturating_sub(self.base_seq) as usize
    }
}

/// Effective transmission window: the advertised windows of both sides,
/// the congestion window, and the SACK bitmap width all cap it.
pub fn effective_window(local_wnd: u16, peer_wnd: u16, cwnd: f64, sack_bits: usize) -> usize {
    let mut cap = usize::from(local_wnd.min(peer_wnd));
    cap = cap.min(cwnd.floor() as usize);
    cap.min(sack_bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn window_over(bytes: Vec<u8>) -> SendWindow {
        let size = bytes.len() as u64;
        SendWindow::new(Box::new(Cursor::new(bytes)), size)
    }

    #[test]
    fn segment_count_rounds_up() {
        assert_eq!(window_over(vec![0; 1]).total_segments(), 1);
        assert_eq!(window_over(vec![0; MAX_PAYLOAD]).total_segments(), 1);
        assert_eq!(window_over(vec![0; MAX_PAYLOAD + 1]).total_segments(), 2);
        assert_eq!(window_over(Vec::new()).total_segments(), 0);
    }

    #[test]
    fn empty_file_is_immediately_complete() {
        let w = window_over(Vec::new());
        assert!(w.all_acked());
        assert_eq!(w.inflight(), 0);
    }

    #[test]
    fn payload_slicing_by_offset() {
        let mut data = vec![0xAA; MAX_PAYLOAD];
        data.extend_from_slice(b"tail");
        let mut w = window_over(data);

        assert_eq!(w.segment_len(1), MAX_PAYLOAD);
        assert_eq!(w.segment_len(2), 4);
        assert_eq!(w.segment(1).unwrap().data.len(), MAX_PAYLOAD);
        assert_eq!(w.segment(2).unwrap().data, b"tail");
    }

    #[test]
    fn payload_loads_lazily_and_is_freed_on_ack() {
        let mut w = window_over(vec![7; 100]);
        assert_eq!(w.segments.len(), 0);

        w.segment(1).unwrap();
        assert_eq!(w.segments[&1].data.len(), 100);

        w.mark_acked(1);
        assert!(w.segments[&1].data.is_empty());
        // Re-touching an acked segment must not reload the payload.
        assert!(w.segment(1).unwrap().data.is_empty());
    }

    #[test]
    fn mark_acked_is_idempotent_and_bounded() {
        let mut w = window_over(vec![1; 10]);
        w.mark_acked(0); // ignored
        w.mark_acked(5); // out of range, ignored
        w.mark_acked(1);
        w.mark_acked(1);
        assert!(w.segments[&1].acked);
    }

    #[test]
    fn advance_base_walks_acked_prefix() {
        let mut w = window_over(vec![2; MAX_PAYLOAD * 3]);
        for k in 1..=3 {
            w.segment(k).unwrap().sent = true;
            w.advance_next_seq();
        }

        w.mark_acked(1);
        w.mark_acked(3);
        w.advance_base_seq();
        assert_eq!(w.base_seq(), 2); // stops at the hole
        assert!(!w.all_acked());

        w.mark_acked(2);
        w.advance_base_seq();
        assert_eq!(w.base_seq(), 4);
        assert!(w.all_acked());
        assert!(w.segments.is_empty());
    }

    #[test]
    fn set_base_erases_passed_state() {
        let mut w = window_over(vec![3; MAX_PAYLOAD * 4]);
        for k in 1..=4 {
            w.segment(k).unwrap().sent = true;
            w.advance_next_seq();
        }

        w.set_base_seq(3);
        assert_eq!(w.base_seq(), 3);
        assert!(!w.segments.contains_key(&1));
        assert!(!w.segments.contains_key(&2));
        assert!(w.segments.contains_key(&3));

        // Going backwards is refused.
        w.set_base_seq(2);
        assert_eq!(w.base_seq(), 3);
    }

    #[test]
    fn inflight_counts_sent_unacked_span() {
        let mut w = window_over(vec![4; MAX_PAYLOAD * 5]);
        assert_eq!(w.inflight(), 0);
        for k in 1..=3 {
            w.segment(k).unwrap().sent = true;
            w.advance_next_seq();
        }
        assert_eq!(w.inflight(), 3);

        w.mark_acked(1);
        w.advance_base_seq();
        assert_eq!(w.inflight(), 2);
    }

    #[test]
    fn effective_window_takes_the_minimum() {
        assert_eq!(effective_window(32, 32, 64.0, 32), 32);
        assert_eq!(effective_window(32, 8, 64.0, 32), 8);
        assert_eq!(effective_window(32, 32, 5.9, 32), 5);
        assert_eq!(effective_window(16, 32, 64.0, 32), 16);
        assert_eq!(effective_window(32, 32, 0.5, 32), 0);
    }
}
