//! NewReno congestion control.
//!
//! Tracks the congestion window and slow-start threshold for one sending
//! connection: slow start, congestion avoidance, fast retransmit after three
//! duplicate ACKs, and NewReno fast recovery with partial-ACK detection.
//!
//! This module only manages state; the sender decides what to retransmit
//! and when, based on the signals returned here.
//!
//! # State machine
//!
//! ```text
//!            new ACK: cwnd += 1 (ss) | += 1/cwnd (ca)
//!              ┌────────────┐
//!              ▼            │
//!        ┌──────────────────┴─┐   3rd dup ACK    ┌───────────────┐
//!        │      open          │ ───────────────▶ │ fast recovery │
//!        └──────────────────▲─┘                  └──────┬────────┘
//!              ▲            │   full ACK (≥ recover)    │
//!              │            └────────────────────────── ┘
//!          timeout: cwnd = 1, exit recovery
//! ```

/// Floor for the slow-start threshold, in segments.  Keeps the pipe from
/// collapsing to a single in-flight segment under steady-state loss.
const MIN_SSTHRESH: f64 = 2.0;

/// Number of duplicate ACKs that triggers fast retransmit.
const DUP_ACK_THRESHOLD: u32 = 3;

/// NewReno congestion state for one connection.
#[derive(Debug)]
pub struct CongestionControl {
    /// Congestion window, in segments.  Fractional growth during
    /// congestion avoidance.
    cwnd: f64,
    /// Slow-start threshold, in segments.
    ssthresh: f64,
    /// Consecutive duplicate-ACK count outside fast recovery.
    dup_ack_count: u32,
    in_fast_recovery: bool,
    /// NewReno high-water mark: `next` at the moment fast recovery entered.
    /// Cumulative ACKs below this are partial ACKs.
    recover_seq: u32,
}

impl CongestionControl {
    /// `initial_ssthresh` is typically the peer's advertised window.
    pub fn new(initial_ssthresh: f64) -> Self {
        Self {
            cwnd: 1.0,
            ssthresh: initial_ssthresh.max(MIN_SSTHRESH),
            dup_ack_count: 0,
            in_fast_recovery: false,
            recover_seq: 0,
        }
    }

    /// Process a cumulative ACK that advances the window.
    ///
    /// Returns `true` when the ACK is a NewReno *partial* ACK — the caller
    /// should immediately retransmit the segment at `ack_seq` while staying
    /// in fast recovery.
    pub fn on_new_ack(&mut self, ack_seq: u32, _next_seq: u32) -> bool {
        self.dup_ack_count = 0;
        let mut is_partial = false;

        if self.in_fast_recovery {
            if ack_seq < self.recover_seq {
                // Partial ACK: more loss beyond the retransmitted segment.
                // Deflate by the amount the dup-ACK inflation overshot.
                self.cwnd = (self.cwnd - 1.0).max(self.ssthresh);
                is_partial = true;
                log::debug!(
                    "[cc] partial ack={} recover={} cwnd={:.2}",
                    ack_seq,
                    self.recover_seq,
                    self.cwnd
                );
            } else {
                self.cwnd = self.ssthresh;
                self.in_fast_recovery = false;
                log::debug!("[cc] full ack, leaving fast recovery (cwnd={:.2})", self.cwnd);
            }
        }

        if !self.in_fast_recovery {
            if self.cwnd < self.ssthresh {
                // Slow start: one segment per ACK.
                self.cwnd += 1.0;
            } else {
                // Congestion avoidance: ~one segment per RTT.
                self.cwnd += 1.0 / self.cwnd;
            }
        }

        is_partial
    }

    /// Process an ACK that does not advance the window.
    pub fn on_duplicate_ack(&mut self) {
        self.dup_ack_count += 1;
        if self.in_fast_recovery {
            // Each duplicate means one segment left the network.
            self.cwnd += 1.0;
        }
    }

    /// `true` exactly when the third duplicate ACK has just arrived and
    /// fast recovery has not been entered yet.
    pub fn should_fast_retransmit(&self) -> bool {
        self.dup_ack_count == DUP_ACK_THRESHOLD && !self.in_fast_recovery
    }

    /// Enter fast recovery.  `next_seq` becomes the NewReno high-water mark.
    pub fn on_fast_retransmit(&mut self, next_seq: u32) {
        self.ssthresh = (self.cwnd / 2.0).max(MIN_SSTHRESH);
        self.cwnd = self.ssthresh + 3.0;
        self.in_fast_recovery = true;
        self.recover_seq = next_seq;
        log::debug!(
            "[cc] 3 dup acks, fast retransmit (cwnd={:.2} ssthresh={:.2} recover={})",
            self.cwnd,
            self.ssthresh,
            self.recover_seq
        );
    }

    /// A retransmission timeout collapses the window back to slow start.
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2.0).max(MIN_SSTHRESH);
        self.cwnd = 1.0;
        self.dup_ack_count = 0;
        self.in_fast_recovery = false;
        self.recover_seq = 0;
        log::debug!(
            "[cc] timeout, back to slow start (ssthresh={:.2})",
            self.ssthresh
        );
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> f64 {
        self.ssthresh
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.in_fast_recovery
    }

    pub fn dup_ack_count(&self) -> u32 {
        self.dup_ack_count
    }
}
