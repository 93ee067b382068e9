//! Transfer statistics.
//!
//! Both engines collect counters during a run and log a terminal summary;
//! `run()` also returns the stats so tests and callers can assert on them.

use std::time::{Duration, Instant};

/// Sender-side counters for one transfer.
#[derive(Debug, Default)]
pub struct TransferStats {
    /// Total retransmissions (timeout + fast + SACK-gap).
    pub retransmits: u32,
    /// Retransmissions triggered by the per-segment RTO scan.
    pub timeouts: u32,
    /// Retransmissions triggered by three duplicate ACKs.
    pub fast_retransmits: u32,
    start: Option<Instant>,
    end: Option<Instant>,
}

impl TransferStats {
    pub fn record_retransmit(&mut self) {
        self.retransmits += 1;
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    pub fn record_fast_retransmit(&mut self) {
        self.fast_retransmits += 1;
    }

    /// Stamp the start of the data phase (first call wins).
    pub fn mark_start(&mut self) {
        self.start.get_or_insert_with(Instant::now);
    }

    /// Stamp the end of the data phase (first call wins).
    pub fn mark_end(&mut self) {
        self.mark_start();
        self.end.get_or_insert_with(Instant::now);
    }

    pub fn elapsed(&self) -> Duration {
        match (self.start, self.end) {
            (Some(s), Some(e)) => e.duration_since(s),
            _ => Duration::ZERO,
        }
    }

    /// Average goodput in MiB/s over the data phase.
    pub fn throughput_mib(&self, bytes: u64) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            bytes as f64 / secs / 1024.0 / 1024.0
        } else {
            0.0
        }
    }

    /// Loss estimate: retransmissions as a percentage of total segments.
    pub fn loss_rate(&self, total_segments: u32) -> f64 {
        if total_segments > 0 {
            f64::from(self.retransmits) * 100.0 / f64::from(total_segments)
        } else {
            0.0
        }
    }

    pub fn log_summary(&self, file_size: u64, total_segments: u32, cwnd: f64, ssthresh: f64) {
        log::info!("transfer completed");
        log::info!("final cwnd: {cwnd:.2}, final ssthresh: {ssthresh:.2}");
        log::info!(
            "total retransmits: {} (timeout: {}, fast: {})",
            self.retransmits,
            self.timeouts,
            self.fast_retransmits
        );
        log::info!("loss-rate estimate: {:.2}%", self.loss_rate(total_segments));
        log::info!(
            "sent {} bytes in {:.3} s, avg throughput {:.2} MiB/s",
            file_size,
            self.elapsed().as_secs_f64(),
            self.throughput_mib(file_size)
        );
    }
}

/// Receiver-side counters for one transfer.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub total_packets: u32,
    pub duplicate_packets: u32,
    pub out_of_order_packets: u32,
    pub bytes_written: u64,
    start: Option<Instant>,
    end: Option<Instant>,
}

impl ReceiverStats {
    pub fn mark_start(&mut self) {
        self.start.get_or_insert_with(Instant::now);
    }

    pub fn mark_end(&mut self) {
        self.mark_start();
        self.end.get_or_insert_with(Instant::now);
    }

    pub fn elapsed(&self) -> Duration {
        match (self.start, self.end) {
            (Some(s), Some(e)) => e.duration_since(s),
            _ => Duration::ZERO,
        }
    }

    pub fn throughput_mib(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.bytes_written as f64 / secs / 1024.0 / 1024.0
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        log::info!("transfer completed");
        log::info!("total packets received: {}", self.total_packets);
        log::info!("out-of-order packets: {}", self.out_of_order_packets);
        log::info!("duplicate packets: {}", self.duplicate_packets);
        log::info!(
            "received {} bytes in {:.3} s, avg throughput {:.2} MiB/s",
            self.bytes_written,
            self.elapsed().as_secs_f64(),
            self.throughput_mib()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut s = TransferStats::default();
        s.record_timeout();
        s.record_retransmit();
        s.record_fast_retransmit();
        s.record_retransmit();
        assert_eq!(s.retransmits, 2);
        assert_eq!(s.timeouts, 1);
        assert_eq!(s.fast_retransmits, 1);
    }

    #[test]
    fn loss_rate_over_segments() {
        let mut s = TransferStats::default();
        for _ in 0..5 {
            s.record_retransmit();
        }
        assert_eq!(s.loss_rate(100), 5.0);
        assert_eq!(s.loss_rate(0), 0.0);
    }

    #[test]
    fn elapsed_zero_without_marks() {
        let s = TransferStats::default();
        assert_eq!(s.elapsed(), Duration::ZERO);
        assert_eq!(s.throughput_mib(1_000_000), 0.0);
    }

    #[test]
    fn mark_start_is_sticky() {
        let mut s = TransferStats::default();
        s.mark_start();
        let first = s.start;
        std::thread::sleep(Duration::from_millis(2));
        s.mark_start();
        assert_eq!(s.start, first);
        s.mark_end();
        assert!(s.elapsed() >= Duration::from_millis(1));
    }
}
