//! Retransmission timing: shared timeout constants and RTO estimation.
//!
//! The RTO is computed with Jacobson's algorithm (RFC 6298):
//!   `RTO = SRTT + 4 × RTTVAR`
//! clamped to `[MIN_RTO, MAX_RTO]`, and doubles on each retransmission
//! timeout (Karn's exponential back-off).  Feeding a new RTT sample
//! recomputes the RTO from the smoothed estimates, which also ends any
//! back-off in effect.
//!
//! Karn's other half — never sampling RTT from a retransmitted segment —
//! is enforced by the sender, which tracks a per-segment retransmit flag.

use std::time::Duration;

/// Timeout for one handshake or FIN exchange attempt.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(800);

/// Inactivity timeout for one receiver wait; both peers assume this value.
pub const DATA_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on one socket wait in the sender's event loop.  Every timer
/// in the loop is polled at least this often.
pub const RECV_SLICE: Duration = Duration::from_millis(50);

/// RTO before the first RTT sample is available.
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Floor for the computed RTO.
pub const MIN_RTO: Duration = Duration::from_millis(50);

/// Ceiling for the computed RTO, including back-off.
pub const MAX_RTO: Duration = Duration::from_secs(60);

/// Smoothed RTO estimator for one connection.
#[derive(Debug)]
pub struct RtoEstimator {
    /// Current RTO, consulted by the per-segment timeout scan.
    current: Duration,
    /// Smoothed RTT estimate (SRTT).
    srtt: Option<Duration>,
    /// RTT variance estimate (RTTVAR).
    rttvar: Option<Duration>,
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RtoEstimator {
    pub fn new() -> Self {
        Self {
            current: INITIAL_RTO,
            srtt: None,
            rttvar: None,
        }
    }

    /// The RTO to apply to in-flight segments right now.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    ///
    /// The caller must only feed samples from segments that were never
    /// retransmitted (Karn's algorithm).
    pub fn record_sample(&mut self, sample: Duration) {
        match (self.srtt, self.rttvar) {
            (None, _) => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
            (Some(srtt), Some(rttvar)) => {
                let diff = if sample > srtt {
                    sample - srtt
                } else {
                    srtt - sample
                };
                self.rttvar = Some(rttvar * 3 / 4 + diff / 4);
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
            _ => unreachable!(),
        }
        self.rearm();
    }

    /// Double the RTO after a retransmission timeout (RFC 6298 §5.5).
    pub fn back_off(&mut self) {
        self.current = (self.current * 2).min(MAX_RTO);
    }

    /// Recompute `current` from the smoothed estimates, clamped to
    /// `[MIN_RTO, MAX_RTO]`.  Falls back to [`INITIAL_RTO`] before the
    /// first sample.
    fn rearm(&mut self) {
        self.current = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => (srtt + rttvar * 4).clamp(MIN_RTO, MAX_RTO),
            _ => INITIAL_RTO,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initialises_estimates() {
        let mut est = RtoEstimator::new();
        assert_eq!(est.current(), INITIAL_RTO);

        est.record_sample(Duration::from_millis(100));
        // SRTT = 100, RTTVAR = 50 → RTO = 100 + 200 = 300.
        assert_eq!(est.current(), Duration::from_millis(300));
    }

    #[test]
    fn steady_samples_converge() {
        let mut est = RtoEstimator::new();
        for _ in 0..50 {
            est.record_sample(Duration::from_millis(80));
        }
        // With zero jitter RTTVAR decays toward 0; RTO approaches SRTT and
        // is then clamped up to MIN_RTO + SRTT-ish territory.
        assert!(est.current() >= MIN_RTO);
        assert!(est.current() < Duration::from_millis(120));
    }

    #[test]
    fn min_rto_clamp_applies() {
        let mut est = RtoEstimator::new();
        for _ in 0..100 {
            est.record_sample(Duration::from_millis(1));
        }
        assert_eq!(est.current(), MIN_RTO);
    }

    #[test]
    fn back_off_doubles_and_caps() {
        let mut est = RtoEstimator::new();
        est.back_off();
        assert_eq!(est.current(), INITIAL_RTO * 2);

        for _ in 0..10 {
            est.back_off();
        }
        assert_eq!(est.current(), MAX_RTO);
    }

    #[test]
    fn sample_after_back_off_resets_rto() {
        let mut est = RtoEstimator::new();
        est.record_sample(Duration::from_millis(100));
        let settled = est.current();

        est.back_off();
        est.back_off();
        assert!(est.current() > settled);

        // A fresh (non-retransmitted) sample ends the back-off.
        est.record_sample(Duration::from_millis(100));
        assert!(est.current() <= settled);
    }
}
