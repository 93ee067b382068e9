//! Active-open transfer engine.
//!
//! [`Sender`] owns one side of a connection: it performs the three-way
//! handshake, slices the input file into segments, and drives a
//! single-task event loop until every segment is acknowledged and the
//! close handshake completes (or a fatal error unwinds).
//!
//! # Event loop
//!
//! One iteration does, in order:
//! 1. transmit new segments while the effective window has room,
//! 2. drain at most one inbound datagram (bounded wait ≤ 50 ms),
//! 3. scan in-flight segments for RTO expiry,
//! 4. fire the persist timer when the peer's window is closed,
//! 5. send/retransmit FIN once everything is acknowledged.
//!
//! All timers are polled against the loop; the bounded socket wait in
//! step 2 is the only suspension point, which gives every timer sub-100-ms
//! accuracy without a timer queue.  There are no per-segment tasks.

use std::fs::File;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::congestion::CongestionControl;
use crate::error::TransferError;
use crate::packet::{flags, generate_isn, Header, Packet, SACK_BITS};
use crate::send_window::{effective_window, SendWindow};
use crate::simulator::{Simulator, SimulatorConfig};
use crate::socket::Socket;
use crate::state::ConnectionState;
use crate::stats::TransferStats;
use crate::timer::{RtoEstimator, DATA_TIMEOUT, HANDSHAKE_TIMEOUT, RECV_SLICE};

const MAX_HANDSHAKE_RETRIES: u32 = 5;
const MAX_FIN_RETRIES: u32 = 5;
/// Retransmission budget per segment; exceeding it aborts the connection.
const MAX_RETRANSMITS: u32 = 15;
/// SACK-gap retransmissions allowed per incoming ACK.
const MAX_SACK_RETX_PER_ACK: usize = 4;
/// Abort when no ACK has arrived for this long.
const GLOBAL_TIMEOUT: Duration = Duration::from_secs(30);
/// First persist probe fires this long after the window closes.
const PERSIST_INITIAL: Duration = Duration::from_secs(5);
const PERSIST_MAX: Duration = Duration::from_secs(60);
const MAX_PERSIST_BACKOFF: u32 = 12;
/// Progress reports are rate-limited to one per interval.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Reliable-transfer sender for one file over one connection.
pub struct Sender {
    link: Simulator,
    peer: SocketAddr,
    /// Local advertised window, capped to the SACK width.
    window_size: u16,
    window: SendWindow,
    congestion: CongestionControl,
    rto: RtoEstimator,
    pub stats: TransferStats,
    /// Current FSM state.
    pub state: ConnectionState,

    isn: u32,
    peer_isn: u32,
    peer_wnd: u16,
    last_ack_at: Instant,

    zero_window: bool,
    persist_backoff: u32,
    persist_deadline: Option<Instant>,

    fin_sent: bool,
    fin_complete: bool,
    fin_abandoned: bool,
    fin_last_send: Option<Instant>,
    fin_retries: u32,
    data_end_recorded: bool,

    bytes_acked: u64,
    last_progress_percent: u64,
    last_progress_at: Instant,
}

impl Sender {
    /// Open `input` and prepare a transfer to `peer` over `socket`.
    ///
    /// `window_size` is clamped to `[1, 32]` (the SACK bitmap width).
    pub fn new(
        socket: Socket,
        peer: SocketAddr,
        input: &Path,
        window_size: u16,
    ) -> Result<Self, TransferError> {
        let file = File::open(input)?;
        let file_size = file.metadata()?.len();
        let window_size = window_size.clamp(1, SACK_BITS as u16);
        Ok(Self {
            link: Simulator::passthrough(socket),
            peer,
            window_size,
            window: SendWindow::new(Box::new(file), file_size),
            congestion: CongestionControl::new(f64::from(window_size)),
            rto: RtoEstimator::new(),
            stats: TransferStats::default(),
            state: ConnectionState::Closed,
            isn: 0,
            peer_isn: 0,
            peer_wnd: 0,
            last_ack_at: Instant::now(),
            zero_window: false,
            persist_backoff: 0,
            persist_deadline: None,
            fin_sent: false,
            fin_complete: false,
            fin_abandoned: false,
            fin_last_send: None,
            fin_retries: 0,
            data_end_recorded: false,
            bytes_acked: 0,
            last_progress_percent: u64::MAX,
            last_progress_at: Instant::now(),
        })
    }

    /// Install a fault model on the outgoing path (test hook).
    pub fn set_fault_injection(&mut self, config: SimulatorConfig, seed: u64) {
        self.link.set_config(config, seed);
    }

    /// Run the transfer to completion.
    ///
    /// Blocks (asynchronously) until the file is transferred and the close
    /// handshake finishes, or a fatal error occurs.  An unconfirmed FIN
    /// after all retries is logged but still counts as success — the data
    /// itself was delivered.
    pub async fn run(&mut self) -> Result<(), TransferError> {
        self.handshake().await?;

        log::info!(
            "[send] transferring {} bytes in {} segments to {} (window {})",
            self.window.file_size(),
            self.window.total_segments(),
            self.peer,
            self.window_size
        );

        // The handshake recorded the peer's advertised window; seed the
        // congestion controller with it.
        if self.peer_wnd == 0 {
            self.peer_wnd = self.window_size;
        }
        self.congestion = CongestionControl::new(f64::from(self.peer_wnd));
        self.last_ack_at = Instant::now();

        while !self.fin_complete && !self.fin_abandoned {
            if self.last_ack_at.elapsed() > GLOBAL_TIMEOUT {
                log::error!(
                    "[send] no ACK for {}s, connection lost",
                    GLOBAL_TIMEOUT.as_secs()
                );
                self.send_rst().await;
                return Err(TransferError::GlobalTimeout);
            }

            self.pump_new_data().await?;
            self.drain_network().await?;
            self.scan_timeouts().await?;
            self.poll_persist().await?;

            if !self.data_end_recorded && self.window.all_acked() {
                self.stats.mark_end();
                self.data_end_recorded = true;
            }

            self.drive_fin().await?;
        }

        if !self.data_end_recorded {
            self.stats.mark_end();
        }
        self.report_progress(true);
        self.stats.log_summary(
            self.window.file_size(),
            self.window.total_segments(),
            self.congestion.cwnd(),
            self.congestion.ssthresh(),
        );
        if self.fin_abandoned {
            log::warn!("[send] close handshake did not complete cleanly");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Handshake and teardown
    // -----------------------------------------------------------------------

    async fn handshake(&mut self) -> Result<(), TransferError> {
        self.isn = generate_isn(self.link.local_addr(), self.peer);
        let syn = Packet::control(Header {
            seq: self.isn,
            wnd: self.window_size,
            flags: flags::SYN,
            ..Header::default()
        });
        self.state = ConnectionState::SynSent;

        for attempt in 1..=MAX_HANDSHAKE_RETRIES {
            log::debug!(
                "[send] → SYN seq={} (attempt {attempt}/{MAX_HANDSHAKE_RETRIES})",
                self.isn
            );
            self.link.send_to(&syn, self.peer).await?;

            let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let (pkt, from) = match timeout(remaining, self.link.recv_from()).await {
                    Err(_) => break,
                    Ok(Err(e)) if e.is_decode() => continue,
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(v)) => v,
                };
                if from != self.peer {
                    log::debug!("[send] ignoring handshake response from {from}");
                    continue;
                }
                let h = &pkt.header;
                if h.has(flags::RST) {
                    log::error!("[send] ← RST during handshake");
                    self.state = ConnectionState::Closed;
                    return Err(TransferError::PeerReset);
                }
                if h.has(flags::SYN) && h.has(flags::ACK) && h.ack == self.isn.wrapping_add(1) {
                    self.peer_isn = h.seq;
                    self.peer_wnd = h.wnd.min(SACK_BITS as u16);
                    let ack = Packet::control(Header {
                        seq: self.isn.wrapping_add(1),
                        ack: self.peer_isn.wrapping_add(1),
                        wnd: self.window_size,
                        flags: flags::ACK,
                        ..Header::default()
                    });
                    self.link.send_to(&ack, self.peer).await?;
                    self.state = ConnectionState::Established;
                    self.last_ack_at = Instant::now();
                    log::debug!(
                        "[send] ← SYN+ACK (peer isn={}, wnd={}); handshake complete",
                        self.peer_isn,
                        self.peer_wnd
                    );
                    return Ok(());
                }
            }
        }

        log::warn!("[send] handshake failed after {MAX_HANDSHAKE_RETRIES} attempts");
        self.send_rst().await;
        Err(TransferError::HandshakeFailed)
    }

    /// Best-effort RST; used on every abort path.
    async fn send_rst(&mut self) {
        let rst = Packet::control(Header {
            seq: self.isn.wrapping_add(1),
            ack: self.peer_isn.wrapping_add(1),
            flags: flags::RST,
            ..Header::default()
        });
        if let Err(e) = self.link.send_to(&rst, self.peer).await {
            log::debug!("[send] RST send failed: {e}");
        }
        self.state = ConnectionState::Closed;
        log::debug!("[send] → RST");
    }

    fn fin_packet(&self) -> Packet {
        Packet::control(Header {
            seq: self.isn.wrapping_add(self.window.total_segments() + 1),
            wnd: self.window_size,
            flags: flags::FIN,
            ..Header::default()
        })
    }

    /// Send FIN once all data is acknowledged; retransmit on timeout.
    async fn drive_fin(&mut self) -> Result<(), TransferError> {
        if self.fin_complete || self.fin_abandoned || !self.window.all_acked() {
            return Ok(());
        }
        if !self.fin_sent {
            let fin = self.fin_packet();
            self.link.send_to(&fin, self.peer).await?;
            self.fin_sent = true;
            self.fin_retries = 0;
            self.fin_last_send = Some(Instant::now());
            self.state = ConnectionState::FinWait;
            log::debug!("[send] → FIN seq={}", fin.header.seq);
            return Ok(());
        }
        if self
            .fin_last_send
            .is_some_and(|t| t.elapsed() > HANDSHAKE_TIMEOUT)
        {
            if self.fin_retries < MAX_FIN_RETRIES {
                self.fin_retries += 1;
                let fin = self.fin_packet();
                self.link.send_to(&fin, self.peer).await?;
                self.fin_last_send = Some(Instant::now());
                log::debug!(
                    "[send] retrying FIN ({}/{MAX_FIN_RETRIES})",
                    self.fin_retries
                );
            } else {
                self.fin_abandoned = true;
            }
        }
        Ok(())
    }

    /// Peer confirmed our FIN: reply with the final ACK and finish.
    async fn finish_close(&mut self) -> Result<(), TransferError> {
        let final_ack = Packet::control(Header {
            seq: self.peer_isn.wrapping_add(1),
            ack: self
                .isn
                .wrapping_add(self.window.total_segments())
                .wrapping_add(2),
            wnd: self.window_size,
            flags: flags::ACK,
            ..Header::default()
        });
        self.link.send_to(&final_ack, self.peer).await?;
        self.fin_complete = true;
        self.state = ConnectionState::Closed;
        log::debug!("[send] ← FIN+ACK; → final ACK, connection closed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Data path
    // -----------------------------------------------------------------------

    /// Send or retransmit segment `seq` (relative index).
    async fn transmit_segment(&mut self, seq: u32) -> Result<(), TransferError> {
        let now = Instant::now();
        let (payload, is_retransmit, over_budget) = {
            let seg = self.window.segment(seq)?;
            let is_retransmit = seg.sent;
            if is_retransmit {
                seg.retrans_count += 1;
                seg.is_retransmitted = true;
            } else {
                // First transmission: timestamp for RTT sampling.
                seg.first_send = Some(now);
            }
            seg.sent = true;
            seg.last_send = Some(now);
            (
                seg.data.clone(),
                is_retransmit,
                seg.retrans_count > MAX_RETRANSMITS,
            )
        };

        if over_budget {
            log::error!("[send] segment {seq} exceeded {MAX_RETRANSMITS} retransmits");
            self.send_rst().await;
            return Err(TransferError::RetransmitLimit(seq, MAX_RETRANSMITS));
        }

        self.stats.mark_start();
        let pkt = Packet {
            header: Header {
                seq: self.isn.wrapping_add(seq),
                wnd: self.window_size,
                flags: flags::DATA,
                ..Header::default()
            },
            payload,
        };
        self.link.send_to(&pkt, self.peer).await?;
        if is_retransmit {
            self.stats.record_retransmit();
        }
        Ok(())
    }

    /// Fill the effective window with never-sent segments.
    async fn pump_new_data(&mut self) -> Result<(), TransferError> {
        if self.peer_wnd == 0 {
            // Closed peer window: the persist timer owns this case.
            return Ok(());
        }
        let cap = effective_window(
            self.window_size,
            self.peer_wnd,
            self.congestion.cwnd(),
            SACK_BITS,
        ) as u32;

        while self.window.next_seq() <= self.window.total_segments()
            && self.window.next_seq() < self.window.base_seq().saturating_add(cap)
        {
            let seq = self.window.next_seq();
            if self.window.peek(seq).is_some_and(|s| s.sent) {
                break;
            }
            self.transmit_segment(seq).await?;
            self.window.advance_next_seq();
        }
        Ok(())
    }

    /// Block up to [`RECV_SLICE`] for one datagram and dispatch it.
    async fn drain_network(&mut self) -> Result<(), TransferError> {
        let (pkt, from) = match timeout(RECV_SLICE, self.link.recv_from()).await {
            Err(_) => return Ok(()), // quiet slice; timers run next
            Ok(Err(e)) if e.is_decode() => return Ok(()), // malformed: drop
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(v)) => v,
        };
        if from != self.peer {
            return Ok(()); // stranger datagram: drop
        }

        let h = pkt.header;
        if h.has(flags::RST) {
            log::error!("[send] ← RST, connection reset by peer");
            self.state = ConnectionState::Closed;
            return Err(TransferError::PeerReset);
        }
        if h.has(flags::FIN) && h.has(flags::ACK) {
            // Only meaningful once our FIN is out; anything earlier is a
            // stray and is dropped.
            if self.state == ConnectionState::FinWait {
                return self.finish_close().await;
            }
            return Ok(());
        }
        if h.has(flags::ACK) {
            return self.handle_ack(&h).await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // ACK processing
    // -----------------------------------------------------------------------

    async fn handle_ack(&mut self, h: &Header) -> Result<(), TransferError> {
        self.last_ack_at = Instant::now();

        // Window advertisement, capped to the SACK width; detect zero-window
        // transitions for the persist machinery.
        let new_peer_wnd = h.wnd.min(SACK_BITS as u16);
        if new_peer_wnd == 0 && !self.zero_window {
            self.zero_window = true;
            self.persist_backoff = 0;
            self.persist_deadline = Some(Instant::now() + PERSIST_INITIAL);
            log::info!("[send] peer advertised zero window, persist timer armed");
        } else if new_peer_wnd > 0 && self.zero_window {
            self.zero_window = false;
            self.persist_backoff = 0;
            self.persist_deadline = None;
            log::info!("[send] peer window reopened ({new_peer_wnd})");
        }
        self.peer_wnd = new_peer_wnd;

        // Work in relative segment indices from here on.
        let ack = h.ack.wrapping_sub(self.isn);
        let total = self.window.total_segments();
        if ack == 0 || ack > total + 1 {
            return Ok(()); // predates our ISN or names segments we never sent
        }

        let base = self.window.base_seq();
        if ack > base {
            self.handle_new_ack(ack).await?;
        } else if ack == base && base <= total {
            self.handle_duplicate_ack().await?;
        }
        // ack < base: stale cumulative value; the SACK mask may still be news.

        self.handle_sack(ack, h.sack_mask).await?;

        // SACK may have filled the hole at `base` even when the cumulative
        // value did not move.
        self.window.advance_base_seq();
        self.report_progress(false);
        Ok(())
    }

    /// Cumulative ACK advanced the window: sample RTT, slide, grow cwnd.
    async fn handle_new_ack(&mut self, ack: u32) -> Result<(), TransferError> {
        let now = Instant::now();
        let total = self.window.total_segments();
        let upper = ack.min(total + 1);

        // Karn: sample RTT from the first covered segment that was sent
        // exactly once.  One sample per ACK is enough.
        for seq in self.window.base_seq()..upper {
            let Some(seg) = self.window.peek(seq) else {
                continue;
            };
            if !seg.acked && seg.sent && !seg.is_retransmitted {
                if let Some(first) = seg.first_send {
                    self.rto.record_sample(now.duration_since(first));
                }
                break;
            }
        }

        for seq in self.window.base_seq()..upper {
            if !self.window.peek(seq).is_some_and(|s| s.acked) {
                self.bytes_acked += self.window.segment_len(seq) as u64;
                self.window.mark_acked(seq);
            }
        }
        self.window.set_base_seq(upper);

        let partial = self.congestion.on_new_ack(ack, self.window.next_seq());
        if partial && ack <= total && !self.window.peek(ack).is_some_and(|s| s.acked) {
            // NewReno: the partial ACK points at the next lost segment.
            log::debug!("[send] partial-ack retransmit seq={ack}");
            self.transmit_segment(ack).await?;
        }
        Ok(())
    }

    async fn handle_duplicate_ack(&mut self) -> Result<(), TransferError> {
        self.congestion.on_duplicate_ack();
        if self.congestion.should_fast_retransmit() {
            self.congestion.on_fast_retransmit(self.window.next_seq());
            let base = self.window.base_seq();
            if base <= self.window.total_segments() {
                self.stats.record_fast_retransmit();
                log::debug!("[send] fast retransmit seq={base}");
                self.transmit_segment(base).await?;
            }
        }
        Ok(())
    }

    /// Apply the SACK bitmap: mark reported segments, probe-retransmit gaps.
    async fn handle_sack(&mut self, ack: u32, mask: u32) -> Result<(), TransferError> {
        let total = self.window.total_segments();

        for i in 0..SACK_BITS as u32 {
            if mask & (1 << i) == 0 {
                continue;
            }
            let seq = ack + 1 + i;
            if seq > total {
                break;
            }
            if self
                .window
                .peek(seq)
                .is_some_and(|s| s.sent && !s.acked)
            {
                self.bytes_acked += self.window.segment_len(seq) as u64;
                self.window.mark_acked(seq);
            }
        }

        // Clear bits below the highest set bit are holes on the receiver.
        // Retransmit a few per ACK, paced so the same gap is not hammered
        // faster than half a DATA_TIMEOUT.
        let now = Instant::now();
        let mut gap_retx = 0usize;
        for i in 0..SACK_BITS as u32 {
            if gap_retx >= MAX_SACK_RETX_PER_ACK {
                break;
            }
            let seq = ack + 1 + i;
            if seq > total {
                break;
            }
            if mask & (1 << i) != 0 {
                continue;
            }
            let eligible = self.window.peek(seq).is_some_and(|seg| {
                seg.sent
                    && !seg.acked
                    && seg
                        .last_sack_retx
                        .into_iter()
                        .chain(seg.last_send)
                        .max()
                        .map_or(true, |t| now >= t + DATA_TIMEOUT / 2)
            });
            if eligible {
                gap_retx += 1;
                self.window.segment(seq)?.last_sack_retx = Some(now);
                log::debug!("[send] sack gap retransmit seq={seq}");
                self.transmit_segment(seq).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Retransmit any in-flight segment whose RTO expired.
    async fn scan_timeouts(&mut self) -> Result<(), TransferError> {
        let now = Instant::now();
        for seq in self.window.base_seq()..self.window.next_seq() {
            let rto = self.rto.current();
            let expired = self.window.peek(seq).is_some_and(|seg| {
                seg.sent
                    && !seg.acked
                    && seg
                        .last_send
                        .is_some_and(|t| now.duration_since(t) > rto)
            });
            if !expired {
                continue;
            }
            self.stats.record_timeout();
            log::debug!("[send] timeout seq={seq} (rto={rto:?}), retransmitting");
            self.congestion.on_timeout();
            self.rto.back_off();
            self.transmit_segment(seq).await?;
        }
        Ok(())
    }

    /// While the peer's window is closed, probe it with exponential backoff.
    async fn poll_persist(&mut self) -> Result<(), TransferError> {
        if !self.zero_window {
            return Ok(());
        }
        let due = self.persist_deadline.is_some_and(|d| Instant::now() >= d);
        if !due {
            return Ok(());
        }

        let probe = Packet::control(Header {
            seq: self.isn.wrapping_add(self.window.next_seq()),
            wnd: self.window_size,
            flags: flags::ACK,
            ..Header::default()
        });
        self.link.send_to(&probe, self.peer).await?;

        self.persist_backoff = (self.persist_backoff + 1).min(MAX_PERSIST_BACKOFF);
        let interval = PERSIST_INITIAL
            .saturating_mul(1u32 << self.persist_backoff.min(4))
            .min(PERSIST_MAX);
        self.persist_deadline = Some(Instant::now() + interval);
        log::debug!(
            "[send] window probe (backoff {}, next in {interval:?})",
            self.persist_backoff
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    fn report_progress(&mut self, force: bool) {
        let size = self.window.file_size();
        if size == 0 {
            return;
        }
        let percent = (self.bytes_acked * 100 / size).min(100);
        let now = Instant::now();
        if !force {
            if percent == self.last_progress_percent {
                return;
            }
            if now.duration_since(self.last_progress_at) < PROGRESS_INTERVAL {
                return;
            }
        }
        self.last_progress_at = now;
        self.last_progress_percent = percent;
        log::info!(
            "[send] progress {percent}% ({}/{} bytes)",
            self.bytes_acked,
            size
        );
    }
}
