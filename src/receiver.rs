//! Passive-open transfer engine.
//!
//! [`Receiver`] accepts one connection, reassembles the incoming segment
//! stream, and appends the longest in-order prefix to the output file.
//! Every admitted data segment — new, duplicate, or out of window — is
//! answered with a cumulative ACK carrying the SACK bitmap, so the sender
//! always learns the receiver's exact state.
//!
//! Like the sender, this is a single task: one bounded socket wait per
//! loop iteration, no per-segment tasks, no shared state.

use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

use tokio::time::timeout;

use crate::error::TransferError;
use crate::packet::{flags, generate_isn, Header, Packet, SACK_BITS};
use crate::receive_buffer::{Admission, ReceiveBuffer};
use crate::simulator::{Simulator, SimulatorConfig};
use crate::socket::Socket;
use crate::state::ConnectionState;
use crate::stats::ReceiverStats;
use crate::timer::{DATA_TIMEOUT, HANDSHAKE_TIMEOUT};

const MAX_HANDSHAKE_RETRIES: u32 = 5;
const MAX_FIN_RETRIES: u32 = 5;
/// Consecutive empty [`DATA_TIMEOUT`] waits before the peer is presumed gone.
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 10;

/// Established-connection identity, pinned at handshake time.
struct PeerSession {
    addr: SocketAddr,
    peer_isn: u32,
    /// A data segment that arrived as the handshake's implicit ACK.
    pending: Option<Packet>,
}

/// Reliable-transfer receiver for one file over one connection.
pub struct Receiver {
    link: Simulator,
    /// Advertised window, capped to the SACK width.
    window_size: u16,
    pub stats: ReceiverStats,
    /// Current FSM state.
    pub state: ConnectionState,
}

impl Receiver {
    /// Prepare to accept one transfer on `socket`.
    ///
    /// `window_size` is clamped to `[1, 32]` (the SACK bitmap width).
    pub fn new(socket: Socket, window_size: u16) -> Self {
        Self {
            link: Simulator::passthrough(socket),
            window_size: window_size.clamp(1, SACK_BITS as u16),
            stats: ReceiverStats::default(),
            state: ConnectionState::Closed,
        }
    }

    /// Install a fault model on the outgoing path (test hook).
    pub fn set_fault_injection(&mut self, config: SimulatorConfig, seed: u64) {
        self.link.set_config(config, seed);
    }

    /// Accept one connection and receive the file into `output`.
    ///
    /// Blocks (asynchronously) until a clean FIN handshake, the peer
    /// disappears, or a fatal error occurs.
    pub async fn run(&mut self, output: &Path) -> Result<(), TransferError> {
        let mut session = self.accept().await?;
        let mut out = File::create(output)?;
        let mut buffer = ReceiveBuffer::new(self.window_size);
        self.stats.mark_start();

        let fin_ack = self
            .data_loop(&mut session, &mut buffer, &mut out)
            .await?;
        out.flush()?;
        self.await_final_ack(&session, fin_ack).await?;

        self.stats.mark_end();
        self.stats.log_summary();
        self.state = ConnectionState::Closed;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Handshake (passive open)
    // -----------------------------------------------------------------------

    /// Wait indefinitely for a SYN, then complete the three-way handshake.
    ///
    /// An unconfirmed handshake (no ACK, no data) falls back to waiting for
    /// a fresh SYN rather than giving up — the sender may simply have died
    /// before our SYN+ACK reached it.
    async fn accept(&mut self) -> Result<PeerSession, TransferError> {
        self.state = ConnectionState::Listen;
        log::info!("[recv] waiting for SYN on {}", self.link.local_addr());

        loop {
            let (pkt, from) = match self.link.recv_from().await {
                Err(e) if e.is_decode() => continue,
                Err(e) => return Err(e.into()),
                Ok(v) => v,
            };
            if !pkt.header.has(flags::SYN) {
                continue;
            }

            let peer = from;
            let peer_isn = pkt.header.seq;
            let isn = generate_isn(self.link.local_addr(), peer);
            self.state = ConnectionState::SynReceived;
            log::debug!("[recv] ← SYN from {peer} (peer isn={peer_isn})");

            let syn_ack = Packet::control(Header {
                seq: isn,
                ack: peer_isn.wrapping_add(1),
                wnd: self.window_size,
                flags: flags::SYN | flags::ACK,
                ..Header::default()
            });

            for attempt in 1..=MAX_HANDSHAKE_RETRIES {
                self.link.send_to(&syn_ack, peer).await?;
                log::debug!("[recv] → SYN+ACK (attempt {attempt}/{MAX_HANDSHAKE_RETRIES})");

                let (confirm, cfrom) =
                    match timeout(HANDSHAKE_TIMEOUT, self.link.recv_from()).await {
                        Err(_) => continue,
                        Ok(Err(e)) if e.is_decode() => continue,
                        Ok(Err(e)) => return Err(e.into()),
                        Ok(Ok(v)) => v,
                    };
                if cfrom != peer {
                    continue;
                }
                let h = &confirm.header;
                if h.has(flags::RST) {
                    log::error!("[recv] ← RST during handshake");
                    self.state = ConnectionState::Closed;
                    return Err(TransferError::PeerReset);
                }
                if h.has(flags::DATA) {
                    // The sender moved on to data: an implicit ACK.  Keep
                    // the segment; the data loop will admit it first.
                    self.state = ConnectionState::Established;
                    log::debug!("[recv] handshake completed (implicit ACK) with {peer}");
                    return Ok(PeerSession {
                        addr: peer,
                        peer_isn,
                        pending: Some(confirm),
                    });
                }
                if h.has(flags::ACK) && h.ack == isn.wrapping_add(1) {
                    self.state = ConnectionState::Established;
                    log::debug!("[recv] handshake completed with {peer}");
                    return Ok(PeerSession {
                        addr: peer,
                        peer_isn,
                        pending: None,
                    });
                }
            }

            log::warn!("[recv] handshake not confirmed, waiting for a new SYN");
            self.state = ConnectionState::Listen;
        }
    }

    // -----------------------------------------------------------------------
    // Data phase
    // -----------------------------------------------------------------------

    /// Receive data until FIN.  Returns the ACK value confirming the FIN.
    async fn data_loop(
        &mut self,
        session: &mut PeerSession,
        buffer: &mut ReceiveBuffer,
        out: &mut File,
    ) -> Result<u32, TransferError> {
        let mut consecutive_timeouts = 0u32;

        loop {
            let pkt = if let Some(pending) = session.pending.take() {
                pending
            } else {
                match timeout(DATA_TIMEOUT, self.link.recv_from()).await {
                    Err(_) => {
                        consecutive_timeouts += 1;
                        if consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                            log::error!(
                                "[recv] no traffic for {MAX_CONSECUTIVE_TIMEOUTS} intervals, \
                                 assuming peer is gone"
                            );
                            return Err(TransferError::GlobalTimeout);
                        }
                        continue;
                    }
                    Ok(Err(e)) if e.is_decode() => continue,
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok((pkt, from))) => {
                        if from != session.addr {
                            continue; // stranger datagram: drop
                        }
                        consecutive_timeouts = 0;
                        pkt
                    }
                }
            };

            let h = &pkt.header;
            if h.has(flags::RST) {
                log::error!("[recv] ← RST, connection reset by peer");
                self.state = ConnectionState::Closed;
                return Err(TransferError::PeerReset);
            }
            if h.has(flags::FIN) {
                let fin_ack = h.seq.wrapping_add(1);
                self.stats.mark_end();
                self.send_fin_ack(session.addr, fin_ack).await?;
                self.state = ConnectionState::LastAck;
                log::debug!("[recv] ← FIN; → FIN+ACK");
                return Ok(fin_ack);
            }
            if !h.has(flags::DATA) {
                continue; // window probes, stray ACKs: no reply
            }

            self.stats.total_packets += 1;
            let seq = h.seq.wrapping_sub(session.peer_isn);
            match buffer.admit(seq, pkt.payload) {
                Admission::AcceptedNew => {
                    if seq != buffer.expected_seq() {
                        self.stats.out_of_order_packets += 1;
                        log::debug!(
                            "[recv] out-of-order segment {seq} (expected {})",
                            buffer.expected_seq()
                        );
                    }
                    for chunk in buffer.drain_prefix() {
                        out.write_all(&chunk)?;
                        self.stats.bytes_written += chunk.len() as u64;
                    }
                }
                Admission::Duplicate => {
                    self.stats.duplicate_packets += 1;
                    log::debug!(
                        "[recv] duplicate segment {seq} (expected {})",
                        buffer.expected_seq()
                    );
                }
                Admission::OutOfWindow => {
                    log::debug!(
                        "[recv] segment {seq} outside window (expected {}, window {})",
                        buffer.expected_seq(),
                        self.window_size
                    );
                }
            }

            // Every data segment is answered, whatever its fate: the
            // cumulative point plus the SACK view of what lies beyond it.
            let ack = Packet::control(Header {
                ack: session.peer_isn.wrapping_add(buffer.expected_seq()),
                wnd: self.window_size,
                flags: flags::ACK,
                sack_mask: buffer.sack_mask(),
                ..Header::default()
            });
            self.link.send_to(&ack, session.addr).await?;
        }
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    async fn send_fin_ack(&mut self, peer: SocketAddr, fin_ack: u32) -> Result<(), TransferError> {
        let pkt = Packet::control(Header {
            ack: fin_ack,
            wnd: self.window_size,
            flags: flags::FIN | flags::ACK,
            ..Header::default()
        });
        self.link.send_to(&pkt, peer).await?;
        Ok(())
    }

    /// Wait for the sender's final ACK, re-sending FIN+ACK on timeout or on
    /// a retransmitted FIN.  Giving up is only worth a warning — the data
    /// is already on disk.
    async fn await_final_ack(
        &mut self,
        session: &PeerSession,
        fin_ack: u32,
    ) -> Result<(), TransferError> {
        let mut attempts = 0u32;
        while attempts < MAX_FIN_RETRIES {
            let (pkt, from) = match timeout(HANDSHAKE_TIMEOUT, self.link.recv_from()).await {
                Err(_) => {
                    attempts += 1;
                    log::debug!("[recv] retrying FIN+ACK ({attempts}/{MAX_FIN_RETRIES})");
                    self.send_fin_ack(session.addr, fin_ack).await?;
                    continue;
                }
                Ok(Err(e)) if e.is_decode() => continue,
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(v)) => v,
            };
            if from != session.addr {
                continue;
            }
            if pkt.header.has(flags::ACK) && !pkt.header.has(flags::FIN) {
                log::debug!("[recv] ← final ACK, close handshake complete");
                return Ok(());
            }
            if pkt.header.has(flags::FIN) {
                // The sender missed our FIN+ACK; repeat it.
                self.send_fin_ack(session.addr, fin_ack).await?;
                log::debug!("[recv] re-sent FIN+ACK on duplicate FIN");
            }
        }
        log::warn!("[recv] close handshake incomplete after retries");
        Ok(())
    }
}
