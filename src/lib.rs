//! `rtp-over-udp` — a reliable, TCP-flavoured file-transfer protocol
//! implemented from scratch over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  DATA segments   ┌──────────┐
//!  │  Sender  │─────────────────▶│ Receiver │
//!  └────┬─────┘                  └─────┬────┘
//!       │        ACK + SACK            │
//!       │◀──────────────────────────────┘
//!       │
//!  ┌────▼───────────────┐  ┌────────────────────┐
//!  │    SendWindow      │  │   ReceiveBuffer    │
//!  │ CongestionControl  │  │  (reassembly/SACK) │
//!  │   RtoEstimator     │  └────────────────────┘
//!  └────┬───────────────┘
//!       │ raw UDP datagrams
//!  ┌────▼──────┐
//!  │  Socket   │  (thin async wrapper around tokio UdpSocket)
//!  └───────────┘
//! ```
//!
//! One connection is simplex: one sender streams one file to one receiver.
//! Reliability comes from a three-way handshake, cumulative plus selective
//! acknowledgments, a sliding window bounded by flow control and NewReno
//! congestion control, Jacobson/Karn RTO estimation, persist-mode window
//! probing, and a FIN exchange with retries.
//!
//! Each module has a single responsibility:
//! - [`packet`]         — wire format, checksum, ISN derivation
//! - [`send_window`]    — per-segment send state and window edges
//! - [`congestion`]     — NewReno cwnd/ssthresh state machine
//! - [`receive_buffer`] — out-of-order reassembly and the SACK bitmap
//! - [`timer`]          — RTO estimation and shared timeout constants
//! - [`socket`]         — async UDP socket abstraction
//! - [`simulator`]      — lossy network layer for deterministic tests
//! - [`stats`]          — transfer statistics and summaries
//! - [`state`]          — connection FSM states
//! - [`error`]          — engine-level error taxonomy
//! - [`sender`]         — active-open engine (drives a whole transfer)
//! - [`receiver`]       — passive-open engine

pub mod congestion;
pub mod error;
pub mod packet;
pub mod receive_buffer;
pub mod receiver;
pub mod send_window;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stats;
pub mod timer;
