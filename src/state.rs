//! Connection finite-state machine (FSM) types.
//!
//! The states the transfer engines actually occupy, loosely following the
//! TCP state diagram (RFC 793 §3.2) collapsed to a simplex transfer.
//! Transitions live in [`crate::sender`] and [`crate::receiver`]; keeping
//! the type in its own module makes it easy to add guard logic or tracing
//! without touching engine plumbing.
//!
//! ```text
//!  sender:    Closed ──SYN──▶ SynSent ──SYN+ACK──▶ Established
//!                                                       │ all data acked
//!                                                       ▼
//!             Closed ◀──────FIN+ACK received────── FinWait
//!
//!  receiver:  Listen ──SYN──▶ SynReceived ──ACK/DATA──▶ Established
//!                                                       │ FIN received
//!                                                       ▼
//!             Closed ◀──────final ACK received───── LastAck
//! ```

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection exists; terminal state after close or abort.
    #[default]
    Closed,
    /// Passive side waiting for a SYN.
    Listen,
    /// SYN sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received; SYN+ACK sent; waiting for ACK (or implicit-ACK data).
    SynReceived,
    /// Handshake complete; data transfer in progress.
    Established,
    /// FIN sent; waiting for FIN+ACK.
    FinWait,
    /// FIN+ACK sent; waiting for the peer's final ACK.
    LastAck,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
