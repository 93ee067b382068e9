//! Engine-level error taxonomy.
//!
//! Parse failures and stranger datagrams never surface here — the drain
//! step drops them silently.  Everything below unwinds to the top of an
//! engine's `run()`, which closes the socket and maps to a nonzero exit.

use crate::socket::SocketError;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// File I/O on the input or output file failed.
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The UDP socket failed at the OS level.
    #[error(transparent)]
    Socket(SocketError),

    /// No valid SYN+ACK after all handshake retries.
    #[error("handshake failed after retries")]
    HandshakeFailed,

    /// The peer sent RST.
    #[error("connection reset by peer")]
    PeerReset,

    /// One segment exceeded the retransmission budget.
    #[error("segment {0} exceeded {1} retransmits, connection lost")]
    RetransmitLimit(u32, u32),

    /// Sender: no ACK for the global deadline; receiver: the peer went
    /// silent for too many consecutive timeouts.
    #[error("peer unresponsive, connection lost")]
    GlobalTimeout,
}

impl From<SocketError> for TransferError {
    fn from(e: SocketError) -> Self {
        match e {
            // Decode failures must be swallowed at the drain step; reaching
            // this conversion with one is an engine bug in debug builds.
            SocketError::Decode(_) => {
                debug_assert!(false, "decode errors are dropped, not propagated");
                Self::Socket(e)
            }
            SocketError::Io(_) => Self::Socket(e),
        }
    }
}
