//! Fault-injecting network layer for deterministic testing.
//!
//! Real networks drop, duplicate, and corrupt datagrams.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`Simulator`] wraps a [`Socket`] and applies a configurable fault model
//! on the send path:
//!
//! | Fault       | Description                                        |
//! |-------------|----------------------------------------------------|
//! | Loss        | Drop a datagram with probability `loss_rate`.      |
//! | Duplication | Deliver a datagram twice (`duplicate_rate`).       |
//! | Corruption  | Flip one random bit (`corrupt_rate`); the peer's   |
//! |             | checksum check then discards the datagram.         |
//!
//! The RNG is seeded so failing runs reproduce.  A pass-through simulator
//! (the default for both engines) adds no behaviour; production traffic
//! goes straight to the socket layer.

use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::Packet;
use crate::socket::{Socket, SocketError};

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    /// Probability that any given outgoing datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that an outgoing datagram is sent twice.
    pub duplicate_rate: f64,
    /// Probability that one bit of an outgoing datagram is flipped.
    pub corrupt_rate: f64,
}

impl SimulatorConfig {
    fn is_transparent(&self) -> bool {
        self.loss_rate == 0.0 && self.duplicate_rate == 0.0 && self.corrupt_rate == 0.0
    }
}

/// A fault-injecting wrapper around the socket layer.
#[derive(Debug)]
pub struct Simulator {
    socket: Socket,
    config: SimulatorConfig,
    rng: StdRng,
}

impl Simulator {
    /// Transparent pass-through (no faults).
    pub fn passthrough(socket: Socket) -> Self {
        Self::with_config(socket, SimulatorConfig::default(), 0)
    }

    /// Apply `config` to every outgoing datagram, using a seeded RNG.
    pub fn with_config(socket: Socket, config: SimulatorConfig, seed: u64) -> Self {
        Self {
            socket,
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Replace the fault model (used by engines' test hooks).
    pub fn set_config(&mut self, config: SimulatorConfig, seed: u64) {
        self.config = config;
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Send `packet`, subject to the fault model.
    ///
    /// A dropped datagram still reports success — exactly what the real
    /// network would do.
    pub async fn send_to(&mut self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        if self.config.is_transparent() {
            return self.socket.send_to(packet, dest).await;
        }

        if self.rng.random_bool(self.config.loss_rate) {
            log::trace!("[sim] dropping datagram seq={}", packet.header.seq);
            return Ok(());
        }

        let mut bytes = packet.encode();
        if self.rng.random_bool(self.config.corrupt_rate) {
            let byte = self.rng.random_range(0..bytes.len());
            let bit = self.rng.random_range(0..8);
            bytes[byte] ^= 1 << bit;
            log::trace!("[sim] corrupting datagram seq={}", packet.header.seq);
        }

        self.socket.send_raw(&bytes, dest).await?;
        if self.rng.random_bool(self.config.duplicate_rate) {
            log::trace!("[sim] duplicating datagram seq={}", packet.header.seq);
            self.socket.send_raw(&bytes, dest).await?;
        }
        Ok(())
    }

    /// Receive the next datagram (always passes through unmodified).
    pub async fn recv_from(&mut self) -> Result<(Packet, SocketAddr), SocketError> {
        self.socket.recv_from().await
    }
}
