//! Entry point for `rtp`.
//!
//! Parses CLI arguments and dispatches into either **send** or **recv**
//! mode.  All protocol work is delegated to library modules; `main.rs`
//! owns only process setup (logging, argument parsing, exit codes).

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use rtp_over_udp::receiver::Receiver;
use rtp_over_udp::sender::Sender;
use rtp_over_udp::socket::Socket;

/// Reliable file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Send a file to a receiving peer.
    Send {
        /// Peer address (e.g. 192.168.1.10:9000).
        peer: SocketAddr,
        /// File to transfer.
        input: PathBuf,
        /// Advertised window in segments (clamped to 32).
        #[arg(default_value_t = 32)]
        window: u16,
        /// Bind to a specific local port (default: auto-assign).
        #[arg(long, default_value_t = 0)]
        local_port: u16,
    },
    /// Receive a file from a sending peer.
    Recv {
        /// UDP port to listen on.
        listen_port: u16,
        /// File to write the received bytes to.
        output: PathBuf,
        /// Advertised window in segments (clamped to 32).
        #[arg(default_value_t = 32)]
        window: u16,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Set RUST_LOG to control verbosity; defaults to info for our crate.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.mode {
        Mode::Send {
            peer,
            input,
            window,
            local_port,
        } => {
            let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, local_port).into();
            match Socket::bind(bind).await {
                Ok(socket) => match Sender::new(socket, peer, &input, window) {
                    Ok(mut sender) => sender.run().await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e.into()),
            }
        }
        Mode::Recv {
            listen_port,
            output,
            window,
        } => {
            let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, listen_port).into();
            match Socket::bind(bind).await {
                Ok(socket) => {
                    let mut receiver = Receiver::new(socket, window);
                    receiver.run(&output).await
                }
                Err(e) => Err(e.into()),
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
