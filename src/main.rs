// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! xrce-agent - DDS-XRCE agent executable.
//!
//! # Usage
//!
//! ```bash
//! # Serve clients over UDP (default XRCE port 2019)
//! xrce-agent udp --port 2019
//!
//! # Serve clients over a serial device
//! xrce-agent serial --device /dev/ttyUSB0
//!
//! # Serve clients over TCP (16-bit length-prefixed framing)
//! xrce-agent tcp --port 2019
//! ```
//!
//! The DDS side is pluggable ([`DdsFacade`]); this executable runs the
//! protocol stack over the no-op facade, which is enough for client
//! bring-up and wire-level testing. Exit code is 0 on clean shutdown and
//! non-zero when initialization fails.

use std::sync::mpsc;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use xrce_agent::protocol::AgentError;
use xrce_agent::proxy::{DdsFacade, NullFacade};
use xrce_agent::transport::{SerialTransport, TcpTransport, Transport, UdpTransport};
use xrce_agent::{AgentConfig, XrceAgent};

/// DDS-XRCE agent for resource-constrained clients.
#[derive(Parser, Debug)]
#[command(name = "xrce-agent")]
#[command(about = "DDS-XRCE agent: bridges XRCE clients into a DDS network")]
#[command(version)]
struct Args {
    /// Maximum concurrent clients.
    #[arg(long, default_value_t = 128)]
    max_clients: usize,

    /// Maximum serialized message size in bytes.
    #[arg(long, default_value_t = 2048)]
    max_message_size: usize,

    #[command(subcommand)]
    transport: TransportArgs,
}

#[derive(Subcommand, Debug)]
enum TransportArgs {
    /// Serve clients over UDP datagrams.
    Udp {
        /// Local port to bind.
        #[arg(short, long, default_value_t = 2019)]
        port: u16,
    },
    /// Serve clients over a serial device.
    Serial {
        /// Device path, e.g. /dev/ttyUSB0.
        #[arg(short, long)]
        device: String,
    },
    /// Serve clients over TCP with length-prefixed framing.
    Tcp {
        /// Local port to listen on.
        #[arg(short, long, default_value_t = 2019)]
        port: u16,

        /// Connection slots; connects beyond this are refused.
        #[arg(long, default_value_t = 16)]
        max_connections: usize,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("xrce-agent: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), AgentError> {
    let mut config = AgentConfig {
        max_clients: args.max_clients,
        max_message_size: args.max_message_size,
        ..AgentConfig::default()
    };

    let transport: Arc<dyn Transport> = match &args.transport {
        TransportArgs::Udp { port } => {
            config.udp_port = *port;
            Arc::new(UdpTransport::bind(*port)?)
        }
        TransportArgs::Serial { device } => {
            config.serial_device = Some(device.clone());
            Arc::new(SerialTransport::open(device)?)
        }
        TransportArgs::Tcp { port, max_connections } => {
            config.tcp_port = *port;
            config.tcp_max_connections = *max_connections;
            Arc::new(TcpTransport::bind(
                *port,
                *max_connections,
                config.max_message_size,
            )?)
        }
    };

    let facade: Arc<dyn DdsFacade> = Arc::new(NullFacade::new());
    let agent = XrceAgent::new(config, facade)?;
    agent.start(transport)?;

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|e| AgentError::Config(format!("signal handler: {}", e)))?;

    let _ = stop_rx.recv();
    log::info!("interrupt received, shutting down");
    agent.stop();
    Ok(())
}
