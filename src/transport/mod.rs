// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Transport abstraction multiplexing many clients over a shared byte
// transport. Variants: UDP datagrams, serial devices, TCP streams.

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::AgentError;

pub mod serial;
pub mod tcp;
pub mod udp;

pub use serial::SerialTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Address of a remote client over any transport. Endpoints key the
/// endpoint-to-session binding learned at handshake time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// UDP peer address; one datagram = one message.
    Udp(SocketAddr),
    /// Serial device path; a serial link carries a single peer.
    Serial(String),
    /// TCP peer address; messages are length-prefix framed.
    Tcp(SocketAddr),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp(addr) => write!(f, "udp://{}", addr),
            Self::Serial(dev) => write!(f, "serial://{}", dev),
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Byte transport between the agent and its clients.
///
/// Implementations are shared between the reader thread (recv) and the
/// reply pump (send), so both sides take `&self` and guard their own
/// state. Sends to a vanished endpoint fail without affecting others.
pub trait Transport: Send + Sync {
    /// Wait up to `timeout` for one complete message. Returns None on
    /// timeout. For stream transports this drives the framing state
    /// machine; partial frames survive across calls.
    fn recv(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, Endpoint)>, AgentError>;

    /// Send one complete message to an endpoint.
    fn send(&self, endpoint: &Endpoint, data: &[u8]) -> Result<(), AgentError>;

    /// Endpoints whose connection went away since the last call. The
    /// dispatcher evicts their session bindings; the sessions survive.
    fn drain_closed(&self) -> Vec<Endpoint> {
        Vec::new()
    }

    /// Stop accepting and release sockets.
    fn shutdown(&self);
}
