// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DDS-XRCE agent: session and stream subsystem.
//!
//! Terminates the compact XRCE wire protocol spoken by
//! resource-constrained clients and multiplexes their intent onto a DDS
//! middleware reached through the pluggable [`DdsFacade`].
//!
//! # Architecture
//!
//! ```text
//! XRCE Client (MCU)               XRCE Agent (this crate)       DDS Network
//!        |                               |                           |
//!        |--- CREATE_CLIENT ----------->|  session created          |
//!        |--- CREATE(writer) ---------->|--- facade.create_* ------>|
//!        |--- WRITE_DATA(sample) ------>|--- facade.write --------->|
//!        |<-- DATA(sample) -------------|<-- reader sample ---------|
//!        |<-> HEARTBEAT / ACKNACK <---->|  reliable stream repair   |
//! ```
//!
//! Inbound bytes flow transport -> dispatcher -> session, where each
//! message is gated per stream: reliable streams deliver strictly in
//! sequence through a bounded reorder buffer, and gaps are repaired with
//! HEARTBEAT/ACKNACK exchanges in both directions backed by a bounded
//! per-stream history of sent messages.
//!
//! # Transports
//!
//! | Transport | Framing |
//! |-----------|---------|
//! | [`transport::UdpTransport`] | one datagram = one message |
//! | [`transport::SerialTransport`] | driver-provided byte stuffing |
//! | [`transport::TcpTransport`] | 16-bit little-endian length prefix |

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod object;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod stream;
pub mod transport;

// Re-exports for convenience.
pub use agent::XrceAgent;
pub use config::AgentConfig;
pub use dispatcher::Dispatcher;
pub use object::ObjectRegistry;
pub use protocol::{AgentError, StatusCode};
pub use proxy::{DdsFacade, NullFacade};
pub use session::ProxyClient;
pub use stream::{Delivery, StreamClass, StreamSet};
pub use transport::{Endpoint, Transport};

#[cfg(test)]
mod tests;
