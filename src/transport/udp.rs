// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// UDP transport: one datagram = one message.

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::AgentError;
use crate::transport::{Endpoint, Transport};

/// UDP transport using `socket2`.
pub struct UdpTransport {
    socket: socket2::Socket,
}

impl UdpTransport {
    /// Bind a UDP socket to `0.0.0.0:<port>`.
    pub fn bind(port: u16) -> Result<Self, AgentError> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let sa: socket2::SockAddr = addr.into();
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&sa)?;
        log::info!("udp transport listening on port {}", port);
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn recv(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, Endpoint)>, AgentError> {
        self.socket.set_read_timeout(Some(timeout))?;
        let buf_ref = unsafe {
            // socket2 wants a MaybeUninit slice; we have a zeroed buffer.
            &mut *(buf as *mut [u8] as *mut [std::mem::MaybeUninit<u8>])
        };
        match self.socket.recv_from(buf_ref) {
            Ok((len, addr)) => {
                let peer: SocketAddr = addr
                    .as_socket()
                    .ok_or_else(|| AgentError::Io("invalid peer address".into()))?;
                Ok(Some((len, Endpoint::Udp(peer))))
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send(&self, endpoint: &Endpoint, data: &[u8]) -> Result<(), AgentError> {
        match endpoint {
            Endpoint::Udp(addr) => {
                let sa: socket2::SockAddr = (*addr).into();
                self.socket.send_to(data, &sa)?;
                Ok(())
            }
            other => Err(AgentError::Io(format!(
                "udp transport cannot reach {}",
                other
            ))),
        }
    }

    fn shutdown(&self) {
        // Nothing to unwind; the socket closes on drop and recv polls
        // with a timeout.
    }
}
