// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Serial transport over a character device.
//
// Message framing on the wire (byte stuffing) is the serial driver's
// business: one successful read hands the agent one whole message. Baud
// rate configuration is expected to be done externally (e.g. via stty).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use crate::protocol::AgentError;
use crate::transport::{Endpoint, Transport};

/// Serial transport using file I/O; a serial link carries a single peer.
pub struct SerialTransport {
    device_path: String,
    reader: Mutex<File>,
    writer: Mutex<File>,
}

impl SerialTransport {
    /// Open a serial device for agent communication.
    pub fn open(device_path: &str) -> Result<Self, AgentError> {
        let reader = OpenOptions::new().read(true).open(device_path)?;
        let writer = OpenOptions::new().write(true).open(device_path)?;
        log::info!("serial transport on {}", device_path);
        Ok(Self {
            device_path: device_path.to_string(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }

    fn lock<'a>(file: &'a Mutex<File>, what: &str) -> std::sync::MutexGuard<'a, File> {
        match file.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::debug!("[SerialTransport::{}] lock poisoned, recovering", what);
                e.into_inner()
            }
        }
    }
}

impl Transport for SerialTransport {
    fn recv(
        &self,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<Option<(usize, Endpoint)>, AgentError> {
        // The device read blocks until the driver delivers a frame; the
        // driver's own timeout (VTIME) governs responsiveness here.
        let len = Self::lock(&self.reader, "recv").read(buf)?;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some((len, Endpoint::Serial(self.device_path.clone()))))
    }

    fn send(&self, endpoint: &Endpoint, data: &[u8]) -> Result<(), AgentError> {
        match endpoint {
            Endpoint::Serial(_) => {
                Self::lock(&self.writer, "send").write_all(data)?;
                Ok(())
            }
            other => Err(AgentError::Io(format!(
                "serial transport cannot reach {}",
                other
            ))),
        }
    }

    fn shutdown(&self) {
        // The device closes on drop.
    }
}
