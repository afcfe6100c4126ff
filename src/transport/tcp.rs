// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// TCP transport: listener thread, fixed pool of connection slots, and
// length-prefix framing over the byte stream.
//
// Each message is preceded by a little-endian 16-bit length. A
// per-connection input buffer walks Empty -> SizeRead -> PayloadReading
// -> Complete; partial reads keep their state across polls. When every
// slot is taken, incoming connects are refused. Closing a connection
// frees its slot and reports the endpoint so the dispatcher can evict
// the session binding; the session itself survives.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::protocol::AgentError;
use crate::transport::{Endpoint, Transport};

/// Length prefix size: u16 little-endian.
const FRAME_PREFIX_SIZE: usize = 2;

/// Write retry budget against a non-blocking socket.
const MAX_SEND_ATTEMPTS: usize = 16;

/// Idle sleep between polls of the connection pool.
const POLL_PAUSE: Duration = Duration::from_millis(2);

// ---------------------------------------------------------------------------
// Framing state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Nothing of the current frame read yet (or a partial size prefix).
    Empty,
    /// Size prefix complete, no payload bytes yet.
    SizeRead,
    /// Payload partially read.
    PayloadReading,
    /// A whole message is buffered and ready to hand out.
    Complete,
}

/// Incremental decoder for one connection's byte stream.
#[derive(Debug)]
struct InputBuffer {
    state: FrameState,
    prefix: [u8; FRAME_PREFIX_SIZE],
    prefix_have: usize,
    payload: Vec<u8>,
    payload_have: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            state: FrameState::Empty,
            prefix: [0; FRAME_PREFIX_SIZE],
            prefix_have: 0,
            payload: Vec::new(),
            payload_have: 0,
        }
    }

    fn reset(&mut self) {
        self.state = FrameState::Empty;
        self.prefix_have = 0;
        self.payload.clear();
        self.payload_have = 0;
    }

    /// Advance the state machine with whatever bytes the reader has.
    ///
    /// Returns Ok(Some(len)) when a whole message of `len` bytes is
    /// buffered, Ok(None) when more bytes are needed (WouldBlock leaves
    /// the partial frame intact), and Err on EOF, I/O failure, or a
    /// frame exceeding `max_size`.
    fn advance<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        max_size: usize,
    ) -> std::io::Result<Option<usize>> {
        loop {
            match self.state {
                FrameState::Empty => {
                    match reader.read(&mut self.prefix[self.prefix_have..]) {
                        Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                        Ok(n) => {
                            self.prefix_have += n;
                            if self.prefix_have == FRAME_PREFIX_SIZE {
                                let size = u16::from_le_bytes(self.prefix) as usize;
                                if size == 0 || size > max_size {
                                    return Err(std::io::Error::new(
                                        ErrorKind::InvalidData,
                                        format!("bad frame length {}", size),
                                    ));
                                }
                                self.payload = vec![0; size];
                                self.payload_have = 0;
                                self.state = FrameState::SizeRead;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                        Err(e) => return Err(e),
                    }
                }
                FrameState::SizeRead | FrameState::PayloadReading => {
                    match reader.read(&mut self.payload[self.payload_have..]) {
                        Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                        Ok(n) => {
                            self.payload_have += n;
                            self.state = if self.payload_have == self.payload.len() {
                                FrameState::Complete
                            } else {
                                FrameState::PayloadReading
                            };
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                        Err(e) => return Err(e),
                    }
                }
                FrameState::Complete => return Ok(Some(self.payload.len())),
            }
        }
    }

    /// Hand out the completed message and rearm for the next frame.
    fn take(&mut self, out: &mut [u8]) -> usize {
        debug_assert_eq!(self.state, FrameState::Complete);
        let len = self.payload.len();
        out[..len].copy_from_slice(&self.payload);
        self.reset();
        len
    }
}

/// Frame a message for the wire: `[len u16 LE][payload]`.
fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

// ---------------------------------------------------------------------------
// Connection pool
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    input: InputBuffer,
}

struct Shared {
    listener: TcpListener,
    /// Fixed pool; each slot carries its own mutex so sends and reads on
    /// different connections never serialize.
    slots: Vec<Mutex<Option<Connection>>>,
    closed: Mutex<Vec<Endpoint>>,
    running: AtomicBool,
    max_message_size: usize,
}

fn lock_slot<'a>(
    slot: &'a Mutex<Option<Connection>>,
) -> std::sync::MutexGuard<'a, Option<Connection>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::debug!("[TcpTransport] slot lock poisoned, recovering");
            e.into_inner()
        }
    }
}

impl Shared {
    fn close_in_place(&self, guard: &mut Option<Connection>) {
        if let Some(conn) = guard.take() {
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
            match self.closed.lock() {
                Ok(mut closed) => closed.push(Endpoint::Tcp(conn.peer)),
                Err(e) => e.into_inner().push(Endpoint::Tcp(conn.peer)),
            }
            log::info!("tcp connection from {} closed", conn.peer);
        }
    }
}

/// TCP transport multiplexing a fixed number of client connections.
pub struct TcpTransport {
    shared: Arc<Shared>,
    listener_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind `0.0.0.0:<port>` and start the listener thread.
    pub fn bind(port: u16, max_connections: usize, max_message_size: usize) -> Result<Self, AgentError> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let shared = Arc::new(Shared {
            listener,
            slots: (0..max_connections).map(|_| Mutex::new(None)).collect(),
            closed: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            max_message_size,
        });
        let handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("xrce-tcp-listener".into())
                .spawn(move || listener_loop(shared))
                .map_err(|e| AgentError::Io(e.to_string()))?
        };
        log::info!("tcp transport listening on port {}", port);
        Ok(Self {
            shared,
            listener_thread: Mutex::new(Some(handle)),
        })
    }
}

fn listener_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        match shared.listener.accept() {
            Ok((stream, peer)) => accept_connection(&shared, stream, peer),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::warn!("tcp accept failed: {}", e);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn accept_connection(shared: &Shared, stream: TcpStream, peer: SocketAddr) {
    if stream.set_nonblocking(true).is_err() {
        return;
    }
    for slot in &shared.slots {
        let mut guard = lock_slot(slot);
        if guard.is_none() {
            *guard = Some(Connection {
                stream,
                peer,
                input: InputBuffer::new(),
            });
            log::info!("tcp connection from {}", peer);
            return;
        }
    }
    // Pool exhausted: refuse.
    log::warn!("refusing tcp connection from {}: no free slot", peer);
}

impl Transport for TcpTransport {
    fn recv(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, Endpoint)>, AgentError> {
        let deadline = Instant::now() + timeout;
        loop {
            for slot in &self.shared.slots {
                let mut guard = lock_slot(slot);
                let Some(conn) = guard.as_mut() else { continue };
                match conn.input.advance(&mut conn.stream, self.shared.max_message_size) {
                    Ok(Some(len)) => {
                        if len > buf.len() {
                            log::warn!("tcp frame of {} bytes exceeds receive buffer", len);
                            conn.input.reset();
                            continue;
                        }
                        let peer = conn.peer;
                        let len = conn.input.take(buf);
                        return Ok(Some((len, Endpoint::Tcp(peer))));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if e.kind() != ErrorKind::UnexpectedEof {
                            log::warn!("tcp read from {} failed: {}", conn.peer, e);
                        }
                        self.shared.close_in_place(&mut guard);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_PAUSE);
        }
    }

    fn send(&self, endpoint: &Endpoint, data: &[u8]) -> Result<(), AgentError> {
        let addr = match endpoint {
            Endpoint::Tcp(addr) => *addr,
            other => {
                return Err(AgentError::Io(format!(
                    "tcp transport cannot reach {}",
                    other
                )))
            }
        };
        if data.len() > u16::MAX as usize {
            return Err(AgentError::MessageTooLarge {
                size: data.len(),
                max: u16::MAX as usize,
            });
        }
        for slot in &self.shared.slots {
            let mut guard = lock_slot(slot);
            let Some(conn) = guard.as_mut() else { continue };
            if conn.peer != addr {
                continue;
            }
            let frame = encode_frame(data);
            let mut sent = 0;
            for _attempt in 0..MAX_SEND_ATTEMPTS {
                match conn.stream.write(&frame[sent..]) {
                    Ok(n) => {
                        sent += n;
                        if sent == frame.len() {
                            return Ok(());
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        log::warn!("tcp send to {} failed: {}", addr, e);
                        self.shared.close_in_place(&mut guard);
                        return Err(e.into());
                    }
                }
            }
            log::warn!("tcp send to {} stalled, closing connection", addr);
            self.shared.close_in_place(&mut guard);
            return Err(AgentError::Io("send retry budget exhausted".into()));
        }
        Err(AgentError::Io(format!("no tcp connection to {}", addr)))
    }

    fn drain_closed(&self) -> Vec<Endpoint> {
        match self.shared.closed.lock() {
            Ok(mut closed) => std::mem::take(&mut *closed),
            Err(e) => std::mem::take(&mut *e.into_inner()),
        }
    }

    fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        let handle = match self.listener_thread.lock() {
            Ok(mut slot) => slot.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        for slot in &self.shared.slots {
            let mut guard = lock_slot(slot);
            if let Some(conn) = guard.take() {
                let _ = conn.stream.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out its bytes in fixed-size chunks and then
    /// reports WouldBlock, mimicking a non-blocking socket.
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl ChunkedReader {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self { data, pos: 0, chunk }
        }
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.data.len() {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_frame_roundtrip_in_one_read() {
        let frame = encode_frame(b"hello agent");
        let mut reader = ChunkedReader::new(frame, 64);
        let mut input = InputBuffer::new();
        assert_eq!(input.advance(&mut reader, 2048).unwrap(), Some(11));
        let mut out = [0u8; 64];
        assert_eq!(input.take(&mut out), 11);
        assert_eq!(&out[..11], b"hello agent");
        assert_eq!(input.state, FrameState::Empty);
    }

    #[test]
    fn test_partial_reads_keep_state() {
        // One byte at a time: the prefix itself arrives split.
        let frame = encode_frame(&[1, 2, 3, 4, 5]);
        let mut reader = ChunkedReader::new(frame, 1);
        let mut input = InputBuffer::new();
        // Drive until complete; every intermediate step must be Ok(None)
        // or the final Some.
        let mut result = None;
        for _ in 0..16 {
            match input.advance(&mut reader, 2048).unwrap() {
                Some(len) => {
                    result = Some(len);
                    break;
                }
                None => continue,
            }
        }
        assert_eq!(result, Some(5));
        let mut out = [0u8; 8];
        assert_eq!(input.take(&mut out), 5);
        assert_eq!(&out[..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut data = encode_frame(b"one");
        data.extend_from_slice(&encode_frame(b"three"));
        let mut reader = ChunkedReader::new(data, 4);
        let mut input = InputBuffer::new();
        let mut out = [0u8; 16];

        let mut messages = Vec::new();
        for _ in 0..32 {
            match input.advance(&mut reader, 2048) {
                Ok(Some(_)) => {
                    let n = input.take(&mut out);
                    messages.push(out[..n].to_vec());
                }
                Ok(None) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected error {}", e),
            }
            if messages.len() == 2 {
                break;
            }
        }
        assert_eq!(messages, vec![b"one".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_oversized_frame_is_an_error() {
        let frame = encode_frame(&[0u8; 256]);
        let mut reader = ChunkedReader::new(frame, 64);
        let mut input = InputBuffer::new();
        let err = input.advance(&mut reader, 128).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_eof_is_an_error() {
        struct Eof;
        impl Read for Eof {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Ok(0)
            }
        }
        let mut input = InputBuffer::new();
        let err = input.advance(&mut Eof, 128).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_zero_length_frame_rejected() {
        let mut reader = ChunkedReader::new(vec![0, 0], 2);
        let mut input = InputBuffer::new();
        let err = input.advance(&mut reader, 128).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
