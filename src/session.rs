// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Per-client session: stream state, proxy objects and the submessage
// semantics that connect them.
//
// A ProxyClient executes the submessages the dispatcher hands it and
// pushes its replies onto the shared reply queue. Control replies travel
// on stream 0x00 with sequence 0 and are never stored; DATA messages on
// reliable streams are stored for retransmission and followed by a
// HEARTBEAT advertising the unacknowledged range.

use std::sync::{Arc, Mutex, Weak};

use crate::dispatcher::ReplySender;
use crate::object::ObjectRegistry;
use crate::protocol::{
    encode_message, AcknackPayload, AgentError, CreatePayload, CreationMode, DataPayload,
    DeletePayload, HeartbeatPayload, MessageHeader, ObjectKind, ReadDataPayload, StatusCode,
    StatusPayload, Submessage, SubmessageHeader, SubmessageReader, WriteDataPayload, XrceMessage,
    OBJECTID_CLIENT,
};
use crate::proxy::{DdsFacade, SampleSink};
use crate::stream::{StreamClass, StreamSet};
use crate::transport::Endpoint;

/// Header fields of the message currently being processed that handlers
/// need: the stream it arrived on, and the raw sequence_nr field (which
/// doubles as the referenced stream id for HEARTBEAT/ACKNACK).
#[derive(Debug, Clone, Copy)]
pub struct MessageContext {
    pub stream_id: u8,
    pub sequence_nr: u16,
}

/// Signal from a handler back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The client asked for its own deletion (DELETE of OBJECTID_CLIENT).
    DeleteClient,
}

/// One client's session state, owned by the dispatcher.
pub struct ProxyClient {
    client_key: [u8; 4],
    session_id: u8,
    streams: StreamSet,
    objects: Mutex<ObjectRegistry>,
    /// Where replies currently go; refreshed on every accepted message so
    /// reconnecting clients keep working.
    endpoint: Mutex<Endpoint>,
    replies: ReplySender,
    facade: Arc<dyn DdsFacade>,
    max_message_size: usize,
}

fn recover<'a, T>(lock: &'a Mutex<T>, what: &str) -> std::sync::MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::debug!("[ProxyClient::{}] lock poisoned, recovering", what);
            e.into_inner()
        }
    }
}

impl ProxyClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_key: [u8; 4],
        session_id: u8,
        facade: Arc<dyn DdsFacade>,
        replies: ReplySender,
        endpoint: Endpoint,
        reorder_depth: usize,
        history_depth: usize,
        max_message_size: usize,
    ) -> Self {
        Self {
            client_key,
            session_id,
            streams: StreamSet::new(reorder_depth, history_depth),
            objects: Mutex::new(ObjectRegistry::new()),
            endpoint: Mutex::new(endpoint),
            replies,
            facade,
            max_message_size,
        }
    }

    pub fn client_key(&self) -> [u8; 4] {
        self.client_key
    }

    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    pub fn streams(&self) -> &StreamSet {
        &self.streams
    }

    pub fn object_count(&self) -> usize {
        recover(&self.objects, "object_count").len()
    }

    pub fn set_endpoint(&self, endpoint: Endpoint) {
        *recover(&self.endpoint, "set_endpoint") = endpoint;
    }

    fn endpoint(&self) -> Endpoint {
        recover(&self.endpoint, "endpoint").clone()
    }

    /// Destroy every proxy object through the facade. Called when the
    /// session is replaced or deleted.
    pub fn teardown(&self) {
        recover(&self.objects, "teardown").clear(self.facade.as_ref());
    }

    // -----------------------------------------------------------------------
    // Submessage processing
    // -----------------------------------------------------------------------

    /// Process the submessage region of one in-order message. Unknown
    /// submessage ids are skipped; malformed payloads produce a STATUS
    /// with ERR_INVALID_DATA on the control stream.
    pub fn process_region(self: &Arc<Self>, ctx: &MessageContext, region: &[u8]) -> Option<SessionEvent> {
        let mut event = None;
        let mut reader = SubmessageReader::new(region);
        while let Some(frame) = reader.next() {
            match frame {
                Ok((header, payload)) => {
                    if let Some(e) = self.handle_submessage(ctx, &header, payload) {
                        event = Some(e);
                    }
                }
                Err(e) => {
                    log::warn!("dropping truncated submessage: {}", e);
                    break;
                }
            }
        }
        event
    }

    fn handle_submessage(
        self: &Arc<Self>,
        ctx: &MessageContext,
        header: &SubmessageHeader,
        payload: &[u8],
    ) -> Option<SessionEvent> {
        match Submessage::decode(header, payload) {
            Ok(Submessage::Create(mode, p)) => {
                self.on_create(mode, p);
                None
            }
            Ok(Submessage::Delete(p)) => self.on_delete(p),
            Ok(Submessage::WriteData(p)) => {
                self.on_write_data(ctx, p);
                None
            }
            Ok(Submessage::ReadData(p)) => {
                self.on_read_data_request(ctx, p);
                None
            }
            Ok(Submessage::Heartbeat(p)) => {
                self.on_peer_heartbeat(ctx, p);
                None
            }
            Ok(Submessage::Acknack(p)) => {
                self.on_peer_acknack(ctx, p);
                None
            }
            Ok(Submessage::GetInfo(p)) => {
                log::debug!("GET_INFO for 0x{:04x} not served", p.object_id);
                None
            }
            // Agent-originated kinds, or a handshake on an established
            // session: nothing to do.
            Ok(Submessage::CreateClient(_))
            | Ok(Submessage::Status(_))
            | Ok(Submessage::Data(_)) => None,
            Err(AgentError::UnknownSubmessageId(id)) => {
                log::debug!("skipping unknown submessage id 0x{:02x}", id);
                None
            }
            Err(AgentError::UnsupportedFormat(format)) => {
                log::debug!("skipping WRITE_DATA with format 0x{:02x}", format);
                None
            }
            Err(e) => {
                log::warn!(
                    "malformed payload for submessage 0x{:02x}: {}",
                    header.submessage_id,
                    e
                );
                self.send_status(0, 0, StatusCode::ErrInvalidData);
                None
            }
        }
    }

    fn on_create(self: &Arc<Self>, mode: CreationMode, p: CreatePayload) {
        let sink = if p.spec.kind() == ObjectKind::DataReader {
            Some(self.make_sink(p.object_id))
        } else {
            None
        };
        let status = recover(&self.objects, "on_create").create(
            self.facade.as_ref(),
            p.object_id,
            p.spec,
            mode.reuse,
            mode.replace,
            sink,
        );
        self.send_status(p.request_id, p.object_id, status);
    }

    fn on_delete(&self, p: DeletePayload) -> Option<SessionEvent> {
        if p.object_id == OBJECTID_CLIENT {
            self.send_status(p.request_id, p.object_id, StatusCode::Ok);
            return Some(SessionEvent::DeleteClient);
        }
        let status = recover(&self.objects, "on_delete").delete(self.facade.as_ref(), p.object_id);
        self.send_status(p.request_id, p.object_id, status);
        None
    }

    fn on_write_data(&self, ctx: &MessageContext, p: WriteDataPayload) {
        let status =
            recover(&self.objects, "on_write_data").write(self.facade.as_ref(), p.object_id, &p.data);
        // The client asked for acknowledgement iff it wrote on a reliable
        // stream; best-effort writes are fire-and-forget.
        if StreamClass::of(ctx.stream_id) == StreamClass::Reliable {
            self.send_status(p.request_id, p.object_id, status);
        } else if !status.is_ok() {
            log::debug!(
                "unacknowledged WRITE_DATA to 0x{:04x} failed: {:?}",
                p.object_id,
                status
            );
        }
    }

    fn on_read_data_request(&self, ctx: &MessageContext, p: ReadDataPayload) {
        let status = recover(&self.objects, "on_read_data_request").read(
            p.object_id,
            p.request_id,
            ctx.stream_id,
            p.max_samples,
        );
        self.send_status(p.request_id, p.object_id, status);
    }

    /// Peer HEARTBEAT: repair our input stream and answer with an ACKNACK
    /// whose bitmap reflects the freshest state, then drain anything the
    /// advance made contiguous.
    fn on_peer_heartbeat(self: &Arc<Self>, ctx: &MessageContext, p: HeartbeatPayload) {
        let stream_id = ctx.sequence_nr as u8;
        let reply = self
            .streams
            .on_heartbeat(stream_id, p.first_unacked_seq, p.last_unacked_seq);
        let message = XrceMessage {
            header: MessageHeader {
                session_id: self.session_id,
                stream_id: 0x00,
                sequence_nr: stream_id as u16,
                client_key: None,
            },
            submessages: vec![Submessage::Acknack(AcknackPayload {
                first_unacked_seq: reply.first_unacked,
                nack_bitmap: reply.nack_bitmap,
            })],
        };
        self.send_control(message);
        let drain_ctx = MessageContext { stream_id, sequence_nr: ctx.sequence_nr };
        while let Some(region) = self.streams.pop_ready(stream_id) {
            self.process_region(&drain_ctx, &region);
        }
    }

    /// Peer ACKNACK: retransmit what it still misses, then let the stream
    /// evict everything acknowledged.
    fn on_peer_acknack(&self, ctx: &MessageContext, p: AcknackPayload) {
        let stream_id = ctx.sequence_nr as u8;
        let retransmits = self
            .streams
            .on_acknack(stream_id, p.first_unacked_seq, p.nack_bitmap);
        let endpoint = self.endpoint();
        for message in retransmits {
            self.replies.send_reliable(endpoint.clone(), message);
        }
    }

    // -----------------------------------------------------------------------
    // Outbound data path
    // -----------------------------------------------------------------------

    /// Sample sink handed to the facade when a DataReader is created.
    /// Runs on a middleware thread; holds the session weakly so a
    /// deleted session silences its readers.
    fn make_sink(self: &Arc<Self>, object_id: u16) -> SampleSink {
        let weak: Weak<ProxyClient> = Arc::downgrade(self);
        Arc::new(move |data: &[u8]| {
            if let Some(client) = weak.upgrade() {
                client.on_sample(object_id, data);
            }
        })
    }

    fn on_sample(&self, object_id: u16, data: &[u8]) {
        let target = recover(&self.objects, "on_sample").next_delivery(object_id);
        match target {
            Some((request_id, stream_id)) => {
                self.on_read_data(stream_id, object_id, request_id, data)
            }
            None => log::debug!(
                "sample for 0x{:04x} with no standing read request",
                object_id
            ),
        }
    }

    /// Emit one sample as a DATA message on `stream_id`, storing it for
    /// retransmission and following up with a HEARTBEAT when the stream
    /// is reliable.
    pub fn on_read_data(&self, stream_id: u8, object_id: u16, request_id: u16, data: &[u8]) {
        let session_id = self.session_id;
        let max = self.max_message_size;
        let built = self.streams.push_outbound(stream_id, |seq| {
            encode_message(
                &XrceMessage {
                    header: MessageHeader {
                        session_id,
                        stream_id,
                        sequence_nr: seq,
                        client_key: None,
                    },
                    submessages: vec![Submessage::Data(DataPayload {
                        request_id,
                        object_id,
                        data: data.to_vec(),
                    })],
                },
                max,
            )
        });
        let message = match built {
            Ok(message) => message,
            Err(e) => {
                log::warn!("DATA for 0x{:04x} not emitted: {}", object_id, e);
                return;
            }
        };
        let endpoint = self.endpoint();
        let reliable = StreamClass::of(stream_id) == StreamClass::Reliable;
        if reliable {
            self.replies.send_reliable(endpoint.clone(), message);
            if let Some((first_unacked, last_sent)) = self.streams.heartbeat_range(stream_id) {
                self.send_control(XrceMessage {
                    header: MessageHeader {
                        session_id,
                        stream_id: 0x00,
                        sequence_nr: stream_id as u16,
                        client_key: None,
                    },
                    submessages: vec![Submessage::Heartbeat(HeartbeatPayload {
                        first_unacked_seq: first_unacked,
                        last_unacked_seq: last_sent,
                    })],
                });
            }
        } else {
            self.replies.send_best_effort(endpoint, message);
        }
    }

    // -----------------------------------------------------------------------
    // Reply helpers
    // -----------------------------------------------------------------------

    fn send_status(&self, request_id: u16, object_id: u16, status: StatusCode) {
        self.send_control(XrceMessage {
            header: MessageHeader {
                session_id: self.session_id,
                stream_id: 0x00,
                sequence_nr: 0,
                client_key: None,
            },
            submessages: vec![Submessage::Status(StatusPayload {
                request_id,
                object_id,
                status,
            })],
        });
    }

    fn send_control(&self, message: XrceMessage) {
        match encode_message(&message, self.max_message_size) {
            Ok(bytes) => self.replies.send_best_effort(self.endpoint(), bytes),
            Err(e) => log::warn!("control reply not emitted: {}", e),
        }
    }
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("client_key", &self.client_key)
            .field("session_id", &self.session_id)
            .finish()
    }
}
