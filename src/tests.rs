// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Crate-level scenario tests: handshake, session replacement, reliable
// reordering and repair, the outbound data path, and cascade deletion,
// all driven through the dispatcher exactly as a transport reader would.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::Receiver;

use crate::config::AgentConfig;
use crate::dispatcher::{reply_channel, Dispatcher, ReplyCommand};
use crate::protocol::*;
use crate::proxy::{BridgeHandle, DdsFacade, SampleSink};
use crate::transport::Endpoint;

const KEY: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];
const SESSION: u8 = 0x81;
const RELIABLE: u8 = 0x80;
const BEST_EFFORT: u8 = 0x01;

const PARTICIPANT: u16 = 0x0011;
const TOPIC: u16 = 0x0022;
const PUBLISHER: u16 = 0x0033;
const SUBSCRIBER: u16 = 0x0044;
const WRITER: u16 = 0x0055;
const READER: u16 = 0x0066;

// ---------------------------------------------------------------------------
// Mock facade: records entities, captures reader sinks for sample injection
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockFacade {
    next: AtomicU32,
    sinks: Mutex<Vec<SampleSink>>,
    deleted: Mutex<Vec<BridgeHandle>>,
    fail_participants: AtomicBool,
}

impl MockFacade {
    fn new() -> Self {
        Self { next: AtomicU32::new(1), ..Self::default() }
    }

    fn fresh(&self) -> BridgeHandle {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn last_sink(&self) -> SampleSink {
        self.sinks.lock().unwrap().last().expect("no reader created").clone()
    }

    fn deleted_count(&self) -> usize {
        self.deleted.lock().unwrap().len()
    }
}

impl DdsFacade for MockFacade {
    fn create_participant(&self, _domain_id: u16) -> Result<BridgeHandle, AgentError> {
        if self.fail_participants.load(Ordering::Relaxed) {
            return Err(AgentError::Dds("participant refused".into()));
        }
        Ok(self.fresh())
    }

    fn create_topic(
        &self,
        _participant: BridgeHandle,
        _name: &str,
        _type_name: &str,
    ) -> Result<BridgeHandle, AgentError> {
        Ok(self.fresh())
    }

    fn create_writer(
        &self,
        _participant: BridgeHandle,
        _topic: BridgeHandle,
    ) -> Result<BridgeHandle, AgentError> {
        Ok(self.fresh())
    }

    fn create_reader(
        &self,
        _participant: BridgeHandle,
        _topic: BridgeHandle,
        sink: SampleSink,
    ) -> Result<BridgeHandle, AgentError> {
        self.sinks.lock().unwrap().push(sink);
        Ok(self.fresh())
    }

    fn write(&self, _writer: BridgeHandle, _data: &[u8]) -> Result<(), AgentError> {
        Ok(())
    }

    fn delete_entity(&self, handle: BridgeHandle) -> Result<(), AgentError> {
        self.deleted.lock().unwrap().push(handle);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test harness around a dispatcher
// ---------------------------------------------------------------------------

struct Harness {
    dispatcher: Dispatcher,
    rx: Receiver<ReplyCommand>,
    facade: Arc<MockFacade>,
    endpoint: Endpoint,
}

fn harness() -> Harness {
    let (replies, rx) = reply_channel(128);
    let facade = Arc::new(MockFacade::new());
    let dispatcher = Dispatcher::new(AgentConfig::default(), facade.clone(), replies);
    Harness {
        dispatcher,
        rx,
        facade,
        endpoint: Endpoint::Udp("127.0.0.1:7400".parse().unwrap()),
    }
}

impl Harness {
    fn inject(&self, session_id: u8, stream_id: u8, seq: u16, key: Option<[u8; 4]>, subs: Vec<Submessage>) {
        let bytes = encode_message(
            &XrceMessage {
                header: MessageHeader {
                    session_id,
                    stream_id,
                    sequence_nr: seq,
                    client_key: key,
                },
                submessages: subs,
            },
            2048,
        )
        .unwrap();
        self.dispatcher.on_message(&self.endpoint, &bytes);
    }

    fn handshake_with(&self, cookie: [u8; 4], major: u8, session_id: u8) {
        self.inject(
            SESSIONID_NONE_WITH_KEY,
            0x00,
            0,
            Some(KEY),
            vec![Submessage::CreateClient(CreateClientPayload {
                request_id: 1,
                object_id: OBJECTID_CLIENT,
                cookie,
                version: [major, XRCE_VERSION_MINOR],
                vendor_id: [0x0F, 0x0F],
                client_key: KEY,
                session_id,
            })],
        );
    }

    fn handshake(&self) {
        self.handshake_with(XRCE_COOKIE, XRCE_VERSION_MAJOR, SESSION);
    }

    fn pop_reply(&self) -> Option<XrceMessage> {
        match self.rx.try_recv() {
            Ok(ReplyCommand::Send { bytes, .. }) => Some(decode_message(&bytes).unwrap()),
            Ok(ReplyCommand::Shutdown) | Err(_) => None,
        }
    }

    fn pop_status(&self) -> StatusPayload {
        let mut reply = self.pop_reply().expect("expected a reply");
        match reply.submessages.remove(0) {
            Submessage::Status(p) => p,
            other => panic!("expected STATUS, got {:?}", other),
        }
    }

    fn drain(&self) {
        while self.pop_reply().is_some() {}
    }

    /// CREATE a full participant/topic/subscriber/reader chain on the
    /// control stream and drain the STATUS replies.
    fn build_reader_chain(&self) {
        let creates = vec![
            (PARTICIPANT, ObjectSpec::Participant { domain_id: 0 }),
            (
                TOPIC,
                ObjectSpec::Topic {
                    participant_id: PARTICIPANT,
                    name: "Square".into(),
                    type_name: "ShapeType".into(),
                },
            ),
            (SUBSCRIBER, ObjectSpec::Subscriber { participant_id: PARTICIPANT }),
            (READER, ObjectSpec::DataReader { subscriber_id: SUBSCRIBER, topic_id: TOPIC }),
        ];
        for (id, spec) in creates {
            self.inject(
                SESSION,
                0x00,
                0,
                None,
                vec![Submessage::Create(
                    CreationMode::default(),
                    CreatePayload { request_id: 7, object_id: id, spec },
                )],
            );
            let status = self.pop_status();
            assert_eq!(status.status, StatusCode::Ok, "create of 0x{:04x}", id);
        }
    }
}

fn participant_create(object_id: u16, request_id: u16) -> Submessage {
    Submessage::Create(
        CreationMode::default(),
        CreatePayload {
            request_id,
            object_id,
            spec: ObjectSpec::Participant { domain_id: 0 },
        },
    )
}

// ---------------------------------------------------------------------------
// 1. Handshake accepted: session exists, STATUS OK echoes the class
// ---------------------------------------------------------------------------
#[test]
fn test_handshake_creates_session() {
    let h = harness();
    h.handshake();

    let reply = h.pop_reply().expect("handshake reply");
    assert_eq!(reply.header.session_id, SESSIONID_NONE_WITH_KEY);
    assert_eq!(reply.header.stream_id, 0x00);
    assert_eq!(reply.header.client_key, Some(KEY));
    match &reply.submessages[0] {
        Submessage::Status(p) => {
            assert_eq!(p.status, StatusCode::Ok);
            assert_eq!(p.request_id, 1);
            assert_eq!(p.object_id, OBJECTID_CLIENT);
        }
        other => panic!("expected STATUS, got {:?}", other),
    }
    let client = h.dispatcher.client(KEY).expect("session exists");
    assert_eq!(client.session_id(), SESSION);
    assert_eq!(h.dispatcher.client_count(), 1);
}

// ---------------------------------------------------------------------------
// 2. Wrong cookie: STATUS ERR_INVALID_DATA, no session
// ---------------------------------------------------------------------------
#[test]
fn test_handshake_wrong_cookie_rejected() {
    let h = harness();
    h.handshake_with([0x58, 0x52, 0x43, 0x21], XRCE_VERSION_MAJOR, SESSION); // "XRC!"

    assert_eq!(h.pop_status().status, StatusCode::ErrInvalidData);
    assert_eq!(h.dispatcher.client_count(), 0);
}

// ---------------------------------------------------------------------------
// 3. Wrong major version: STATUS ERR_INCOMPATIBLE, no session
// ---------------------------------------------------------------------------
#[test]
fn test_handshake_wrong_version_rejected() {
    let h = harness();
    h.handshake_with(XRCE_COOKIE, 0x02, SESSION);

    assert_eq!(h.pop_status().status, StatusCode::ErrIncompatible);
    assert_eq!(h.dispatcher.client_count(), 0);
}

// ---------------------------------------------------------------------------
// 4. Session replacement: same key, new session id resets everything
// ---------------------------------------------------------------------------
#[test]
fn test_rehandshake_new_session_id_replaces_session() {
    let h = harness();
    h.handshake();
    h.drain();
    h.inject(SESSION, 0x00, 0, None, vec![participant_create(PARTICIPANT, 2)]);
    assert_eq!(h.pop_status().status, StatusCode::Ok);
    assert_eq!(h.dispatcher.client(KEY).unwrap().object_count(), 1);

    h.handshake_with(XRCE_COOKIE, XRCE_VERSION_MAJOR, 0x82);
    assert_eq!(h.pop_status().status, StatusCode::Ok);

    assert_eq!(h.dispatcher.client_count(), 1);
    let client = h.dispatcher.client(KEY).unwrap();
    assert_eq!(client.session_id(), 0x82);
    assert_eq!(client.object_count(), 0);
    // The replaced session's participant was destroyed through the facade.
    assert_eq!(h.facade.deleted_count(), 1);
}

// ---------------------------------------------------------------------------
// 5. Re-handshake with the same session id is idempotent
// ---------------------------------------------------------------------------
#[test]
fn test_rehandshake_same_session_id_is_idempotent() {
    let h = harness();
    h.handshake();
    h.drain();
    h.inject(SESSION, 0x00, 0, None, vec![participant_create(PARTICIPANT, 2)]);
    h.drain();

    h.handshake();
    assert_eq!(h.pop_status().status, StatusCode::Ok);
    let client = h.dispatcher.client(KEY).unwrap();
    assert_eq!(client.object_count(), 1, "objects survive an idempotent handshake");
}

// ---------------------------------------------------------------------------
// 6. Reliable reorder: [0,2,1,3] executes handlers as 0,1,2,3
// ---------------------------------------------------------------------------
#[test]
fn test_reliable_stream_reorders_submessages() {
    let h = harness();
    h.handshake();
    h.drain();

    // Distinct participants let the STATUS replies reveal handler order.
    let ids = [0x0011u16, 0x0021, 0x0031, 0x0041];
    for (seq, idx) in [(0u16, 0usize), (2, 2), (1, 1), (3, 3)] {
        h.inject(
            SESSION,
            RELIABLE,
            seq,
            None,
            vec![participant_create(ids[idx], seq + 10)],
        );
    }

    let mut executed = Vec::new();
    while let Some(reply) = h.pop_reply() {
        if let Submessage::Status(p) = &reply.submessages[0] {
            executed.push(p.object_id);
        }
    }
    assert_eq!(executed, ids.to_vec());
    assert_eq!(h.dispatcher.client(KEY).unwrap().object_count(), 4);
}

// ---------------------------------------------------------------------------
// 7. Gap + heartbeat: ACKNACK pinpoints the missing sequence
// ---------------------------------------------------------------------------
#[test]
fn test_heartbeat_yields_acknack_for_gap() {
    let h = harness();
    h.handshake();
    h.drain();

    let ids = [0x0011u16, 0x0021, 0x0031, 0x0041];
    // Deliver 0 and 1, lose 2, deliver 3 and 4 (buffered).
    for (seq, idx) in [(0u16, 0usize), (1, 1), (3, 2), (4, 3)] {
        h.inject(
            SESSION,
            RELIABLE,
            seq,
            None,
            vec![participant_create(ids[idx], seq + 10)],
        );
    }
    h.drain();

    // HEARTBEAT rides stream 0 with the data stream id in sequence_nr.
    h.inject(
        SESSION,
        0x00,
        RELIABLE as u16,
        None,
        vec![Submessage::Heartbeat(HeartbeatPayload {
            first_unacked_seq: 0,
            last_unacked_seq: 4,
        })],
    );

    let reply = h.pop_reply().expect("acknack reply");
    assert_eq!(reply.header.stream_id, 0x00);
    assert_eq!(reply.header.sequence_nr, RELIABLE as u16);
    match &reply.submessages[0] {
        Submessage::Acknack(p) => {
            assert_eq!(p.first_unacked_seq, 2);
            assert_eq!(p.nack_bitmap, 0b0000_0001);
            assert_eq!(p.bitmap_bytes(), [0b0000_0000, 0b0000_0001]);
        }
        other => panic!("expected ACKNACK, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// 8. Outbound data path: DATA + HEARTBEAT, ack eviction, retransmit
// ---------------------------------------------------------------------------
#[test]
fn test_read_data_samples_flow_with_reliability() {
    let h = harness();
    h.handshake();
    h.drain();
    h.build_reader_chain();

    // Arm the reader from a reliable stream; samples follow that stream.
    h.inject(
        SESSION,
        RELIABLE,
        0,
        None,
        vec![Submessage::ReadData(ReadDataPayload {
            request_id: 42,
            object_id: READER,
            max_samples: 0,
        })],
    );
    assert_eq!(h.pop_status().status, StatusCode::Ok);

    let sink = h.facade.last_sink();
    for sample in [b"s0".as_slice(), b"s1", b"s2"] {
        sink(sample);
    }

    // Each sample produced one DATA on the reliable stream plus one
    // HEARTBEAT on the control stream.
    let mut data_seqs = Vec::new();
    let mut heartbeats = Vec::new();
    while let Some(reply) = h.pop_reply() {
        match &reply.submessages[0] {
            Submessage::Data(p) => {
                assert_eq!(reply.header.stream_id, RELIABLE);
                assert_eq!(p.request_id, 42);
                assert_eq!(p.object_id, READER);
                data_seqs.push(reply.header.sequence_nr);
            }
            Submessage::Heartbeat(p) => {
                assert_eq!(reply.header.stream_id, 0x00);
                assert_eq!(reply.header.sequence_nr, RELIABLE as u16);
                heartbeats.push((p.first_unacked_seq, p.last_unacked_seq));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }
    assert_eq!(data_seqs, vec![0, 1, 2]);
    assert_eq!(heartbeats.last(), Some(&(0, 2)));

    let client = h.dispatcher.client(KEY).unwrap();
    assert_eq!(client.streams().history_len(RELIABLE), 3);

    // Cumulative ack of 0 and 1 evicts them, keeping seq 2.
    h.inject(
        SESSION,
        0x00,
        RELIABLE as u16,
        None,
        vec![Submessage::Acknack(AcknackPayload {
            first_unacked_seq: 2,
            nack_bitmap: 0,
        })],
    );
    assert_eq!(client.streams().history_len(RELIABLE), 1);
    assert!(client.streams().history_contains(RELIABLE, 2));

    // NACK of seq 2 retransmits exactly that stored DATA message.
    h.inject(
        SESSION,
        0x00,
        RELIABLE as u16,
        None,
        vec![Submessage::Acknack(AcknackPayload {
            first_unacked_seq: 2,
            nack_bitmap: 0b0000_0001,
        })],
    );
    let retransmit = h.pop_reply().expect("retransmitted DATA");
    assert_eq!(retransmit.header.sequence_nr, 2);
    match &retransmit.submessages[0] {
        Submessage::Data(p) => assert_eq!(p.data, b"s2".to_vec()),
        other => panic!("expected DATA, got {:?}", other),
    }
    assert!(h.pop_reply().is_none(), "each NACKed seq retransmits once");
}

// ---------------------------------------------------------------------------
// 9. WRITE_DATA: acknowledged on reliable streams, silent on best-effort
// ---------------------------------------------------------------------------
#[test]
fn test_write_data_ack_follows_stream_class() {
    let h = harness();
    h.handshake();
    h.drain();
    for (id, spec) in [
        (PARTICIPANT, ObjectSpec::Participant { domain_id: 0 }),
        (
            TOPIC,
            ObjectSpec::Topic {
                participant_id: PARTICIPANT,
                name: "Square".into(),
                type_name: "ShapeType".into(),
            },
        ),
        (PUBLISHER, ObjectSpec::Publisher { participant_id: PARTICIPANT }),
        (WRITER, ObjectSpec::DataWriter { publisher_id: PUBLISHER, topic_id: TOPIC }),
    ] {
        h.inject(
            SESSION,
            0x00,
            0,
            None,
            vec![Submessage::Create(
                CreationMode::default(),
                CreatePayload { request_id: 3, object_id: id, spec },
            )],
        );
        assert_eq!(h.pop_status().status, StatusCode::Ok);
    }

    h.inject(
        SESSION,
        RELIABLE,
        0,
        None,
        vec![Submessage::WriteData(WriteDataPayload {
            request_id: 9,
            object_id: WRITER,
            data: b"sample".to_vec(),
        })],
    );
    let status = h.pop_status();
    assert_eq!(status.status, StatusCode::Ok);
    assert_eq!(status.request_id, 9);

    h.inject(
        SESSION,
        BEST_EFFORT,
        0,
        None,
        vec![Submessage::WriteData(WriteDataPayload {
            request_id: 10,
            object_id: WRITER,
            data: b"sample".to_vec(),
        })],
    );
    assert!(h.pop_reply().is_none(), "best-effort writes are unacknowledged");
}

// ---------------------------------------------------------------------------
// 10. DELETE of OBJECTID_CLIENT destroys the session
// ---------------------------------------------------------------------------
#[test]
fn test_delete_client_destroys_session() {
    let h = harness();
    h.handshake();
    h.drain();
    h.inject(SESSION, 0x00, 0, None, vec![participant_create(PARTICIPANT, 2)]);
    h.drain();

    h.inject(
        SESSION,
        0x00,
        0,
        None,
        vec![Submessage::Delete(DeletePayload {
            request_id: 11,
            object_id: OBJECTID_CLIENT,
        })],
    );
    let status = h.pop_status();
    assert_eq!(status.status, StatusCode::Ok);
    assert_eq!(status.object_id, OBJECTID_CLIENT);
    assert_eq!(h.dispatcher.client_count(), 0);
    assert_eq!(h.facade.deleted_count(), 1);
}

// ---------------------------------------------------------------------------
// 11. Messages from unknown endpoints or sessions are dropped
// ---------------------------------------------------------------------------
#[test]
fn test_unbound_endpoint_dropped() {
    let h = harness();
    // No handshake: established-session traffic has no binding.
    h.inject(SESSION, 0x00, 0, None, vec![participant_create(PARTICIPANT, 2)]);
    assert!(h.pop_reply().is_none());
    assert_eq!(h.dispatcher.client_count(), 0);
}

// ---------------------------------------------------------------------------
// 12. Malformed payload yields STATUS ERR_INVALID_DATA on stream 0
// ---------------------------------------------------------------------------
#[test]
fn test_malformed_payload_yields_invalid_data_status() {
    let h = harness();
    h.handshake();
    h.drain();

    // Hand-built CREATE whose payload is truncated to 2 bytes.
    let mut raw = Vec::new();
    MessageHeader {
        session_id: SESSION,
        stream_id: 0x00,
        sequence_nr: 0,
        client_key: None,
    }
    .encode(&mut raw)
    .unwrap();
    SubmessageHeader {
        submessage_id: SUBMSG_CREATE,
        flags: 0,
        length: 2,
    }
    .encode(&mut raw);
    raw.extend_from_slice(&[0x01, 0x00]);
    h.dispatcher.on_message(&h.endpoint, &raw);

    assert_eq!(h.pop_status().status, StatusCode::ErrInvalidData);
}

// ---------------------------------------------------------------------------
// 13. Facade failure surfaces as ERR_DDS_ERROR
// ---------------------------------------------------------------------------
#[test]
fn test_facade_failure_is_dds_error() {
    let h = harness();
    h.handshake();
    h.drain();
    h.facade.fail_participants.store(true, Ordering::Relaxed);

    h.inject(SESSION, 0x00, 0, None, vec![participant_create(PARTICIPANT, 2)]);
    assert_eq!(h.pop_status().status, StatusCode::ErrDdsError);
    assert_eq!(h.dispatcher.client(KEY).unwrap().object_count(), 0);
}

// ---------------------------------------------------------------------------
// 14. Unknown submessage ids inside a message are skipped, the rest runs
// ---------------------------------------------------------------------------
#[test]
fn test_unknown_submessage_id_skipped() {
    let h = harness();
    h.handshake();
    h.drain();

    let mut raw = Vec::new();
    MessageHeader {
        session_id: SESSION,
        stream_id: 0x00,
        sequence_nr: 0,
        client_key: None,
    }
    .encode(&mut raw)
    .unwrap();
    // Unknown id 0x3F with a 4-byte body, then a valid CREATE.
    SubmessageHeader { submessage_id: 0x3F, flags: 0, length: 4 }.encode(&mut raw);
    raw.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    let create = match participant_create(PARTICIPANT, 2) {
        sub @ Submessage::Create(..) => sub,
        _ => unreachable!(),
    };
    let tail = encode_message(
        &XrceMessage {
            header: MessageHeader {
                session_id: SESSION,
                stream_id: 0x00,
                sequence_nr: 0,
                client_key: None,
            },
            submessages: vec![create],
        },
        2048,
    )
    .unwrap();
    raw.extend_from_slice(&tail[MESSAGE_HEADER_SIZE..]);
    h.dispatcher.on_message(&h.endpoint, &raw);

    assert_eq!(h.pop_status().status, StatusCode::Ok);
    assert_eq!(h.dispatcher.client(KEY).unwrap().object_count(), 1);
}

// ---------------------------------------------------------------------------
// 15. Unbinding an endpoint keeps the session alive for reconnects
// ---------------------------------------------------------------------------
#[test]
fn test_endpoint_eviction_keeps_session() {
    let h = harness();
    h.handshake();
    h.drain();

    h.dispatcher.unbind_endpoint(&h.endpoint);
    // Traffic from the stale endpoint is now dropped...
    h.inject(SESSION, 0x00, 0, None, vec![participant_create(PARTICIPANT, 2)]);
    assert!(h.pop_reply().is_none());
    // ...but the session still exists and a re-handshake rebinds it.
    assert_eq!(h.dispatcher.client_count(), 1);
    h.handshake();
    assert_eq!(h.pop_status().status, StatusCode::Ok);
    h.inject(SESSION, 0x00, 0, None, vec![participant_create(PARTICIPANT, 2)]);
    assert_eq!(h.pop_status().status, StatusCode::Ok);
}

// ---------------------------------------------------------------------------
// 16. Session-table capacity: ERR_RESOURCES once max_clients is reached
// ---------------------------------------------------------------------------
#[test]
fn test_session_table_capacity() {
    let (replies, rx) = reply_channel(128);
    let facade = Arc::new(MockFacade::new());
    let config = AgentConfig { max_clients: 1, ..AgentConfig::default() };
    let dispatcher = Dispatcher::new(config, facade.clone(), replies);
    let h = Harness {
        dispatcher,
        rx,
        facade,
        endpoint: Endpoint::Udp("127.0.0.1:7400".parse().unwrap()),
    };
    h.handshake();
    assert_eq!(h.pop_status().status, StatusCode::Ok);

    // A second client under a different key is refused.
    h.inject(
        SESSIONID_NONE_WITH_KEY,
        0x00,
        0,
        Some([1, 2, 3, 4]),
        vec![Submessage::CreateClient(CreateClientPayload {
            request_id: 1,
            object_id: OBJECTID_CLIENT,
            cookie: XRCE_COOKIE,
            version: [XRCE_VERSION_MAJOR, XRCE_VERSION_MINOR],
            vendor_id: [0x0F, 0x0F],
            client_key: [1, 2, 3, 4],
            session_id: 0x83,
        })],
    );
    assert_eq!(h.pop_status().status, StatusCode::ErrResources);
    assert_eq!(h.dispatcher.client_count(), 1);
}
