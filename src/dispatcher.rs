// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Message dispatcher: demultiplexes inbound messages onto sessions,
// executes the CREATE_CLIENT handshake, and feeds the reply queue drained
// by the agent's reply pump.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::config::AgentConfig;
use crate::protocol::{
    is_none_session, CreateClientPayload, MessageHeader, StatusCode, StatusPayload, Submessage,
    SubmessageReader, XrceMessage, SUBMSG_CREATE_CLIENT, XRCE_COOKIE, XRCE_VERSION_MAJOR,
};
use crate::proxy::DdsFacade;
use crate::session::{MessageContext, ProxyClient, SessionEvent};
use crate::stream::Delivery;
use crate::transport::Endpoint;

// ---------------------------------------------------------------------------
// Reply queue
// ---------------------------------------------------------------------------

/// One unit of work for the reply pump.
#[derive(Debug)]
pub enum ReplyCommand {
    /// Hand a serialized message to the transport.
    Send { endpoint: Endpoint, bytes: Vec<u8> },
    /// Sentinel that unblocks and terminates the pump.
    Shutdown,
}

/// Producer side of the bounded reply queue.
///
/// Best-effort pushes never block: when the queue is full the message is
/// dropped with a warning. Reliable pushes (retransmits, stored DATA)
/// block the producer instead, giving back-pressure.
#[derive(Clone)]
pub struct ReplySender {
    tx: Sender<ReplyCommand>,
}

impl ReplySender {
    pub fn send_best_effort(&self, endpoint: Endpoint, bytes: Vec<u8>) {
        match self.tx.try_send(ReplyCommand::Send { endpoint, bytes }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("reply queue full, dropping best-effort message");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("reply queue closed");
            }
        }
    }

    pub fn send_reliable(&self, endpoint: Endpoint, bytes: Vec<u8>) {
        if self.tx.send(ReplyCommand::Send { endpoint, bytes }).is_err() {
            log::debug!("reply queue closed");
        }
    }

    pub(crate) fn send_shutdown(&self) {
        let _ = self.tx.send(ReplyCommand::Shutdown);
    }
}

/// Create the bounded reply queue shared by all handlers.
pub fn reply_channel(depth: usize) -> (ReplySender, Receiver<ReplyCommand>) {
    let (tx, rx) = channel::bounded(depth);
    (ReplySender { tx }, rx)
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Owns every session, keyed by client key, plus the endpoint bindings
/// that route established-session messages (whose headers carry no key)
/// back to their session.
pub struct Dispatcher {
    config: AgentConfig,
    facade: Arc<dyn DdsFacade>,
    clients: Mutex<HashMap<[u8; 4], Arc<ProxyClient>>>,
    endpoints: Mutex<HashMap<Endpoint, [u8; 4]>>,
    replies: ReplySender,
}

fn recover<'a, T>(lock: &'a Mutex<T>, what: &str) -> std::sync::MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(e) => {
            log::debug!("[Dispatcher::{}] lock poisoned, recovering", what);
            e.into_inner()
        }
    }
}

impl Dispatcher {
    pub fn new(config: AgentConfig, facade: Arc<dyn DdsFacade>, replies: ReplySender) -> Self {
        Self {
            config,
            facade,
            clients: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
            replies,
        }
    }

    pub fn client_count(&self) -> usize {
        recover(&self.clients, "client_count").len()
    }

    pub fn client(&self, key: [u8; 4]) -> Option<Arc<ProxyClient>> {
        recover(&self.clients, "client").get(&key).cloned()
    }

    /// Entry point for every framed message coming off a transport.
    pub fn on_message(&self, source: &Endpoint, buf: &[u8]) {
        let (header, body) = match MessageHeader::decode(buf) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("dropping message with bad header from {}: {}", source, e);
                return;
            }
        };
        if is_none_session(header.session_id) {
            self.on_handshake(source, &header, &buf[body..]);
        } else {
            self.on_session_message(source, &header, &buf[body..]);
        }
    }

    /// Handshake path: only CREATE_CLIENT is accepted under the none
    /// session classes.
    fn on_handshake(&self, source: &Endpoint, header: &MessageHeader, region: &[u8]) {
        let mut reader = SubmessageReader::new(region);
        let frame = match reader.next() {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                log::warn!("dropping handshake from {}: {}", source, e);
                return;
            }
            None => return,
        };
        let (sub_header, payload) = frame;
        if sub_header.submessage_id != SUBMSG_CREATE_CLIENT {
            log::debug!(
                "ignoring submessage 0x{:02x} on handshake session class",
                sub_header.submessage_id
            );
            return;
        }
        match Submessage::decode(&sub_header, payload) {
            Ok(Submessage::CreateClient(p)) => self.on_create_client(source, header, &p),
            Ok(_) => {}
            Err(e) => log::warn!("dropping malformed CREATE_CLIENT from {}: {}", source, e),
        }
    }

    /// Validate the handshake and create or replace the session. The
    /// reply echoes the handshake's session id class and request pair.
    fn on_create_client(&self, source: &Endpoint, header: &MessageHeader, p: &CreateClientPayload) {
        let status = if p.cookie != XRCE_COOKIE {
            log::warn!("handshake from {} with bad cookie", source);
            StatusCode::ErrInvalidData
        } else if p.version[0] != XRCE_VERSION_MAJOR {
            log::warn!(
                "handshake from {} with incompatible version {}.{}",
                source,
                p.version[0],
                p.version[1]
            );
            StatusCode::ErrIncompatible
        } else {
            self.admit_client(source, p)
        };
        if status.is_ok() {
            recover(&self.endpoints, "on_create_client").insert(source.clone(), p.client_key);
        }
        let reply = XrceMessage {
            header: MessageHeader {
                session_id: header.session_id,
                stream_id: 0x00,
                sequence_nr: 0,
                client_key: Some(p.client_key),
            },
            submessages: vec![Submessage::Status(StatusPayload {
                request_id: p.request_id,
                object_id: p.object_id,
                status,
            })],
        };
        match crate::protocol::encode_message(&reply, self.config.max_message_size) {
            Ok(bytes) => self.replies.send_best_effort(source.clone(), bytes),
            Err(e) => log::warn!("handshake reply not emitted: {}", e),
        }
    }

    fn admit_client(&self, source: &Endpoint, p: &CreateClientPayload) -> StatusCode {
        let mut clients = recover(&self.clients, "admit_client");
        match clients.get(&p.client_key).cloned() {
            Some(existing) if existing.session_id() == p.session_id => {
                // Same key, same session: idempotent re-handshake.
                StatusCode::Ok
            }
            Some(existing) => {
                // Same key, new session id: atomic replacement with fresh
                // stream state and an empty registry.
                log::info!(
                    "client {:02x?} rebinding session 0x{:02x} -> 0x{:02x}",
                    p.client_key,
                    existing.session_id(),
                    p.session_id
                );
                existing.teardown();
                clients.insert(p.client_key, self.new_session(source, p));
                StatusCode::Ok
            }
            None => {
                if clients.len() >= self.config.max_clients {
                    log::warn!("refusing client {:02x?}: session table full", p.client_key);
                    return StatusCode::ErrResources;
                }
                log::info!(
                    "client {:02x?} connected with session 0x{:02x}",
                    p.client_key,
                    p.session_id
                );
                clients.insert(p.client_key, self.new_session(source, p));
                StatusCode::Ok
            }
        }
    }

    fn new_session(&self, source: &Endpoint, p: &CreateClientPayload) -> Arc<ProxyClient> {
        Arc::new(ProxyClient::new(
            p.client_key,
            p.session_id,
            Arc::clone(&self.facade),
            self.replies.clone(),
            source.clone(),
            self.config.reorder_depth,
            self.config.history_depth,
            self.config.max_message_size,
        ))
    }

    /// Established-session path: resolve the session through the endpoint
    /// binding, gate the payload on its stream, and hand in-order regions
    /// to the session.
    fn on_session_message(&self, source: &Endpoint, header: &MessageHeader, region: &[u8]) {
        let key = match recover(&self.endpoints, "on_session_message").get(source) {
            Some(key) => *key,
            None => {
                log::warn!("dropping message from unbound endpoint {}", source);
                return;
            }
        };
        let client = match self.client(key) {
            Some(client) => client,
            None => {
                log::warn!("dropping message for unknown client {:02x?}", key);
                return;
            }
        };
        client.set_endpoint(source.clone());
        match client
            .streams()
            .accept_inbound(header.stream_id, header.sequence_nr, region)
        {
            Delivery::DeliverNow => {
                let ctx = MessageContext {
                    stream_id: header.stream_id,
                    sequence_nr: header.sequence_nr,
                };
                let mut event = client.process_region(&ctx, region);
                while let Some(next) = client.streams().pop_ready(header.stream_id) {
                    if let Some(e) = client.process_region(&ctx, &next) {
                        event = Some(e);
                    }
                }
                if event == Some(SessionEvent::DeleteClient) {
                    self.delete_client(key);
                }
            }
            Delivery::Buffered | Delivery::Dropped => {}
        }
    }

    /// Destroy a session and its proxy objects, evicting its endpoint
    /// bindings.
    pub fn delete_client(&self, key: [u8; 4]) {
        let removed = recover(&self.clients, "delete_client").remove(&key);
        if let Some(client) = removed {
            client.teardown();
            recover(&self.endpoints, "delete_client").retain(|_, bound| *bound != key);
            log::info!("client {:02x?} deleted", key);
        }
    }

    /// Drop the endpoint binding of a closed connection. The session
    /// survives; the client may reconnect under the same key.
    pub fn unbind_endpoint(&self, endpoint: &Endpoint) {
        if recover(&self.endpoints, "unbind_endpoint")
            .remove(endpoint)
            .is_some()
        {
            log::info!("endpoint {} unbound", endpoint);
        }
    }

    /// Tear down every session. Used at agent shutdown.
    pub fn teardown_all(&self) {
        let clients: Vec<Arc<ProxyClient>> =
            recover(&self.clients, "teardown_all").drain().map(|(_, c)| c).collect();
        recover(&self.endpoints, "teardown_all").clear();
        for client in clients {
            client.teardown();
        }
    }
}
