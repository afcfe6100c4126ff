// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Per-client registry of proxy objects.
//
// Every entry is a tagged variant keyed by object id; parents are edges
// (object ids) resolved through the registry on use, so cascade delete is
// a graph walk. The low nibble of an object id must match the kind of the
// spec it is created with.

use std::collections::HashMap;

use crate::protocol::{kind_of, ObjectKind, ObjectSpec, StatusCode};
use crate::proxy::{BridgeHandle, DdsFacade, SampleSink};

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Standing delivery order armed by READ_DATA on a DataReader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTarget {
    pub request_id: u16,
    pub stream_id: u8,
    /// Samples left to deliver; None = unlimited (max_samples of 0).
    pub remaining: Option<u16>,
}

/// One proxy object hosted by the agent for a client.
#[derive(Debug, Clone)]
pub struct ProxyObject {
    pub spec: ObjectSpec,
    /// Middleware handle; None for publishers and subscribers, which are
    /// grouping objects with no facade counterpart.
    pub handle: Option<BridgeHandle>,
    /// DataReader only: where samples currently go.
    pub read_target: Option<ReadTarget>,
}

impl ProxyObject {
    pub fn kind(&self) -> ObjectKind {
        self.spec.kind()
    }
}

/// Depth in the containment tree, used to delete children before parents.
fn depth(kind: ObjectKind) -> u8 {
    match kind {
        ObjectKind::Participant => 0,
        ObjectKind::Topic | ObjectKind::Publisher | ObjectKind::Subscriber => 1,
        ObjectKind::DataWriter | ObjectKind::DataReader => 2,
    }
}

/// Object ids a spec points at (its parents).
fn parent_edges(spec: &ObjectSpec) -> Vec<u16> {
    match spec {
        ObjectSpec::Participant { .. } => Vec::new(),
        ObjectSpec::Topic { participant_id, .. }
        | ObjectSpec::Publisher { participant_id }
        | ObjectSpec::Subscriber { participant_id } => vec![*participant_id],
        ObjectSpec::DataWriter { publisher_id, topic_id } => vec![*publisher_id, *topic_id],
        ObjectSpec::DataReader { subscriber_id, topic_id } => vec![*subscriber_id, *topic_id],
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Mapping of object ids to proxy objects for one session.
#[derive(Default)]
pub struct ObjectRegistry {
    objects: HashMap<u16, ProxyObject>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: u16) -> Option<&ProxyObject> {
        self.objects.get(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Create an object under the reuse/replace decision table.
    ///
    /// `sink` must be provided when the spec is a DataReader; it becomes
    /// the middleware's sample callback.
    pub fn create(
        &mut self,
        facade: &dyn DdsFacade,
        id: u16,
        spec: ObjectSpec,
        reuse: bool,
        replace: bool,
        sink: Option<SampleSink>,
    ) -> StatusCode {
        match kind_of(id) {
            Ok(kind) if kind == spec.kind() => {}
            _ => return StatusCode::ErrInvalidData,
        }
        let matches = match self.objects.get(&id) {
            None => return self.create_fresh(facade, id, spec, sink),
            Some(obj) => obj.spec == spec,
        };
        match (reuse, replace) {
            (false, false) => StatusCode::ErrAlreadyExists,
            (false, true) => {
                self.delete(facade, id);
                self.create_fresh(facade, id, spec, sink)
            }
            (true, false) => {
                if matches {
                    StatusCode::OkMatched
                } else {
                    StatusCode::ErrMismatch
                }
            }
            (true, true) => {
                if matches {
                    StatusCode::OkMatched
                } else {
                    self.delete(facade, id);
                    self.create_fresh(facade, id, spec, sink)
                }
            }
        }
    }

    fn create_fresh(
        &mut self,
        facade: &dyn DdsFacade,
        id: u16,
        spec: ObjectSpec,
        sink: Option<SampleSink>,
    ) -> StatusCode {
        let handle = match &spec {
            ObjectSpec::Participant { domain_id } => {
                match facade.create_participant(*domain_id) {
                    Ok(h) => Some(h),
                    Err(e) => {
                        log::warn!("participant 0x{:04x} creation failed: {}", id, e);
                        return StatusCode::ErrDdsError;
                    }
                }
            }
            ObjectSpec::Topic { participant_id, name, type_name } => {
                let participant = match self.participant_handle(*participant_id) {
                    Some(h) => h,
                    None => return StatusCode::ErrUnknownReference,
                };
                match facade.create_topic(participant, name, type_name) {
                    Ok(h) => Some(h),
                    Err(e) => {
                        log::warn!("topic 0x{:04x} creation failed: {}", id, e);
                        return StatusCode::ErrDdsError;
                    }
                }
            }
            ObjectSpec::Publisher { participant_id } | ObjectSpec::Subscriber { participant_id } => {
                if self.participant_handle(*participant_id).is_none() {
                    return StatusCode::ErrUnknownReference;
                }
                None
            }
            ObjectSpec::DataWriter { publisher_id, topic_id } => {
                let (participant, topic) =
                    match self.endpoint_parents(*publisher_id, ObjectKind::Publisher, *topic_id) {
                        Some(pair) => pair,
                        None => return StatusCode::ErrUnknownReference,
                    };
                match facade.create_writer(participant, topic) {
                    Ok(h) => Some(h),
                    Err(e) => {
                        log::warn!("writer 0x{:04x} creation failed: {}", id, e);
                        return StatusCode::ErrDdsError;
                    }
                }
            }
            ObjectSpec::DataReader { subscriber_id, topic_id } => {
                let (participant, topic) =
                    match self.endpoint_parents(*subscriber_id, ObjectKind::Subscriber, *topic_id) {
                        Some(pair) => pair,
                        None => return StatusCode::ErrUnknownReference,
                    };
                let sink = match sink {
                    Some(s) => s,
                    None => return StatusCode::ErrDdsError,
                };
                match facade.create_reader(participant, topic, sink) {
                    Ok(h) => Some(h),
                    Err(e) => {
                        log::warn!("reader 0x{:04x} creation failed: {}", id, e);
                        return StatusCode::ErrDdsError;
                    }
                }
            }
        };
        self.objects.insert(
            id,
            ProxyObject { spec, handle, read_target: None },
        );
        StatusCode::Ok
    }

    /// Facade handle of a Participant entry, if present and of that kind.
    fn participant_handle(&self, id: u16) -> Option<BridgeHandle> {
        match self.objects.get(&id) {
            Some(obj) if obj.kind() == ObjectKind::Participant => obj.handle,
            _ => None,
        }
    }

    /// Resolve the (participant, topic) handles behind a writer/reader:
    /// the grouping parent must exist with the right kind, and the topic
    /// must belong to that parent's participant.
    fn endpoint_parents(
        &self,
        group_id: u16,
        group_kind: ObjectKind,
        topic_id: u16,
    ) -> Option<(BridgeHandle, BridgeHandle)> {
        let group = self.objects.get(&group_id)?;
        if group.kind() != group_kind {
            return None;
        }
        let participant_id = match &group.spec {
            ObjectSpec::Publisher { participant_id }
            | ObjectSpec::Subscriber { participant_id } => *participant_id,
            _ => return None,
        };
        let topic = self.objects.get(&topic_id)?;
        match &topic.spec {
            ObjectSpec::Topic { participant_id: topic_participant, .. }
                if *topic_participant == participant_id =>
            {
                Some((self.participant_handle(participant_id)?, topic.handle?))
            }
            _ => None,
        }
    }

    /// Delete an object and, cascading, everything that depends on it,
    /// children before parents.
    pub fn delete(&mut self, facade: &dyn DdsFacade, id: u16) -> StatusCode {
        if !self.objects.contains_key(&id) {
            return StatusCode::ErrUnknownReference;
        }
        let mut doomed = vec![id];
        loop {
            let more: Vec<u16> = self
                .objects
                .iter()
                .filter(|&(oid, obj)| {
                    !doomed.contains(oid)
                        && parent_edges(&obj.spec).iter().any(|p| doomed.contains(p))
                })
                .map(|(oid, _)| *oid)
                .collect();
            if more.is_empty() {
                break;
            }
            doomed.extend(more);
        }
        doomed.sort_by_key(|oid| {
            std::cmp::Reverse(self.objects.get(oid).map_or(0, |o| depth(o.kind())))
        });
        for oid in doomed {
            if let Some(obj) = self.objects.remove(&oid) {
                if let Some(handle) = obj.handle {
                    if let Err(e) = facade.delete_entity(handle) {
                        log::warn!("facade delete of 0x{:04x} failed: {}", oid, e);
                    }
                }
            }
        }
        StatusCode::Ok
    }

    /// Forward one serialized sample to a DataWriter.
    pub fn write(&self, facade: &dyn DdsFacade, id: u16, data: &[u8]) -> StatusCode {
        let obj = match self.objects.get(&id) {
            Some(obj) => obj,
            None => return StatusCode::ErrUnknownReference,
        };
        match (obj.kind(), obj.handle) {
            (ObjectKind::DataWriter, Some(handle)) => match facade.write(handle, data) {
                Ok(()) => StatusCode::Ok,
                Err(e) => {
                    log::warn!("write through 0x{:04x} failed: {}", id, e);
                    StatusCode::ErrDdsError
                }
            },
            _ => StatusCode::ErrDdsError,
        }
    }

    /// Arm a DataReader to deliver samples on a stream. A max_samples of
    /// zero means an unlimited standing request.
    pub fn read(&mut self, id: u16, request_id: u16, stream_id: u8, max_samples: u16) -> StatusCode {
        let obj = match self.objects.get_mut(&id) {
            Some(obj) => obj,
            None => return StatusCode::ErrUnknownReference,
        };
        if obj.kind() != ObjectKind::DataReader {
            return StatusCode::ErrDdsError;
        }
        obj.read_target = Some(ReadTarget {
            request_id,
            stream_id,
            remaining: if max_samples == 0 { None } else { Some(max_samples) },
        });
        StatusCode::Ok
    }

    /// Claim one delivery slot for a sample arriving at a DataReader.
    /// Returns the (request_id, stream_id) to stamp into the DATA message,
    /// or None when no read request is standing.
    pub fn next_delivery(&mut self, id: u16) -> Option<(u16, u8)> {
        let obj = self.objects.get_mut(&id)?;
        let target = obj.read_target?;
        obj.read_target = match target.remaining {
            None => Some(target),
            Some(1) => None,
            Some(n) => Some(ReadTarget { remaining: Some(n - 1), ..target }),
        };
        Some((target.request_id, target.stream_id))
    }

    /// Destroy every object, children before parents. Used when a session
    /// is replaced or deleted.
    pub fn clear(&mut self, facade: &dyn DdsFacade) {
        let mut ids: Vec<u16> = self.objects.keys().copied().collect();
        ids.sort_by_key(|oid| {
            std::cmp::Reverse(self.objects.get(oid).map_or(0, |o| depth(o.kind())))
        });
        for oid in ids {
            if let Some(obj) = self.objects.remove(&oid) {
                if let Some(handle) = obj.handle {
                    if let Err(e) = facade.delete_entity(handle) {
                        log::warn!("facade delete of 0x{:04x} failed: {}", oid, e);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("objects", &self.objects.len())
            .finish()
    }
}
