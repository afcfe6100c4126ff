// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// DdsFacade trait - the pluggable entity-creation and pub/sub surface of
// the DDS middleware behind the agent.
//
// Intentionally DDS-agnostic: any middleware can implement it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::protocol::AgentError;

/// Opaque handle to an entity living inside the DDS middleware.
pub type BridgeHandle = u32;

/// Callback invoked by the middleware for every sample a DataReader
/// receives. The agent turns these into DATA submessages.
pub type SampleSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Facade over the DDS middleware.
///
/// Each method maps to one entity operation the agent forwards on behalf
/// of a client. Publishers and subscribers are grouping objects on the
/// agent side and have no facade counterpart.
pub trait DdsFacade: Send + Sync {
    /// Create a DomainParticipant on the given domain.
    fn create_participant(&self, domain_id: u16) -> Result<BridgeHandle, AgentError>;

    /// Create a Topic under a participant.
    fn create_topic(
        &self,
        participant: BridgeHandle,
        name: &str,
        type_name: &str,
    ) -> Result<BridgeHandle, AgentError>;

    /// Create a DataWriter for a topic under a participant.
    fn create_writer(
        &self,
        participant: BridgeHandle,
        topic: BridgeHandle,
    ) -> Result<BridgeHandle, AgentError>;

    /// Create a DataReader for a topic under a participant. The sink is
    /// called once per received sample, from a middleware thread.
    fn create_reader(
        &self,
        participant: BridgeHandle,
        topic: BridgeHandle,
        sink: SampleSink,
    ) -> Result<BridgeHandle, AgentError>;

    /// Write one serialized sample through a DataWriter.
    fn write(&self, writer: BridgeHandle, data: &[u8]) -> Result<(), AgentError>;

    /// Destroy an entity.
    fn delete_entity(&self, handle: BridgeHandle) -> Result<(), AgentError>;
}

// ---------------------------------------------------------------------------
// Null facade (for testing)
// ---------------------------------------------------------------------------

/// A facade that always succeeds and swallows data. Useful for
/// protocol-level testing without a DDS stack behind the agent.
#[derive(Default)]
pub struct NullFacade {
    next_handle: AtomicU32,
}

impl NullFacade {
    pub fn new() -> Self {
        Self { next_handle: AtomicU32::new(1) }
    }

    fn fresh(&self) -> BridgeHandle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl DdsFacade for NullFacade {
    fn create_participant(&self, _domain_id: u16) -> Result<BridgeHandle, AgentError> {
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
        _sink: SampleSink,
    ) -> Result<BridgeHandle, AgentError> {
        Ok(self.fresh())
    }

    fn write(&self, _writer: BridgeHandle, _data: &[u8]) -> Result<(), AgentError> {
        Ok(())
    }

    fn delete_entity(&self, _handle: BridgeHandle) -> Result<(), AgentError> {
        Ok(())
    }
}
