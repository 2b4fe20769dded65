//! Context and command-queue creation.
//!
//! A context is an isolated device-resource namespace spanning one or
//! more devices; a queue is an in-order submission channel to a single
//! device within that context. Both creations are synchronous, and both
//! handles are released by the lifecycle coordinator — queue before
//! context, always.

use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{ContextId, DeviceBackend, DeviceId, QueueId};
use crate::error::{OclError, Result};

/// Creates contexts and command queues over the backend seam.
pub struct ContextManager {
    backend: Arc<dyn DeviceBackend>,
}

impl ContextManager {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }

    /// Create a context bound to the given device set.
    ///
    /// Fails with [`OclError::Device`] when the set is empty or the
    /// device layer rejects the creation.
    pub fn create_context(&self, devices: &[DeviceId]) -> Result<ContextId> {
        if devices.is_empty() {
            return Err(OclError::Device {
                operation: "create context",
                reason: "empty device set".into(),
            });
        }
        let context = self.backend.create_context(devices)?;
        info!(devices = devices.len(), "context created");
        Ok(context)
    }

    /// Create an in-order command queue on `device` within `context`.
    pub fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId> {
        let queue = self.backend.create_queue(context, device)?;
        debug!("command queue created");
        Ok(queue)
    }
}
