//! Kernel submission over a one-dimensional work-item grid.
//!
//! Dispatch enforces two preconditions before anything is enqueued:
//! the global work size must be an integer multiple of the local size,
//! and every declared kernel argument slot must be bound. Submission
//! is followed by an explicit finish, so the call blocks until the
//! device has completed execution — a read-back is only valid after
//! [`DispatchEngine::dispatch`] returns.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::backend::{DeviceBackend, QueueId};
use crate::error::{OclError, Result};
use crate::program::Kernel;

/// A one-dimensional dispatch shape: total work items and work-group
/// size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkShape {
    /// Total number of work items.
    pub global: usize,
    /// Work items per work group.
    pub local: usize,
}

impl WorkShape {
    /// Validate the divisibility invariant.
    ///
    /// # Errors
    ///
    /// [`OclError::Dispatch`] when `local` is zero or does not divide
    /// `global` evenly.
    pub fn validate(&self) -> Result<()> {
        if self.local == 0 {
            return Err(OclError::Dispatch { reason: "local work size must be positive".into() });
        }
        if self.global % self.local != 0 {
            return Err(OclError::Dispatch {
                reason: format!(
                    "global work size {} is not a multiple of local work size {}",
                    self.global, self.local
                ),
            });
        }
        Ok(())
    }

    /// Number of work groups (`global / local`). Only meaningful for a
    /// validated shape.
    pub fn work_groups(&self) -> usize {
        if self.local == 0 { 0 } else { self.global / self.local }
    }
}

/// Submits kernels for execution and waits for completion.
pub struct DispatchEngine {
    backend: Arc<dyn DeviceBackend>,
}

impl DispatchEngine {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }

    /// Submit `kernel` over `shape` on `queue` and block until the
    /// device has finished executing it.
    ///
    /// # Errors
    ///
    /// [`OclError::Dispatch`] on work-size violations,
    /// [`OclError::Binding`] when any declared slot is unbound. Both
    /// are checked before anything is enqueued, so no buffer state is
    /// touched on failure.
    pub fn dispatch(&self, queue: QueueId, kernel: &Kernel, shape: WorkShape) -> Result<()> {
        shape.validate()?;
        if !kernel.is_fully_bound() {
            return Err(OclError::Binding {
                reason: format!(
                    "kernel '{}' dispatched with unbound argument slots {:?}",
                    kernel.entry(),
                    kernel.unbound_slots()
                ),
            });
        }

        debug!(
            entry = %kernel.entry(),
            global = shape.global,
            local = shape.local,
            groups = shape.work_groups(),
            "enqueueing kernel"
        );
        self.backend.enqueue_nd_range(queue, kernel.id(), shape.global, shape.local)?;
        self.backend.finish(queue)?;
        info!(entry = %kernel.entry(), "kernel execution complete");
        Ok(())
    }
}
