//! Buffer allocation and host/device transfers.
//!
//! Buffers carry a declared access intent and a byte size computed from
//! `element_count * element_size`, with zero and overflow rejected on
//! the host before any device call is made. Transfers are fully
//! synchronous: a call does not return until the bytes are confirmed
//! written or read. The design deliberately forgoes overlapped transfer
//! for determinism.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::backend::{BufferId, ContextId, DeviceBackend, QueueId};
use crate::error::{OclError, Result};

/// Declared access intent of a device buffer, from the kernel's
/// perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessMode {
    /// The kernel only reads the buffer.
    ReadOnly,
    /// The kernel only writes the buffer.
    WriteOnly,
    /// The kernel both reads and writes.
    ReadWrite,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "read-only"),
            Self::WriteOnly => write!(f, "write-only"),
            Self::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// Bytes required for `element_count` elements of `element_size` bytes.
///
/// # Errors
///
/// [`OclError::Allocation`] when either factor is zero or the product
/// overflows `usize`. A zero element count is a caller contract
/// violation and must not reach the device.
pub fn buffer_bytes(element_count: usize, element_size: usize) -> Result<usize> {
    if element_count == 0 || element_size == 0 {
        return Err(OclError::Allocation {
            size_bytes: 0,
            reason: format!(
                "invalid buffer size: element_count={element_count}, element_size={element_size}"
            ),
        });
    }
    element_count.checked_mul(element_size).ok_or_else(|| OclError::Allocation {
        size_bytes: usize::MAX,
        reason: format!("buffer size overflow: {element_count} * {element_size}"),
    })
}

/// Allocates device buffers and moves host arrays in and out of them.
pub struct BufferManager {
    backend: Arc<dyn DeviceBackend>,
}

impl BufferManager {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }

    /// Allocate `element_count * element_size` bytes in `context` with
    /// the given access intent.
    pub fn allocate(
        &self,
        context: ContextId,
        mode: AccessMode,
        element_count: usize,
        element_size: usize,
    ) -> Result<BufferId> {
        let size_bytes = buffer_bytes(element_count, element_size)?;
        let buffer = self.backend.create_buffer(context, mode, size_bytes)?;
        debug!(%mode, size_bytes, "buffer allocated");
        Ok(buffer)
    }

    /// Blocking write of a host array into `buffer`.
    ///
    /// The byte length of `data` must match the buffer size exactly;
    /// mismatches and cross-context queue/buffer pairs fail with
    /// [`OclError::Transfer`].
    pub fn upload(&self, queue: QueueId, buffer: BufferId, data: &[i32]) -> Result<()> {
        let bytes = i32s_to_bytes(data);
        self.backend.write_buffer(queue, buffer, &bytes)?;
        debug!(bytes = bytes.len(), "buffer uploaded");
        Ok(())
    }

    /// Blocking read of `buffer` into a host array. Same failure
    /// contract as [`upload`](Self::upload).
    pub fn download(&self, queue: QueueId, buffer: BufferId, out: &mut [i32]) -> Result<()> {
        let mut bytes = vec![0u8; out.len() * std::mem::size_of::<i32>()];
        self.backend.read_buffer(queue, buffer, &mut bytes)?;
        bytes_to_i32s(&bytes, out);
        debug!(bytes = bytes.len(), "buffer downloaded");
        Ok(())
    }
}

/// Native-endian byte image of an `i32` slice.
pub(crate) fn i32s_to_bytes(values: &[i32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_ne_bytes());
    }
    bytes
}

/// Decode a native-endian byte image into `out`. Lengths must agree.
pub(crate) fn bytes_to_i32s(bytes: &[u8], out: &mut [i32]) {
    debug_assert_eq!(bytes.len(), out.len() * 4);
    for (i, chunk) in bytes.chunks_exact(4).enumerate() {
        out[i] = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceClass;
    use crate::host::HostBackend;

    fn setup() -> (Arc<HostBackend>, BufferManager, ContextId, QueueId) {
        let backend = Arc::new(HostBackend::new());
        let devices = backend.list_devices(0, DeviceClass::Gpu).unwrap();
        let context = backend.create_context(&devices).unwrap();
        let queue = backend.create_queue(context, devices[0]).unwrap();
        let manager = BufferManager::new(backend.clone());
        (backend, manager, context, queue)
    }

    // ── Size calculation ────────────────────────────────────────────

    #[test]
    fn buffer_bytes_basic() {
        assert_eq!(buffer_bytes(1024, 4).unwrap(), 4096);
        assert_eq!(buffer_bytes(1, 1).unwrap(), 1);
    }

    #[test]
    fn buffer_bytes_zero_count_rejected() {
        let err = buffer_bytes(0, 4).unwrap_err();
        assert!(matches!(err, OclError::Allocation { .. }));
    }

    #[test]
    fn buffer_bytes_zero_size_rejected() {
        assert!(buffer_bytes(16, 0).is_err());
    }

    #[test]
    fn buffer_bytes_overflow_rejected() {
        let err = buffer_bytes(usize::MAX, 4).unwrap_err();
        assert!(matches!(err, OclError::Allocation { .. }));
    }

    // ── Byte conversion ─────────────────────────────────────────────

    #[test]
    fn i32_byte_roundtrip() {
        let values = [0, 1, -1, i32::MAX, i32::MIN, 42];
        let bytes = i32s_to_bytes(&values);
        let mut out = [0i32; 6];
        bytes_to_i32s(&bytes, &mut out);
        assert_eq!(out, values);
    }

    // ── Allocation and transfer ─────────────────────────────────────

    #[test]
    fn upload_download_roundtrip() {
        let (_backend, manager, context, queue) = setup();
        let buffer = manager.allocate(context, AccessMode::ReadWrite, 8, 4).unwrap();
        let data: Vec<i32> = (0..8).collect();
        manager.upload(queue, buffer, &data).unwrap();
        let mut out = vec![0i32; 8];
        manager.download(queue, buffer, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn zero_elements_never_reach_device() {
        let (backend, manager, context, _queue) = setup();
        let err = manager.allocate(context, AccessMode::ReadOnly, 0, 4).unwrap_err();
        assert!(matches!(err, OclError::Allocation { .. }));
        assert_eq!(backend.counters().buffers_created, 0);
    }

    #[test]
    fn upload_size_mismatch_is_transfer_error() {
        let (_backend, manager, context, queue) = setup();
        let buffer = manager.allocate(context, AccessMode::ReadOnly, 8, 4).unwrap();
        let err = manager.upload(queue, buffer, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, OclError::Transfer { .. }), "got {err:?}");
    }

    #[test]
    fn download_size_mismatch_is_transfer_error() {
        let (_backend, manager, context, queue) = setup();
        let buffer = manager.allocate(context, AccessMode::WriteOnly, 8, 4).unwrap();
        let mut out = vec![0i32; 4];
        let err = manager.download(queue, buffer, &mut out).unwrap_err();
        assert!(matches!(err, OclError::Transfer { .. }), "got {err:?}");
    }

    #[test]
    fn cross_context_transfer_rejected() {
        let (backend, manager, context, _queue) = setup();
        let buffer = manager.allocate(context, AccessMode::ReadOnly, 4, 4).unwrap();

        // A second context with its own queue.
        let devices = backend.list_devices(0, DeviceClass::Gpu).unwrap();
        let other_context = backend.create_context(&devices).unwrap();
        let other_queue = backend.create_queue(other_context, devices[0]).unwrap();

        let err = manager.upload(other_queue, buffer, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, OclError::Transfer { .. }), "got {err:?}");
    }

    #[test]
    fn access_mode_display() {
        assert_eq!(AccessMode::ReadOnly.to_string(), "read-only");
        assert_eq!(AccessMode::WriteOnly.to_string(), "write-only");
        assert_eq!(AccessMode::ReadWrite.to_string(), "read-write");
    }
}
