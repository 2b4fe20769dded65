//! The device API seam: opaque handles and the raw operation surface.
//!
//! Every component in the pipeline talks to the device through
//! [`DeviceBackend`], never through a vendor API directly. The trait is
//! abstracted so the whole pipeline runs against the in-process
//! [`HostBackend`](crate::host::HostBackend) without GPU hardware; the
//! `opencl` feature adds the real [`ClBackend`](crate::cl::ClBackend).
//!
//! Handles are small `Copy` newtypes over opaque identifiers. The host
//! side never dereferences them; only the backend that issued a handle
//! can resolve it. Ownership and release ordering are the lifecycle
//! coordinator's job — handles carry no `Drop` behavior.

use crate::buffers::AccessMode;
use crate::device::{DeviceClass, DeviceInfo};
use crate::error::Result;

/// Handle to one physical or logical compute device.
///
/// Devices are queried, not allocated: there is no release operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u64);

/// Handle to a device-resource namespace bound to one or more devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) u64);

/// Handle to an in-order submission channel to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) u64);

/// Handle to a device memory region with a declared access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) u64);

/// Handle to a program compiled for a device set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub(crate) u64);

/// Handle to an executable entry point extracted from a built program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub(crate) u64);

impl DeviceId {
    /// The opaque identifier value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl ContextId {
    /// The opaque identifier value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl QueueId {
    /// The opaque identifier value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl BufferId {
    /// The opaque identifier value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl ProgramId {
    /// The opaque identifier value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl KernelId {
    /// The opaque identifier value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Raw device operations backing the pipeline.
///
/// All methods take `&self`; implementations keep their handle tables
/// behind interior mutability so a backend can sit behind an `Arc` and
/// be shared by every component. Every operation is synchronous: when a
/// call returns, the device-side effect is complete.
pub trait DeviceBackend: Send + Sync {
    /// Backend name for logs (e.g. `"host"`, `"opencl"`).
    fn name(&self) -> &str;

    /// Devices of `class` on the platform at `platform_index`.
    ///
    /// An out-of-range platform index is an enumeration failure; an
    /// empty result is not (the enumerator decides how to treat it).
    fn list_devices(&self, platform_index: usize, class: DeviceClass) -> Result<Vec<DeviceId>>;

    /// Introspection snapshot for a device.
    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo>;

    /// Create a context bound to the given device set.
    fn create_context(&self, devices: &[DeviceId]) -> Result<ContextId>;

    /// Create an in-order command queue on one device within `context`.
    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId>;

    /// Allocate `size_bytes` of device memory with the given access intent.
    fn create_buffer(
        &self,
        context: ContextId,
        mode: AccessMode,
        size_bytes: usize,
    ) -> Result<BufferId>;

    /// Blocking write of `bytes` into `buffer`. The byte count must
    /// equal the buffer size exactly.
    fn write_buffer(&self, queue: QueueId, buffer: BufferId, bytes: &[u8]) -> Result<()>;

    /// Blocking read of `buffer` into `out`. The byte count must equal
    /// the buffer size exactly.
    fn read_buffer(&self, queue: QueueId, buffer: BufferId, out: &mut [u8]) -> Result<()>;

    /// Compile `source` for the device set within `context`.
    fn build_program(
        &self,
        context: ContextId,
        source: &str,
        devices: &[DeviceId],
    ) -> Result<ProgramId>;

    /// Extract the named entry point from a built program.
    fn create_kernel(&self, program: ProgramId, entry: &str) -> Result<KernelId>;

    /// Number of parameters the kernel's entry point declares.
    fn kernel_arity(&self, kernel: KernelId) -> Result<usize>;

    /// Bind `buffer` to the zero-based positional argument slot `index`.
    fn set_kernel_arg(&self, kernel: KernelId, index: usize, buffer: BufferId) -> Result<()>;

    /// Submit the kernel over a one-dimensional index space.
    fn enqueue_nd_range(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: usize,
        local: usize,
    ) -> Result<()>;

    /// Block until every operation enqueued on `queue` has completed.
    fn finish(&self, queue: QueueId) -> Result<()>;

    fn release_kernel(&self, kernel: KernelId) -> Result<()>;

    fn release_program(&self, program: ProgramId) -> Result<()>;

    fn release_buffer(&self, buffer: BufferId) -> Result<()>;

    fn release_queue(&self, queue: QueueId) -> Result<()>;

    fn release_context(&self, context: ContextId) -> Result<()>;
}
