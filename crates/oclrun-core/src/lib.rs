//! Single-device compute dispatch pipeline.
//!
//! This crate stages host data into device-visible buffers, compiles
//! and binds a compute kernel, executes it over a one-dimensional
//! work-item grid, and retrieves the results — with every acquired
//! device object (context, queue, buffers, program, kernel) released
//! exactly once, in reverse dependency order, on success and failure
//! paths alike.
//!
//! The crate is organized around a device API seam:
//! - [`backend`]: opaque handles and the [`DeviceBackend`] trait
//! - [`host`]: an in-process reference device (always available, used
//!   by the test suite as a counting mock)
//! - `cl` (feature `opencl`): the real OpenCL backend via `opencl3`
//!
//! On top of the seam sit the pipeline components: [`device`]
//! enumeration, [`context`] and queue management, [`buffers`],
//! [`program`] building and argument binding, [`dispatch`], the
//! per-operation status [`report`]er, and the [`pipeline`] lifecycle
//! coordinator that sequences them.

pub mod backend;
pub mod buffers;
#[cfg(feature = "opencl")]
pub mod cl;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod kernels;
pub mod pipeline;
pub mod program;
pub mod report;

pub use backend::{
    BufferId, ContextId, DeviceBackend, DeviceId, KernelId, ProgramId, QueueId,
};
pub use buffers::{AccessMode, BufferManager, buffer_bytes};
#[cfg(feature = "opencl")]
pub use cl::ClBackend;
pub use context::ContextManager;
pub use device::{DeviceClass, DeviceEnumerator, DeviceInfo, EnumeratorConfig};
pub use dispatch::{DispatchEngine, WorkShape};
pub use error::{OclError, Result};
pub use host::{FailPoint, HostBackend, ResourceCounters};
pub use pipeline::{
    FailurePolicy, Pipeline, PipelineConfig, PipelineReport, PipelineStage, StepOutcome,
    StepReport,
};
pub use program::{Kernel, ProgramBuilder};
pub use report::{ReporterConfig, StatusReporter};
