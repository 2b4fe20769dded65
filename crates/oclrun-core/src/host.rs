//! In-process reference device.
//!
//! [`HostBackend`] implements the full [`DeviceBackend`] surface in
//! host memory so the pipeline, its invariants, and its failure paths
//! run without GPU hardware. It stands in for a single GPU-class
//! device, "compiles" programs by scanning the OpenCL C source for
//! `__kernel` entry points, executes the shipped entry points one
//! work-item at a time, and counts every create and release per
//! resource kind — which makes it the mock device layer the
//! release-idempotence property is verified against.
//!
//! Execution is ground truth, not performance: kernels run
//! sequentially over `i32` buffers, matching what the device kernels
//! compute.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::backend::{
    BufferId, ContextId, DeviceBackend, DeviceId, KernelId, ProgramId, QueueId,
};
use crate::buffers::AccessMode;
use crate::device::{DeviceClass, DeviceInfo};
use crate::error::{OclError, Result};

/// The single device the host backend exposes.
const HOST_DEVICE_ID: u64 = 1;

/// Create/release tallies per resource kind, plus dispatch count.
///
/// Every successful create increments its `*_created` field and every
/// successful release its `*_released` field, so a leak-free lifecycle
/// leaves the two columns equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounters {
    pub contexts_created: u64,
    pub contexts_released: u64,
    pub queues_created: u64,
    pub queues_released: u64,
    pub buffers_created: u64,
    pub buffers_released: u64,
    pub programs_created: u64,
    pub programs_released: u64,
    pub kernels_created: u64,
    pub kernels_released: u64,
    /// Successfully executed ND-range submissions.
    pub dispatches: u64,
}

impl ResourceCounters {
    /// Whether every create has a matching release.
    pub fn balanced(&self) -> bool {
        self.contexts_created == self.contexts_released
            && self.queues_created == self.queues_released
            && self.buffers_created == self.buffers_released
            && self.programs_created == self.programs_released
            && self.kernels_created == self.kernels_released
    }
}

/// Operation to fail on its next invocation, for exercising error
/// paths without real device faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreateContext,
    CreateQueue,
    CreateBuffer,
    BuildProgram,
    EnqueueNdRange,
}

/// One `__kernel` definition scanned out of program source.
#[derive(Debug, Clone)]
struct EntryDecl {
    name: String,
    /// Per-parameter constness, in declaration order.
    param_const: Vec<bool>,
}

struct HostContext {
    devices: Vec<u64>,
}

struct HostQueue {
    context: u64,
}

struct HostBuffer {
    context: u64,
    mode: AccessMode,
    data: Vec<u8>,
}

struct HostProgram {
    context: u64,
    entries: Vec<EntryDecl>,
}

struct HostKernel {
    context: u64,
    entry: String,
    param_const: Vec<bool>,
    args: Vec<Option<u64>>,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    contexts: HashMap<u64, HostContext>,
    queues: HashMap<u64, HostQueue>,
    buffers: HashMap<u64, HostBuffer>,
    programs: HashMap<u64, HostProgram>,
    kernels: HashMap<u64, HostKernel>,
    counters: ResourceCounters,
    fail_next: Option<FailPoint>,
}

impl HostState {
    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_fail(&mut self, point: FailPoint) -> bool {
        if self.fail_next == Some(point) {
            self.fail_next = None;
            true
        } else {
            false
        }
    }
}

/// CPU reference implementation of the device API.
pub struct HostBackend {
    state: Mutex<HostState>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self { state: Mutex::new(HostState { next_id: HOST_DEVICE_ID, ..Default::default() }) }
    }

    /// Snapshot of the create/release tallies.
    pub fn counters(&self) -> ResourceCounters {
        self.state().counters
    }

    /// Number of handles currently alive across all resource kinds.
    pub fn live_objects(&self) -> usize {
        let s = self.state();
        s.contexts.len() + s.queues.len() + s.buffers.len() + s.programs.len() + s.kernels.len()
    }

    /// Arm a one-shot failure for the next invocation of `point`.
    pub fn fail_next(&self, point: FailPoint) {
        self.state().fail_next = Some(point);
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        // A poisoning panic can only come from this module's own code;
        // the state itself stays consistent, so recover the guard.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DeviceBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn list_devices(&self, platform_index: usize, class: DeviceClass) -> Result<Vec<DeviceId>> {
        if platform_index != 0 {
            return Err(OclError::Enumeration {
                reason: format!(
                    "platform index {platform_index} out of range (host backend exposes 1 platform)"
                ),
            });
        }
        if class.matches(DeviceClass::Gpu) {
            Ok(vec![DeviceId(HOST_DEVICE_ID)])
        } else {
            Ok(Vec::new())
        }
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        if device.0 != HOST_DEVICE_ID {
            return Err(OclError::Enumeration {
                reason: format!("unknown device handle {}", device.0),
            });
        }
        Ok(DeviceInfo {
            name: "oclrun host reference".into(),
            vendor: "oclrun".into(),
            class: DeviceClass::Gpu,
            max_work_group_size: 1024,
            global_mem_bytes: 0,
        })
    }

    fn create_context(&self, devices: &[DeviceId]) -> Result<ContextId> {
        let mut s = self.state();
        if s.take_fail(FailPoint::CreateContext) {
            return Err(OclError::Device {
                operation: "create context",
                reason: "injected failure".into(),
            });
        }
        for d in devices {
            if d.0 != HOST_DEVICE_ID {
                return Err(OclError::Device {
                    operation: "create context",
                    reason: format!("unknown device handle {}", d.0),
                });
            }
        }
        let id = s.fresh_id();
        s.contexts.insert(id, HostContext { devices: devices.iter().map(|d| d.0).collect() });
        s.counters.contexts_created += 1;
        debug!(id, "host context created");
        Ok(ContextId(id))
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId> {
        let mut s = self.state();
        if s.take_fail(FailPoint::CreateQueue) {
            return Err(OclError::Device {
                operation: "create queue",
                reason: "injected failure".into(),
            });
        }
        let ctx = s.contexts.get(&context.0).ok_or(OclError::Device {
            operation: "create queue",
            reason: "unknown context handle".into(),
        })?;
        if !ctx.devices.contains(&device.0) {
            return Err(OclError::Device {
                operation: "create queue",
                reason: format!("device {} is not part of the context", device.0),
            });
        }
        let id = s.fresh_id();
        s.queues.insert(id, HostQueue { context: context.0 });
        s.counters.queues_created += 1;
        debug!(id, "host queue created");
        Ok(QueueId(id))
    }

    fn create_buffer(
        &self,
        context: ContextId,
        mode: AccessMode,
        size_bytes: usize,
    ) -> Result<BufferId> {
        let mut s = self.state();
        if s.take_fail(FailPoint::CreateBuffer) {
            return Err(OclError::Allocation { size_bytes, reason: "injected failure".into() });
        }
        if size_bytes == 0 {
            return Err(OclError::Allocation {
                size_bytes,
                reason: "zero-sized buffer".into(),
            });
        }
        if !s.contexts.contains_key(&context.0) {
            return Err(OclError::Allocation {
                size_bytes,
                reason: "unknown context handle".into(),
            });
        }
        let id = s.fresh_id();
        s.buffers.insert(id, HostBuffer { context: context.0, mode, data: vec![0u8; size_bytes] });
        s.counters.buffers_created += 1;
        debug!(id, size_bytes, "host buffer created");
        Ok(BufferId(id))
    }

    fn write_buffer(&self, queue: QueueId, buffer: BufferId, bytes: &[u8]) -> Result<()> {
        let mut s = self.state();
        let queue_ctx = s
            .queues
            .get(&queue.0)
            .ok_or(OclError::Transfer { reason: "unknown queue handle".into() })?
            .context;
        let buf = s
            .buffers
            .get_mut(&buffer.0)
            .ok_or(OclError::Transfer { reason: "unknown buffer handle".into() })?;
        if buf.context != queue_ctx {
            return Err(OclError::Transfer {
                reason: "queue and buffer belong to different contexts".into(),
            });
        }
        if bytes.len() != buf.data.len() {
            return Err(OclError::Transfer {
                reason: format!(
                    "write size {} does not match buffer size {}",
                    bytes.len(),
                    buf.data.len()
                ),
            });
        }
        buf.data.copy_from_slice(bytes);
        Ok(())
    }

    fn read_buffer(&self, queue: QueueId, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        let s = self.state();
        let queue_ctx = s
            .queues
            .get(&queue.0)
            .ok_or(OclError::Transfer { reason: "unknown queue handle".into() })?
            .context;
        let buf = s
            .buffers
            .get(&buffer.0)
            .ok_or(OclError::Transfer { reason: "unknown buffer handle".into() })?;
        if buf.context != queue_ctx {
            return Err(OclError::Transfer {
                reason: "queue and buffer belong to different contexts".into(),
            });
        }
        if out.len() != buf.data.len() {
            return Err(OclError::Transfer {
                reason: format!(
                    "read size {} does not match buffer size {}",
                    out.len(),
                    buf.data.len()
                ),
            });
        }
        out.copy_from_slice(&buf.data);
        Ok(())
    }

    fn build_program(
        &self,
        context: ContextId,
        source: &str,
        devices: &[DeviceId],
    ) -> Result<ProgramId> {
        let mut s = self.state();
        if s.take_fail(FailPoint::BuildProgram) {
            return Err(OclError::Compile { log: "injected build failure".into() });
        }
        if !s.contexts.contains_key(&context.0) {
            return Err(OclError::Compile { log: "unknown context handle".into() });
        }
        for d in devices {
            if d.0 != HOST_DEVICE_ID {
                return Err(OclError::Compile {
                    log: format!("unknown device handle {}", d.0),
                });
            }
        }
        let entries = scan_kernel_entries(source).map_err(|log| OclError::Compile { log })?;
        let id = s.fresh_id();
        s.programs.insert(id, HostProgram { context: context.0, entries });
        s.counters.programs_created += 1;
        debug!(id, "host program built");
        Ok(ProgramId(id))
    }

    fn create_kernel(&self, program: ProgramId, entry: &str) -> Result<KernelId> {
        let mut s = self.state();
        let prog = s.programs.get(&program.0).ok_or(OclError::Device {
            operation: "create kernel",
            reason: "unknown program handle".into(),
        })?;
        let decl = prog
            .entries
            .iter()
            .find(|e| e.name == entry)
            .ok_or_else(|| OclError::Symbol { name: entry.to_string() })?
            .clone();
        let context = prog.context;
        let arity = decl.param_const.len();
        let id = s.fresh_id();
        s.kernels.insert(
            id,
            HostKernel {
                context,
                entry: decl.name,
                param_const: decl.param_const,
                args: vec![None; arity],
            },
        );
        s.counters.kernels_created += 1;
        debug!(id, entry, "host kernel created");
        Ok(KernelId(id))
    }

    fn kernel_arity(&self, kernel: KernelId) -> Result<usize> {
        let s = self.state();
        let k = s.kernels.get(&kernel.0).ok_or(OclError::Device {
            operation: "query kernel",
            reason: "unknown kernel handle".into(),
        })?;
        Ok(k.param_const.len())
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: usize, buffer: BufferId) -> Result<()> {
        let mut s = self.state();
        let (buf_context, buf_mode) = {
            let buf = s
                .buffers
                .get(&buffer.0)
                .ok_or(OclError::Binding { reason: "unknown buffer handle".into() })?;
            (buf.context, buf.mode)
        };
        let k = s
            .kernels
            .get_mut(&kernel.0)
            .ok_or(OclError::Binding { reason: "unknown kernel handle".into() })?;
        if index >= k.param_const.len() {
            return Err(OclError::Binding {
                reason: format!(
                    "argument index {index} out of range (arity {})",
                    k.param_const.len()
                ),
            });
        }
        if buf_context != k.context {
            return Err(OclError::Binding {
                reason: "buffer and kernel belong to different contexts".into(),
            });
        }
        // Access-mode compatibility against the declared parameter.
        let is_const = k.param_const[index];
        if is_const && buf_mode == AccessMode::WriteOnly {
            return Err(OclError::Binding {
                reason: format!(
                    "write-only buffer bound to const parameter {index} of '{}'",
                    k.entry
                ),
            });
        }
        if !is_const && buf_mode == AccessMode::ReadOnly {
            return Err(OclError::Binding {
                reason: format!(
                    "read-only buffer bound to writable parameter {index} of '{}'",
                    k.entry
                ),
            });
        }
        k.args[index] = Some(buffer.0);
        Ok(())
    }

    fn enqueue_nd_range(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: usize,
        local: usize,
    ) -> Result<()> {
        let mut s = self.state();
        if s.take_fail(FailPoint::EnqueueNdRange) {
            return Err(OclError::Dispatch { reason: "injected failure".into() });
        }
        if local == 0 || global % local != 0 {
            return Err(OclError::Dispatch {
                reason: format!("global {global} not a multiple of local {local}"),
            });
        }
        let queue_ctx = s
            .queues
            .get(&queue.0)
            .ok_or(OclError::Dispatch { reason: "unknown queue handle".into() })?
            .context;
        let (entry, args, kernel_ctx) = {
            let k = s
                .kernels
                .get(&kernel.0)
                .ok_or(OclError::Dispatch { reason: "unknown kernel handle".into() })?;
            let mut args = Vec::with_capacity(k.args.len());
            for (i, a) in k.args.iter().enumerate() {
                match a {
                    Some(id) => args.push(*id),
                    None => {
                        return Err(OclError::Dispatch {
                            reason: format!("argument slot {i} of '{}' is unbound", k.entry),
                        });
                    }
                }
            }
            (k.entry.clone(), args, k.context)
        };
        if kernel_ctx != queue_ctx {
            return Err(OclError::Dispatch {
                reason: "queue and kernel belong to different contexts".into(),
            });
        }

        execute_entry(&mut s, &entry, &args, global)?;
        s.counters.dispatches += 1;
        debug!(entry, global, local, "host kernel executed");
        Ok(())
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        // Execution is synchronous; finishing only validates the handle.
        let s = self.state();
        if !s.queues.contains_key(&queue.0) {
            return Err(OclError::Device {
                operation: "finish queue",
                reason: "unknown queue handle".into(),
            });
        }
        Ok(())
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<()> {
        let mut s = self.state();
        if s.kernels.remove(&kernel.0).is_none() {
            return Err(OclError::Device {
                operation: "release kernel",
                reason: "unknown kernel handle".into(),
            });
        }
        s.counters.kernels_released += 1;
        Ok(())
    }

    fn release_program(&self, program: ProgramId) -> Result<()> {
        let mut s = self.state();
        if s.programs.remove(&program.0).is_none() {
            return Err(OclError::Device {
                operation: "release program",
                reason: "unknown program handle".into(),
            });
        }
        s.counters.programs_released += 1;
        Ok(())
    }

    fn release_buffer(&self, buffer: BufferId) -> Result<()> {
        let mut s = self.state();
        if s.buffers.remove(&buffer.0).is_none() {
            return Err(OclError::Device {
                operation: "release buffer",
                reason: "unknown buffer handle".into(),
            });
        }
        s.counters.buffers_released += 1;
        Ok(())
    }

    fn release_queue(&self, queue: QueueId) -> Result<()> {
        let mut s = self.state();
        if s.queues.remove(&queue.0).is_none() {
            return Err(OclError::Device {
                operation: "release queue",
                reason: "unknown queue handle".into(),
            });
        }
        s.counters.queues_released += 1;
        Ok(())
    }

    fn release_context(&self, context: ContextId) -> Result<()> {
        let mut s = self.state();
        if s.contexts.remove(&context.0).is_none() {
            return Err(OclError::Device {
                operation: "release context",
                reason: "unknown context handle".into(),
            });
        }
        let dependents = s.queues.values().filter(|q| q.context == context.0).count()
            + s.buffers.values().filter(|b| b.context == context.0).count()
            + s.programs.values().filter(|p| p.context == context.0).count()
            + s.kernels.values().filter(|k| k.context == context.0).count();
        if dependents > 0 {
            // Out-of-order teardown leaks the dependents; the counters
            // will show the imbalance.
            warn!(dependents, "context released with live dependent handles");
        }
        s.counters.contexts_released += 1;
        Ok(())
    }
}

/// Run one of the known entry points over its bound buffers.
fn execute_entry(s: &mut HostState, entry: &str, args: &[u64], global: usize) -> Result<()> {
    let op: fn(i32, i32) -> i32 = match entry {
        "vector_add" => i32::wrapping_add,
        "vector_sub" => i32::wrapping_sub,
        other => {
            return Err(OclError::Dispatch {
                reason: format!("no host implementation for entry '{other}'"),
            });
        }
    };
    if args.len() != 3 {
        return Err(OclError::Dispatch {
            reason: format!("entry '{entry}' expects 3 buffer arguments, got {}", args.len()),
        });
    }

    let needed = global.checked_mul(4).ok_or(OclError::Dispatch {
        reason: format!("global work size {global} overflows buffer addressing"),
    })?;
    for id in args {
        let buf = s
            .buffers
            .get(id)
            .ok_or(OclError::Dispatch { reason: "stale buffer handle in argument".into() })?;
        if buf.data.len() < needed {
            return Err(OclError::Dispatch {
                reason: format!(
                    "global work size {global} exceeds buffer of {} bytes",
                    buf.data.len()
                ),
            });
        }
    }

    let read_i32 = |data: &[u8], gid: usize| {
        let at = gid * 4;
        i32::from_ne_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
    };

    // Copy inputs out so the output buffer can alias either input.
    let a: Vec<i32> = {
        let data = &s.buffers[&args[0]].data;
        (0..global).map(|gid| read_i32(data, gid)).collect()
    };
    let b: Vec<i32> = {
        let data = &s.buffers[&args[1]].data;
        (0..global).map(|gid| read_i32(data, gid)).collect()
    };
    let out = s
        .buffers
        .get_mut(&args[2])
        .ok_or(OclError::Dispatch { reason: "stale buffer handle in argument".into() })?;
    for gid in 0..global {
        let v = op(a[gid], b[gid]);
        out.data[gid * 4..gid * 4 + 4].copy_from_slice(&v.to_ne_bytes());
    }
    Ok(())
}

/// Scan OpenCL C source for `__kernel void <name>(<params>)` entries.
///
/// Returns the declarations in source order, or a build log when the
/// source declares no kernels or a declaration is malformed.
fn scan_kernel_entries(source: &str) -> std::result::Result<Vec<EntryDecl>, String> {
    let mut entries = Vec::new();
    let mut rest = source;
    while let Some(at) = rest.find("__kernel") {
        let after = &rest[at + "__kernel".len()..];
        let after = after.trim_start();
        let Some(after) = after.strip_prefix("void") else {
            return Err("expected 'void' after '__kernel'".into());
        };
        if after.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
            return Err("expected 'void' after '__kernel'".into());
        }
        let after = after.trim_start();
        let name_len = after
            .char_indices()
            .find(|&(_, c)| !(c.is_ascii_alphanumeric() || c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(after.len());
        if name_len == 0 {
            return Err("missing kernel name after '__kernel void'".into());
        }
        let name = &after[..name_len];
        let after_name = after[name_len..].trim_start();
        let Some(params_start) = after_name.strip_prefix('(') else {
            return Err(format!("expected parameter list after kernel '{name}'"));
        };
        let Some(close) = params_start.find(')') else {
            return Err(format!("unterminated parameter list in kernel '{name}'"));
        };
        let params = &params_start[..close];
        let param_const = parse_param_constness(params);
        entries.push(EntryDecl { name: name.to_string(), param_const });
        rest = &params_start[close..];
    }
    if entries.is_empty() {
        return Err("source defines no __kernel entry points".into());
    }
    Ok(entries)
}

/// Per-parameter constness of a comma-separated parameter list.
fn parse_param_constness(params: &str) -> Vec<bool> {
    let trimmed = params.trim();
    if trimmed.is_empty() || trimmed == "void" {
        return Vec::new();
    }
    trimmed
        .split(',')
        .map(|p| p.split_whitespace().any(|tok| tok == "const"))
        .collect()
}
