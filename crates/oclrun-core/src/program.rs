//! Program compilation, kernel extraction, and argument binding.
//!
//! A [`Kernel`] tracks the declared parameter arity and which slots
//! have been bound so the dispatcher can enforce binding completeness
//! host-side before submission. Binding order across slots is free;
//! completeness is not.

use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{BufferId, ContextId, DeviceBackend, DeviceId, KernelId, ProgramId};
use crate::error::{OclError, Result};

/// An executable entry point with its binding state.
#[derive(Debug)]
pub struct Kernel {
    id: KernelId,
    entry: String,
    arity: usize,
    bound: Vec<bool>,
}

impl Kernel {
    /// The backend handle.
    pub fn id(&self) -> KernelId {
        self.id
    }

    /// The entry point name this kernel was extracted for.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Number of declared parameters.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Whether every declared slot has been bound.
    pub fn is_fully_bound(&self) -> bool {
        self.bound.iter().all(|&b| b)
    }

    /// Indices of slots still unbound, in ascending order.
    pub fn unbound_slots(&self) -> Vec<usize> {
        self.bound
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| if b { None } else { Some(i) })
            .collect()
    }
}

/// Compiles programs and prepares kernels over the backend seam.
pub struct ProgramBuilder {
    backend: Arc<dyn DeviceBackend>,
}

impl ProgramBuilder {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }

    /// Compile `source` for the device set within `context`.
    ///
    /// Fails with [`OclError::Compile`] carrying the build log when
    /// compilation fails for any targeted device.
    pub fn build_program(
        &self,
        context: ContextId,
        source: &str,
        devices: &[DeviceId],
    ) -> Result<ProgramId> {
        let program = self.backend.build_program(context, source, devices)?;
        info!(source_bytes = source.len(), devices = devices.len(), "program built");
        Ok(program)
    }

    /// Extract the named entry point from a built program.
    ///
    /// Fails with [`OclError::Symbol`] when the program does not define
    /// `entry`.
    pub fn create_kernel(&self, program: ProgramId, entry: &str) -> Result<Kernel> {
        let id = self.backend.create_kernel(program, entry)?;
        let arity = self.backend.kernel_arity(id)?;
        debug!(entry, arity, "kernel created");
        Ok(Kernel { id, entry: entry.to_string(), arity, bound: vec![false; arity] })
    }

    /// Bind `buffer` to the zero-based positional slot `index`.
    ///
    /// Fails with [`OclError::Binding`] when the index is outside the
    /// kernel's declared arity or the device rejects the binding
    /// (access-mode mismatch).
    pub fn bind_argument(&self, kernel: &mut Kernel, index: usize, buffer: BufferId) -> Result<()> {
        if index >= kernel.arity {
            return Err(OclError::Binding {
                reason: format!(
                    "argument index {index} out of range for '{}' (arity {})",
                    kernel.entry, kernel.arity
                ),
            });
        }
        self.backend.set_kernel_arg(kernel.id, index, buffer)?;
        kernel.bound[index] = true;
        debug!(entry = %kernel.entry, index, "argument bound");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::AccessMode;
    use crate::device::DeviceClass;
    use crate::host::HostBackend;
    use crate::kernels::VECTOR_ADD_SRC;

    struct Fixture {
        backend: Arc<HostBackend>,
        builder: ProgramBuilder,
        context: ContextId,
        devices: Vec<DeviceId>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(HostBackend::new());
        let devices = backend.list_devices(0, DeviceClass::Gpu).unwrap();
        let context = backend.create_context(&devices).unwrap();
        let builder = ProgramBuilder::new(backend.clone());
        Fixture { backend, builder, context, devices }
    }

    #[test]
    fn build_and_extract_kernel() {
        let f = fixture();
        let program = f.builder.build_program(f.context, VECTOR_ADD_SRC, &f.devices).unwrap();
        let kernel = f.builder.create_kernel(program, "vector_add").unwrap();
        assert_eq!(kernel.entry(), "vector_add");
        assert_eq!(kernel.arity(), 3);
        assert!(!kernel.is_fully_bound());
        assert_eq!(kernel.unbound_slots(), vec![0, 1, 2]);
    }

    #[test]
    fn missing_entry_is_symbol_error() {
        let f = fixture();
        let program = f.builder.build_program(f.context, VECTOR_ADD_SRC, &f.devices).unwrap();
        let err = f.builder.create_kernel(program, "vector_mul").unwrap_err();
        assert_eq!(err, OclError::Symbol { name: "vector_mul".into() });
    }

    #[test]
    fn sourceless_text_is_compile_error() {
        let f = fixture();
        let err = f.builder.build_program(f.context, "int x;", &f.devices).unwrap_err();
        assert!(matches!(err, OclError::Compile { .. }), "got {err:?}");
    }

    #[test]
    fn binding_marks_slots() {
        let f = fixture();
        let program = f.builder.build_program(f.context, VECTOR_ADD_SRC, &f.devices).unwrap();
        let mut kernel = f.builder.create_kernel(program, "vector_add").unwrap();
        let queue_ctx = f.context;
        let a = f.backend.create_buffer(queue_ctx, AccessMode::ReadOnly, 16).unwrap();
        let b = f.backend.create_buffer(queue_ctx, AccessMode::ReadOnly, 16).unwrap();
        let out = f.backend.create_buffer(queue_ctx, AccessMode::WriteOnly, 16).unwrap();

        f.builder.bind_argument(&mut kernel, 2, out).unwrap();
        assert_eq!(kernel.unbound_slots(), vec![0, 1]);
        f.builder.bind_argument(&mut kernel, 0, a).unwrap();
        f.builder.bind_argument(&mut kernel, 1, b).unwrap();
        assert!(kernel.is_fully_bound());
    }

    #[test]
    fn out_of_arity_index_is_binding_error() {
        let f = fixture();
        let program = f.builder.build_program(f.context, VECTOR_ADD_SRC, &f.devices).unwrap();
        let mut kernel = f.builder.create_kernel(program, "vector_add").unwrap();
        let buf = f.backend.create_buffer(f.context, AccessMode::ReadOnly, 16).unwrap();
        let err = f.builder.bind_argument(&mut kernel, 3, buf).unwrap_err();
        assert!(matches!(err, OclError::Binding { .. }), "got {err:?}");
        assert!(!kernel.is_fully_bound());
    }

    #[test]
    fn const_param_rejects_write_only_buffer() {
        let f = fixture();
        let program = f.builder.build_program(f.context, VECTOR_ADD_SRC, &f.devices).unwrap();
        let mut kernel = f.builder.create_kernel(program, "vector_add").unwrap();
        // Slot 0 is declared `__global const int*`; a write-only buffer
        // is incompatible with a read parameter.
        let buf = f.backend.create_buffer(f.context, AccessMode::WriteOnly, 16).unwrap();
        let err = f.builder.bind_argument(&mut kernel, 0, buf).unwrap_err();
        assert!(matches!(err, OclError::Binding { .. }), "got {err:?}");
    }
}
