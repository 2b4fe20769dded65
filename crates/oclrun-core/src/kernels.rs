//! OpenCL C kernel source strings shipped with the pipeline.
//!
//! Each constant holds the full source for one kernel entry point,
//! compiled at runtime against the selected device set. The pipeline's
//! default workload binds exactly three buffer parameters: two inputs
//! and one output.

/// Element-wise addition over `int` buffers: `out[i] = a[i] + b[i]`.
pub const VECTOR_ADD_SRC: &str = r#"
__kernel void vector_add(
    __global const int* a,
    __global const int* b,
    __global int*       out)
{
    const uint gid = get_global_id(0);
    out[gid] = a[gid] + b[gid];
}
"#;

/// Element-wise subtraction over `int` buffers: `out[i] = a[i] - b[i]`.
pub const VECTOR_SUB_SRC: &str = r#"
__kernel void vector_sub(
    __global const int* a,
    __global const int* b,
    __global int*       out)
{
    const uint gid = get_global_id(0);
    out[gid] = a[gid] - b[gid];
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_not_empty() {
        assert!(!VECTOR_ADD_SRC.is_empty());
        assert!(!VECTOR_SUB_SRC.is_empty());
    }

    #[test]
    fn sources_define_kernels() {
        assert!(VECTOR_ADD_SRC.contains("__kernel"));
        assert!(VECTOR_SUB_SRC.contains("__kernel"));
    }

    #[test]
    fn entry_point_names_match() {
        assert!(VECTOR_ADD_SRC.contains("vector_add"));
        assert!(VECTOR_SUB_SRC.contains("vector_sub"));
    }
}
