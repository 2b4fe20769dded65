//! Property-based tests for the dispatch pipeline.
//!
//! Invariants that must hold across all valid inputs:
//!
//! - **Round trip**: uploading A and B, dispatching `vector_add`, and
//!   downloading C yields `C[i] == A[i] + B[i]` (wrapping) everywhere.
//! - **Divisibility**: any global/local pair where the local size does
//!   not divide the global evenly is rejected with a dispatch error.
//! - **Teardown**: every run, successful or not, leaves the backend
//!   with balanced create/release counters and no live handles.
//! - **Size math**: `buffer_bytes` never silently overflows.

use std::sync::Arc;

use oclrun_core::{
    HostBackend, OclError, Pipeline, PipelineConfig, WorkShape, buffer_bytes, kernels,
};
use proptest::prelude::*;

// ── Strategies ──────────────────────────────────────────────────────

/// Element counts paired with a local size that divides them evenly.
fn arb_shape() -> impl Strategy<Value = (usize, usize)> {
    (prop::sample::select(vec![1usize, 2, 4, 8, 16, 32, 64]), 1usize..=16)
        .prop_map(|(local, groups)| (local * groups, local))
}

fn arb_inputs(n: usize) -> impl Strategy<Value = (Vec<i32>, Vec<i32>)> {
    (
        prop::collection::vec(any::<i32>(), n),
        prop::collection::vec(any::<i32>(), n),
    )
}

// ── Round-trip property ─────────────────────────────────────────────

proptest! {
    #[test]
    fn vector_add_round_trip((n, local) in arb_shape(), seed in any::<i32>()) {
        let a: Vec<i32> = (0..n as i32).map(|i| i.wrapping_mul(seed)).collect();
        let b: Vec<i32> = (0..n as i32).map(|i| i.wrapping_sub(seed)).collect();

        let backend = Arc::new(HostBackend::new());
        let pipeline = Pipeline::new(
            backend.clone(),
            PipelineConfig { element_count: n, local_work_size: local, ..Default::default() },
        );
        let output = pipeline.run(&a, &b).into_result().unwrap();

        prop_assert_eq!(output.len(), n);
        for i in 0..n {
            prop_assert_eq!(output[i], a[i].wrapping_add(b[i]), "index {}", i);
        }
        prop_assert!(backend.counters().balanced());
        prop_assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn vector_sub_round_trip((ab, (n, local)) in arb_shape().prop_flat_map(|s| (arb_inputs(s.0), Just(s)))) {
        let (a, b) = ab;
        let backend = Arc::new(HostBackend::new());
        let pipeline = Pipeline::new(
            backend.clone(),
            PipelineConfig {
                element_count: n,
                local_work_size: local,
                kernel_source: kernels::VECTOR_SUB_SRC.into(),
                entry_point: "vector_sub".into(),
                ..Default::default()
            },
        );
        let output = pipeline.run(&a, &b).into_result().unwrap();
        for i in 0..n {
            prop_assert_eq!(output[i], a[i].wrapping_sub(b[i]));
        }
    }
}

// ── Divisibility invariant ──────────────────────────────────────────

proptest! {
    #[test]
    fn indivisible_shapes_always_rejected(global in 1usize..=4096, local in 1usize..=512) {
        prop_assume!(global % local != 0);
        let err = WorkShape { global, local }.validate().unwrap_err();
        prop_assert!(matches!(err, OclError::Dispatch { .. }));
    }

    #[test]
    fn divisible_shapes_always_accepted(local in 1usize..=512, groups in 1usize..=64) {
        let shape = WorkShape { global: local * groups, local };
        prop_assert!(shape.validate().is_ok());
        prop_assert_eq!(shape.work_groups(), groups);
    }

    #[test]
    fn pipeline_rejects_indivisible_shapes(n in 2usize..=1024, local in 2usize..=64) {
        prop_assume!(n % local != 0);
        let a: Vec<i32> = vec![1; n];
        let backend = Arc::new(HostBackend::new());
        let pipeline = Pipeline::new(
            backend.clone(),
            PipelineConfig { element_count: n, local_work_size: local, ..Default::default() },
        );
        let report = pipeline.run(&a, &a);
        prop_assert!(matches!(report.error, Some(OclError::Dispatch { .. })));
        // The failed run must still tear everything down.
        prop_assert!(backend.counters().balanced());
        prop_assert_eq!(backend.live_objects(), 0);
    }
}

// ── Buffer size math ────────────────────────────────────────────────

proptest! {
    #[test]
    fn buffer_bytes_matches_checked_mul(count in 0usize..=1 << 32, size in 0usize..=64) {
        match (count.checked_mul(size), count, size) {
            (_, 0, _) | (_, _, 0) => prop_assert!(buffer_bytes(count, size).is_err()),
            (Some(product), _, _) => prop_assert_eq!(buffer_bytes(count, size).unwrap(), product),
            (None, _, _) => prop_assert!(buffer_bytes(count, size).is_err()),
        }
    }
}
