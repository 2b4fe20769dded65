//! Lifecycle coordination for the whole dispatch pipeline.
//!
//! [`Pipeline::run`] drives the fixed stage order
//! enumerate → context → queue → buffers → upload → build → bind →
//! dispatch → download, and guarantees that every object that reached
//! an allocated state is released exactly once, in reverse dependency
//! order (kernel → program → buffers → queue → context), whatever the
//! outcome of the later stages. The terminal `Released` stage is
//! always reached, on the failure path included.
//!
//! Failure handling is an explicit policy. The default `FailFast`
//! short-circuits to the release phase on the first non-success;
//! `ContinueOnError` reproduces the permissive behavior of classic
//! dispatch loops that log and keep going — with the restriction that
//! a stage whose prerequisite handle was never created is reported as
//! skipped instead of being invoked on an invalid handle.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::backend::{BufferId, DeviceBackend, KernelId};
use crate::buffers::{AccessMode, BufferManager, buffer_bytes};
use crate::context::ContextManager;
use crate::device::{DeviceClass, DeviceEnumerator, EnumeratorConfig};
use crate::dispatch::{DispatchEngine, WorkShape};
use crate::error::{OclError, Result};
use crate::kernels::VECTOR_ADD_SRC;
use crate::program::{Kernel, ProgramBuilder};
use crate::report::StatusReporter;

const ELEMENT_BYTES: usize = std::mem::size_of::<i32>();

/// States of the lifecycle coordinator, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PipelineStage {
    Unstarted,
    DevicesEnumerated,
    ContextReady,
    QueueReady,
    BuffersAllocated,
    DataUploaded,
    ProgramBuilt,
    KernelBound,
    Dispatched,
    ResultsDownloaded,
    Released,
}

impl PipelineStage {
    /// Stage name for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::DevicesEnumerated => "devices-enumerated",
            Self::ContextReady => "context-ready",
            Self::QueueReady => "queue-ready",
            Self::BuffersAllocated => "buffers-allocated",
            Self::DataUploaded => "data-uploaded",
            Self::ProgramBuilt => "program-built",
            Self::KernelBound => "kernel-bound",
            Self::Dispatched => "dispatched",
            Self::ResultsDownloaded => "results-downloaded",
            Self::Released => "released",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the coordinator does when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FailurePolicy {
    /// Short-circuit to the release phase on the first failure.
    #[default]
    FailFast,
    /// Keep running later stages whose prerequisite handles exist;
    /// report the rest as skipped.
    ContinueOnError,
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Device class to enumerate.
    pub device_class: DeviceClass,
    /// Platform index to query.
    pub platform_index: usize,
    /// Number of `i32` elements per host array.
    pub element_count: usize,
    /// Work-group size; must divide `element_count` evenly.
    pub local_work_size: usize,
    /// Entry point to extract from the built program.
    pub entry_point: String,
    /// Kernel source text to compile.
    pub kernel_source: String,
    /// Failure policy.
    pub policy: FailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_class: DeviceClass::Gpu,
            platform_index: 0,
            element_count: 1024,
            local_work_size: 64,
            entry_point: "vector_add".into(),
            kernel_source: VECTOR_ADD_SRC.into(),
            policy: FailurePolicy::FailFast,
        }
    }
}

/// Outcome of one recorded operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StepOutcome {
    Ok,
    Failed(OclError),
    Skipped,
}

/// One recorded operation with the stage it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub stage: PipelineStage,
    pub operation: String,
    pub outcome: StepOutcome,
}

/// Full record of one pipeline run.
#[derive(Debug, Serialize)]
pub struct PipelineReport {
    /// Every operation in execution order, releases included.
    pub steps: Vec<StepReport>,
    /// Always `Released` after `run` returns.
    pub final_stage: PipelineStage,
    /// Stage of the first failure, if any.
    pub failed_at: Option<PipelineStage>,
    /// The first error, if any.
    pub error: Option<OclError>,
    /// Downloaded results when the download stage ran.
    pub output: Option<Vec<i32>>,
}

impl PipelineReport {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            final_stage: PipelineStage::Unstarted,
            failed_at: None,
            error: None,
            output: None,
        }
    }

    /// Whether the run completed without any failure.
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    /// The downloaded results, or the first error.
    pub fn into_result(self) -> Result<Vec<i32>> {
        match self.error {
            None => Ok(self.output.unwrap_or_default()),
            Some(e) => Err(e),
        }
    }

    fn record(&mut self, stage: PipelineStage, operation: &str, outcome: StepOutcome) {
        if let StepOutcome::Failed(e) = &outcome {
            if self.error.is_none() {
                self.error = Some(e.clone());
                self.failed_at = Some(stage);
            }
        }
        self.steps.push(StepReport { stage, operation: operation.to_string(), outcome });
    }
}

/// Handles that reached an allocated state and therefore must be
/// released. Buffers keep their creation order; release walks it
/// backwards.
#[derive(Default)]
struct Acquired {
    context: Option<crate::backend::ContextId>,
    queue: Option<crate::backend::QueueId>,
    buffers: Vec<(&'static str, BufferId)>,
    program: Option<crate::backend::ProgramId>,
    kernel: Option<KernelId>,
}

/// Top-level sequencing of the dispatch pipeline.
pub struct Pipeline {
    backend: Arc<dyn DeviceBackend>,
    config: PipelineConfig,
    reporter: StatusReporter,
    enumerator: DeviceEnumerator,
    contexts: ContextManager,
    buffers: BufferManager,
    programs: ProgramBuilder,
    dispatcher: DispatchEngine,
}

impl Pipeline {
    /// Build a pipeline over `backend` with a silent reporter.
    pub fn new(backend: Arc<dyn DeviceBackend>, config: PipelineConfig) -> Self {
        let enumerator = DeviceEnumerator::new(
            backend.clone(),
            EnumeratorConfig { platform_index: config.platform_index },
        );
        Self {
            enumerator,
            contexts: ContextManager::new(backend.clone()),
            buffers: BufferManager::new(backend.clone()),
            programs: ProgramBuilder::new(backend.clone()),
            dispatcher: DispatchEngine::new(backend.clone()),
            reporter: StatusReporter::silent(),
            backend,
            config,
        }
    }

    /// Replace the reporter (the CLI injects a console-backed one).
    pub fn with_reporter(mut self, reporter: StatusReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the full lifecycle over the two input arrays.
    ///
    /// Returns a report whose `final_stage` is always `Released`; any
    /// failure is inside, together with every recorded step. Use
    /// [`PipelineReport::into_result`] for plain `Result` semantics.
    pub fn run(&self, a: &[i32], b: &[i32]) -> PipelineReport {
        let mut report = PipelineReport::new();
        let mut acquired = Acquired::default();
        let output = match self.config.policy {
            FailurePolicy::FailFast => self.run_fail_fast(a, b, &mut acquired, &mut report),
            FailurePolicy::ContinueOnError => {
                self.run_permissive(a, b, &mut acquired, &mut report)
            }
        };
        self.release_all(acquired, &mut report);
        report.final_stage = PipelineStage::Released;
        report.output = output;
        report
    }

    // ----- fail-fast path ------------------------------------------------

    fn run_fail_fast(
        &self,
        a: &[i32],
        b: &[i32],
        acquired: &mut Acquired,
        report: &mut PipelineReport,
    ) -> Option<Vec<i32>> {
        self.stages_fail_fast(a, b, acquired, report).ok()
    }

    fn stages_fail_fast(
        &self,
        a: &[i32],
        b: &[i32],
        acquired: &mut Acquired,
        report: &mut PipelineReport,
    ) -> Result<Vec<i32>> {
        use PipelineStage::*;
        let n = self.config.element_count;

        // An invalid element count must not create any device resource,
        // so the size check runs before the first device call.
        self.step(report, Unstarted, "validate element count", buffer_bytes(n, ELEMENT_BYTES))?;

        let devices = self.step(
            report,
            DevicesEnumerated,
            "enumerate devices",
            self.enumerator.list_devices(self.config.device_class),
        )?;
        let device = devices[0];

        let context =
            self.step(report, ContextReady, "create context", self.contexts.create_context(&devices))?;
        acquired.context = Some(context);

        let queue = self.step(
            report,
            QueueReady,
            "create queue",
            self.contexts.create_queue(context, device),
        )?;
        acquired.queue = Some(queue);

        let buf_a = self.step(
            report,
            BuffersAllocated,
            "allocate buffer a",
            self.buffers.allocate(context, AccessMode::ReadOnly, n, ELEMENT_BYTES),
        )?;
        acquired.buffers.push(("a", buf_a));
        let buf_b = self.step(
            report,
            BuffersAllocated,
            "allocate buffer b",
            self.buffers.allocate(context, AccessMode::ReadOnly, n, ELEMENT_BYTES),
        )?;
        acquired.buffers.push(("b", buf_b));
        let buf_out = self.step(
            report,
            BuffersAllocated,
            "allocate buffer out",
            self.buffers.allocate(context, AccessMode::WriteOnly, n, ELEMENT_BYTES),
        )?;
        acquired.buffers.push(("out", buf_out));

        self.step(report, DataUploaded, "upload buffer a", self.buffers.upload(queue, buf_a, a))?;
        self.step(report, DataUploaded, "upload buffer b", self.buffers.upload(queue, buf_b, b))?;

        let program = self.step(
            report,
            ProgramBuilt,
            "build program",
            self.programs.build_program(context, &self.config.kernel_source, &devices),
        )?;
        acquired.program = Some(program);

        let mut kernel = self.step(
            report,
            KernelBound,
            "create kernel",
            self.programs.create_kernel(program, &self.config.entry_point),
        )?;
        acquired.kernel = Some(kernel.id());

        self.step(
            report,
            KernelBound,
            "bind argument 0",
            self.programs.bind_argument(&mut kernel, 0, buf_a),
        )?;
        self.step(
            report,
            KernelBound,
            "bind argument 1",
            self.programs.bind_argument(&mut kernel, 1, buf_b),
        )?;
        self.step(
            report,
            KernelBound,
            "bind argument 2",
            self.programs.bind_argument(&mut kernel, 2, buf_out),
        )?;

        let shape = WorkShape { global: n, local: self.config.local_work_size };
        self.step(
            report,
            Dispatched,
            "dispatch kernel",
            self.dispatcher.dispatch(queue, &kernel, shape),
        )?;

        let mut output = vec![0i32; n];
        self.step(
            report,
            ResultsDownloaded,
            "download results",
            self.buffers.download(queue, buf_out, &mut output),
        )?;
        Ok(output)
    }

    /// Record one fail-fast step and propagate its result.
    fn step<T>(
        &self,
        report: &mut PipelineReport,
        stage: PipelineStage,
        operation: &str,
        result: Result<T>,
    ) -> Result<T> {
        self.reporter.report(operation, &result);
        match result {
            Ok(v) => {
                report.record(stage, operation, StepOutcome::Ok);
                Ok(v)
            }
            Err(e) => {
                report.record(stage, operation, StepOutcome::Failed(e.clone()));
                Err(e)
            }
        }
    }

    // ----- permissive path -----------------------------------------------

    fn run_permissive(
        &self,
        a: &[i32],
        b: &[i32],
        acquired: &mut Acquired,
        report: &mut PipelineReport,
    ) -> Option<Vec<i32>> {
        use PipelineStage::*;
        let n = self.config.element_count;

        let devices = self.step_continue(
            report,
            DevicesEnumerated,
            "enumerate devices",
            self.enumerator.list_devices(self.config.device_class),
        );

        let context = match devices.as_deref() {
            Some(d) => self.step_continue(
                report,
                ContextReady,
                "create context",
                self.contexts.create_context(d),
            ),
            None => self.skip(report, ContextReady, "create context"),
        };
        acquired.context = context;

        let queue = match (context, devices.as_deref()) {
            (Some(c), Some(d)) => self.step_continue(
                report,
                QueueReady,
                "create queue",
                self.contexts.create_queue(c, d[0]),
            ),
            _ => self.skip(report, QueueReady, "create queue"),
        };
        acquired.queue = queue;

        let alloc = |label: &'static str,
                         mode: AccessMode,
                         acquired: &mut Acquired,
                         report: &mut PipelineReport| {
            let operation = format!("allocate buffer {label}");
            let buffer = match context {
                Some(c) => self.step_continue(
                    report,
                    BuffersAllocated,
                    &operation,
                    self.buffers.allocate(c, mode, n, ELEMENT_BYTES),
                ),
                None => self.skip(report, BuffersAllocated, &operation),
            };
            if let Some(id) = buffer {
                acquired.buffers.push((label, id));
            }
            buffer
        };
        let buf_a = alloc("a", AccessMode::ReadOnly, acquired, report);
        let buf_b = alloc("b", AccessMode::ReadOnly, acquired, report);
        let buf_out = alloc("out", AccessMode::WriteOnly, acquired, report);

        for (operation, buffer, data) in
            [("upload buffer a", buf_a, a), ("upload buffer b", buf_b, b)]
        {
            match (queue, buffer) {
                (Some(q), Some(buf)) => {
                    let _ = self.step_continue(
                        report,
                        DataUploaded,
                        operation,
                        self.buffers.upload(q, buf, data),
                    );
                }
                _ => {
                    let _: Option<()> = self.skip(report, DataUploaded, operation);
                }
            }
        }

        let program = match (context, devices.as_deref()) {
            (Some(c), Some(d)) => self.step_continue(
                report,
                ProgramBuilt,
                "build program",
                self.programs.build_program(c, &self.config.kernel_source, d),
            ),
            _ => self.skip(report, ProgramBuilt, "build program"),
        };
        acquired.program = program;

        let mut kernel: Option<Kernel> = match program {
            Some(p) => self.step_continue(
                report,
                KernelBound,
                "create kernel",
                self.programs.create_kernel(p, &self.config.entry_point),
            ),
            None => self.skip(report, KernelBound, "create kernel"),
        };
        acquired.kernel = kernel.as_ref().map(|k| k.id());

        for (index, (operation, buffer)) in [
            ("bind argument 0", buf_a),
            ("bind argument 1", buf_b),
            ("bind argument 2", buf_out),
        ]
        .into_iter()
        .enumerate()
        {
            match (kernel.as_mut(), buffer) {
                (Some(k), Some(buf)) => {
                    let _ = self.step_continue(
                        report,
                        KernelBound,
                        operation,
                        self.programs.bind_argument(k, index, buf),
                    );
                }
                _ => {
                    let _: Option<()> = self.skip(report, KernelBound, operation);
                }
            }
        }

        let shape = WorkShape { global: n, local: self.config.local_work_size };
        match (queue, kernel.as_ref()) {
            (Some(q), Some(k)) => {
                let _ = self.step_continue(
                    report,
                    Dispatched,
                    "dispatch kernel",
                    self.dispatcher.dispatch(q, k, shape),
                );
            }
            _ => {
                let _: Option<()> = self.skip(report, Dispatched, "dispatch kernel");
            }
        }

        match (queue, buf_out) {
            (Some(q), Some(out_buf)) => {
                let mut output = vec![0i32; n];
                self.step_continue(
                    report,
                    ResultsDownloaded,
                    "download results",
                    self.buffers.download(q, out_buf, &mut output),
                )
                .map(|_| output)
            }
            _ => self.skip(report, ResultsDownloaded, "download results"),
        }
    }

    /// Record one permissive step; failures are kept but not propagated.
    fn step_continue<T>(
        &self,
        report: &mut PipelineReport,
        stage: PipelineStage,
        operation: &str,
        result: Result<T>,
    ) -> Option<T> {
        self.reporter.report(operation, &result);
        match result {
            Ok(v) => {
                report.record(stage, operation, StepOutcome::Ok);
                Some(v)
            }
            Err(e) => {
                report.record(stage, operation, StepOutcome::Failed(e));
                None
            }
        }
    }

    fn skip<T>(
        &self,
        report: &mut PipelineReport,
        stage: PipelineStage,
        operation: &str,
    ) -> Option<T> {
        self.reporter.skipped(operation);
        report.record(stage, operation, StepOutcome::Skipped);
        None
    }

    // ----- release phase -------------------------------------------------

    /// Release every acquired handle in reverse dependency order.
    fn release_all(&self, acquired: Acquired, report: &mut PipelineReport) {
        if let Some(id) = acquired.kernel {
            self.release_step(report, "release kernel", self.backend.release_kernel(id));
        }
        if let Some(id) = acquired.program {
            self.release_step(report, "release program", self.backend.release_program(id));
        }
        for (label, id) in acquired.buffers.iter().rev() {
            let operation = format!("release buffer {label}");
            self.release_step(report, &operation, self.backend.release_buffer(*id));
        }
        if let Some(id) = acquired.queue {
            // Drain the queue before releasing it.
            if let Err(e) = self.backend.finish(id) {
                warn!(error = %e, "queue finish before release failed");
            }
            self.release_step(report, "release queue", self.backend.release_queue(id));
        }
        if let Some(id) = acquired.context {
            self.release_step(report, "release context", self.backend.release_context(id));
        }
    }

    fn release_step(&self, report: &mut PipelineReport, operation: &str, result: Result<()>) {
        self.reporter.report(operation, &result);
        match result {
            Ok(()) => report.record(PipelineStage::Released, operation, StepOutcome::Ok),
            Err(e) => {
                warn!(operation, error = %e, "release failed");
                report.record(PipelineStage::Released, operation, StepOutcome::Failed(e));
            }
        }
    }
}
