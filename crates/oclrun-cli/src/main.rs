//! oclrun — run a compute kernel through the full device lifecycle.
//!
//! Enumerates a device, stages two integer arrays, compiles and binds
//! the kernel, dispatches it, downloads the result, and releases every
//! acquired resource. One status line is printed per resource
//! operation (to stderr); the final report goes to stdout as text or
//! JSON. Exits nonzero when any pipeline stage fails or the device
//! results do not match the host-computed reference.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use console::style;
use serde::Serialize;
use tracing::debug;

use oclrun_core::{
    DeviceBackend, DeviceClass, DeviceEnumerator, EnumeratorConfig, FailurePolicy, HostBackend,
    Pipeline, PipelineConfig, PipelineReport, ReporterConfig, StatusReporter, kernels,
};

/// Output format for the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum OutputFormat {
    /// Human-readable text (default).
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown format '{other}'. Expected one of: text, json")),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Which device backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum BackendKind {
    /// In-process reference device (always available).
    #[default]
    Host,
    /// Real OpenCL devices (requires the `opencl` build feature).
    OpenCl,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "opencl" => Ok(Self::OpenCl),
            other => Err(format!("unknown backend '{other}'. Expected one of: host, opencl")),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::OpenCl => write!(f, "opencl"),
        }
    }
}

/// Run a vector compute kernel through the full device lifecycle.
#[derive(Parser)]
#[command(name = "oclrun")]
#[command(about = "Single-device compute dispatch pipeline runner")]
#[command(version)]
struct Cli {
    /// Number of elements per input array
    #[arg(short = 'n', long = "n", default_value_t = 1024, value_name = "COUNT")]
    element_count: usize,

    /// Work-group size (must divide the element count evenly)
    #[arg(long, default_value_t = 64, value_name = "SIZE")]
    local_size: usize,

    /// Kernel entry point to execute
    #[arg(long, default_value = "vector_add", value_name = "NAME")]
    entry: String,

    /// Kernel source file (defaults to the embedded vector_add source)
    #[arg(long, value_name = "PATH")]
    kernel: Option<PathBuf>,

    /// Device class to enumerate (gpu, cpu, accelerator, all)
    #[arg(long, default_value_t = DeviceClass::Gpu, value_name = "CLASS")]
    device_class: DeviceClass,

    /// Platform index to query
    #[arg(long, default_value_t = 0, value_name = "INDEX")]
    platform: usize,

    /// Device backend (host, opencl)
    #[arg(long, default_value_t = BackendKind::Host, value_name = "BACKEND")]
    backend: BackendKind,

    /// Keep running later stages after a failure instead of
    /// short-circuiting to the release phase
    #[arg(long)]
    continue_on_error: bool,

    /// Disable ANSI colors in status output
    #[arg(long)]
    no_color: bool,

    /// Output format for the final report (text, json)
    #[arg(long, default_value_t = OutputFormat::Text, value_name = "FORMAT")]
    format: OutputFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", value_name = "LEVEL")]
    log_level: String,
}

/// Final run summary, serialized in `--format json` mode.
#[derive(Serialize)]
struct RunSummary {
    backend: String,
    device: Option<oclrun_core::DeviceInfo>,
    element_count: usize,
    local_work_size: usize,
    entry_point: String,
    passed: bool,
    mismatches: Option<usize>,
    report: PipelineReport,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn run(cli: Cli) -> Result<bool> {
    let backend = make_backend(cli.backend)?;

    let kernel_source = match &cli.kernel {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read kernel source '{}'", path.display()))?,
        None => kernels::VECTOR_ADD_SRC.to_string(),
    };

    let config = PipelineConfig {
        device_class: cli.device_class,
        platform_index: cli.platform,
        element_count: cli.element_count,
        local_work_size: cli.local_size,
        entry_point: cli.entry.clone(),
        kernel_source,
        policy: if cli.continue_on_error {
            FailurePolicy::ContinueOnError
        } else {
            FailurePolicy::FailFast
        },
    };

    // Status lines go to stderr so a JSON report owns stdout.
    let reporter = StatusReporter::with_sink(
        ReporterConfig { color: !cli.no_color },
        Box::new(std::io::stderr()),
    );

    let device = describe_device(&backend, &config);
    let (a, b) = generate_inputs(cli.element_count);
    debug!(n = cli.element_count, backend = %cli.backend, "running pipeline");

    let pipeline = Pipeline::new(backend, config).with_reporter(reporter);
    let report = pipeline.run(&a, &b);

    let mismatches = verify(&cli.entry, &a, &b, &report);
    let passed = report.ok() && mismatches.unwrap_or(0) == 0;

    let summary = RunSummary {
        backend: cli.backend.to_string(),
        device,
        element_count: cli.element_count,
        local_work_size: cli.local_size,
        entry_point: cli.entry.clone(),
        passed,
        mismatches,
        report,
    };

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => print_text_summary(&summary, !cli.no_color),
    }
    Ok(passed)
}

fn make_backend(kind: BackendKind) -> Result<Arc<dyn DeviceBackend>> {
    match kind {
        BackendKind::Host => Ok(Arc::new(HostBackend::new())),
        #[cfg(feature = "opencl")]
        BackendKind::OpenCl => Ok(Arc::new(oclrun_core::ClBackend::new())),
        #[cfg(not(feature = "opencl"))]
        BackendKind::OpenCl => {
            bail!("this build has no OpenCL support; rebuild with --features opencl")
        }
    }
}

/// Best-effort device description for the summary; enumeration errors
/// surface later through the pipeline itself.
fn describe_device(
    backend: &Arc<dyn DeviceBackend>,
    config: &PipelineConfig,
) -> Option<oclrun_core::DeviceInfo> {
    let enumerator = DeviceEnumerator::new(
        backend.clone(),
        EnumeratorConfig { platform_index: config.platform_index },
    );
    let devices = enumerator.list_devices(config.device_class).ok()?;
    enumerator.device_info(devices[0]).ok()
}

/// The host-side input generator: two index-valued sequences.
fn generate_inputs(n: usize) -> (Vec<i32>, Vec<i32>) {
    let a: Vec<i32> = (0..n as i32).collect();
    let b: Vec<i32> = (0..n as i32).collect();
    (a, b)
}

/// Compare device results against the host-computed reference.
///
/// Returns `None` when there is nothing to verify (no output, or an
/// entry point without a host reference).
fn verify(entry: &str, a: &[i32], b: &[i32], report: &PipelineReport) -> Option<usize> {
    let op: fn(i32, i32) -> i32 = match entry {
        "vector_add" => i32::wrapping_add,
        "vector_sub" => i32::wrapping_sub,
        _ => return None,
    };
    let output = report.output.as_ref()?;
    if output.len() != a.len() || a.len() != b.len() {
        return Some(usize::MAX);
    }
    Some(
        (0..output.len())
            .filter(|&i| output[i] != op(a[i], b[i]))
            .count(),
    )
}

fn print_text_summary(summary: &RunSummary, color: bool) {
    let paint_ok = |s: &str| if color { style(s).green().bold().to_string() } else { s.into() };
    let paint_err = |s: &str| if color { style(s).red().bold().to_string() } else { s.into() };

    println!();
    if let Some(device) = &summary.device {
        println!("  Device:        {} ({})", device.name, device.vendor);
    }
    println!("  Backend:       {}", summary.backend);
    println!("  Elements:      {}", summary.element_count);
    println!("  Local size:    {}", summary.local_work_size);
    println!("  Entry point:   {}", summary.entry_point);
    if let Some(m) = summary.mismatches {
        println!("  Mismatches:    {m}");
    }
    if let Some(e) = &summary.report.error {
        println!("  First failure: {e}");
    }
    println!();
    if summary.passed {
        println!("{}", paint_ok("PASSED"));
    } else {
        println!("{}", paint_err("FAILED"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_pipeline_defaults() {
        let cli = Cli::parse_from(["oclrun"]);
        assert_eq!(cli.element_count, 1024);
        assert_eq!(cli.local_size, 64);
        assert_eq!(cli.entry, "vector_add");
        assert_eq!(cli.device_class, DeviceClass::Gpu);
        assert_eq!(cli.backend, BackendKind::Host);
        assert_eq!(cli.format, OutputFormat::Text);
        assert!(!cli.continue_on_error);
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from([
            "oclrun",
            "-n",
            "512",
            "--local-size",
            "32",
            "--entry",
            "vector_sub",
            "--device-class",
            "all",
            "--format",
            "json",
            "--no-color",
            "--continue-on-error",
        ]);
        assert_eq!(cli.element_count, 512);
        assert_eq!(cli.local_size, 32);
        assert_eq!(cli.entry, "vector_sub");
        assert_eq!(cli.device_class, DeviceClass::All);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(cli.no_color);
        assert!(cli.continue_on_error);
    }

    #[test]
    fn unknown_format_rejected() {
        assert!(Cli::try_parse_from(["oclrun", "--format", "xml"]).is_err());
        assert!("json".parse::<OutputFormat>().is_ok());
        assert!("yaml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn unknown_backend_rejected() {
        assert!("cuda".parse::<BackendKind>().is_err());
        assert_eq!("OpenCL".parse::<BackendKind>().unwrap(), BackendKind::OpenCl);
    }

    #[test]
    fn verify_counts_mismatches() {
        let a = vec![1, 2, 3];
        let b = vec![10, 20, 30];
        let report_output = vec![11, 22, 0];
        let report = fake_report(Some(report_output));
        assert_eq!(verify("vector_add", &a, &b, &report), Some(1));
        assert_eq!(verify("mystery", &a, &b, &report), None);
        assert_eq!(verify("vector_add", &a, &b, &fake_report(None)), None);
    }

    fn fake_report(output: Option<Vec<i32>>) -> PipelineReport {
        let backend = Arc::new(HostBackend::new());
        let pipeline = Pipeline::new(
            backend,
            PipelineConfig { element_count: 4, local_work_size: 4, ..Default::default() },
        );
        let mut report = pipeline.run(&[0, 1, 2, 3], &[0, 1, 2, 3]);
        report.output = output;
        report
    }
}
