#![forbid(unsafe_code)]

mod logging;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ob_api::OperatorSession;
use ob_core::{DType, DenseTensor, Device, Element, ExecutionMode};
use ob_kernel_cpu::PaddingMode;
use ob_operator::{Operator, OperatorCall, OperatorErrorKind, Pad2dConfig, Pad2dOperator};
use ob_runtime::{EvidenceEntry, EvidenceKind};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use logging::{LOG_SCHEMA_VERSION, StructuredCaseLog, det_seed, mode_label};

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    /// Largest accepted relative dot-test error for `f64` cases.
    pub tolerance_f64: f64,
    pub tolerance_f32: f64,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            tolerance_f64: 1e-12,
            tolerance_f32: 1e-5,
        }
    }

    #[must_use]
    pub fn tolerance_for(&self, dtype: DType) -> f64 {
        match dtype {
            DType::F64 => self.tolerance_f64,
            DType::F32 => self.tolerance_f32,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub mode: &'static str,
    pub cases_total: usize,
    pub cases_passed: usize,
}

impl HarnessReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.cases_total == self.cases_passed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdjointCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub dtype: DType,
    pub shape_ok: bool,
    pub identity_ok: bool,
    pub determinism_ok: bool,
    pub relative_error: f64,
    pub forensic_log: StructuredCaseLog,
}

impl AdjointCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.shape_ok && self.identity_ok && self.determinism_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub output_ok: bool,
    pub adjoint_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl ForwardCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.output_ok && self.adjoint_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub expectation_ok: bool,
    pub round_trip_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl ConfigCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.expectation_ok && self.round_trip_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchReport {
    pub iterations: usize,
    pub p50_ns: u128,
    pub p95_ns: u128,
    pub p99_ns: u128,
    pub mean_ns: u128,
}

/// Summary returned by [`emit_adjoint_report`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjointReport {
    pub schema_version: &'static str,
    pub output_path: PathBuf,
    pub modes: Vec<&'static str>,
    pub suites: Vec<HarnessReport>,
    pub log_entries: usize,
    pub failed_entries: usize,
    pub worst_relative_error_f64: f64,
    pub worst_relative_error_f32: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct AdjointFixtureFile {
    cases: Vec<AdjointCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdjointCase {
    name: String,
    dtype: String,
    shape: Vec<usize>,
    left: usize,
    right: usize,
    top: usize,
    bottom: usize,
    mode: String,
    tolerance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ForwardFixtureFile {
    cases: Vec<ForwardCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ForwardCase {
    name: String,
    shape: Vec<usize>,
    left: usize,
    right: usize,
    top: usize,
    bottom: usize,
    mode: String,
    input: Vec<f64>,
    expected_output: Vec<f64>,
    grad: Vec<f64>,
    expected_adjoint: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigFixtureFile {
    cases: Vec<ConfigCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigCase {
    name: String,
    config: Value,
    expected_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SmokeCase {
    name: String,
    shape: Vec<usize>,
    left: usize,
    right: usize,
    top: usize,
    bottom: usize,
    mode: String,
}

const ADJOINT_FIXTURE: &str = "pad2d_adjoint_cases.json";
const FORWARD_FIXTURE: &str = "pad2d_forward_cases.json";
const CONFIG_FIXTURE: &str = "pad2d_config_cases.json";
const SMOKE_FIXTURE: &str = "smoke_case.json";
const MAX_FIXTURE_BYTES: u64 = 1_048_576;

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();
    let mode = ExecutionMode::default();

    let (smoke_total, smoke_passed) = load_fixture::<SmokeCase>(
        &config.fixture_root.join(SMOKE_FIXTURE),
    )
    .and_then(|case| run_smoke_case(&case, mode))
    .map_or((1, 0), |passed| (1, usize::from(passed)));
    let (adjoint_total, adjoint_passed) = run_adjoint_conformance(config, mode)
        .map_or((0, 0), |(report, _)| (report.cases_total, report.cases_passed));
    let (forward_total, forward_passed) = run_forward_conformance(config, mode)
        .map_or((0, 0), |(report, _)| (report.cases_total, report.cases_passed));
    let (config_total, config_passed) = run_config_conformance(config, mode)
        .map_or((0, 0), |(report, _)| (report.cases_total, report.cases_passed));

    HarnessReport {
        suite: "smoke",
        fixture_count,
        mode: mode_label(mode),
        cases_total: smoke_total + adjoint_total + forward_total + config_total,
        cases_passed: smoke_passed + adjoint_passed + forward_passed + config_passed,
    }
}

fn run_smoke_case(case: &SmokeCase, mode: ExecutionMode) -> Result<bool, String> {
    let mut session = OperatorSession::new(mode);
    let op = session
        .pad2d::<f64>(&Pad2dConfig {
            left: case.left,
            right: case.right,
            top: case.top,
            bottom: case.bottom,
            mode: case.mode.clone(),
        })
        .map_err(|error| format!("smoke case '{}' failed to build: {error}", case.name))?;
    let x = seeded_tensor::<f64>(&case.shape, det_seed(&[case.name.as_str()]))?;
    let fx = session
        .forward(&op, &[&x])
        .map_err(|error| format!("smoke case '{}' forward failed: {error}", case.name))?;
    let report = session
        .dot_test(&op, &x, &fx[0])
        .map_err(|error| format!("smoke case '{}' dot test failed: {error}", case.name))?;
    Ok(report.passes(HarnessConfig::default_paths().tolerance_f64))
}

/// Dot-product adjoint test over every fixture case, plus a serial/parallel
/// bit comparison and the forward/adjoint shape law.
pub fn run_adjoint_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<AdjointCaseReport>), String> {
    let fixture: AdjointFixtureFile = load_fixture(&config.fixture_root.join(ADJOINT_FIXTURE))?;
    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        let report = match case.dtype.as_str() {
            "f64" => run_adjoint_case::<f64>(config, case, mode)?,
            "f32" => run_adjoint_case::<f32>(config, case, mode)?,
            other => {
                return Err(format!(
                    "adjoint case '{}' has unsupported dtype '{other}'",
                    case.name
                ));
            }
        };
        case_reports.push(report);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(AdjointCaseReport::passed));
    let report = HarnessReport {
        suite: "pad2d_adjoint",
        fixture_count: 1,
        mode: mode_label(mode),
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

/// Hand-computed forward outputs and adjoint gathers.
pub fn run_forward_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<ForwardCaseReport>), String> {
    let fixture: ForwardFixtureFile = load_fixture(&config.fixture_root.join(FORWARD_FIXTURE))?;
    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_forward_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(ForwardCaseReport::passed));
    let report = HarnessReport {
        suite: "pad2d_forward",
        fixture_count: 1,
        mode: mode_label(mode),
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

/// Construction from JSON: accepted configurations must round-trip, rejected
/// ones must fail with the expected error kind.
pub fn run_config_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<ConfigCaseReport>), String> {
    let fixture: ConfigFixtureFile = load_fixture(&config.fixture_root.join(CONFIG_FIXTURE))?;
    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_config_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(ConfigCaseReport::passed));
    let report = HarnessReport {
        suite: "pad2d_config",
        fixture_count: 1,
        mode: mode_label(mode),
        cases_total,
        cases_passed,
    };
    Ok((report, case_reports))
}

/// Runs every suite under each mode and writes one JSONL line per case.
pub fn emit_adjoint_report(
    config: &HarnessConfig,
    output_path: &Path,
    modes: &[ExecutionMode],
) -> Result<AdjointReport, String> {
    let selected_modes = if modes.is_empty() {
        ExecutionMode::all().to_vec()
    } else {
        modes.to_vec()
    };

    let mut suites = Vec::new();
    let mut logs = Vec::new();
    let mut worst_f64 = 0.0_f64;
    let mut worst_f32 = 0.0_f64;
    for mode in &selected_modes {
        let (report, cases) = run_adjoint_conformance(config, *mode)?;
        suites.push(report);
        for case in cases {
            match case.dtype {
                DType::F64 => worst_f64 = worst_f64.max(case.relative_error),
                DType::F32 => worst_f32 = worst_f32.max(case.relative_error),
            }
            logs.push(case.forensic_log);
        }

        let (report, cases) = run_forward_conformance(config, *mode)?;
        suites.push(report);
        logs.extend(cases.into_iter().map(|case| case.forensic_log));

        let (report, cases) = run_config_conformance(config, *mode)?;
        suites.push(report);
        logs.extend(cases.into_iter().map(|case| case.forensic_log));
    }

    let mut lines = String::new();
    for entry in &logs {
        let line = serde_json::to_string(entry)
            .map_err(|error| format!("failed to serialize structured log entry: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            format!(
                "failed to create report output dir {}: {error}",
                parent.display()
            )
        })?;
    }
    fs::write(output_path, lines).map_err(|error| {
        format!(
            "failed to write adjoint report log {}: {error}",
            output_path.display()
        )
    })?;

    Ok(AdjointReport {
        schema_version: LOG_SCHEMA_VERSION,
        output_path: output_path.to_path_buf(),
        modes: selected_modes.iter().map(|mode| mode_label(*mode)).collect(),
        suites,
        log_entries: logs.len(),
        failed_entries: logs.iter().filter(|entry| !entry.passed()).count(),
        worst_relative_error_f64: worst_f64,
        worst_relative_error_f32: worst_f32,
    })
}

/// Latency of one forward plus one adjoint on a batched `4 x 64 x 64`
/// reflect-padded image.
#[must_use]
pub fn run_pad2d_microbench(iterations: usize, mode: ExecutionMode) -> BenchReport {
    let mut samples = Vec::with_capacity(iterations.max(1));
    let op = Pad2dOperator::<f32>::with_mode(8, 8, 8, 8, PaddingMode::Reflect)
        .with_execution_mode(mode);
    let x = seeded_tensor::<f32>(&[4, 64, 64], det_seed(&["microbench", "x"]))
        .unwrap_or_else(|_| DenseTensor::zeros(vec![4, 64, 64], Device::Cpu));
    let mut fx = DenseTensor::<f32>::zeros(vec![4, 80, 80], Device::Cpu);
    let mut back = DenseTensor::<f32>::zeros(vec![4, 64, 64], Device::Cpu);

    for _ in 0..iterations.max(1) {
        let started = Instant::now();
        let forward = op.forward(&mut [&mut fx], &[&x]);
        let adjoint = op.adjoint(&mut [&mut back], &[&fx]);
        samples.push(started.elapsed().as_nanos());
        if forward.is_err() || adjoint.is_err() {
            break;
        }
    }

    samples.sort_unstable();
    let sum = samples.iter().copied().sum::<u128>();
    let mean = sum / (samples.len() as u128);

    BenchReport {
        iterations: samples.len(),
        p50_ns: percentile(&samples, 50),
        p95_ns: percentile(&samples, 95),
        p99_ns: percentile(&samples, 99),
        mean_ns: mean,
    }
}

fn run_adjoint_case<T: Element>(
    config: &HarnessConfig,
    case: &AdjointCase,
    mode: ExecutionMode,
) -> Result<AdjointCaseReport, String> {
    let pad_config = Pad2dConfig {
        left: case.left,
        right: case.right,
        top: case.top,
        bottom: case.bottom,
        mode: case.mode.clone(),
    };
    let mut session = OperatorSession::new(mode);
    let op = session
        .pad2d::<T>(&pad_config)
        .map_err(|error| format!("adjoint case '{}' failed to build: {error}", case.name))?;

    let seed = det_seed(&[case.name.as_str(), case.dtype.as_str()]);
    let x = seeded_tensor::<T>(&case.shape, seed)?;
    let padded = op
        .padded_shape(&case.shape)
        .map_err(|error| format!("adjoint case '{}' shape: {error}", case.name))?;
    let y = seeded_tensor::<T>(&padded, seed.rotate_left(29))?;

    let fx = session
        .forward(&op, &[&x])
        .map_err(|error| format!("adjoint case '{}' forward failed: {error}", case.name))?;
    let aty = session
        .adjoint(&op, &[&y])
        .map_err(|error| format!("adjoint case '{}' adjoint failed: {error}", case.name))?;
    let shape_ok = fx[0].shape() == padded.as_slice() && aty[0].shape() == case.shape.as_slice();

    let report = session
        .dot_test(&op, &x, &y)
        .map_err(|error| format!("adjoint case '{}' dot test failed: {error}", case.name))?;
    let tolerance = case
        .tolerance
        .unwrap_or_else(|| config.tolerance_for(T::DTYPE));
    let identity_ok = report.passes(tolerance);

    let determinism_ok = serial_parallel_agree(&op, &x, &y)
        .map_err(|error| format!("adjoint case '{}' determinism: {error}", case.name))?;

    let passed = shape_ok && identity_ok && determinism_ok;
    let reason_code = if passed {
        "adjoint_identity_ok"
    } else if !shape_ok {
        "shape_law_violation"
    } else if !identity_ok {
        "adjoint_identity_violation"
    } else {
        "nondeterministic_execution"
    };

    let mut extra_fields = geometry_fields(
        &case.shape,
        case.left,
        case.right,
        case.top,
        case.bottom,
        &case.mode,
    );
    extra_fields.insert("dtype".to_string(), json!(case.dtype));
    extra_fields.insert("padded_shape".to_string(), json!(padded));
    extra_fields.insert("forward_dot".to_string(), json!(report.forward_dot));
    extra_fields.insert("adjoint_dot".to_string(), json!(report.adjoint_dot));
    extra_fields.insert("abs_error".to_string(), json!(report.abs_error));
    extra_fields.insert("relative_error".to_string(), json!(report.relative_error));
    extra_fields.insert("tolerance".to_string(), json!(tolerance));
    extra_fields.insert("determinism_ok".to_string(), json!(determinism_ok));
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(session.evidence()),
    );

    Ok(AdjointCaseReport {
        name: case.name.clone(),
        mode,
        dtype: T::DTYPE,
        shape_ok,
        identity_ok,
        determinism_ok,
        relative_error: report.relative_error,
        forensic_log: StructuredCaseLog::new(
            "pad2d_adjoint",
            ADJOINT_FIXTURE,
            case.name.as_str(),
            mode,
            vec![format!("crates/ob-conformance/fixtures/{ADJOINT_FIXTURE}")],
            replay_command(mode),
            outcome(passed),
            reason_code,
        )
        .with_extra_fields(extra_fields),
    })
}

fn run_forward_case(case: &ForwardCase, mode: ExecutionMode) -> Result<ForwardCaseReport, String> {
    let mut session = OperatorSession::new(mode);
    let op = session
        .pad2d::<f64>(&Pad2dConfig {
            left: case.left,
            right: case.right,
            top: case.top,
            bottom: case.bottom,
            mode: case.mode.clone(),
        })
        .map_err(|error| format!("forward case '{}' failed to build: {error}", case.name))?;

    let x = DenseTensor::from_vec(case.shape.clone(), case.input.clone(), Device::Cpu)
        .map_err(|error| format!("forward case '{}' input: {error}", case.name))?;
    let padded = op
        .padded_shape(&case.shape)
        .map_err(|error| format!("forward case '{}' shape: {error}", case.name))?;
    let grad = DenseTensor::from_vec(padded, case.grad.clone(), Device::Cpu)
        .map_err(|error| format!("forward case '{}' grad: {error}", case.name))?;

    let fx = session
        .forward(&op, &[&x])
        .map_err(|error| format!("forward case '{}' forward failed: {error}", case.name))?;
    let back = session
        .adjoint(&op, &[&grad])
        .map_err(|error| format!("forward case '{}' adjoint failed: {error}", case.name))?;

    let output_ok = fx[0].storage() == case.expected_output.as_slice();
    let adjoint_ok = back[0].storage() == case.expected_adjoint.as_slice();
    let passed = output_ok && adjoint_ok;
    let reason_code = match (output_ok, adjoint_ok) {
        (true, true) => "parity_ok",
        (false, _) => "forward_mismatch",
        (true, false) => "adjoint_mismatch",
    };

    let mut extra_fields = geometry_fields(
        &case.shape,
        case.left,
        case.right,
        case.top,
        case.bottom,
        &case.mode,
    );
    extra_fields.insert("expected_output".to_string(), json!(case.expected_output));
    extra_fields.insert("actual_output".to_string(), json!(fx[0].storage()));
    extra_fields.insert("expected_adjoint".to_string(), json!(case.expected_adjoint));
    extra_fields.insert("actual_adjoint".to_string(), json!(back[0].storage()));

    Ok(ForwardCaseReport {
        name: case.name.clone(),
        mode,
        output_ok,
        adjoint_ok,
        forensic_log: StructuredCaseLog::new(
            "pad2d_forward",
            FORWARD_FIXTURE,
            case.name.as_str(),
            mode,
            vec![format!("crates/ob-conformance/fixtures/{FORWARD_FIXTURE}")],
            replay_command(mode),
            outcome(passed),
            reason_code,
        )
        .with_extra_fields(extra_fields),
    })
}

fn run_config_case(case: &ConfigCase, mode: ExecutionMode) -> Result<ConfigCaseReport, String> {
    let raw = serde_json::to_string(&case.config)
        .map_err(|error| format!("config case '{}' is not serializable: {error}", case.name))?;
    let built = Pad2dOperator::<f64>::from_json(&raw);

    let (expectation_ok, round_trip_ok, observed) = match (&built, case.expected_error.as_deref()) {
        (Ok(op), None) => {
            let rebuilt = Pad2dOperator::<f64>::from_config(&op.config())
                .map_err(|error| format!("config case '{}' round trip: {error}", case.name))?;
            (true, rebuilt.config() == op.config(), "accepted".to_string())
        }
        (Ok(_), Some(_)) => (false, true, "accepted".to_string()),
        (Err(error), expected) => {
            let kind = error_kind_label(error.kind());
            (expected == Some(kind), true, error.to_string())
        }
    };
    let passed = expectation_ok && round_trip_ok;

    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("config".to_string(), case.config.clone());
    extra_fields.insert("expected_error".to_string(), json!(case.expected_error));
    extra_fields.insert("observed".to_string(), json!(observed));

    Ok(ConfigCaseReport {
        name: case.name.clone(),
        mode,
        expectation_ok,
        round_trip_ok,
        forensic_log: StructuredCaseLog::new(
            "pad2d_config",
            CONFIG_FIXTURE,
            case.name.as_str(),
            mode,
            vec![format!("crates/ob-conformance/fixtures/{CONFIG_FIXTURE}")],
            replay_command(mode),
            outcome(passed),
            if passed {
                "config_contract_ok"
            } else {
                "config_contract_violation"
            },
        )
        .with_extra_fields(extra_fields),
    })
}

/// Re-runs both calls under each execution mode and compares output bits.
fn serial_parallel_agree<T: Element>(
    op: &Pad2dOperator<T>,
    x: &DenseTensor<T>,
    y: &DenseTensor<T>,
) -> Result<bool, String> {
    let mut forward_bits = Vec::new();
    let mut adjoint_bits = Vec::new();
    for mode in ExecutionMode::all() {
        let geometry = op.geometry();
        let op = Pad2dOperator::<T>::with_mode(
            geometry.left,
            geometry.right,
            geometry.top,
            geometry.bottom,
            op.mode(),
        )
        .with_execution_mode(*mode);
        let fx = ob_operator::apply(&op, OperatorCall::Forward, &[x])
            .map_err(|error| error.to_string())?;
        let aty = ob_operator::apply(&op, OperatorCall::Adjoint, &[y])
            .map_err(|error| error.to_string())?;
        forward_bits.push(bit_pattern(&fx[0]));
        adjoint_bits.push(bit_pattern(&aty[0]));
    }
    Ok(forward_bits.windows(2).all(|pair| pair[0] == pair[1])
        && adjoint_bits.windows(2).all(|pair| pair[0] == pair[1]))
}

fn bit_pattern<T: Element>(tensor: &DenseTensor<T>) -> Vec<u64> {
    tensor
        .storage()
        .iter()
        .map(|value| value.widen().to_bits())
        .collect()
}

/// Deterministic values in `[-1, 1)` from a splitmix64 stream.
fn seeded_tensor<T: Element>(shape: &[usize], seed: u64) -> Result<DenseTensor<T>, String> {
    let len = shape.iter().product::<usize>();
    let mut state = seed;
    let values = (0..len)
        .map(|_| {
            state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^= z >> 31;
            let unit = (z >> 11) as f64 / (1u64 << 53) as f64;
            T::narrow(unit * 2.0 - 1.0)
        })
        .collect();
    DenseTensor::from_vec(shape.to_vec(), values, Device::Cpu)
        .map_err(|error| format!("failed to build seeded tensor {shape:?}: {error}"))
}

fn geometry_fields(
    shape: &[usize],
    left: usize,
    right: usize,
    top: usize,
    bottom: usize,
    mode: &str,
) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert("operator".to_string(), json!("pad2d"));
    fields.insert("input_shape".to_string(), json!(shape));
    fields.insert(
        "margins".to_string(),
        json!({ "left": left, "right": right, "top": top, "bottom": bottom }),
    );
    fields.insert("padding_mode".to_string(), json!(mode));
    fields
}

fn runtime_evidence_field<'a>(entries: impl IntoIterator<Item = &'a EvidenceEntry>) -> Value {
    let mut total_entries = 0usize;
    let mut kind_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut failures = Vec::new();
    for entry in entries {
        total_entries += 1;
        *kind_counts.entry(entry.kind.label()).or_insert(0) += 1;
        if entry.kind == EvidenceKind::Failure {
            failures.push(entry.summary.as_str());
        }
    }

    json!({
        "total_entries": total_entries,
        "kind_counts": kind_counts,
        "failures": failures,
    })
}

fn error_kind_label(kind: OperatorErrorKind) -> &'static str {
    match kind {
        OperatorErrorKind::Configuration => "configuration",
        OperatorErrorKind::Arity => "arity",
        OperatorErrorKind::Shape => "shape",
        OperatorErrorKind::Execution => "execution",
    }
}

fn replay_command(mode: ExecutionMode) -> String {
    format!(
        "cargo run -p ob-conformance --bin run_adjoint_report -- --mode {}",
        mode_label(mode)
    )
}

fn outcome(passed: bool) -> &'static str {
    if passed { "pass" } else { "fail" }
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}

fn percentile(samples: &[u128], p: usize) -> u128 {
    if samples.is_empty() {
        return 0;
    }
    let clamped = p.min(100);
    let idx = ((samples.len() - 1) * clamped) / 100;
    samples[idx]
}

#[cfg(test)]
mod tests {
    use ob_core::{DType, ExecutionMode};
    use proptest::prelude::*;

    use super::{
        HarnessConfig, percentile, run_adjoint_conformance, run_config_conformance,
        run_forward_conformance, seeded_tensor, summarize_passes,
    };

    #[test]
    fn adjoint_fixture_is_green_in_both_modes() {
        let cfg = HarnessConfig::default_paths();
        for mode in ExecutionMode::all() {
            let (report, cases) =
                run_adjoint_conformance(&cfg, *mode).expect("adjoint conformance should run");
            assert_eq!(report.cases_total, cases.len());
            let failed = cases
                .iter()
                .filter(|case| !case.passed())
                .map(|case| (case.name.as_str(), case.relative_error))
                .collect::<Vec<_>>();
            assert!(failed.is_empty(), "failed cases: {failed:?}");
        }
    }

    #[test]
    fn adjoint_fixture_covers_both_dtypes_and_all_modes() {
        let cfg = HarnessConfig::default_paths();
        let (_, cases) = run_adjoint_conformance(&cfg, ExecutionMode::Serial)
            .expect("adjoint conformance should run");
        assert!(cases.iter().any(|case| case.dtype == DType::F32));
        assert!(cases.iter().any(|case| case.dtype == DType::F64));
        for mode in ["symmetric", "reflect", "replicate"] {
            assert!(
                cases.iter().any(|case| case.name.starts_with(mode)),
                "missing mode {mode}"
            );
        }
    }

    #[test]
    fn forward_table_matches_hand_computed_values() {
        let cfg = HarnessConfig::default_paths();
        let (report, cases) = run_forward_conformance(&cfg, ExecutionMode::Parallel)
            .expect("forward conformance should run");
        assert!(report.is_green(), "cases: {cases:?}");
    }

    #[test]
    fn config_fixture_is_green() {
        let cfg = HarnessConfig::default_paths();
        let (report, cases) = run_config_conformance(&cfg, ExecutionMode::Serial)
            .expect("config conformance should run");
        assert!(report.is_green(), "cases: {cases:?}");
        assert!(cases.iter().any(|case| case.name == "bogus_mode"));
    }

    #[test]
    fn structured_logs_include_replay_contract_fields() {
        let cfg = HarnessConfig::default_paths();
        let (_, cases) = run_adjoint_conformance(&cfg, ExecutionMode::Serial)
            .expect("adjoint conformance should run");

        let log = &cases[0].forensic_log;
        assert_eq!(log.schema_version, "ob-conformance-log-v1");
        assert!(!log.scenario_id.is_empty());
        assert!(log.seed > 0);
        assert_eq!(log.mode, "serial");
        assert!(log.env_fingerprint.starts_with("det64:"));
        assert!(log.replay_command.contains("--mode serial"));
        assert!(!log.artifact_refs.is_empty());

        let value = serde_json::to_value(log).expect("log should serialize");
        for key in ["relative_error", "forward_dot", "adjoint_dot", "runtime_evidence"] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
    }

    #[test]
    fn missing_fixture_root_is_an_error() {
        let cfg = HarnessConfig {
            fixture_root: "/nonexistent/opbox-fixtures".into(),
            ..HarnessConfig::default_paths()
        };
        let err = run_adjoint_conformance(&cfg, ExecutionMode::Serial)
            .expect_err("missing fixture must fail");
        assert!(err.contains("failed reading fixture metadata"));
    }

    #[test]
    fn summarize_and_percentile_helpers() {
        assert_eq!(
            summarize_passes([true, false, true].into_iter()),
            (3, 2)
        );
        assert_eq!(percentile(&[], 50), 0);
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 50), 3);
        assert_eq!(percentile(&[1, 2, 3, 4, 5], 100), 5);
    }

    proptest! {
        #[test]
        fn seeded_tensors_are_reproducible_and_bounded(
            rows in 1usize..6,
            cols in 1usize..6,
            seed in any::<u64>(),
        ) {
            let a = seeded_tensor::<f64>(&[rows, cols], seed).expect("tensor a");
            let b = seeded_tensor::<f64>(&[rows, cols], seed).expect("tensor b");
            prop_assert_eq!(&a, &b);
            prop_assert!(a.storage().iter().all(|v| (-1.0..1.0).contains(v)));
        }
    }
}
