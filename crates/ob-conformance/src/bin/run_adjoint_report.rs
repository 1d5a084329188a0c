#![forbid(unsafe_code)]

use std::path::PathBuf;

use ob_conformance::{HarnessConfig, emit_adjoint_report};
use ob_core::ExecutionMode;
use serde_json::json;

fn main() -> Result<(), String> {
    let mut mode = String::from("both");
    let mut output: Option<PathBuf> = None;
    let mut print_full_report = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--mode requires one of: serial|parallel|both".to_string())?;
                mode = value;
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--print-full-report" => {
                print_full_report = true;
            }
            other => {
                return Err(format!(
                    "unknown arg '{other}'. usage: run_adjoint_report [--mode serial|parallel|both] [--output path] [--print-full-report]"
                ));
            }
        }
    }

    let modes = parse_modes(mode.as_str())?;
    let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
    let output_path =
        output.unwrap_or_else(|| repo_root.join("artifacts/conformance/adjoint_report.jsonl"));

    let report = emit_adjoint_report(
        &HarnessConfig::default_paths(),
        output_path.as_path(),
        modes.as_slice(),
    )?;

    if print_full_report {
        println!(
            "{}",
            serde_json::to_string_pretty(&report)
                .map_err(|error| format!("failed to serialize report: {error}"))?
        );
        let raw = std::fs::read_to_string(report.output_path.as_path()).map_err(|error| {
            format!(
                "failed to read generated case log {}: {error}",
                report.output_path.display()
            )
        })?;
        print!("{raw}");
    } else {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": if report.failed_entries == 0 { "ok" } else { "failed" },
                "output_path": report.output_path.display().to_string(),
                "log_entries": report.log_entries,
                "failed_entries": report.failed_entries,
                "modes": report.modes,
                "worst_relative_error_f64": report.worst_relative_error_f64,
                "worst_relative_error_f32": report.worst_relative_error_f32,
            }))
            .map_err(|error| format!("failed to serialize summary: {error}"))?
        );
    }

    if report.failed_entries > 0 {
        return Err(format!(
            "{} of {} conformance cases failed",
            report.failed_entries, report.log_entries
        ));
    }
    Ok(())
}

fn parse_modes(raw: &str) -> Result<Vec<ExecutionMode>, String> {
    match raw {
        "serial" => Ok(vec![ExecutionMode::Serial]),
        "parallel" => Ok(vec![ExecutionMode::Parallel]),
        "both" => Ok(ExecutionMode::all().to_vec()),
        _ => Err(format!(
            "unsupported mode '{raw}'; expected serial|parallel|both"
        )),
    }
}
