use std::collections::BTreeMap;

use ob_core::ExecutionMode;
use serde::Serialize;
use serde_json::Value;

pub const LOG_SCHEMA_VERSION: &str = "ob-conformance-log-v1";

/// One JSONL record per executed conformance case.
///
/// `extra_fields` is flattened into the top-level object and must not reuse
/// any envelope key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub ts_unix_ms: u128,
    pub suite_id: &'static str,
    pub scenario_id: String,
    pub fixture_id: &'static str,
    pub mode: &'static str,
    pub seed: u64,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: &'static str,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

const ENVELOPE_KEYS: [&str; 12] = [
    "schema_version",
    "ts_unix_ms",
    "suite_id",
    "scenario_id",
    "fixture_id",
    "mode",
    "seed",
    "env_fingerprint",
    "artifact_refs",
    "replay_command",
    "outcome",
    "reason_code",
];

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &'static str,
        fixture_id: &'static str,
        case_name: &str,
        mode: ExecutionMode,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &'static str,
        reason_code: impl Into<String>,
    ) -> Self {
        let scenario_id = scenario_id(suite_id, mode, case_name);
        Self {
            schema_version: LOG_SCHEMA_VERSION,
            ts_unix_ms: now_unix_ms(),
            suite_id,
            seed: det_seed(&[suite_id, fixture_id, scenario_id.as_str()]),
            scenario_id,
            fixture_id,
            mode: mode_label(mode),
            env_fingerprint: env_fingerprint(),
            artifact_refs,
            replay_command,
            outcome,
            reason_code: reason_code.into(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        for (key, value) in fields {
            if !ENVELOPE_KEYS.contains(&key.as_str()) {
                self.extra_fields.insert(key, value);
            }
        }
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }
}

#[must_use]
pub fn mode_label(mode: ExecutionMode) -> &'static str {
    mode.label()
}

#[must_use]
pub fn scenario_id(suite_id: &str, mode: ExecutionMode, case_name: &str) -> String {
    format!("{suite_id}/{}:{case_name}", mode_label(mode))
}

/// FNV-1a over the parts, never zero so it can seed xorshift-style generators.
#[must_use]
pub fn det_seed(parts: &[&str]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for part in parts {
        for byte in part.bytes().chain(std::iter::once(0xff)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash.max(1)
}

fn env_fingerprint() -> String {
    let digest = det_seed(&[
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    ]);
    format!("det64:{digest:016x}")
}

fn now_unix_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
