//! Run report schema (stable v1)
//!
//! A run always produces a complete report: every model's status and every
//! assertion's result are enumerated, even when nodes were skipped. Partial
//! success is visible, never silently swallowed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::severity::Severity;

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    pub major: u32,
    pub minor: u32,
}

impl ReportVersion {
    /// Current report schema version
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Per-model build status within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Not built because an ancestor failed
    Skipped,
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Freshness state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FreshnessState {
    Fresh,
    StaleWarn,
    StaleError,
}

impl std::fmt::Display for FreshnessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::StaleWarn => write!(f, "stale-warn"),
            Self::StaleError => write!(f, "stale-error"),
        }
    }
}

/// Result of building one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    /// Node id, e.g. `model.stg_orders`
    pub model: String,

    pub status: ModelStatus,

    /// Materialization strategy used
    pub materialized: String,

    pub duration_secs: f64,

    /// Fingerprint of the executed statement, when one was compiled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of evaluating one assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    /// Node id of the asserted model
    pub model: String,

    /// Assertion kind label (`unique`, `not_null`, ...)
    pub kind: String,

    /// Checked condition, human-readable
    pub condition: String,

    pub severity: Severity,

    pub passed: bool,

    /// Number of violating rows
    pub violations: u64,

    /// Identity of a few violating values, when available
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample: Vec<serde_json::Value>,

    /// Why the assertion could not be evaluated, if it errored out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AssertionResult {
    /// An error-severity failure fails the run; warn-severity does not
    pub fn fails_run(&self) -> bool {
        !self.passed && self.severity == Severity::Error
    }
}

/// Result of checking one source's freshness contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessResult {
    /// Node id of the source, e.g. `source.raw.orders`
    pub source: String,

    pub state: FreshnessState,

    /// Age of the newest record in minutes, when one was found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_minutes: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Summary statistics for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub models_total: usize,
    pub models_succeeded: usize,
    pub models_failed: usize,
    pub models_skipped: usize,
    pub assertions_total: usize,
    pub assertions_failed: usize,
    pub assertion_warnings: usize,
    pub sources_checked: usize,
    pub sources_stale: usize,
}

/// Run report (run_report.json v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub version: ReportVersion,

    /// Start timestamp (ISO 8601)
    pub started_at: String,

    pub status: RunStatus,

    pub summary: RunSummary,

    pub models: Vec<ModelResult>,

    pub assertions: Vec<AssertionResult>,

    pub freshness: Vec<FreshnessResult>,
}

impl RunReport {
    /// Assemble a report, computing summary and overall status
    pub fn from_parts(
        started_at: chrono::DateTime<chrono::Utc>,
        models: Vec<ModelResult>,
        assertions: Vec<AssertionResult>,
        freshness: Vec<FreshnessResult>,
    ) -> Self {
        let summary = RunSummary {
            models_total: models.len(),
            models_succeeded: models
                .iter()
                .filter(|m| m.status == ModelStatus::Succeeded)
                .count(),
            models_failed: models
                .iter()
                .filter(|m| m.status == ModelStatus::Failed)
                .count(),
            models_skipped: models
                .iter()
                .filter(|m| m.status == ModelStatus::Skipped)
                .count(),
            assertions_total: assertions.len(),
            assertions_failed: assertions
                .iter()
                .filter(|a| !a.passed && a.severity == Severity::Error)
                .count(),
            assertion_warnings: assertions
                .iter()
                .filter(|a| !a.passed && a.severity == Severity::Warn)
                .count(),
            sources_checked: freshness.len(),
            sources_stale: freshness
                .iter()
                .filter(|f| f.state != FreshnessState::Fresh)
                .count(),
        };

        let status = if summary.models_failed > 0 || summary.assertions_failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        Self {
            version: ReportVersion::CURRENT,
            started_at: started_at.to_rfc3339(),
            status,
            summary,
            models,
            assertions,
            freshness,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.status == RunStatus::Failed
    }

    /// Process exit code for the orchestrator: 0 success, 1 on any failure
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}

/// Fingerprint of a compiled statement, for idempotence visibility
pub fn statement_fingerprint(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}
