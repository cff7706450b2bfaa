//! Assertion severity levels

use serde::{Deserialize, Serialize};

/// Severity of a quality assertion failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Warning - reported but does not fail the run
    Warn,

    /// Error - fails the run
    Error,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Error
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}
