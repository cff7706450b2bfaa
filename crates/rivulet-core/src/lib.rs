//! Rivulet Core
//!
//! Core domain model with stable, versioned types: project declarations,
//! environment configuration, and the run report schema.

pub mod config;
pub mod project;
pub mod report;
pub mod severity;

pub use config::{Config, ConfigError, ProjectSettings, StoreConfig, TargetConfig};
pub use project::{
    AssertionDecl, AssertionKind, FreshnessSpec, Layer, LoadError, Materialization, Model,
    Project, SourceDecl,
};
pub use report::{
    statement_fingerprint, AssertionResult, FreshnessResult, FreshnessState, ModelResult,
    ModelStatus, ReportVersion, RunReport, RunStatus, RunSummary,
};
pub use severity::Severity;
