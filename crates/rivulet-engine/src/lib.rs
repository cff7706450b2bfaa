//! Rivulet Engine
//!
//! Executes a compiled project against a target store: graph-ordered
//! materialization with a bounded worker pool, data-quality assertions, and
//! source freshness checks. The [`Pipeline`] facade ties the stages together
//! and produces the run report.

pub mod freshness;
pub mod materializer;
pub mod pipeline;
pub mod quality;

pub use freshness::FreshnessMonitor;
pub use materializer::Materializer;
pub use pipeline::{Pipeline, PipelineOptions, RunError};
pub use quality::QualityEngine;
