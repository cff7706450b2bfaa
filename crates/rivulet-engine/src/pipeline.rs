//! Pipeline facade: load, compile, materialize, assert, check freshness
//!
//! Holds the per-run wiring (resolution context, store handle, worker bound)
//! and exposes the entry points `run`, `test`, and `compile`. Both `run` and
//! `test` are idempotently re-invocable; the target store's catalog is the
//! only durable state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rivulet_compile::{CompileError, CompiledModel, Compiler, ResolutionContext};
use rivulet_core::{ConfigError, ModelStatus, Project, RunReport};
use rivulet_graph::{GraphError, ModelGraph};
use rivulet_store::{StoreAdapter, StoreError};
use tracing::info;

use crate::materializer::{CompileOutcomes, Materializer};
use crate::quality::{self, QualityEngine};
use crate::FreshnessMonitor;

/// Errors that abort a run before (or instead of) producing a report
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-invocation knobs, from CLI flags
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Target override; defaults to the project's active target
    pub target: Option<String>,

    /// Worker pool bound; defaults to the project's `threads` setting
    pub threads: Option<usize>,

    /// Force incremental models through the full-rebuild path
    pub full_refresh: bool,
}

pub struct Pipeline {
    project: Project,
    context: ResolutionContext,
    store: Arc<dyn StoreAdapter>,
    threads: usize,
    full_refresh: bool,
}

impl Pipeline {
    pub fn new(
        project: Project,
        store: Arc<dyn StoreAdapter>,
        options: PipelineOptions,
    ) -> Result<Self, RunError> {
        let target_name = options
            .target
            .clone()
            .unwrap_or_else(|| project.config.project.target.clone());
        let context = ResolutionContext::build(&project, &target_name)?;
        let threads = options.threads.unwrap_or(project.config.project.threads);

        Ok(Self {
            project,
            context,
            store,
            threads,
            full_refresh: options.full_refresh,
        })
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Build every model, then evaluate assertions and source freshness
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let started_at = Utc::now();
        self.store.test_connection().await?;

        let graph = ModelGraph::build(&self.project)?;
        info!(
            models = graph.models_in_order().len(),
            threads = self.threads,
            store = self.store.name(),
            "starting run"
        );

        // Compile everything up front; execution never starts for a model
        // that failed to compile, and its downstream closure is skipped.
        let compiled = self.compile_outcomes();

        let materializer =
            Materializer::new(Arc::clone(&self.store), self.threads, self.full_refresh);
        let models = materializer.run(&self.project, &graph, &compiled).await;

        let statuses: BTreeMap<String, ModelStatus> =
            models.iter().map(|m| (m.model.clone(), m.status)).collect();

        let quality = QualityEngine::new(Arc::clone(&self.store));
        let mut assertions = Vec::new();
        for node in graph.models_in_order() {
            let Some(model) = node.strip_prefix("model.").and_then(|n| self.project.model(n))
            else {
                continue;
            };
            if statuses.get(&node) == Some(&ModelStatus::Succeeded) {
                assertions.extend(quality.evaluate_model(model, &self.context).await);
            } else {
                assertions.extend(quality::unevaluated(
                    model,
                    "model was not materialized this run",
                ));
            }
        }

        let freshness = FreshnessMonitor::new(Arc::clone(&self.store))
            .check_sources(&self.project.sources, &self.context)
            .await;

        Ok(RunReport::from_parts(started_at, models, assertions, freshness))
    }

    /// Evaluate assertions and freshness against existing relations; no builds
    pub async fn test(&self) -> Result<RunReport, RunError> {
        let started_at = Utc::now();
        self.store.test_connection().await?;

        // Validates references and fixes the evaluation order
        let graph = ModelGraph::build(&self.project)?;

        let quality = QualityEngine::new(Arc::clone(&self.store));
        let mut assertions = Vec::new();
        for node in graph.models_in_order() {
            let Some(model) = node.strip_prefix("model.").and_then(|n| self.project.model(n))
            else {
                continue;
            };
            assertions.extend(quality.evaluate_model(model, &self.context).await);
        }

        let freshness = FreshnessMonitor::new(Arc::clone(&self.store))
            .check_sources(&self.project.sources, &self.context)
            .await;

        Ok(RunReport::from_parts(started_at, Vec::new(), assertions, freshness))
    }

    /// Compile every model without touching the store
    pub fn compile(&self) -> Result<Vec<CompiledModel>, RunError> {
        let graph = ModelGraph::build(&self.project)?;
        let compiler = Compiler::new(self.context.clone(), self.project.macro_prelude.clone());

        let mut compiled = Vec::new();
        for node in graph.models_in_order() {
            let Some(model) = node.strip_prefix("model.").and_then(|n| self.project.model(n))
            else {
                continue;
            };
            compiled.push(compiler.compile(model)?);
        }
        Ok(compiled)
    }

    fn compile_outcomes(&self) -> CompileOutcomes {
        let compiler = Compiler::new(self.context.clone(), self.project.macro_prelude.clone());
        self.project
            .models
            .iter()
            .map(|model| (model.node_id(), compiler.compile(model)))
            .collect()
    }
}
