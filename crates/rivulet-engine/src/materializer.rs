//! Graph-ordered materialization with a bounded worker pool
//!
//! Nodes are dispatched from a ready queue seeded by the zero-dependency
//! models; a model starts only after every parent has completed this run.
//! A compile or execution failure marks the model failed and its downstream
//! closure skipped while independent branches keep building. Cancellation is
//! observed between dispatches; in-flight builds run to completion.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rivulet_compile::{CompileError, CompiledModel};
use rivulet_core::{Materialization, Model, ModelResult, ModelStatus, Project};
use rivulet_graph::{ModelGraph, NodeId};
use rivulet_store::{StoreAdapter, StoreError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Per-model compile outcome, keyed by node id
pub type CompileOutcomes = BTreeMap<NodeId, Result<CompiledModel, CompileError>>;

pub struct Materializer {
    store: Arc<dyn StoreAdapter>,
    threads: usize,
    full_refresh: bool,
    cancelled: Arc<AtomicBool>,
}

impl Materializer {
    pub fn new(store: Arc<dyn StoreAdapter>, threads: usize, full_refresh: bool) -> Self {
        Self {
            store,
            threads: threads.max(1),
            full_refresh,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops further dispatch when set; in-flight builds finish
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Build every model reachable this run; returns results in graph order
    pub async fn run(
        &self,
        project: &Project,
        graph: &ModelGraph,
        compiled: &CompileOutcomes,
    ) -> Vec<ModelResult> {
        let order = graph.models_in_order();

        let mut remaining: BTreeMap<NodeId, usize> = BTreeMap::new();
        for node in &order {
            let model_parents = graph
                .parents(node)
                .into_iter()
                .filter(|p| p.starts_with("model."))
                .count();
            remaining.insert(node.clone(), model_parents);
        }

        let mut status: BTreeMap<NodeId, ModelStatus> =
            order.iter().map(|n| (n.clone(), ModelStatus::Pending)).collect();
        let mut durations: BTreeMap<NodeId, f64> = BTreeMap::new();
        let mut errors: BTreeMap<NodeId, String> = BTreeMap::new();

        let mut ready: VecDeque<NodeId> = order
            .iter()
            .filter(|n| remaining[*n] == 0)
            .cloned()
            .collect();
        let mut tasks: JoinSet<(NodeId, f64, Result<(), StoreError>)> = JoinSet::new();
        let mut inflight = 0usize;

        loop {
            while inflight < self.threads && !self.is_cancelled() {
                let Some(node) = ready.pop_front() else { break };
                if status[&node] != ModelStatus::Pending {
                    continue;
                }

                match compiled.get(&node) {
                    Some(Ok(model)) => {
                        status.insert(node.clone(), ModelStatus::Running);
                        info!(model = %node, materialized = %model.materialized, "building model");
                        let store = Arc::clone(&self.store);
                        let model = model.clone();
                        let full_refresh = self.full_refresh;
                        let id = node.clone();
                        tasks.spawn(async move {
                            let started = Instant::now();
                            let outcome = build_model(store, &model, full_refresh).await;
                            (id, started.elapsed().as_secs_f64(), outcome)
                        });
                        inflight += 1;
                    }
                    Some(Err(e)) => {
                        warn!(model = %node, error = %e, "model failed to compile");
                        status.insert(node.clone(), ModelStatus::Failed);
                        errors.insert(node.clone(), e.to_string());
                        skip_downstream(graph, &node, &mut status);
                        release_children(graph, &node, &mut remaining, &mut ready, &status);
                    }
                    None => {
                        status.insert(node.clone(), ModelStatus::Failed);
                        errors.insert(node.clone(), "model was never compiled".to_string());
                        skip_downstream(graph, &node, &mut status);
                        release_children(graph, &node, &mut remaining, &mut ready, &status);
                    }
                }
            }

            if inflight == 0 {
                if self.is_cancelled() || dispatchable(&ready, &status) == 0 {
                    break;
                }
                continue;
            }

            match tasks.join_next().await {
                Some(Ok((node, duration, outcome))) => {
                    inflight -= 1;
                    durations.insert(node.clone(), duration);
                    match outcome {
                        Ok(()) => {
                            debug!(model = %node, duration_secs = duration, "model built");
                            status.insert(node.clone(), ModelStatus::Succeeded);
                        }
                        Err(e) => {
                            warn!(model = %node, error = %e, "model build failed");
                            status.insert(node.clone(), ModelStatus::Failed);
                            errors.insert(node.clone(), e.to_string());
                            skip_downstream(graph, &node, &mut status);
                        }
                    }
                    release_children(graph, &node, &mut remaining, &mut ready, &status);
                }
                Some(Err(e)) => {
                    inflight -= 1;
                    warn!(error = %e, "build task aborted");
                }
                None => break,
            }
        }

        // Anything still pending was cut off by cancellation or an aborted
        // task; a running marker at this point means the task panicked.
        for (node, state) in status.iter_mut() {
            match state {
                ModelStatus::Pending => *state = ModelStatus::Skipped,
                ModelStatus::Running => {
                    *state = ModelStatus::Failed;
                    errors.insert(node.clone(), "build task aborted".to_string());
                }
                _ => {}
            }
        }

        order
            .iter()
            .map(|node| {
                let declared = declared_materialization(project, node);
                let fingerprint = match compiled.get(node) {
                    Some(Ok(model)) => Some(model.fingerprint.clone()),
                    _ => None,
                };
                ModelResult {
                    model: node.clone(),
                    status: status[node],
                    materialized: declared.to_string(),
                    duration_secs: durations.get(node).copied().unwrap_or(0.0),
                    fingerprint,
                    error: errors.get(node).cloned(),
                }
            })
            .collect()
    }
}

/// Number of queued nodes still eligible for dispatch
fn dispatchable(ready: &VecDeque<NodeId>, status: &BTreeMap<NodeId, ModelStatus>) -> usize {
    ready
        .iter()
        .filter(|n| status.get(*n) == Some(&ModelStatus::Pending))
        .count()
}

/// Mark every model downstream of `node` skipped, unless already resolved
fn skip_downstream(graph: &ModelGraph, node: &str, status: &mut BTreeMap<NodeId, ModelStatus>) {
    for descendant in graph.downstream(node) {
        if let Some(state) = status.get_mut(&descendant) {
            if *state == ModelStatus::Pending {
                debug!(model = %descendant, upstream = %node, "skipping downstream model");
                *state = ModelStatus::Skipped;
            }
        }
    }
}

/// Decrement child dependency counters after `node` resolved; queue the
/// children that became ready
fn release_children(
    graph: &ModelGraph,
    node: &str,
    remaining: &mut BTreeMap<NodeId, usize>,
    ready: &mut VecDeque<NodeId>,
    status: &BTreeMap<NodeId, ModelStatus>,
) {
    for child in graph.children(node) {
        if let Some(count) = remaining.get_mut(child) {
            *count = count.saturating_sub(1);
            if *count == 0 && status.get(child) == Some(&ModelStatus::Pending) {
                ready.push_back(child.clone());
            }
        }
    }
}

fn declared_materialization(project: &Project, node_id: &str) -> Materialization {
    node_id
        .strip_prefix("model.")
        .and_then(|name| project.model(name))
        .map(|m: &Model| m.materialized)
        .unwrap_or_default()
}

/// Run one model's strategy against the store
async fn build_model(
    store: Arc<dyn StoreAdapter>,
    model: &CompiledModel,
    full_refresh: bool,
) -> Result<(), StoreError> {
    match model.materialized {
        Materialization::View => store.create_view_as(&model.address, &model.build_sql).await,
        Materialization::Table => store.create_table_as(&model.address, &model.build_sql).await,
        Materialization::Incremental => {
            if model.unique_key.is_empty() {
                return Err(StoreError::Config(format!(
                    "incremental model '{}' declares no unique_key",
                    model.name
                )));
            }
            let exists = store.relation_exists(&model.address).await?;
            if full_refresh || !exists {
                store.create_table_as(&model.address, &model.build_sql).await
            } else {
                let sql = model.incremental_sql.as_deref().unwrap_or(&model.build_sql);
                store.merge_rows(&model.address, sql, &model.unique_key).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rivulet_compile::{Compiler, ResolutionContext};
    use rivulet_store::memory::rows_from_json;
    use rivulet_store::MemoryStore;
    use std::path::Path;

    const PROJECT: &str = r#"
        [project]
        name = "analytics"

        [targets.dev]
        database = "dev_db"
        schema = "main"

        [[sources]]
        source = "raw"
        table = "orders"
        schema = "landing"

        [[models]]
        name = "stg_orders"
        layer = "staging"
        sql = "select * from {{ source('raw', 'orders') }}"

        [[models]]
        name = "fct_orders"
        layer = "mart"
        materialized = "table"
        sql = "select * from {{ ref('stg_orders') }}"
    "#;

    fn compile_all(project: &Project) -> CompileOutcomes {
        let context = ResolutionContext::for_active_target(project).unwrap();
        let compiler = Compiler::new(context, project.macro_prelude.clone());
        project
            .models
            .iter()
            .map(|m| (m.node_id(), compiler.compile(m)))
            .collect()
    }

    #[tokio::test]
    async fn builds_models_in_dependency_order() {
        let project = Project::from_toml(PROJECT, Path::new(".")).unwrap();
        let graph = ModelGraph::build(&project).unwrap();
        let compiled = compile_all(&project);

        let store = Arc::new(MemoryStore::new());
        store
            .stage_result(
                "select * from dev_db.landing.orders",
                rows_from_json(serde_json::json!([{"order_id": 1}])),
            )
            .await;
        store
            .stage_result(
                "select * from dev_db.main.stg_orders",
                rows_from_json(serde_json::json!([{"order_id": 1}])),
            )
            .await;

        let materializer = Materializer::new(store.clone(), 4, false);
        let results = materializer.run(&project, &graph, &compiled).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == ModelStatus::Succeeded));
        assert_eq!(results[0].model, "model.stg_orders");
        assert_eq!(results[1].model, "model.fct_orders");
        assert_eq!(store.object_count().await, 2);
    }

    #[tokio::test]
    async fn failed_parent_skips_downstream() {
        let project = Project::from_toml(PROJECT, Path::new(".")).unwrap();
        let graph = ModelGraph::build(&project).unwrap();
        let compiled = compile_all(&project);

        let store = Arc::new(MemoryStore::new());
        store
            .fail_statement(
                "select * from dev_db.landing.orders",
                StoreError::Statement("relation missing".to_string()),
            )
            .await;

        let materializer = Materializer::new(store, 4, false);
        let results = materializer.run(&project, &graph, &compiled).await;

        assert_eq!(results[0].status, ModelStatus::Failed);
        assert!(results[0].error.as_deref().unwrap().contains("relation missing"));
        assert_eq!(results[1].status, ModelStatus::Skipped);
    }

    #[tokio::test]
    async fn cancellation_skips_undispatched_models() {
        let project = Project::from_toml(PROJECT, Path::new(".")).unwrap();
        let graph = ModelGraph::build(&project).unwrap();
        let compiled = compile_all(&project);

        let materializer = Materializer::new(Arc::new(MemoryStore::new()), 4, false);
        materializer.cancel_flag().store(true, Ordering::SeqCst);
        let results = materializer.run(&project, &graph, &compiled).await;

        assert!(results.iter().all(|r| r.status == ModelStatus::Skipped));
    }

    #[tokio::test]
    async fn incremental_without_unique_key_fails() {
        let toml = r#"
            [project]
            name = "analytics"

            [targets.dev]
            database = "dev_db"
            schema = "main"

            [[models]]
            name = "fct_bad"
            layer = "mart"
            materialized = "incremental"
            sql = "select 1 as id"
        "#;
        let project = Project::from_toml(toml, Path::new(".")).unwrap();
        let graph = ModelGraph::build(&project).unwrap();
        let compiled = compile_all(&project);

        let materializer = Materializer::new(Arc::new(MemoryStore::new()), 1, false);
        let results = materializer.run(&project, &graph, &compiled).await;

        assert_eq!(results[0].status, ModelStatus::Failed);
        assert!(results[0].error.as_deref().unwrap().contains("unique_key"));
    }
}
