//! Model graph: DAG construction, deterministic build order, traversal

use rivulet_core::Project;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};

use crate::refs::{extract_references, Reference};

/// Node identifier (`model.<name>` or `source.<source>.<table>`)
pub type NodeId = String;

/// Graph construction errors; both are load-time fatal
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("model '{model}' references undeclared relation {reference}")]
    UnknownReference { model: String, reference: String },

    #[error("dependency cycle: {}", format_cycle(.members))]
    Cycle { members: Vec<NodeId> },
}

fn format_cycle(members: &[NodeId]) -> String {
    let mut path = members.join(" -> ");
    if let Some(first) = members.first() {
        path.push_str(" -> ");
        path.push_str(first);
    }
    path
}

/// The directed acyclic dependency graph over models and sources
///
/// Edges point from a dependency to its dependent; they are derived from the
/// reference markers in each model body at build time. Construction fails on
/// an undeclared reference or a cycle, so a successfully built graph always
/// has a valid topological order.
#[derive(Debug, Clone)]
pub struct ModelGraph {
    /// node -> relations it depends on
    parents: BTreeMap<NodeId, BTreeSet<NodeId>>,

    /// node -> relations that depend on it
    children: BTreeMap<NodeId, BTreeSet<NodeId>>,

    nodes: BTreeSet<NodeId>,

    /// Cached topological order over all nodes, ties broken by id ascending
    order: Vec<NodeId>,
}

impl ModelGraph {
    /// Build the graph from a project's declarations
    pub fn build(project: &Project) -> Result<Self, GraphError> {
        let mut nodes = BTreeSet::new();
        let mut parents: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        let mut children: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();

        for source in &project.sources {
            nodes.insert(source.node_id());
        }
        for model in &project.models {
            nodes.insert(model.node_id());
        }

        for model in &project.models {
            let node_id = model.node_id();
            for reference in extract_references(&model.body) {
                let target = match &reference {
                    Reference::Model(name) => project.model(name).map(|m| m.node_id()),
                    Reference::Source { source, table } => {
                        project.source(source, table).map(|s| s.node_id())
                    }
                };
                let target = target.ok_or_else(|| GraphError::UnknownReference {
                    model: model.name.clone(),
                    reference: reference.to_string(),
                })?;

                parents.entry(node_id.clone()).or_default().insert(target.clone());
                children.entry(target).or_default().insert(node_id.clone());
            }
        }

        let order = topological_order(&nodes, &parents, &children)?;

        Ok(Self {
            parents,
            children,
            nodes,
            order,
        })
    }

    /// All nodes in deterministic topological order
    pub fn topo_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Model nodes only, in build order
    pub fn models_in_order(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .filter(|id| id.starts_with("model."))
            .cloned()
            .collect()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    /// Immediate dependencies of a node
    pub fn parents(&self, node_id: &str) -> Vec<&NodeId> {
        self.parents
            .get(node_id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Immediate dependents of a node
    pub fn children(&self, node_id: &str) -> Vec<&NodeId> {
        self.children
            .get(node_id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Transitive closure of dependents: everything that must be skipped when
    /// this node fails
    pub fn downstream(&self, node_id: &str) -> Vec<NodeId> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        let mut result = Vec::new();

        if let Some(children) = self.children.get(node_id) {
            for child in children {
                queue.push_back(child.clone());
            }
        }

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            result.push(current.clone());

            if let Some(children) = self.children.get(&current) {
                for child in children {
                    if !visited.contains(child) {
                        queue.push_back(child.clone());
                    }
                }
            }
        }

        result
    }
}

/// Kahn's algorithm with a min-heap over node ids, so ties always resolve by
/// name ascending and runs are reproducible.
fn topological_order(
    nodes: &BTreeSet<NodeId>,
    parents: &BTreeMap<NodeId, BTreeSet<NodeId>>,
    children: &BTreeMap<NodeId, BTreeSet<NodeId>>,
) -> Result<Vec<NodeId>, GraphError> {
    let mut in_degree: BTreeMap<&NodeId, usize> = nodes.iter().map(|n| (n, 0)).collect();
    for (node, deps) in parents {
        if let Some(degree) = in_degree.get_mut(node) {
            *degree = deps.len();
        }
    }

    let mut ready: BinaryHeap<Reverse<&NodeId>> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&node, _)| Reverse(node))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node.clone());

        if let Some(dependents) = children.get(node) {
            for child in dependents {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(child));
                    }
                }
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        let remaining: BTreeSet<&NodeId> = in_degree
            .iter()
            .filter(|(_, &degree)| degree > 0)
            .map(|(&node, _)| node)
            .collect();
        Err(GraphError::Cycle {
            members: extract_cycle(&remaining, parents),
        })
    }
}

/// Walk parent edges among the stuck nodes until one repeats, then report the
/// cycle's members in edge (dependency) order, rotated to start at the
/// smallest id.
fn extract_cycle(
    remaining: &BTreeSet<&NodeId>,
    parents: &BTreeMap<NodeId, BTreeSet<NodeId>>,
) -> Vec<NodeId> {
    let start = match remaining.iter().next() {
        Some(node) => (*node).clone(),
        None => return Vec::new(),
    };

    let mut path: Vec<NodeId> = Vec::new();
    let mut seen: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut current = start;

    loop {
        if let Some(&position) = seen.get(&current) {
            // Parent-walk order is reverse edge order.
            let mut members: Vec<NodeId> = path[position..].to_vec();
            members.reverse();
            if let Some(min_index) = members
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.cmp(b.1))
                .map(|(i, _)| i)
            {
                members.rotate_left(min_index);
            }
            return members;
        }
        seen.insert(current.clone(), path.len());
        path.push(current.clone());

        let next = parents
            .get(&current)
            .and_then(|deps| deps.iter().find(|dep| remaining.contains(dep)))
            .cloned();
        match next {
            Some(parent) => current = parent,
            // Every stuck node has a stuck parent, so this is unreachable.
            None => return path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn project(toml: &str) -> Project {
        Project::from_toml(toml, Path::new(".")).unwrap()
    }

    const DIAMOND: &str = r#"
        [[sources]]
        source = "raw"
        table = "orders"
        schema = "landing"

        [[models]]
        name = "stg_orders"
        layer = "staging"
        sql = "select * from {{ source('raw', 'orders') }}"

        [[models]]
        name = "int_orders"
        layer = "intermediate"
        sql = "select * from {{ ref('stg_orders') }}"

        [[models]]
        name = "int_daily"
        layer = "intermediate"
        sql = "select * from {{ ref('stg_orders') }}"

        [[models]]
        name = "fct_orders"
        layer = "mart"
        sql = "select * from {{ ref('int_orders') }} join {{ ref('int_daily') }} using (order_id)"
    "#;

    #[test]
    fn deterministic_topological_order() {
        let project = project(DIAMOND);
        let graph = ModelGraph::build(&project).unwrap();

        assert_eq!(
            graph.topo_order(),
            &[
                "source.raw.orders".to_string(),
                "model.stg_orders".to_string(),
                "model.int_daily".to_string(),
                "model.int_orders".to_string(),
                "model.fct_orders".to_string(),
            ]
        );

        // Identical input, identical order.
        let again = ModelGraph::build(&project).unwrap();
        assert_eq!(graph.topo_order(), again.topo_order());
    }

    #[test]
    fn models_in_order_excludes_sources() {
        let project = project(DIAMOND);
        let graph = ModelGraph::build(&project).unwrap();

        let models = graph.models_in_order();
        assert_eq!(models.len(), 4);
        assert!(models.iter().all(|id| id.starts_with("model.")));
    }

    #[test]
    fn downstream_closure() {
        let project = project(DIAMOND);
        let graph = ModelGraph::build(&project).unwrap();

        let downstream = graph.downstream("model.stg_orders");
        assert_eq!(
            downstream,
            vec![
                "model.int_daily".to_string(),
                "model.int_orders".to_string(),
                "model.fct_orders".to_string(),
            ]
        );

        assert!(graph.downstream("model.fct_orders").is_empty());
    }

    #[test]
    fn unknown_reference_is_fatal() {
        let toml = r#"
            [[models]]
            name = "broken"
            layer = "staging"
            sql = "select * from {{ ref('missing') }}"
        "#;
        let err = ModelGraph::build(&project(toml)).unwrap_err();
        match err {
            GraphError::UnknownReference { model, reference } => {
                assert_eq!(model, "broken");
                assert_eq!(reference, "ref('missing')");
            }
            other => panic!("expected UnknownReference, got {other:?}"),
        }
    }

    #[test]
    fn cycle_names_every_member() {
        let toml = r#"
            [[models]]
            name = "a"
            layer = "staging"
            sql = "select * from {{ ref('c') }}"

            [[models]]
            name = "b"
            layer = "staging"
            sql = "select * from {{ ref('a') }}"

            [[models]]
            name = "c"
            layer = "staging"
            sql = "select * from {{ ref('b') }}"
        "#;
        let err = ModelGraph::build(&project(toml)).unwrap_err();
        match err {
            GraphError::Cycle { members } => {
                assert_eq!(
                    members,
                    vec![
                        "model.a".to_string(),
                        "model.b".to_string(),
                        "model.c".to_string(),
                    ]
                );
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_error_message_closes_the_loop() {
        let err = GraphError::Cycle {
            members: vec!["model.a".to_string(), "model.b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle: model.a -> model.b -> model.a"
        );
    }

    #[test]
    fn sibling_branches_share_a_parent() {
        let project = project(DIAMOND);
        let graph = ModelGraph::build(&project).unwrap();

        assert_eq!(
            graph.parents("model.fct_orders"),
            vec![&"model.int_daily".to_string(), &"model.int_orders".to_string()]
        );
        assert_eq!(
            graph.children("source.raw.orders"),
            vec![&"model.stg_orders".to_string()]
        );
    }
}
