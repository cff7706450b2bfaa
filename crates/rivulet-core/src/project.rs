//! Project declarations (`rivulet.toml`)
//!
//! Parses the declaration sections of a project file into sources, models,
//! and their attached assertions. Graph structure is *derived* from the
//! reference markers in each model body, never declared directly.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{Config, ProjectSettings, StoreConfig, TargetConfig};
use crate::severity::Severity;

/// Pipeline layer a model belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Staging,
    Intermediate,
    Mart,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Staging => write!(f, "staging"),
            Self::Intermediate => write!(f, "intermediate"),
            Self::Mart => write!(f, "mart"),
        }
    }
}

/// How a model's logical definition becomes a physical object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    /// Create-or-replace view; no stored state
    View,

    /// Create-or-replace table; full recompute each run
    Table,

    /// Table on first build, upsert-by-key merge afterwards
    Incremental,
}

impl Default for Materialization {
    fn default() -> Self {
        Self::View
    }
}

impl std::fmt::Display for Materialization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::View => write!(f, "view"),
            Self::Table => write!(f, "table"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

/// Freshness contract for a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessSpec {
    /// Timestamp column the contract is measured against
    pub loaded_at_field: String,

    /// Age at which the source is reported stale-warn
    #[serde(default)]
    pub warn_after_minutes: Option<u64>,

    /// Age at which the source is reported stale-error
    #[serde(default)]
    pub error_after_minutes: Option<u64>,
}

/// A raw, externally populated table consumed by models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDecl {
    /// Source group name (first argument of `source(...)`)
    pub source: String,

    /// Table name within the group (second argument of `source(...)`)
    pub table: String,

    /// Database the raw table lives in; defaults to the target database
    #[serde(default)]
    pub database: Option<String>,

    /// Schema the raw table lives in
    pub schema: String,

    /// Physical table name when it differs from `table`
    #[serde(default)]
    pub identifier: Option<String>,

    /// Freshness contract, if declared
    #[serde(default)]
    pub freshness: Option<FreshnessSpec>,
}

impl SourceDecl {
    /// Graph node id, e.g. `source.raw.orders`
    pub fn node_id(&self) -> String {
        format!("source.{}.{}", self.source, self.table)
    }

    /// Physical table name in the store
    pub fn identifier(&self) -> &str {
        self.identifier.as_deref().unwrap_or(&self.table)
    }
}

/// A declarative data-quality assertion kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssertionKind {
    /// No duplicate values across the given column(s)
    Unique { columns: Vec<String> },

    /// No null values in the column
    NotNull { column: String },

    /// Every value is a member of the declared set
    AcceptedValues {
        column: String,
        values: Vec<serde_json::Value>,
    },

    /// Every value in the child column exists in a parent column.
    /// `to` names a model, or a source as `<source>.<table>`.
    Relationship {
        column: String,
        to: String,
        to_column: String,
    },

    /// Row-level predicate `column <op> literal` that must hold for all rows
    Expression { expr: String },
}

impl AssertionKind {
    /// Stable label used in reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unique { .. } => "unique",
            Self::NotNull { .. } => "not_null",
            Self::AcceptedValues { .. } => "accepted_values",
            Self::Relationship { .. } => "relationship",
            Self::Expression { .. } => "expression",
        }
    }

    /// Human-readable description of the checked condition
    pub fn describe(&self) -> String {
        match self {
            Self::Unique { columns } => format!("unique({})", columns.join(", ")),
            Self::NotNull { column } => format!("not_null({})", column),
            Self::AcceptedValues { column, .. } => format!("accepted_values({})", column),
            Self::Relationship {
                column,
                to,
                to_column,
            } => format!("relationship({} -> {}.{})", column, to, to_column),
            Self::Expression { expr } => format!("expression({})", expr),
        }
    }
}

/// An assertion attached to a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionDecl {
    #[serde(flatten)]
    pub kind: AssertionKind,

    #[serde(default)]
    pub severity: Severity,
}

/// A model declaration as it appears in the project file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ModelDecl {
    name: String,

    layer: Layer,

    #[serde(default)]
    materialized: Materialization,

    /// Unique/merge key for incremental models
    #[serde(default)]
    unique_key: Vec<String>,

    /// Schema override; defaults to the target schema
    #[serde(default)]
    schema: Option<String>,

    /// Inline transformation body
    #[serde(default)]
    sql: Option<String>,

    /// Path to a `.sql` body file, relative to the project root
    #[serde(default)]
    file: Option<String>,

    #[serde(default)]
    assertions: Vec<AssertionDecl>,
}

/// A named transformation node with its body resolved
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub name: String,
    pub layer: Layer,
    pub materialized: Materialization,
    pub unique_key: Vec<String>,
    pub schema: Option<String>,
    pub body: String,
    pub assertions: Vec<AssertionDecl>,
}

impl Model {
    /// Graph node id, e.g. `model.stg_orders`
    pub fn node_id(&self) -> String {
        format!("model.{}", self.name)
    }
}

/// Raw project file layout
#[derive(Debug, Deserialize)]
struct ProjectFile {
    #[serde(default)]
    project: ProjectSettings,

    #[serde(default)]
    targets: HashMap<String, TargetConfig>,

    #[serde(default)]
    store: Option<StoreConfig>,

    #[serde(default)]
    vars: HashMap<String, serde_json::Value>,

    #[serde(default)]
    sources: Vec<SourceDecl>,

    #[serde(default)]
    models: Vec<ModelDecl>,
}

/// A fully loaded project: configuration, declarations, resolved bodies
#[derive(Debug, Clone)]
pub struct Project {
    /// Project root (parent of the project file)
    pub root: PathBuf,

    /// Environment configuration sections
    pub config: Config,

    /// Project variables available to model bodies
    pub vars: HashMap<String, serde_json::Value>,

    /// Concatenated macro fragments, rendered ahead of every model body
    pub macro_prelude: String,

    pub sources: Vec<SourceDecl>,
    pub models: Vec<Model>,
}

impl Project {
    /// Load a project from its `rivulet.toml`
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LoadError::Io(path.display().to_string(), e.to_string()))?;
        let root = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Self::from_toml(&contents, &root)
    }

    /// Parse a project from TOML, resolving file-backed bodies against `root`
    pub fn from_toml(toml: &str, root: &Path) -> Result<Self, LoadError> {
        let file: ProjectFile =
            toml::from_str(toml).map_err(|e| LoadError::Parse(e.to_string()))?;

        let mut seen_sources = HashSet::new();
        for source in &file.sources {
            if !seen_sources.insert(source.node_id()) {
                return Err(LoadError::DuplicateSource(source.node_id()));
            }
        }

        let mut seen_models = HashSet::new();
        let mut models = Vec::with_capacity(file.models.len());
        for decl in file.models {
            if !seen_models.insert(decl.name.clone()) {
                return Err(LoadError::DuplicateModel(decl.name));
            }
            let body = match (&decl.sql, &decl.file) {
                (Some(sql), None) => sql.clone(),
                (None, Some(rel)) => {
                    let path = root.join(rel);
                    std::fs::read_to_string(&path)
                        .map_err(|e| LoadError::Io(path.display().to_string(), e.to_string()))?
                }
                _ => return Err(LoadError::ModelBody(decl.name)),
            };
            models.push(Model {
                name: decl.name,
                layer: decl.layer,
                materialized: decl.materialized,
                unique_key: decl.unique_key,
                schema: decl.schema,
                body,
                assertions: decl.assertions,
            });
        }

        let macro_prelude = load_macro_prelude(root, &file.project.macro_paths)?;

        Ok(Self {
            root: root.to_path_buf(),
            config: Config {
                project: file.project,
                targets: file.targets,
                store: file.store,
            },
            vars: file.vars,
            macro_prelude,
            sources: file.sources,
            models,
        })
    }

    /// Look up a model by name
    pub fn model(&self, name: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Look up a source by group and table name
    pub fn source(&self, source: &str, table: &str) -> Option<&SourceDecl> {
        self.sources
            .iter()
            .find(|s| s.source == source && s.table == table)
    }
}

/// Collect macro fragments from the configured paths, sorted for determinism
fn load_macro_prelude(root: &Path, macro_paths: &[String]) -> Result<String, LoadError> {
    let mut fragments = Vec::new();
    for rel in macro_paths {
        let dir = root.join(rel);
        if !dir.exists() {
            return Err(LoadError::Io(
                dir.display().to_string(),
                "macro path does not exist".to_string(),
            ));
        }
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry =
                entry.map_err(|e| LoadError::Io(dir.display().to_string(), e.to_string()))?;
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "sql")
            {
                let text = std::fs::read_to_string(entry.path()).map_err(|e| {
                    LoadError::Io(entry.path().display().to_string(), e.to_string())
                })?;
                fragments.push(text);
            }
        }
    }
    Ok(fragments.join("\n"))
}

/// Project loading errors (fatal; nothing executes after one of these)
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {0}: {1}")]
    Io(String, String),

    #[error("failed to parse project file: {0}")]
    Parse(String),

    #[error("duplicate model declaration: {0}")]
    DuplicateModel(String),

    #[error("duplicate source declaration: {0}")]
    DuplicateSource(String),

    #[error("model '{0}' must declare exactly one of 'sql' or 'file'")]
    ModelBody(String),
}
