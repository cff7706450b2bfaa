//! Reference marker extraction
//!
//! A model's dependency edges are exactly the `ref('...')` and
//! `source('...', '...')` markers in its body. Edges are never inferred from
//! free-form query text beyond this call syntax, so graph construction stays
//! decidable.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// A declared reference from a model body
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reference {
    /// `ref('model_name')`
    Model(String),

    /// `source('source_name', 'table_name')`
    Source { source: String, table: String },
}

impl Reference {
    /// Graph node id of the referenced relation
    pub fn node_id(&self) -> String {
        match self {
            Self::Model(name) => format!("model.{}", name),
            Self::Source { source, table } => format!("source.{}.{}", source, table),
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model(name) => write!(f, "ref('{}')", name),
            Self::Source { source, table } => write!(f, "source('{}', '{}')", source, table),
        }
    }
}

fn ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"\bref\(\s*['"]([A-Za-z0-9_]+)['"]\s*\)"#).unwrap())
}

fn source_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"\bsource\(\s*['"]([A-Za-z0-9_]+)['"]\s*,\s*['"]([A-Za-z0-9_]+)['"]\s*\)"#)
            .unwrap()
    })
}

/// Extract the declared reference set of a model body
///
/// Duplicates collapse; the result is sorted so identical input always yields
/// identical output.
pub fn extract_references(body: &str) -> Vec<Reference> {
    let mut refs = BTreeSet::new();

    for capture in ref_pattern().captures_iter(body) {
        refs.insert(Reference::Model(capture[1].to_string()));
    }

    for capture in source_pattern().captures_iter(body) {
        refs.insert(Reference::Source {
            source: capture[1].to_string(),
            table: capture[2].to_string(),
        });
    }

    refs.into_iter().collect()
}
