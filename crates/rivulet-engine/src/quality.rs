//! Data-quality assertions over materialized rows
//!
//! Every assertion is evaluated independently against the model's read-back
//! rows; a failing or erroring assertion never blocks its siblings. Severity
//! decides whether a failure fails the run, the caller applies that rule via
//! [`AssertionResult::fails_run`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use rivulet_compile::ResolutionContext;
use rivulet_core::{AssertionDecl, AssertionKind, AssertionResult, Model};
use rivulet_store::{Row, StoreAdapter, StoreError};
use serde_json::Value;
use tracing::debug;

/// Sample cap per failing assertion
const SAMPLE_LIMIT: usize = 5;

pub struct QualityEngine {
    store: Arc<dyn StoreAdapter>,
}

impl QualityEngine {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self { store }
    }

    /// Evaluate every assertion declared on the model
    pub async fn evaluate_model(
        &self,
        model: &Model,
        context: &ResolutionContext,
    ) -> Vec<AssertionResult> {
        if model.assertions.is_empty() {
            return Vec::new();
        }

        let Some(address) = context.model_address(&model.name) else {
            return unevaluated(model, "model address is not resolvable");
        };

        let rows = match self.store.fetch_rows(address).await {
            Ok(rows) => rows,
            Err(e) => return unevaluated(model, &e.to_string()),
        };

        let mut results = Vec::with_capacity(model.assertions.len());
        for assertion in &model.assertions {
            let result = self.evaluate_one(model, assertion, &rows, context).await;
            debug!(
                model = %model.node_id(),
                condition = %assertion.kind.describe(),
                passed = result.passed,
                violations = result.violations,
                "assertion evaluated"
            );
            results.push(result);
        }
        results
    }

    async fn evaluate_one(
        &self,
        model: &Model,
        assertion: &AssertionDecl,
        rows: &[Row],
        context: &ResolutionContext,
    ) -> AssertionResult {
        let outcome = match &assertion.kind {
            AssertionKind::Unique { columns } => Ok(check_unique(rows, columns)),
            AssertionKind::NotNull { column } => Ok(check_not_null(rows, column)),
            AssertionKind::AcceptedValues { column, values } => {
                Ok(check_accepted_values(rows, column, values))
            }
            AssertionKind::Relationship {
                column,
                to,
                to_column,
            } => self.check_relationship(rows, column, to, to_column, context).await,
            AssertionKind::Expression { expr } => check_expression(rows, expr),
        };

        match outcome {
            Ok((violations, sample)) => AssertionResult {
                model: model.node_id(),
                kind: assertion.kind.label().to_string(),
                condition: assertion.kind.describe(),
                severity: assertion.severity,
                passed: violations == 0,
                violations,
                sample,
                error: None,
            },
            Err(message) => AssertionResult {
                model: model.node_id(),
                kind: assertion.kind.label().to_string(),
                condition: assertion.kind.describe(),
                severity: assertion.severity,
                passed: false,
                violations: 0,
                sample: Vec::new(),
                error: Some(message),
            },
        }
    }

    /// Every non-null child value must exist in the parent column. `to`
    /// names a model, or a source as `<source>.<table>`.
    async fn check_relationship(
        &self,
        rows: &[Row],
        column: &str,
        to: &str,
        to_column: &str,
        context: &ResolutionContext,
    ) -> Result<(u64, Vec<Value>), String> {
        let parent = match to.split_once('.') {
            Some((source, table)) => context.source_address(source, table),
            None => context.model_address(to),
        }
        .ok_or_else(|| format!("relationship target '{}' is not declared", to))?;

        let parent_rows = self
            .store
            .fetch_rows(parent)
            .await
            .map_err(|e: StoreError| e.to_string())?;
        let parent_values: BTreeSet<String> = parent_rows
            .iter()
            .filter_map(|row| row.get(to_column))
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect();

        let mut violations = 0;
        let mut sample = Vec::new();
        let mut seen = BTreeSet::new();
        for value in rows.iter().filter_map(|row| row.get(column)) {
            if value.is_null() {
                continue;
            }
            if !parent_values.contains(&value.to_string()) {
                violations += 1;
                if seen.insert(value.to_string()) && sample.len() < SAMPLE_LIMIT {
                    sample.push(value.clone());
                }
            }
        }
        Ok((violations, sample))
    }
}

/// All assertions on a model reported as unevaluable, with the reason
pub fn unevaluated(model: &Model, reason: &str) -> Vec<AssertionResult> {
    model
        .assertions
        .iter()
        .map(|assertion| AssertionResult {
            model: model.node_id(),
            kind: assertion.kind.label().to_string(),
            condition: assertion.kind.describe(),
            severity: assertion.severity,
            passed: false,
            violations: 0,
            sample: Vec::new(),
            error: Some(reason.to_string()),
        })
        .collect()
}

/// No duplicate values across the key columns; violations count the
/// distinct duplicated keys
fn check_unique(rows: &[Row], columns: &[String]) -> (u64, Vec<Value>) {
    let mut counts: BTreeMap<String, (Value, u64)> = BTreeMap::new();
    for row in rows {
        let key: Vec<Value> = columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        let display = if key.len() == 1 {
            key[0].clone()
        } else {
            Value::Array(key)
        };
        let entry = counts.entry(display.to_string()).or_insert((display, 0));
        entry.1 += 1;
    }

    let mut violations = 0;
    let mut sample = Vec::new();
    for (value, count) in counts.into_values() {
        if count > 1 {
            violations += 1;
            if sample.len() < SAMPLE_LIMIT {
                sample.push(value);
            }
        }
    }
    (violations, sample)
}

fn check_not_null(rows: &[Row], column: &str) -> (u64, Vec<Value>) {
    let mut violations = 0;
    let mut sample = Vec::new();
    for row in rows {
        let is_null = row.get(column).map(Value::is_null).unwrap_or(true);
        if is_null {
            violations += 1;
            if sample.len() < SAMPLE_LIMIT {
                sample.push(serde_json::to_value(row).unwrap_or(Value::Null));
            }
        }
    }
    (violations, sample)
}

/// Nulls are not counted here; `not_null` owns them
fn check_accepted_values(rows: &[Row], column: &str, accepted: &[Value]) -> (u64, Vec<Value>) {
    let mut violations = 0;
    let mut sample = Vec::new();
    let mut seen = BTreeSet::new();
    for value in rows.iter().filter_map(|row| row.get(column)) {
        if value.is_null() {
            continue;
        }
        if !accepted.contains(value) {
            violations += 1;
            if seen.insert(value.to_string()) && sample.len() < SAMPLE_LIMIT {
                sample.push(value.clone());
            }
        }
    }
    (violations, sample)
}

/// Row-level predicate `column <op> literal`; a null or missing column
/// value violates the predicate
fn check_expression(rows: &[Row], expr: &str) -> Result<(u64, Vec<Value>), String> {
    static EXPR: OnceLock<Regex> = OnceLock::new();
    let pattern = EXPR.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(>=|<=|!=|=|>|<)\s*(.+?)\s*$").unwrap()
    });

    let captures = pattern
        .captures(expr)
        .ok_or_else(|| format!("unsupported expression '{}'", expr))?;
    let column = &captures[1];
    let op = &captures[2];
    let literal = parse_literal(&captures[3]);

    let mut violations = 0;
    let mut sample = Vec::new();
    for row in rows {
        let value = row.get(column).cloned().unwrap_or(Value::Null);
        if !predicate_holds(&value, op, &literal) {
            violations += 1;
            if sample.len() < SAMPLE_LIMIT {
                sample.push(value);
            }
        }
    }
    Ok((violations, sample))
}

fn parse_literal(raw: &str) -> Value {
    if let Some(inner) = raw
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        return Value::String(inner.to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn predicate_holds(value: &Value, op: &str, literal: &Value) -> bool {
    if value.is_null() {
        return false;
    }
    match op {
        "=" => compare(value, literal) == Some(std::cmp::Ordering::Equal),
        "!=" => matches!(
            compare(value, literal),
            Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Greater)
        ),
        ">" => compare(value, literal) == Some(std::cmp::Ordering::Greater),
        "<" => compare(value, literal) == Some(std::cmp::Ordering::Less),
        ">=" => matches!(
            compare(value, literal),
            Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
        ),
        "<=" => matches!(
            compare(value, literal),
            Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
        ),
        _ => false,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rivulet_store::memory::rows_from_json;
    use serde_json::json;

    fn rows(value: Value) -> Vec<Row> {
        rows_from_json(value)
    }

    #[test]
    fn unique_counts_duplicated_keys() {
        let rows = rows(json!([
            {"id": 1}, {"id": 2}, {"id": 2}, {"id": 3}, {"id": 3}, {"id": 3}
        ]));
        let (violations, sample) = check_unique(&rows, &["id".to_string()]);
        assert_eq!(violations, 2);
        assert_eq!(sample, vec![json!(2), json!(3)]);
    }

    #[test]
    fn unique_over_compound_key() {
        let rows = rows(json!([
            {"a": 1, "b": "x"}, {"a": 1, "b": "y"}, {"a": 1, "b": "y"}
        ]));
        let (violations, _) = check_unique(&rows, &["a".to_string(), "b".to_string()]);
        assert_eq!(violations, 1);
    }

    #[test]
    fn not_null_counts_missing_and_null() {
        let rows = rows(json!([
            {"id": 1, "status": "open"}, {"id": 2, "status": null}, {"id": 3}
        ]));
        let (violations, _) = check_not_null(&rows, "status");
        assert_eq!(violations, 2);
    }

    #[test]
    fn accepted_values_skips_nulls() {
        let rows = rows(json!([
            {"status": "open"}, {"status": "closed"}, {"status": null}, {"status": "weird"}
        ]));
        let (violations, sample) =
            check_accepted_values(&rows, "status", &[json!("open"), json!("closed")]);
        assert_eq!(violations, 1);
        assert_eq!(sample, vec![json!("weird")]);
    }

    #[test]
    fn expression_counts_predicate_violations() {
        let rows = rows(json!([
            {"total": 10}, {"total": 0}, {"total": -5}
        ]));
        let (violations, sample) = check_expression(&rows, "total >= 0").unwrap();
        assert_eq!(violations, 1);
        assert_eq!(sample, vec![json!(-5)]);
    }

    #[test]
    fn expression_null_value_is_a_violation() {
        let rows = rows(json!([{"total": null}, {"other": 1}]));
        let (violations, _) = check_expression(&rows, "total >= 0").unwrap();
        assert_eq!(violations, 2);
    }

    #[test]
    fn expression_string_literals() {
        let rows = rows(json!([{"status": "open"}, {"status": "closed"}]));
        let (violations, _) = check_expression(&rows, "status != 'void'").unwrap();
        assert_eq!(violations, 0);

        let (violations, _) = check_expression(&rows, "status = 'open'").unwrap();
        assert_eq!(violations, 1);
    }

    #[test]
    fn malformed_expression_is_an_error() {
        let rows = rows(json!([{"total": 1}]));
        let err = check_expression(&rows, "lower(status) like '%x%'").unwrap_err();
        assert!(err.contains("unsupported expression"));
    }
}
