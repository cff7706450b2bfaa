//! In-memory store backend for tests and dry runs
//!
//! Statement execution is the one thing an in-memory backend cannot do for
//! real, so it is *staged*: tests register the row set each compiled
//! statement yields. Everything downstream of that point runs for real:
//! create/replace semantics, merge-by-key upserts, row reads, and timestamp
//! probes all operate on actual stored state, which is what the engine tests
//! exercise.
//!
//! Failure injection mirrors what a real store can do to a run:
//!
//! ```rust,ignore
//! let store = MemoryStore::new().with_connection_failure();
//! assert!(store.test_connection().await.is_err());
//!
//! store.fail_statement("select * from broken", StoreError::Statement("syntax".into())).await;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::adapter::{Row, StoreAdapter, StoreError};
use crate::address::ObjectAddress;

#[derive(Debug, Clone, PartialEq)]
enum ObjectKind {
    /// Resolved against the staged statement result at read time, so a view
    /// is always consistent with its current query.
    View,
    Table,
}

#[derive(Debug, Clone)]
struct StoredObject {
    kind: ObjectKind,
    statement: String,
    rows: Vec<Row>,
}

#[derive(Default)]
struct Inner {
    /// statement text -> rows it yields when executed
    staged: HashMap<String, Vec<Row>>,

    /// fqn -> materialized object
    objects: HashMap<String, StoredObject>,

    /// statement text -> injected error
    statement_errors: HashMap<String, StoreError>,
}

/// Programmable in-memory store
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    fail_connection: bool,
    latency_ms: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            fail_connection: false,
            latency_ms: 0,
        }
    }

    /// Register the row set a compiled statement yields
    pub async fn stage_result(&self, sql: impl Into<String>, rows: Vec<Row>) {
        self.inner.write().await.staged.insert(sql.into(), rows);
    }

    /// Create a raw table directly, bypassing statement execution
    ///
    /// Used to seed source relations for freshness and relationship checks.
    pub async fn seed_table(&self, address: &ObjectAddress, rows: Vec<Row>) {
        self.inner.write().await.objects.insert(
            address.fqn(),
            StoredObject {
                kind: ObjectKind::Table,
                statement: String::new(),
                rows,
            },
        );
    }

    /// Inject an error for a specific statement
    pub async fn fail_statement(&self, sql: impl Into<String>, error: StoreError) {
        self.inner
            .write()
            .await
            .statement_errors
            .insert(sql.into(), error);
    }

    /// Fail all connection tests
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Simulate execution latency in milliseconds
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Number of materialized objects (test helper)
    pub async fn object_count(&self) -> usize {
        self.inner.read().await.objects.len()
    }

    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }
    }

    async fn check_statement(&self, sql: &str) -> Result<(), StoreError> {
        if let Some(error) = self.inner.read().await.statement_errors.get(sql) {
            return Err(error.clone());
        }
        Ok(())
    }

    async fn staged_rows(&self, address: &ObjectAddress, sql: &str) -> Result<Vec<Row>, StoreError> {
        self.inner
            .read()
            .await
            .staged
            .get(sql)
            .cloned()
            .ok_or_else(|| {
                StoreError::Statement(format!(
                    "statement for {} yields no staged result",
                    address.fqn()
                ))
            })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
        }
    }
}

/// Key of a row under a unique key declaration
fn merge_key(row: &Row, unique_key: &[String]) -> Vec<serde_json::Value> {
    unique_key
        .iter()
        .map(|column| row.get(column).cloned().unwrap_or(serde_json::Value::Null))
        .collect()
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn name(&self) -> &'static str {
        "Memory"
    }

    async fn test_connection(&self) -> Result<(), StoreError> {
        self.simulate_latency().await;
        if self.fail_connection {
            Err(StoreError::Connection(
                "simulated connection failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    async fn relation_exists(&self, address: &ObjectAddress) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.objects.contains_key(&address.fqn()))
    }

    async fn create_view_as(&self, address: &ObjectAddress, sql: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.check_statement(sql).await?;

        self.inner.write().await.objects.insert(
            address.fqn(),
            StoredObject {
                kind: ObjectKind::View,
                statement: sql.to_string(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn create_table_as(&self, address: &ObjectAddress, sql: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.check_statement(sql).await?;
        let rows = self.staged_rows(address, sql).await?;

        self.inner.write().await.objects.insert(
            address.fqn(),
            StoredObject {
                kind: ObjectKind::Table,
                statement: sql.to_string(),
                rows,
            },
        );
        Ok(())
    }

    async fn merge_rows(
        &self,
        address: &ObjectAddress,
        sql: &str,
        unique_key: &[String],
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.check_statement(sql).await?;
        let incoming = self.staged_rows(address, sql).await?;

        let mut inner = self.inner.write().await;
        let object = inner
            .objects
            .get_mut(&address.fqn())
            .ok_or_else(|| StoreError::ObjectNotFound(address.fqn()))?;

        for row in incoming {
            let key = merge_key(&row, unique_key);
            match object
                .rows
                .iter_mut()
                .find(|existing| merge_key(existing, unique_key) == key)
            {
                Some(existing) => *existing = row,
                None => object.rows.push(row),
            }
        }
        object.statement = sql.to_string();
        Ok(())
    }

    async fn drop_if_exists(&self, address: &ObjectAddress) -> Result<(), StoreError> {
        self.inner.write().await.objects.remove(&address.fqn());
        Ok(())
    }

    async fn fetch_rows(&self, address: &ObjectAddress) -> Result<Vec<Row>, StoreError> {
        self.simulate_latency().await;
        let inner = self.inner.read().await;
        let object = inner
            .objects
            .get(&address.fqn())
            .ok_or_else(|| StoreError::ObjectNotFound(address.fqn()))?;

        match object.kind {
            ObjectKind::Table => Ok(object.rows.clone()),
            ObjectKind::View => inner.staged.get(&object.statement).cloned().ok_or_else(|| {
                StoreError::InvalidResponse(format!(
                    "view {} no longer resolves to a staged result",
                    address.fqn()
                ))
            }),
        }
    }

    async fn newest_timestamp(
        &self,
        address: &ObjectAddress,
        column: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let rows = self.fetch_rows(address).await?;

        let mut newest: Option<DateTime<Utc>> = None;
        for row in &rows {
            let value = match row.get(column) {
                Some(serde_json::Value::String(text)) => text,
                Some(serde_json::Value::Null) | None => continue,
                Some(other) => {
                    return Err(StoreError::InvalidResponse(format!(
                        "column '{}' of {} is not a timestamp: {}",
                        column,
                        address.fqn(),
                        other
                    )))
                }
            };
            let parsed = DateTime::parse_from_rfc3339(value)
                .map_err(|e| {
                    StoreError::InvalidResponse(format!(
                        "column '{}' of {}: {}",
                        column,
                        address.fqn(),
                        e
                    ))
                })?
                .with_timezone(&Utc);
            newest = Some(match newest {
                Some(current) if current >= parsed => current,
                _ => parsed,
            });
        }
        Ok(newest)
    }
}

/// Convert a JSON array of objects into rows (test convenience)
pub fn rows_from_json(value: serde_json::Value) -> Vec<Row> {
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::Object(map) => Some(map.into_iter().collect()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Builder for a pre-seeded MemoryStore
pub struct MemoryStoreBuilder {
    staged: HashMap<String, Vec<Row>>,
    seeded: HashMap<String, Vec<Row>>,
    fail_connection: bool,
    latency_ms: u64,
}

impl MemoryStoreBuilder {
    pub fn new() -> Self {
        Self {
            staged: HashMap::new(),
            seeded: HashMap::new(),
            fail_connection: false,
            latency_ms: 0,
        }
    }

    pub fn with_result(mut self, sql: impl Into<String>, rows: Vec<Row>) -> Self {
        self.staged.insert(sql.into(), rows);
        self
    }

    pub fn with_table(mut self, address: &ObjectAddress, rows: Vec<Row>) -> Self {
        self.seeded.insert(address.fqn(), rows);
        self
    }

    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn build(self) -> MemoryStore {
        let objects = self
            .seeded
            .into_iter()
            .map(|(fqn, rows)| {
                (
                    fqn,
                    StoredObject {
                        kind: ObjectKind::Table,
                        statement: String::new(),
                        rows,
                    },
                )
            })
            .collect();

        MemoryStore {
            inner: Arc::new(RwLock::new(Inner {
                staged: self.staged,
                objects,
                statement_errors: HashMap::new(),
            })),
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
        }
    }
}

impl Default for MemoryStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn address(name: &str) -> ObjectAddress {
        ObjectAddress::new("db", "main", name)
    }

    #[tokio::test]
    async fn table_materializes_staged_rows() {
        let store = MemoryStore::new();
        store
            .stage_result("select 1 as id", rows_from_json(json!([{"id": 1}])))
            .await;

        let target = address("t");
        store.create_table_as(&target, "select 1 as id").await.unwrap();

        assert!(store.relation_exists(&target).await.unwrap());
        let rows = store.fetch_rows(&target).await.unwrap();
        assert_eq!(rows, rows_from_json(json!([{"id": 1}])));
    }

    #[tokio::test]
    async fn table_without_staged_result_is_rejected() {
        let store = MemoryStore::new();
        let result = store.create_table_as(&address("t"), "select 1").await;
        assert!(matches!(result, Err(StoreError::Statement(_))));
    }

    #[tokio::test]
    async fn view_tracks_current_statement_result() {
        let store = MemoryStore::new();
        store
            .stage_result("select * from src", rows_from_json(json!([{"id": 1}])))
            .await;

        let target = address("v");
        store.create_view_as(&target, "select * from src").await.unwrap();
        assert_eq!(store.fetch_rows(&target).await.unwrap().len(), 1);

        // Re-staging the statement is visible through the view immediately.
        store
            .stage_result(
                "select * from src",
                rows_from_json(json!([{"id": 1}, {"id": 2}])),
            )
            .await;
        assert_eq!(store.fetch_rows(&target).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn merge_upserts_by_key() {
        let store = MemoryStore::new();
        let target = address("inc");

        store
            .stage_result(
                "full",
                rows_from_json(json!([
                    {"id": 1, "amount": 10},
                    {"id": 2, "amount": 20},
                ])),
            )
            .await;
        store.create_table_as(&target, "full").await.unwrap();

        store
            .stage_result(
                "delta",
                rows_from_json(json!([
                    {"id": 2, "amount": 25},
                    {"id": 3, "amount": 30},
                ])),
            )
            .await;
        store
            .merge_rows(&target, "delta", &["id".to_string()])
            .await
            .unwrap();

        let rows = store.fetch_rows(&target).await.unwrap();
        assert_eq!(
            rows,
            rows_from_json(json!([
                {"id": 1, "amount": 10},
                {"id": 2, "amount": 25},
                {"id": 3, "amount": 30},
            ]))
        );
    }

    #[tokio::test]
    async fn merge_into_missing_table_fails() {
        let store = MemoryStore::new();
        store.stage_result("delta", vec![]).await;
        let result = store
            .merge_rows(&address("missing"), "delta", &["id".to_string()])
            .await;
        assert!(matches!(result, Err(StoreError::ObjectNotFound(_))));
    }

    #[tokio::test]
    async fn injected_statement_error() {
        let store = MemoryStore::new();
        store
            .fail_statement("select broken", StoreError::Statement("syntax error".into()))
            .await;

        let result = store.create_table_as(&address("t"), "select broken").await;
        assert!(matches!(result, Err(StoreError::Statement(_))));
    }

    #[tokio::test]
    async fn connection_failure() {
        let store = MemoryStore::new().with_connection_failure();
        assert!(matches!(
            store.test_connection().await,
            Err(StoreError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn newest_timestamp_picks_max() {
        let store = MemoryStore::new();
        let target = address("src");
        store
            .seed_table(
                &target,
                rows_from_json(json!([
                    {"loaded_at": "2026-08-01T00:00:00Z"},
                    {"loaded_at": "2026-08-03T12:00:00Z"},
                    {"loaded_at": null},
                ])),
            )
            .await;

        let newest = store.newest_timestamp(&target, "loaded_at").await.unwrap();
        assert_eq!(
            newest,
            Some(
                DateTime::parse_from_rfc3339("2026-08-03T12:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc)
            )
        );
    }

    #[tokio::test]
    async fn newest_timestamp_of_empty_table_is_none() {
        let store = MemoryStore::new();
        let target = address("src");
        store.seed_table(&target, vec![]).await;
        assert_eq!(store.newest_timestamp(&target, "loaded_at").await.unwrap(), None);
    }

    #[tokio::test]
    async fn drop_then_exists() {
        let store = MemoryStoreBuilder::new()
            .with_table(&address("t"), rows_from_json(json!([{"id": 1}])))
            .build();

        assert!(store.relation_exists(&address("t")).await.unwrap());
        store.drop_if_exists(&address("t")).await.unwrap();
        assert!(!store.relation_exists(&address("t")).await.unwrap());
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let store = MemoryStore::new();
        let cloned = store.clone();
        store
            .seed_table(&address("t"), rows_from_json(json!([{"id": 1}])))
            .await;
        assert!(cloned.relation_exists(&address("t")).await.unwrap());
    }
}
