//! Store adapter trait: the seam between the engine and the target store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::address::ObjectAddress;

/// A materialized row, column name to value
pub type Row = BTreeMap<String, serde_json::Value>;

/// Errors surfaced by a store backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("statement rejected: {0}")]
    Statement(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Trait for target-store backends
///
/// The engine only ever issues these operations; it implements no storage of
/// its own. A create-or-replace is assumed to be observable as atomic to
/// readers (the store's native DDL atomicity), and the engine never runs two
/// of these concurrently for the same address within a run.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Backend name (e.g. "Postgres", "Memory")
    fn name(&self) -> &'static str;

    /// Validate connectivity before a run
    async fn test_connection(&self) -> Result<(), StoreError>;

    /// Whether a relation exists at the address
    async fn relation_exists(&self, address: &ObjectAddress) -> Result<bool, StoreError>;

    /// Create or replace a view defined by the statement
    async fn create_view_as(&self, address: &ObjectAddress, sql: &str) -> Result<(), StoreError>;

    /// Create or replace a table with the statement's full result
    async fn create_table_as(&self, address: &ObjectAddress, sql: &str) -> Result<(), StoreError>;

    /// Upsert the statement's rows into an existing table by unique key
    async fn merge_rows(
        &self,
        address: &ObjectAddress,
        sql: &str,
        unique_key: &[String],
    ) -> Result<(), StoreError>;

    /// Drop the relation if present
    async fn drop_if_exists(&self, address: &ObjectAddress) -> Result<(), StoreError>;

    /// Read back the rows of a materialized object (validation surface)
    async fn fetch_rows(&self, address: &ObjectAddress) -> Result<Vec<Row>, StoreError>;

    /// Newest value of a timestamp column, for freshness checks
    async fn newest_timestamp(
        &self,
        address: &ObjectAddress,
        column: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}
