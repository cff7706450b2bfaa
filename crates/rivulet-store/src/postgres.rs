//! PostgreSQL store backend
//!
//! Works with PostgreSQL 9.5+ (ON CONFLICT upserts) and compatible engines.
//! Materialization is delegated entirely to the database's own DDL:
//! create-or-replace for views, drop-and-recreate for tables, and an
//! insert-on-conflict merge for incremental models.
//!
//! ```rust,ignore
//! let store = PostgresStore::connect(
//!     "host=localhost port=5432 dbname=analytics user=rivulet password=secret"
//! ).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls};

use crate::adapter::{Row, StoreAdapter, StoreError};
use crate::address::ObjectAddress;

/// PostgreSQL store backend
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Connect using a libpq-style connection string
    pub async fn connect(connection_string: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        // The connection future drives the socket; it ends when the client drops.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection task ended");
            }
        });

        Ok(Self { client })
    }

    /// Quoted schema.identifier; postgres addresses stay within the connected database
    fn relation(address: &ObjectAddress) -> String {
        format!("\"{}\".\"{}\"", address.schema, address.identifier)
    }
}

#[async_trait]
impl StoreAdapter for PostgresStore {
    fn name(&self) -> &'static str {
        "Postgres"
    }

    async fn test_connection(&self) -> Result<(), StoreError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn relation_exists(&self, address: &ObjectAddress) -> Result<bool, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                )",
                &[&address.schema, &address.identifier],
            )
            .await
            .map_err(|e| StoreError::Statement(e.to_string()))?;
        Ok(row.get(0))
    }

    async fn create_view_as(&self, address: &ObjectAddress, sql: &str) -> Result<(), StoreError> {
        let statement = format!("CREATE OR REPLACE VIEW {} AS {}", Self::relation(address), sql);
        self.client
            .batch_execute(&statement)
            .await
            .map_err(|e| StoreError::Statement(e.to_string()))
    }

    async fn create_table_as(&self, address: &ObjectAddress, sql: &str) -> Result<(), StoreError> {
        let relation = Self::relation(address);
        let statement = format!(
            "DROP TABLE IF EXISTS {relation}; CREATE TABLE {relation} AS {sql}"
        );
        self.client
            .batch_execute(&statement)
            .await
            .map_err(|e| StoreError::Statement(e.to_string()))
    }

    async fn merge_rows(
        &self,
        address: &ObjectAddress,
        sql: &str,
        unique_key: &[String],
    ) -> Result<(), StoreError> {
        if unique_key.is_empty() {
            return Err(StoreError::Config(format!(
                "incremental merge into {} requires a unique key",
                address.fqn()
            )));
        }

        let relation = Self::relation(address);
        let key_list = unique_key
            .iter()
            .map(|k| format!("\"{}\"", k))
            .collect::<Vec<_>>()
            .join(", ");

        // Column list comes from the existing table so the SET clause can be
        // generated without parsing the statement.
        let columns: Vec<String> = self
            .client
            .query(
                "SELECT column_name FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&address.schema, &address.identifier],
            )
            .await
            .map_err(|e| StoreError::Statement(e.to_string()))?
            .into_iter()
            .map(|row| row.get::<_, String>(0))
            .collect();
        if columns.is_empty() {
            return Err(StoreError::ObjectNotFound(address.fqn()));
        }

        let column_list = columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let set_clause = columns
            .iter()
            .filter(|c| !unique_key.contains(c))
            .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");

        let action = if set_clause.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {set_clause}")
        };
        let statement = format!(
            "INSERT INTO {relation} ({column_list}) \
             SELECT {column_list} FROM ({sql}) AS incoming \
             ON CONFLICT ({key_list}) {action}"
        );

        self.client
            .batch_execute(&statement)
            .await
            .map_err(|e| StoreError::Statement(e.to_string()))
    }

    async fn drop_if_exists(&self, address: &ObjectAddress) -> Result<(), StoreError> {
        let relation = Self::relation(address);
        let statement = format!(
            "DROP TABLE IF EXISTS {relation}; DROP VIEW IF EXISTS {relation}"
        );
        self.client
            .batch_execute(&statement)
            .await
            .map_err(|e| StoreError::Statement(e.to_string()))
    }

    async fn fetch_rows(&self, address: &ObjectAddress) -> Result<Vec<Row>, StoreError> {
        let statement = format!(
            "SELECT row_to_json(t)::text FROM {} t",
            Self::relation(address)
        );
        let rows = self
            .client
            .query(&statement, &[])
            .await
            .map_err(|e| StoreError::Statement(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let text: String = row.get(0);
                serde_json::from_str::<Row>(&text)
                    .map_err(|e| StoreError::InvalidResponse(e.to_string()))
            })
            .collect()
    }

    async fn newest_timestamp(
        &self,
        address: &ObjectAddress,
        column: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let statement = format!(
            "SELECT to_char(max(\"{}\") AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS\"Z\"') FROM {}",
            column,
            Self::relation(address)
        );
        let row = self
            .client
            .query_one(&statement, &[])
            .await
            .map_err(|e| StoreError::Statement(e.to_string()))?;

        let text: Option<String> = row.get(0);
        match text {
            None => Ok(None),
            Some(value) => DateTime::parse_from_rfc3339(&value)
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(|e| StoreError::InvalidResponse(e.to_string())),
        }
    }
}
