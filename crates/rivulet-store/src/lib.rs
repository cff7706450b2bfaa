//! Target-store seam
//!
//! The engine delegates all storage to the underlying relational store
//! through the [`StoreAdapter`] trait. `MemoryStore` is a programmable
//! backend for tests and dry runs; `PostgresStore` (feature `postgres`)
//! executes against a real database.

pub mod adapter;
pub mod address;
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use adapter::{Row, StoreAdapter, StoreError};
pub use address::ObjectAddress;
pub use memory::{MemoryStore, MemoryStoreBuilder};

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
