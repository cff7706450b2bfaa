//! Concrete object addresses in the target store

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a materialized object (table or view) in the target store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectAddress {
    /// Database name
    pub database: String,

    /// Schema name
    pub schema: String,

    /// Table/view name
    pub identifier: String,
}

impl ObjectAddress {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            identifier: identifier.into(),
        }
    }

    /// Fully qualified name as it appears in statements
    pub fn fqn(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.identifier)
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fqn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqn_formatting() {
        let address = ObjectAddress::new("analytics_dev", "main", "stg_orders");
        assert_eq!(address.fqn(), "analytics_dev.main.stg_orders");
        assert_eq!(address.to_string(), "analytics_dev.main.stg_orders");
    }
}
