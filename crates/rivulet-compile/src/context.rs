//! Resolution context: the catalog of concrete object addresses
//!
//! Sibling models resolve each other's addresses through this context. It is
//! built once per run from the declarations and the active target, and
//! passed down explicitly so compilation stays pure and testable; there is
//! no ambient global catalog.

use rivulet_core::{Config, ConfigError, Project};
use rivulet_store::ObjectAddress;
use std::collections::{BTreeMap, HashMap};

/// Environment-qualified addresses for every declared relation
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    /// Active target name
    pub target_name: String,

    /// Target database
    pub database: String,

    /// Default target schema
    pub schema: String,

    /// model name -> address
    models: BTreeMap<String, ObjectAddress>,

    /// (source, table) -> address
    sources: BTreeMap<(String, String), ObjectAddress>,

    /// Project variables
    vars: HashMap<String, serde_json::Value>,
}

impl ResolutionContext {
    /// Build the context for a project against a named target
    pub fn build(project: &Project, target_name: &str) -> Result<Self, ConfigError> {
        let target = project.config.target(target_name)?;

        let mut models = BTreeMap::new();
        for model in &project.models {
            let schema = model.schema.as_deref().unwrap_or(&target.schema);
            models.insert(
                model.name.clone(),
                ObjectAddress::new(&target.database, schema, &model.name),
            );
        }

        let mut sources = BTreeMap::new();
        for source in &project.sources {
            let database = source.database.as_deref().unwrap_or(&target.database);
            sources.insert(
                (source.source.clone(), source.table.clone()),
                ObjectAddress::new(database, &source.schema, source.identifier()),
            );
        }

        Ok(Self {
            target_name: target_name.to_string(),
            database: target.database.clone(),
            schema: target.schema.clone(),
            models,
            sources,
            vars: project.vars.clone(),
        })
    }

    /// Build against the project's active target
    pub fn for_active_target(project: &Project) -> Result<Self, ConfigError> {
        let Config { project: settings, .. } = &project.config;
        let target = settings.target.clone();
        Self::build(project, &target)
    }

    pub fn model_address(&self, name: &str) -> Option<&ObjectAddress> {
        self.models.get(name)
    }

    pub fn source_address(&self, source: &str, table: &str) -> Option<&ObjectAddress> {
        self.sources.get(&(source.to_string(), table.to_string()))
    }

    pub fn var(&self, name: &str) -> Option<&serde_json::Value> {
        self.vars.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const PROJECT: &str = r#"
        [project]
        name = "analytics"
        target = "dev"

        [targets.dev]
        database = "analytics_dev"
        schema = "main"

        [targets.prod]
        database = "analytics"
        schema = "marts"

        [vars]
        start_date = "2020-01-01"

        [[sources]]
        source = "raw"
        table = "orders"
        database = "landing_db"
        schema = "landing"
        identifier = "orders_v2"

        [[models]]
        name = "stg_orders"
        layer = "staging"
        sql = "select 1"

        [[models]]
        name = "fct_orders"
        layer = "mart"
        schema = "marts"
        sql = "select 1"
    "#;

    fn project() -> Project {
        Project::from_toml(PROJECT, Path::new(".")).unwrap()
    }

    #[test]
    fn model_addresses_qualify_with_target() {
        let context = ResolutionContext::for_active_target(&project()).unwrap();

        assert_eq!(
            context.model_address("stg_orders").unwrap().fqn(),
            "analytics_dev.main.stg_orders"
        );
        // Per-model schema override wins over the target default.
        assert_eq!(
            context.model_address("fct_orders").unwrap().fqn(),
            "analytics_dev.marts.fct_orders"
        );
    }

    #[test]
    fn source_addresses_use_declared_location() {
        let context = ResolutionContext::for_active_target(&project()).unwrap();
        assert_eq!(
            context.source_address("raw", "orders").unwrap().fqn(),
            "landing_db.landing.orders_v2"
        );
    }

    #[test]
    fn target_switch_changes_addresses() {
        let context = ResolutionContext::build(&project(), "prod").unwrap();
        assert_eq!(
            context.model_address("stg_orders").unwrap().fqn(),
            "analytics.marts.stg_orders"
        );
    }

    #[test]
    fn unknown_target_is_config_error() {
        assert!(ResolutionContext::build(&project(), "qa").is_err());
    }

    #[test]
    fn vars_are_exposed() {
        let context = ResolutionContext::for_active_target(&project()).unwrap();
        assert_eq!(
            context.var("start_date"),
            Some(&serde_json::json!("2020-01-01"))
        );
    }
}
