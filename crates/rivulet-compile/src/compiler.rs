//! Model body compilation via template rendering

use minijinja::{context, Environment, Error as JinjaError, ErrorKind, Value};
use rivulet_core::{statement_fingerprint, Materialization, Model};
use rivulet_store::ObjectAddress;
use std::sync::Arc;

use crate::context::ResolutionContext;

/// A model compiled to executable statements
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledModel {
    /// Model name
    pub name: String,

    /// Address the model materializes into
    pub address: ObjectAddress,

    pub materialized: Materialization,

    pub unique_key: Vec<String>,

    /// Full-build statement (`is_incremental()` rendered false)
    pub build_sql: String,

    /// Merge-source statement (`is_incremental()` rendered true); present
    /// only for incremental models
    pub incremental_sql: Option<String>,

    /// Fingerprint of the full-build statement
    pub fingerprint: String,
}

/// Compilation errors; per-model, detected before any execution begins
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("failed to compile model '{model}': {message}")]
    Render { model: String, message: String },

    #[error("model '{model}' compiled to an empty statement")]
    Empty { model: String },

    #[error("model '{model}' is not declared in the resolution context")]
    UnknownModel { model: String },
}

/// Compiles model bodies against a resolution context
pub struct Compiler {
    context: Arc<ResolutionContext>,
    macro_prelude: String,
}

impl Compiler {
    pub fn new(context: ResolutionContext, macro_prelude: impl Into<String>) -> Self {
        Self {
            context: Arc::new(context),
            macro_prelude: macro_prelude.into(),
        }
    }

    /// Compile one model into its executable statement(s)
    pub fn compile(&self, model: &Model) -> Result<CompiledModel, CompileError> {
        let address = self
            .context
            .model_address(&model.name)
            .cloned()
            .ok_or_else(|| CompileError::UnknownModel {
                model: model.name.clone(),
            })?;

        let build_sql = self.render(model, &address, false)?;
        if build_sql.is_empty() {
            return Err(CompileError::Empty {
                model: model.name.clone(),
            });
        }

        let incremental_sql = if model.materialized == Materialization::Incremental {
            Some(self.render(model, &address, true)?)
        } else {
            None
        };

        Ok(CompiledModel {
            name: model.name.clone(),
            address,
            materialized: model.materialized,
            unique_key: model.unique_key.clone(),
            fingerprint: statement_fingerprint(&build_sql),
            build_sql,
            incremental_sql,
        })
    }

    fn render(
        &self,
        model: &Model,
        address: &ObjectAddress,
        is_incremental: bool,
    ) -> Result<String, CompileError> {
        let mut env = Environment::new();

        let resolver = Arc::clone(&self.context);
        env.add_function("ref", move |name: String| -> Result<Value, JinjaError> {
            resolver
                .model_address(&name)
                .map(|address| Value::from(address.fqn()))
                .ok_or_else(|| {
                    JinjaError::new(
                        ErrorKind::InvalidOperation,
                        format!("ref() to unknown model '{}'", name),
                    )
                })
        });

        let resolver = Arc::clone(&self.context);
        env.add_function(
            "source",
            move |source: String, table: String| -> Result<Value, JinjaError> {
                resolver
                    .source_address(&source, &table)
                    .map(|address| Value::from(address.fqn()))
                    .ok_or_else(|| {
                        JinjaError::new(
                            ErrorKind::InvalidOperation,
                            format!("source() to unknown source '{}.{}'", source, table),
                        )
                    })
            },
        );

        let resolver = Arc::clone(&self.context);
        env.add_function(
            "var",
            move |name: String, default: Option<Value>| -> Result<Value, JinjaError> {
                match resolver.var(&name) {
                    Some(value) => Ok(Value::from_serialize(value)),
                    None => default.ok_or_else(|| {
                        JinjaError::new(
                            ErrorKind::UndefinedError,
                            format!("var('{}') is not defined and has no default", name),
                        )
                    }),
                }
            },
        );

        let this_fqn = address.fqn();
        env.add_function("this", move || Value::from(this_fqn.clone()));

        env.add_function("is_incremental", move || is_incremental);

        let template = if self.macro_prelude.is_empty() {
            model.body.clone()
        } else {
            format!("{}\n{}", self.macro_prelude, model.body)
        };

        let rendered = env
            .render_str(
                &template,
                context! {
                    target => context! {
                        name => self.context.target_name.clone(),
                        database => self.context.database.clone(),
                        schema => self.context.schema.clone(),
                    },
                },
            )
            .map_err(|e| CompileError::Render {
                model: model.name.clone(),
                message: e.to_string(),
            })?;

        Ok(rendered.trim().to_string())
    }
}
