//! Reference compiler
//!
//! Rewrites the reference markers and macro fragments in each model body into
//! one executable statement with concrete, environment-qualified object
//! names. Compilation is a pure function of (model, resolution context); it
//! never touches the store.

pub mod compiler;
pub mod context;

pub use compiler::{CompileError, CompiledModel, Compiler};
pub use context::ResolutionContext;
