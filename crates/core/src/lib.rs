//! specql-core: SpecQL action model and step compiler.
//!
//! Turns the actions of declarative entity specifications into validated,
//! scope-resolved, type-annotated [`CompiledAction`]s ready for a target
//! emitter.
//!
//! # Public API
//!
//! - [`compile()`] -- compile one action against its entity and a [`Catalog`]
//! - [`compile_batch()`] -- compile every action of a set of entities, with
//!   per-action fault isolation
//! - [`build_index()`] / [`Index`] -- entity lookup index
//! - [`FunctionCatalog`] -- read-only registry of callable functions
//! - [`ScopeTable`] -- lexical scope stack used by the compiler
//! - [`Diagnostics`] -- compile-time findings with entity/action/step location
//! - AST types in [`ast`], compiled IR in [`compiled`]

pub mod ast;
pub mod batch;
pub mod bundle;
pub mod catalog;
pub mod compiled;
pub mod compiler;
pub mod diagnostic;
pub mod scope;
pub mod types;

// ── Convenience re-exports: key types ────────────────────────────────

pub use ast::{ActionSpec, EntitySpec, Expr, FieldSpec, SemanticType, Step};
pub use bundle::{Bundle, BundleError};
pub use catalog::{Catalog, FunctionCatalog, FunctionSignature, Index, StaticCatalog};
pub use compiled::{CompiledAction, CompiledStep, TypedExpr};
pub use diagnostic::{Diagnostic, DiagnosticCode, Diagnostics, Location, Severity};
pub use scope::{ScopeError, ScopeTable, Symbol, SymbolId, SymbolKind};
pub use types::ValueType;

// ── Convenience re-exports: entry points ─────────────────────────────

pub use batch::{compile_batch, compile_batch_cancellable, ActionOutput, BatchOutput};
pub use catalog::build_index;
pub use compiler::{compile, entity_columns, CompileOptions};
