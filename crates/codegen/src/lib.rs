//! specql-codegen: target emitters for compiled SpecQL actions.
//!
//! # Public API
//!
//! - [`TargetProfile`] -- what a backend expresses natively, plus its type map
//! - [`TargetEmitter`] / [`emitter_for()`] -- per-dialect emitters
//! - [`generate()`] -- emit a whole compiled batch with per-item isolation
//! - [`fallback`] -- lowerings for constructs a profile lacks
//! - [`PlPgSqlEmitter`] -- reference lowering to PL/pgSQL functions and DDL
//! - [`TypeScriptEmitter`] -- async TypeScript functions over a `Db` interface

pub mod emitter;
pub mod error;
pub mod fallback;
pub mod generate;
pub mod naming;
pub mod plpgsql;
pub mod profile;
pub mod sql;
pub mod typescript;
mod writer;

// ── Convenience re-exports: key types ────────────────────────────────

pub use emitter::{GeneratedArtifact, TargetEmitter};
pub use error::EmissionError;
pub use generate::{EmissionFailure, Generated};
pub use plpgsql::PlPgSqlEmitter;
pub use profile::{
    Capabilities, Dialect, ProfileOverrides, TargetProfile, TypeMap, BUILTIN_PROFILES,
};
pub use typescript::TypeScriptEmitter;

// ── Convenience re-exports: entry points ─────────────────────────────

pub use emitter::emitter_for;
pub use fallback::lower_switches;
pub use generate::generate;
