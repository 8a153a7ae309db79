//! Step compiler: walks an action's steps against the owning entity, the
//! entity index and the function catalog, producing a `CompiledAction` or
//! the complete list of diagnostics for that action.
//!
//! Scope layout while compiling one action:
//!
//! ```text
//! depth 0   owning entity fields (read-only, current record)
//! depth 1   action input parameters (read-only, may shadow fields)
//! depth 2   action body
//! depth 3+  nested blocks (branches, loop bodies, catch clauses, ...)
//! ```

mod control;
mod data;
pub(crate) mod expr;
mod query;

pub use expr::{is_builtin, BUILTIN_FUNCTIONS};
pub use query::entity_columns;

use crate::ast::{ActionSpec, EntitySpec, Step};
use crate::catalog::{Catalog, FunctionSignature};
use crate::compiled::{CompiledAction, CompiledCte, CompiledStep, EntityTarget, ReturnShape, TypedExpr};
use crate::diagnostic::{Diagnostic, DiagnosticCode, Diagnostics, Location, Severity, StepPath};
use crate::scope::{BindingMode, ScopeError, ScopeTable, SymbolId, SymbolKind};
use crate::types::{Column, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Unknown functions are fatal (unless the catalog is empty).
    pub strict: bool,
    pub warnings_as_errors: bool,
}

/// Compile one action of `entity`.
///
/// On failure the returned list holds every diagnostic of the action, not
/// just the first. Warnings of a successful compilation are kept on the
/// `CompiledAction`.
pub fn compile(
    action: &ActionSpec,
    entity: &EntitySpec,
    catalog: &Catalog<'_>,
    options: &CompileOptions,
) -> Result<CompiledAction, Diagnostics> {
    debug!(
        entity = %entity.name,
        action = %action.name,
        steps = action.steps.len(),
        "compiling action"
    );
    let mut compiler = Compiler::new(action, entity, *catalog, options);
    compiler.seed_root();
    let guard = action
        .requires
        .as_ref()
        .map(|g| compiler.compile_condition(g, None, "guard"));
    compiler.scopes.push();
    compiler.collect_cte_names(&action.steps);
    let block = compiler.compile_block(&action.steps);
    let return_shape = compiler.unify_return_shapes();
    compiler.finish(guard, block.steps, return_shape)
}

/// A compiled block of steps.
pub(crate) struct Block {
    pub steps: Vec<CompiledStep>,
    /// Every path through the block ends in a return.
    pub terminates: bool,
}

pub(crate) struct PendingCte {
    pub cte: CompiledCte,
    pub path: StepPath,
}

struct ShapeRecord {
    fields: Vec<Column>,
    path: StepPath,
}

pub(crate) struct Compiler<'a> {
    pub(crate) entity: &'a EntitySpec,
    pub(crate) action: &'a ActionSpec,
    pub(crate) catalog: Catalog<'a>,
    options: &'a CompileOptions,
    pub(crate) scopes: ScopeTable,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) path: StepPath,
    /// CTEs waiting for the next query-family step of the current block.
    pub(crate) pending_ctes: Vec<PendingCte>,
    /// Every CTE name defined anywhere in the action.
    pub(crate) cte_names: BTreeSet<String>,
    returns: Vec<ShapeRecord>,
    params: Vec<SymbolId>,
    fields: Vec<SymbolId>,
    pub(crate) uses_current_record: bool,
    warned_empty_catalog: bool,
}

impl<'a> Compiler<'a> {
    pub(crate) fn new(
        action: &'a ActionSpec,
        entity: &'a EntitySpec,
        catalog: Catalog<'a>,
        options: &'a CompileOptions,
    ) -> Self {
        Compiler {
            entity,
            action,
            catalog,
            options,
            scopes: ScopeTable::new(),
            diagnostics: Diagnostics::new(),
            path: StepPath::default(),
            pending_ctes: Vec::new(),
            cte_names: BTreeSet::new(),
            returns: Vec::new(),
            params: Vec::new(),
            fields: Vec::new(),
            uses_current_record: false,
            warned_empty_catalog: false,
        }
    }

    /// Declare entity fields in the root frame and parameters in a frame
    /// above it.
    pub(crate) fn seed_root(&mut self) {
        for field in &self.entity.fields {
            let mode = BindingMode {
                mutable: false,
                nullable: !field.required,
                kind: SymbolKind::EntityField,
            };
            let id = self.declare(&field.name, ValueType::scalar(field.ty.clone()), mode);
            self.fields.push(id);
        }
        self.scopes.push();
        for param in &self.action.inputs {
            let mode = BindingMode {
                mutable: false,
                nullable: !param.required,
                kind: SymbolKind::Param,
            };
            let id = self.declare(&param.name, ValueType::scalar(param.ty.clone()), mode);
            self.params.push(id);
        }
    }

    // ──────────────────────────────────────────────
    // Diagnostics
    // ──────────────────────────────────────────────

    fn location(&self, step: StepPath) -> Location {
        Location {
            entity: self.entity.name.clone(),
            action: Some(self.action.name.clone()),
            step,
        }
    }

    pub(crate) fn report(&mut self, code: DiagnosticCode, message: impl Into<String>) {
        let path = self.path.clone();
        self.report_at(code, path, message);
    }

    pub(crate) fn report_at(
        &mut self,
        code: DiagnosticCode,
        path: StepPath,
        message: impl Into<String>,
    ) {
        let diagnostic = Diagnostic::new(code, self.location(path), message);
        trace!(%diagnostic, "diagnostic");
        self.diagnostics.push(diagnostic);
    }

    pub(crate) fn report_scope(&mut self, err: ScopeError) {
        let code = match &err {
            ScopeError::DuplicateDeclaration { .. } => DiagnosticCode::DuplicateDeclaration,
            // the compiler never pops the root frame
            ScopeError::UnknownVariable { .. } | ScopeError::PopRootFrame => {
                DiagnosticCode::UnknownVariable
            }
        };
        self.report(code, err.to_string());
    }

    // ──────────────────────────────────────────────
    // Scope helpers
    // ──────────────────────────────────────────────

    /// Declare into the current frame. A duplicate is reported and the
    /// existing symbol is reused so that checking can continue.
    pub(crate) fn declare(&mut self, name: &str, ty: ValueType, mode: BindingMode) -> SymbolId {
        match self.scopes.declare_with(name, ty, mode) {
            Ok(id) => id,
            Err(err) => {
                self.report_scope(err);
                self.scopes
                    .resolve(name)
                    .map(|s| s.id)
                    .unwrap_or(SymbolId(0))
            }
        }
    }

    pub(crate) fn owning_target(&self) -> EntityTarget {
        EntityTarget::from(self.entity)
    }

    // ──────────────────────────────────────────────
    // Blocks
    // ──────────────────────────────────────────────

    /// Compile a sequence of steps in the current frame. Step paths are
    /// `self.path` extended with each step's index.
    pub(crate) fn compile_block(&mut self, steps: &[Step]) -> Block {
        let outer_ctes = std::mem::take(&mut self.pending_ctes);
        let prefix = self.path.clone();
        let mut out = Vec::with_capacity(steps.len());
        let mut terminates = false;
        let mut reported_unreachable = false;
        for (i, step) in steps.iter().enumerate() {
            self.path = prefix.child(i);
            if terminates && !reported_unreachable {
                self.report(
                    DiagnosticCode::UnreachableCode,
                    format!("'{}' step is unreachable", step.kind()),
                );
                reported_unreachable = true;
            }
            trace!(path = %self.path, kind = step.kind(), "compile step");
            let (compiled, ends) = self.compile_step(step);
            out.extend(compiled);
            terminates |= ends;
        }
        for pending in std::mem::take(&mut self.pending_ctes) {
            self.report_at(
                DiagnosticCode::UnusedCte,
                pending.path,
                format!("CTE '{}' is not used by any following query", pending.cte.name),
            );
        }
        self.pending_ctes = outer_ctes;
        self.path = prefix;
        Block {
            steps: out,
            terminates,
        }
    }

    /// Compile block number `index` of the current step in a fresh frame.
    /// `bind` runs inside the new frame before the steps, to declare
    /// iterators and implicit bindings.
    pub(crate) fn nested<T>(
        &mut self,
        index: usize,
        steps: &[Step],
        bind: impl FnOnce(&mut Self) -> T,
    ) -> (T, Block) {
        let step_path = self.path.clone();
        let depth = self.scopes.depth();
        self.scopes.push();
        let bound = bind(self);
        self.path = step_path.child(index);
        let block = self.compile_block(steps);
        self.scopes.truncate(depth);
        self.path = step_path;
        (bound, block)
    }

    pub(crate) fn compile_nested(&mut self, index: usize, steps: &[Step]) -> Block {
        self.nested(index, steps, |_| ()).1
    }

    /// Returns the compiled step (CTEs produce none) and whether it ends
    /// every path through it.
    fn compile_step(&mut self, step: &Step) -> (Option<CompiledStep>, bool) {
        let compiled = match step {
            Step::Declare {
                name,
                ty,
                init,
                mutable,
                nullable,
            } => self.compile_declare(name, ty.as_ref(), init.as_ref(), *mutable, *nullable),
            Step::Assign { target, value } => self.compile_assign(target, value),
            Step::Query {
                into,
                query,
                single,
            } => self.compile_query_step(into, query, *single),
            Step::Insert {
                entity,
                values,
                into,
            } => self.compile_insert(entity, values, into.as_deref()),
            Step::Update {
                entity,
                set,
                filter,
            } => self.compile_update(entity, set, filter.as_ref()),
            Step::Delete { entity, filter } => self.compile_delete(entity, filter.as_ref()),
            Step::Validate {
                condition,
                failure_code,
                message,
            } => self.compile_validate(condition, failure_code, message.as_deref()),
            Step::If {
                branches,
                else_steps,
            } => return self.compile_if(branches, else_steps.as_deref()),
            Step::Switch {
                subject,
                cases,
                default,
            } => return self.compile_switch(subject, cases, default.as_deref()),
            Step::While { condition, body } => self.compile_while(condition, body),
            Step::ForQuery {
                iterator,
                query,
                body,
            } => self.compile_for_query(iterator, query, body),
            Step::Cte {
                name,
                recursive,
                columns,
                base,
                recursive_term,
            } => {
                self.compile_cte(name, *recursive, columns, base, recursive_term.as_ref());
                return (None, false);
            }
            Step::Aggregate {
                into,
                function,
                source,
                field,
                filter,
            } => self.compile_aggregate(into, *function, source, field.as_deref(), filter.as_ref()),
            Step::JsonBuild { into, entries } => self.compile_json_build(into, entries),
            Step::ArrayBuild { into, elements } => self.compile_array_build(into, elements),
            Step::Transform {
                into,
                source,
                filter,
                mapping,
            } => self.compile_transform(into, source, filter.as_ref(), mapping),
            Step::Upsert {
                entity,
                values,
                conflict,
                into,
            } => self.compile_upsert(entity, values, conflict, into.as_deref()),
            Step::BatchOperation {
                entity,
                operation,
                items,
                iterator,
                values,
                filter,
            } => self.compile_batch_operation(
                entity,
                *operation,
                items,
                iterator,
                values,
                filter.as_ref(),
            ),
            Step::CallFunction {
                function,
                args,
                into,
            } => self.compile_call_function(function, args, into.as_deref()),
            Step::ReturnEarly { payload } => {
                let result = self.compile_return_payload(payload);
                return (Some(CompiledStep::ReturnEarly { result }), true);
            }
            Step::Return { payload } => {
                let result = self.compile_return_payload(payload);
                return (Some(CompiledStep::Return { result }), true);
            }
            Step::TryCatch { body, catches } => return self.compile_try_catch(body, catches),
            Step::Cursor { name, query } => self.compile_cursor(name, query),
            Step::ForeachCursor {
                cursor,
                iterator,
                body,
            } => self.compile_foreach_cursor(cursor, iterator, body),
            Step::Notify { channel, payload } => self.compile_notify(channel, payload),
            Step::CallService {
                service,
                operation,
                input,
                into,
            } => self.compile_call_service(service, operation, input, into.as_deref()),
        };
        (Some(compiled), false)
    }

    // ──────────────────────────────────────────────
    // Function catalog
    // ──────────────────────────────────────────────

    /// Look up a catalog function, reporting an unknown one. Unknown
    /// functions are fatal only in strict mode with a non-empty catalog.
    pub(crate) fn lookup_function(&mut self, name: &str) -> Option<FunctionSignature> {
        if let Some(sig) = self.catalog.functions.lookup(name) {
            return Some(sig.clone());
        }
        let empty = self.catalog.functions.is_empty();
        if empty && !self.warned_empty_catalog {
            warn!(
                entity = %self.entity.name,
                action = %self.action.name,
                "function catalog is empty; function calls are not validated"
            );
            self.warned_empty_catalog = true;
        }
        let mut diagnostic = Diagnostic::new(
            DiagnosticCode::UnknownFunctionWarning,
            self.location(self.path.clone()),
            format!("unknown function '{}'", name),
        );
        if self.options.strict && !empty {
            diagnostic.severity = Severity::Error;
        }
        self.diagnostics.push(diagnostic);
        None
    }

    // ──────────────────────────────────────────────
    // Return shapes
    // ──────────────────────────────────────────────

    pub(crate) fn record_return_shape(&mut self, fields: Vec<Column>) {
        self.returns.push(ShapeRecord {
            fields,
            path: self.path.clone(),
        });
    }

    /// Compare every recorded return payload against the first one.
    fn unify_return_shapes(&mut self) -> ReturnShape {
        let records = std::mem::take(&mut self.returns);
        let Some(first) = records.first() else {
            return ReturnShape::default();
        };
        let expected: BTreeSet<&str> = first.fields.iter().map(|c| c.name.as_str()).collect();
        let mut fields = first.fields.clone();
        for record in records.iter().skip(1) {
            let names: BTreeSet<&str> = record.fields.iter().map(|c| c.name.as_str()).collect();
            if names != expected {
                let message = format!(
                    "return payload has fields [{}] but step {} returns [{}]",
                    names.iter().copied().collect::<Vec<_>>().join(", "),
                    first.path,
                    expected.iter().copied().collect::<Vec<_>>().join(", "),
                );
                self.report_at(
                    DiagnosticCode::InconsistentReturnShape,
                    record.path.clone(),
                    message,
                );
                continue;
            }
            for col in &record.fields {
                if let Some(f) = fields.iter_mut().find(|f| f.name == col.name) {
                    f.ty = f.ty.unify(&col.ty).unwrap_or(ValueType::Dynamic);
                }
            }
        }
        ReturnShape { fields }
    }

    fn finish(
        mut self,
        guard: Option<TypedExpr>,
        body: Vec<CompiledStep>,
        return_shape: ReturnShape,
    ) -> Result<CompiledAction, Diagnostics> {
        if self.options.warnings_as_errors {
            self.diagnostics.escalate_warnings();
        }
        if self.diagnostics.has_errors() {
            debug!(
                entity = %self.entity.name,
                action = %self.action.name,
                errors = self.diagnostics.errors().count(),
                "action failed to compile"
            );
            return Err(self.diagnostics);
        }
        let entity = self.owning_target();
        let symbols = self.scopes.into_symbols();
        debug!(
            entity = %entity.name,
            action = %self.action.name,
            symbols = symbols.len(),
            warnings = self.diagnostics.len(),
            "action compiled"
        );
        Ok(CompiledAction {
            entity,
            action: self.action.name.clone(),
            symbols,
            params: self.params,
            fields: self.fields,
            guard,
            body,
            return_shape,
            uses_current_record: self.uses_current_record,
            diagnostics: self.diagnostics,
        })
    }
}
