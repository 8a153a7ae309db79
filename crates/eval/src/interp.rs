//! Step interpreter for compiled actions.
//!
//! Mirrors what the generated PL/pgSQL does: the action runs as one
//! transaction that rolls back on an uncaught error, each `TryCatch` body
//! runs in a subtransaction, and every path ends in a structured result.

use crate::error::RuntimeError;
use crate::functions::FunctionRegistry;
use crate::query::Ctes;
use crate::store::Database;
use crate::value::{Row, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use specql_core::ast::{BatchKind, CatchTarget};
use specql_core::compiled::{
    CompiledAction, CompiledCatch, CompiledEntry, CompiledFieldValue, CompiledStep, EntityTarget,
    MutationFilter, QueryInto, ReturnValue, TypedExpr,
};
use specql_core::scope::{Symbol, SymbolId};
use specql_core::types::ValueType;
use tracing::{debug, trace};

/// Iterations a `While` loop may run before it is considered runaway.
pub const WHILE_ITERATION_LIMIT: usize = 100_000;

/// Arguments of one invocation: the record it runs on and the input
/// parameters by name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Inputs {
    #[serde(default)]
    pub record_id: Option<String>,
    #[serde(default)]
    pub values: serde_json::Map<String, Json>,
}

impl Inputs {
    pub fn new() -> Self {
        Inputs::default()
    }

    pub fn record(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn set(mut self, name: impl Into<String>, value: Json) -> Self {
        self.values.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub channel: String,
    pub payload: Json,
}

/// A queued external service call (a row in the job table).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCall {
    pub job_id: String,
    pub service: String,
    pub operation: String,
    pub input: Json,
}

/// The structured result of an action plus the side effects that committed
/// with it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub status: String,
    pub message: Option<String>,
    pub fields: serde_json::Map<String, Json>,
    pub notifications: Vec<Notification>,
    pub service_calls: Vec<ServiceCall>,
}

impl ActionOutcome {
    pub fn field(&self, key: &str) -> Option<&Json> {
        self.fields.get(key)
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// A result produced by `Return`, `ReturnEarly`, a failed validation or a
/// failed guard.
#[derive(Debug, Clone, PartialEq)]
struct Returned {
    status: String,
    message: Option<String>,
    fields: serde_json::Map<String, Json>,
}

impl Returned {
    fn status(status: &str) -> Self {
        Returned {
            status: status.to_owned(),
            message: None,
            fields: serde_json::Map::new(),
        }
    }
}

enum Flow {
    Next,
    Return(Returned),
}

/// Run `compiled` against `db`. On error every change the action made is
/// rolled back.
pub fn evaluate(
    compiled: &CompiledAction,
    db: &mut Database,
    inputs: &Inputs,
    functions: &FunctionRegistry,
) -> Result<ActionOutcome, RuntimeError> {
    if compiled.diagnostics.has_errors() {
        return Err(RuntimeError::invalid(format!(
            "'{}.{}' has compile errors",
            compiled.entity.name, compiled.action
        )));
    }
    debug!(entity = %compiled.entity.name, action = %compiled.action, "evaluating action");
    let saved = db.snapshot();
    let result = Machine::start(compiled, &mut *db, inputs, functions).and_then(Machine::run);
    match &result {
        Ok(outcome) => debug!(status = %outcome.status, "action finished"),
        Err(err) => {
            debug!(error = %err, "action failed, rolling back");
            db.restore(saved);
        }
    }
    result
}

pub(crate) struct Machine<'a> {
    pub(crate) compiled: &'a CompiledAction,
    pub(crate) db: &'a mut Database,
    pub(crate) functions: &'a FunctionRegistry,
    pub(crate) record: Option<String>,
    slots: Vec<Value>,
    notifications: Vec<Notification>,
    service_calls: Vec<ServiceCall>,
}

impl<'a> Machine<'a> {
    fn start(
        compiled: &'a CompiledAction,
        db: &'a mut Database,
        inputs: &Inputs,
        functions: &'a FunctionRegistry,
    ) -> Result<Self, RuntimeError> {
        if compiled.uses_current_record && inputs.record_id.is_none() {
            return Err(RuntimeError::MissingInput { name: "id".into() });
        }
        let mut machine = Machine {
            compiled,
            db,
            functions,
            record: inputs.record_id.clone(),
            slots: vec![Value::Null; compiled.symbols.len()],
            notifications: Vec::new(),
            service_calls: Vec::new(),
        };
        for id in &compiled.params {
            let symbol = machine.symbol(*id)?;
            let value = match inputs.values.get(&symbol.name) {
                Some(json) => Value::from_json(json),
                None if symbol.nullable => Value::Null,
                None => {
                    return Err(RuntimeError::MissingInput {
                        name: symbol.name.clone(),
                    })
                }
            };
            machine.store(*id, value)?;
        }
        Ok(machine)
    }

    fn run(mut self) -> Result<ActionOutcome, RuntimeError> {
        let compiled = self.compiled;
        let returned = match &compiled.guard {
            Some(guard) if !self.eval(guard, &[])?.is_true()? => Returned::status("forbidden"),
            _ => match self.block(&compiled.body)? {
                Flow::Return(returned) => returned,
                Flow::Next => Returned::status("success"),
            },
        };
        Ok(ActionOutcome {
            status: returned.status,
            message: returned.message,
            fields: returned.fields,
            notifications: self.notifications,
            service_calls: self.service_calls,
        })
    }

    // ──────────────────────────────────────────────
    // Slots
    // ──────────────────────────────────────────────

    pub(crate) fn symbol(&self, id: SymbolId) -> Result<&'a Symbol, RuntimeError> {
        let compiled: &'a CompiledAction = self.compiled;
        compiled
            .symbols
            .iter()
            .nth(id.index())
            .ok_or_else(|| RuntimeError::invalid(format!("unknown symbol #{}", id.0)))
    }

    pub(crate) fn slot(&self, id: SymbolId) -> Result<Value, RuntimeError> {
        self.slots
            .get(id.index())
            .cloned()
            .ok_or_else(|| RuntimeError::invalid(format!("unknown symbol #{}", id.0)))
    }

    /// Assign with the cast PL/pgSQL applies to a typed variable.
    fn store(&mut self, id: SymbolId, value: Value) -> Result<(), RuntimeError> {
        let value = match &self.symbol(id)?.ty {
            ValueType::Scalar { ty } => value.coerce(ty)?,
            _ => value,
        };
        match self.slots.get_mut(id.index()) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::invalid(format!("unknown symbol #{}", id.0))),
        }
    }

    fn store_into(&mut self, into: Option<SymbolId>, value: Value) -> Result<(), RuntimeError> {
        match into {
            Some(id) => self.store(id, value),
            None => Ok(()),
        }
    }

    // ──────────────────────────────────────────────
    // Steps
    // ──────────────────────────────────────────────

    fn block(&mut self, steps: &[CompiledStep]) -> Result<Flow, RuntimeError> {
        for step in steps {
            if let Flow::Return(returned) = self.step(step)? {
                return Ok(Flow::Return(returned));
            }
        }
        Ok(Flow::Next)
    }

    fn step(&mut self, step: &CompiledStep) -> Result<Flow, RuntimeError> {
        match step {
            CompiledStep::Declare { symbol, init } => {
                let value = match init {
                    Some(e) => self.eval(e, &[])?,
                    None => Value::Null,
                };
                self.store(*symbol, value)?;
            }
            CompiledStep::Assign { target, value } => {
                let value = self.eval(value, &[])?;
                self.store(*target, value)?;
            }
            CompiledStep::Query {
                into,
                query,
                single,
            } => {
                let rows = self.select_rows(query, &Ctes::new())?;
                let targets = into.symbols();
                let context = || format!("{}.{}", self.compiled.entity.name, self.compiled.action);
                if *single && rows.len() > 1 {
                    return Err(RuntimeError::TooManyRows { context: context() });
                }
                let all_nullable = targets
                    .iter()
                    .map(|id| self.symbol(*id).map(|s| s.nullable))
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .all(|n| n);
                if *single && rows.is_empty() && !all_nullable {
                    return Err(RuntimeError::NoDataFound { context: context() });
                }
                self.bind_row(into, rows.into_iter().next())?;
            }
            CompiledStep::Insert {
                entity,
                values,
                into,
            } => {
                let row = self.field_values(values, &[])?;
                let id = self.db.insert_row(&entity.name, row)?;
                self.store_into(*into, Value::Text(id))?;
            }
            CompiledStep::Update {
                entity,
                set,
                filter,
            } => self.update_matching(entity, set, filter)?,
            CompiledStep::Delete { entity, filter } => self.delete_matching(entity, filter)?,
            CompiledStep::Validate { condition, failure } => {
                // a NULL condition fails, like `IF NOT (cond) IS TRUE`
                if !self.eval(condition, &[])?.is_true()? {
                    return Ok(Flow::Return(self.resolve(failure)?));
                }
            }
            CompiledStep::If {
                branches,
                else_body,
            } => {
                for branch in branches {
                    if self.eval(&branch.condition, &[])?.is_true()? {
                        return self.block(&branch.body);
                    }
                }
                if let Some(body) = else_body {
                    return self.block(body);
                }
            }
            CompiledStep::Switch {
                subject,
                cases,
                default,
            } => {
                let subject = self.eval(subject, &[])?;
                for case in cases {
                    for literal in &case.values {
                        if subject.sql_eq(&Value::from_literal(literal))? == Some(true) {
                            return self.block(&case.body);
                        }
                    }
                }
                if let Some(body) = default {
                    return self.block(body);
                }
            }
            CompiledStep::While { condition, body } => {
                let mut iterations = 0;
                while self.eval(condition, &[])?.is_true()? {
                    iterations += 1;
                    if iterations > WHILE_ITERATION_LIMIT {
                        return Err(RuntimeError::IterationLimit {
                            construct: "while loop",
                            limit: WHILE_ITERATION_LIMIT,
                        });
                    }
                    if let Flow::Return(r) = self.block(body)? {
                        return Ok(Flow::Return(r));
                    }
                }
            }
            CompiledStep::ForQuery {
                iterator,
                query,
                body,
            } => {
                let rows = self.select_rows(query, &Ctes::new())?;
                return self.each_row(*iterator, rows, body);
            }
            CompiledStep::Aggregate {
                into,
                function,
                argument,
                query,
            } => {
                let value = self.aggregate(*function, argument.as_ref(), query)?;
                self.store(*into, value)?;
            }
            CompiledStep::JsonBuild { into, entries } => {
                let object = self.object(entries, &[])?;
                self.store(*into, Value::Json(object))?;
            }
            CompiledStep::ArrayBuild { into, elements } => {
                let items = elements
                    .iter()
                    .map(|e| self.eval(e, &[]))
                    .collect::<Result<Vec<_>, _>>()?;
                self.store(*into, Value::Array(items))?;
            }
            CompiledStep::Transform {
                into,
                query,
                mapping,
            } => {
                let value = self.transform(query, mapping)?;
                self.store(*into, value)?;
            }
            CompiledStep::Upsert {
                entity,
                values,
                conflict,
                into,
            } => {
                let id = self.upsert(entity, values, conflict)?;
                self.store_into(*into, id)?;
            }
            CompiledStep::BatchOperation {
                entity,
                operation,
                items,
                iterator,
                values,
                filter,
            } => self.batch(entity, *operation, items, *iterator, values, filter.as_ref())?,
            CompiledStep::CallFunction {
                function,
                args,
                into,
            } => {
                let args = args
                    .iter()
                    .map(|a| Ok((a.key.clone(), self.eval(&a.value, &[])?)))
                    .collect::<Result<Vec<_>, RuntimeError>>()?;
                let value = self.functions.call_named(function, &args)?;
                self.store_into(*into, value)?;
            }
            CompiledStep::ReturnEarly { result } | CompiledStep::Return { result } => {
                return Ok(Flow::Return(self.resolve(result)?));
            }
            CompiledStep::TryCatch { body, catches } => return self.try_catch(body, catches),
            CompiledStep::Cursor { symbol, query } => {
                let rows = self.select_rows(query, &Ctes::new())?;
                self.store(*symbol, Value::Cursor { rows, position: 0 })?;
            }
            CompiledStep::ForeachCursor {
                cursor,
                iterator,
                body,
            } => {
                while let Some(row) = self.fetch(*cursor)? {
                    self.store(*iterator, Value::Row(row))?;
                    if let Flow::Return(r) = self.block(body)? {
                        return Ok(Flow::Return(r));
                    }
                }
            }
            CompiledStep::Notify { channel, payload } => {
                let payload = self.object(payload, &[])?;
                trace!(channel = %channel, "notification queued");
                self.notifications.push(Notification {
                    channel: channel.clone(),
                    payload,
                });
            }
            CompiledStep::CallService {
                service,
                operation,
                input,
                into,
            } => {
                let input = self.object(input, &[])?;
                let job_id = self.db.next_uuid();
                self.service_calls.push(ServiceCall {
                    job_id: job_id.clone(),
                    service: service.clone(),
                    operation: operation.clone(),
                    input,
                });
                self.store_into(*into, Value::Text(job_id))?;
            }
        }
        Ok(Flow::Next)
    }

    fn each_row(&mut self, iterator: SymbolId, rows: Vec<Row>, body: &[CompiledStep]) -> Result<Flow, RuntimeError> {
        for row in rows {
            self.store(iterator, Value::Row(row))?;
            if let Flow::Return(r) = self.block(body)? {
                return Ok(Flow::Return(r));
            }
        }
        Ok(Flow::Next)
    }

    fn bind_row(&mut self, into: &QueryInto, row: Option<Row>) -> Result<(), RuntimeError> {
        match into {
            QueryInto::Row { symbol } => self.store(*symbol, row.map(Value::Row).unwrap_or_default()),
            QueryInto::Columns { symbols } => {
                let values: Vec<Value> = row.map(|r| r.values().cloned().collect()).unwrap_or_default();
                for (i, id) in symbols.iter().enumerate() {
                    self.store(*id, values.get(i).cloned().unwrap_or_default())?;
                }
                Ok(())
            }
        }
    }

    fn fetch(&mut self, cursor: SymbolId) -> Result<Option<Row>, RuntimeError> {
        match self.slots.get_mut(cursor.index()) {
            Some(Value::Cursor { rows, position }) => {
                let row = rows.get(*position).cloned();
                *position += 1;
                Ok(row)
            }
            Some(Value::Null) => Ok(None),
            _ => Err(RuntimeError::invalid(format!("symbol #{} is not a cursor", cursor.0))),
        }
    }

    /// Errors raised in `body` roll back its changes and go to the first
    /// clause, in declared order, that is `default` or names their kind.
    /// A return from inside the body is not an error and leaves the block
    /// normally.
    fn try_catch(&mut self, body: &[CompiledStep], catches: &[CompiledCatch]) -> Result<Flow, RuntimeError> {
        let saved = self.db.snapshot();
        let notified = self.notifications.len();
        let called = self.service_calls.len();
        let err = match self.block(body) {
            Ok(flow) => return Ok(flow),
            Err(err) => err,
        };
        let kind = err.kind();
        let clause = catches
            .iter()
            .find(|c| match &c.on {
                CatchTarget::Default => true,
                CatchTarget::Kind(k) => *k == kind,
            });
        let Some(clause) = clause else {
            return Err(err);
        };
        debug!(kind = ?kind, error = %err, "exception caught");
        self.db.restore(saved);
        self.notifications.truncate(notified);
        self.service_calls.truncate(called);
        self.store(clause.error_message, Value::Text(err.to_string()))?;
        self.block(&clause.body)
    }

    // ──────────────────────────────────────────────
    // Mutations
    // ──────────────────────────────────────────────

    /// Cast each value to its field type, as the target column would.
    fn field_values(&self, values: &[CompiledFieldValue], frame: &[(String, Row)]) -> Result<Row, RuntimeError> {
        let mut row = Row::new();
        for value in values {
            let v = self.eval(&value.value, frame)?.coerce(&value.ty)?;
            row.set(value.field.clone(), v);
        }
        Ok(row)
    }

    fn object(&self, entries: &[CompiledEntry], frame: &[(String, Row)]) -> Result<Json, RuntimeError> {
        let mut object = serde_json::Map::new();
        for entry in entries {
            object.insert(entry.key.clone(), self.eval(&entry.value, frame)?.to_json());
        }
        Ok(Json::Object(object))
    }

    /// Indexes and current values of the rows a filter selects.
    fn matching(&self, entity: &EntityTarget, filter: &MutationFilter) -> Result<Vec<(usize, Row)>, RuntimeError> {
        let mut out = Vec::new();
        for (index, stored) in self.db.stored_rows(&entity.name)?.iter().enumerate() {
            let keep = match filter {
                MutationFilter::All => true,
                MutationFilter::CurrentRecord => {
                    matches!((stored.values.get("id"), &self.record), (Some(Value::Text(id)), Some(r)) if id == r)
                }
                MutationFilter::Where { condition } => self
                    .eval(condition, &[(entity.name.clone(), stored.values.clone())])?
                    .is_true()?,
            };
            if keep {
                out.push((index, stored.values.clone()));
            }
        }
        Ok(out)
    }

    /// New values are computed from every row's old values before any
    /// row is written.
    fn update_matching(
        &mut self,
        entity: &EntityTarget,
        set: &[CompiledFieldValue],
        filter: &MutationFilter,
    ) -> Result<(), RuntimeError> {
        let mut updated = Vec::new();
        for (index, old) in self.matching(entity, filter)? {
            let frame = [(entity.name.clone(), old.clone())];
            let changes = self.field_values(set, &frame)?;
            let mut row = old;
            for (field, value) in changes.iter() {
                row.set(field, value.clone());
            }
            updated.push((index, row));
        }
        trace!(entity = %entity.name, rows = updated.len(), "update");
        for (index, row) in updated {
            self.db.replace_row(&entity.name, index, row)?;
        }
        Ok(())
    }

    fn delete_matching(&mut self, entity: &EntityTarget, filter: &MutationFilter) -> Result<(), RuntimeError> {
        let indexes: Vec<usize> = self.matching(entity, filter)?.into_iter().map(|(i, _)| i).collect();
        self.db.delete_rows(&entity.name, &indexes)
    }

    /// `INSERT .. ON CONFLICT (conflict) DO UPDATE`; with nothing to
    /// update the conflict is ignored and no id comes back.
    fn upsert(&mut self, entity: &EntityTarget, values: &[CompiledFieldValue], conflict: &[String]) -> Result<Value, RuntimeError> {
        let row = self.field_values(values, &[])?;
        let mut existing = None;
        for (index, stored) in self.db.stored_rows(&entity.name)?.iter().enumerate() {
            let mut all_equal = true;
            for field in conflict {
                let new = row.get(field).cloned().unwrap_or_default();
                let old = stored.values.get(field).cloned().unwrap_or_default();
                if new.sql_eq(&old)? != Some(true) {
                    all_equal = false;
                    break;
                }
            }
            if all_equal {
                existing = Some((index, stored.values.clone()));
                break;
            }
        }
        let Some((index, mut current)) = existing else {
            return self.db.insert_row(&entity.name, row).map(Value::Text);
        };
        let updates: Vec<(&str, &Value)> = row.iter().filter(|(f, _)| !conflict.iter().any(|c| c == f)).collect();
        if updates.is_empty() {
            return Ok(Value::Null);
        }
        for (field, value) in updates {
            current.set(field, value.clone());
        }
        let id = current.get("id").cloned().unwrap_or_default();
        self.db.replace_row(&entity.name, index, current)?;
        Ok(id)
    }

    fn batch(
        &mut self,
        entity: &EntityTarget,
        operation: BatchKind,
        items: &TypedExpr,
        iterator: SymbolId,
        values: &[CompiledFieldValue],
        filter: Option<&TypedExpr>,
    ) -> Result<(), RuntimeError> {
        let items = match self.eval(items, &[])? {
            Value::Null => Vec::new(),
            Value::Array(items) => items,
            Value::Json(Json::Array(items)) => items.iter().map(Value::from_json).collect(),
            other => {
                return Err(RuntimeError::invalid(format!(
                    "batch over {}",
                    other.type_name()
                )))
            }
        };
        let filter = match filter {
            Some(condition) => MutationFilter::Where {
                condition: condition.clone(),
            },
            None => MutationFilter::All,
        };
        trace!(entity = %entity.name, items = items.len(), "batch operation");
        for item in items {
            self.store(iterator, item)?;
            match operation {
                BatchKind::Insert => {
                    let row = self.field_values(values, &[])?;
                    self.db.insert_row(&entity.name, row)?;
                }
                BatchKind::Update => self.update_matching(entity, values, &filter)?,
                BatchKind::Delete => self.delete_matching(entity, &filter)?,
            }
        }
        Ok(())
    }

    fn resolve(&self, result: &ReturnValue) -> Result<Returned, RuntimeError> {
        let message = match &result.message {
            Some(m) => self.eval(m, &[])?.as_text(),
            None => None,
        };
        let fields = match self.object(&result.fields, &[])? {
            Json::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Ok(Returned {
            status: result.status.clone(),
            message,
            fields,
        })
    }
}
