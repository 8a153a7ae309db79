//! In-memory relational store: one table per entity, rows in insertion
//! order, enforcing the constraints the generated DDL declares (not-null,
//! enum checks, foreign keys, unique indexes).
//!
//! Every row carries a hidden integer primary key (the target of reference
//! fields) and a visible `id` uuid, followed by the entity fields in
//! declaration order.

use crate::error::RuntimeError;
use crate::value::{Row, Value};
use serde_json::Value as Json;
use specql_core::ast::{EntitySpec, Expr, SemanticType};
use std::cell::Cell;
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug, Clone)]
pub(crate) struct StoredRow {
    pub pk: i64,
    pub values: Row,
}

#[derive(Debug, Clone)]
pub struct Table {
    spec: EntitySpec,
    rows: Vec<StoredRow>,
    next_pk: i64,
}

impl Table {
    pub fn spec(&self) -> &EntitySpec {
        &self.spec
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Table contents saved before a `TryCatch` body runs.
#[derive(Debug)]
pub(crate) struct Snapshot(BTreeMap<String, Vec<StoredRow>>);

#[derive(Debug, Clone)]
pub struct Database {
    tables: BTreeMap<String, Table>,
    /// Uuid sequence; never rolled back.
    sequence: Cell<u64>,
    now: String,
}

impl Database {
    /// An empty table for every entity; a duplicated name keeps its first
    /// declaration.
    pub fn new(entities: &[EntitySpec]) -> Self {
        let mut tables = BTreeMap::new();
        for entity in entities {
            tables.entry(entity.name.clone()).or_insert_with(|| Table {
                spec: entity.clone(),
                rows: Vec::new(),
                next_pk: 1,
            });
        }
        Database {
            tables,
            sequence: Cell::new(0),
            now: "2024-01-01T00:00:00Z".to_owned(),
        }
    }

    /// Fix the value `now()` returns.
    pub fn with_clock(mut self, now: impl Into<String>) -> Self {
        self.now = now.into();
        self
    }

    pub fn now(&self) -> &str {
        &self.now
    }

    /// Deterministic version-4-shaped uuids.
    pub fn next_uuid(&self) -> String {
        let n = self.sequence.get() + 1;
        self.sequence.set(n);
        format!("00000000-0000-4000-8000-{:012x}", n)
    }

    pub fn table(&self, entity: &str) -> Result<&Table, RuntimeError> {
        self.tables
            .get(entity)
            .ok_or_else(|| RuntimeError::UnknownEntity {
                name: entity.to_owned(),
            })
    }

    fn table_mut(&mut self, entity: &str) -> Result<&mut Table, RuntimeError> {
        self.tables
            .get_mut(entity)
            .ok_or_else(|| RuntimeError::UnknownEntity {
                name: entity.to_owned(),
            })
    }

    /// Visible rows (`id` plus fields) of `entity`, in insertion order.
    pub fn rows(&self, entity: &str) -> impl Iterator<Item = &Row> {
        self.tables
            .get(entity)
            .into_iter()
            .flat_map(|t| t.rows.iter().map(|r| &r.values))
    }

    pub fn find(&self, entity: &str, id: &str) -> Option<&Row> {
        self.stored(entity, id).map(|r| &r.values)
    }

    /// Primary key of a row, the value reference fields hold.
    pub fn pk_of(&self, entity: &str, id: &str) -> Option<i64> {
        self.stored(entity, id).map(|r| r.pk)
    }

    fn stored(&self, entity: &str, id: &str) -> Option<&StoredRow> {
        self.tables.get(entity)?.rows.iter().find(|r| {
            matches!(r.values.get("id"), Some(Value::Text(v)) if v == id)
        })
    }

    /// Seed a row from a JSON object of field values; returns the new id.
    pub fn insert(&mut self, entity: &str, fields: Json) -> Result<String, RuntimeError> {
        let spec = self.table(entity)?.spec.clone();
        let mut row = Row::new();
        if let Json::Object(map) = fields {
            for (name, value) in map {
                let field = spec.field(&name).ok_or_else(|| {
                    RuntimeError::invalid(format!("'{}' has no field '{}'", entity, name))
                })?;
                row.set(name, Value::from_json(&value).coerce(&field.ty)?);
            }
        }
        self.insert_row(entity, row)
    }

    // ──────────────────────────────────────────────
    // Mutations used by the interpreter
    // ──────────────────────────────────────────────

    /// Insert with defaults and a fresh id; `fields` are already cast.
    pub(crate) fn insert_row(&mut self, entity: &str, fields: Row) -> Result<String, RuntimeError> {
        let spec = self.table(entity)?.spec.clone();
        let id = self.next_uuid();
        let mut row = Row::new().with("id", Value::Text(id.clone()));
        for field in &spec.fields {
            let value = match fields.get(&field.name) {
                Some(v) => v.clone(),
                None => self.default_value(field.default.as_ref(), &field.ty)?,
            };
            row.set(field.name.clone(), value);
        }
        self.check_row(&spec, &row, None)?;
        let table = self.table_mut(entity)?;
        let pk = table.next_pk;
        table.next_pk += 1;
        table.rows.push(StoredRow { pk, values: row });
        trace!(entity, pk, "row inserted");
        Ok(id)
    }

    /// Replace the row at `index` after checking constraints against the
    /// other rows.
    pub(crate) fn replace_row(
        &mut self,
        entity: &str,
        index: usize,
        values: Row,
    ) -> Result<(), RuntimeError> {
        let spec = self.table(entity)?.spec.clone();
        self.check_row(&spec, &values, Some(index))?;
        let table = self.table_mut(entity)?;
        match table.rows.get_mut(index) {
            Some(row) => {
                row.values = values;
                Ok(())
            }
            None => Err(RuntimeError::invalid(format!(
                "row {} of '{}' does not exist",
                index, entity
            ))),
        }
    }

    /// Delete the rows at `indexes`, refusing while other rows reference
    /// them.
    pub(crate) fn delete_rows(&mut self, entity: &str, indexes: &[usize]) -> Result<(), RuntimeError> {
        let table = self.table(entity)?;
        let doomed: Vec<i64> = indexes
            .iter()
            .filter_map(|i| table.rows.get(*i).map(|r| r.pk))
            .collect();
        for other in self.tables.values() {
            for field in &other.spec.fields {
                if !matches!(&field.ty, SemanticType::Reference { entity: e } if e == entity) {
                    continue;
                }
                let referenced = other.rows.iter().any(|r| {
                    let own = other.spec.name == entity && doomed.contains(&r.pk);
                    !own && matches!(r.values.get(&field.name), Some(Value::Int(pk)) if doomed.contains(pk))
                });
                if referenced {
                    return Err(RuntimeError::ForeignKeyViolation {
                        entity: other.spec.name.clone(),
                        field: field.name.clone(),
                        target: entity.to_owned(),
                    });
                }
            }
        }
        let table = self.table_mut(entity)?;
        let mut index = 0;
        table.rows.retain(|_| {
            let keep = !indexes.contains(&index);
            index += 1;
            keep
        });
        trace!(entity, deleted = doomed.len(), "rows deleted");
        Ok(())
    }

    pub(crate) fn stored_rows(&self, entity: &str) -> Result<&[StoredRow], RuntimeError> {
        Ok(&self.table(entity)?.rows)
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot(
            self.tables
                .iter()
                .map(|(name, t)| (name.clone(), t.rows.clone()))
                .collect(),
        )
    }

    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        for (name, rows) in snapshot.0 {
            if let Some(table) = self.tables.get_mut(&name) {
                table.rows = rows;
            }
        }
    }

    // ──────────────────────────────────────────────
    // Constraints
    // ──────────────────────────────────────────────

    /// Column defaults: literals and zero-argument builtins. Anything else
    /// has no table-level default.
    fn default_value(&self, default: Option<&Expr>, ty: &SemanticType) -> Result<Value, RuntimeError> {
        let value = match default {
            Some(Expr::Literal { value }) => Value::from_literal(value),
            Some(Expr::Call { function, args }) if args.is_empty() => {
                match function.to_ascii_lowercase().as_str() {
                    "now" => Value::Text(self.now.clone()),
                    "current_date" => Value::Text(self.now.chars().take(10).collect()),
                    "gen_random_uuid" => Value::Text(self.next_uuid()),
                    _ => Value::Null,
                }
            }
            _ => Value::Null,
        };
        value.coerce(ty)
    }

    fn check_row(&self, spec: &EntitySpec, row: &Row, skip: Option<usize>) -> Result<(), RuntimeError> {
        for field in &spec.fields {
            let value = row.get(&field.name).unwrap_or(&Value::Null);
            if value.is_null() {
                if field.required {
                    return Err(RuntimeError::NotNullViolation {
                        entity: spec.name.clone(),
                        field: field.name.clone(),
                    });
                }
                continue;
            }
            match &field.ty {
                SemanticType::Enum { values } => {
                    let text = value.as_text().unwrap_or_default();
                    if !values.contains(&text) {
                        return Err(RuntimeError::CheckViolation {
                            entity: spec.name.clone(),
                            field: field.name.clone(),
                            value: text,
                        });
                    }
                }
                SemanticType::Reference { entity: target } => {
                    if let Some(table) = self.tables.get(target) {
                        let exists = match value {
                            Value::Int(pk) => table.rows.iter().any(|r| r.pk == *pk),
                            _ => false,
                        };
                        if !exists {
                            return Err(RuntimeError::ForeignKeyViolation {
                                entity: spec.name.clone(),
                                field: field.name.clone(),
                                target: target.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        let rows = self.stored_rows(&spec.name)?;
        for index in spec.indexes.iter().filter(|i| i.unique) {
            let key: Vec<&Value> = index
                .fields
                .iter()
                .map(|f| row.get(f).unwrap_or(&Value::Null))
                .collect();
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            for (i, other) in rows.iter().enumerate() {
                if Some(i) == skip {
                    continue;
                }
                let mut same = true;
                for (field, value) in index.fields.iter().zip(&key) {
                    let theirs = other.values.get(field).unwrap_or(&Value::Null);
                    if value.sql_eq(theirs)? != Some(true) {
                        same = false;
                        break;
                    }
                }
                if same {
                    return Err(RuntimeError::UniqueViolation {
                        entity: spec.name.clone(),
                        constraint: index.name.clone().unwrap_or_else(|| {
                            format!(
                                "{}_{}_key",
                                spec.name.to_ascii_lowercase(),
                                index.fields.join("_")
                            )
                        }),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> Database {
        let entities: Vec<EntitySpec> = serde_json::from_value(json!([
            {"name": "Company", "fields": [{"name": "name", "type": {"base": "text"}, "required": true}]},
            {"name": "Contact", "fields": [
                {"name": "email", "type": {"base": "email"}, "required": true},
                {"name": "status", "type": {"base": "enum", "values": ["lead", "qualified"]},
                 "default": {"expr": "literal", "value": {"type": "text", "value": "lead"}}},
                {"name": "company", "type": {"base": "reference", "entity": "Company"}}
            ], "indexes": [{"fields": ["email"], "unique": true}]}
        ]))
        .unwrap();
        Database::new(&entities)
    }

    #[test]
    fn insert_applies_defaults_and_ids() {
        let mut db = db();
        let id = db.insert("Contact", json!({"email": "a@x.io"})).unwrap();
        assert_eq!(id, "00000000-0000-4000-8000-000000000001");
        let row = db.find("Contact", &id).unwrap();
        assert_eq!(row.get("status"), Some(&Value::text("lead")));
        assert_eq!(row.get("company"), Some(&Value::Null));
    }

    #[test]
    fn constraints_are_enforced() {
        let mut db = db();
        db.insert("Contact", json!({"email": "a@x.io"})).unwrap();
        assert!(matches!(
            db.insert("Contact", json!({"email": "a@x.io"})),
            Err(RuntimeError::UniqueViolation { .. })
        ));
        assert!(matches!(
            db.insert("Contact", json!({})),
            Err(RuntimeError::NotNullViolation { .. })
        ));
        assert!(matches!(
            db.insert("Contact", json!({"email": "b@x.io", "status": "gone"})),
            Err(RuntimeError::CheckViolation { .. })
        ));
        assert!(matches!(
            db.insert("Contact", json!({"email": "b@x.io", "company": 9})),
            Err(RuntimeError::ForeignKeyViolation { .. })
        ));
    }

    #[test]
    fn referenced_rows_cannot_be_deleted() {
        let mut db = db();
        let acme = db.insert("Company", json!({"name": "Acme"})).unwrap();
        let pk = db.pk_of("Company", &acme).unwrap();
        db.insert("Contact", json!({"email": "a@x.io", "company": pk}))
            .unwrap();
        assert!(matches!(
            db.delete_rows("Company", &[0]),
            Err(RuntimeError::ForeignKeyViolation { .. })
        ));
        db.delete_rows("Contact", &[0]).unwrap();
        db.delete_rows("Company", &[0]).unwrap();
        assert_eq!(db.table("Company").unwrap().len(), 0);
    }

    #[test]
    fn restore_keeps_the_uuid_sequence() {
        let mut db = db();
        let saved = db.snapshot();
        db.insert("Company", json!({"name": "Acme"})).unwrap();
        db.restore(saved);
        assert_eq!(db.rows("Company").count(), 0);
        let id = db.insert("Company", json!({"name": "Acme"})).unwrap();
        assert!(id.ends_with("000000000002"));
    }
}
