//! Query execution: CTE materialization, nested-loop joins, filtering,
//! ordering and projection, plus the aggregate and transform reductions
//! built on the same row pipeline.

use crate::error::RuntimeError;
use crate::expr::Frame;
use crate::interp::Machine;
use crate::value::{Row, Value};
use rust_decimal::Decimal;
use serde_json::Value as Json;
use specql_core::ast::{AggregateFn, JoinKind};
use specql_core::compiled::{
    CompiledCte, CompiledEntry, CompiledQuery, CompiledRelation, RelationSource, TypedExpr,
};
use std::collections::BTreeMap;
use tracing::trace;

/// Rounds a recursive CTE may take before it is considered runaway.
pub const RECURSION_LIMIT: usize = 1_000;

/// Materialized CTEs visible to a query, by name.
pub(crate) type Ctes = BTreeMap<String, Vec<Row>>;

impl Machine<'_> {
    /// One frame per result row after joins, filter, ordering and limit.
    pub(crate) fn frames(&self, query: &CompiledQuery, visible: &Ctes) -> Result<Vec<Frame>, RuntimeError> {
        let mut ctes = visible.clone();
        for cte in &query.ctes {
            let rows = self.materialize(cte, &ctes)?;
            ctes.insert(cte.name.clone(), rows);
        }

        let mut frames: Vec<Frame> = self
            .relation_rows(&query.from, &ctes)?
            .into_iter()
            .map(|row| vec![(query.from.binding.clone(), row)])
            .collect();

        for join in &query.joins {
            let right = self.relation_rows(&join.relation, &ctes)?;
            let mut joined = Vec::new();
            for frame in frames {
                let mut matched = false;
                for row in &right {
                    let mut candidate = frame.clone();
                    candidate.push((join.relation.binding.clone(), row.clone()));
                    if self.eval(&join.on, &candidate)?.is_true()? {
                        matched = true;
                        joined.push(candidate);
                    }
                }
                if !matched && join.kind == JoinKind::Left {
                    let mut padded = frame;
                    let names = join.relation.columns.iter().map(|c| c.name.as_str());
                    padded.push((join.relation.binding.clone(), Row::nulls(names)));
                    joined.push(padded);
                }
            }
            frames = joined;
        }

        if let Some(filter) = &query.filter {
            let mut kept = Vec::with_capacity(frames.len());
            for frame in frames {
                if self.eval(filter, &frame)?.is_true()? {
                    kept.push(frame);
                }
            }
            frames = kept;
        }

        if !query.order_by.is_empty() {
            let mut keyed = Vec::with_capacity(frames.len());
            for frame in frames {
                let keys = query
                    .order_by
                    .iter()
                    .map(|o| self.eval(&o.expr, &frame))
                    .collect::<Result<Vec<_>, _>>()?;
                keyed.push((keys, frame));
            }
            // DESC reverses the whole order, so NULLs come first there
            keyed.sort_by(|(a, _), (b, _)| {
                query
                    .order_by
                    .iter()
                    .zip(a.iter().zip(b))
                    .map(|(order, (x, y))| {
                        let ordering = x.sort_order(y);
                        if order.descending {
                            ordering.reverse()
                        } else {
                            ordering
                        }
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            frames = keyed.into_iter().map(|(_, frame)| frame).collect();
        }

        if let Some(limit) = query.limit {
            frames.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(frames)
    }

    /// Rows of the select list.
    pub(crate) fn select_rows(&self, query: &CompiledQuery, visible: &Ctes) -> Result<Vec<Row>, RuntimeError> {
        let frames = self.frames(query, visible)?;
        let mut rows = Vec::with_capacity(frames.len());
        for frame in &frames {
            let mut row = Row::new();
            for item in &query.select {
                row.set(item.name.clone(), self.eval(&item.expr, frame)?);
            }
            rows.push(row);
        }
        trace!(rows = rows.len(), "query evaluated");
        Ok(rows)
    }

    fn relation_rows(&self, relation: &CompiledRelation, ctes: &Ctes) -> Result<Vec<Row>, RuntimeError> {
        match &relation.source {
            RelationSource::Entity(target) => {
                self.db.table(&target.name)?;
                Ok(self.db.rows(&target.name).cloned().collect())
            }
            RelationSource::Cte { name } => ctes
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::invalid(format!("CTE '{}' is not materialized", name))),
        }
    }

    /// `UNION ALL` recursion: each round runs the recursive term against
    /// the rows the previous round produced, until a round adds nothing.
    fn materialize(&self, cte: &CompiledCte, visible: &Ctes) -> Result<Vec<Row>, RuntimeError> {
        let names: Vec<String> = cte.columns.iter().map(|c| c.name.clone()).collect();
        let rename = |rows: Vec<Row>| -> Vec<Row> { rows.iter().map(|r| r.renamed(&names)).collect() };

        let base = rename(self.select_rows(&cte.base, visible)?);
        let Some(term) = &cte.recursive_term else {
            return Ok(base);
        };
        let mut all = base.clone();
        let mut working = base;
        let mut rounds = 0;
        while !working.is_empty() {
            rounds += 1;
            if rounds > RECURSION_LIMIT {
                return Err(RuntimeError::IterationLimit {
                    construct: "recursive CTE",
                    limit: RECURSION_LIMIT,
                });
            }
            let mut scope = visible.clone();
            scope.insert(cte.name.clone(), working);
            working = rename(self.select_rows(term, &scope)?);
            all.extend(working.iter().cloned());
        }
        trace!(cte = %cte.name, rounds, rows = all.len(), "recursive CTE materialized");
        Ok(all)
    }

    /// A single aggregate over the query's rows; `argument: None` counts or
    /// collects whole rows of the primary relation.
    pub(crate) fn aggregate(
        &self,
        function: AggregateFn,
        argument: Option<&TypedExpr>,
        query: &CompiledQuery,
    ) -> Result<Value, RuntimeError> {
        let frames = self.frames(query, &Ctes::new())?;
        let Some(argument) = argument else {
            return match function {
                AggregateFn::Count => Ok(Value::Int(frames.len() as i64)),
                AggregateFn::JsonAgg if frames.is_empty() => Ok(Value::Null),
                AggregateFn::JsonAgg => Ok(Value::Json(Json::Array(
                    frames
                        .iter()
                        .filter_map(|f| f.first().map(|(_, row)| row.to_json()))
                        .collect(),
                ))),
                other => Err(RuntimeError::invalid(format!(
                    "{:?} needs an argument",
                    other
                ))),
            };
        };
        let values = frames
            .iter()
            .map(|f| self.eval(argument, f))
            .collect::<Result<Vec<_>, _>>()?;
        reduce(function, values)
    }

    /// One JSON object per row, collected into an array (`[]` when empty).
    pub(crate) fn transform(&self, query: &CompiledQuery, mapping: &[CompiledEntry]) -> Result<Value, RuntimeError> {
        let frames = self.frames(query, &Ctes::new())?;
        let mut items = Vec::with_capacity(frames.len());
        for frame in &frames {
            let mut object = serde_json::Map::new();
            for entry in mapping {
                object.insert(entry.key.clone(), self.eval(&entry.value, frame)?.to_json());
            }
            items.push(Json::Object(object));
        }
        Ok(Value::Json(Json::Array(items)))
    }
}

/// SQL aggregate semantics: `NULL` inputs are skipped, and every aggregate
/// but `count` is `NULL` over no rows.
fn reduce(function: AggregateFn, values: Vec<Value>) -> Result<Value, RuntimeError> {
    let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
    match function {
        AggregateFn::Count => Ok(Value::Int(present.len() as i64)),
        AggregateFn::ArrayAgg if values.is_empty() => Ok(Value::Null),
        AggregateFn::ArrayAgg => Ok(Value::Array(values)),
        AggregateFn::JsonAgg if values.is_empty() => Ok(Value::Null),
        AggregateFn::JsonAgg => Ok(Value::Json(Json::Array(
            values.iter().map(Value::to_json).collect(),
        ))),
        _ if present.is_empty() => Ok(Value::Null),
        AggregateFn::Min | AggregateFn::Max => {
            let mut best = present[0];
            for v in &present[1..] {
                let ordering = v.sort_order(best);
                let better = if function == AggregateFn::Min {
                    ordering.is_lt()
                } else {
                    ordering.is_gt()
                };
                if better {
                    best = v;
                }
            }
            Ok(best.clone())
        }
        AggregateFn::Sum | AggregateFn::Avg => {
            let overflow = || RuntimeError::OutOfRange {
                message: format!("{:?} overflow", function),
            };
            if function == AggregateFn::Sum && present.iter().all(|v| matches!(v, Value::Int(_))) {
                let mut total: i64 = 0;
                for v in &present {
                    if let Value::Int(i) = v {
                        total = total.checked_add(*i).ok_or_else(overflow)?;
                    }
                }
                return Ok(Value::Int(total));
            }
            let mut total = Decimal::ZERO;
            for v in &present {
                let d = v.as_decimal().ok_or_else(|| {
                    RuntimeError::invalid(format!("{:?} of {}", function, v.type_name()))
                })?;
                total = total.checked_add(d).ok_or_else(overflow)?;
            }
            if function == AggregateFn::Sum {
                return Ok(Value::Decimal(total));
            }
            total
                .checked_div(Decimal::from(present.len() as i64))
                .map(Value::Decimal)
                .ok_or_else(overflow)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_skip_nulls() {
        let values = vec![Value::Int(3), Value::Null, Value::Int(5)];
        assert_eq!(reduce(AggregateFn::Count, values.clone()).unwrap(), Value::Int(2));
        assert_eq!(reduce(AggregateFn::Sum, values.clone()).unwrap(), Value::Int(8));
        assert_eq!(
            reduce(AggregateFn::Avg, values.clone()).unwrap(),
            Value::Decimal(Decimal::from(4))
        );
        assert_eq!(reduce(AggregateFn::Max, values).unwrap(), Value::Int(5));
    }

    #[test]
    fn empty_aggregates_are_null_except_count() {
        assert_eq!(reduce(AggregateFn::Count, vec![]).unwrap(), Value::Int(0));
        assert_eq!(reduce(AggregateFn::Sum, vec![]).unwrap(), Value::Null);
        assert_eq!(reduce(AggregateFn::ArrayAgg, vec![]).unwrap(), Value::Null);
        assert_eq!(reduce(AggregateFn::Min, vec![Value::Null]).unwrap(), Value::Null);
    }
}
