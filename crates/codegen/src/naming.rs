//! Deterministic identifier assignment.
//!
//! Every symbol of a compiled action gets one target name, assigned in
//! declaration order. Shadowed or colliding names get `_2`, `_3`, ...
//! suffixes (`2`, `3`, ... in camelCase styles), so the same action always
//! produces the same names.

use crate::error::EmissionError;
use specql_core::ast::SemanticType;
use specql_core::compiled::{CompiledAction, EntityTarget};
use specql_core::scope::{SymbolId, SymbolKind};
use specql_core::types::ValueType;
use std::collections::BTreeSet;

const SQL_RESERVED: &[&str] = &[
    "all", "and", "any", "array", "as", "asc", "between", "case", "cast", "check", "column",
    "constraint", "create", "default", "desc", "distinct", "do", "else", "end", "except", "false",
    "for", "foreign", "from", "grant", "group", "having", "in", "into", "is", "join", "limit",
    "not", "null", "offset", "on", "or", "order", "primary", "references", "select", "table",
    "then", "to", "true", "union", "unique", "user", "using", "when", "where", "with",
];

const TS_RESERVED: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "default", "delete", "do",
    "else", "enum", "export", "extends", "false", "finally", "for", "function", "if", "import",
    "in", "instanceof", "let", "new", "null", "return", "super", "switch", "this", "throw",
    "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

pub fn to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_lower = true;
        } else {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out
}

pub fn to_camel(name: &str) -> String {
    let snake = to_snake(name);
    let mut out = String::with_capacity(snake.len());
    let mut upper = false;
    for ch in snake.chars() {
        if ch == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.push(ch.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

pub fn to_pascal(name: &str) -> String {
    let camel = to_camel(name);
    let mut chars = camel.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// SQL identifier: bare when it is a plain lowercase name, quoted otherwise.
pub fn ident(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain && !SQL_RESERVED.contains(&name) {
        name.to_owned()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Possibly schema-qualified SQL name (`crm.score_lead`).
pub fn qualified(name: &str) -> String {
    name.split('.').map(ident).collect::<Vec<_>>().join(".")
}

pub fn table_name(entity: &EntityTarget) -> String {
    format!(
        "{}.{}",
        ident(&entity.namespace),
        ident(&format!("tb_{}", to_snake(&entity.name)))
    )
}

pub fn pk_column(entity_name: &str) -> String {
    format!("pk_{}", to_snake(entity_name))
}

/// Stored column of an entity field: references live in `fk_<field>`.
pub fn field_column(field: &str, ty: &SemanticType) -> String {
    match ty {
        SemanticType::Reference { .. } => ident(&format!("fk_{}", to_snake(field))),
        _ => ident(&to_snake(field)),
    }
}

/// Stored column for a column of an entity relation, by its value type.
pub fn entity_column(field: &str, ty: &ValueType) -> String {
    match ty.as_scalar() {
        Some(scalar) => field_column(field, scalar),
        None => ident(&to_snake(field)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameStyle {
    PlPgSql,
    TypeScript,
}

#[derive(Debug, Clone)]
pub struct Names {
    style: NameStyle,
    by_symbol: Vec<Option<String>>,
    taken: BTreeSet<String>,
    record_id: String,
}

impl Names {
    pub fn assign(compiled: &CompiledAction, style: NameStyle) -> Self {
        let record_id = match style {
            NameStyle::PlPgSql => format!("p_{}_id", to_snake(&compiled.entity.name)),
            NameStyle::TypeScript => "recordId".to_owned(),
        };
        let mut names = Names {
            style,
            by_symbol: Vec::with_capacity(compiled.symbols.len()),
            taken: BTreeSet::new(),
            record_id: record_id.clone(),
        };
        names.taken.insert(record_id);
        let reserved: &[&str] = match style {
            NameStyle::PlPgSql => &["v_result", "v_done"],
            NameStyle::TypeScript => &["db", "input", "result", "done", "caught", "row"],
        };
        names.taken.extend(reserved.iter().map(|s| s.to_string()));

        for symbol in compiled.symbols.iter() {
            let name = match (style, symbol.kind) {
                (_, SymbolKind::EntityField) => None,
                (NameStyle::PlPgSql, SymbolKind::Param) => {
                    Some(names.fresh(&format!("p_{}", to_snake(&symbol.name))))
                }
                (NameStyle::PlPgSql, SymbolKind::Relation) => Some(ident(&symbol.name)),
                (NameStyle::PlPgSql, _) => {
                    Some(names.fresh(&format!("v_{}", to_snake(&symbol.name))))
                }
                (NameStyle::TypeScript, SymbolKind::Param) => {
                    Some(format!("input.{}", to_camel(&symbol.name)))
                }
                (NameStyle::TypeScript, _) => Some(names.fresh(&to_camel(&symbol.name))),
            };
            names.by_symbol.push(name);
        }
        names
    }

    /// A name not used by any symbol, reserved from now on.
    pub fn fresh(&mut self, base: &str) -> String {
        let reserved = match self.style {
            NameStyle::PlPgSql => SQL_RESERVED,
            NameStyle::TypeScript => TS_RESERVED,
        };
        let separator = match self.style {
            NameStyle::PlPgSql => "_",
            NameStyle::TypeScript => "",
        };
        let mut candidate = base.to_owned();
        let mut n = 1;
        while self.taken.contains(&candidate) || reserved.contains(&candidate.as_str()) {
            n += 1;
            candidate = format!("{}{}{}", base, separator, n);
        }
        self.taken.insert(candidate.clone());
        candidate
    }

    pub fn get(&self, id: SymbolId) -> Option<&str> {
        self.by_symbol.get(id.index()).and_then(|n| n.as_deref())
    }

    pub fn require(&self, compiled: &CompiledAction, id: SymbolId) -> Result<&str, EmissionError> {
        self.get(id).ok_or_else(|| EmissionError::InvalidCompiledAction {
            entity: compiled.entity.name.clone(),
            action: compiled.action.clone(),
            reason: format!("symbol {} has no target name", id.0),
        })
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_conversions() {
        assert_eq!(to_snake("qualifyLead"), "qualify_lead");
        assert_eq!(to_snake("Contact"), "contact");
        assert_eq!(to_snake("new-score"), "new_score");
        assert_eq!(to_camel("qualify_lead"), "qualifyLead");
        assert_eq!(to_camel("newScore"), "newScore");
        assert_eq!(to_pascal("qualify_lead"), "QualifyLead");
    }

    #[test]
    fn identifiers_are_quoted_only_when_needed() {
        assert_eq!(ident("email"), "email");
        assert_eq!(ident("firstName"), "\"firstName\"");
        assert_eq!(ident("order"), "\"order\"");
        assert_eq!(qualified("crm.score_lead"), "crm.score_lead");
    }

    #[test]
    fn reference_fields_use_fk_columns() {
        let company = SemanticType::Reference {
            entity: "Company".into(),
        };
        assert_eq!(field_column("company", &company), "fk_company");
        assert_eq!(field_column("email", &SemanticType::Email), "email");
        assert_eq!(
            table_name(&EntityTarget {
                name: "Contact".into(),
                namespace: "crm".into()
            }),
            "crm.tb_contact"
        );
    }
}
