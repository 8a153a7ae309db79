//! Entity DDL: one table per entity.
//!
//! Foreign keys come last as `ALTER TABLE` statements, so entities that
//! reference each other can be created in any order.

use crate::error::EmissionError;
use crate::naming::{field_column, ident, pk_column, table_name, to_snake};
use crate::profile::TargetProfile;
use crate::sql::{literal, quote};
use specql_core::ast::{EntitySpec, Expr, FieldSpec, IndexMethod, SemanticType};
use specql_core::catalog::Index;
use specql_core::compiled::EntityTarget;
use specql_core::compiler::is_builtin;
use tracing::warn;

fn column_default(entity: &EntitySpec, field: &FieldSpec) -> Option<String> {
    let default = field.default.as_ref()?;
    match default {
        Expr::Literal { value } => Some(literal(value)),
        Expr::Call { function, args } if args.is_empty() && is_builtin(function) => {
            let name = function.to_ascii_lowercase();
            if name == "current_date" {
                Some("CURRENT_DATE".to_owned())
            } else {
                Some(format!("{}()", name))
            }
        }
        _ => {
            warn!(
                entity = %entity.name,
                field = %field.name,
                "column default is not a literal or builtin call; skipped"
            );
            None
        }
    }
}

pub fn emit_table(
    entity: &EntitySpec,
    entities: &Index<'_>,
    profile: &TargetProfile,
) -> Result<String, EmissionError> {
    let target = EntityTarget::from(entity);
    let table = table_name(&target);
    let bare_table = format!("tb_{}", to_snake(&entity.name));
    let mut columns = vec![
        format!(
            "{} {} GENERATED ALWAYS AS IDENTITY PRIMARY KEY",
            pk_column(&entity.name),
            profile.native_type(&SemanticType::Integer)?
        ),
        format!(
            "id {} NOT NULL DEFAULT gen_random_uuid() UNIQUE",
            profile.native_type(&SemanticType::Uuid)?
        ),
    ];
    let mut foreign_keys = Vec::new();

    for field in &entity.fields {
        let column = field_column(&field.name, &field.ty);
        let mut def = format!("{} {}", column, profile.native_type(&field.ty)?);
        if field.required {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = column_default(entity, field) {
            def.push_str(&format!(" DEFAULT {}", default));
        }
        match &field.ty {
            SemanticType::Enum { values } if !values.is_empty() => {
                let allowed: Vec<String> = values.iter().map(|v| quote(v)).collect();
                def.push_str(&format!(" CHECK ({} IN ({}))", column, allowed.join(", ")));
            }
            SemanticType::Reference { entity: referenced } => {
                let Some(other) = entities.get(referenced) else {
                    return Err(EmissionError::UnresolvedReference {
                        entity: entity.name.clone(),
                        field: field.name.clone(),
                        target: referenced.clone(),
                    });
                };
                foreign_keys.push(format!(
                    "ALTER TABLE {}\n    ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({});",
                    table,
                    ident(&format!("fk_{}_{}", bare_table, to_snake(&field.name))),
                    column,
                    table_name(&EntityTarget::from(other)),
                    pk_column(&other.name)
                ));
            }
            _ => {}
        }
        columns.push(def);
    }

    let mut out = String::new();
    out.push_str(&format!(
        "CREATE SCHEMA IF NOT EXISTS {};\n\n",
        ident(&entity.namespace)
    ));
    out.push_str(&format!("CREATE TABLE {} (\n", table));
    out.push_str(
        &columns
            .iter()
            .map(|c| format!("    {}", c))
            .collect::<Vec<_>>()
            .join(",\n"),
    );
    out.push_str("\n);\n");

    let mut comments = Vec::new();
    if let Some(description) = &entity.description {
        comments.push(format!("COMMENT ON TABLE {} IS {};", table, quote(description)));
    }
    for field in &entity.fields {
        if let Some(description) = &field.description {
            comments.push(format!(
                "COMMENT ON COLUMN {}.{} IS {};",
                table,
                field_column(&field.name, &field.ty),
                quote(description)
            ));
        }
    }
    for section in [comments, foreign_keys] {
        if !section.is_empty() {
            out.push('\n');
            out.push_str(&section.join("\n"));
            out.push('\n');
        }
    }

    let mut indexes = Vec::with_capacity(entity.indexes.len());
    for index in &entity.indexes {
        let cols: Vec<String> = index
            .fields
            .iter()
            .map(|name| match entity.field(name) {
                Some(f) => field_column(&f.name, &f.ty),
                None => ident(&to_snake(name)),
            })
            .collect();
        let name = match &index.name {
            Some(name) => ident(name),
            None => ident(&format!(
                "idx_{}_{}",
                bare_table,
                index
                    .fields
                    .iter()
                    .map(|f| to_snake(f))
                    .collect::<Vec<_>>()
                    .join("_")
            )),
        };
        let method = match index.method {
            IndexMethod::Btree => "btree",
            IndexMethod::Hash => "hash",
            IndexMethod::Gin => "gin",
            IndexMethod::Gist => "gist",
        };
        let unique = if index.unique { "UNIQUE " } else { "" };
        indexes.push(format!(
            "CREATE {}INDEX {} ON {} USING {} ({});",
            unique,
            name,
            table,
            method,
            cols.join(", ")
        ));
    }
    if !indexes.is_empty() {
        out.push('\n');
        out.push_str(&indexes.join("\n"));
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use specql_core::catalog::build_index;

    fn entities() -> Vec<EntitySpec> {
        serde_json::from_value(json!([
            {"name": "Contact", "schema": "crm", "description": "People we talk to",
             "fields": [
                {"name": "email", "type": {"base": "email"}, "required": true},
                {"name": "status", "type": {"base": "enum", "values": ["lead", "qualified"]},
                 "default": {"expr": "literal", "value": {"type": "text", "value": "lead"}}},
                {"name": "company", "type": {"base": "reference", "entity": "Company"},
                 "description": "Employer"}
             ],
             "indexes": [{"fields": ["email"], "unique": true}]},
            {"name": "Company", "schema": "crm", "fields": [
                {"name": "primaryContact", "type": {"base": "reference", "entity": "Contact"}}
            ]}
        ]))
        .unwrap()
    }

    #[test]
    fn table_with_constraints_comments_and_indexes() {
        let list = entities();
        let (index, _) = build_index(&list);
        let ddl = emit_table(&list[0], &index, &TargetProfile::postgres()).unwrap();
        assert_eq!(
            ddl,
            "CREATE SCHEMA IF NOT EXISTS crm;

CREATE TABLE crm.tb_contact (
    pk_contact INTEGER GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    id UUID NOT NULL DEFAULT gen_random_uuid() UNIQUE,
    email TEXT NOT NULL,
    status TEXT DEFAULT 'lead' CHECK (status IN ('lead', 'qualified')),
    fk_company INTEGER
);

COMMENT ON TABLE crm.tb_contact IS 'People we talk to';
COMMENT ON COLUMN crm.tb_contact.fk_company IS 'Employer';

ALTER TABLE crm.tb_contact
    ADD CONSTRAINT fk_tb_contact_company FOREIGN KEY (fk_company) REFERENCES crm.tb_company (pk_company);

CREATE UNIQUE INDEX idx_tb_contact_email ON crm.tb_contact USING btree (email);
"
        );
    }

    #[test]
    fn cyclic_references_need_no_ordering() {
        let list = entities();
        let (index, _) = build_index(&list);
        let ddl = emit_table(&list[1], &index, &TargetProfile::postgres()).unwrap();
        assert!(ddl.contains("fk_primary_contact INTEGER"));
        assert!(ddl.contains("REFERENCES crm.tb_contact (pk_contact);"));
    }

    #[test]
    fn unknown_reference_target_is_an_error() {
        let list = entities();
        let (index, _) = build_index(&list[..1]);
        let err = emit_table(&list[0], &index, &TargetProfile::postgres()).unwrap_err();
        assert_eq!(
            err,
            EmissionError::UnresolvedReference {
                entity: "Contact".into(),
                field: "company".into(),
                target: "Company".into()
            }
        );
    }
}
