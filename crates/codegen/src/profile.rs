//! Target profiles: what a backend can express natively and how semantic
//! field types map onto its native types.

use crate::error::EmissionError;
use serde::{Deserialize, Serialize};
use specql_core::ast::SemanticType;
use std::collections::BTreeMap;

/// Builtin profile names, in the order they are listed to users.
pub const BUILTIN_PROFILES: &[&str] = &["postgres", "postgres-legacy", "typescript"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    TypeScript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub native_switch: bool,
    pub native_early_return: bool,
    pub native_try_catch: bool,
    pub native_recursive_cte: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            native_switch: true,
            native_early_return: true,
            native_try_catch: true,
            native_recursive_cte: true,
        }
    }
}

/// Semantic type key (`SemanticType::key`) to native type name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeMap(BTreeMap<String, String>);

impl TypeMap {
    pub fn get(&self, ty: &SemanticType) -> Option<&str> {
        self.0.get(ty.key()).map(String::as_str)
    }

    /// Lookup by raw key, for the non-field types (`dynamic`).
    pub fn get_key(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, native: impl Into<String>) {
        self.0.insert(key.into(), native.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for TypeMap {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        TypeMap(
            iter.into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetProfile {
    pub name: String,
    pub dialect: Dialect,
    pub capabilities: Capabilities,
    pub types: TypeMap,
    /// Native type every generated action returns.
    pub result_type: String,
}

impl Default for TargetProfile {
    fn default() -> Self {
        TargetProfile::postgres()
    }
}

fn postgres_types() -> TypeMap {
    [
        ("text", "TEXT"),
        ("integer", "INTEGER"),
        ("decimal", "NUMERIC"),
        ("boolean", "BOOLEAN"),
        ("timestamp", "TIMESTAMPTZ"),
        ("date", "DATE"),
        ("time", "TIME"),
        ("json", "JSONB"),
        ("uuid", "UUID"),
        ("email", "TEXT"),
        ("url", "TEXT"),
        ("phone", "TEXT"),
        ("enum", "TEXT"),
        ("reference", "INTEGER"),
        ("dynamic", "JSONB"),
    ]
    .into_iter()
    .collect()
}

impl TargetProfile {
    /// PostgreSQL 11+: every construct is native.
    pub fn postgres() -> Self {
        TargetProfile {
            name: "postgres".to_owned(),
            dialect: Dialect::Postgres,
            capabilities: Capabilities::default(),
            types: postgres_types(),
            result_type: "app.mutation_result".to_owned(),
        }
    }

    /// PL/pgSQL without `CASE` statements or mid-function `RETURN`;
    /// exercises the switch and early-return fallbacks.
    pub fn postgres_legacy() -> Self {
        TargetProfile {
            name: "postgres-legacy".to_owned(),
            capabilities: Capabilities {
                native_switch: false,
                native_early_return: false,
                ..Capabilities::default()
            },
            ..TargetProfile::postgres()
        }
    }

    pub fn typescript() -> Self {
        TargetProfile {
            name: "typescript".to_owned(),
            dialect: Dialect::TypeScript,
            capabilities: Capabilities::default(),
            types: [
                ("text", "string"),
                ("integer", "number"),
                ("decimal", "number"),
                ("boolean", "boolean"),
                ("timestamp", "string"),
                ("date", "string"),
                ("time", "string"),
                ("json", "unknown"),
                ("uuid", "string"),
                ("email", "string"),
                ("url", "string"),
                ("phone", "string"),
                ("enum", "string"),
                ("reference", "number"),
                ("dynamic", "unknown"),
            ]
            .into_iter()
            .collect(),
            result_type: "MutationResult".to_owned(),
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "postgres" => Some(TargetProfile::postgres()),
            "postgres-legacy" => Some(TargetProfile::postgres_legacy()),
            "typescript" => Some(TargetProfile::typescript()),
            _ => None,
        }
    }

    pub fn native_type(&self, ty: &SemanticType) -> Result<&str, EmissionError> {
        self.types
            .get(ty)
            .ok_or_else(|| EmissionError::unsupported(&self.name, ty))
    }

    /// Native type for values whose type could not be inferred.
    pub fn dynamic_type(&self) -> Result<&str, EmissionError> {
        self.types
            .get_key("dynamic")
            .or_else(|| self.types.get(&SemanticType::Json))
            .ok_or_else(|| EmissionError::unsupported(&self.name, &SemanticType::Json))
    }

    pub fn with_overrides(mut self, overrides: &ProfileOverrides) -> Self {
        let caps = &mut self.capabilities;
        if let Some(v) = overrides.native_switch {
            caps.native_switch = v;
        }
        if let Some(v) = overrides.native_early_return {
            caps.native_early_return = v;
        }
        if let Some(v) = overrides.native_try_catch {
            caps.native_try_catch = v;
        }
        if let Some(v) = overrides.native_recursive_cte {
            caps.native_recursive_cte = v;
        }
        for (key, native) in &overrides.types {
            self.types.insert(key.clone(), native.clone());
        }
        self
    }
}

/// Partial changes to a builtin profile, as written in a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOverrides {
    pub native_switch: Option<bool>,
    pub native_early_return: Option<bool>,
    pub native_try_catch: Option<bool>,
    pub native_recursive_cte: Option<bool>,
    pub types: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_resolve() {
        for name in BUILTIN_PROFILES {
            let profile = TargetProfile::builtin(name).unwrap();
            assert_eq!(profile.name, *name);
        }
        assert!(TargetProfile::builtin("oracle").is_none());
    }

    #[test]
    fn legacy_profile_drops_switch_and_early_return() {
        let caps = TargetProfile::postgres_legacy().capabilities;
        assert!(!caps.native_switch);
        assert!(!caps.native_early_return);
        assert!(caps.native_try_catch);
        assert!(caps.native_recursive_cte);
    }

    #[test]
    fn every_semantic_type_is_mapped() {
        let all = [
            SemanticType::Text,
            SemanticType::Integer,
            SemanticType::Decimal,
            SemanticType::Boolean,
            SemanticType::Timestamp,
            SemanticType::Date,
            SemanticType::Time,
            SemanticType::Json,
            SemanticType::Uuid,
            SemanticType::Email,
            SemanticType::Url,
            SemanticType::Phone,
            SemanticType::Enum { values: vec![] },
            SemanticType::Reference {
                entity: "Company".into(),
            },
        ];
        for profile in [TargetProfile::postgres(), TargetProfile::typescript()] {
            for ty in &all {
                assert!(profile.native_type(ty).is_ok(), "{} misses {:?}", profile.name, ty);
            }
        }
    }

    #[test]
    fn overrides_replace_capabilities_and_types() {
        let overrides = ProfileOverrides {
            native_try_catch: Some(false),
            types: [("decimal".to_owned(), "NUMERIC(18,4)".to_owned())]
                .into_iter()
                .collect(),
            ..ProfileOverrides::default()
        };
        let profile = TargetProfile::postgres().with_overrides(&overrides);
        assert!(!profile.capabilities.native_try_catch);
        assert_eq!(
            profile.native_type(&SemanticType::Decimal).unwrap(),
            "NUMERIC(18,4)"
        );
    }

    #[test]
    fn missing_mapping_is_unsupported_type() {
        let profile = TargetProfile {
            types: TypeMap::default(),
            ..TargetProfile::postgres()
        };
        assert_eq!(
            profile.native_type(&SemanticType::Uuid),
            Err(EmissionError::UnsupportedType {
                profile: "postgres".into(),
                ty: "uuid".into()
            })
        );
    }
}
