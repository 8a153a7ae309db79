//! Whole-batch generation: prelude, entity artifacts, then one artifact per
//! successfully compiled action, in declaration order.
//!
//! A failing entity or action is recorded and skipped; it never stops the
//! rest of the batch.

use crate::emitter::{emitter_for, GeneratedArtifact};
use crate::error::EmissionError;
use crate::profile::TargetProfile;
use serde::Serialize;
use specql_core::ast::EntitySpec;
use specql_core::batch::BatchOutput;
use specql_core::catalog::build_index;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmissionFailure {
    pub entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub error: String,
    #[serde(skip)]
    pub source: Option<EmissionError>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Generated {
    pub artifacts: Vec<GeneratedArtifact>,
    pub failures: Vec<EmissionFailure>,
}

impl Generated {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub fn generate(batch: &BatchOutput, entities: &[EntitySpec], profile: &TargetProfile) -> Generated {
    let emitter = emitter_for(profile.dialect);
    let (index, _) = build_index(entities);
    let mut out = Generated {
        artifacts: emitter.emit_prelude(profile),
        failures: Vec::new(),
    };

    // declaration order; a duplicated name emits its first declaration only
    let kept = entities
        .iter()
        .filter(|e| index.get(&e.name).is_some_and(|k| std::ptr::eq(k, *e)));
    for entity in kept {
        match emitter.emit_entity(entity, &index, profile) {
            Ok(artifacts) => out.artifacts.extend(artifacts),
            Err(error) => {
                warn!(entity = %entity.name, %error, "entity emission failed");
                out.failures.push(EmissionFailure {
                    entity: entity.name.clone(),
                    action: None,
                    error: error.to_string(),
                    source: Some(error),
                });
            }
        }
    }

    for compiled in batch.compiled() {
        match emitter.emit(compiled, profile) {
            Ok(artifact) => out.artifacts.push(artifact),
            Err(error) => {
                warn!(
                    entity = %compiled.entity.name,
                    action = %compiled.action,
                    %error,
                    "action emission failed"
                );
                out.failures.push(EmissionFailure {
                    entity: compiled.entity.name.clone(),
                    action: Some(compiled.action.clone()),
                    error: error.to_string(),
                    source: Some(error),
                });
            }
        }
    }
    debug!(
        profile = %profile.name,
        artifacts = out.artifacts.len(),
        failures = out.failures.len(),
        "generation finished"
    );
    out
}
