//! Intent generator - turns sprite observations into maintenance proposals
//!
//! Pluggable sink called by sprite processes when they emit an observation.
//! `Skipped` is a normal result, not an error; sprites never block on what
//! the generator decides.

use super::model::{Intent, IntentOptions, IntentSource, SourceType};
use super::pipeline::Pipeline;
use crate::sprite::observation::{Observation, ObservationType, Severity};
use async_trait::async_trait;
use serde_json::Map;
use tracing::{debug, warn};

/// What the generator did with an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorResult {
    /// An intent was proposed; carries its id
    Proposed(String),
    /// The observation did not warrant an intent
    Skipped,
}

/// Sink for sprite observations.
#[async_trait]
pub trait IntentGenerator: Send + Sync {
    async fn on_observation(&self, observation: &Observation) -> GeneratorResult;
}

/// Default generator: high-severity anomalies and medium-or-worse
/// recommendations become maintenance intents; metrics, status reports,
/// and low-severity signals are skipped.
pub struct ObservationIntentGenerator {
    pipeline: Pipeline,
}

impl ObservationIntentGenerator {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    fn warrants_intent(observation: &Observation) -> bool {
        match observation.observation_type {
            ObservationType::Anomaly => observation.severity >= Severity::High,
            ObservationType::Recommendation => observation.severity >= Severity::Medium,
            ObservationType::Metric | ObservationType::Status => false,
        }
    }
}

#[async_trait]
impl IntentGenerator for ObservationIntentGenerator {
    async fn on_observation(&self, observation: &Observation) -> GeneratorResult {
        if !Self::warrants_intent(observation) {
            debug!(
                sprite_id = %observation.sprite_id,
                severity = %observation.severity,
                "Observation below intent threshold — skipping"
            );
            return GeneratorResult::Skipped;
        }

        let summary = observation
            .summary()
            .map(String::from)
            .unwrap_or_else(|| format!("observation from sprite {}", observation.sprite_id));

        let mut payload = Map::new();
        payload.insert(
            "observation".to_string(),
            serde_json::to_value(observation).unwrap_or_default(),
        );

        let intent = match Intent::maintenance(
            IntentSource::new(SourceType::Sprite, observation.sprite_id.clone()),
            summary,
            payload,
            IntentOptions::default(),
        ) {
            Ok(intent) => intent,
            Err(e) => {
                warn!(sprite_id = %observation.sprite_id, error = %e, "Could not build maintenance intent");
                return GeneratorResult::Skipped;
            }
        };

        match self.pipeline.propose(intent) {
            Ok(proposed) => GeneratorResult::Proposed(proposed.id),
            Err(e) => {
                warn!(sprite_id = %observation.sprite_id, error = %e, "Failed to propose observation intent");
                GeneratorResult::Skipped
            }
        }
    }
}
