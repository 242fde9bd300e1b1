// A/B Experiments
//
// Weighted variant experiments over API keys. Assignment is sticky and
// deterministic: once a (experiment, key) pair is assigned a variant it
// never changes while the experiment runs, and the pick itself hashes the
// pair so re-assignment after state loss lands on the same variant.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub variants: Vec<Variant>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantAssignment {
    pub experiment_name: String,
    pub key: String,
    pub variant: String,
    pub assigned_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantResult {
    pub variant: String,
    pub assignments: u64,
    pub conversions: u64,
}

pub struct AbTestingManager {
    experiments: RwLock<HashMap<String, Experiment>>,
    /// (experiment name, key) -> assignment
    assignments: RwLock<HashMap<(String, String), VariantAssignment>>,
    conversions: RwLock<HashMap<(String, String), u64>>,
    clock: SharedClock,
}

impl AbTestingManager {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            experiments: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            conversions: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn create_experiment(&self, name: &str, variants: Vec<Variant>) -> Result<Experiment> {
        if name.is_empty() {
            return Err(GateError::Validation("experiment name is required".to_string()));
        }
        if variants.len() < 2 {
            return Err(GateError::Validation(
                "an experiment needs at least two variants".to_string(),
            ));
        }
        if variants.iter().map(|v| v.weight as u64).sum::<u64>() == 0 {
            return Err(GateError::Validation(
                "variant weights must sum to a positive value".to_string(),
            ));
        }
        let mut experiments = self.experiments.write();
        if experiments.contains_key(name) {
            return Err(GateError::AlreadyExists(format!("experiment {}", name)));
        }
        let experiment = Experiment {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: ExperimentStatus::Draft,
            variants,
            created_at: self.clock.now_ms(),
            started_at: None,
            completed_at: None,
        };
        experiments.insert(name.to_string(), experiment.clone());
        Ok(experiment)
    }

    pub fn start(&self, name: &str) -> Result<Experiment> {
        self.transition(name, |experiment, now| match experiment.status {
            ExperimentStatus::Draft | ExperimentStatus::Paused => {
                experiment.status = ExperimentStatus::Running;
                experiment.started_at.get_or_insert(now);
                Ok(())
            }
            status => Err(GateError::InvalidState(format!(
                "cannot start experiment in state {:?}",
                status
            ))),
        })
    }

    pub fn pause(&self, name: &str) -> Result<Experiment> {
        self.transition(name, |experiment, _| match experiment.status {
            ExperimentStatus::Running => {
                experiment.status = ExperimentStatus::Paused;
                Ok(())
            }
            status => Err(GateError::InvalidState(format!(
                "cannot pause experiment in state {:?}",
                status
            ))),
        })
    }

    pub fn complete(&self, name: &str) -> Result<Experiment> {
        self.transition(name, |experiment, now| match experiment.status {
            ExperimentStatus::Running | ExperimentStatus::Paused => {
                experiment.status = ExperimentStatus::Completed;
                experiment.completed_at = Some(now);
                Ok(())
            }
            status => Err(GateError::InvalidState(format!(
                "cannot complete experiment in state {:?}",
                status
            ))),
        })
    }

    /// Assign a key to a variant. Sticky: a previously assigned pair keeps
    /// its variant; new pairs get a deterministic weighted pick.
    pub fn assign(&self, experiment_name: &str, key: &str) -> Result<VariantAssignment> {
        let experiment = self
            .experiments
            .read()
            .get(experiment_name)
            .cloned()
            .ok_or_else(|| GateError::NotFound(format!("experiment {}", experiment_name)))?;
        if experiment.status != ExperimentStatus::Running {
            return Err(GateError::InvalidState(format!(
                "experiment is {:?}",
                experiment.status
            )));
        }

        let pair = (experiment_name.to_string(), key.to_string());
        let mut assignments = self.assignments.write();
        if let Some(existing) = assignments.get(&pair) {
            return Ok(existing.clone());
        }

        let variant = pick_variant(&experiment.variants, experiment_name, key);
        let assignment = VariantAssignment {
            experiment_name: experiment_name.to_string(),
            key: key.to_string(),
            variant,
            assigned_at: self.clock.now_ms(),
        };
        assignments.insert(pair, assignment.clone());
        info!(experiment = experiment_name, variant = %assignment.variant, "variant assigned");
        Ok(assignment)
    }

    pub fn get_assignment(&self, experiment_name: &str, key: &str) -> Option<VariantAssignment> {
        self.assignments
            .read()
            .get(&(experiment_name.to_string(), key.to_string()))
            .cloned()
    }

    /// Record a conversion for the key's assigned variant.
    pub fn record_conversion(&self, experiment_name: &str, key: &str) -> Result<()> {
        let assignment = self
            .get_assignment(experiment_name, key)
            .ok_or_else(|| GateError::NotFound("assignment".to_string()))?;
        *self
            .conversions
            .write()
            .entry((experiment_name.to_string(), assignment.variant))
            .or_insert(0) += 1;
        Ok(())
    }

    pub fn results(&self, experiment_name: &str) -> Result<Vec<VariantResult>> {
        let experiment = self
            .experiments
            .read()
            .get(experiment_name)
            .cloned()
            .ok_or_else(|| GateError::NotFound(format!("experiment {}", experiment_name)))?;

        let assignments = self.assignments.read();
        let conversions = self.conversions.read();
        Ok(experiment
            .variants
            .iter()
            .map(|variant| VariantResult {
                variant: variant.name.clone(),
                assignments: assignments
                    .values()
                    .filter(|a| a.experiment_name == experiment_name && a.variant == variant.name)
                    .count() as u64,
                conversions: conversions
                    .get(&(experiment_name.to_string(), variant.name.clone()))
                    .copied()
                    .unwrap_or(0),
            })
            .collect())
    }

    pub fn get_experiment(&self, name: &str) -> Option<Experiment> {
        self.experiments.read().get(name).cloned()
    }

    pub fn list_experiments(&self) -> Vec<Experiment> {
        self.experiments.read().values().cloned().collect()
    }

    fn transition<F>(&self, name: &str, f: F) -> Result<Experiment>
    where
        F: FnOnce(&mut Experiment, u64) -> Result<()>,
    {
        let now = self.clock.now_ms();
        let mut experiments = self.experiments.write();
        let experiment = experiments
            .get_mut(name)
            .ok_or_else(|| GateError::NotFound(format!("experiment {}", name)))?;
        f(experiment, now)?;
        Ok(experiment.clone())
    }
}

// Deterministic weighted pick: the (experiment, key) hash lands in the
// cumulative weight table.
fn pick_variant(variants: &[Variant], experiment_name: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(experiment_name.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let sample = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));

    let total: u64 = variants.iter().map(|v| v.weight as u64).sum();
    let offset = sample % total.max(1);
    let mut cumulative = 0u64;
    for variant in variants {
        cumulative += variant.weight as u64;
        if offset < cumulative {
            return variant.name.clone();
        }
    }
    variants
        .last()
        .map(|v| v.name.clone())
        .unwrap_or_default()
}
