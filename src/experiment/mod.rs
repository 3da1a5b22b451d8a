//! A/B assignment.
//!
//! A visitor is bucketed deterministically from a persisted anonymous id, so
//! the same visitor sees the same variant for as long as the assignment
//! cookie lives. Visitors outside the traffic allocation get control and no
//! cookie, which lets them be re-evaluated if the allocation grows.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::storage::{experiment_key, KeyValueStore, USER_ID_KEY};

pub mod hash;

pub use hash::{allocation_bucket, bucket, rolling_hash, variant_bucket};

pub const USER_ID_TTL_DAYS: i64 = 90;
pub const ASSIGNMENT_TTL_DAYS: i64 = 90;
const WEIGHT_TOLERANCE: f64 = 0.01;
// Absorbs float error in sums like 33.33 * 3, which lands just past 0.01.
const WEIGHT_SLACK: f64 = 1e-9;

fn full_allocation() -> f64 {
    100.0
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub weight: f64,
    #[serde(default)]
    pub name: String,
}

impl Variant {
    pub fn new(id: &str, weight: f64) -> Self {
        Self {
            id: id.to_string(),
            weight,
            name: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// The first variant is control.
    pub variants: Vec<Variant>,
    #[serde(default = "full_allocation")]
    pub traffic_allocation: f64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl Experiment {
    pub fn control(&self) -> Option<&Variant> {
        self.variants.first()
    }

    pub fn variant(&self, id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |reason: String| PipelineError::ConfigValidation {
            experiment_id: self.id.clone(),
            reason,
        };
        if self.variants.is_empty() {
            return Err(fail("no variants".to_string()));
        }
        if self.variants.iter().any(|v| !(0.0..=100.0).contains(&v.weight)) {
            return Err(fail("variant weight outside 0..=100".to_string()));
        }
        let total: f64 = self.variants.iter().map(|v| v.weight).sum();
        if (total - 100.0).abs() > WEIGHT_TOLERANCE + WEIGHT_SLACK {
            return Err(fail(format!("variant weights sum to {}", total)));
        }
        if !(0.0..=100.0).contains(&self.traffic_allocation) {
            return Err(fail(format!("traffic allocation {} outside 0..=100", self.traffic_allocation)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Allocation<'a> {
    /// Outside the traffic allocation: show control, persist nothing.
    Excluded,
    Assigned(&'a Variant),
}

/// Pure bucketing for one visitor, ignoring any stored assignment.
pub fn allocate<'a>(experiment: &'a Experiment, user_id: &str) -> Allocation<'a> {
    if allocation_bucket(user_id, &experiment.id) as f64 >= experiment.traffic_allocation {
        return Allocation::Excluded;
    }
    let b = variant_bucket(user_id, &experiment.id) as f64;
    let mut cumulative = 0.0;
    for variant in &experiment.variants {
        cumulative += variant.weight;
        if cumulative > b {
            return Allocation::Assigned(variant);
        }
    }
    match experiment.control() {
        Some(control) => Allocation::Assigned(control),
        None => Allocation::Excluded,
    }
}

pub struct ExperimentEngine {
    experiments: Vec<Experiment>,
    cookies: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl ExperimentEngine {
    /// Enabled experiments that fail validation are disabled here, once.
    pub fn new(experiments: Vec<Experiment>, cookies: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let experiments = experiments
            .into_iter()
            .map(|mut exp| {
                if exp.enabled {
                    if let Err(err) = exp.validate() {
                        log(
                            Level::Error,
                            Domain::Experiment,
                            "experiment_disabled",
                            obj(&[
                                ("experiment_id", v_str(&exp.id)),
                                ("msg", v_str(&err.to_string())),
                            ]),
                        );
                        exp.enabled = false;
                    }
                }
                exp
            })
            .collect();
        Self {
            experiments,
            cookies,
            clock,
        }
    }

    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    pub fn experiment(&self, id: &str) -> Option<&Experiment> {
        self.experiments.iter().find(|e| e.id == id)
    }

    /// Stable anonymous id, created on first use.
    pub fn get_user_id(&self) -> String {
        if let Some(id) = self.cookies.get(USER_ID_KEY).filter(|id| !id.is_empty()) {
            return id;
        }
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(9)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        let id = format!("u_{}_{}", self.clock.now().timestamp_millis(), suffix);
        self.cookies
            .set(USER_ID_KEY, &id, Some(Duration::days(USER_ID_TTL_DAYS)));
        id
    }

    /// Variant to show for `experiment_id`. `None` only for an unknown id or
    /// an experiment without variants.
    pub fn get_variant(&self, experiment_id: &str) -> Option<Variant> {
        let exp = self.experiment(experiment_id)?;
        let control = exp.control()?;
        if !exp.enabled {
            return Some(control.clone());
        }

        let key = experiment_key(experiment_id);
        if let Some(stored) = self.cookies.get(&key) {
            if let Some(variant) = exp.variant(&stored) {
                return Some(variant.clone());
            }
            log(
                Level::Info,
                Domain::Experiment,
                "stale_assignment",
                obj(&[
                    ("experiment_id", v_str(experiment_id)),
                    ("variant_id", v_str(&stored)),
                ]),
            );
        }

        let user_id = self.get_user_id();
        match allocate(exp, &user_id) {
            Allocation::Excluded => Some(control.clone()),
            Allocation::Assigned(variant) => {
                self.cookies
                    .set(&key, &variant.id, Some(Duration::days(ASSIGNMENT_TTL_DAYS)));
                log(
                    Level::Debug,
                    Domain::Experiment,
                    "assigned",
                    obj(&[
                        ("experiment_id", v_str(experiment_id)),
                        ("variant_id", v_str(&variant.id)),
                        ("bucket", json!(variant_bucket(&user_id, experiment_id))),
                    ]),
                );
                Some(variant.clone())
            }
        }
    }

    /// Variant id for every enabled experiment.
    pub fn get_all_assignments(&self) -> BTreeMap<String, String> {
        self.experiments
            .iter()
            .filter(|e| e.enabled)
            .filter_map(|e| self.get_variant(&e.id).map(|v| (e.id.clone(), v.id)))
            .collect()
    }

    /// QA override: pin this visitor to `variant_id`. Returns false when the
    /// experiment or variant does not exist or the write failed.
    pub fn force_variant(&self, experiment_id: &str, variant_id: &str) -> bool {
        let known = self
            .experiment(experiment_id)
            .and_then(|e| e.variant(variant_id))
            .is_some();
        known
            && self.cookies.set(
                &experiment_key(experiment_id),
                variant_id,
                Some(Duration::days(ASSIGNMENT_TTL_DAYS)),
            )
    }

    pub fn reset_assignment(&self, experiment_id: &str) {
        self.cookies.remove(&experiment_key(experiment_id));
    }
}

pub fn load_catalog(path: &str) -> Result<Vec<Experiment>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let experiments = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))?;
    Ok(experiments)
}

/// Experiments running on the marketing site.
pub fn default_catalog() -> Vec<Experiment> {
    vec![
        Experiment {
            id: "hero_headline".to_string(),
            name: "Hero headline copy".to_string(),
            variants: vec![Variant::new("control", 50.0), Variant::new("outcome_led", 50.0)],
            traffic_allocation: 100.0,
            enabled: true,
        },
        Experiment {
            id: "pricing_layout".to_string(),
            name: "Pricing table layout".to_string(),
            variants: vec![
                Variant::new("control", 34.0),
                Variant::new("annual_first", 33.0),
                Variant::new("comparison_grid", 33.0),
            ],
            traffic_allocation: 50.0,
            enabled: true,
        },
        Experiment {
            id: "chat_prompt_delay".to_string(),
            name: "Chat prompt delay".to_string(),
            variants: vec![Variant::new("control", 50.0), Variant::new("delayed_30s", 50.0)],
            traffic_allocation: 100.0,
            enabled: false,
        },
    ]
}
