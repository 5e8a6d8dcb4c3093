//! Scenario file parsing and step specifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::path::{Path, PathBuf};

use crate::{
    ConfigOverlay, SimBehavior, VolleyError, VolleyResult, classify, parse_think,
    recognized_key_count,
};

#[derive(Debug, Clone)]
pub struct ScenarioPath {
    path: PathBuf,
}

impl ScenarioPath {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }
}

/// A scenario document: one ordered flow of steps executed per virtual user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub version: u32,
    pub name: String,
    /// Optional config overlay applied on top of `volley.toml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    /// Scripted remote-peer behavior for the sim transport backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim: Option<SimBehavior>,
    pub flow: Vec<StepSpec>,
}

/// One flow entry. Anything that is not a think or loop construct is kept as
/// a raw map: classification decides between a service request and a
/// delegate step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    Think(ThinkSpec),
    Loop(LoopSpec),
    Request(serde_json::Map<String, Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThinkSpec {
    /// A duration string ("250ms") or a number of seconds.
    pub think: Value,
    /// Overrides `defaults.think.jitter` for this pause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopSpec {
    #[serde(rename = "loop")]
    pub steps: Vec<StepSpec>,
    /// Fixed iteration count; ignored when `over` supplies values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Iterate once per supplied value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over: Option<Vec<Value>>,
    /// Variable name the current iteration value is exposed under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_value: Option<String>,
}

impl ScenarioSpec {
    pub fn load(path: &ScenarioPath) -> VolleyResult<ScenarioSpec> {
        let raw = std::fs::read_to_string(path.as_path())?;
        serde_json::from_str(&raw).map_err(|err| {
            VolleyError::Scenario(format!(
                "failed to parse {}: {err}",
                path.as_path().display()
            ))
        })
    }

    pub fn validate(&self) -> VolleyResult<()> {
        if self.version != 1 {
            return Err(VolleyError::Scenario(format!(
                "unsupported scenario version {}",
                self.version
            )));
        }
        if self.flow.is_empty() {
            return Err(VolleyError::Scenario("scenario flow is empty".to_string()));
        }
        validate_steps(&self.flow)
    }

    pub fn config_overlay(&self) -> VolleyResult<Option<ConfigOverlay>> {
        self.config
            .as_ref()
            .map(|raw| {
                serde_json::from_value(raw.clone()).map_err(|err| {
                    VolleyError::Scenario(format!("invalid config block: {err}"))
                })
            })
            .transpose()
    }

    /// Validation plus a per-step classification summary, for `volley check`.
    pub fn check(&self) -> VolleyResult<CheckReport> {
        self.validate()?;
        let steps = self
            .flow
            .iter()
            .enumerate()
            .map(|(index, step)| checked_step(index, step))
            .collect::<VolleyResult<Vec<_>>>()?;
        Ok(CheckReport {
            name: self.name.clone(),
            steps,
        })
    }
}

fn validate_steps(steps: &[StepSpec]) -> VolleyResult<()> {
    for (index, step) in steps.iter().enumerate() {
        match step {
            StepSpec::Think(think) => {
                parse_think(&think.think)
                    .map_err(|err| VolleyError::Scenario(format!("step {index}: {err}")))?;
            }
            StepSpec::Loop(spec) => {
                if spec.count.is_none() && spec.over.as_ref().is_none_or(Vec::is_empty) {
                    return Err(VolleyError::Scenario(format!(
                        "step {index}: loop requires a count or a non-empty over sequence"
                    )));
                }
                validate_steps(&spec.steps)?;
            }
            StepSpec::Request(map) => {
                // delegate steps (no method key) are validated by their engine
                if recognized_key_count(map) > 0 {
                    classify(map)
                        .map_err(|err| VolleyError::Scenario(format!("step {index}: {err}")))?;
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub name: String,
    pub steps: Vec<CheckedStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckedStep {
    pub index: usize,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

fn checked_step(index: usize, step: &StepSpec) -> VolleyResult<CheckedStep> {
    let (kind, event) = match step {
        StepSpec::Think(_) => ("think".to_string(), None),
        StepSpec::Loop(_) => ("loop".to_string(), None),
        StepSpec::Request(map) => {
            if recognized_key_count(map) == 0 {
                ("delegate".to_string(), None)
            } else {
                let (method, details) = classify(map)?;
                let event = if details.is_authenticate() {
                    "authenticate".to_string()
                } else {
                    format!("{}::{}", details.service, method.wire_suffix())
                };
                ("emit".to_string(), Some(event))
            }
        }
    };
    Ok(CheckedStep { index, kind, event })
}
