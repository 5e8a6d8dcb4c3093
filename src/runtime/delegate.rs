//! Delegate boundary for request specifications without a service method key.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Step, StepFn, VolleyError, VolleyResult, VuContext};

/// External engine for non-service steps (e.g. plain HTTP requests). The
/// returned step has the same context contract as service steps and is used
/// verbatim by the scenario compiler.
pub trait DelegateEngine: Send + Sync {
    fn step(&self, spec: &serde_json::Map<String, Value>) -> VolleyResult<StepFn>;
}

/// Default delegate: names the unrecognized keys and fails the step.
pub struct UnsupportedDelegate;

impl DelegateEngine for UnsupportedDelegate {
    fn step(&self, spec: &serde_json::Map<String, Value>) -> VolleyResult<StepFn> {
        Ok(Box::new(UnsupportedStep {
            keys: spec.keys().cloned().collect::<Vec<_>>().join(", "),
        }))
    }
}

struct UnsupportedStep {
    keys: String,
}

#[async_trait]
impl Step for UnsupportedStep {
    async fn run(&self, _ctx: &mut VuContext) -> VolleyResult<()> {
        Err(VolleyError::UnrecognizedRequest(format!(
            "no delegate engine configured for step keys [{}]",
            self.keys
        )))
    }
}
