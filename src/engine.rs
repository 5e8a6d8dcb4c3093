//! Engine: step execution, scenario compilation, virtual-user runs.

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand_chacha::ChaCha20Rng;
use rand_core::RngCore as _;
use serde_json::Value;
use uuid::Uuid;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    CheckReport, Config, ConnectionManager, DelegateEngine, EngineEvent, EventSink, ExitStatus,
    LoopSpec, Method, ReplyPlan, RequestDetails, RunCounters, RunIdentity, RunSummary,
    ScenarioPath, ScenarioSpec, SimTransport, StepSpec, ThinkSpec, Transport, UnsupportedDelegate,
    VolleyError, VolleyResult, VuContext, VuCounts, classify, compile, correlate, parse_think,
    recognized_key_count, template, wall_time_iso_utc,
};

/// One compiled flow entry, invoked once per scenario pass (or per loop
/// iteration) against the shared virtual-user context.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, ctx: &mut VuContext) -> VolleyResult<()>;
}

pub type StepFn = Box<dyn Step>;

/// A compiled scenario: takes ownership of a fresh context, runs every step
/// strictly in order, and hands the context back with the outcome.
pub type ScenarioFn =
    Arc<dyn Fn(VuContext) -> BoxFuture<'static, (VolleyResult<()>, VuContext)> + Send + Sync>;

/// Composes the classifier, connection manager, reply correlator and
/// response processor into per-step functions, and sequences those into
/// scenario executions.
pub struct Engine {
    config: Arc<Config>,
    connections: ConnectionManager,
    delegate: Arc<dyn DelegateEngine>,
    events: EventSink,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        delegate: Arc<dyn DelegateEngine>,
        events: EventSink,
    ) -> Self {
        let connections = ConnectionManager::new(transport, config.clone());
        Self {
            config,
            connections,
            delegate,
            events,
        }
    }

    /// Compile one flow entry into a step function.
    pub fn step(&self, spec: &StepSpec) -> VolleyResult<StepFn> {
        match spec {
            StepSpec::Think(think) => self.think_step(think),
            StepSpec::Loop(spec) => self.loop_step(spec),
            StepSpec::Request(map) => {
                if recognized_key_count(map) == 0 {
                    // not a service call; the delegate engine owns it
                    return self.delegate.step(map);
                }
                self.emit_step(map)
            }
        }
    }

    /// Compile a whole flow into one sequential scenario execution. The
    /// returned function opens the default namespace first, short-circuits
    /// on the first failure, and always tears connections down before
    /// reporting.
    pub fn compile_scenario(&self, flow: &[StepSpec]) -> VolleyResult<ScenarioFn> {
        let steps: Vec<StepFn> = flow
            .iter()
            .map(|spec| self.step(spec))
            .collect::<VolleyResult<_>>()?;
        let steps = Arc::new(steps);
        let pending = flow
            .iter()
            .filter(|spec| !matches!(spec, StepSpec::Think(_)))
            .count() as u64;
        let connections = self.connections.clone();
        let events = self.events.clone();

        let scenario: ScenarioFn = Arc::new(move |mut ctx: VuContext| {
            let steps = steps.clone();
            let connections = connections.clone();
            let events = events.clone();
            let fut: BoxFuture<'static, (VolleyResult<()>, VuContext)> =
                Box::pin(async move {
                    ctx.success_count = 0;
                    ctx.pending_requests = pending;
                    events.emit(EngineEvent::Started);

                    let result = run_steps(&connections, &steps, &mut ctx).await;
                    // teardown runs exactly once, success or failure
                    connections.release_all(&mut ctx).await;
                    if let Err(err) = &result {
                        tracing::debug!(uid = ctx.uid, code = err.code(), "scenario failed: {err}");
                        events.emit(EngineEvent::Error {
                            message: err.to_string(),
                        });
                    }
                    (result, ctx)
                });
            fut
        });
        Ok(scenario)
    }

    fn think_step(&self, spec: &ThinkSpec) -> VolleyResult<StepFn> {
        let base = parse_think(&spec.think)?;
        let jitter = spec.jitter.unwrap_or(self.config.defaults.think.jitter);
        Ok(Box::new(ThinkStep { base, jitter }))
    }

    fn loop_step(&self, spec: &LoopSpec) -> VolleyResult<StepFn> {
        if spec.count.is_none() && spec.over.as_ref().is_none_or(Vec::is_empty) {
            return Err(VolleyError::Scenario(
                "loop requires a count or a non-empty over sequence".to_string(),
            ));
        }
        let steps: Vec<StepFn> = spec
            .steps
            .iter()
            .map(|nested| self.step(nested))
            .collect::<VolleyResult<_>>()?;
        Ok(Box::new(LoopStep {
            steps,
            over: spec.over.clone().filter(|values| !values.is_empty()),
            count: spec.count.unwrap_or(0),
            loop_value: spec
                .loop_value
                .clone()
                .unwrap_or_else(|| "$loopElement".to_string()),
        }))
    }

    fn emit_step(&self, map: &serde_json::Map<String, Value>) -> VolleyResult<StepFn> {
        let (method, details) = classify(map)?;
        Ok(Box::new(EmitStep {
            method,
            details,
            connections: self.connections.clone(),
            events: self.events.clone(),
            timeout_secs: self.config.timeout,
        }))
    }
}

struct ThinkStep {
    base: Duration,
    jitter: f64,
}

#[async_trait]
impl Step for ThinkStep {
    async fn run(&self, ctx: &mut VuContext) -> VolleyResult<()> {
        let pause = jittered(self.base, self.jitter, &mut ctx.rng);
        tokio::time::sleep(pause).await;
        Ok(())
    }
}

/// Repeats its nested steps over a fixed count or a supplied value sequence,
/// exposing the current iteration value in the shared context.
struct LoopStep {
    steps: Vec<StepFn>,
    over: Option<Vec<Value>>,
    count: u64,
    loop_value: String,
}

#[async_trait]
impl Step for LoopStep {
    async fn run(&self, ctx: &mut VuContext) -> VolleyResult<()> {
        let iterations: Vec<Value> = match &self.over {
            Some(values) => values.clone(),
            None => (0..self.count).map(Value::from).collect(),
        };
        for value in iterations {
            ctx.vars.insert(self.loop_value.clone(), value);
            for step in &self.steps {
                step.run(ctx).await?;
            }
        }
        Ok(())
    }
}

struct EmitStep {
    method: Method,
    details: RequestDetails,
    connections: ConnectionManager,
    events: EventSink,
    timeout_secs: u64,
}

#[async_trait]
impl Step for EmitStep {
    /// Acquire the namespace connection, compile the invocation against the
    /// live context, correlate the reply, and record the elapsed time only
    /// on a successful resolution.
    async fn run(&self, ctx: &mut VuContext) -> VolleyResult<()> {
        let namespace = resolve_namespace(&self.details, ctx);
        let conn = self.connections.acquire(&namespace, ctx).await?;

        self.events.emit(EngineEvent::Request);
        let started = Instant::now();
        let invocation = compile(self.method, &self.details, ctx);
        let plan = ReplyPlan::prepare(&self.details, ctx)?;
        correlate(&conn, &invocation, &plan, self.timeout_secs, ctx, &self.events).await?;

        let elapsed_ns = started.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64;
        self.events.emit(EngineEvent::Response { elapsed_ns });
        Ok(())
    }
}

async fn run_steps(
    connections: &ConnectionManager,
    steps: &[StepFn],
    ctx: &mut VuContext,
) -> VolleyResult<()> {
    // the default namespace is opened before the first step
    connections.acquire("/", ctx).await?;
    for step in steps {
        step.run(ctx).await?;
    }
    Ok(())
}

/// The namespace is templated per context and defaults to the root.
fn resolve_namespace(details: &RequestDetails, ctx: &VuContext) -> String {
    match &details.namespace {
        Some(raw) => match template(&Value::String(raw.clone()), ctx) {
            Value::String(s) if !s.is_empty() => s,
            _ => "/".to_string(),
        },
        None => "/".to_string(),
    }
}

fn jittered(base: Duration, jitter: f64, rng: &mut ChaCha20Rng) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    // uniform factor in [1 - jitter, 1 + jitter]
    let unit = (rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
    let factor = (1.0 - jitter + unit * 2.0 * jitter).max(0.0);
    base.mul_f64(factor)
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub vus: u64,
    pub seed: Option<u64>,
    /// Overrides the configured channel-response timeout, in seconds.
    pub timeout: Option<u64>,
    /// Report destination; defaults to `<base_dir>/runs/<run_id>/report.json`.
    pub report_to: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            vus: 1,
            seed: None,
            timeout: None,
            report_to: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub summary: RunSummary,
}

/// Load, validate and execute a scenario with `opt.vus` independent virtual
/// users against the scripted sim transport. Failed instances are never
/// retried here; retry is a policy of the caller.
pub async fn run_scenario(
    config: &Config,
    scenario_path: ScenarioPath,
    opt: &RunOptions,
) -> VolleyResult<RunResult> {
    let scenario = ScenarioSpec::load(&scenario_path)?;
    scenario.validate()?;

    let mut config = config.clone().overlaid(scenario.config_overlay()?);
    if let Some(timeout) = opt.timeout {
        config.timeout = timeout;
    }
    config.require_target()?;

    let seed = opt.seed.unwrap_or_else(gen_seed);
    let run_id = Uuid::new_v4().to_string();
    let started_at = wall_time_iso_utc();
    let started = Instant::now();
    tracing::info!(%run_id, seed, vus = opt.vus, "starting scenario {}", scenario.name);

    let transport: Arc<dyn Transport> =
        Arc::new(SimTransport::new(scenario.sim.clone().unwrap_or_default()));
    let (sink, collector) = EventSink::collecting();
    let engine = Engine::new(
        Arc::new(config.clone()),
        transport,
        Arc::new(UnsupportedDelegate),
        sink.clone(),
    );
    let scenario_fn = engine.compile_scenario(&scenario.flow)?;

    let mut handles = Vec::new();
    for uid in 0..opt.vus {
        let ctx = VuContext::new(uid, seed);
        handles.push(tokio::spawn(scenario_fn(ctx)));
    }

    let mut completed = 0u64;
    let mut failed = 0u64;
    for handle in handles {
        match handle.await {
            Ok((Ok(()), _ctx)) => completed += 1,
            Ok((Err(_), _ctx)) => failed += 1,
            Err(err) => {
                tracing::warn!("virtual user task failed: {err}");
                failed += 1;
            }
        }
    }

    // all sink clones must be gone before the collector drains
    drop(scenario_fn);
    drop(engine);
    drop(sink);
    let counters = match collector.await {
        Ok(counters) => counters,
        Err(err) => {
            tracing::warn!("event collector failed: {err}");
            RunCounters::default()
        }
    };

    let finished_at = wall_time_iso_utc();
    let duration_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
    let status = if failed == 0 {
        ExitStatus::Pass
    } else {
        ExitStatus::Fail
    };

    let artifacts_dir = config.runs_dir().join(&run_id);
    std::fs::create_dir_all(&artifacts_dir)?;
    let report_path = opt
        .report_to
        .clone()
        .unwrap_or_else(|| artifacts_dir.join("report.json"));

    let summary = RunSummary {
        status,
        identity: RunIdentity {
            run_id,
            seed,
            report_path: Some(report_path.to_string_lossy().to_string()),
        },
        started_at,
        finished_at,
        duration_ms,
        vus: VuCounts {
            launched: opt.vus,
            completed,
            failed,
        },
        counters,
    };
    std::fs::write(&report_path, serde_json::to_vec_pretty(&summary)?)?;

    Ok(RunResult { summary })
}

/// Load and validate a scenario without dispatching anything.
pub fn check_scenario(scenario_path: ScenarioPath) -> VolleyResult<CheckReport> {
    let scenario = ScenarioSpec::load(&scenario_path)?;
    scenario.check()
}

fn gen_seed() -> u64 {
    let mut seed = [0u8; 8];
    rand_core::OsRng.fill_bytes(&mut seed);
    u64::from_le_bytes(seed)
}
