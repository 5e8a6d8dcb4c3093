//! Run reporting: engine telemetry events, counters, summaries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use std::time::SystemTime;

/// Telemetry emitted by the engine while scenarios run. Consumers read these
/// from the sink's channel; reporting aggregates them into `RunCounters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    Started,
    Request,
    Response { elapsed_ns: u64 },
    Error { message: String },
    Match {
        success: bool,
        expected: Value,
        got: Value,
        expression: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus an aggregation task. Drop every clone of the sink to let
    /// the collector finish.
    pub fn collecting() -> (Self, JoinHandle<RunCounters>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut counters = RunCounters::default();
            while let Some(event) = rx.recv().await {
                counters.absorb(&event);
            }
            counters
        });
        (Self::new(tx), handle)
    }

    /// Sink plus the raw event stream, for tests that assert on telemetry.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        // a missing consumer is not an error
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounters {
    pub started: u64,
    pub requests: u64,
    pub responses: u64,
    pub errors: u64,
    pub matches: u64,
}

impl RunCounters {
    pub fn absorb(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Started => self.started = self.started.saturating_add(1),
            EngineEvent::Request => self.requests = self.requests.saturating_add(1),
            EngineEvent::Response { .. } => self.responses = self.responses.saturating_add(1),
            EngineEvent::Error { .. } => self.errors = self.errors.saturating_add(1),
            EngineEvent::Match { .. } => self.matches = self.matches.saturating_add(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Pass,
    Fail,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reporter {
    Pretty,
    Json,
}

impl clap::ValueEnum for Reporter {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Pretty, Self::Json]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Pretty => clap::builder::PossibleValue::new("pretty"),
            Self::Json => clap::builder::PossibleValue::new("json"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIdentity {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub seed: u64,
    #[serde(rename = "reportPath", skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VuCounts {
    pub launched: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: ExitStatus,
    pub identity: RunIdentity,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    pub vus: VuCounts,
    pub counters: RunCounters,
}

impl RunSummary {
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "status={:?} runId={} seed={}\n",
            self.status, self.identity.run_id, self.identity.seed
        ));
        out.push_str(&format!(
            "vus: launched={} completed={} failed={}\n",
            self.vus.launched, self.vus.completed, self.vus.failed
        ));
        out.push_str(&format!(
            "requests={} responses={} errors={} matches={}\n",
            self.counters.requests, self.counters.responses, self.counters.errors,
            self.counters.matches
        ));
        if let Some(path) = &self.identity.report_path {
            out.push_str(&format!("report={path}\n"));
        }
        out.trim_end().to_string()
    }
}

pub fn wall_time_iso_utc() -> String {
    // This is for metadata (startedAt/finishedAt), not for execution decisions.
    // We use `SystemTime` here to avoid the `time` crate's implicit local timezone issues.
    let now = SystemTime::now();
    let dt: time::OffsetDateTime = now.into();
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
