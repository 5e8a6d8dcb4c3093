//! `volley.toml` config loading and the scenario-file overlay.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::path::{Path, PathBuf};

use crate::{VolleyError, VolleyResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Base address of the system under load, e.g. "wss://chat.example.com".
    #[serde(default)]
    pub target: Option<String>,

    /// Transport security options, merged into connect options verbatim.
    #[serde(default)]
    pub tls: Option<Value>,

    /// Transport client options; templated per virtual user before first use.
    #[serde(default)]
    pub transport: Option<Value>,

    /// Channel-response wait timeout, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,

    /// Step pacing defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Base directory for run artifacts.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Defaults {
    #[serde(default)]
    pub think: ThinkDefaults,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ThinkDefaults {
    /// Fractional jitter applied to think pauses, e.g. 0.2 for up to ±20%.
    #[serde(default)]
    pub jitter: f64,
}

/// Scenario files may carry a partial config that wins over `volley.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConfigOverlay {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub tls: Option<Value>,
    #[serde(default)]
    pub transport: Option<Value>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub defaults: Option<Defaults>,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".volley")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: None,
            tls: None,
            transport: None,
            timeout: default_timeout_secs(),
            defaults: Defaults::default(),
            base_dir: default_base_dir(),
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    /// Apply a scenario-file overlay; overlay fields win where present.
    pub fn overlaid(mut self, overlay: Option<ConfigOverlay>) -> Self {
        let Some(overlay) = overlay else {
            return self;
        };
        if overlay.target.is_some() {
            self.target = overlay.target;
        }
        if overlay.tls.is_some() {
            self.tls = overlay.tls;
        }
        if overlay.transport.is_some() {
            self.transport = overlay.transport;
        }
        if let Some(timeout) = overlay.timeout {
            self.timeout = timeout;
        }
        if let Some(defaults) = overlay.defaults {
            self.defaults = defaults;
        }
        self
    }

    pub fn require_target(&self) -> VolleyResult<String> {
        self.target.clone().ok_or_else(|| {
            VolleyError::Config(
                "no target configured (set `target` in volley.toml or the scenario config block)"
                    .to_string(),
            )
        })
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }
}
