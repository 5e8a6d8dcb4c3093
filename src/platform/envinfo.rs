//! Environment and version metadata for `volley env` / `volley version`.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvInfo {
    pub os: String,
    pub arch: String,
    pub volley: VersionInfo,
    pub capabilities: BTreeMap<String, CapabilityInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: option_env!("VOLLEY_COMMIT").map(|s| s.to_string()),
        build_date: option_env!("VOLLEY_BUILD_DATE").map(|s| s.to_string()),
    }
}

pub fn env_info() -> EnvInfo {
    let mut capabilities = BTreeMap::new();
    capabilities.insert(
        "transport".to_string(),
        CapabilityInfo {
            backend: "sim".to_string(),
        },
    );
    capabilities.insert(
        "rng".to_string(),
        CapabilityInfo {
            backend: "chacha20".to_string(),
        },
    );
    capabilities.insert(
        "runtime".to_string(),
        CapabilityInfo {
            backend: "tokio".to_string(),
        },
    );

    EnvInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        volley: version_info(),
        capabilities,
    }
}
