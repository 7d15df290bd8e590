// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workload specification parsing.
//!
//! One TOML file per workload. The filename stem is the workload name; the
//! file content describes the image, the rollover strategy, and an opaque
//! container configuration handed to the runtime untouched. Re-parsing is
//! driven by byte-level changes of the file, so a `Spec` only carries the
//! parsed value; byte equality is the provider's concern.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical file extension for workload specs.
pub const SPEC_EXTENSION: &str = "toml";

/// Reserved workload name skipped by the directory provider.
pub const RESERVED_NAME: &str = "self";

const DEFAULT_TIMEOUT_SECS: u64 = 10;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Parsed workload specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Spec {
    /// Container image reference.
    pub image: String,

    /// Rollover strategy used when a running container is replaced.
    #[serde(default)]
    pub deploy: Deploy,

    /// Seconds to wait for a started container to report healthy.
    #[serde(default = "default_timeout")]
    pub health_timeout: u64,

    /// Seconds granted to a container for a graceful stop.
    #[serde(default = "default_timeout")]
    pub stop_timeout: u64,

    /// Restart the workload when the image digest changes upstream.
    #[serde(default)]
    pub watch_image: bool,

    /// Fixed container name. A random suffix is appended when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Opaque container configuration, passed through to the container
    /// runtime without interpretation. Docker API field names apply
    /// (`Env`, `HostConfig`, `NetworkingConfig`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<serde_json::Value>,
}

impl Spec {
    /// Parse a spec from raw file bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, SpecError> {
        let text = std::str::from_utf8(bytes)?;
        let spec: Spec = toml::from_str(text)?;
        if spec.image.is_empty() {
            return Err(SpecError::MissingImage);
        }
        Ok(spec)
    }

    /// Minimal spec for a bare image reference.
    pub fn from_image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            deploy: Deploy::default(),
            health_timeout: DEFAULT_TIMEOUT_SECS,
            stop_timeout: DEFAULT_TIMEOUT_SECS,
            watch_image: false,
            name: None,
            container: None,
        }
    }

    /// Container-create body: the opaque `container` table with the image
    /// reference injected under the Docker API `Image` key.
    pub fn container_body(&self) -> serde_json::Value {
        let mut body = match &self.container {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        body.insert("Image".to_string(), serde_json::Value::String(self.image.clone()));
        serde_json::Value::Object(body)
    }
}

/// Rollover strategy for replacing a running container.
///
/// TOML shape: `deploy = "before"` or `deploy = { after = 2 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DeployRepr", into = "DeployRepr")]
pub enum Deploy {
    /// Stop the current container before starting its replacement.
    Before,
    /// Start the replacement first; stop the old one once it has been
    /// healthy for the grace window.
    After { seconds: u64 },
}

impl Default for Deploy {
    fn default() -> Self {
        Deploy::Before
    }
}

impl Deploy {
    pub fn is_before(self) -> bool {
        matches!(self, Deploy::Before)
    }

    pub fn is_after(self) -> bool {
        matches!(self, Deploy::After { .. })
    }

    /// Grace window in seconds, when the strategy is `After`.
    pub fn grace_seconds(self) -> Option<u64> {
        match self {
            Deploy::Before => None,
            Deploy::After { seconds } => Some(seconds),
        }
    }
}

/// Wire shape of [`Deploy`]: a bare keyword or an `{ after = N }` table.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DeployRepr {
    Keyword(String),
    After { after: u64 },
}

impl TryFrom<DeployRepr> for Deploy {
    type Error = String;

    fn try_from(repr: DeployRepr) -> Result<Self, Self::Error> {
        match repr {
            DeployRepr::Keyword(s) if s.eq_ignore_ascii_case("before") => Ok(Deploy::Before),
            DeployRepr::Keyword(s) => Err(format!(
                "unknown deploy strategy {:?}, expected \"before\" or {{ after = seconds }}",
                s
            )),
            DeployRepr::After { after } => Ok(Deploy::After { seconds: after }),
        }
    }
}

impl From<Deploy> for DeployRepr {
    fn from(deploy: Deploy) -> Self {
        match deploy {
            Deploy::Before => DeployRepr::Keyword("before".to_string()),
            Deploy::After { seconds } => DeployRepr::After { after: seconds },
        }
    }
}

/// Spec file errors. The provider logs these and keeps the previous valid
/// spec in force.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("spec is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("spec parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("spec is missing an image")]
    MissingImage,
}

#[cfg(test)]
#[path = "spec_tests.rs"]
mod tests;
