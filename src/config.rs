//! Static gateway configuration.
//!
//! Built once at startup, either from command-line flags or from a JSON
//! document passed via the `CGI_GATEWAY_CONFIG` environment variable, and
//! shared read-only by the engine and the selected backend.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::error::GatewayError;

/// Environment variable holding a JSON encoded [`GatewayConfig`].
pub const CONFIG_ENV: &str = "CGI_GATEWAY_CONFIG";

/// Top-level configuration for the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address: `host:port` for TCP, a socket path for Unix.
    pub listen: String,

    /// Listener kind.
    pub protocol: Protocol,

    /// URL prefix routed to the gateway; stripped before resolution.
    pub prefix: String,

    /// Directory holding the units. For the docker runner this is the image
    /// name prefix instead.
    pub base_dir: PathBuf,

    /// Required unit name suffix (e.g. `.cgi`, `.wasm`, `:latest`).
    pub suffix: String,

    /// Backend name looked up in the registry.
    pub runner: String,

    /// Upper bound on a single execution.
    #[serde(deserialize_with = "deserialize_timeout")]
    pub timeout: Option<Duration>,

    /// Container mount specs, `source:target[,opt,...]`.
    pub docker_mounts: Vec<String>,

    /// Working directory inside the container.
    pub docker_workdir: Option<String>,

    /// Forward the request's trace context to units as `HTTP_TRACEPARENT`.
    pub propagate_trace: bool,

    /// Capacity of the in-memory stdout/stderr capture of the sandbox backend.
    pub sandbox_output_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "localhost:8080".into(),
            protocol: Protocol::Tcp,
            prefix: "/".into(),
            base_dir: ".".into(),
            suffix: String::new(),
            runner: "os".into(),
            timeout: None,
            docker_mounts: Vec::new(),
            docker_workdir: None,
            propagate_trace: false,
            sandbox_output_limit: 16 * 1024 * 1024,
        }
    }
}

/// Listener kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Unix,
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: Option<f64> = Option::deserialize(deserializer)?;
    match secs {
        Some(s) if s.is_finite() && s > 0.0 => Ok(Some(Duration::from_secs_f64(s))),
        Some(s) if s == 0.0 => Ok(None),
        Some(s) => Err(serde::de::Error::custom(format!("invalid timeout: {s}"))),
        None => Ok(None),
    }
}

impl GatewayConfig {
    /// Load configuration from the `CGI_GATEWAY_CONFIG` environment variable.
    pub fn from_env() -> Result<Self> {
        let json = std::env::var(CONFIG_ENV)
            .with_context(|| format!("{CONFIG_ENV} not set"))?;
        Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}"))
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Make `base_dir` absolute. Skipped for the docker runner, where the
    /// base is an image name prefix rather than a directory.
    pub fn absolutize_base_dir(&mut self) -> Result<()> {
        if self.runner == "docker" {
            return Ok(());
        }
        let abs = std::fs::canonicalize(&self.base_dir)
            .with_context(|| format!("Base directory not found: {}", self.base_dir.display()))?;
        debug!(base_dir = %abs.display(), "Resolved base directory");
        self.base_dir = abs;
        Ok(())
    }

    /// `(SERVER_NAME, SERVER_PORT)` derived from the listen address.
    pub fn server_name_port(&self) -> (String, String) {
        if self.protocol == Protocol::Unix {
            return (self.listen.clone(), String::new());
        }
        match self.listen.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.to_string()),
            None => (self.listen.clone(), String::new()),
        }
    }

    /// Base directory as a string, for `DOCUMENT_ROOT`.
    pub fn document_root(&self) -> String {
        self.base_dir.to_string_lossy().into_owned()
    }

    /// Parse every configured container mount spec.
    pub fn mounts(&self) -> Result<Vec<MountSpec>, GatewayError> {
        self.docker_mounts.iter().map(|s| s.parse()).collect()
    }
}

/// Kind of container mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
    Npipe,
    Cluster,
}

/// A parsed `source:target[,opt,...]` mount spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub kind: MountKind,
    pub read_only: bool,
}

impl FromStr for MountSpec {
    type Err = GatewayError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| GatewayError::Config(format!("mount spec {spec:?}: {why}"));

        let (source, rest) = spec.split_once(':').ok_or_else(|| invalid("missing ':'"))?;
        // `target:opts` and `target,opts` are both accepted.
        let (target, opts) = match rest.split_once(':') {
            Some((target, opts)) => (target, opts),
            None => rest.split_once(',').unwrap_or((rest, "")),
        };
        if target.is_empty() {
            return Err(invalid("empty target"));
        }

        let mut mount = Self {
            source: source.to_string(),
            target: target.to_string(),
            kind: MountKind::Bind,
            read_only: false,
        };
        for opt in opts.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match opt {
                "ro" => mount.read_only = true,
                "rw" => mount.read_only = false,
                "volume" => mount.kind = MountKind::Volume,
                "tmpfs" => mount.kind = MountKind::Tmpfs,
                "npipe" => mount.kind = MountKind::Npipe,
                "cluster" => mount.kind = MountKind::Cluster,
                other => return Err(invalid(&format!("unknown option {other:?}"))),
            }
        }
        if mount.source.is_empty() && mount.kind != MountKind::Tmpfs {
            return Err(invalid("empty source"));
        }
        Ok(mount)
    }
}
