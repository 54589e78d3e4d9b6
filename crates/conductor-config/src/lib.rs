//! Layered YAML configuration for the conductor server.
//!
//! Configuration is YAML. Layers are **deep-merged** — each layer only needs
//! to set the fields it wants to override.
//!
//! Search order (later overrides earlier):
//! 1. `/etc/conductor/config.yaml`
//! 2. `~/.config/conductor/config.yaml`
//! 3. `.conductor/config.yaml` (workspace-local)
//! 4. Path given explicitly to [`load`].
//! 5. CLI flag overrides, applied by the caller after `load` returns (see
//!    `conductor::cli::apply_overrides`).
//!
//! All defaults are production-safe: `load(None)` yields a loopback bind,
//! a `./data` directory, and `default` permission mode with no file present.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_permission_mode() -> String {
    "default".to_string()
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_keepalive_secs() -> u64 {
    30
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub agent: AgentTransportConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            agent: AgentTransportConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

/// HTTP / WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// `host:port` to listen on. Default: `127.0.0.1:8000` (loopback only).
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Directory holding the session registry and per-session message logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds of silence on a session WebSocket before the server sends a
    /// `ping` and starts the keep-alive timeout.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            data_dir: default_data_dir(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

/// Configuration for the reference agent transport (spawns a CLI subprocess).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTransportConfig {
    /// Executable used to drive a session's agent, e.g. `"claude"`.
    #[serde(default = "default_agent_command")]
    pub command: String,

    /// Extra arguments passed to the command on every session start.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Permission mode newly created sessions start in, unless the caller
    /// specifies one explicitly.
    #[serde(default = "default_permission_mode")]
    pub default_permission_mode: String,
}

impl Default for AgentTransportConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            extra_args: Vec::new(),
            default_permission_mode: default_permission_mode(),
        }
    }
}

/// Per-subsystem debug switches, toggled independently so a noisy subsystem
/// can be isolated without turning on global trace logging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub adapter: bool,
    #[serde(default)]
    pub broker: bool,
    #[serde(default)]
    pub coordinator: bool,
    #[serde(default)]
    pub gateway: bool,
}

// ── Loader ────────────────────────────────────────────────────────────────────

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/conductor/config.yaml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/conductor/config.yaml"));
    }
    paths.push(PathBuf::from(".conductor/config.yaml"));
    paths
}

/// Load and deep-merge all present config layers, then an optional explicit
/// file. Returns production-safe defaults when nothing is found.
pub fn load(extra: Option<&Path>) -> anyhow::Result<ServerConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: ServerConfig = if matches!(&merged, serde_yaml::Value::Mapping(m) if m.is_empty())
    {
        ServerConfig::default()
    } else {
        serde_yaml::from_value(merged).context("deserializing merged config")?
    };
    Ok(config)
}

fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
