// CLI surface (§4.I). One long-lived `server` command (the default when no
// subcommand is given) plus small utility subcommands that read the data
// directory directly without starting the server, mirroring the teacher's
// `Cli`/`Commands` split in cli.rs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "conductor",
    about = "Headless server that multiplexes concurrent AI coding-agent sessions over a browser UI",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to bind the HTTP/WebSocket listener to, e.g. "0.0.0.0".
    /// Overrides the `http.bind` host from the loaded config.
    #[arg(long, env = "CONDUCTOR_HOST")]
    pub host: Option<String>,

    /// Port to bind the HTTP/WebSocket listener to.
    /// Overrides the `http.bind` port from the loaded config.
    #[arg(long, env = "CONDUCTOR_PORT")]
    pub port: Option<u16>,

    /// Directory holding the session registry and per-session message logs.
    #[arg(long, env = "CONDUCTOR_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Path to an explicit config file, applied after the well-known search
    /// paths and before these CLI flags.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace). Ignored if RUST_LOG is set.
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Enable adapter-subsystem debug logging regardless of --verbose.
    #[arg(long)]
    pub debug_adapter: bool,

    /// Enable permission-broker debug logging regardless of --verbose.
    #[arg(long)]
    pub debug_broker: bool,

    /// Enable coordinator debug logging regardless of --verbose.
    #[arg(long)]
    pub debug_coordinator: bool,

    /// Enable gateway (HTTP/WebSocket) debug logging regardless of --verbose.
    #[arg(long)]
    pub debug_gateway: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server (default when no subcommand is given).
    Server,

    /// Print the effective configuration, after CLI overrides, as YAML.
    ShowConfig,

    /// List the sessions recorded in the data directory without starting
    /// the server or touching any running adapters.
    ListSessions,
}

impl Cli {
    /// Layer this invocation's flags onto a loaded config as the final
    /// override step (§4.H: "CLI flags ... applied last as a final overlay").
    pub fn apply_overrides(&self, mut config: conductor_config::ServerConfig) -> conductor_config::ServerConfig {
        if let Some(host) = &self.host {
            config.http.bind = rebind_host(&config.http.bind, host);
        }
        if let Some(port) = self.port {
            config.http.bind = rebind_port(&config.http.bind, port);
        }
        if let Some(dir) = &self.data_dir {
            config.http.data_dir = dir.clone();
        }
        config.debug.adapter |= self.debug_adapter;
        config.debug.broker |= self.debug_broker;
        config.debug.coordinator |= self.debug_coordinator;
        config.debug.gateway |= self.debug_gateway;
        config
    }
}

fn rebind_host(bind: &str, host: &str) -> String {
    match bind.rsplit_once(':') {
        Some((_, port)) => format!("{host}:{port}"),
        None => format!("{host}:8000"),
    }
}

fn rebind_port(bind: &str, port: u16) -> String {
    match bind.rsplit_once(':') {
        Some((host, _)) => format!("{host}:{port}"),
        None => format!("{bind}:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_override_preserves_existing_port() {
        let mut config = conductor_config::ServerConfig::default();
        config.http.bind = "127.0.0.1:8000".to_string();
        let cli = Cli {
            command: None,
            host: Some("0.0.0.0".to_string()),
            port: None,
            data_dir: None,
            config: None,
            verbose: 0,
            debug_adapter: false,
            debug_broker: false,
            debug_coordinator: false,
            debug_gateway: false,
        };
        let merged = cli.apply_overrides(config);
        assert_eq!(merged.http.bind, "0.0.0.0:8000");
    }

    #[test]
    fn port_override_preserves_existing_host() {
        let mut config = conductor_config::ServerConfig::default();
        config.http.bind = "127.0.0.1:8000".to_string();
        let cli = Cli {
            command: None,
            host: None,
            port: Some(9000),
            data_dir: None,
            config: None,
            verbose: 0,
            debug_adapter: false,
            debug_broker: false,
            debug_coordinator: false,
            debug_gateway: false,
        };
        let merged = cli.apply_overrides(config);
        assert_eq!(merged.http.bind, "127.0.0.1:9000");
    }

    #[test]
    fn data_dir_override_replaces_default() {
        let config = conductor_config::ServerConfig::default();
        let cli = Cli {
            command: None,
            host: None,
            port: None,
            data_dir: Some(PathBuf::from("/tmp/conductor-data")),
            config: None,
            verbose: 0,
            debug_adapter: false,
            debug_broker: false,
            debug_coordinator: false,
            debug_gateway: false,
        };
        let merged = cli.apply_overrides(config);
        assert_eq!(merged.http.data_dir, PathBuf::from("/tmp/conductor-data"));
    }
}
