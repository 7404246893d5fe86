use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// SCANHUB collaboration server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "scanhub-server", version, about = "SCANHUB collaboration server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "SCANHUB_PORT", default_value = "3001")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "SCANHUB_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./scanhub.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "SCANHUB_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "SCANHUB_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Seconds between heartbeat sweeps over live connections
    #[arg(long, env = "SCANHUB_HEARTBEAT_INTERVAL_SECS", default_value = "30")]
    pub heartbeat_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            bind_address: "0.0.0.0".to_string(),
            config: "./scanhub.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (SCANHUB_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("SCANHUB_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# SCANHUB Collaboration Server Configuration
# Place this file at ./scanhub.toml or specify with --config <path>
# All settings can be overridden via environment variables (SCANHUB_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 3001)
# port = 3001

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for SQLite database and JWT signing key
# data_dir = "./data"

# Seconds between heartbeat sweeps. A connection that misses a full sweep
# cycle without acknowledging the probe is reaped, so worst-case detection
# latency for a dead connection is two intervals.
# heartbeat_interval_secs = 30
"#
    .to_string()
}
