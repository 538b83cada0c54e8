use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::client::ReconnectPolicy;
use crate::ws::MIN_OUTBOX_CAPACITY;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [server]
//                    sweep_interval_secs = 10
//
//   env var:         SHEET_SERVER__SWEEP_INTERVAL_SECS=10   (double underscore = nesting)

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;

/// Named configuration presets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// host=127.0.0.1
    Local,
    /// host=0.0.0.0
    Server,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub client: ClientFileConfig,
}

/// Relay tuning knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "default_max_message_kb")]
    pub max_message_kb: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            ws_path: default_ws_path(),
            sweep_interval_secs: default_sweep_interval_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            send_queue_capacity: default_send_queue_capacity(),
            max_message_kb: default_max_message_kb(),
        }
    }
}

/// Reconnecting client knobs (lives under `[client]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default = "default_client_url")]
    pub url: String,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ClientFileConfig {
    fn default() -> Self {
        Self {
            url: default_client_url(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_ping_interval_secs() -> u64 {
    20
}
fn default_send_queue_capacity() -> usize {
    100
}
fn default_max_message_kb() -> usize {
    1024
}
fn default_client_url() -> String {
    format!("ws://{}:{}/ws", DEFAULT_HOST, DEFAULT_PORT)
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    8
}

/// Build a figment that layers: defaults → profile defaults → config.toml → SHEET_* env vars.
///
/// The CLI profile takes priority over the config file profile.
pub fn load_config(data_dir: &Path, cli_profile: Option<&Profile>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    // Pass 1: peek at profile from config.toml/env (CLI overrides file)
    let base = Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("SHEET_").split("__"));

    let profile: Option<Profile> = cli_profile
        .cloned()
        .or_else(|| base.extract_inner("profile").ok());

    // Pass 2: rebuild with profile defaults as a layer between defaults and config.toml
    let profile_layer = profile_to_file_config(profile.as_ref());

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Serialized::defaults(profile_layer))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("SHEET_").split("__"))
}

/// Fields not set by the profile remain at their struct defaults so figment
/// does not override explicit user values from config.toml / env.
fn profile_to_file_config(profile: Option<&Profile>) -> FileConfig {
    let host = match profile {
        Some(Profile::Local) => "127.0.0.1",
        Some(Profile::Server) => "0.0.0.0",
        None => return FileConfig::default(),
    };
    FileConfig {
        profile: profile.cloned(),
        server: ServerFileConfig {
            host: Some(host.to_string()),
            ..Default::default()
        },
        client: Default::default(),
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Relay configuration for runtime behavior.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upgrade path for the share socket
    pub ws_path: String,
    pub sweep_interval: Duration,
    pub ping_interval: Duration,
    /// Per-connection outbound queue depth; a full queue evicts the connection.
    /// Never below [`MIN_OUTBOX_CAPACITY`].
    pub send_queue_capacity: usize,
    pub max_message_bytes: usize,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        let ws_path = if fc.ws_path.starts_with('/') {
            fc.ws_path.clone()
        } else {
            format!("/{}", fc.ws_path)
        };
        Self {
            host: fc.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: fc.port.unwrap_or(DEFAULT_PORT),
            ws_path,
            // Zero would make tokio intervals panic
            sweep_interval: Duration::from_secs(fc.sweep_interval_secs.max(1)),
            ping_interval: Duration::from_secs(fc.ping_interval_secs.max(1)),
            send_queue_capacity: fc.send_queue_capacity.max(MIN_OUTBOX_CAPACITY),
            max_message_bytes: fc.max_message_kb * 1024,
        }
    }

    /// Apply CLI overrides for the listen address.
    pub fn with_overrides(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client configuration for the reconnecting connector.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub url: String,
    pub policy: ReconnectPolicy,
}

impl ClientConfig {
    pub fn from_file(fc: &ClientFileConfig) -> Self {
        Self {
            url: fc.url.clone(),
            policy: ReconnectPolicy {
                base_delay: Duration::from_millis(fc.base_delay_ms),
                max_delay: Duration::from_millis(fc.max_delay_ms.max(fc.base_delay_ms)),
                max_attempts: fc.max_attempts,
            },
        }
    }
}

// =============================================================================
// Directory layout config (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SheetShareConfig {
    pub data_dir: PathBuf,
}

impl SheetShareConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".sheet-share"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
