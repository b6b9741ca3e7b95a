use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Where fallback notifications go.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Log instead of pushing.
    #[default]
    Log,
    /// POST to an HTTP push relay.
    Webhook,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationConfig {
    pub provider: ProviderKind,
    pub endpoint: Option<String>,
    /// Characters of message text included in a notification body.
    pub preview_chars: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Log,
            endpoint: None,
            preview_chars: default_preview_chars(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntitlementConfig {
    /// Messages per trailing 24h; `None` disables the limit.
    pub daily_limit: Option<u32>,
    pub unlimited_users: Vec<String>,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Directory holding the SQLite database.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// HMAC secret shared with the account service for bearer tokens.
    pub jwt_secret: String,
    pub notifications: NotificationConfig,
    pub entitlements: EntitlementConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("data_dir", &self.data_dir)
            .field("logging_enabled", &self.logging_enabled)
            .field("jwt_secret", &"<redacted>")
            .field("notifications", &self.notifications)
            .field("entitlements", &self.entitlements)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: format!("127.0.0.1:{}", default_port()),
            data_dir: default_data_dir(),
            logging_enabled: default_logging(),
            jwt_secret: String::new(),
            notifications: NotificationConfig::default(),
            entitlements: EntitlementConfig::default(),
        }
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    notifications: FileNotifications,
    #[serde(default)]
    entitlements: FileEntitlements,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileAuth {
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Deserialize)]
struct FileNotifications {
    #[serde(default)]
    provider: ProviderKind,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default = "default_preview_chars")]
    preview_chars: usize,
}

#[derive(Deserialize, Default)]
struct FileEntitlements {
    #[serde(default)]
    daily_limit: Option<u32>,
    #[serde(default)]
    unlimited_users: Vec<String>,
}

fn default_port() -> u16 {
    8787
}

fn default_logging() -> bool {
    true
}

fn default_preview_chars() -> usize {
    100
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileNotifications {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Log,
            endpoint: None,
            preview_chars: default_preview_chars(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("COURIER_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/courier.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };
        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut secret = file_cfg.auth.secret;

        // environment overrides
        if let Ok(p) = std::env::var("COURIER_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("COURIER_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(s) = std::env::var("COURIER_JWT_SECRET") {
            secret = Some(s);
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        let jwt_secret = secret
            .filter(|s| !s.is_empty())
            .context("missing auth secret (set [auth] secret or COURIER_JWT_SECRET)")?;

        let notifications = NotificationConfig {
            provider: file_cfg.notifications.provider,
            endpoint: file_cfg.notifications.endpoint,
            preview_chars: file_cfg.notifications.preview_chars.max(1),
        };
        if notifications.provider == ProviderKind::Webhook && notifications.endpoint.is_none() {
            anyhow::bail!("webhook provider requires notifications.endpoint");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        Ok(Self {
            bind,
            data_dir,
            logging_enabled: logging,
            jwt_secret,
            notifications,
            entitlements: EntitlementConfig {
                daily_limit: file_cfg.entitlements.daily_limit,
                unlimited_users: file_cfg.entitlements.unlimited_users,
            },
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("courier.db")
    }
}

/// Determine the default data directory for the server.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/courier");
        p
    } else {
        PathBuf::from("./courier_data")
    }
}
