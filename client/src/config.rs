use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::{fs, path::PathBuf, time::Duration};

use crate::cli::Cli;
use crate::queue::{QueueOptions, DEFAULT_EXPIRY, DEFAULT_SEND_DELAY};

/// Client settings resolved from file, env and CLI.
#[derive(Clone)]
pub struct ClientConfig {
    pub server: String,
    pub token: Option<String>,
    pub queue_file: PathBuf,
    pub queue: QueueOptions,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("queue_file", &self.queue_file)
            .field("queue", &self.queue)
            .finish()
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    queue: FileQueue,
}

#[derive(Deserialize, Default)]
struct FileQueue {
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(default)]
    send_delay_ms: Option<u64>,
    #[serde(default)]
    expiry_hours: Option<u64>,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "courier", "courier-client")
}

/// Default queue file under the platform data directory.
pub fn default_queue_file() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().join("queue.json"))
        .unwrap_or_else(|| PathBuf::from("./courier-queue.json"))
}

fn default_config_file() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().join("client.toml"))
        .unwrap_or_else(|| PathBuf::from("courier-client.toml"))
}

impl ClientConfig {
    /// Resolve configuration: CLI, then environment, then file, then defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("COURIER_CLIENT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(default_config_file);
        let file_cfg = match fs::read_to_string(&config_path) {
            Ok(contents) => toml::from_str::<FileConfig>(&contents).context("invalid config file")?,
            Err(_) => FileConfig::default(),
        };

        let server = cli
            .server
            .clone()
            .or_else(|| std::env::var("COURIER_SERVER").ok())
            .or(file_cfg.server)
            .unwrap_or_else(|| "http://127.0.0.1:8787".to_string());
        let token = cli
            .token
            .clone()
            .or_else(|| std::env::var("COURIER_TOKEN").ok())
            .or(file_cfg.token)
            .filter(|t| !t.is_empty());
        let queue_file = cli
            .queue_file
            .clone()
            .or_else(|| std::env::var("COURIER_QUEUE_FILE").ok().map(PathBuf::from))
            .or(file_cfg.queue.file)
            .unwrap_or_else(default_queue_file);

        let expiry = match file_cfg.queue.expiry_hours {
            None => DEFAULT_EXPIRY,
            Some(0) => anyhow::bail!("queue.expiry_hours must be positive"),
            Some(h) => h
                .checked_mul(60 * 60)
                .map(Duration::from_secs)
                .context("queue.expiry_hours is too large")?,
        };
        let queue = QueueOptions {
            send_delay: file_cfg
                .queue
                .send_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SEND_DELAY),
            expiry,
        };

        Ok(Self {
            server,
            token,
            queue_file,
            queue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "COURIER_SERVER",
            "COURIER_TOKEN",
            "COURIER_QUEUE_FILE",
            "COURIER_CLIENT_CONFIG",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn file_env_cli_precedence() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        fs::write(
            &path,
            "server=\"http://file:1\"\ntoken=\"file-token\"\n[queue]\nfile=\"/tmp/q.json\"\nsend_delay_ms=5\nexpiry_hours=2\n",
        )
        .unwrap();
        let cli = Cli {
            config: Some(path.clone()),
            ..Default::default()
        };
        let cfg = ClientConfig::load(&cli).unwrap();
        assert_eq!(cfg.server, "http://file:1");
        assert_eq!(cfg.queue.send_delay, Duration::from_millis(5));
        assert_eq!(cfg.queue.expiry, Duration::from_secs(7200));
        assert!(!format!("{cfg:?}").contains("file-token"));

        std::env::set_var("COURIER_SERVER", "http://env:2");
        assert_eq!(ClientConfig::load(&cli).unwrap().server, "http://env:2");

        let cli = Cli {
            config: Some(path),
            server: Some("http://cli:3".into()),
            ..Default::default()
        };
        assert_eq!(ClientConfig::load(&cli).unwrap().server, "http://cli:3");
        clear_env();
    }

    #[test]
    #[serial]
    fn expiry_hours_out_of_range_fails() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        let cli = Cli {
            config: Some(path.clone()),
            ..Default::default()
        };
        fs::write(&path, "[queue]\nexpiry_hours=0\n").unwrap();
        assert!(ClientConfig::load(&cli).is_err());
        fs::write(&path, format!("[queue]\nexpiry_hours={}\n", i64::MAX)).unwrap();
        assert!(ClientConfig::load(&cli).is_err());
    }

    #[test]
    #[serial]
    fn defaults_without_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            config: Some(dir.path().join("absent.toml")),
            ..Default::default()
        };
        let cfg = ClientConfig::load(&cli).unwrap();
        assert_eq!(cfg.server, "http://127.0.0.1:8787");
        assert!(cfg.token.is_none());
        assert_eq!(cfg.queue.expiry, DEFAULT_EXPIRY);
    }
}
