use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::handler::DEFAULT_HISTORY_LIMIT;

/// Command line options for the chat server.
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
    /// Path to the SQLite database, or `:memory:`.
    #[arg(long)]
    pub database: Option<PathBuf>,
}

/// Runtime configuration resolved from CLI, environment, file and defaults.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// SQLite database file.
    pub database: PathBuf,
    /// Origin allowed to call the API from a browser.
    pub frontend_url: String,
    /// Messages replayed on `join_room`.
    pub history_limit: usize,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    storage: FileStorage,
    #[serde(default)]
    chat: FileChat,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_frontend_url")]
    frontend_url: String,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileStorage {
    #[serde(default)]
    database: Option<PathBuf>,
}

#[derive(Deserialize)]
struct FileChat {
    #[serde(default = "default_history_limit")]
    history_limit: usize,
}

fn default_port() -> u16 {
    3000
}

fn default_logging() -> bool {
    true
}

fn default_frontend_url() -> String {
    "http://localhost:5173".into()
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_database() -> PathBuf {
    PathBuf::from("chat.db")
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
            frontend_url: default_frontend_url(),
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

impl Default for FileChat {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CHAT_SERVER_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/chat_server.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };
        let mut port = file_cfg.server.port;
        let mut frontend_url = file_cfg.server.frontend_url;
        let mut logging = file_cfg.logging.enabled;
        let mut database = file_cfg.storage.database.unwrap_or_else(default_database);
        let history_limit = file_cfg.chat.history_limit;

        // environment overrides
        if let Some(p) = std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok()) {
            port = p;
        }
        if let Ok(url) = std::env::var("FRONTEND_URL") {
            frontend_url = url;
        }
        if let Some(l) = std::env::var("CHAT_LOGGING")
            .ok()
            .and_then(|l| l.parse::<bool>().ok())
        {
            logging = l;
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            database = PathBuf::from(path);
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }
        if let Some(d) = &cli.database {
            database = d.clone();
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if history_limit == 0 {
            anyhow::bail!("invalid_history_limit");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        Ok(Self {
            bind,
            database,
            frontend_url,
            history_limit,
            logging_enabled: logging,
        })
    }

    /// Configuration for tests: in-memory database, ephemeral bind.
    pub fn in_memory(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            database: PathBuf::from(":memory:"),
            frontend_url: default_frontend_url(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            logging_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn clear_env() {
        for key in ["PORT", "FRONTEND_URL", "CHAT_LOGGING", "DATABASE_PATH", "BIND"] {
            std::env::remove_var(key);
        }
    }

    fn cli_with(contents: &str) -> (tempfile::TempDir, Cli) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, contents).unwrap();
        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        (dir, cli)
    }

    #[test]
    #[serial]
    fn valid_config_parses() {
        clear_env();
        let (_dir, cli) = cli_with(
            "[server]\nport=5555\nfrontend_url=\"https://chat.example\"\n[logging]\nenabled=false\n[storage]\ndatabase=\"/tmp/x.db\"\n[chat]\nhistory_limit=20\n",
        );
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5555");
        assert_eq!(cfg.frontend_url, "https://chat.example");
        assert_eq!(cfg.database, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.history_limit, 20);
        assert!(!cfg.logging_enabled);
    }

    #[test]
    #[serial]
    fn invalid_port_fails() {
        clear_env();
        let (_dir, cli) = cli_with("[server]\nport=80\n");
        assert!(Config::load(&cli).is_err());
    }

    #[test]
    #[serial]
    fn zero_history_fails() {
        clear_env();
        let (_dir, cli) = cli_with("[chat]\nhistory_limit=0\n");
        assert!(Config::load(&cli).is_err());
    }

    #[test]
    #[serial]
    fn missing_keys_defaults() {
        clear_env();
        let (_dir, cli) = cli_with("");
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3000");
        assert_eq!(cfg.frontend_url, "http://localhost:5173");
        assert_eq!(cfg.history_limit, 50);
        assert_eq!(cfg.database, PathBuf::from("chat.db"));
        assert!(cfg.logging_enabled);
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        let (_dir, mut cli) = cli_with("[server]\nport=1111\n");
        std::env::set_var("PORT", "2222");
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:2222");
        cli.port = Some(3333);
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3333");
        std::env::remove_var("PORT");
    }

    #[test]
    #[serial]
    fn database_override_from_env_and_cli() {
        clear_env();
        let (_dir, mut cli) = cli_with("");
        std::env::set_var("DATABASE_PATH", "/data/env.db");
        assert_eq!(Config::load(&cli).unwrap().database, PathBuf::from("/data/env.db"));
        cli.database = Some(PathBuf::from(":memory:"));
        assert_eq!(Config::load(&cli).unwrap().database, PathBuf::from(":memory:"));
        std::env::remove_var("DATABASE_PATH");
    }

    #[test]
    #[serial]
    fn malformed_file_is_an_error() {
        clear_env();
        let (_dir, cli) = cli_with("[server\nport=");
        assert!(Config::load(&cli).is_err());
    }
}
