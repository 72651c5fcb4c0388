//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toolbox_core::{ToolboxError, ToolboxResult, WindowSize};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub terminal: TerminalSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub command_log: CommandLogSection,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

/// `[terminal]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Local shell command; `$SHELL` (or `/bin/sh`) when unset.
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            shell: None,
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

/// `[cache]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_idle_timeout")]
    pub ssh_idle_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub elasticsearch_idle_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ssh_idle_secs: default_idle_timeout(),
            elasticsearch_idle_secs: default_idle_timeout(),
        }
    }
}

/// `[command_log]` section. Without a database the history lives in memory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandLogSection {
    #[serde(default)]
    pub database: Option<String>,
}

/// One `[[hosts]]` entry: an SSH target addressed by `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    pub id: String,
    /// `host` or `host:port`.
    pub address: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

fn default_port() -> u16 {
    8021
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_reap_interval() -> u64 {
    60
}
fn default_log_dir() -> String {
    "~/.toolbox/terminal".to_string()
}
fn default_cols() -> u16 {
    toolbox_core::messages::DEFAULT_COLS
}
fn default_rows() -> u16 {
    toolbox_core::messages::DEFAULT_ROWS
}
fn default_idle_timeout() -> u64 {
    600
}

/// CLI values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub log_dir: Option<String>,
    pub database: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub reap_interval: Duration,
    pub log_dir: PathBuf,
    pub shell: Option<String>,
    pub default_size: WindowSize,
    pub ssh_idle_timeout: Duration,
    pub elasticsearch_idle_timeout: Duration,
    pub database: Option<PathBuf>,
    pub hosts: Vec<HostEntry>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> ToolboxResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    pub fn parse(content: &str) -> ToolboxResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| ToolboxError::Config(format!("config parse error: {e}")))
    }

    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> ToolboxResult<Self> {
        let mut seen = std::collections::HashSet::new();
        for host in &file.hosts {
            if !seen.insert(host.id.as_str()) {
                return Err(ToolboxError::Config(format!("duplicate host id: {}", host.id)));
            }
        }

        let log_dir = cli.log_dir.unwrap_or(file.terminal.log_dir);
        let database = cli.database.or(file.command_log.database);

        Ok(Self {
            bind: file.server.bind,
            port: cli.port.unwrap_or(file.server.port),
            reap_interval: Duration::from_secs(file.server.reap_interval_secs.max(1)),
            log_dir: expand_tilde_str(&log_dir),
            shell: file.terminal.shell.filter(|s| !s.trim().is_empty()),
            default_size: WindowSize::new(file.terminal.cols, file.terminal.rows)
                .or(WindowSize::default()),
            ssh_idle_timeout: Duration::from_secs(file.cache.ssh_idle_secs),
            elasticsearch_idle_timeout: Duration::from_secs(file.cache.elasticsearch_idle_secs),
            database: database.map(|d| expand_tilde_str(&d)),
            hosts: file.hosts,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
