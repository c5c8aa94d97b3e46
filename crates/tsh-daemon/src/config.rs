//! Daemon configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tsh_core::{TshError, TshResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub sessions: SessionsSection,
}

/// `[server]` section: where to connect and how to authenticate.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default)]
    pub url: String,
    /// Fixed bearer token.
    #[serde(default)]
    pub token: Option<String>,
    /// File the token is read from on every poll.
    #[serde(default)]
    pub token_file: Option<String>,
    #[serde(default = "default_token_poll_interval")]
    pub token_poll_interval: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            token_file: None,
            token_poll_interval: default_token_poll_interval(),
            write_timeout: default_write_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

/// `[shell]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellSection {
    #[serde(default = "default_shell_command")]
    pub command: String,
    #[serde(default)]
    pub user: Option<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            command: default_shell_command(),
            user: None,
        }
    }
}

/// Terminal geometry, also the `[terminal]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminalConfig {
    #[serde(default = "default_terminal_width")]
    pub width: u16,
    #[serde(default = "default_terminal_height")]
    pub height: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            width: default_terminal_width(),
            height: default_terminal_height(),
        }
    }
}

/// `[limits]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsSection {
    #[serde(default = "default_max_user_sessions")]
    pub max_user_sessions: usize,
    #[serde(default = "default_max_shells_spawned")]
    pub max_shells_spawned: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_user_sessions: default_max_user_sessions(),
            max_shells_spawned: default_max_shells_spawned(),
        }
    }
}

/// `[sessions]` section. All durations in seconds; 0 disables expiry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsSection {
    #[serde(default)]
    pub expire_after: u64,
    #[serde(default)]
    pub expire_after_idle: u64,
    #[serde(default = "default_sweep_frequency")]
    pub sweep_frequency: u64,
    #[serde(default)]
    pub print_status: bool,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            expire_after: 0,
            expire_after_idle: 0,
            sweep_frequency: default_sweep_frequency(),
            print_status: false,
        }
    }
}

fn default_token_poll_interval() -> u64 {
    5
}
fn default_write_timeout() -> u64 {
    2
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_reconnect_delay() -> u64 {
    3
}
fn default_shell_command() -> String {
    "/bin/sh".to_string()
}
fn default_terminal_width() -> u16 {
    80
}
fn default_terminal_height() -> u16 {
    24
}
fn default_max_user_sessions() -> usize {
    1
}
fn default_max_shells_spawned() -> usize {
    16
}
fn default_sweep_frequency() -> u64 {
    32
}

/// Where bearer tokens come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Static(String),
    File(PathBuf),
}

/// Command-line overrides, applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub token_file: Option<String>,
    pub shell_command: Option<String>,
    pub user: Option<String>,
    pub terminal_width: Option<u16>,
    pub terminal_height: Option<u16>,
    pub max_user_sessions: Option<usize>,
    pub max_shells_spawned: Option<usize>,
    pub max_reconnect_attempts: Option<u32>,
    pub expire_after: Option<u64>,
    pub expire_after_idle: Option<u64>,
    pub print_status: bool,
}

/// Resolved daemon configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub server_url: String,
    pub token_source: Option<TokenSource>,
    pub token_poll_interval: Duration,
    pub write_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub shell_command: String,
    pub user: Option<String>,
    pub terminal: TerminalConfig,
    pub max_user_sessions: usize,
    pub max_shells_spawned: usize,
    pub expire_sessions_after: Duration,
    pub expire_sessions_after_idle: Duration,
    pub sweep_frequency: Duration,
    pub print_status: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), &ConfigOverrides::default())
    }
}

impl DaemonConfig {
    /// Load config from a TOML file (defaults if it does not exist), then
    /// apply CLI overrides and validate.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> TshResult<Self> {
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

        let config = Self::from_file(file_config, overrides);
        config.validate()?;
        Ok(config)
    }

    /// Parse the TOML config file format.
    pub fn parse(content: &str) -> TshResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| TshError::Config(format!("config parse error: {e}")))
    }

    /// Merge a parsed file with CLI overrides. Does not validate.
    pub fn from_file(file: ConfigFile, overrides: &ConfigOverrides) -> Self {
        let token = overrides.token.clone().or(file.server.token);
        let token_file = overrides.token_file.clone().or(file.server.token_file);
        // An explicit token wins over a token file.
        let token_source = match (token, token_file) {
            (Some(token), _) if !token.is_empty() => Some(TokenSource::Static(token)),
            (_, Some(path)) if !path.is_empty() => Some(TokenSource::File(expand_tilde_str(&path))),
            _ => None,
        };

        let user = overrides
            .user
            .clone()
            .or(file.shell.user)
            .filter(|u| !u.is_empty());

        Self {
            server_url: overrides.server_url.clone().unwrap_or(file.server.url),
            token_source,
            token_poll_interval: Duration::from_secs(file.server.token_poll_interval),
            write_timeout: Duration::from_secs(file.server.write_timeout),
            max_reconnect_attempts: overrides
                .max_reconnect_attempts
                .unwrap_or(file.server.max_reconnect_attempts),
            reconnect_delay: Duration::from_secs(file.server.reconnect_delay),
            shell_command: overrides
                .shell_command
                .clone()
                .unwrap_or(file.shell.command),
            user,
            terminal: TerminalConfig {
                width: overrides.terminal_width.unwrap_or(file.terminal.width),
                height: overrides.terminal_height.unwrap_or(file.terminal.height),
            },
            max_user_sessions: overrides
                .max_user_sessions
                .unwrap_or(file.limits.max_user_sessions),
            max_shells_spawned: overrides
                .max_shells_spawned
                .unwrap_or(file.limits.max_shells_spawned),
            expire_sessions_after: Duration::from_secs(
                overrides.expire_after.unwrap_or(file.sessions.expire_after),
            ),
            expire_sessions_after_idle: Duration::from_secs(
                overrides
                    .expire_after_idle
                    .unwrap_or(file.sessions.expire_after_idle),
            ),
            sweep_frequency: Duration::from_secs(file.sessions.sweep_frequency),
            print_status: overrides.print_status || file.sessions.print_status,
        }
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> TshResult<()> {
        let url = self.server_url.to_lowercase();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TshError::Config(format!(
                "server url must start with ws:// or wss:// (got {:?})",
                self.server_url
            )));
        }
        if self.token_source.is_none() {
            return Err(TshError::Config(
                "no token source configured (set server.token or server.token_file)".into(),
            ));
        }
        if self.shell_command.trim().is_empty() {
            return Err(TshError::Config("shell command is empty".into()));
        }
        if self.terminal.width == 0 || self.terminal.height == 0 {
            return Err(TshError::Config(format!(
                "terminal size must be non-zero (got {}x{})",
                self.terminal.width, self.terminal.height
            )));
        }
        if self.max_user_sessions == 0 || self.max_shells_spawned == 0 {
            return Err(TshError::Config(
                "max_user_sessions and max_shells_spawned must be at least 1".into(),
            ));
        }
        if self.sweep_frequency.is_zero() {
            return Err(TshError::Config("sweep_frequency must be at least 1 second".into()));
        }
        Ok(())
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
