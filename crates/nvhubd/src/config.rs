//! `config.toml`: launch mode, editor-host settings and timing knobs.

use anyhow::{bail, Context, Result};
use nvhub_types::DEFAULT_HOST_SOCKET;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::host::HostTimeouts;
use crate::normalize::{expand_tilde, DEFAULT_SESSION_PATTERN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// One OS process per instance.
    #[default]
    Process,
    /// One long-lived editor host serving a window per instance.
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub socket: PathBuf,
    pub binary: String,
    pub socket_flag: String,
    pub list_timeout: Duration,
    pub create_timeout: Duration,
    pub activate_timeout: Duration,
    pub settle_delay: Duration,
    pub discovery_interval: Duration,
    pub discovery_budget: Duration,
}

impl HostConfig {
    pub fn timeouts(&self) -> HostTimeouts {
        HostTimeouts {
            list: self.list_timeout,
            create: self.create_timeout,
            activate: self.activate_timeout,
            settle: self.settle_delay,
            discovery_interval: self.discovery_interval,
            discovery_budget: self.discovery_budget,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_HOST_SOCKET),
            binary: "neovide".to_string(),
            socket_flag: "--ipc-socket".to_string(),
            list_timeout: Duration::from_millis(50),
            create_timeout: Duration::from_millis(400),
            activate_timeout: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(500),
            discovery_interval: Duration::from_millis(50),
            discovery_budget: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub mode: LaunchMode,
    pub host: HostConfig,
    pub restart: RestartPolicy,
    pub session_pattern: String,
    pub prune_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mode: LaunchMode::default(),
            host: HostConfig::default(),
            restart: RestartPolicy::default(),
            session_pattern: DEFAULT_SESSION_PATTERN.to_string(),
            prune_interval: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHubConfig {
    #[serde(default)]
    mode: Option<LaunchMode>,
    #[serde(default)]
    prune_interval_ms: Option<u64>,
    #[serde(default)]
    host: RawHostConfig,
    #[serde(default)]
    restart: RawRestartConfig,
    #[serde(default)]
    session: RawSessionConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHostConfig {
    #[serde(default)]
    socket: Option<String>,
    #[serde(default)]
    binary: Option<String>,
    #[serde(default)]
    socket_flag: Option<String>,
    #[serde(default)]
    list_timeout_ms: Option<u64>,
    #[serde(default)]
    create_timeout_ms: Option<u64>,
    #[serde(default)]
    activate_timeout_ms: Option<u64>,
    #[serde(default)]
    settle_delay_ms: Option<u64>,
    #[serde(default)]
    discovery_interval_ms: Option<u64>,
    #[serde(default)]
    discovery_budget_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRestartConfig {
    #[serde(default)]
    interval_ms: Option<u64>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSessionConfig {
    #[serde(default)]
    pattern: Option<String>,
}

impl HubConfig {
    /// Reads `path`. A missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config {}", path.display()))
            }
        };
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let parsed: RawHubConfig = toml::from_str(raw).context("failed to parse TOML")?;
        let defaults = Self::default();
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };

        let host_defaults = defaults.host;
        let host = HostConfig {
            socket: parsed
                .host
                .socket
                .as_deref()
                .map(str::trim)
                .filter(|socket| !socket.is_empty())
                .map(expand_tilde)
                .unwrap_or(host_defaults.socket),
            binary: non_blank(parsed.host.binary).unwrap_or(host_defaults.binary),
            socket_flag: non_blank(parsed.host.socket_flag).unwrap_or(host_defaults.socket_flag),
            list_timeout: ms(parsed.host.list_timeout_ms, host_defaults.list_timeout),
            create_timeout: ms(parsed.host.create_timeout_ms, host_defaults.create_timeout),
            activate_timeout: ms(parsed.host.activate_timeout_ms, host_defaults.activate_timeout),
            settle_delay: ms(parsed.host.settle_delay_ms, host_defaults.settle_delay),
            discovery_interval: ms(
                parsed.host.discovery_interval_ms,
                host_defaults.discovery_interval,
            ),
            discovery_budget: ms(parsed.host.discovery_budget_ms, host_defaults.discovery_budget),
        };

        let restart = RestartPolicy {
            interval: ms(parsed.restart.interval_ms, defaults.restart.interval),
            timeout: ms(parsed.restart.timeout_ms, defaults.restart.timeout),
        };
        if restart.interval.is_zero() {
            bail!("restart.interval_ms must be greater than zero");
        }
        if host.discovery_interval.is_zero() {
            bail!("host.discovery_interval_ms must be greater than zero");
        }

        let prune_interval = ms(parsed.prune_interval_ms, defaults.prune_interval);
        if prune_interval.is_zero() {
            bail!("prune_interval_ms must be greater than zero");
        }

        Ok(Self {
            mode: parsed.mode.unwrap_or(defaults.mode),
            host,
            restart,
            session_pattern: non_blank(parsed.session.pattern).unwrap_or(defaults.session_pattern),
            prune_interval,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_means_defaults() {
        let dir = TempDir::new().unwrap();
        let config = HubConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.mode, LaunchMode::Process);
        assert_eq!(config.host.socket, PathBuf::from("/tmp/neovide.sock"));
        assert_eq!(config.restart.timeout, Duration::from_secs(5));
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let config = HubConfig::parse(
            r#"
mode = "host"
prune_interval_ms = 250

[host]
socket = "/run/user/1000/neovide.sock"
create_timeout_ms = 900

[restart]
timeout_ms = 150
"#,
        )
        .unwrap();

        assert_eq!(config.mode, LaunchMode::Host);
        assert_eq!(config.prune_interval, Duration::from_millis(250));
        assert_eq!(config.host.socket, PathBuf::from("/run/user/1000/neovide.sock"));
        assert_eq!(config.host.create_timeout, Duration::from_millis(900));
        assert_eq!(config.host.list_timeout, Duration::from_millis(50));
        assert_eq!(config.restart.timeout, Duration::from_millis(150));
        assert_eq!(config.restart.interval, Duration::from_millis(5));

        let timeouts = config.host.timeouts();
        assert_eq!(timeouts.create, Duration::from_millis(900));
        assert_eq!(timeouts.activate, Duration::from_millis(1000));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "mode = [").unwrap();
        let err = HubConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("invalid config"));

        assert!(HubConfig::parse("mode = \"window\"").is_err());
        assert!(HubConfig::parse("[restart]\ninterval_ms = 0").is_err());
        assert!(HubConfig::parse("unknown_key = 1").is_err());
    }
}
