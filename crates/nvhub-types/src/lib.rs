use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

pub mod client;
pub mod frame;

/// Literal written back on every control-plane connection before it is closed.
pub const CONTROL_ACK: &str = "ok";

pub const DEFAULT_HOST_SOCKET: &str = "/tmp/neovide.sock";
pub const SNAPSHOT_FILE_NAME: &str = "nvhub-instances.json";

/// A request to open (or focus) an editor instance.
///
/// Built once by the CLI and never mutated afterwards; the hub echoes it into
/// snapshots so an instance can be relaunched exactly as it was first opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    pub working_directory: String,
    pub binary_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_argument: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl LaunchRequest {
    pub fn new(working_directory: impl Into<String>, binary_path: impl Into<String>) -> Self {
        Self {
            working_directory: working_directory.into(),
            binary_path: binary_path.into(),
            explicit_name: None,
            path_argument: None,
            extra_args: Vec::new(),
            environment: BTreeMap::new(),
        }
    }

    /// The path argument with blank values treated as absent.
    pub fn path(&self) -> Option<&str> {
        self.path_argument
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
    }
}

/// An error the CLI hit locally and wants the hub to surface to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliErrorReport {
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    Run,
    CliError,
}

/// Wire shape of a control-plane message: `{type, run?, cliError?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<LaunchRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_error: Option<CliErrorReport>,
}

/// Decoded control-plane message with the envelope's optional payloads resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Run(LaunchRequest),
    CliError(CliErrorReport),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("control envelope of type {kind:?} is missing its payload")]
pub struct MissingPayload {
    pub kind: EnvelopeKind,
}

impl ControlEnvelope {
    pub fn run(request: LaunchRequest) -> Self {
        Self {
            kind: EnvelopeKind::Run,
            run: Some(request),
            cli_error: None,
        }
    }

    pub fn cli_error(report: CliErrorReport) -> Self {
        Self {
            kind: EnvelopeKind::CliError,
            run: None,
            cli_error: Some(report),
        }
    }

    pub fn into_message(self) -> Result<ControlMessage, MissingPayload> {
        match self.kind {
            EnvelopeKind::Run => self
                .run
                .map(ControlMessage::Run)
                .ok_or(MissingPayload { kind: self.kind }),
            EnvelopeKind::CliError => self
                .cli_error
                .map(ControlMessage::CliError)
                .ok_or(MissingPayload { kind: self.kind }),
        }
    }
}

pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("nvhub.sock");
    }

    default_data_dir().join("nvhub.sock")
}

pub fn default_data_dir() -> PathBuf {
    if let Some(data_dir) = dirs::data_local_dir() {
        return data_dir.join("nvhub");
    }

    PathBuf::from(".nvhub")
}

pub fn default_state_path() -> PathBuf {
    default_data_dir().join("state.json")
}

pub fn default_logs_dir() -> PathBuf {
    default_data_dir().join("logs")
}

pub fn default_config_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("nvhub").join("config.toml");
    }

    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("nvhub")
            .join("config.toml");
    }

    PathBuf::from(".config/nvhub/config.toml")
}

pub fn default_snapshot_path() -> PathBuf {
    env::temp_dir().join(SNAPSHOT_FILE_NAME)
}
