//! Typed failure signals and the notifier they are delivered to.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::process::Command;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    LaunchFailure,
    ActivationFailure,
    RestartTimeout,
    IpcTimeout,
    IpcUnavailable,
    IpcProtocolError,
    CliError,
}

impl FailureKind {
    pub fn title(self) -> &'static str {
        match self {
            FailureKind::LaunchFailure => "Launch failed",
            FailureKind::ActivationFailure => "Activation failed",
            FailureKind::RestartTimeout => "Restart aborted",
            FailureKind::IpcTimeout => "Editor host timed out",
            FailureKind::IpcUnavailable => "Editor host unavailable",
            FailureKind::IpcProtocolError => "Editor host error",
            FailureKind::CliError => "nvhub error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubFailure {
    pub kind: FailureKind,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

impl HubFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, failure: &HubFailure);
}

/// Logs every failure and forwards it to `notify-send`.
pub struct DesktopNotifier {
    binary: String,
}

impl DesktopNotifier {
    pub fn from_env() -> Self {
        Self {
            binary: notifier_binary(),
        }
    }

    fn send(&self, failure: &HubFailure) -> Result<()> {
        let mut body = failure.message.clone();
        for (key, value) in &failure.metadata {
            body.push_str(&format!("\n{key}: {value}"));
        }
        let output = Command::new(&self.binary)
            .arg(failure.kind.title())
            .arg(body)
            .output()
            .context("failed to execute desktop notifier")?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            bail!("desktop notifier exited with status {}", output.status);
        }
        bail!(
            "desktop notifier exited with status {}: {stderr}",
            output.status
        );
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, failure: &HubFailure) {
        warn!(
            kind = ?failure.kind,
            metadata = ?failure.metadata,
            "{}",
            failure.message
        );
        if let Err(err) = self.send(failure) {
            warn!("failed to deliver desktop notification: {err:#}");
        }
    }
}

fn notifier_binary() -> String {
    std::env::var("NVHUB_NOTIFY_BIN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "notify-send".to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Keeps every failure in memory so assertions can inspect them.

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default)]
    pub struct RecordingNotifier {
        failures: Arc<Mutex<Vec<HubFailure>>>,
    }

    impl RecordingNotifier {
        pub fn failures(&self) -> Vec<HubFailure> {
            self.failures
                .lock()
                .map(|failures| failures.clone())
                .unwrap_or_default()
        }

        pub fn kinds(&self) -> Vec<FailureKind> {
            self.failures().iter().map(|failure| failure.kind).collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, failure: &HubFailure) {
            if let Ok(mut failures) = self.failures.lock() {
                failures.push(failure.clone());
            }
        }
    }
}
