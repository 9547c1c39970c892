//! OS focus transfer. The hub only needs an activation sink; the default one
//! drives `xdotool`.

use anyhow::{bail, Context, Result};
use std::process::Command;
use tracing::debug;

/// Opaque handle for a foreground application window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppHandle {
    pub window: String,
    pub pid: Option<u32>,
}

pub trait FocusSink: Send + Sync {
    /// The window that currently has focus, if it can be determined.
    fn frontmost(&self) -> Option<AppHandle>;
    fn focus_process(&self, pid: u32) -> Result<()>;
    fn focus_application(&self, application: &AppHandle) -> Result<()>;
}

pub struct XdotoolFocus {
    binary: String,
}

impl XdotoolFocus {
    pub fn from_env() -> Self {
        Self::with_binary(xdotool_binary())
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .with_context(|| format!("failed to execute {} {}", self.binary, args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                bail!("{} {} exited with {}", self.binary, args.join(" "), output.status);
            }
            bail!("{} {} failed: {stderr}", self.binary, args.join(" "));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl FocusSink for XdotoolFocus {
    fn frontmost(&self) -> Option<AppHandle> {
        let window = match self.run(&["getactivewindow"]) {
            Ok(window) if !window.is_empty() => window,
            Ok(_) => return None,
            Err(err) => {
                debug!("could not read active window: {err:#}");
                return None;
            }
        };
        let pid = self
            .run(&["getwindowpid", &window])
            .ok()
            .and_then(|raw| raw.parse::<u32>().ok());
        Some(AppHandle { window, pid })
    }

    fn focus_process(&self, pid: u32) -> Result<()> {
        let pid = pid.to_string();
        self.run(&["search", "--limit", "1", "--pid", &pid, "windowactivate"])
            .map(|_| ())
            .with_context(|| format!("no window could be focused for pid {pid}"))
    }

    fn focus_application(&self, application: &AppHandle) -> Result<()> {
        self.run(&["windowactivate", &application.window]).map(|_| ())
    }
}

fn xdotool_binary() -> String {
    std::env::var("NVHUB_XDOTOOL_BIN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "xdotool".to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_script(path: &Path, body: &str) {
        fs::write(path, format!("#!/usr/bin/env sh\n{body}")).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[test]
    fn frontmost_reads_window_and_pid() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("xdotool");
        write_script(
            &script,
            "case \"$1\" in\n  getactivewindow) echo 81788929 ;;\n  getwindowpid) echo 4242 ;;\nesac\n",
        );

        let focus = XdotoolFocus::with_binary(script.to_string_lossy());
        assert_eq!(
            focus.frontmost(),
            Some(AppHandle {
                window: "81788929".to_string(),
                pid: Some(4242),
            })
        );
    }

    #[test]
    fn focus_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("xdotool");
        write_script(&script, "echo 'cannot open display' >&2\nexit 1\n");

        let focus = XdotoolFocus::with_binary(script.to_string_lossy());
        let err = focus.focus_process(12).unwrap_err();
        assert!(format!("{err:#}").contains("cannot open display"));
        assert!(focus.frontmost().is_none());
    }

    #[test]
    fn missing_binary_is_an_error_not_a_panic() {
        let focus = XdotoolFocus::with_binary("xdotool-that-does-not-exist");
        assert!(focus
            .focus_application(&AppHandle {
                window: "1".to_string(),
                pid: None,
            })
            .is_err());
    }
}
