use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::frame::write_frame;
use crate::ControlEnvelope;

const ACK_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AutostartResponse {
    pub ack: String,
    pub daemon_was_started: bool,
}

/// Sends one envelope and returns the hub's acknowledgement.
///
/// The hub answers every connection with the same literal; launch outcomes are
/// reported through its notification channel, never on this socket.
pub fn send(socket_path: &Path, envelope: &ControlEnvelope) -> Result<String> {
    let mut stream = UnixStream::connect(socket_path)
        .with_context(|| format!("failed to connect to socket {}", socket_path.display()))?;
    stream
        .set_read_timeout(Some(ACK_READ_TIMEOUT))
        .context("failed to set acknowledgement timeout")?;

    write_frame(&mut stream, envelope).context("failed to write control frame")?;
    stream
        .shutdown(Shutdown::Write)
        .context("failed to half-close control connection")?;

    let mut ack = String::new();
    stream
        .read_to_string(&mut ack)
        .context("failed to read hub acknowledgement")?;
    if ack.trim().is_empty() {
        bail!("hub closed the connection without acknowledging");
    }
    Ok(ack)
}

pub fn send_with_autostart(
    socket_path: &Path,
    envelope: &ControlEnvelope,
    autostart: bool,
) -> Result<AutostartResponse> {
    if UnixStream::connect(socket_path).is_err() && autostart {
        eprintln!("hub unavailable, starting nvhubd...");
        start_daemon(socket_path)?;
        wait_for_listener(socket_path, Duration::from_secs(3))?;
        let ack = send(socket_path, envelope)?;
        return Ok(AutostartResponse {
            ack,
            daemon_was_started: true,
        });
    }

    let ack = send(socket_path, envelope)?;
    Ok(AutostartResponse {
        ack,
        daemon_was_started: false,
    })
}

/// Waits until something accepts connections on `socket_path`.
///
/// The test connection is closed without a frame, which the hub treats as a
/// no-op.
pub fn wait_for_listener(socket_path: &Path, timeout: Duration) -> Result<()> {
    let attempts = (timeout.as_millis() / 100).max(1) as usize;
    let mut last_error: Option<anyhow::Error> = None;

    for _ in 0..attempts {
        match UnixStream::connect(socket_path) {
            Ok(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
                return Ok(());
            }
            Err(err) => {
                last_error = Some(err.into());
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("timed out waiting for hub")))
}

pub fn start_daemon(socket_path: &Path) -> Result<()> {
    let spawn = Command::new(nvhubd_binary_name())
        .arg("--socket")
        .arg(socket_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    match spawn {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(local_nvhubd) = detect_local_nvhubd_binary() {
                let local_spawn = Command::new(local_nvhubd)
                    .arg("--socket")
                    .arg(socket_path)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn();
                if local_spawn.is_ok() {
                    return Ok(());
                }
            }

            Command::new("cargo")
                .args(["run", "-q", "-p", "nvhubd", "--", "--socket"])
                .arg(socket_path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .context("failed to spawn nvhubd via cargo fallback")?;
            Ok(())
        }
        Err(err) => Err(err).context("failed to spawn nvhubd"),
    }
}

/// Looks for `nvhubd` next to the running executable (and one level up, for
/// `target/debug/deps` test binaries).
pub fn detect_local_nvhubd_binary() -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let mut candidates = Vec::new();

    if let Some(bin_dir) = current_exe.parent() {
        candidates.push(bin_dir.join(nvhubd_binary_name()));
        if let Some(debug_dir) = bin_dir.parent() {
            candidates.push(debug_dir.join(nvhubd_binary_name()));
        }
    }

    candidates.into_iter().find(|candidate| candidate.is_file())
}

pub const fn nvhubd_binary_name() -> &'static str {
    "nvhubd"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_frame;
    use crate::{ControlMessage, LaunchRequest, CONTROL_ACK};
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn send_writes_frame_and_returns_ack() {
        let dir = tempdir_path("client-send");
        let socket_path = dir.join("hub.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let envelope = read_frame(&mut stream).unwrap();
            stream.write_all(CONTROL_ACK.as_bytes()).unwrap();
            envelope.into_message().unwrap()
        });

        let request = LaunchRequest::new("/tmp/project", "nvim");
        let ack = send(&socket_path, &ControlEnvelope::run(request.clone())).unwrap();
        assert_eq!(ack, CONTROL_ACK);
        assert_eq!(server.join().unwrap(), ControlMessage::Run(request));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn send_without_listener_fails_with_socket_context() {
        let dir = tempdir_path("client-missing");
        let err = send(
            &dir.join("missing.sock"),
            &ControlEnvelope::run(LaunchRequest::new("/tmp", "nvim")),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("failed to connect to socket"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn tempdir_path(label: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("nvhub-{label}-{nanos}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
