//! CLI-facing control socket: one framed envelope per connection, always acked.

use anyhow::{bail, Context, Result};
use nvhub_types::frame::{read_frame, FrameError};
use nvhub_types::{ControlMessage, CONTROL_ACK};
use std::fs;
use std::io::{self, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::notify::{FailureKind, HubFailure, Notifier};
use crate::registry::HubEvent;

const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Binds the control socket, replacing a stale socket file left by a dead hub.
pub fn bind_control_socket(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory: {}", parent.display()))?;
    }
    match UnixListener::bind(socket_path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            if UnixStream::connect(socket_path).is_ok() {
                bail!(
                    "failed to bind socket: {} (another nvhubd instance is already running)",
                    socket_path.display()
                );
            }
            fs::remove_file(socket_path).with_context(|| {
                format!("failed to remove stale socket: {}", socket_path.display())
            })?;
            UnixListener::bind(socket_path)
                .with_context(|| format!("failed to bind socket: {}", socket_path.display()))
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind socket: {}", socket_path.display()))
        }
    }
}

/// Accepts connections until `running` drops, one handler thread per connection.
pub fn spawn_control_listener(
    listener: UnixListener,
    events: Sender<HubEvent>,
    notifier: Arc<dyn Notifier>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    listener
        .set_nonblocking(true)
        .context("failed to set listener as non-blocking")?;

    Ok(thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let events = events.clone();
                    let notifier = notifier.clone();
                    thread::spawn(move || {
                        if let Err(err) = handle_connection(stream, &events, notifier.as_ref()) {
                            error!("control connection failed: {err:#}");
                        }
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(err) => {
                    warn!("accept error: {err}");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
        debug!("control listener stopped");
    }))
}

pub fn handle_connection(
    mut stream: UnixStream,
    events: &Sender<HubEvent>,
    notifier: &dyn Notifier,
) -> Result<()> {
    stream
        .set_nonblocking(false)
        .context("failed to set client stream as blocking")?;
    stream
        .set_read_timeout(Some(CLIENT_READ_TIMEOUT))
        .context("failed to set client read timeout")?;

    match read_frame(&mut stream) {
        Ok(envelope) => match envelope.into_message() {
            Ok(ControlMessage::Run(request)) => {
                info!(
                    "run request for {} ({})",
                    request.path().unwrap_or(&request.working_directory),
                    request.binary_path
                );
                if events.send(HubEvent::Run(request)).is_err() {
                    warn!("hub is shutting down, dropping run request");
                }
            }
            Ok(ControlMessage::CliError(report)) => {
                let mut failure = HubFailure::new(FailureKind::CliError, report.message);
                for (key, value) in report.details {
                    failure = failure.with(&key, value);
                }
                notifier.notify(&failure);
            }
            Err(err) => warn!("ignoring control message: {err}"),
        },
        Err(FrameError::Empty) => debug!("control connection closed without a frame"),
        Err(err) => warn!("ignoring malformed control frame: {err}"),
    }

    // The client may already be gone; the ack is best effort.
    let _ = stream.write_all(CONTROL_ACK.as_bytes());
    let _ = stream.flush();
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use nvhub_types::client::send;
    use nvhub_types::{CliErrorReport, ControlEnvelope, LaunchRequest};
    use std::collections::BTreeMap;
    use std::io::Read;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn start(dir: &TempDir) -> (std::path::PathBuf, mpsc::Receiver<HubEvent>, RecordingNotifier, Arc<AtomicBool>) {
        let socket = dir.path().join("hub.sock");
        let listener = bind_control_socket(&socket).unwrap();
        let (tx, rx) = mpsc::channel();
        let notifier = RecordingNotifier::default();
        let running = Arc::new(AtomicBool::new(true));
        spawn_control_listener(listener, tx, Arc::new(notifier.clone()), running.clone()).unwrap();
        (socket, rx, notifier, running)
    }

    #[test]
    fn run_envelope_reaches_the_hub_and_is_acked() {
        let dir = TempDir::new().unwrap();
        let (socket, rx, _, running) = start(&dir);

        let mut request = LaunchRequest::new("/home/u/proj", "neovide");
        request.explicit_name = Some("Proj ✓".to_string());
        let ack = send(&socket, &ControlEnvelope::run(request.clone())).unwrap();
        assert_eq!(ack, CONTROL_ACK);

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            HubEvent::Run(received) => assert_eq!(received, request),
            other => panic!("unexpected event {other:?}"),
        }
        running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn cli_error_goes_to_the_notifier() {
        let dir = TempDir::new().unwrap();
        let (socket, rx, notifier, running) = start(&dir);

        let mut details = BTreeMap::new();
        details.insert("cwd".to_string(), "/gone".to_string());
        let report = CliErrorReport {
            message: "working directory vanished".to_string(),
            details,
        };
        assert_eq!(send(&socket, &ControlEnvelope::cli_error(report)).unwrap(), CONTROL_ACK);

        let failures = notifier.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::CliError);
        assert_eq!(failures[0].metadata["cwd"], "/gone");
        assert!(rx.try_recv().is_err());
        running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn garbage_and_empty_connections_are_still_acked() {
        let dir = TempDir::new().unwrap();
        let (socket, rx, _, running) = start(&dir);

        let mut stream = UnixStream::connect(&socket).unwrap();
        let body = b"{not json";
        stream.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
        stream.write_all(body).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        let mut ack = String::new();
        stream.read_to_string(&mut ack).unwrap();
        assert_eq!(ack, CONTROL_ACK);

        let mut stream = UnixStream::connect(&socket).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        let mut ack = String::new();
        stream.read_to_string(&mut ack).unwrap();
        assert_eq!(ack, CONTROL_ACK);

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn stale_socket_file_is_replaced_but_live_one_is_not() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("hub.sock");
        drop(UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        let live = bind_control_socket(&socket).unwrap();
        let err = bind_control_socket(&socket).unwrap_err();
        assert!(format!("{err:#}").contains("already running"));
        drop(live);
    }
}
