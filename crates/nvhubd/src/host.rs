//! JSON-RPC client for the long-lived editor host (one window per instance).
//!
//! Every call opens its own connection, writes one newline-terminated request
//! and waits for one line back, bounded by a per-method timeout. Connection
//! failures and timeouts are kept apart from errors the host decoded and
//! rejected, because the hub recovers from them differently.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::poll::{poll_until, PollOutcome, PollSchedule};

pub const METHOD_LIST_WINDOWS: &str = "ListWindows";
pub const METHOD_CREATE_WINDOW: &str = "CreateWindow";
pub const METHOD_ACTIVATE_WINDOW: &str = "ActivateWindow";

const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("{method} timed out after {}ms", .after.as_millis())]
    Timeout { method: String, after: Duration },
    #[error("editor host is not reachable at {}: {source}", .path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{method} rejected by editor host ({code}): {message}")]
    Protocol {
        method: String,
        code: i64,
        message: String,
    },
    #[error("malformed {method} response: {detail}")]
    Malformed { method: String, detail: String },
    #[error("{method} connection failed: {source}")]
    Io {
        method: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to start editor host: {0}")]
    Autostart(String),
    #[error("editor host started but no new window appeared within {}ms", .0.as_millis())]
    DiscoveryTimeout(Duration),
    #[error("editor host client is shutting down")]
    Cancelled,
}

impl HostError {
    /// True when the failure suggests the host went away or restarted, so every
    /// window id the hub holds should be considered stale.
    pub fn is_stale_state(&self) -> bool {
        matches!(
            self,
            HostError::Timeout { .. } | HostError::Unavailable { .. } | HostError::Io { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTimeouts {
    pub list: Duration,
    pub create: Duration,
    pub activate: Duration,
    pub settle: Duration,
    pub discovery_interval: Duration,
    pub discovery_budget: Duration,
}

impl HostTimeouts {
    fn discovery(&self) -> PollSchedule {
        PollSchedule {
            settle: self.settle,
            interval: self.discovery_interval,
            budget: self.discovery_budget,
        }
    }
}

/// Starts the host process with the editor arguments of the window that
/// triggered the autostart.
pub type HostSpawner = Arc<dyn Fn(&[String]) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

pub struct HostClient {
    socket_path: PathBuf,
    timeouts: HostTimeouts,
    spawner: HostSpawner,
    next_id: AtomicU64,
    // Plain creates share the gate; an autostart holds it exclusively so no
    // other window can appear while it diffs window lists.
    launch_gate: RwLock<()>,
    claimed: Mutex<HashSet<String>>,
    shutdown: AtomicBool,
}

impl HostClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeouts: HostTimeouts, spawner: HostSpawner) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeouts,
            spawner,
            next_id: AtomicU64::new(1),
            launch_gate: RwLock::new(()),
            claimed: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        let binary = config.binary.clone();
        let flag = config.socket_flag.clone();
        let socket = config.socket.clone();
        let spawner: HostSpawner =
            Arc::new(move |args: &[String]| spawn_host_process(&binary, &flag, &socket, args));
        Self::new(config.socket.clone(), config.timeouts(), spawner)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Aborts any autostart discovery still polling.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn list_windows(&self) -> Result<Vec<String>, HostError> {
        let result = self.call(METHOD_LIST_WINDOWS, Value::Null, self.timeouts.list)?;
        parse_window_list(&result).ok_or_else(|| HostError::Malformed {
            method: METHOD_LIST_WINDOWS.to_string(),
            detail: format!("expected a window list, got {result}"),
        })
    }

    pub fn create_window(&self, nvim_args: &[String]) -> Result<String, HostError> {
        let result = self.call(
            METHOD_CREATE_WINDOW,
            json!({ "nvim_args": nvim_args }),
            self.timeouts.create,
        )?;
        let window_id = parse_window_id(&result).ok_or_else(|| HostError::Malformed {
            method: METHOD_CREATE_WINDOW.to_string(),
            detail: format!("no window id in {result}"),
        })?;
        self.claim(&window_id);
        Ok(window_id)
    }

    pub fn activate_window(&self, window_id: &str) -> Result<(), HostError> {
        let result = self.call(
            METHOD_ACTIVATE_WINDOW,
            json!({ "window_id": window_id }),
            self.timeouts.activate,
        )?;
        let ok = match &result {
            Value::Bool(ok) => *ok,
            Value::Object(map) => map.get("ok").and_then(Value::as_bool).unwrap_or(true),
            _ => true,
        };
        if !ok {
            return Err(HostError::Protocol {
                method: METHOD_ACTIVATE_WINDOW.to_string(),
                code: 0,
                message: format!("host refused to activate window {window_id}"),
            });
        }
        Ok(())
    }

    /// Creates a window, starting the host first when nothing is listening.
    pub fn open_window(&self, nvim_args: &[String]) -> Result<String, HostError> {
        {
            let _shared = self.launch_gate.read().unwrap_or_else(|err| err.into_inner());
            match self.create_window(nvim_args) {
                Err(HostError::Unavailable { .. }) => {}
                other => return other,
            }
        }

        let _exclusive = self.launch_gate.write().unwrap_or_else(|err| err.into_inner());
        // Another flow may have started the host while we waited for the gate.
        let before: HashSet<String> = match self.list_windows() {
            Ok(_) => return self.create_window(nvim_args),
            Err(HostError::Unavailable { .. }) => HashSet::new(),
            Err(err) => return Err(err),
        };

        info!(
            "editor host not running at {}, starting it",
            self.socket_path.display()
        );
        (self.spawner)(nvim_args).map_err(|err| HostError::Autostart(format!("{err:#}")))?;

        let outcome = poll_until(self.timeouts.discovery(), &self.shutdown, || {
            let windows = match self.list_windows() {
                Ok(windows) => windows,
                Err(err) => {
                    debug!("waiting for editor host: {err}");
                    return None;
                }
            };
            let claimed = self.claimed.lock().unwrap_or_else(|err| err.into_inner());
            windows
                .into_iter()
                .find(|id| !before.contains(id) && !claimed.contains(id))
        });
        match outcome {
            PollOutcome::Ready(window_id) => {
                self.claim(&window_id);
                info!("editor host started with window {window_id}");
                Ok(window_id)
            }
            PollOutcome::TimedOut => {
                warn!("editor host autostart found no new window");
                Err(HostError::DiscoveryTimeout(
                    self.timeouts.settle + self.timeouts.discovery_budget,
                ))
            }
            PollOutcome::Cancelled => Err(HostError::Cancelled),
        }
    }

    fn claim(&self, window_id: &str) {
        let mut claimed = self.claimed.lock().unwrap_or_else(|err| err.into_inner());
        claimed.insert(window_id.to_string());
    }

    fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, HostError> {
        let deadline = Instant::now() + timeout;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let io_err = |source: io::Error| HostError::Io {
            method: method.to_string(),
            source,
        };
        let timed_out = || HostError::Timeout {
            method: method.to_string(),
            after: timeout,
        };

        let mut stream =
            UnixStream::connect(&self.socket_path).map_err(|source| HostError::Unavailable {
                path: self.socket_path.clone(),
                source,
            })?;

        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let mut line = serde_json::to_vec(&request).map_err(|err| HostError::Malformed {
            method: method.to_string(),
            detail: format!("failed to encode request: {err}"),
        })?;
        line.push(b'\n');
        stream
            .set_write_timeout(Some(timeout))
            .map_err(io_err)?;
        stream.write_all(&line).map_err(|err| match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => timed_out(),
            _ => io_err(err),
        })?;

        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }
            stream
                .set_read_timeout(Some(remaining))
                .map_err(io_err)?;
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => {
                    buffer.extend_from_slice(&chunk[..read]);
                    if buffer.contains(&b'\n') {
                        break;
                    }
                    if buffer.len() > MAX_RESPONSE_BYTES {
                        return Err(HostError::Malformed {
                            method: method.to_string(),
                            detail: "response exceeds size limit".to_string(),
                        });
                    }
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(timed_out());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(io_err(err)),
            }
        }

        let line = buffer.split(|byte| *byte == b'\n').next().unwrap_or_default();
        if line.iter().all(u8::is_ascii_whitespace) {
            return Err(HostError::Malformed {
                method: method.to_string(),
                detail: "connection closed without a response".to_string(),
            });
        }
        let response: RpcResponse =
            serde_json::from_slice(line).map_err(|err| HostError::Malformed {
                method: method.to_string(),
                detail: err.to_string(),
            })?;

        if let Some(error) = response.error {
            return Err(HostError::Protocol {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }
        if let Some(response_id) = &response.id {
            if response_id.as_u64() != Some(id) && !response_id.is_null() {
                return Err(HostError::Malformed {
                    method: method.to_string(),
                    detail: format!("response id {response_id} does not match request {id}"),
                });
            }
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

fn spawn_host_process(
    binary: &str,
    socket_flag: &str,
    socket: &Path,
    args: &[String],
) -> anyhow::Result<()> {
    let mut child = Command::new(binary)
        .arg(socket_flag)
        .arg(socket)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .with_context(|| format!("failed to spawn editor host '{binary}'"))?;
    // The host outlives any single window; reap it whenever it exits.
    thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(())
}

/// Accepts `["id", ...]`, `[{"window_id": ..}, ...]` or `{"windows": [...]}`.
fn parse_window_list(result: &Value) -> Option<Vec<String>> {
    let items = match result {
        Value::Array(items) => items,
        Value::Object(map) => map.get("windows")?.as_array()?,
        Value::Null => return Some(Vec::new()),
        _ => return None,
    };
    Some(items.iter().filter_map(window_id_of).collect())
}

fn parse_window_id(result: &Value) -> Option<String> {
    match result {
        Value::Object(map) if map.contains_key("windows") => {
            parse_window_list(result)?.into_iter().next()
        }
        Value::Array(_) => parse_window_list(result)?.into_iter().next(),
        other => window_id_of(other),
    }
}

fn window_id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        Value::Object(map) => ["window_id", "id", "windowId"]
            .iter()
            .find_map(|key| map.get(*key).and_then(window_id_of)),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scriptable in-process editor host.

    use super::*;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixListener;

    pub struct FakeHost {
        pub windows: Arc<Mutex<Vec<String>>>,
        pub stalled: Arc<Mutex<HashSet<String>>>,
        pub rejected: Arc<Mutex<HashSet<String>>>,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeHost {
        pub fn start(socket: &Path, windows: Vec<String>) -> FakeHost {
            let listener = UnixListener::bind(socket).unwrap();
            let host = FakeHost {
                windows: Arc::new(Mutex::new(windows)),
                stalled: Arc::new(Mutex::new(HashSet::new())),
                rejected: Arc::new(Mutex::new(HashSet::new())),
                calls: Arc::new(Mutex::new(Vec::new())),
            };
            let windows = host.windows.clone();
            let stalled = host.stalled.clone();
            let rejected = host.rejected.clone();
            let calls = host.calls.clone();
            thread::spawn(move || {
                let mut created = 0_u32;
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut line = String::new();
                    if reader.read_line(&mut line).is_err() {
                        continue;
                    }
                    let Ok(request) = serde_json::from_str::<Value>(&line) else {
                        continue;
                    };
                    let method = request["method"].as_str().unwrap_or_default().to_string();
                    calls.lock().unwrap().push(method.clone());
                    if stalled.lock().unwrap().contains(&method) {
                        thread::spawn(move || {
                            thread::sleep(Duration::from_secs(2));
                            drop(stream);
                        });
                        continue;
                    }
                    let response = if rejected.lock().unwrap().contains(&method) {
                        json!({
                            "jsonrpc": "2.0",
                            "id": request["id"],
                            "error": {"code": -32000, "message": "window not found"},
                        })
                    } else {
                        let result = match method.as_str() {
                            METHOD_LIST_WINDOWS => json!(windows.lock().unwrap().clone()),
                            METHOD_CREATE_WINDOW => {
                                created += 1;
                                let id = format!("win-{created}");
                                windows.lock().unwrap().push(id.clone());
                                json!({ "window_id": id })
                            }
                            METHOD_ACTIVATE_WINDOW => json!({ "ok": true }),
                            _ => Value::Null,
                        };
                        json!({"jsonrpc": "2.0", "id": request["id"], "result": result})
                    };
                    let mut stream = stream;
                    let _ = writeln!(stream, "{response}");
                }
            });
            host
        }

        pub fn stall(&self, method: &str) {
            self.stalled.lock().unwrap().insert(method.to_string());
        }

        pub fn reject(&self, method: &str) {
            self.rejected.lock().unwrap().insert(method.to_string());
        }

        pub fn count(&self, method: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|call| call.as_str() == method)
                .count()
        }
    }

    pub fn relaxed_timeouts() -> HostTimeouts {
        HostTimeouts {
            list: Duration::from_millis(500),
            create: Duration::from_millis(500),
            activate: Duration::from_millis(150),
            settle: Duration::from_millis(10),
            discovery_interval: Duration::from_millis(10),
            discovery_budget: Duration::from_millis(1000),
        }
    }

    pub fn no_spawner() -> HostSpawner {
        Arc::new(|_: &[String]| -> anyhow::Result<()> {
            anyhow::bail!("autostart disabled in this test")
        })
    }
}
