use anyhow::{Context, Result};
use clap::Parser;
use nvhub_types::{
    default_config_path, default_logs_dir, default_snapshot_path, default_socket_path,
    default_state_path,
};
use nvhubd::config::{HubConfig, LaunchMode};
use nvhubd::control::{bind_control_socket, spawn_control_listener};
use nvhubd::focus::XdotoolFocus;
use nvhubd::host::HostClient;
use nvhubd::normalize::{expand_tilde, SessionConvention};
use nvhubd::notify::DesktopNotifier;
use nvhubd::projects::ProjectRegistry;
use nvhubd::registry::{Hub, HubParts};
use nvhubd::snapshot::SnapshotStore;
use nvhubd::store::KvStore;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "nvhubd", version, about = "Editor instance hub for the nvhub CLI")]
struct Args {
    #[arg(long, env = "NVHUB_SOCKET")]
    socket: Option<PathBuf>,
    #[arg(long, env = "NVHUB_STATE_PATH")]
    state: Option<PathBuf>,
    #[arg(long, env = "NVHUB_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "NVHUB_SNAPSHOT_PATH")]
    snapshot: Option<PathBuf>,
    /// Editor host socket; overrides `[host] socket` in the config file.
    #[arg(long)]
    host_socket: Option<PathBuf>,
    #[arg(long, value_enum)]
    mode: Option<LaunchMode>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let socket_path = args.socket.unwrap_or_else(default_socket_path);
    let state_path = args.state.unwrap_or_else(default_state_path);
    let config_path = args.config.unwrap_or_else(default_config_path);
    let snapshot_path = args.snapshot.unwrap_or_else(default_snapshot_path);

    let mut config = HubConfig::load(&config_path)?;
    if let Some(host_socket) = args.host_socket {
        config.host.socket = expand_tilde(&host_socket.to_string_lossy());
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    let sessions = SessionConvention::new(&config.session_pattern)?;

    // Refuse to start before touching any persisted state a running hub owns.
    let listener = bind_control_socket(&socket_path)?;
    let logs_dir = state_path
        .parent()
        .map(|parent| parent.join("logs"))
        .unwrap_or_else(default_logs_dir);
    fs::create_dir_all(&logs_dir)
        .with_context(|| format!("failed to create log dir {}", logs_dir.display()))?;

    let host = Arc::new(HostClient::from_config(&config.host));
    let notifier = Arc::new(DesktopNotifier::from_env());
    let mut hub = Hub::new(HubParts {
        mode: config.mode,
        sessions,
        restart: config.restart,
        prune_interval: config.prune_interval,
        projects: ProjectRegistry::load(KvStore::new(&state_path)),
        snapshots: SnapshotStore::new(&snapshot_path),
        logs_dir,
        host: host.clone(),
        focus: Arc::new(XdotoolFocus::from_env()),
        notifier: notifier.clone(),
    });
    if let Err(err) = hub.projects_mut().refresh_validity() {
        warn!("failed to refresh project validity on startup: {err:#}");
    }
    hub.restore();

    info!(
        "nvhubd listening on {} ({:?} mode)",
        socket_path.display(),
        config.mode
    );
    let running = Arc::new(AtomicBool::new(true));
    install_signal_handler(running.clone());
    let listener_handle = spawn_control_listener(listener, hub.sender(), notifier, running.clone())?;

    while running.load(Ordering::SeqCst) && !hub.shutdown_requested() {
        let wait = hub.next_wakeup();
        hub.pump(wait);
        hub.tick();
    }

    running.store(false, Ordering::SeqCst);
    host.shut_down();
    if socket_path.exists() {
        let _ = fs::remove_file(&socket_path);
    }
    let _ = listener_handle.join();
    // Managed editors keep running; the snapshot lets the next hub pick them up.
    info!("nvhubd shutdown complete");
    Ok(())
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("NVHUB_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn install_signal_handler(running: Arc<AtomicBool>) {
    static SIGNALLED: AtomicBool = AtomicBool::new(false);

    extern "C" fn handler(_sig: libc::c_int) {
        SIGNALLED.store(true, Ordering::SeqCst);
    }

    unsafe {
        libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
    }

    // The handler may only touch the static; a watcher thread forwards it.
    thread::spawn(move || {
        while !SIGNALLED.load(Ordering::SeqCst) {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
        info!("received signal, initiating graceful shutdown");
        running.store(false, Ordering::SeqCst);
    });
}
