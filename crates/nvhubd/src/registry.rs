//! The instance registry: one live editor instance per canonical location.
//!
//! `Hub` is owned by a single thread. Anything that blocks (spawning, focus
//! transfer, host RPCs) runs on a short-lived worker thread that reports back
//! through the hub's channel as a [`HubEvent`]; only the owner mutates maps.

use nvhub_types::LaunchRequest;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Child;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{LaunchMode, RestartPolicy};
use crate::focus::{AppHandle, FocusSink};
use crate::handoff::{HandoffTracker, ReturnFocus};
use crate::host::{HostClient, HostError};
use crate::naming::{self, ResolvedName};
use crate::normalize::{join_relative, Location, SessionConvention};
use crate::notify::{FailureKind, HubFailure, Notifier};
use crate::poll::{RepeatingDeadline, TimerTick};
use crate::process::{command_args, is_process_alive, log_path_for, spawn_managed, terminate_pid};
use crate::projects::ProjectRegistry;
use crate::snapshot::{SnapshotRecord, SnapshotStore};
use crate::now_millis;

/// Longest the owner loop sleeps when nothing is scheduled.
const MAX_IDLE: Duration = Duration::from_millis(100);
/// How often child processes are checked for exit.
const REAP_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    OsProcess { pid: u32 },
    HostWindow { window_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: Location,
    pub display_name: String,
    pub backend: Backend,
    /// Unix milliseconds.
    pub last_access: u64,
    pub request: LaunchRequest,
}

impl Instance {
    pub fn to_snapshot(&self) -> SnapshotRecord {
        let (pid, window_id) = match &self.backend {
            Backend::OsProcess { pid } => (Some(*pid), None),
            Backend::HostWindow { window_id } => (None, Some(window_id.clone())),
        };
        SnapshotRecord {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            pid,
            window_id,
            last_access_time: self.last_access,
            original_request: self.request.clone(),
        }
    }

    pub fn from_snapshot(record: SnapshotRecord) -> Option<Self> {
        let backend = match (record.pid, record.window_id) {
            (Some(pid), _) => Backend::OsProcess { pid },
            (None, Some(window_id)) => Backend::HostWindow { window_id },
            (None, None) => return None,
        };
        Some(Self {
            id: record.id,
            display_name: record.display_name,
            backend,
            last_access: record.last_access_time,
            request: record.original_request,
        })
    }

    fn pid(&self) -> Option<u32> {
        match self.backend {
            Backend::OsProcess { pid } => Some(pid),
            Backend::HostWindow { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyAction {
    ToggleSwitcher,
    ToggleLastActive,
    RestartActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusQuery {
    Switcher,
    LastActive,
}

#[derive(Debug)]
pub enum LaunchOutcome {
    Process(Child),
    Window(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Process(#[from] anyhow::Error),
    #[error(transparent)]
    Host(#[from] HostError),
}

#[derive(Debug)]
pub enum HubEvent {
    Run(LaunchRequest),
    Launched {
        location: Location,
        display_name: String,
        request: LaunchRequest,
        outcome: LaunchOutcome,
    },
    LaunchFailed {
        location: Location,
        request: LaunchRequest,
        error: BackendError,
    },
    Activated {
        location: Location,
        previous: Option<AppHandle>,
        result: Result<(), BackendError>,
    },
    HostWindowsListed(Result<Vec<String>, HostError>),
    Frontmost {
        query: FocusQuery,
        application: Option<AppHandle>,
    },
    Hotkey(HotkeyAction),
    Shutdown,
}

/// Everything the hub needs from the outside world, built once at startup.
pub struct HubParts {
    pub mode: LaunchMode,
    pub sessions: SessionConvention,
    pub restart: RestartPolicy,
    pub prune_interval: Duration,
    pub projects: ProjectRegistry,
    pub snapshots: SnapshotStore,
    pub logs_dir: PathBuf,
    pub host: Arc<HostClient>,
    pub focus: Arc<dyn FocusSink>,
    pub notifier: Arc<dyn Notifier>,
}

enum Exiting {
    Child(Child),
    Pid(u32),
}

struct Terminating {
    location: Location,
    process: Exiting,
}

impl Terminating {
    fn has_exited(&mut self) -> bool {
        match &mut self.process {
            Exiting::Child(child) => match child.try_wait() {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(err) => {
                    warn!("failed to check exit of {}: {err}", self.location);
                    true
                }
            },
            Exiting::Pid(pid) => !is_process_alive(*pid),
        }
    }
}

/// A launch waiting for the previous process at its location to exit.
struct PendingRestart {
    location: Location,
    request: LaunchRequest,
    timer: RepeatingDeadline,
    /// Reported if the old process outlives the timer.
    on_timeout: FailureKind,
}

pub struct Hub {
    mode: LaunchMode,
    sessions: SessionConvention,
    restart_policy: RestartPolicy,
    prune_interval: Duration,
    projects: ProjectRegistry,
    snapshots: SnapshotStore,
    logs_dir: PathBuf,
    host: Arc<HostClient>,
    focus: Arc<dyn FocusSink>,
    notifier: Arc<dyn Notifier>,

    instances: BTreeMap<Location, Instance>,
    children: BTreeMap<Location, Child>,
    terminating: Vec<Terminating>,
    launching: BTreeSet<Location>,
    restarts: Vec<PendingRestart>,
    handoff: HandoffTracker,
    /// Host windows tracked when the in-flight window listing was requested.
    host_listing: Option<BTreeSet<String>>,
    last_prune: Instant,
    shutdown: bool,

    events_tx: Sender<HubEvent>,
    events_rx: Receiver<HubEvent>,
}

impl Hub {
    pub fn new(parts: HubParts) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            mode: parts.mode,
            sessions: parts.sessions,
            restart_policy: parts.restart,
            prune_interval: parts.prune_interval,
            projects: parts.projects,
            snapshots: parts.snapshots,
            logs_dir: parts.logs_dir,
            host: parts.host,
            focus: parts.focus,
            notifier: parts.notifier,
            instances: BTreeMap::new(),
            children: BTreeMap::new(),
            terminating: Vec::new(),
            launching: BTreeSet::new(),
            restarts: Vec::new(),
            handoff: HandoffTracker::default(),
            host_listing: None,
            last_prune: Instant::now(),
            shutdown: false,
            events_tx,
            events_rx,
        }
    }

    /// A handle background threads and the control listener use to reach the owner.
    pub fn sender(&self) -> Sender<HubEvent> {
        self.events_tx.clone()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
    }

    pub fn projects(&self) -> &ProjectRegistry {
        &self.projects
    }

    pub fn projects_mut(&mut self) -> &mut ProjectRegistry {
        &mut self.projects
    }

    pub fn instance(&self, id: &Location) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn is_launching(&self, id: &Location) -> bool {
        self.launching.contains(id)
    }

    // ---- operations ------------------------------------------------------

    /// Focuses the instance for `request`, launching it first if needed.
    pub fn run_or_activate(&mut self, request: LaunchRequest) {
        let resolved = naming::resolve(&request, &self.sessions);
        if let Err(err) = self.projects.touch(
            resolved.location.as_path(),
            request.explicit_name.as_deref(),
            resolved.session.clone(),
        ) {
            warn!("failed to record project {}: {err:#}", resolved.location);
        }

        if self.instances.contains_key(&resolved.location) {
            self.activate(&resolved.location);
            return;
        }
        if self.launching.contains(&resolved.location) {
            debug!("{} is already launching", resolved.location);
            return;
        }
        if self.restarts.iter().any(|pending| pending.location == resolved.location) {
            debug!("{} is restarting, the pending relaunch covers this run", resolved.location);
            return;
        }
        if self.terminating.iter().any(|entry| entry.location == resolved.location) {
            debug!("{} is still exiting, deferring launch", resolved.location);
            let pending = self.pending_launch(resolved.location, request, FailureKind::LaunchFailure);
            self.restarts.push(pending);
            return;
        }
        self.launch(resolved, request);
    }

    /// Transfers focus to an instance, remembering what had focus before.
    pub fn activate(&mut self, id: &Location) -> bool {
        self.activate_with(id, true)
    }

    fn activate_with(&mut self, id: &Location, record_handoff: bool) -> bool {
        let Some(instance) = self.instances.get(id) else {
            return false;
        };
        let backend = instance.backend.clone();
        let location = id.clone();
        let focus = self.focus.clone();
        let host = self.host.clone();
        let events = self.events_tx.clone();
        thread::spawn(move || {
            let previous = if record_handoff {
                focus.frontmost()
            } else {
                None
            };
            let result = match backend {
                Backend::OsProcess { pid } => focus.focus_process(pid).map_err(BackendError::from),
                Backend::HostWindow { window_id } => host
                    .activate_window(&window_id)
                    .map_err(BackendError::from),
            };
            let _ = events.send(HubEvent::Activated {
                location,
                previous,
                result,
            });
        });
        true
    }

    /// Stops tracking an instance and asks its process to terminate.
    pub fn quit(&mut self, id: &Location) -> bool {
        let removed = self.quit_without_persist(id);
        if removed {
            self.persist_snapshot();
        }
        removed
    }

    pub fn quit_all(&mut self) {
        self.restarts.clear();
        self.handoff.clear();
        let ids: Vec<Location> = self.instances.keys().cloned().collect();
        for id in &ids {
            self.quit_without_persist(id);
        }
        info!("quit {} instances", ids.len());
        self.persist_snapshot();
    }

    fn quit_without_persist(&mut self, id: &Location) -> bool {
        let Some(instance) = self.instances.remove(id) else {
            return false;
        };
        match instance.backend {
            Backend::OsProcess { pid } => {
                if let Err(err) = terminate_pid(pid) {
                    warn!("failed to terminate {id} (pid {pid}): {err:#}");
                }
                let process = match self.children.remove(id) {
                    Some(child) if child.id() == pid => Exiting::Child(child),
                    Some(child) => {
                        // Stale handle from an earlier process at this location.
                        self.terminating.push(Terminating {
                            location: id.clone(),
                            process: Exiting::Child(child),
                        });
                        Exiting::Pid(pid)
                    }
                    None => Exiting::Pid(pid),
                };
                self.terminating.push(Terminating {
                    location: id.clone(),
                    process,
                });
                info!("quit {id} (pid {pid})");
            }
            Backend::HostWindow { window_id } => {
                info!("stopped tracking {id} (window {window_id})");
            }
        }
        true
    }

    /// Quits an instance and relaunches its original request once the old
    /// process is gone. Gives up with a restart failure if it never goes.
    pub fn restart(&mut self, id: &Location) -> bool {
        if self.restarts.iter().any(|pending| &pending.location == id) {
            debug!("restart of {id} already pending");
            return false;
        }
        let Some(instance) = self.instances.get(id) else {
            return false;
        };
        let request = instance.request.clone();
        self.quit(id);
        let pending = self.pending_launch(id.clone(), request, FailureKind::RestartTimeout);
        self.restarts.push(pending);
        info!("restarting {id}");
        true
    }

    fn pending_launch(
        &self,
        location: Location,
        request: LaunchRequest,
        on_timeout: FailureKind,
    ) -> PendingRestart {
        PendingRestart {
            location,
            request,
            timer: RepeatingDeadline::start(self.restart_policy.interval, self.restart_policy.timeout),
            on_timeout,
        }
    }

    /// Drops instances whose process died, and asks the host which windows remain.
    pub fn prune_dead(&mut self) {
        self.last_prune = Instant::now();
        let dead: Vec<Location> = self
            .instances
            .values()
            .filter_map(|instance| match instance.backend {
                // Children we spawned are reaped in `tick`.
                Backend::OsProcess { pid }
                    if !self.children.contains_key(&instance.id) && !is_process_alive(pid) =>
                {
                    Some(instance.id.clone())
                }
                _ => None,
            })
            .collect();
        if !dead.is_empty() {
            for id in &dead {
                self.instances.remove(id);
                info!("pruned {id}: process is gone");
            }
            self.persist_snapshot();
        }

        let windows: BTreeSet<String> = self
            .instances
            .values()
            .filter_map(|instance| match &instance.backend {
                Backend::HostWindow { window_id } => Some(window_id.clone()),
                Backend::OsProcess { .. } => None,
            })
            .collect();
        if !windows.is_empty() && self.host_listing.is_none() {
            self.host_listing = Some(windows);
            let host = self.host.clone();
            let events = self.events_tx.clone();
            thread::spawn(move || {
                let _ = events.send(HubEvent::HostWindowsListed(host.list_windows()));
            });
        }
    }

    /// Hands focus back to whatever had it before the hub took it.
    pub fn activate_target(&mut self) {
        let instances = &self.instances;
        let returned = self
            .handoff
            .take_return(|application| owner_of(instances, application));
        match returned {
            None => debug!("no activation target to return to"),
            Some(ReturnFocus::Instance(location)) => {
                self.activate_with(&location, false);
            }
            Some(ReturnFocus::Application(application)) => {
                let focus = self.focus.clone();
                let notifier = self.notifier.clone();
                thread::spawn(move || {
                    if let Err(err) = focus.focus_application(&application) {
                        notifier.notify(
                            &HubFailure::new(
                                FailureKind::ActivationFailure,
                                format!("could not return focus: {err:#}"),
                            )
                            .with("window", application.window.clone()),
                        );
                    }
                });
            }
        }
    }

    pub fn handle_hotkey(&mut self, action: HotkeyAction) {
        match action {
            HotkeyAction::ToggleSwitcher => self.query_frontmost(FocusQuery::Switcher),
            HotkeyAction::ToggleLastActive => self.query_frontmost(FocusQuery::LastActive),
            HotkeyAction::RestartActive => match self.most_recent().map(|instance| instance.id.clone()) {
                Some(id) => {
                    self.restart(&id);
                }
                None => debug!("restart hotkey with no instances"),
            },
        }
    }

    /// Records the application about to lose focus to the switcher and returns
    /// the list the switcher should show.
    pub fn toggle_switcher(&mut self, frontmost: Option<AppHandle>) -> Vec<&Instance> {
        if let Some(application) = frontmost {
            let ids = self.instances.keys().cloned().collect();
            self.handoff.record(application, ids);
        }
        self.switcher_view()
    }

    /// Loads the snapshot left by a previous run and keeps what is still alive.
    pub fn restore(&mut self) {
        let records = self.snapshots.load();
        let total = records.len();
        for record in records {
            let Some(instance) = Instance::from_snapshot(record) else {
                continue;
            };
            if self.instances.contains_key(&instance.id) {
                continue;
            }
            if let Backend::OsProcess { pid } = instance.backend {
                if !is_process_alive(pid) {
                    info!("not restoring {}: pid {pid} is gone", instance.id);
                    continue;
                }
            }
            self.instances.insert(instance.id.clone(), instance);
        }
        info!("restored {} of {total} instances", self.instances.len());
        self.persist_snapshot();
        // Window ids may be from a host that has since restarted.
        self.prune_dead();
    }

    // ---- views -----------------------------------------------------------

    pub fn by_name(&self) -> Vec<&Instance> {
        let mut instances: Vec<&Instance> = self.instances.values().collect();
        instances.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        instances
    }

    pub fn by_recency(&self) -> Vec<&Instance> {
        let mut instances: Vec<&Instance> = self.instances.values().collect();
        instances.sort_by(|a, b| {
            b.last_access
                .cmp(&a.last_access)
                .then_with(|| a.id.cmp(&b.id))
        });
        instances
    }

    pub fn most_recent(&self) -> Option<&Instance> {
        self.by_recency().into_iter().next()
    }

    /// Most recent first, except that when the recorded activation target is
    /// already the top entry the first two swap, so one confirm toggles.
    pub fn switcher_view(&self) -> Vec<&Instance> {
        let mut view = self.by_recency();
        let target_is_top = self
            .handoff
            .current()
            .and_then(|target| owner_of(&self.instances, &target.application))
            .zip(view.first())
            .is_some_and(|(owner, top)| owner == top.id);
        if target_is_top && view.len() >= 2 {
            view.swap(0, 1);
        }
        view
    }

    // ---- owner loop ------------------------------------------------------

    /// Handles at most one pending event, waiting up to `timeout` for it.
    pub fn pump(&mut self, timeout: Duration) -> bool {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.handle_event(event);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Periodic work: reap exited processes, advance restarts, prune.
    pub fn tick(&mut self) {
        self.reap_children();
        self.terminating.retain_mut(|entry| !entry.has_exited());
        self.advance_restarts();
        if self.last_prune.elapsed() >= self.prune_interval {
            self.prune_dead();
        }
    }

    /// How long the owner loop may block before `tick` has work to do.
    pub fn next_wakeup(&self) -> Duration {
        let now = Instant::now();
        let mut wait = MAX_IDLE;
        if !self.children.is_empty() || !self.terminating.is_empty() {
            wait = wait.min(REAP_INTERVAL);
        }
        for pending in &self.restarts {
            wait = wait.min(pending.timer.time_until_due(now));
        }
        wait.min(self.prune_interval.saturating_sub(self.last_prune.elapsed()))
    }

    fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Run(request) => self.run_or_activate(request),
            HubEvent::Launched {
                location,
                display_name,
                request,
                outcome,
            } => self.on_launched(location, display_name, request, outcome),
            HubEvent::LaunchFailed {
                location,
                request,
                error,
            } => {
                self.launching.remove(&location);
                warn!("launch of {location} failed: {error:#}");
                let metadata = [
                    ("location", location.to_string()),
                    ("binary", request.binary_path.clone()),
                ];
                self.report_failure(FailureKind::LaunchFailure, error, &metadata);
            }
            HubEvent::Activated {
                location,
                previous,
                result,
            } => self.on_activated(location, previous, result),
            HubEvent::HostWindowsListed(result) => self.on_host_windows(result),
            HubEvent::Frontmost { query, application } => match query {
                FocusQuery::Switcher => {
                    let names: Vec<String> = self
                        .toggle_switcher(application)
                        .iter()
                        .map(|instance| instance.display_name.clone())
                        .collect();
                    info!("switcher: {}", names.join(", "));
                }
                FocusQuery::LastActive => self.toggle_last_active(application),
            },
            HubEvent::Hotkey(action) => self.handle_hotkey(action),
            HubEvent::Shutdown => self.shutdown = true,
        }
    }

    fn launch(&mut self, resolved: ResolvedName, request: LaunchRequest) {
        let ResolvedName {
            location,
            display_name,
            ..
        } = resolved;
        info!("launching {location} as '{display_name}'");
        self.launching.insert(location.clone());

        let mode = self.mode;
        let host = self.host.clone();
        let log_path = log_path_for(&self.logs_dir, &location);
        let events = self.events_tx.clone();
        thread::spawn(move || {
            let outcome = match mode {
                LaunchMode::Process => spawn_managed(&request, &log_path)
                    .map(LaunchOutcome::Process)
                    .map_err(BackendError::from),
                LaunchMode::Host => host
                    .open_window(&host_args(&request))
                    .map(LaunchOutcome::Window)
                    .map_err(BackendError::from),
            };
            let event = match outcome {
                Ok(outcome) => HubEvent::Launched {
                    location,
                    display_name,
                    request,
                    outcome,
                },
                Err(error) => HubEvent::LaunchFailed {
                    location,
                    request,
                    error,
                },
            };
            let _ = events.send(event);
        });
    }

    fn on_launched(
        &mut self,
        location: Location,
        display_name: String,
        request: LaunchRequest,
        outcome: LaunchOutcome,
    ) {
        self.launching.remove(&location);
        if self.instances.contains_key(&location) {
            // Never hold two instances for one location.
            warn!("{location} is already tracked, discarding duplicate launch");
            if let LaunchOutcome::Process(child) = outcome {
                if let Err(err) = terminate_pid(child.id()) {
                    warn!("failed to terminate duplicate of {location}: {err:#}");
                }
                self.terminating.push(Terminating {
                    location,
                    process: Exiting::Child(child),
                });
            }
            return;
        }

        let before = self.restarts.len();
        self.restarts.retain(|pending| pending.location != location);
        if self.restarts.len() != before {
            debug!("{location} launched, dropping its pending relaunch");
        }

        let backend = match outcome {
            LaunchOutcome::Process(child) => {
                let pid = child.id();
                self.children.insert(location.clone(), child);
                Backend::OsProcess { pid }
            }
            LaunchOutcome::Window(window_id) => Backend::HostWindow { window_id },
        };
        info!("launched {location}: {backend:?}");
        self.instances.insert(
            location.clone(),
            Instance {
                id: location,
                display_name,
                backend,
                last_access: now_millis(),
                request,
            },
        );
        self.persist_snapshot();
    }

    fn on_activated(
        &mut self,
        location: Location,
        previous: Option<AppHandle>,
        result: Result<(), BackendError>,
    ) {
        if let Some(application) = previous {
            if owner_of(&self.instances, &application).as_ref() != Some(&location) {
                let ids = self.instances.keys().cloned().collect();
                self.handoff.record(application, ids);
            }
        }
        match result {
            Ok(()) => {
                let Some(instance) = self.instances.get_mut(&location) else {
                    return;
                };
                instance.last_access = now_millis();
                debug!("activated {location}");
                self.persist_snapshot();
            }
            Err(error) => {
                warn!("activation of {location} failed: {error:#}");
                let metadata = [("location", location.to_string())];
                self.report_failure(FailureKind::ActivationFailure, error, &metadata);
            }
        }
    }

    fn on_host_windows(&mut self, result: Result<Vec<String>, HostError>) {
        let listed = self.host_listing.take().unwrap_or_default();
        match result {
            Ok(windows) => {
                let before = self.instances.len();
                // Windows registered after the listing was requested may be missing from it.
                self.instances.retain(|id, instance| match &instance.backend {
                    Backend::HostWindow { window_id }
                        if listed.contains(window_id) && !windows.contains(window_id) =>
                    {
                        info!("pruned {id}: window {window_id} is gone");
                        false
                    }
                    _ => true,
                });
                if self.instances.len() != before {
                    self.persist_snapshot();
                }
            }
            Err(err) => {
                warn!("listing editor host windows failed: {err}");
                self.report_failure(FailureKind::IpcProtocolError, err.into(), &[]);
            }
        }
    }

    fn toggle_last_active(&mut self, frontmost: Option<AppHandle>) {
        let Some(top) = self.most_recent().map(|instance| instance.id.clone()) else {
            debug!("no instance to toggle to");
            return;
        };
        let top_is_frontmost = frontmost
            .as_ref()
            .and_then(|application| owner_of(&self.instances, application))
            .is_some_and(|owner| owner == top);
        if top_is_frontmost && self.handoff.current().is_some() {
            self.activate_target();
        } else {
            self.activate(&top);
        }
    }

    fn query_frontmost(&self, query: FocusQuery) {
        let focus = self.focus.clone();
        let events = self.events_tx.clone();
        thread::spawn(move || {
            let _ = events.send(HubEvent::Frontmost {
                query,
                application: focus.frontmost(),
            });
        });
    }

    /// The exit callback: the only place a normally exiting child leaves the map.
    fn reap_children(&mut self) {
        let mut exited = Vec::new();
        for (location, child) in self.children.iter_mut() {
            match child.try_wait() {
                Ok(Some(status)) => exited.push((location.clone(), child.id(), status.to_string())),
                Ok(None) => {}
                Err(err) => {
                    warn!("failed to poll {location}: {err}");
                    exited.push((location.clone(), child.id(), "unknown status".to_string()));
                }
            }
        }
        if exited.is_empty() {
            return;
        }

        let mut changed = false;
        for (location, pid, status) in exited {
            self.children.remove(&location);
            let tracked = self
                .instances
                .get(&location)
                .is_some_and(|instance| instance.pid() == Some(pid));
            if tracked {
                self.instances.remove(&location);
                changed = true;
                info!("{location} exited with {status}");
            }
        }
        if changed {
            self.persist_snapshot();
        }
    }

    fn advance_restarts(&mut self) {
        if self.restarts.is_empty() {
            return;
        }
        let now = Instant::now();
        let pending = std::mem::take(&mut self.restarts);
        for mut restart in pending {
            match restart.timer.poll(now) {
                TimerTick::NotDue => self.restarts.push(restart),
                TimerTick::Due if self.is_settled(&restart.location) => self.relaunch(restart),
                TimerTick::Due => self.restarts.push(restart),
                TimerTick::Expired if self.is_settled(&restart.location) => {
                    self.relaunch(restart)
                }
                TimerTick::Expired => {
                    warn!("relaunch of {} timed out", restart.location);
                    self.notifier.notify(
                        &HubFailure::new(
                            restart.on_timeout,
                            format!(
                                "{} did not exit within {}ms; not relaunching",
                                restart.location,
                                self.restart_policy.timeout.as_millis()
                            ),
                        )
                        .with("location", restart.location.to_string()),
                    );
                }
            }
        }
    }

    /// Nothing is tracked, launching, or still shutting down at `location`.
    fn is_settled(&self, location: &Location) -> bool {
        !self.instances.contains_key(location)
            && !self.launching.contains(location)
            && !self
                .terminating
                .iter()
                .any(|entry| &entry.location == location)
    }

    fn relaunch(&mut self, restart: PendingRestart) {
        let resolved = naming::resolve(&restart.request, &self.sessions);
        if resolved.location != restart.location {
            // Naming inputs changed on disk since the first launch; keep the old key.
            debug!(
                "restart of {} now resolves to {}",
                restart.location, resolved.location
            );
        }
        self.launch(
            ResolvedName {
                location: restart.location,
                ..resolved
            },
            restart.request,
        );
    }

    fn clear_host_windows(&mut self) {
        let before = self.instances.len();
        self.instances
            .retain(|_, instance| !matches!(instance.backend, Backend::HostWindow { .. }));
        let cleared = before - self.instances.len();
        if cleared > 0 {
            warn!("cleared {cleared} editor host windows after host failure");
            self.persist_snapshot();
        }
    }

    /// Classifies a backend failure and notifies. Host timeouts and lost
    /// connections invalidate every window id; other host errors leave state alone.
    fn report_failure(
        &mut self,
        operation: FailureKind,
        error: BackendError,
        metadata: &[(&str, String)],
    ) {
        let (kind, message) = match &error {
            BackendError::Host(host_error) if host_error.is_stale_state() => {
                self.clear_host_windows();
                let kind = match host_error {
                    HostError::Timeout { .. } => FailureKind::IpcTimeout,
                    _ => FailureKind::IpcUnavailable,
                };
                (kind, host_error.to_string())
            }
            BackendError::Host(
                host_error @ (HostError::Protocol { .. } | HostError::Malformed { .. }),
            ) => (FailureKind::IpcProtocolError, host_error.to_string()),
            other => (operation, format!("{other:#}")),
        };
        let mut failure = HubFailure::new(kind, message);
        for (key, value) in metadata {
            failure = failure.with(key, value.clone());
        }
        self.notifier.notify(&failure);
    }

    fn persist_snapshot(&self) {
        let records: Vec<SnapshotRecord> =
            self.instances.values().map(Instance::to_snapshot).collect();
        if let Err(err) = self.snapshots.save(&records) {
            warn!("failed to persist snapshot: {err:#}");
        }
    }
}

/// The tracked instance whose process owns `application`, if any.
fn owner_of(instances: &BTreeMap<Location, Instance>, application: &AppHandle) -> Option<Location> {
    let pid = application.pid?;
    instances
        .values()
        .find(|instance| instance.pid() == Some(pid))
        .map(|instance| instance.id.clone())
}

/// Editor arguments for a host window: the request's extra arguments and the
/// target as an absolute path, since the host does not share the caller's cwd.
fn host_args(request: &LaunchRequest) -> Vec<String> {
    let mut args = command_args(request);
    let target = match request.path() {
        Some(path) => {
            args.pop();
            join_relative(std::path::Path::new(&request.working_directory), path)
        }
        None => PathBuf::from(&request.working_directory),
    };
    args.push(target.to_string_lossy().into_owned());
    args
}
