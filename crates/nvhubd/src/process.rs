//! Spawning, logging and signalling the editor processes the hub manages.

use anyhow::{bail, Context, Result};
use nvhub_types::LaunchRequest;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::normalize::Location;

/// How long a fresh child must survive before the launch counts as successful.
pub const SPAWN_GRACE: Duration = Duration::from_millis(80);

/// `extraArgs` first, then the path argument.
pub fn command_args(request: &LaunchRequest) -> Vec<String> {
    let mut args = request.extra_args.clone();
    if let Some(path) = request.path() {
        args.push(path.to_string());
    }
    args
}

pub fn spawn_managed(request: &LaunchRequest, log_path: &Path) -> Result<Child> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log dir {}", parent.display()))?;
    }

    let mut command = Command::new(&request.binary_path);
    command
        .args(command_args(request))
        .current_dir(&request.working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if !request.environment.is_empty() {
        command.env_clear().envs(&request.environment);
    }

    let mut child = command.spawn().with_context(|| {
        format!(
            "failed to spawn '{}' in {}",
            request.binary_path, request.working_directory
        )
    })?;

    attach_process_logs(&mut child, log_path)?;
    thread::sleep(SPAWN_GRACE);
    if let Some(status) = child
        .try_wait()
        .context("failed to check child process status after spawn")?
    {
        bail!(
            "'{}' exited immediately with status {status}",
            request.binary_path
        );
    }
    Ok(child)
}

/// SIGTERM to the process group, falling back to the pid itself. A process that
/// is already gone counts as terminated.
pub fn terminate_pid(pid: u32) -> Result<()> {
    let pid = pid as i32;
    let group_status = unsafe { libc::kill(-pid, libc::SIGTERM) };
    if group_status == 0 {
        return Ok(());
    }
    let direct = unsafe { libc::kill(pid, libc::SIGTERM) };
    if direct != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err).context("failed to send SIGTERM");
        }
    }
    Ok(())
}

/// Whether `pid` names a running process that has not become a zombie.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let status = unsafe { libc::kill(pid as i32, 0) };
    if status != 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }
    !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name is parenthesised and may itself contain spaces.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}

pub fn log_path_for(logs_dir: &Path, location: &Location) -> PathBuf {
    logs_dir.join(format!("{}.log", sanitize_log_component(location.as_str())))
}

fn attach_process_logs(child: &mut Child, log_path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open log file: {}", log_path.display()))?;
    let shared = Arc::new(Mutex::new(file));

    if let Some(stdout) = child.stdout.take() {
        spawn_log_copy_thread(stdout, shared.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_log_copy_thread(stderr, shared);
    }
    Ok(())
}

fn spawn_log_copy_thread<R>(mut reader: R, file: Arc<Mutex<File>>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = [0_u8; 8192];
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(size) => size,
            };
            let Ok(mut file) = file.lock() else {
                break;
            };
            if file.write_all(&buffer[..read]).is_err() {
                break;
            }
        }
    });
}

fn sanitize_log_component(raw: &str) -> String {
    let output: String = raw
        .trim_start_matches('/')
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if output.trim_matches(|ch| ch == '_' || ch == '.').is_empty() {
        "root".to_string()
    } else {
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_location;
    use std::time::Instant;
    use tempfile::TempDir;

    fn shell_request(dir: &Path, script: &str) -> LaunchRequest {
        let mut request = LaunchRequest::new(dir.to_string_lossy(), "sh");
        request.extra_args = vec!["-c".to_string(), script.to_string()];
        request
    }

    fn wait_for_exit(child: &mut Child) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if child.try_wait().unwrap().is_some() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("child did not exit");
    }

    #[test]
    fn path_argument_follows_extra_args() {
        let mut request = LaunchRequest::new("/tmp", "neovide");
        request.extra_args = vec!["--frame".to_string(), "none".to_string()];
        request.path_argument = Some("src/main.rs".to_string());
        assert_eq!(command_args(&request), vec!["--frame", "none", "src/main.rs"]);

        request.path_argument = Some("  ".to_string());
        assert_eq!(command_args(&request), vec!["--frame", "none"]);
    }

    #[test]
    fn output_lands_in_log_file() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("logs").join("one.log");
        let request = shell_request(dir.path(), "echo hello-from-child; sleep 0.3");

        let mut child = spawn_managed(&request, &log_path).unwrap();
        wait_for_exit(&mut child);
        thread::sleep(Duration::from_millis(50));

        let logged = fs::read_to_string(&log_path).unwrap();
        assert!(logged.contains("hello-from-child"));
    }

    #[test]
    fn immediate_exit_is_a_launch_failure() {
        let dir = TempDir::new().unwrap();
        let request = shell_request(dir.path(), "exit 0");
        let err = spawn_managed(&request, &dir.path().join("x.log")).unwrap_err();
        assert!(format!("{err:#}").contains("exited immediately"));
    }

    #[test]
    fn missing_binary_is_a_launch_failure() {
        let dir = TempDir::new().unwrap();
        let request = LaunchRequest::new(dir.path().to_string_lossy(), "/nonexistent/editor");
        let err = spawn_managed(&request, &dir.path().join("x.log")).unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn"));
    }

    #[test]
    fn request_environment_replaces_inherited_one() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("env.txt");
        let mut request = shell_request(
            dir.path(),
            &format!("echo \"$NVHUB_MARKER:$HOME\" > '{}'; sleep 0.3", out.display()),
        );
        request
            .environment
            .insert("NVHUB_MARKER".to_string(), "captured".to_string());
        request
            .environment
            .insert("PATH".to_string(), "/usr/bin:/bin".to_string());

        let mut child = spawn_managed(&request, &dir.path().join("env.log")).unwrap();
        wait_for_exit(&mut child);
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "captured:");
    }

    #[test]
    fn terminate_and_liveness() {
        let dir = TempDir::new().unwrap();
        let request = shell_request(dir.path(), "sleep 30");
        let mut child = spawn_managed(&request, &dir.path().join("sleep.log")).unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        terminate_pid(pid).unwrap();
        wait_for_exit(&mut child);
        assert!(!is_process_alive(pid));
        // Already gone: still fine.
        terminate_pid(pid).unwrap();
    }

    #[test]
    fn log_names_are_flat() {
        let logs = Path::new("/var/log/nvhub");
        let path = log_path_for(logs, &normalize_location("/srv/my project/app"));
        assert_eq!(path, logs.join("srv_my_project_app.log"));
    }
}
