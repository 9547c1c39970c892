use anyhow::{anyhow, Context, Result};
use clap::Parser;
use nvhub_types::{client, default_socket_path, CliErrorReport, ControlEnvelope, LaunchRequest};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const DEFAULT_EDITOR_BIN: &str = "neovide";

#[derive(Debug, Parser)]
#[command(
    name = "nvhub",
    version,
    about = "Open or focus the editor instance for a project"
)]
struct Cli {
    /// File or directory to open; defaults to the current directory.
    #[arg(value_name = "PATH")]
    path: Option<String>,
    /// Display name for the instance instead of the directory name.
    #[arg(long)]
    name: Option<String>,
    /// Editor binary; falls back to NVHUB_EDITOR_BIN, then neovide.
    #[arg(long = "bin", value_name = "BINARY")]
    binary: Option<String>,
    #[arg(long)]
    socket: Option<PathBuf>,
    #[arg(long = "no-autostart")]
    no_autostart: bool,
    /// Passed to the editor before the path.
    #[arg(last = true, value_name = "EXTRA_ARGS")]
    extra_args: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = cli.socket.clone().unwrap_or_else(default_socket_path);
    let autostart = !cli.no_autostart;

    let request = match build_request(&cli) {
        Ok(request) => request,
        Err(report) => {
            let message = report.message.clone();
            // Best effort: the local error is what the user sees regardless.
            if let Err(err) =
                client::send_with_autostart(&socket_path, &ControlEnvelope::cli_error(report), autostart)
            {
                eprintln!("warning: could not report error to nvhubd: {err:#}");
            }
            return Err(anyhow!(message));
        }
    };

    let response =
        client::send_with_autostart(&socket_path, &ControlEnvelope::run(request), autostart)
            .context("failed to reach nvhubd")?;
    if response.daemon_was_started {
        eprintln!("started nvhubd on {}", socket_path.display());
    }
    Ok(())
}

fn build_request(cli: &Cli) -> Result<LaunchRequest, CliErrorReport> {
    let cwd = std::env::current_dir().map_err(|err| {
        report(
            "could not read the current directory",
            [("error", err.to_string())],
        )
    })?;

    let wanted = editor_binary(cli.binary.as_deref());
    let search_path = std::env::var_os("PATH").unwrap_or_default();
    let binary = find_executable(&wanted, &search_path, &cwd).ok_or_else(|| {
        report(
            "editor binary not found",
            [
                ("binary", wanted.clone()),
                ("path", search_path.to_string_lossy().into_owned()),
            ],
        )
    })?;

    let mut request = LaunchRequest::new(cwd.to_string_lossy(), binary.to_string_lossy());
    request.explicit_name = cli
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    request.path_argument = cli.path.clone();
    request.extra_args = cli.extra_args.clone();
    request.environment = capture_environment(std::env::vars_os());
    Ok(request)
}

/// Keeps every variable that is valid UTF-8; the rest cannot travel in the
/// JSON request and are skipped with a warning.
fn capture_environment(
    vars: impl IntoIterator<Item = (OsString, OsString)>,
) -> BTreeMap<String, String> {
    let mut environment = BTreeMap::new();
    for (key, value) in vars {
        match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => {
                environment.insert(key, value);
            }
            (Ok(key), Err(_)) => {
                eprintln!("warning: skipping environment variable {key}: value is not valid UTF-8");
            }
            (Err(key), _) => {
                eprintln!(
                    "warning: skipping environment variable {}: name is not valid UTF-8",
                    key.to_string_lossy()
                );
            }
        }
    }
    environment
}

fn editor_binary(flag: Option<&str>) -> String {
    flag.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            std::env::var("NVHUB_EDITOR_BIN")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_EDITOR_BIN.to_string())
}

/// Resolves `name` the way a shell would: names with a slash are taken
/// relative to `cwd`, bare names are looked up on `search_path`.
fn find_executable(name: &str, search_path: &OsStr, cwd: &Path) -> Option<PathBuf> {
    if name.contains('/') {
        let candidate = cwd.join(name);
        return is_executable(&candidate).then_some(candidate);
    }
    std::env::split_paths(search_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn report<const N: usize>(message: &str, details: [(&str, String); N]) -> CliErrorReport {
    CliErrorReport {
        message: message.to_string(),
        details: details
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect::<BTreeMap<_, _>>(),
    }
}
