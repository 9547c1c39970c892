//! Canonical locations: the comparable path form instances and projects are keyed by.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

pub const DEFAULT_SESSION_PATTERN: &str = r"(?i)^session\.vim$";

/// An absolute, tilde-expanded, symlink-resolved path with no trailing slash,
/// case-folded when its volume ignores case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location(String);

impl Location {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Last path component, or the whole location for `/`.
    pub fn file_name(&self) -> &str {
        self.as_path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File-name convention that marks a saved editor session.
#[derive(Debug, Clone)]
pub struct SessionConvention {
    pattern: Regex,
}

impl SessionConvention {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("invalid session file pattern: {pattern}"))?;
        Ok(Self { pattern })
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.pattern.is_match(name))
    }
}

impl Default for SessionConvention {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_SESSION_PATTERN).expect("default session pattern is valid"),
        }
    }
}

pub fn expand_tilde(raw_path: &str) -> PathBuf {
    if raw_path == "~" || raw_path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            if raw_path == "~" {
                return home;
            }
            return home.join(raw_path.trim_start_matches("~/"));
        }
    }

    PathBuf::from(raw_path)
}

/// Resolves `raw` against `base` when it is relative, after tilde expansion.
pub fn join_relative(base: &Path, raw: &str) -> PathBuf {
    let expanded = expand_tilde(raw);
    if expanded.is_absolute() {
        expanded
    } else {
        expand_tilde(&base.to_string_lossy()).join(expanded)
    }
}

pub fn normalize_location(raw: impl AsRef<Path>) -> Location {
    let raw = raw.as_ref();
    let expanded = expand_tilde(&raw.to_string_lossy());
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(expanded),
            Err(_) => expanded,
        }
    };
    let resolved = resolve_existing_prefix(&lexical_clean(&absolute));
    let mut text = resolved.to_string_lossy().into_owned();
    while text.len() > 1 && text.ends_with('/') {
        text.pop();
    }
    if volume_is_case_insensitive(&resolved) {
        text = text.to_lowercase();
    }
    Location(text)
}

/// Directory that should be treated as the project for `candidate`.
///
/// Missing paths resolve to their parent so a file that is about to be created
/// still opens in the right project.
pub fn resolve_project_root(candidate: impl AsRef<Path>) -> Location {
    let location = normalize_location(candidate);
    match fs::metadata(location.as_path()) {
        Ok(metadata) if metadata.is_dir() => location,
        _ => match location.as_path().parent() {
            Some(parent) => normalize_location(parent),
            None => location,
        },
    }
}

/// Returns the session file `path` points at, if it is an existing regular file
/// matching the session convention.
pub fn resolve_session_path(
    working_directory: &Path,
    path: &str,
    convention: &SessionConvention,
) -> Option<Location> {
    let candidate = join_relative(working_directory, path);
    let metadata = fs::metadata(&candidate).ok()?;
    if metadata.is_dir() || !convention.matches(&candidate) {
        return None;
    }
    Some(normalize_location(candidate))
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push("/");
    }
    cleaned
}

/// Canonicalizes the longest existing ancestor of `path` and re-appends the
/// components that do not exist yet.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        if let Ok(real) = fs::canonicalize(existing) {
            let mut resolved = real;
            for component in missing.iter().rev() {
                resolved.push(component);
            }
            return resolved;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Checks the nearest existing component that has cased letters: if its
/// case-flipped twin is the same inode, the volume ignores case.
fn volume_is_case_insensitive(path: &Path) -> bool {
    let mut next = Some(path);
    while let Some(candidate) = next {
        next = candidate.parent();
        let Some(name) = candidate.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let flipped = flip_case(name);
        if flipped == name {
            continue;
        }
        let Ok(original) = fs::metadata(candidate) else {
            continue;
        };
        let Some(parent) = candidate.parent() else {
            return false;
        };
        return match fs::metadata(parent.join(&flipped)) {
            Ok(twin) => twin.dev() == original.dev() && twin.ino() == original.ino(),
            Err(_) => false,
        };
    }
    false
}

fn flip_case(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_lowercase() {
                ch.to_uppercase().next().unwrap_or(ch)
            } else if ch.is_uppercase() {
                ch.to_lowercase().next().unwrap_or(ch)
            } else {
                ch
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn trailing_slash_and_dot_segments_are_removed() {
        let dir = TempDir::new().unwrap();
        let base = normalize_location(dir.path());
        let project = dir.path().join("proj");
        fs::create_dir_all(&project).unwrap();

        let with_slash = normalize_location(format!("{}/", project.display()));
        let with_dots = normalize_location(dir.path().join("proj/./../proj"));
        assert_eq!(with_slash, with_dots);
        assert_eq!(with_slash.as_str(), format!("{}/proj", base.as_str()));
    }

    #[test]
    fn root_keeps_its_slash() {
        assert_eq!(normalize_location("/").as_str(), "/");
        assert_eq!(normalize_location("/..").as_str(), "/");
    }

    #[test]
    fn symlinks_resolve_when_target_exists() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real");
        fs::create_dir_all(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert_eq!(normalize_location(&link), normalize_location(&real));
    }

    #[test]
    fn missing_tail_is_appended_to_resolved_prefix() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real");
        fs::create_dir_all(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let through_link = normalize_location(link.join("not-yet/created.txt"));
        let direct = normalize_location(real.join("not-yet/created.txt"));
        assert_eq!(through_link, direct);
        assert!(through_link.as_str().ends_with("/real/not-yet/created.txt"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("a"), dir.path().join("alias")).unwrap();
        let inputs = [
            format!("{}/alias/b/", dir.path().display()),
            format!("{}/a/./b/../b", dir.path().display()),
            format!("{}/missing/../a/new", dir.path().display()),
            "/".to_string(),
            "~".to_string(),
            "~/does-not-exist/x/".to_string(),
            "relative/path/..".to_string(),
        ];
        for input in inputs {
            let once = normalize_location(&input);
            let twice = normalize_location(once.as_str());
            assert_eq!(once, twice, "input {input}");
        }
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/src"), home.join("src"));
        assert_eq!(expand_tilde("~other/src"), PathBuf::from("~other/src"));
    }

    #[test]
    fn project_root_uses_parent_for_files_and_missing_paths() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("proj");
        fs::create_dir_all(&project).unwrap();
        fs::write(project.join("main.rs"), "fn main() {}").unwrap();
        let expected = normalize_location(&project);

        assert_eq!(resolve_project_root(&project), expected);
        assert_eq!(resolve_project_root(project.join("main.rs")), expected);
        assert_eq!(resolve_project_root(project.join("new.rs")), expected);
    }

    #[test]
    fn session_path_requires_existing_matching_file() {
        let dir = TempDir::new().unwrap();
        let convention = SessionConvention::default();
        fs::write(dir.path().join("Session.vim"), "\" session").unwrap();
        fs::write(dir.path().join("notes.vim"), "").unwrap();
        fs::create_dir_all(dir.path().join("nested/session.vim")).unwrap();

        let found = resolve_session_path(dir.path(), "Session.vim", &convention).unwrap();
        assert_eq!(found, normalize_location(dir.path().join("Session.vim")));
        assert!(resolve_session_path(dir.path(), "notes.vim", &convention).is_none());
        assert!(resolve_session_path(dir.path(), "missing.vim", &convention).is_none());
        assert!(resolve_session_path(dir.path(), "nested/session.vim", &convention).is_none());
    }

    #[test]
    fn session_convention_accepts_custom_patterns() {
        let convention = SessionConvention::new(r"\.session$").unwrap();
        assert!(convention.matches(Path::new("/tmp/work.session")));
        assert!(!convention.matches(Path::new("/tmp/Session.vim")));
        assert!(SessionConvention::new("(").is_err());
    }

    #[test]
    fn case_check_matches_filesystem_behaviour() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("MixedCase");
        fs::create_dir_all(&project).unwrap();
        let folds = fs::metadata(dir.path().join("mixedcase")).is_ok();

        let location = normalize_location(&project);
        assert_eq!(location.as_str().ends_with("mixedcase"), folds);
    }
}
