use nvhub_types::LaunchRequest;
use std::path::Path;

use crate::normalize::{
    join_relative, normalize_location, resolve_project_root, resolve_session_path, Location,
    SessionConvention,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    pub location: Location,
    pub display_name: String,
    /// Set when the location is a session file rather than a project directory.
    pub session: Option<Location>,
}

/// Maps a launch request to the location it should be keyed by and the name
/// it should be shown under.
pub fn resolve(request: &LaunchRequest, sessions: &SessionConvention) -> ResolvedName {
    let working_directory = Path::new(&request.working_directory);
    let explicit = request
        .explicit_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    let Some(path) = request.path() else {
        let location = normalize_location(&request.working_directory);
        let display_name = explicit.unwrap_or_else(|| location.file_name().to_string());
        return ResolvedName {
            location,
            display_name,
            session: None,
        };
    };

    if let Some(session) = resolve_session_path(working_directory, path, sessions) {
        let display_name = explicit.unwrap_or_else(|| session_display_name(&session));
        return ResolvedName {
            location: session.clone(),
            display_name,
            session: Some(session),
        };
    }

    let location = resolve_project_root(join_relative(working_directory, path));
    let display_name = explicit.unwrap_or_else(|| location.file_name().to_string());
    ResolvedName {
        location,
        display_name,
        session: None,
    }
}

/// Session files are usually all named alike, so show the directory they live in.
fn session_display_name(session: &Location) -> String {
    let path = session.as_path();
    path.parent()
        .and_then(|parent| parent.file_name())
        .and_then(|name| name.to_str())
        .or_else(|| path.file_stem().and_then(|stem| stem.to_str()))
        .unwrap_or(session.as_str())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn request(working_directory: &Path, path: Option<&str>) -> LaunchRequest {
        let mut request = LaunchRequest::new(working_directory.to_string_lossy(), "nvim");
        request.path_argument = path.map(str::to_string);
        request
    }

    fn project(dir: &TempDir) -> std::path::PathBuf {
        let project = dir.path().join("proj");
        fs::create_dir_all(&project).unwrap();
        project
    }

    #[test]
    fn working_directory_is_used_without_path_argument() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);

        let resolved = resolve(&request(&project, None), &SessionConvention::default());
        assert_eq!(resolved.location, normalize_location(&project));
        assert_eq!(resolved.display_name, "proj");
        assert_eq!(resolved.session, None);
    }

    #[test]
    fn session_file_keeps_file_location_and_parent_name() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        fs::write(project.join("Session.vim"), "").unwrap();

        let resolved = resolve(
            &request(&project, Some("Session.vim")),
            &SessionConvention::default(),
        );
        let expected = normalize_location(project.join("Session.vim"));
        assert_eq!(resolved.location, expected);
        assert_eq!(resolved.session, Some(expected));
        assert_eq!(resolved.display_name, "proj");
    }

    #[test]
    fn distinct_sessions_in_one_directory_stay_distinct() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        fs::write(project.join("a.session"), "").unwrap();
        fs::write(project.join("b.session"), "").unwrap();
        let sessions = SessionConvention::new(r"\.session$").unwrap();

        let first = resolve(&request(&project, Some("a.session")), &sessions);
        let second = resolve(&request(&project, Some("b.session")), &sessions);
        assert_ne!(first.location, second.location);
        assert_eq!(first.display_name, second.display_name);
    }

    #[test]
    fn plain_file_collapses_to_its_directory() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        fs::create_dir_all(project.join("src")).unwrap();
        fs::write(project.join("src/lib.rs"), "").unwrap();

        let resolved = resolve(
            &request(&project, Some("src/lib.rs")),
            &SessionConvention::default(),
        );
        assert_eq!(resolved.location, normalize_location(project.join("src")));
        assert_eq!(resolved.display_name, "src");
    }

    #[test]
    fn absolute_path_argument_ignores_working_directory() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        let elsewhere = dir.path().join("elsewhere");
        fs::create_dir_all(&elsewhere).unwrap();

        let resolved = resolve(
            &request(&elsewhere, Some(&project.to_string_lossy())),
            &SessionConvention::default(),
        );
        assert_eq!(resolved.location, normalize_location(&project));
    }

    #[test]
    fn explicit_name_wins_unless_blank() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        let mut named = request(&project, None);
        named.explicit_name = Some("Backend".to_string());
        assert_eq!(
            resolve(&named, &SessionConvention::default()).display_name,
            "Backend"
        );

        named.explicit_name = Some("   ".to_string());
        assert_eq!(
            resolve(&named, &SessionConvention::default()).display_name,
            "proj"
        );
    }

    #[test]
    fn equivalent_spellings_share_a_location() {
        let dir = TempDir::new().unwrap();
        let project = project(&dir);
        let plain = request(&project, None);
        let slashed = request(Path::new(&format!("{}/", project.display())), None);
        let dotted = request(&dir.path().join("proj/."), None);

        let sessions = SessionConvention::default();
        let location = resolve(&plain, &sessions).location;
        assert_eq!(resolve(&slashed, &sessions).location, location);
        assert_eq!(resolve(&dotted, &sessions).location, location);
    }
}
