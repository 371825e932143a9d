//! Deployment file selection.

use super::types::ServiceDeployment;
use crate::template::collect_relative_files;
use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Selects the files of a service directory matched by a deployment's
/// include/exclude globs.
///
/// Empty includes select everything. Invalid patterns are skipped (the
/// deployment still runs with the remaining patterns) but logged.
pub fn select_files(directory: &Path, deployment: &ServiceDeployment) -> Vec<PathBuf> {
    let files = match collect_relative_files(directory) {
        Ok(files) => files,
        Err(error) => {
            warn!(directory = %directory.display(), %error, "unable to walk service directory");
            return Vec::new();
        }
    };

    let options = MatchOptions {
        case_sensitive: deployment.case_sensitive,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    let includes = compile(&deployment.includes);
    let excludes = compile(&deployment.excludes);

    files
        .into_iter()
        .filter(|file| {
            let path = file.to_string_lossy();
            let included =
                includes.is_empty() || includes.iter().any(|p| p.matches_with(&path, options));
            let excluded = excludes.iter().any(|p| p.matches_with(&path, options));
            included && !excluded
        })
        .collect()
}

fn compile(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|raw| match Pattern::new(raw) {
            Ok(pattern) => Some(pattern),
            Err(error) => {
                warn!(pattern = %raw, %error, "skipping invalid deployment pattern");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::types::ServiceTemplate;

    fn deployment(includes: &[&str], excludes: &[&str], case_sensitive: bool) -> ServiceDeployment {
        ServiceDeployment {
            template: ServiceTemplate::local("lobby", "default"),
            includes: includes.iter().map(|s| s.to_string()).collect(),
            excludes: excludes.iter().map(|s| s.to_string()).collect(),
            case_sensitive,
        }
    }

    fn service_dir() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("world")).unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("world/level.dat"), b"x").unwrap();
        std::fs::write(dir.path().join("world/Region.MCA"), b"x").unwrap();
        std::fs::write(dir.path().join("logs/latest.log"), b"x").unwrap();
        std::fs::write(dir.path().join("server.properties"), b"x").unwrap();
        dir
    }

    #[test]
    fn test_empty_includes_select_all_minus_excludes() {
        let dir = service_dir();
        let files = select_files(dir.path(), &deployment(&[], &["logs/*"], false));
        assert!(files.contains(&PathBuf::from("world/level.dat")));
        assert!(files.contains(&PathBuf::from("server.properties")));
        assert!(!files.iter().any(|f| f.starts_with("logs")));
    }

    #[test]
    fn test_includes_filter() {
        let dir = service_dir();
        let files = select_files(dir.path(), &deployment(&["world/*"], &[], false));
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.starts_with("world")));
    }

    #[test]
    fn test_case_sensitivity() {
        let dir = service_dir();
        let insensitive = select_files(dir.path(), &deployment(&["world/*.mca"], &[], false));
        assert_eq!(insensitive, vec![PathBuf::from("world/Region.MCA")]);

        let sensitive = select_files(dir.path(), &deployment(&["world/*.mca"], &[], true));
        assert!(sensitive.is_empty());
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let dir = service_dir();
        let files = select_files(dir.path(), &deployment(&["[invalid", "world/*"], &[], false));
        // The broken pattern is dropped; the valid one still applies.
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.starts_with("world")));
    }
}
