//! Artifact naming: building capture filenames and validating names that
//! arrive over HTTP before they reach the filesystem.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;

/// Extension of every still artifact.
pub const ARTIFACT_EXT: &str = "jpg";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("empty artifact name")]
    Empty,
    #[error("artifact name contains a path separator or parent reference: {0}")]
    Traversal(String),
}

/// Check that `name` is a bare file name.
///
/// Rejects separators and `..` anywhere in the name, without touching the
/// filesystem.
pub fn validate_name(name: &str) -> Result<&str, NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.contains('\0') {
        return Err(NameError::Traversal(name.to_string()));
    }
    Ok(name)
}

/// Resolve a validated artifact name inside `dir`.
pub fn resolve(dir: &Path, name: &str) -> Result<PathBuf, NameError> {
    Ok(dir.join(validate_name(name)?))
}

/// Reduce a trigger prefix to a filesystem-safe token.
///
/// Anything outside `[A-Za-z0-9_-]` becomes `_`; a prefix with nothing
/// usable left falls back to `default`.
pub fn sanitize_prefix(prefix: &str, default: &str) -> String {
    let cleaned: String = prefix
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.chars().all(|c| c == '_') {
        default.to_string()
    } else {
        cleaned
    }
}

/// `<dir>/<prefix>_<YYYYmmdd_HHMMSS_micros>.jpg`
pub fn capture_path(dir: &Path, prefix: &str, default_prefix: &str, at: DateTime<Local>) -> PathBuf {
    let prefix = sanitize_prefix(prefix, default_prefix);
    let stamp = at.format("%Y%m%d_%H%M%S_%6f");
    dir.join(format!("{prefix}_{stamp}.{ARTIFACT_EXT}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("capture_1.jpg"), Ok("capture_1.jpg"));
        assert_eq!(validate_name(""), Err(NameError::Empty));
        for bad in ["../../etc/passwd", "a/b.jpg", "..", "x..jpg", "c:\\x.jpg"] {
            assert!(matches!(validate_name(bad), Err(NameError::Traversal(_))), "{bad}");
        }
    }

    #[test]
    fn test_resolve_stays_inside_dir() {
        let dir = Path::new("/nonexistent/captures");
        assert_eq!(
            resolve(dir, "a.jpg").unwrap(),
            PathBuf::from("/nonexistent/captures/a.jpg")
        );
        assert!(resolve(dir, "../a.jpg").is_err());
    }

    #[test]
    fn test_sanitize_prefix() {
        assert_eq!(sanitize_prefix("rig-a_1", "capture"), "rig-a_1");
        assert_eq!(sanitize_prefix("../../etc", "capture"), "______etc");
        assert_eq!(sanitize_prefix("..", "capture"), "capture");
        assert_eq!(sanitize_prefix("", "capture"), "capture");
    }

    #[test]
    fn test_capture_path() {
        let at = Local
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .unwrap()
            + chrono::Duration::microseconds(42);
        let path = capture_path(Path::new("/data"), "left", "capture", at);
        assert_eq!(path, PathBuf::from("/data/left_20240309_140507_000042.jpg"));

        let path = capture_path(Path::new("/data"), "../x", "capture", at);
        assert_eq!(path.parent(), Some(Path::new("/data")));
    }
}
