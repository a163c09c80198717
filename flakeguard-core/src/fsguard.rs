//! Permission-checked filesystem operations for artifact directories.
//!
//! Every artifact write in the crate funnels through this module so that
//! filesystem failures surface as one typed error carrying the operation,
//! the path, and a machine-matchable code. Callers branch on
//! [`FsErrorCode`], never on message substrings.
//!
//! `ensure_directory` additionally attempts one automatic `chmod` repair
//! when an existing directory lacks read/write permission before giving up
//! with [`FsErrorCode::PermissionDenied`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Machine-matchable code for a filesystem failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsErrorCode {
    /// Path (or a parent) does not exist.
    PathNotFound,
    /// Permission denied and automatic repair failed or was not possible.
    PermissionDenied,
    /// Path exists but is not a directory where one was required.
    PathNotDirectory,
    /// Path already exists where a fresh path was required.
    PathAlreadyExists,
    /// Write failed for a reason other than the above.
    WriteError,
    /// Read failed for a reason other than the above.
    ReadError,
    /// Anything the other codes do not cover.
    Unknown,
}

/// Typed filesystem error: code + path + operation + the original cause.
#[derive(Debug, Error)]
#[error("{operation} failed for {}: {code:?}", path.display())]
pub struct FsGuardError {
    /// What went wrong, as a branchable code.
    pub code: FsErrorCode,
    /// Absolute path the operation targeted.
    pub path: PathBuf,
    /// Operation name, e.g. `ensure_directory`.
    pub operation: &'static str,
    /// Underlying I/O error, when one exists.
    #[source]
    pub source: Option<io::Error>,
}

impl FsGuardError {
    fn new(code: FsErrorCode, path: &Path, operation: &'static str) -> Self {
        Self {
            code,
            path: path.to_path_buf(),
            operation,
            source: None,
        }
    }

    fn with_source(
        code: FsErrorCode,
        path: &Path,
        operation: &'static str,
        source: io::Error,
    ) -> Self {
        Self {
            code,
            path: path.to_path_buf(),
            operation,
            source: Some(source),
        }
    }
}

/// Result of a single permission check.
///
/// Produced fresh per call and never cached: filesystem state can change
/// between calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionReport {
    /// Absolute path that was checked.
    pub path: PathBuf,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub is_directory: bool,
    pub is_file: bool,
    /// Present when the check itself failed (path missing, metadata error).
    pub error: Option<String>,
}

impl PermissionReport {
    fn failed(path: PathBuf, error: String) -> Self {
        Self {
            path,
            readable: false,
            writable: false,
            executable: false,
            is_directory: false,
            is_file: false,
            error: Some(error),
        }
    }
}

fn map_code(err: &io::Error, fallback: FsErrorCode) -> FsErrorCode {
    match err.kind() {
        io::ErrorKind::NotFound => FsErrorCode::PathNotFound,
        io::ErrorKind::PermissionDenied => FsErrorCode::PermissionDenied,
        io::ErrorKind::AlreadyExists => FsErrorCode::PathAlreadyExists,
        _ => fallback,
    }
}

/// Resolve a path to absolute form without requiring it to exist.
pub fn absolutize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Check read/write/execute access to a path.
///
/// On Unix this inspects the mode bits; elsewhere it falls back to the
/// readonly flag. A missing path yields a report with `error` set rather
/// than an `Err` — permission checks are diagnostics, not gates.
pub fn check_permissions(path: &Path) -> PermissionReport {
    let path = absolutize(path);
    let metadata = match fs::metadata(&path) {
        Ok(m) => m,
        Err(err) => return PermissionReport::failed(path, err.to_string()),
    };

    #[cfg(unix)]
    let (readable, writable, executable) = {
        use std::os::unix::fs::PermissionsExt;
        let bits = metadata.permissions().mode();
        (bits & 0o400 != 0, bits & 0o200 != 0, bits & 0o100 != 0)
    };
    #[cfg(not(unix))]
    let (readable, writable, executable) = {
        let ro = metadata.permissions().readonly();
        (true, !ro, false)
    };

    PermissionReport {
        path,
        readable,
        writable,
        executable,
        is_directory: metadata.is_dir(),
        is_file: metadata.is_file(),
        error: None,
    }
}

#[cfg(unix)]
fn repair_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_mode(perms.mode() | 0o700);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn repair_permissions(path: &Path) -> io::Result<()> {
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_readonly(false);
    fs::set_permissions(path, perms)
}

/// Create a directory (and parents) if it does not exist.
///
/// Idempotent: an existing, usable directory is a no-op success. An
/// existing non-directory fails with [`FsErrorCode::PathNotDirectory`]. An
/// existing directory without read/write access gets one automatic `chmod`
/// repair attempt before [`FsErrorCode::PermissionDenied`].
///
/// Returns the absolutized path.
pub fn ensure_directory(path: &Path) -> Result<PathBuf, FsGuardError> {
    let path = absolutize(path);

    match fs::metadata(&path) {
        Ok(metadata) => {
            if !metadata.is_dir() {
                return Err(FsGuardError::new(
                    FsErrorCode::PathNotDirectory,
                    &path,
                    "ensure_directory",
                ));
            }
            let report = check_permissions(&path);
            if report.readable && report.writable {
                return Ok(path);
            }
            warn!(path = %path.display(), "artifact directory lacks permissions, attempting repair");
            match repair_permissions(&path) {
                Ok(()) => {
                    let repaired = check_permissions(&path);
                    if repaired.readable && repaired.writable {
                        debug!(path = %path.display(), "permission repair succeeded");
                        Ok(path)
                    } else {
                        Err(FsGuardError::new(
                            FsErrorCode::PermissionDenied,
                            &path,
                            "ensure_directory",
                        ))
                    }
                }
                Err(err) => Err(FsGuardError::with_source(
                    FsErrorCode::PermissionDenied,
                    &path,
                    "ensure_directory",
                    err,
                )),
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(&path).map_err(|err| {
                FsGuardError::with_source(
                    map_code(&err, FsErrorCode::WriteError),
                    &path,
                    "ensure_directory",
                    err,
                )
            })?;
            Ok(path)
        }
        Err(err) => Err(FsGuardError::with_source(
            map_code(&err, FsErrorCode::Unknown),
            &path,
            "ensure_directory",
            err,
        )),
    }
}

/// Write a file, creating its parent directory on demand.
///
/// Returns the absolutized path written.
pub fn write_file(path: &Path, data: &[u8]) -> Result<PathBuf, FsGuardError> {
    let path = absolutize(path);
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }
    fs::write(&path, data).map_err(|err| {
        FsGuardError::with_source(
            map_code(&err, FsErrorCode::WriteError),
            &path,
            "write_file",
            err,
        )
    })?;
    Ok(path)
}

/// Read a file into memory.
pub fn read_file(path: &Path) -> Result<Vec<u8>, FsGuardError> {
    let path = absolutize(path);
    fs::read(&path).map_err(|err| {
        FsGuardError::with_source(
            map_code(&err, FsErrorCode::ReadError),
            &path,
            "read_file",
            err,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_directory_creates_missing_path() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("a").join("b").join("c");

        let created = ensure_directory(&target).unwrap();
        assert!(created.is_dir());
        assert!(created.is_absolute());
    }

    #[test]
    fn ensure_directory_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("artifacts");

        let first = ensure_directory(&target).unwrap();
        let second = ensure_directory(&target).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ensure_directory_rejects_files() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();

        let err = ensure_directory(&file).unwrap_err();
        assert_eq!(err.code, FsErrorCode::PathNotDirectory);
        assert_eq!(err.operation, "ensure_directory");
    }

    #[cfg(unix)]
    #[test]
    fn ensure_directory_repairs_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let locked = tmp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Running as root makes mode bits moot; the repair path still
        // restores 0o700 either way.
        let result = ensure_directory(&locked);
        let report = check_permissions(&locked);
        assert!(result.is_ok());
        assert!(report.readable && report.writable);
    }

    #[test]
    fn write_file_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("deep").join("nested").join("out.json");

        let written = write_file(&target, b"{}").unwrap();
        assert_eq!(fs::read(&written).unwrap(), b"{}");
    }

    #[test]
    fn read_missing_file_maps_to_path_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = read_file(&tmp.path().join("absent.json")).unwrap_err();
        assert_eq!(err.code, FsErrorCode::PathNotFound);
    }

    #[test]
    fn check_permissions_reports_missing_path() {
        let tmp = TempDir::new().unwrap();
        let report = check_permissions(&tmp.path().join("ghost"));
        assert!(report.error.is_some());
        assert!(!report.readable);
        assert!(!report.is_directory);
    }

    #[test]
    fn check_permissions_on_directory() {
        let tmp = TempDir::new().unwrap();
        let report = check_permissions(tmp.path());
        assert!(report.error.is_none());
        assert!(report.is_directory);
        assert!(!report.is_file);
        assert!(report.readable);
    }
}
