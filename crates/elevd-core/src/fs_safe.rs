//! Atomic file I/O primitives for the persisted grant ledger.
//!
//! The ledger file must never be observable in a torn state: the service can
//! be killed at any point between a grant and the next write, and a partial
//! file on restart would silently lose track of still-privileged principals.
//! Two helpers cover the persistence paths:
//!
//! 1. **Atomic writer** ([`atomic_write`], [`atomic_write_json`]): write to a
//!    temp file in the same directory, fsync the data, rename over the final
//!    path, then fsync the parent directory. A crash at any point leaves
//!    either the old complete file or the new complete file.
//!
//! 2. **Bounded JSON reader** ([`bounded_read_json`]): refuses symlinks,
//!    checks the file size against a cap before allocating, and only then
//!    deserializes. A corrupted or adversarial state file cannot exhaust
//!    memory.
//!
//! Files are created 0600 and parent directories 0700 (Unix).

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Default upper bound for a single state-file read.
///
/// 16 MiB is generous for a JSON grant ledger while still preventing
/// memory-exhaustion from corrupted files.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Errors from safe filesystem operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FsSafeError {
    /// File exceeds the configured size cap.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual file size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: u64,
    },

    /// The target path is a symbolic link.
    #[error("refusing to open symlink at {}", path.display())]
    SymlinkRefused {
        /// Path that was a symlink.
        path: std::path::PathBuf,
    },

    /// The opened path is not a regular file (e.g., device, pipe, socket).
    #[error("not a regular file at {}", path.display())]
    NotRegularFile {
        /// Path that was not a regular file.
        path: std::path::PathBuf,
    },

    /// The final path has no parent directory (cannot create temp file).
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path with no parent.
        path: std::path::PathBuf,
    },

    /// JSON serialization failed.
    #[error("json serialization failed: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// JSON deserialization failed.
    #[error("json deserialization failed: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl FsSafeError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Writes `data` to `path` atomically via temp-file + fsync + rename.
///
/// The temp file is created in the same directory as `path` so the rename
/// stays within one filesystem. The parent directory is created with 0700
/// permissions if missing, and fsynced after the rename so the directory
/// entry itself is durable.
///
/// # Errors
///
/// Returns [`FsSafeError`] if any filesystem operation fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsSafeError> {
    let parent = path
        .parent()
        .ok_or_else(|| FsSafeError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;

    create_dir_0700(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsSafeError::io("create temp file", e))?;

    tmp.write_all(data)
        .map_err(|e| FsSafeError::io("write to temp file", e))?;
    tmp.flush()
        .map_err(|e| FsSafeError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsSafeError::io("fsync temp file", e))?;

    // NamedTempFile::persist does rename(2): atomic replace.
    tmp.persist(path)
        .map_err(|e| FsSafeError::io("atomic rename to final path", e.error))?;

    fsync_directory(parent)?;

    Ok(())
}

/// Serializes `value` to pretty-printed JSON and writes it atomically.
///
/// Serialization happens in memory before any file I/O, so a serialization
/// failure never leaves a partial file on disk.
///
/// # Errors
///
/// Returns [`FsSafeError::SerializeFailed`] if serialization fails, or any
/// I/O error from [`atomic_write`].
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsSafeError> {
    let json = serde_json::to_string_pretty(value).map_err(FsSafeError::SerializeFailed)?;
    atomic_write(path, json.as_bytes())
}

/// Reads and deserializes a JSON file with a size cap and symlink refusal.
///
/// The size check runs on handle metadata before any allocation, and the
/// symlink check uses `symlink_metadata` (lstat) so a replaced path is
/// refused rather than followed.
///
/// # Errors
///
/// - [`FsSafeError::SymlinkRefused`] if the path is a symlink.
/// - [`FsSafeError::NotRegularFile`] if the path is not a regular file.
/// - [`FsSafeError::FileTooLarge`] if the file exceeds `max_size`.
/// - [`FsSafeError::DeserializeFailed`] on invalid JSON.
pub fn bounded_read_json<T: DeserializeOwned>(
    path: &Path,
    max_size: u64,
) -> Result<T, FsSafeError> {
    let meta =
        fs::symlink_metadata(path).map_err(|e| FsSafeError::io("symlink_metadata check", e))?;

    if meta.file_type().is_symlink() {
        return Err(FsSafeError::SymlinkRefused {
            path: path.to_path_buf(),
        });
    }

    let file = File::open(path).map_err(|e| FsSafeError::io("open file", e))?;

    // fstat on the handle, not the path: no window between check and read.
    let meta = file
        .metadata()
        .map_err(|e| FsSafeError::io("fstat after open", e))?;

    if !meta.is_file() {
        return Err(FsSafeError::NotRegularFile {
            path: path.to_path_buf(),
        });
    }

    let size = meta.len();
    if size > max_size {
        return Err(FsSafeError::FileTooLarge {
            size,
            max: max_size,
        });
    }

    #[allow(clippy::cast_possible_truncation)] // size <= max_size which is usize-range
    let mut buf = Vec::with_capacity(size as usize);
    file.take(max_size)
        .read_to_end(&mut buf)
        .map_err(|e| FsSafeError::io("read file", e))?;

    serde_json::from_slice(&buf).map_err(FsSafeError::DeserializeFailed)
}

/// Creates the parent directory of `path` with 0700 permissions if it does
/// not exist.
///
/// # Errors
///
/// Returns [`FsSafeError`] if directory creation fails.
pub fn ensure_parent_dir(path: &Path) -> Result<(), FsSafeError> {
    match path.parent() {
        Some(parent) => create_dir_0700(parent),
        None => Ok(()),
    }
}

/// Creates a directory (and ancestors) with 0700 permissions if missing.
fn create_dir_0700(parent: &Path) -> Result<(), FsSafeError> {
    if parent.as_os_str().is_empty() || parent.exists() {
        return Ok(());
    }

    fs::create_dir_all(parent).map_err(|e| FsSafeError::io("create parent directory", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
            .map_err(|e| FsSafeError::io("set parent directory permissions", e))?;
    }

    Ok(())
}

/// Fsyncs a directory so a completed rename is durable.
///
/// Directory fsync is a no-op on platforms where directories cannot be
/// opened for sync; errors from the open are ignored there.
fn fsync_directory(dir: &Path) -> Result<(), FsSafeError> {
    match File::open(dir) {
        Ok(handle) => handle
            .sync_all()
            .map_err(|e| FsSafeError::io("fsync parent directory", e)),
        // Windows refuses to open directories via File::open.
        Err(_) => Ok(()),
    }
}
