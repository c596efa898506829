//! Pluggable persistence for the grant ledger.
//!
//! The [`LedgerStore`] trait separates ledger logic from its storage
//! strategy: the production [`JsonLedgerStore`] persists a versioned JSON
//! document with atomic replacement, and [`MemoryLedgerStore`] backs tests.
//! An encrypted-at-rest variant is a drop-in trait implementation, not a
//! parallel code path.
//!
//! Loading is self-healing by contract: an absent, unreadable, or corrupt
//! ledger file yields an empty ledger (logged as a warning), never an error.
//! The caller persists a fresh file on the next mutation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Grant, GrantSet};
use crate::fs_safe::{self, DEFAULT_MAX_FILE_SIZE};

/// Version of the persisted ledger document format.
pub const LEDGER_FORMAT_VERSION: u32 = 1;

/// Errors from persisting the ledger.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Writing the ledger file failed.
    #[error("failed to persist ledger: {0}")]
    Persist(#[from] fs_safe::FsSafeError),
}

/// Storage strategy for the grant ledger.
///
/// `load` never fails: missing or corrupt state resets to an empty ledger so
/// the service always starts. `save` reports failures so the caller can log
/// them; the in-memory ledger stays authoritative for the running process
/// and the write is retried on the next mutation.
pub trait LedgerStore: Send + Sync {
    /// Loads the persisted ledger, or an empty one if none is readable.
    fn load(&self) -> GrantSet;

    /// Persists the full ledger durably and atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn save(&self, grants: &GrantSet) -> Result<(), StoreError>;
}

/// On-disk shape of the ledger file.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    version: u32,
    grants: Vec<Grant>,
}

/// JSON file store with atomic replacement.
///
/// The document lives at a fixed path under a machine-wide state directory
/// (created 0700, file 0600). Every save rewrites the whole document via
/// temp-file + fsync + rename, so a crash mid-write leaves the previous
/// complete ledger in place.
pub struct JsonLedgerStore {
    path: PathBuf,
}

impl JsonLedgerStore {
    /// Creates a store persisting to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the ledger file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for JsonLedgerStore {
    fn load(&self) -> GrantSet {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no ledger file, starting empty");
            return GrantSet::new();
        }

        let doc: LedgerDocument =
            match fs_safe::bounded_read_json(&self.path, DEFAULT_MAX_FILE_SIZE) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "ledger file unreadable, resetting to empty"
                    );
                    return GrantSet::new();
                },
            };

        if doc.version != LEDGER_FORMAT_VERSION {
            warn!(
                path = %self.path.display(),
                found = doc.version,
                expected = LEDGER_FORMAT_VERSION,
                "ledger file has unsupported version, resetting to empty"
            );
            return GrantSet::new();
        }

        let mut grants = GrantSet::new();
        for grant in doc.grants {
            // Stored records are inserted verbatim (merge already happened
            // before the save); last entry wins on a (malformed) duplicate
            // principal, keeping one grant per principal.
            grants.insert(grant);
        }
        grants
    }

    fn save(&self, grants: &GrantSet) -> Result<(), StoreError> {
        let doc = LedgerDocument {
            version: LEDGER_FORMAT_VERSION,
            grants: grants.iter().cloned().collect(),
        };
        fs_safe::atomic_write_json(&self.path, &doc)?;
        Ok(())
    }
}

/// In-memory store for tests: `save` snapshots, `load` returns the snapshot.
#[derive(Default)]
pub struct MemoryLedgerStore {
    snapshot: Mutex<GrantSet>,
}

impl MemoryLedgerStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> GrantSet {
        self.snapshot.lock().expect("store mutex poisoned").clone()
    }

    fn save(&self, grants: &GrantSet) -> Result<(), StoreError> {
        *self.snapshot.lock().expect("store mutex poisoned") = grants.clone();
        Ok(())
    }
}
