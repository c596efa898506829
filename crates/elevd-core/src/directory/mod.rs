//! Seams to the OS account, group, and session primitives.
//!
//! The core never calls platform APIs directly: group manipulation, identity
//! resolution, and session enumeration live behind the traits here, with a
//! production implementation per platform in the daemon crate and
//! [`MemoryDirectory`] backing tests. All methods are synchronous; async
//! callers bridge via `spawn_blocking`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::principal::{Principal, SessionId};

/// Errors surfaced by the platform primitives.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DirectoryError {
    /// The platform call failed with an OS-level code.
    #[error("OS group operation failed with code {code}")]
    Os {
        /// The platform error or exit code.
        code: i32,
    },

    /// The named group does not exist.
    #[error("unknown group: {group}")]
    UnknownGroup {
        /// The group that was not found.
        group: String,
    },

    /// The principal does not exist in the directory.
    #[error("unknown principal: {principal}")]
    UnknownPrincipal {
        /// The principal that was not found.
        principal: Principal,
    },

    /// An I/O error talking to the platform.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Membership manipulation for the privileged local group.
pub trait GroupControl: Send + Sync {
    /// Adds a principal to the group.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] if the platform call fails. Adding an
    /// existing member must succeed (idempotent at this seam).
    fn add_member(&self, group: &str, principal: &Principal) -> Result<(), DirectoryError>;

    /// Removes a principal from the group.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] if the platform call fails. Removing an
    /// absent member must succeed (idempotent at this seam).
    fn remove_member(&self, group: &str, principal: &Principal) -> Result<(), DirectoryError>;

    /// Enumerates the group's current members.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] if the platform call fails.
    fn list_members(&self, group: &str) -> Result<Vec<Principal>, DirectoryError>;
}

/// Identity resolution: names and effective group memberships.
pub trait IdentityDirectory: Send + Sync {
    /// Resolves a principal to a human-readable account name.
    ///
    /// Used only for policy matching and log messages; resolution failure
    /// is represented as `None`, never as an error.
    fn display_name(&self, principal: &Principal) -> Option<String>;

    /// Returns the principal's effective group memberships.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] if the lookup fails outright. An existing
    /// principal with no memberships yields an empty vector.
    fn memberships(&self, principal: &Principal) -> Result<Vec<Principal>, DirectoryError>;
}

/// Enumeration of currently logged-on sessions.
///
/// Implementations own any handle lifetime management; callers only ever
/// see plain session identifiers.
pub trait SessionDirectory: Send + Sync {
    /// Lists the identifiers of currently logged-on sessions.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError`] if enumeration fails.
    fn list_sessions(&self) -> Result<Vec<SessionId>, DirectoryError>;

    /// Resolves the principal that owns a session, if it still exists.
    fn principal_for_session(&self, session: &SessionId) -> Option<Principal>;
}

/// In-memory directory double implementing all three seams.
///
/// Tests drive it directly to simulate external interference: adding or
/// removing group members behind the service's back, ending sessions, or
/// changing a principal's memberships between sweeps.
#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<MemoryDirectoryState>,
}

#[derive(Default)]
struct MemoryDirectoryState {
    group_members: HashMap<String, HashSet<Principal>>,
    display_names: HashMap<Principal, String>,
    memberships: HashMap<Principal, Vec<Principal>>,
    sessions: HashMap<SessionId, Principal>,
}

impl MemoryDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a principal with a display name and memberships.
    pub fn insert_principal(
        &self,
        principal: Principal,
        name: impl Into<String>,
        memberships: Vec<Principal>,
    ) {
        let mut inner = self.lock();
        inner.display_names.insert(principal.clone(), name.into());
        inner.memberships.insert(principal, memberships);
    }

    /// Starts a logon session for a principal.
    pub fn start_session(&self, session: SessionId, principal: Principal) {
        self.lock().sessions.insert(session, principal);
    }

    /// Ends a logon session.
    pub fn end_session(&self, session: &SessionId) {
        self.lock().sessions.remove(session);
    }

    /// Directly inserts a group member, bypassing the service (simulates an
    /// outside actor).
    pub fn force_add_member(&self, group: &str, principal: Principal) {
        self.lock()
            .group_members
            .entry(group.to_string())
            .or_default()
            .insert(principal);
    }

    /// Directly removes a group member, bypassing the service.
    pub fn force_remove_member(&self, group: &str, principal: &Principal) {
        if let Some(members) = self.lock().group_members.get_mut(group) {
            members.remove(principal);
        }
    }

    /// Replaces a principal's memberships (simulates losing or gaining a
    /// policy-relevant group between sweeps).
    pub fn set_memberships(&self, principal: &Principal, memberships: Vec<Principal>) {
        self.lock()
            .memberships
            .insert(principal.clone(), memberships);
    }

    /// Returns `true` if the principal is currently in the group.
    #[must_use]
    pub fn is_member(&self, group: &str, principal: &Principal) -> bool {
        self.lock()
            .group_members
            .get(group)
            .is_some_and(|m| m.contains(principal))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryDirectoryState> {
        self.inner.lock().expect("directory mutex poisoned")
    }
}

impl GroupControl for MemoryDirectory {
    fn add_member(&self, group: &str, principal: &Principal) -> Result<(), DirectoryError> {
        self.lock()
            .group_members
            .entry(group.to_string())
            .or_default()
            .insert(principal.clone());
        Ok(())
    }

    fn remove_member(&self, group: &str, principal: &Principal) -> Result<(), DirectoryError> {
        if let Some(members) = self.lock().group_members.get_mut(group) {
            members.remove(principal);
        }
        Ok(())
    }

    fn list_members(&self, group: &str) -> Result<Vec<Principal>, DirectoryError> {
        Ok(self
            .lock()
            .group_members
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }
}

impl IdentityDirectory for MemoryDirectory {
    fn display_name(&self, principal: &Principal) -> Option<String> {
        self.lock().display_names.get(principal).cloned()
    }

    fn memberships(&self, principal: &Principal) -> Result<Vec<Principal>, DirectoryError> {
        Ok(self
            .lock()
            .memberships
            .get(principal)
            .cloned()
            .unwrap_or_default())
    }
}

impl SessionDirectory for MemoryDirectory {
    fn list_sessions(&self) -> Result<Vec<SessionId>, DirectoryError> {
        Ok(self.lock().sessions.keys().cloned().collect())
    }

    fn principal_for_session(&self, session: &SessionId) -> Option<Principal> {
        self.lock().sessions.get(session).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_group_membership_round_trip() {
        let dir = MemoryDirectory::new();
        let p = Principal::from("uid-1000");

        dir.add_member("sudo", &p).unwrap();
        assert!(dir.is_member("sudo", &p));
        assert_eq!(dir.list_members("sudo").unwrap(), vec![p.clone()]);

        dir.remove_member("sudo", &p).unwrap();
        assert!(!dir.is_member("sudo", &p));
    }

    #[test]
    fn removing_from_unknown_group_is_a_no_op() {
        let dir = MemoryDirectory::new();
        dir.remove_member("nope", &Principal::from("uid-1"))
            .unwrap();
        assert!(dir.list_members("nope").unwrap().is_empty());
    }

    #[test]
    fn sessions_map_to_principals() {
        let dir = MemoryDirectory::new();
        let p = Principal::from("uid-1000");
        let s = SessionId::from("seat0-1");

        dir.start_session(s.clone(), p.clone());
        assert_eq!(dir.principal_for_session(&s), Some(p));

        dir.end_session(&s);
        assert_eq!(dir.principal_for_session(&s), None);
    }

    #[test]
    fn identity_lookup_falls_back_to_empty() {
        let dir = MemoryDirectory::new();
        let p = Principal::from("uid-1000");

        assert_eq!(dir.display_name(&p), None);
        assert!(dir.memberships(&p).unwrap().is_empty());

        dir.insert_principal(p.clone(), "alice", vec![Principal::from("gid-100")]);
        assert_eq!(dir.display_name(&p).as_deref(), Some("alice"));
        assert_eq!(dir.memberships(&p).unwrap(), vec![Principal::from("gid-100")]);
    }
}
