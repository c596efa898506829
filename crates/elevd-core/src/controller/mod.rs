//! Grant lifecycle orchestration.
//!
//! [`GrantController`] is the single owner of the ledger: every mutation
//! path (grant requests, revocations, the reconciliation sweep, session
//! callbacks, shutdown drain) serializes through one mutex so that
//! read-modify-persist is a single critical section and two concurrent
//! requests can never race on the persisted file.
//!
//! Operation ordering is OS-first: the external group call happens before
//! the ledger write, so a failed platform call leaves the ledger in its
//! prior consistent state. The window between a successful OS call and the
//! ledger write is expected divergence, healed by the reconciler.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{PolicyConfig, TimeoutConfig};
use crate::directory::{DirectoryError, GroupControl, IdentityDirectory, SessionDirectory};
use crate::grant::GrantSet;
use crate::grant::store::LedgerStore;
use crate::policy::{self, AuthzDecision, PolicySubject};
use crate::principal::{Principal, SessionId};
use crate::timeout;

/// Why a grant is being revoked. Carried into the revocation log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevokeReason {
    /// The grant's expiration passed.
    Timeout,
    /// The service is shutting down and draining all grants.
    ServiceStopped,
    /// The principal's last logon session ended.
    UserLogoff,
    /// The user (or an administrator) asked for the revocation.
    UserRequest,
    /// An outside process removed the membership and policy accepted it.
    ExternalProcess,
}

impl RevokeReason {
    /// Stable string form used in logs and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ServiceStopped => "service-stopped",
            Self::UserLogoff => "user-logoff",
            Self::UserRequest => "user-request",
            Self::ExternalProcess => "external-process",
        }
    }
}

impl std::fmt::Display for RevokeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from a grant request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GrantRequestError {
    /// The request failed authorization. A normal negative result, not an
    /// internal fault.
    #[error("principal {principal} is not authorized for elevation")]
    NotAuthorized {
        /// The refused principal.
        principal: Principal,
        /// Which check refused it.
        decision: AuthzDecision,
    },

    /// The platform group-add call failed; the ledger was not touched.
    #[error("group add failed for {principal}: {source}")]
    GroupAdd {
        /// The principal being granted.
        principal: Principal,
        /// The platform error.
        #[source]
        source: DirectoryError,
    },
}

/// Result of a successful grant request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantOutcome {
    /// The stored expiration after merge. `None` for a non-expiring
    /// automatic grant.
    pub expiration: Option<DateTime<Utc>>,
    /// `true` if this request merged into an existing grant.
    pub renewed: bool,
}

struct LedgerState {
    grants: GrantSet,
    store: Box<dyn LedgerStore>,
}

impl LedgerState {
    /// Persists the current grant set. Persistence failure is logged, not
    /// propagated: the in-memory ledger stays authoritative for this
    /// process and the write retries on the next mutation.
    fn persist(&self) {
        if let Err(e) = self.store.save(&self.grants) {
            error!(error = %e, "failed to persist grant ledger, will retry on next mutation");
        }
    }
}

/// The request-facing orchestrator over policy, timeouts, the ledger, and
/// the platform group primitive.
pub struct GrantController {
    ledger: Mutex<LedgerState>,
    groups: Arc<dyn GroupControl>,
    identity: Arc<dyn IdentityDirectory>,
    sessions: Arc<dyn SessionDirectory>,
    policy: PolicyConfig,
    timeouts: TimeoutConfig,
    group: String,
}

impl GrantController {
    /// Builds a controller, loading the persisted ledger from `store`.
    ///
    /// Loading is self-healing (an absent or corrupt file yields an empty
    /// ledger); a fresh file is written immediately so the on-disk state is
    /// valid from startup.
    pub fn new(
        group: impl Into<String>,
        policy: PolicyConfig,
        timeouts: TimeoutConfig,
        store: Box<dyn LedgerStore>,
        groups: Arc<dyn GroupControl>,
        identity: Arc<dyn IdentityDirectory>,
        sessions: Arc<dyn SessionDirectory>,
    ) -> Self {
        let grants = store.load();
        let ledger = LedgerState { grants, store };
        ledger.persist();

        info!(
            grants = ledger.grants.len(),
            "grant ledger loaded"
        );

        Self {
            ledger: Mutex::new(ledger),
            groups,
            identity,
            sessions,
            policy,
            timeouts,
            group: group.into(),
        }
    }

    /// The privileged group this controller manages.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Builds the policy subject for a principal from the identity
    /// directory. Resolution failures degrade to an unnamed subject with no
    /// memberships; they never block a decision.
    fn subject_for(&self, principal: &Principal) -> PolicySubject {
        let display_name = self.identity.display_name(principal);
        let membership_ids = match self.identity.memberships(principal) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(principal = %principal, error = %e, "membership lookup failed");
                Vec::new()
            },
        };
        let membership_names = membership_ids
            .iter()
            .filter_map(|m| self.identity.display_name(m))
            .collect();

        PolicySubject {
            principal: principal.clone(),
            display_name,
            membership_ids,
            membership_names,
        }
    }

    /// Handles a grant request.
    ///
    /// Authorization runs first (local lists always, remote lists when
    /// `origin` is present). Automatic-qualified principals receive a
    /// non-expiring grant; everyone else gets `now + effective timeout`,
    /// unless `hint` overrides the computed expiration. The OS add precedes
    /// the ledger write; merge semantics apply for repeat requests.
    ///
    /// # Errors
    ///
    /// - [`GrantRequestError::NotAuthorized`] on policy refusal (no side
    ///   effects).
    /// - [`GrantRequestError::GroupAdd`] if the platform call fails (ledger
    ///   untouched).
    pub fn request_grant(
        &self,
        principal: &Principal,
        hint: Option<DateTime<Utc>>,
        origin: Option<String>,
    ) -> Result<GrantOutcome, GrantRequestError> {
        let subject = self.subject_for(principal);

        let decision = policy::authorize_request(&subject, origin.as_deref(), &self.policy);
        if !decision.is_allowed() {
            warn!(
                principal = %principal,
                decision = ?decision,
                origin = origin.as_deref(),
                "grant request refused by policy"
            );
            return Err(GrantRequestError::NotAuthorized {
                principal: principal.clone(),
                decision,
            });
        }

        let now = Utc::now();
        let expiration = if policy::qualifies_for_automatic(&subject, &self.policy) {
            None
        } else {
            Some(hint.unwrap_or_else(|| {
                let minutes = timeout::effective_timeout_minutes(
                    &subject,
                    self.timeouts.base_minutes,
                    &self.timeouts.overrides,
                );
                timeout::expiration_from(now, minutes)
            }))
        };

        self.groups
            .add_member(&self.group, principal)
            .map_err(|source| {
                error!(
                    principal = %principal,
                    group = %self.group,
                    error = %source,
                    "group add failed, ledger untouched"
                );
                GrantRequestError::GroupAdd {
                    principal: principal.clone(),
                    source,
                }
            })?;

        let mut ledger = self.lock_ledger();
        let renewed = ledger.grants.contains(principal);
        let stored = ledger
            .grants
            .add_or_merge(principal.clone(), expiration, origin.clone(), now);
        let outcome = GrantOutcome {
            expiration: stored.expiration,
            renewed,
        };
        ledger.persist();
        drop(ledger);

        info!(
            principal = %principal,
            expires_at = ?outcome.expiration,
            renewed,
            origin = origin.as_deref(),
            "grant recorded"
        );
        Ok(outcome)
    }

    /// Revokes a principal's membership and ledger entry.
    ///
    /// The OS remove runs first and must succeed before the ledger entry is
    /// dropped, so a failed removal leaves the entry for the next sweep to
    /// retry. Revoking a principal with no grant is a no-op (the OS remove
    /// is still attempted, keeping ledger and group converged).
    ///
    /// # Errors
    ///
    /// Returns the platform error if the group remove fails; the ledger is
    /// left untouched in that case.
    pub fn request_revoke(
        &self,
        principal: &Principal,
        reason: RevokeReason,
    ) -> Result<(), DirectoryError> {
        if let Err(e) = self.groups.remove_member(&self.group, principal) {
            warn!(
                principal = %principal,
                reason = %reason,
                error = %e,
                "group remove failed, keeping ledger entry for retry"
            );
            return Err(e);
        }

        let mut ledger = self.lock_ledger();
        let removed = ledger.grants.remove(principal).is_some();
        if removed {
            ledger.persist();
        }
        drop(ledger);

        if removed {
            info!(principal = %principal, reason = %reason, "grant revoked");
        } else {
            debug!(principal = %principal, reason = %reason, "revoke of ungranted principal, no-op");
        }
        Ok(())
    }

    /// Returns `true` if the principal holds a grant.
    #[must_use]
    pub fn is_granted(&self, principal: &Principal) -> bool {
        self.lock_ledger().grants.contains(principal)
    }

    /// Returns `true` if the session's owning principal holds a grant.
    #[must_use]
    pub fn is_session_granted(&self, session: &SessionId) -> bool {
        self.sessions
            .principal_for_session(session)
            .is_some_and(|p| self.is_granted(&p))
    }

    /// Snapshot of the current grant set (for the reconciler and the wire).
    #[must_use]
    pub fn grant_snapshot(&self) -> GrantSet {
        self.lock_ledger().grants.clone()
    }

    /// Every principal currently holding a grant.
    #[must_use]
    pub fn granted_principals(&self) -> Vec<Principal> {
        self.lock_ledger().grants.all_principals()
    }

    /// Whether policy directs the reconciler to restore memberships removed
    /// by an outside actor while a grant is still live.
    #[must_use]
    pub fn restores_external_removals(&self) -> bool {
        self.policy.restore_external_removals
    }

    /// Drops a ledger entry without touching the live group.
    ///
    /// Used by the reconciler when an outside removal is accepted as
    /// authoritative or a non-expiring grant lost its qualification.
    pub fn forget(&self, principal: &Principal, reason: RevokeReason) {
        let mut ledger = self.lock_ledger();
        let removed = ledger.grants.remove(principal).is_some();
        if removed {
            ledger.persist();
        }
        drop(ledger);

        if removed {
            info!(principal = %principal, reason = %reason, "ledger entry dropped");
        }
    }

    /// Re-adds a principal to the live group without a ledger mutation.
    ///
    /// # Errors
    ///
    /// Returns the platform error if the group add fails.
    pub fn restore_membership(&self, principal: &Principal) -> Result<(), DirectoryError> {
        self.groups.add_member(&self.group, principal)
    }

    /// Enumerates the live members of the managed group.
    ///
    /// # Errors
    ///
    /// Returns the platform error if enumeration fails.
    pub fn live_members(&self) -> Result<Vec<Principal>, DirectoryError> {
        self.groups.list_members(&self.group)
    }

    /// Re-resolves whether a principal currently qualifies for an automatic
    /// (non-expiring) grant.
    #[must_use]
    pub fn qualifies_for_automatic(&self, principal: &Principal) -> bool {
        policy::qualifies_for_automatic(&self.subject_for(principal), &self.policy)
    }

    /// Best-effort revocation of every outstanding grant (service stop).
    ///
    /// Returns the number of grants successfully revoked; failures stay in
    /// the ledger and are retried by the reconciler on next start.
    pub fn drain(&self, reason: RevokeReason) -> usize {
        let principals = self.lock_ledger().grants.all_principals();
        let mut revoked = 0;
        for principal in principals {
            if self.request_revoke(&principal, reason).is_ok() {
                revoked += 1;
            }
        }
        info!(revoked, reason = %reason, "drained outstanding grants");
        revoked
    }

    /// Handles a session-logoff notification.
    ///
    /// When `remove_on_logout` is enabled and no other live session belongs
    /// to the same principal, the principal's grant is revoked with
    /// [`RevokeReason::UserLogoff`]. Returns `true` if a revocation was
    /// performed.
    ///
    /// # Errors
    ///
    /// Returns the platform error if the resulting group remove fails.
    pub fn handle_session_logoff(&self, session: &SessionId) -> Result<bool, DirectoryError> {
        if !self.policy.remove_on_logout {
            return Ok(false);
        }

        let Some(principal) = self.sessions.principal_for_session(session) else {
            debug!(session = %session, "logoff for unresolvable session, ignoring");
            return Ok(false);
        };

        self.logoff_if_last_session(&principal, Some(session))
    }

    /// Handles a logoff when the caller already resolved the principal (the
    /// session may no longer be enumerable by the time the notification
    /// arrives).
    ///
    /// # Errors
    ///
    /// Returns the platform error if the resulting group remove fails.
    pub fn handle_principal_logoff(&self, principal: &Principal) -> Result<bool, DirectoryError> {
        if !self.policy.remove_on_logout {
            return Ok(false);
        }
        self.logoff_if_last_session(principal, None)
    }

    fn logoff_if_last_session(
        &self,
        principal: &Principal,
        ended: Option<&SessionId>,
    ) -> Result<bool, DirectoryError> {
        if !self.is_granted(principal) {
            return Ok(false);
        }

        let others = self
            .sessions
            .list_sessions()?
            .into_iter()
            .filter(|s| Some(s) != ended)
            .any(|s| self.sessions.principal_for_session(&s).as_ref() == Some(principal));
        if others {
            debug!(
                principal = %principal,
                "principal still has another live session, keeping grant"
            );
            return Ok(false);
        }

        self.request_revoke(principal, RevokeReason::UserLogoff)?;
        Ok(true)
    }

    fn lock_ledger(&self) -> MutexGuard<'_, LedgerState> {
        self.ledger.lock().expect("ledger mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::grant::store::MemoryLedgerStore;

    struct Fixture {
        controller: GrantController,
        directory: Arc<MemoryDirectory>,
    }

    fn fixture(policy: PolicyConfig) -> Fixture {
        fixture_with_timeouts(policy, TimeoutConfig::default())
    }

    fn fixture_with_timeouts(policy: PolicyConfig, timeouts: TimeoutConfig) -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert_principal(
            Principal::from("uid-1000"),
            "alice",
            vec![Principal::from("gid-100")],
        );
        directory.insert_principal(Principal::from("gid-100"), "developers", vec![]);
        directory.insert_principal(Principal::from("uid-2000"), "bob", vec![]);

        let controller = GrantController::new(
            "sudo",
            policy,
            timeouts,
            Box::new(MemoryLedgerStore::new()),
            directory.clone(),
            directory.clone(),
            directory.clone(),
        );
        Fixture {
            controller,
            directory,
        }
    }

    fn alice() -> Principal {
        Principal::from("uid-1000")
    }

    #[test]
    fn authorized_grant_adds_to_group_and_ledger() {
        let f = fixture(PolicyConfig::default());

        let outcome = f.controller.request_grant(&alice(), None, None).unwrap();

        assert!(outcome.expiration.is_some());
        assert!(!outcome.renewed);
        assert!(f.controller.is_granted(&alice()));
        assert!(f.directory.is_member("sudo", &alice()));
    }

    #[test]
    fn denied_grant_has_no_side_effects() {
        let f = fixture(PolicyConfig {
            local_allow: Some(vec![]),
            ..PolicyConfig::default()
        });

        let err = f.controller.request_grant(&alice(), None, None).unwrap_err();

        assert!(matches!(err, GrantRequestError::NotAuthorized { .. }));
        assert!(!f.controller.is_granted(&alice()));
        assert!(!f.directory.is_member("sudo", &alice()));
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let f = fixture(PolicyConfig {
            local_allow: Some(vec!["alice".to_string()]),
            local_deny: vec!["alice".to_string()],
            ..PolicyConfig::default()
        });

        assert!(f.controller.request_grant(&alice(), None, None).is_err());
    }

    #[test]
    fn remote_request_checked_against_remote_lists() {
        let f = fixture(PolicyConfig {
            remote_allow: Some(vec![]),
            ..PolicyConfig::default()
        });

        // Local request passes the open local policy.
        assert!(f.controller.request_grant(&alice(), None, None).is_ok());

        // Remote request refused by the closed remote policy.
        let err = f
            .controller
            .request_grant(&Principal::from("uid-2000"), None, Some("10.0.0.9".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            GrantRequestError::NotAuthorized {
                decision: AuthzDecision::DeniedRemote,
                ..
            }
        ));
    }

    #[test]
    fn repeat_grant_merges_to_earlier_expiration() {
        let f = fixture(PolicyConfig::default());

        let early = Utc::now() + Duration::minutes(5);
        let late = Utc::now() + Duration::minutes(60);

        f.controller
            .request_grant(&alice(), Some(early), None)
            .unwrap();
        let outcome = f
            .controller
            .request_grant(&alice(), Some(late), None)
            .unwrap();

        assert!(outcome.renewed);
        assert_eq!(outcome.expiration, Some(early));
    }

    #[test]
    fn automatic_principal_gets_non_expiring_grant() {
        let f = fixture(PolicyConfig {
            automatic_allow: vec!["developers".to_string()],
            ..PolicyConfig::default()
        });

        let outcome = f.controller.request_grant(&alice(), None, None).unwrap();

        assert_eq!(outcome.expiration, None);
        assert!(f.controller.is_granted(&alice()));
    }

    #[test]
    fn timeout_override_extends_expiration() {
        let mut timeouts = TimeoutConfig {
            base_minutes: 10,
            ..TimeoutConfig::default()
        };
        timeouts
            .overrides
            .insert("developers".to_string(), "30".to_string());
        let f = fixture_with_timeouts(PolicyConfig::default(), timeouts);

        let before = Utc::now();
        let outcome = f.controller.request_grant(&alice(), None, None).unwrap();
        let expires = outcome.expiration.unwrap();

        assert!(expires >= before + Duration::minutes(30));
        assert!(expires <= Utc::now() + Duration::minutes(30));
    }

    #[test]
    fn revoke_of_ungranted_principal_is_no_op() {
        let f = fixture(PolicyConfig::default());

        f.controller
            .request_revoke(&alice(), RevokeReason::UserRequest)
            .unwrap();

        assert!(!f.controller.is_granted(&alice()));
    }

    #[test]
    fn revoke_removes_group_and_ledger() {
        let f = fixture(PolicyConfig::default());
        f.controller.request_grant(&alice(), None, None).unwrap();

        f.controller
            .request_revoke(&alice(), RevokeReason::UserRequest)
            .unwrap();

        assert!(!f.controller.is_granted(&alice()));
        assert!(!f.directory.is_member("sudo", &alice()));
    }

    #[test]
    fn drain_revokes_everything() {
        let f = fixture(PolicyConfig::default());
        f.controller.request_grant(&alice(), None, None).unwrap();
        f.controller
            .request_grant(&Principal::from("uid-2000"), None, None)
            .unwrap();

        let revoked = f.controller.drain(RevokeReason::ServiceStopped);

        assert_eq!(revoked, 2);
        assert!(f.controller.grant_snapshot().is_empty());
        assert!(f.directory.list_members("sudo").unwrap().is_empty());
    }

    #[test]
    fn session_logoff_revokes_last_session() {
        let f = fixture(PolicyConfig::default());
        let session = SessionId::from("seat0-1");
        f.directory.start_session(session.clone(), alice());
        f.controller.request_grant(&alice(), None, None).unwrap();

        assert!(f.controller.is_session_granted(&session));
        let revoked = f.controller.handle_session_logoff(&session).unwrap();

        assert!(revoked);
        assert!(!f.controller.is_granted(&alice()));
    }

    #[test]
    fn session_logoff_keeps_grant_while_other_session_lives() {
        let f = fixture(PolicyConfig::default());
        let s1 = SessionId::from("seat0-1");
        let s2 = SessionId::from("ssh-2");
        f.directory.start_session(s1.clone(), alice());
        f.directory.start_session(s2, alice());
        f.controller.request_grant(&alice(), None, None).unwrap();

        let revoked = f.controller.handle_session_logoff(&s1).unwrap();

        assert!(!revoked);
        assert!(f.controller.is_granted(&alice()));
    }

    #[test]
    fn principal_logoff_after_session_vanished_from_enumeration() {
        let f = fixture(PolicyConfig::default());
        f.controller.request_grant(&alice(), None, None).unwrap();

        // The session ended before the notification arrived, so it is no
        // longer enumerable; the caller resolved the principal itself.
        let revoked = f.controller.handle_principal_logoff(&alice()).unwrap();

        assert!(revoked);
        assert!(!f.controller.is_granted(&alice()));
    }

    #[test]
    fn session_logoff_disabled_by_policy() {
        let f = fixture(PolicyConfig {
            remove_on_logout: false,
            ..PolicyConfig::default()
        });
        let session = SessionId::from("seat0-1");
        f.directory.start_session(session.clone(), alice());
        f.controller.request_grant(&alice(), None, None).unwrap();

        let revoked = f.controller.handle_session_logoff(&session).unwrap();

        assert!(!revoked);
        assert!(f.controller.is_granted(&alice()));
    }
}
