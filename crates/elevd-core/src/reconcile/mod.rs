//! The periodic sweep that repairs ledger/group drift.
//!
//! The ledger is the intended state and the live group is the observed
//! state; the two diverge when grants expire, when an outside actor edits
//! the group directly, or when a principal loses the membership that
//! qualified it for a non-expiring grant. [`Reconciler::sweep`] drives the
//! observed state back toward the intended one:
//!
//! 1. Expired grants are revoked. A failed OS removal keeps the ledger
//!    entry so the next sweep retries.
//! 2. A granted principal missing from the live group was removed by an
//!    outside actor. With a still-future expiration, policy decides:
//!    restore the membership or accept the removal and drop the entry.
//!    With a passed expiration, the entry is simply dropped. A
//!    non-expiring grant is restored only while the principal still
//!    qualifies for automatic membership.
//! 3. Live members with no ledger entry are not ours to manage and are
//!    left untouched.
//!
//! Sweeps never overlap: the driving timer takes a `try_lock` on the sweep
//! guard and skips the tick if the previous sweep is still running.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::controller::{GrantController, RevokeReason};
use crate::grant::GrantSet;
use crate::principal::Principal;

/// Counters describing what one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired grants revoked from the group and ledger.
    pub expired_revoked: usize,
    /// Externally-removed memberships re-added to the group.
    pub restored: usize,
    /// External removals accepted as authoritative (ledger entry dropped).
    pub external_removals_accepted: usize,
    /// Non-expiring grants dropped because the principal no longer
    /// qualifies for automatic membership.
    pub disqualified: usize,
    /// Platform calls that failed; the affected entries retry next sweep.
    pub failures: usize,
}

impl SweepReport {
    /// Returns `true` if the sweep changed nothing and hit no failures.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

/// Drives the ledger and the live group back into agreement.
pub struct Reconciler {
    controller: Arc<GrantController>,
    sweep_guard: Mutex<()>,
}

impl Reconciler {
    /// Creates a reconciler over the controller's ledger and group.
    #[must_use]
    pub fn new(controller: Arc<GrantController>) -> Self {
        Self {
            controller,
            sweep_guard: Mutex::new(()),
        }
    }

    /// Runs one sweep if none is in progress, or skips the tick.
    ///
    /// Returns `None` when a previous sweep still holds the guard.
    #[must_use]
    pub fn try_sweep(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        let Ok(_guard) = self.sweep_guard.try_lock() else {
            debug!("previous sweep still running, skipping tick");
            return None;
        };
        Some(self.sweep_locked(now))
    }

    /// Runs one sweep, waiting for any in-progress sweep to finish first.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let _guard = self.sweep_guard.lock().expect("sweep guard poisoned");
        self.sweep_locked(now)
    }

    fn sweep_locked(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        // Snapshot the ledger before touching the group. A grant completing
        // after this point is in neither view and waits for the next sweep;
        // snapshotting after enumeration would make it look like an external
        // removal and drop a still-valid entry.
        let snapshot = self.controller.grant_snapshot();

        let mut handled: HashSet<Principal> = HashSet::new();
        for principal in snapshot.expired_principals(now) {
            match self.controller.request_revoke(&principal, RevokeReason::Timeout) {
                Ok(()) => report.expired_revoked += 1,
                Err(_) => report.failures += 1,
            }
            handled.insert(principal);
        }

        match self.controller.live_members() {
            Ok(members) => self.repair_drift(&snapshot, &handled, &members, &mut report),
            Err(e) => {
                warn!(error = %e, "group enumeration failed, skipping drift repair");
                report.failures += 1;
            },
        }

        if report.is_quiet() {
            debug!("sweep found ledger and group in agreement");
        } else {
            info!(
                expired = report.expired_revoked,
                restored = report.restored,
                accepted = report.external_removals_accepted,
                disqualified = report.disqualified,
                failures = report.failures,
                "sweep repaired drift"
            );
        }
        report
    }

    /// Handles granted principals missing from the live group. Works from
    /// the pre-enumeration snapshot; entries already revoked (or attempted)
    /// in the expiry pass are skipped rather than mistaken for external
    /// removals.
    fn repair_drift(
        &self,
        snapshot: &GrantSet,
        handled: &HashSet<Principal>,
        members: &[Principal],
        report: &mut SweepReport,
    ) {
        for grant in snapshot.iter() {
            if handled.contains(&grant.principal) || members.contains(&grant.principal) {
                continue;
            }

            match grant.expiration {
                // Strictly future: every passed expiration went through the
                // expiry pass above.
                Some(expiration) => {
                    if self.controller.restores_external_removals() {
                        match self.controller.restore_membership(&grant.principal) {
                            Ok(()) => {
                                info!(
                                    principal = %grant.principal,
                                    expires_at = %expiration,
                                    "restored membership removed by external process"
                                );
                                report.restored += 1;
                            },
                            Err(e) => {
                                warn!(
                                    principal = %grant.principal,
                                    error = %e,
                                    "failed to restore externally removed membership"
                                );
                                report.failures += 1;
                            },
                        }
                    } else {
                        info!(
                            principal = %grant.principal,
                            "accepting external removal, dropping grant"
                        );
                        self.controller
                            .forget(&grant.principal, RevokeReason::ExternalProcess);
                        report.external_removals_accepted += 1;
                    }
                },
                None => {
                    if self.controller.qualifies_for_automatic(&grant.principal) {
                        match self.controller.restore_membership(&grant.principal) {
                            Ok(()) => {
                                info!(
                                    principal = %grant.principal,
                                    "restored automatic membership removed externally"
                                );
                                report.restored += 1;
                            },
                            Err(e) => {
                                warn!(
                                    principal = %grant.principal,
                                    error = %e,
                                    "failed to restore automatic membership"
                                );
                                report.failures += 1;
                            },
                        }
                    } else {
                        info!(
                            principal = %grant.principal,
                            "principal no longer qualifies for automatic membership, dropping grant"
                        );
                        self.controller
                            .forget(&grant.principal, RevokeReason::ExternalProcess);
                        report.disqualified += 1;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::config::{PolicyConfig, TimeoutConfig};
    use crate::directory::{GroupControl, MemoryDirectory};
    use crate::grant::store::MemoryLedgerStore;

    struct Fixture {
        controller: Arc<GrantController>,
        reconciler: Reconciler,
        directory: Arc<MemoryDirectory>,
    }

    fn fixture(policy: PolicyConfig) -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert_principal(
            Principal::from("uid-1000"),
            "alice",
            vec![Principal::from("gid-100")],
        );
        directory.insert_principal(Principal::from("gid-100"), "developers", vec![]);
        directory.insert_principal(Principal::from("uid-2000"), "bob", vec![]);

        let controller = Arc::new(GrantController::new(
            "sudo",
            policy,
            TimeoutConfig::default(),
            Box::new(MemoryLedgerStore::new()),
            directory.clone(),
            directory.clone(),
            directory.clone(),
        ));
        Fixture {
            reconciler: Reconciler::new(controller.clone()),
            controller,
            directory,
        }
    }

    fn alice() -> Principal {
        Principal::from("uid-1000")
    }

    #[test]
    fn quiet_sweep_on_agreement() {
        let f = fixture(PolicyConfig::default());
        f.controller.request_grant(&alice(), None, None).unwrap();

        let report = f.reconciler.sweep(Utc::now());

        assert!(report.is_quiet());
        assert!(f.controller.is_granted(&alice()));
        assert!(f.directory.is_member("sudo", &alice()));
    }

    #[test]
    fn expired_grant_is_revoked() {
        let f = fixture(PolicyConfig::default());
        let soon = Utc::now() + Duration::seconds(30);
        f.controller
            .request_grant(&alice(), Some(soon), None)
            .unwrap();

        let report = f.reconciler.sweep(soon + Duration::seconds(1));

        assert_eq!(report.expired_revoked, 1);
        assert!(!f.controller.is_granted(&alice()));
        assert!(!f.directory.is_member("sudo", &alice()));
    }

    #[test]
    fn external_removal_restored_when_policy_says_so() {
        let f = fixture(PolicyConfig {
            restore_external_removals: true,
            ..PolicyConfig::default()
        });
        f.controller.request_grant(&alice(), None, None).unwrap();
        f.directory.force_remove_member("sudo", &alice());

        let report = f.reconciler.sweep(Utc::now());

        assert_eq!(report.restored, 1);
        assert!(f.directory.is_member("sudo", &alice()));
        assert!(f.controller.is_granted(&alice()));
    }

    #[test]
    fn external_removal_accepted_by_default() {
        let f = fixture(PolicyConfig::default());
        f.controller.request_grant(&alice(), None, None).unwrap();
        f.directory.force_remove_member("sudo", &alice());

        let report = f.reconciler.sweep(Utc::now());

        assert_eq!(report.external_removals_accepted, 1);
        assert!(!f.directory.is_member("sudo", &alice()));
        assert!(!f.controller.is_granted(&alice()));
    }

    #[test]
    fn externally_removed_expired_entry_is_retired() {
        let f = fixture(PolicyConfig {
            restore_external_removals: true,
            ..PolicyConfig::default()
        });
        let soon = Utc::now() + Duration::seconds(30);
        f.controller
            .request_grant(&alice(), Some(soon), None)
            .unwrap();
        f.directory.force_remove_member("sudo", &alice());

        let report = f.reconciler.sweep(soon + Duration::seconds(1));

        assert_eq!(report.expired_revoked, 1);
        assert_eq!(report.restored, 0);
        assert!(!f.controller.is_granted(&alice()));
        assert!(!f.directory.is_member("sudo", &alice()));
    }

    #[test]
    fn automatic_grant_restored_while_still_qualified() {
        let f = fixture(PolicyConfig {
            automatic_allow: vec!["developers".to_string()],
            ..PolicyConfig::default()
        });
        f.controller.request_grant(&alice(), None, None).unwrap();
        f.directory.force_remove_member("sudo", &alice());

        let report = f.reconciler.sweep(Utc::now());

        assert_eq!(report.restored, 1);
        assert!(f.directory.is_member("sudo", &alice()));
    }

    #[test]
    fn disqualified_automatic_grant_is_dropped() {
        let f = fixture(PolicyConfig {
            automatic_allow: vec!["developers".to_string()],
            ..PolicyConfig::default()
        });
        f.controller.request_grant(&alice(), None, None).unwrap();
        f.directory.force_remove_member("sudo", &alice());
        // Alice leaves the developers group between sweeps.
        f.directory.set_memberships(&alice(), vec![]);

        let report = f.reconciler.sweep(Utc::now());

        assert_eq!(report.disqualified, 1);
        assert!(!f.controller.is_granted(&alice()));
        assert!(!f.directory.is_member("sudo", &alice()));
    }

    /// Group control wrapper whose first `list_members` call completes a
    /// grant request after reading the member list, so the sweep sees a
    /// member list older than the ledger.
    struct StaleEnumerationDirectory {
        inner: Arc<MemoryDirectory>,
        controller: Mutex<Option<Arc<GrantController>>>,
        raced: std::sync::atomic::AtomicBool,
    }

    impl StaleEnumerationDirectory {
        fn new(inner: Arc<MemoryDirectory>) -> Self {
            Self {
                inner,
                controller: Mutex::new(None),
                raced: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn arm(&self, controller: Arc<GrantController>) {
            *self.controller.lock().unwrap() = Some(controller);
        }
    }

    impl GroupControl for StaleEnumerationDirectory {
        fn add_member(
            &self,
            group: &str,
            principal: &Principal,
        ) -> Result<(), crate::directory::DirectoryError> {
            self.inner.add_member(group, principal)
        }

        fn remove_member(
            &self,
            group: &str,
            principal: &Principal,
        ) -> Result<(), crate::directory::DirectoryError> {
            self.inner.remove_member(group, principal)
        }

        fn list_members(
            &self,
            group: &str,
        ) -> Result<Vec<Principal>, crate::directory::DirectoryError> {
            let before = self.inner.list_members(group)?;
            if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                let armed = self.controller.lock().unwrap().clone();
                if let Some(controller) = armed {
                    let expires = Utc::now() + Duration::minutes(30);
                    controller
                        .request_grant(&alice(), Some(expires), None)
                        .unwrap();
                }
            }
            Ok(before)
        }
    }

    #[test]
    fn grant_landing_during_member_enumeration_is_kept() {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert_principal(Principal::from("uid-1000"), "alice", vec![]);

        let stale = Arc::new(StaleEnumerationDirectory::new(directory.clone()));
        let controller = Arc::new(GrantController::new(
            "sudo",
            PolicyConfig::default(),
            TimeoutConfig::default(),
            Box::new(MemoryLedgerStore::new()),
            stale.clone(),
            directory.clone(),
            directory.clone(),
        ));
        stale.arm(controller.clone());
        let reconciler = Reconciler::new(controller.clone());

        let report = reconciler.sweep(Utc::now());

        // The grant landed mid-sweep: it is in the group and the ledger, and
        // must not be mistaken for an external removal and dropped.
        assert_eq!(report.external_removals_accepted, 0);
        assert!(directory.is_member("sudo", &alice()));
        assert!(controller.is_granted(&alice()));
    }

    #[test]
    fn unmanaged_members_are_untouched() {
        let f = fixture(PolicyConfig::default());
        let outsider = Principal::from("uid-2000");
        f.directory.force_add_member("sudo", outsider.clone());

        let report = f.reconciler.sweep(Utc::now());

        assert!(report.is_quiet());
        assert!(f.directory.is_member("sudo", &outsider));
        assert!(!f.controller.is_granted(&outsider));
    }

    #[test]
    fn convergence_after_mixed_operations() {
        let f = fixture(PolicyConfig::default());
        let bob = Principal::from("uid-2000");

        let soon = Utc::now() + Duration::seconds(30);
        f.controller
            .request_grant(&alice(), Some(soon), None)
            .unwrap();
        f.controller.request_grant(&bob, None, None).unwrap();
        f.directory.force_remove_member("sudo", &bob);

        let report = f.reconciler.sweep(soon + Duration::seconds(1));

        // Alice expired, bob's external removal accepted: ledger empty and
        // the group holds exactly the ledger's members.
        assert_eq!(report.expired_revoked, 1);
        assert_eq!(report.external_removals_accepted, 1);
        assert!(f.controller.grant_snapshot().is_empty());
        assert!(f.directory.list_members("sudo").unwrap().is_empty());
    }

    #[test]
    fn try_sweep_runs_when_idle() {
        let f = fixture(PolicyConfig::default());
        assert!(f.reconciler.try_sweep(Utc::now()).is_some());
    }
}
