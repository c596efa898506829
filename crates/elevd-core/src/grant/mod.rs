//! Grant records and the keyed grant ledger.
//!
//! A [`Grant`] asserts that a principal currently holds (or should hold)
//! membership in the privileged group, with an optional expiration. The
//! [`GrantSet`] is the in-memory ledger: exactly one grant per principal,
//! keyed by the stable identifier.
//!
//! # Merge invariant
//!
//! Re-granting an already-present principal merges expirations in the
//! safety-favoring direction: the earlier of two present expirations wins,
//! a present expiration replaces an absent one, and a present expiration is
//! never cleared in favor of an absent one. A merge bumps `renewal_count`.

pub mod store;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::principal::Principal;

/// One outstanding privilege elevation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Stable identifier of the granted principal.
    pub principal: Principal,

    /// When the grant expires. `None` means the grant never expires
    /// automatically; only automatic-qualified principals may hold one.
    pub expiration: Option<DateTime<Utc>>,

    /// Remote host that requested the grant, absent for local requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Number of times a repeat request has merged into this grant.
    /// Diagnostic only; never consulted by policy.
    #[serde(default)]
    pub renewal_count: u32,

    /// When the grant was first recorded.
    pub granted_at: DateTime<Utc>,
}

impl Grant {
    /// Creates a new grant record.
    #[must_use]
    pub fn new(
        principal: Principal,
        expiration: Option<DateTime<Utc>>,
        origin: Option<String>,
        granted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            principal,
            expiration,
            origin,
            renewal_count: 0,
            granted_at,
        }
    }

    /// Returns `true` if the grant has a present expiration at or before
    /// `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|e| e <= now)
    }
}

/// Merges an existing expiration with a newly-requested candidate.
///
/// Favors the shorter privilege window: `min` when both are present, the
/// present one when exactly one is present, `None` only when both are
/// absent.
#[must_use]
pub fn merge_expiration(
    current: Option<DateTime<Utc>>,
    candidate: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// The in-memory grant ledger: at most one grant per principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSet {
    grants: HashMap<Principal, Grant>,
}

impl GrantSet {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a grant, merging with any existing grant for the same
    /// principal per the merge invariant.
    ///
    /// Returns a reference to the stored grant.
    pub fn add_or_merge(
        &mut self,
        principal: Principal,
        expiration: Option<DateTime<Utc>>,
        origin: Option<String>,
        now: DateTime<Utc>,
    ) -> &Grant {
        match self.grants.entry(principal.clone()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let grant = entry.get_mut();
                grant.expiration = merge_expiration(grant.expiration, expiration);
                grant.renewal_count += 1;
                if origin.is_some() {
                    grant.origin = origin;
                }
                entry.into_mut()
            },
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Grant::new(principal, expiration, origin, now))
            },
        }
    }

    /// Inserts a fully-formed grant record, replacing any existing grant
    /// for the same principal.
    ///
    /// Used when rebuilding the ledger from persisted records, where the
    /// stored fields (including `renewal_count`) are authoritative; request
    /// paths go through [`GrantSet::add_or_merge`].
    pub fn insert(&mut self, grant: Grant) {
        self.grants.insert(grant.principal.clone(), grant);
    }

    /// Removes a grant. Removing an absent principal is a no-op.
    ///
    /// Returns the removed grant, if any.
    pub fn remove(&mut self, principal: &Principal) -> Option<Grant> {
        self.grants.remove(principal)
    }

    /// Returns `true` if the principal holds a grant.
    #[must_use]
    pub fn contains(&self, principal: &Principal) -> bool {
        self.grants.contains_key(principal)
    }

    /// Returns the grant for a principal, if present.
    #[must_use]
    pub fn get(&self, principal: &Principal) -> Option<&Grant> {
        self.grants.get(principal)
    }

    /// Returns the expiration for a principal's grant.
    ///
    /// `None` either means no grant or a non-expiring grant; use
    /// [`GrantSet::contains`] to distinguish.
    #[must_use]
    pub fn get_expiration(&self, principal: &Principal) -> Option<DateTime<Utc>> {
        self.grants.get(principal).and_then(|g| g.expiration)
    }

    /// Returns every granted principal, in no particular order.
    #[must_use]
    pub fn all_principals(&self) -> Vec<Principal> {
        self.grants.keys().cloned().collect()
    }

    /// Returns the principals whose expiration is present and `<= now`.
    #[must_use]
    pub fn expired_principals(&self, now: DateTime<Utc>) -> Vec<Principal> {
        self.grants
            .values()
            .filter(|g| g.is_expired_at(now))
            .map(|g| g.principal.clone())
            .collect()
    }

    /// Iterates over all grants.
    pub fn iter(&self) -> impl Iterator<Item = &Grant> {
        self.grants.values()
    }

    /// Returns the number of outstanding grants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// Returns `true` if no grants are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
