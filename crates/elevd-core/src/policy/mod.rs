//! Allow/deny policy evaluation.
//!
//! Policy entries may be authored either as stable principal identifiers or
//! as resolved account names, so every check matches both forms, for the
//! requesting principal itself and for each of its group memberships.
//!
//! Evaluation order is deny-wins:
//! 1. A non-empty deny list that matches the subject refuses immediately.
//! 2. An absent allow list is an open policy (everyone passes).
//! 3. A present-but-empty allow list is a closed policy (no one passes).
//! 4. Otherwise the subject must match an allow entry.
//!
//! Remote-origin requests must pass the check twice: once against the local
//! lists and once against the remote lists.

use tracing::debug;

use crate::config::PolicyConfig;
use crate::principal::Principal;

/// Everything policy evaluation needs to know about a requesting principal.
///
/// Built by the caller from the identity directory so evaluation itself is
/// pure and deterministic.
#[derive(Debug, Clone)]
pub struct PolicySubject {
    /// Stable identifier of the principal.
    pub principal: Principal,
    /// Resolved account name, when the directory could resolve one.
    pub display_name: Option<String>,
    /// Stable identifiers of the principal's effective group memberships.
    pub membership_ids: Vec<Principal>,
    /// Resolved names of those memberships.
    pub membership_names: Vec<String>,
}

impl PolicySubject {
    /// Creates a subject with no resolved names or memberships.
    #[must_use]
    pub fn bare(principal: Principal) -> Self {
        Self {
            principal,
            display_name: None,
            membership_ids: Vec::new(),
            membership_names: Vec::new(),
        }
    }

    /// Returns `true` if `entry` matches this subject: its identifier, its
    /// account name, or any membership by identifier or name.
    ///
    /// Identifier comparison is exact; name comparison is ASCII
    /// case-insensitive (account names are not case-sensitive on the
    /// platforms that produce them).
    #[must_use]
    pub fn matches(&self, entry: &str) -> bool {
        if entry == self.principal.as_str() {
            return true;
        }
        if let Some(name) = &self.display_name {
            if entry.eq_ignore_ascii_case(name) {
                return true;
            }
        }
        if self.membership_ids.iter().any(|m| entry == m.as_str()) {
            return true;
        }
        self.membership_names
            .iter()
            .any(|n| entry.eq_ignore_ascii_case(n))
    }

    fn matches_any(&self, list: &[String]) -> bool {
        list.iter().any(|entry| self.matches(entry))
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzDecision {
    /// The request passed every applicable check.
    Allowed,
    /// Refused by the local allow/deny lists.
    DeniedLocal,
    /// Passed the local check but refused by the remote lists.
    DeniedRemote,
}

impl AuthzDecision {
    /// Returns `true` for [`AuthzDecision::Allowed`].
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Evaluates one allow/deny list pair against a subject.
///
/// Deny takes precedence; see the module docs for the full ordering.
#[must_use]
pub fn is_authorized(subject: &PolicySubject, allow: Option<&[String]>, deny: &[String]) -> bool {
    if !deny.is_empty() && subject.matches_any(deny) {
        return false;
    }
    match allow {
        None => true,
        Some(entries) => !entries.is_empty() && subject.matches_any(entries),
    }
}

/// Authorizes a grant request, applying the remote lists additionally when
/// the request carries a remote origin.
#[must_use]
pub fn authorize_request(
    subject: &PolicySubject,
    origin: Option<&str>,
    policy: &PolicyConfig,
) -> AuthzDecision {
    if !is_authorized(
        subject,
        policy.local_allow.as_deref(),
        &policy.local_deny,
    ) {
        debug!(principal = %subject.principal, "denied by local policy");
        return AuthzDecision::DeniedLocal;
    }

    if origin.is_some()
        && !is_authorized(
            subject,
            policy.remote_allow.as_deref(),
            &policy.remote_deny,
        )
    {
        debug!(principal = %subject.principal, origin, "denied by remote policy");
        return AuthzDecision::DeniedRemote;
    }

    AuthzDecision::Allowed
}

/// Returns `true` if the subject currently qualifies for a non-expiring
/// automatic grant.
///
/// Automatic qualification has no open-policy case: an empty
/// `automatic_allow` list means no one qualifies. `automatic_deny` wins.
#[must_use]
pub fn qualifies_for_automatic(subject: &PolicySubject, policy: &PolicyConfig) -> bool {
    if !policy.automatic_deny.is_empty() && subject.matches_any(&policy.automatic_deny) {
        return false;
    }
    subject.matches_any(&policy.automatic_allow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> PolicySubject {
        PolicySubject {
            principal: Principal::from("uid-1000"),
            display_name: Some("alice".to_string()),
            membership_ids: vec![Principal::from("gid-100")],
            membership_names: vec!["developers".to_string()],
        }
    }

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn open_policy_allows_everyone() {
        assert!(is_authorized(&subject(), None, &[]));
    }

    #[test]
    fn closed_policy_allows_no_one() {
        assert!(!is_authorized(&subject(), Some(&[]), &[]));
    }

    #[test]
    fn allow_by_principal_id() {
        let allow = list(&["uid-1000"]);
        assert!(is_authorized(&subject(), Some(&allow), &[]));
    }

    #[test]
    fn allow_by_account_name_case_insensitive() {
        let allow = list(&["ALICE"]);
        assert!(is_authorized(&subject(), Some(&allow), &[]));
    }

    #[test]
    fn allow_by_group_membership() {
        let allow = list(&["developers"]);
        assert!(is_authorized(&subject(), Some(&allow), &[]));

        let allow = list(&["gid-100"]);
        assert!(is_authorized(&subject(), Some(&allow), &[]));
    }

    #[test]
    fn unlisted_subject_is_refused_by_allow_list() {
        let allow = list(&["operators", "uid-2000"]);
        assert!(!is_authorized(&subject(), Some(&allow), &[]));
    }

    #[test]
    fn deny_wins_over_allow() {
        let allow = list(&["uid-1000"]);
        let deny = list(&["uid-1000"]);
        assert!(!is_authorized(&subject(), Some(&allow), &deny));
    }

    #[test]
    fn deny_by_membership_wins_over_open_policy() {
        let deny = list(&["developers"]);
        assert!(!is_authorized(&subject(), None, &deny));
    }

    #[test]
    fn remote_request_must_pass_both_checks() {
        let policy = PolicyConfig {
            local_allow: Some(list(&["uid-1000"])),
            remote_allow: Some(list(&["operators"])),
            ..PolicyConfig::default()
        };

        // Local request: only the local lists apply.
        assert_eq!(
            authorize_request(&subject(), None, &policy),
            AuthzDecision::Allowed
        );

        // Remote request: local passes, remote refuses.
        assert_eq!(
            authorize_request(&subject(), Some("10.0.0.9"), &policy),
            AuthzDecision::DeniedRemote
        );
    }

    #[test]
    fn remote_denied_locally_reports_local() {
        let policy = PolicyConfig {
            local_deny: list(&["uid-1000"]),
            ..PolicyConfig::default()
        };
        assert_eq!(
            authorize_request(&subject(), Some("10.0.0.9"), &policy),
            AuthzDecision::DeniedLocal
        );
    }

    #[test]
    fn automatic_requires_explicit_listing() {
        let mut policy = PolicyConfig::default();
        assert!(!qualifies_for_automatic(&subject(), &policy));

        policy.automatic_allow = list(&["developers"]);
        assert!(qualifies_for_automatic(&subject(), &policy));

        policy.automatic_deny = list(&["uid-1000"]);
        assert!(!qualifies_for_automatic(&subject(), &policy));
    }
}
