//! Production providers for the OS seams on Linux.
//!
//! These are deliberately thin shells over the standard tooling: group
//! membership goes through `gpasswd` and `getent group`, identity through
//! `getent passwd` and `id`, sessions through `loginctl`. Nothing here
//! holds state; correctness lives in the core, which is tested against
//! `MemoryDirectory`.

use std::process::Command;

use elevd_core::directory::{
    DirectoryError, GroupControl, IdentityDirectory, SessionDirectory,
};
use elevd_core::principal::{Principal, SessionId};
use tracing::debug;

/// Runs a command, mapping a non-zero exit to [`DirectoryError::Os`].
fn run_checked(cmd: &mut Command) -> Result<std::process::Output, DirectoryError> {
    let output = cmd.output()?;
    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        debug!(
            command = ?cmd.get_program(),
            code,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "platform command failed"
        );
        return Err(DirectoryError::Os { code });
    }
    Ok(output)
}

/// Group membership via `gpasswd` / `getent group`.
///
/// Principals are POSIX login names; `gpasswd` is idempotent for both add
/// and delete on current shadow-utils, matching the seam contract.
pub struct PosixGroupControl;

impl GroupControl for PosixGroupControl {
    fn add_member(&self, group: &str, principal: &Principal) -> Result<(), DirectoryError> {
        run_checked(
            Command::new("gpasswd")
                .arg("--add")
                .arg(principal.as_str())
                .arg(group),
        )?;
        Ok(())
    }

    fn remove_member(&self, group: &str, principal: &Principal) -> Result<(), DirectoryError> {
        match run_checked(
            Command::new("gpasswd")
                .arg("--delete")
                .arg(principal.as_str())
                .arg(group),
        ) {
            Ok(_) => Ok(()),
            // gpasswd exits 3 when the user is not a member; the seam
            // contract makes removal of an absent member a success.
            Err(DirectoryError::Os { code: 3 }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn list_members(&self, group: &str) -> Result<Vec<Principal>, DirectoryError> {
        let output = match run_checked(Command::new("getent").arg("group").arg(group)) {
            Ok(output) => output,
            // getent exits 2 when the key is unknown.
            Err(DirectoryError::Os { code: 2 }) => {
                return Err(DirectoryError::UnknownGroup {
                    group: group.to_string(),
                });
            },
            Err(e) => return Err(e),
        };

        let line = String::from_utf8_lossy(&output.stdout);
        Ok(parse_group_members(&line))
    }
}

/// Parses the member list out of a `getent group` line
/// (`name:passwd:gid:member,member,...`).
fn parse_group_members(line: &str) -> Vec<Principal> {
    line.trim()
        .rsplit(':')
        .next()
        .unwrap_or("")
        .split(',')
        .filter(|m| !m.is_empty())
        .map(Principal::from)
        .collect()
}

/// Identity resolution via `getent passwd` / `id -Gn`.
pub struct PosixIdentity;

impl IdentityDirectory for PosixIdentity {
    fn display_name(&self, principal: &Principal) -> Option<String> {
        let output = run_checked(
            Command::new("getent")
                .arg("passwd")
                .arg(principal.as_str()),
        )
        .ok()?;

        let line = String::from_utf8_lossy(&output.stdout);
        parse_display_name(&line)
    }

    fn memberships(&self, principal: &Principal) -> Result<Vec<Principal>, DirectoryError> {
        let output = match run_checked(Command::new("id").arg("-Gn").arg(principal.as_str())) {
            Ok(output) => output,
            Err(DirectoryError::Os { code: 1 }) => {
                return Err(DirectoryError::UnknownPrincipal {
                    principal: principal.clone(),
                });
            },
            Err(e) => return Err(e),
        };

        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(Principal::from)
            .collect())
    }
}

/// Extracts a human-readable name from a `getent passwd` line: the first
/// GECOS segment when present, otherwise the login name.
fn parse_display_name(line: &str) -> Option<String> {
    let fields: Vec<&str> = line.trim().split(':').collect();
    let login = *fields.first()?;
    let gecos = fields
        .get(4)
        .and_then(|g| g.split(',').next())
        .unwrap_or("")
        .trim();

    if gecos.is_empty() {
        Some(login.to_string())
    } else {
        Some(gecos.to_string())
    }
}

/// Session enumeration via `loginctl`.
pub struct LoginctlSessions;

impl SessionDirectory for LoginctlSessions {
    fn list_sessions(&self) -> Result<Vec<SessionId>, DirectoryError> {
        let output = run_checked(
            Command::new("loginctl")
                .arg("list-sessions")
                .arg("--no-legend"),
        )?;

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(SessionId::from)
            .collect())
    }

    fn principal_for_session(&self, session: &SessionId) -> Option<Principal> {
        let output = run_checked(
            Command::new("loginctl")
                .arg("show-session")
                .arg(session.as_str())
                .arg("--property=Name")
                .arg("--value"),
        )
        .ok()?;

        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if name.is_empty() {
            None
        } else {
            Some(Principal::from(name))
        }
    }
}
