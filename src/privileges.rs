//! Privilege reduction (grounded on
//! `examples/original_source/privileges.c`).
//!
//! Run as root so it can read another user's socket ownership over the
//! diagnostic netlink socket, the daemon drops every privilege it does not
//! need for that one operation, in this order: resolve the target uid/gid,
//! mark `CAP_NET_ADMIN` to survive the uid/gid change, switch uid/gid, raise
//! `CAP_NET_ADMIN` into the effective and inheritable sets, then drop the
//! bounding set down to just that capability. `CAP_NET_ADMIN` stays
//! inheritable (rather than being dropped once the netlink lookup is done,
//! as the original can afford to do per-request) because the `conntrack`
//! child process inherits capabilities only from the parent's inheritable
//! set intersected with its own file capabilities, and forwarding a query
//! may need to run `conntrack` after the netlink step.

use std::process::Command;

use caps::{CapSet, Capability, CapsHashSet};
use nix::unistd::{self, Gid, Group, Uid, User};

use crate::error::Error;

/// Resolved target identity for the post-drop process.
pub struct Identity {
    pub uid: Uid,
    pub gid: Gid,
}

/// Look up the user/group to drop into. `user`/`group` may each be a name
/// or a decimal id; absent, they default to the `identd` user/group,
/// falling back to `nobody`/`nogroup` as the original does.
pub fn resolve_identity(user: Option<&str>, group: Option<&str>) -> Result<Identity, Error> {
    let uid = match user {
        Some(spec) => lookup_user(spec)?,
        None => lookup_user("identd")
            .or_else(|_| lookup_user("nobody"))
            .map_err(|_| Error::Privilege("no identd or nobody user found".into()))?,
    };

    let gid = match group {
        Some(spec) => lookup_group(spec)?,
        None => lookup_group("identd")
            .or_else(|_| lookup_group("nogroup"))
            .or_else(|_| lookup_group("nobody"))
            .map_err(|_| Error::Privilege("no identd or nogroup group found".into()))?,
    };

    Ok(Identity { uid, gid })
}

fn lookup_user(spec: &str) -> Result<Uid, Error> {
    if let Ok(raw) = spec.parse::<u32>() {
        return Ok(Uid::from_raw(raw));
    }
    User::from_name(spec)
        .map_err(|e| Error::Privilege(format!("user lookup failed: {e}")))?
        .map(|u| u.uid)
        .ok_or_else(|| Error::Privilege(format!("no such user: {spec}")))
}

fn lookup_group(spec: &str) -> Result<Gid, Error> {
    if let Ok(raw) = spec.parse::<u32>() {
        return Ok(Gid::from_raw(raw));
    }
    Group::from_name(spec)
        .map_err(|e| Error::Privilege(format!("group lookup failed: {e}")))?
        .map(|g| g.gid)
        .ok_or_else(|| Error::Privilege(format!("no such group: {spec}")))
}

/// Run the full reduction sequence, or do nothing at all if
/// `keep_privileges` is set. `need_admin` should be the caller's forwarding
/// mode: `CAP_NET_ADMIN` is only worth retaining when the NAT resolver (and
/// thus `conntrack`) will actually run.
pub fn minimal_privileges(identity: &Identity, keep_privileges: bool, need_admin: bool) -> Result<(), Error> {
    if keep_privileges {
        log::debug!("keeping privileges unchanged at caller's request");
        return Ok(());
    }

    let needed = needed_capabilities(need_admin);

    // Nothing to switch to: either we're already the target identity, or
    // the caller explicitly asked to stay uid/gid 0. File capabilities
    // (handled separately by the caller) are the only adjustment left.
    if (identity.uid == unistd::geteuid() && identity.gid == unistd::getegid())
        || (identity.uid.is_root() && identity.gid.as_raw() == 0)
    {
        log::debug!("target identity matches the current one; skipping uid/gid switch");
        return Ok(());
    }

    retain_capabilities()?;

    unistd::setresgid(identity.gid, identity.gid, identity.gid)
        .map_err(|e| Error::Privilege(format!("setresgid failed: {e}")))?;
    unistd::setresuid(identity.uid, identity.uid, identity.uid)
        .map_err(|e| Error::Privilege(format!("setresuid failed: {e}")))?;

    inheritable_capabilities(&needed)?;
    discard_capabilities(&needed)?;

    Ok(())
}

/// The capability set this process should retain past the uid/gid switch:
/// just `CAP_NET_ADMIN`, and only when the NAT path will be exercised;
/// empty otherwise.
fn needed_capabilities(need_admin: bool) -> CapsHashSet {
    let mut needed = CapsHashSet::new();
    if need_admin {
        needed.insert(Capability::CAP_NET_ADMIN);
    }
    needed
}

/// Keep capabilities across the uid/gid change (equivalent of the
/// original's `PR_SET_KEEPCAPS`).
fn retain_capabilities() -> Result<(), Error> {
    nix::sys::prctl::set_keepcaps(true)
        .map_err(|e| Error::Privilege(format!("prctl(PR_SET_KEEPCAPS) failed: {e}")))
}

/// After the uid/gid switch, the permitted set survived but effective and
/// inheritable were cleared by the kernel; put `needed` back in both. A
/// no-op if `needed` is empty, or if it's already held in both sets.
fn inheritable_capabilities(needed: &CapsHashSet) -> Result<(), Error> {
    if needed.is_empty() || already_holds(CapSet::Effective, needed) && already_holds(CapSet::Inheritable, needed) {
        return Ok(());
    }
    caps::set(None, CapSet::Effective, needed)
        .map_err(|e| Error::Privilege(format!("raising effective caps failed: {e}")))?;
    caps::set(None, CapSet::Inheritable, needed)
        .map_err(|e| Error::Privilege(format!("raising inheritable caps failed: {e}")))?;
    Ok(())
}

/// Shrink the bounding set to exactly `needed` so a later exec (the
/// conntrack child) cannot regain anything else.
fn discard_capabilities(needed: &CapsHashSet) -> Result<(), Error> {
    caps::set(None, CapSet::Permitted, needed)
        .map_err(|e| Error::Privilege(format!("shrinking permitted caps failed: {e}")))?;

    for cap in caps::all() {
        if !needed.contains(&cap) {
            let _ = caps::drop(None, CapSet::Bounding, cap);
        }
    }
    Ok(())
}

/// Whether `set` already carries everything in `wanted` (the §4.2
/// pre-flight check: skip the promotion step if there's nothing to add).
fn already_holds(set: CapSet, wanted: &CapsHashSet) -> bool {
    match caps::read(None, set) {
        Ok(have) => wanted.is_subset(&have),
        Err(_) => false,
    }
}

/// Mark `CAP_NET_ADMIN` inheritable on the conntrack binary so our
/// inheritable set can hand it across the coming `execve`. The `caps`
/// crate only manipulates process capability sets, not file capabilities
/// (there is no safe binding for `cap_set_file`/`initcap` xattrs in the
/// registry), so this shells out to `setcap(8)` the same way an
/// administrator would by hand; it is idempotent and only needs to run
/// once per binary, not once per query.
pub fn set_file_capabilities(conntrack_path: &str) -> Result<(), Error> {
    let status = Command::new("setcap")
        .arg("cap_net_admin+ei")
        .arg(conntrack_path)
        .status()
        .map_err(|e| Error::Privilege(format!("could not run setcap: {e}")))?;

    if !status.success() {
        return Err(Error::Privilege(format!(
            "setcap exited with status {status}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_user_spec_is_used_directly() {
        assert_eq!(lookup_user("1000").unwrap(), Uid::from_raw(1000));
    }

    #[test]
    fn numeric_group_spec_is_used_directly() {
        assert_eq!(lookup_group("1000").unwrap(), Gid::from_raw(1000));
    }

    #[test]
    fn skips_the_switch_when_the_target_identity_matches_the_current_one() {
        let identity = Identity {
            uid: unistd::geteuid(),
            gid: unistd::getegid(),
        };
        // Must not attempt setresuid/setresgid (which would fail for a
        // non-root test process) and must not error.
        assert!(minimal_privileges(&identity, false, false).is_ok());
    }
}
