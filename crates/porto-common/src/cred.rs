//! Credentials: uid/gid pairs and the permission rules built on them.

use nix::unistd::{Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PortoError, PortoResult};

/// Group whose members get read-write access to the API socket.
pub const PORTO_GROUP: &str = "porto";

/// Group whose members may control containers owned by anyone.
pub const PORTO_CONT_GROUP: &str = "porto-containers";

/// Owner credentials of a container or volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cred {
    /// Numeric user id.
    pub uid: u32,
    /// Numeric primary group id.
    pub gid: u32,
    /// Supplementary group ids, resolved at load time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grps: Vec<u32>,
}

impl Cred {
    /// Credentials of uid/gid without supplementary groups.
    #[must_use]
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            grps: Vec::new(),
        }
    }

    /// Root credentials.
    #[must_use]
    pub fn root() -> Self {
        Self::new(0, 0)
    }

    /// Credentials of the calling process.
    #[must_use]
    pub fn current() -> Self {
        let grps = nix::unistd::getgroups()
            .map(|gs| gs.into_iter().map(Gid::as_raw).collect())
            .unwrap_or_default();
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            grps,
        }
    }

    /// Resolve a user name to credentials, including supplementary groups.
    pub fn from_user(name: &str) -> PortoResult<Self> {
        let user = User::from_name(name)
            .map_err(PortoError::from)?
            .ok_or_else(|| PortoError::InvalidValue {
                message: format!("unknown user: {name}"),
            })?;
        let mut cred = Self::new(user.uid.as_raw(), user.gid.as_raw());
        cred.grps = supplementary_groups(&user.name, user.gid);
        Ok(cred)
    }

    /// Resolve a group name to its gid.
    pub fn lookup_gid(name: &str) -> PortoResult<u32> {
        let group = Group::from_name(name)
            .map_err(PortoError::from)?
            .ok_or_else(|| PortoError::InvalidValue {
                message: format!("unknown group: {name}"),
            })?;
        Ok(group.gid.as_raw())
    }

    /// User name for the uid, falling back to the numeric form.
    #[must_use]
    pub fn user_name(&self) -> String {
        User::from_uid(Uid::from_raw(self.uid))
            .ok()
            .flatten()
            .map_or_else(|| self.uid.to_string(), |u| u.name)
    }

    /// Group name for the gid, falling back to the numeric form.
    #[must_use]
    pub fn group_name(&self) -> String {
        Group::from_gid(Gid::from_raw(self.gid))
            .ok()
            .flatten()
            .map_or_else(|| self.gid.to_string(), |g| g.name)
    }

    /// Whether this credential is root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Whether the credential carries the given group, primary or
    /// supplementary.
    #[must_use]
    pub fn is_member_of(&self, gid: u32) -> bool {
        self.gid == gid || self.grps.contains(&gid)
    }

    /// Whether the credential belongs to a group resolved by name.
    #[must_use]
    pub fn is_member_of_group(&self, name: &str) -> bool {
        Self::lookup_gid(name).is_ok_and(|gid| self.is_member_of(gid))
    }

    /// Whether this credential may control an entity owned by `owner`.
    ///
    /// Root controls everything; otherwise the owner must match, or the
    /// caller must belong to `porto-containers` or to the owner's personal
    /// `<user>-containers` group.
    #[must_use]
    pub fn can_control(&self, owner: &Cred) -> bool {
        if self.is_root() || self.uid == owner.uid {
            return true;
        }
        if self.is_member_of_group(PORTO_CONT_GROUP) {
            return true;
        }
        let personal = format!("{}-containers", owner.user_name());
        self.is_member_of_group(&personal)
    }
}

impl fmt::Display for Cred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

fn supplementary_groups(user: &str, primary: Gid) -> Vec<u32> {
    match std::ffi::CString::new(user) {
        Ok(name) => nix::unistd::getgrouplist(&name, primary)
            .map(|gs| gs.into_iter().map(Gid::as_raw).collect())
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_controls_everything() {
        let root = Cred::root();
        let user = Cred::new(1000, 1000);
        assert!(root.can_control(&user));
        assert!(root.is_root());
    }

    #[test]
    fn same_uid_controls() {
        let a = Cred::new(1000, 1000);
        let b = Cred::new(1000, 2000);
        assert!(a.can_control(&b));
    }

    #[test]
    fn membership_checks_supplementary_groups() {
        let mut cred = Cred::new(1000, 1000);
        assert!(!cred.is_member_of(42));
        cred.grps.push(42);
        assert!(cred.is_member_of(42));
        assert!(cred.is_member_of(1000));
    }

    #[test]
    fn display_is_numeric() {
        assert_eq!(Cred::new(3, 4).to_string(), "3:4");
    }
}
