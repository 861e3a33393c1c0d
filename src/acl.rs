// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//

//! Translation of filesystem permission bits into WebDAV privileges.

use std::fmt::{self, Display, Formatter};

use crate::api::{FsAction, FsStatus};

/// The requesting user, as resolved by the front door.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub user: String,
    pub groups: Vec<String>,
}

impl Identity {
    pub fn new<U, G, S>(user: U, groups: G) -> Self
    where
        U: Into<String>,
        G: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Identity {
            user: user.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Access right granted to the requesting identity on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Privilege {
    Read,
    Write,
}

impl Privilege {
    /// Element name in the `DAV:` namespace.
    pub fn name(self) -> &'static str {
        match self {
            Privilege::Read => "read",
            Privilege::Write => "write",
        }
    }
}

impl Display for Privilege {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Computes the privileges `identity` holds on the entity described by `status`.
///
/// Exactly one tier applies: the owner tier if the user owns the entity,
/// otherwise the group tier if the user belongs to the entity's group,
/// otherwise the other tier. Tiers are never combined.
pub fn privileges(status: &FsStatus, identity: &Identity) -> Vec<Privilege> {
    let action = if identity.user == status.owner {
        status.permission.user_action()
    } else if identity.is_member_of(&status.group) {
        status.permission.group_action()
    } else {
        status.permission.other_action()
    };
    extract_privileges(action)
}

fn extract_privileges(action: FsAction) -> Vec<Privilege> {
    let mut list = Vec::with_capacity(2);
    if action.implies(FsAction::READ) {
        list.push(Privilege::Read);
    }
    if action.implies(FsAction::WRITE) {
        list.push(Privilege::Write);
    }
    list
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::api::FsPermission;

    fn status(mode: u16) -> FsStatus {
        FsStatus {
            path: "/data/report.csv".to_string(),
            len: 12,
            is_dir: false,
            modification_time: SystemTime::UNIX_EPOCH,
            owner: "alice".to_string(),
            group: "analysts".to_string(),
            permission: FsPermission::from_mode(mode),
        }
    }

    #[test]
    fn one_tier_per_requester() {
        let st = status(0o640);
        let owner = Identity::new("alice", Vec::<String>::new());
        let member = Identity::new("bob", ["analysts"]);
        let stranger = Identity::new("carol", ["staff"]);

        assert_eq!(privileges(&st, &owner), vec![Privilege::Read, Privilege::Write]);
        assert_eq!(privileges(&st, &member), vec![Privilege::Read]);
        assert!(privileges(&st, &stranger).is_empty());
    }

    #[test]
    fn owner_tier_wins_even_when_group_is_broader() {
        let st = status(0o076);
        let owner_in_group = Identity::new("alice", ["analysts"]);
        assert!(privileges(&st, &owner_in_group).is_empty());
    }

    #[test]
    fn group_tier_wins_over_other() {
        let st = status(0o606);
        let member = Identity::new("bob", ["analysts"]);
        assert!(privileges(&st, &member).is_empty());
        let stranger = Identity::new("dave", Vec::<String>::new());
        assert_eq!(privileges(&st, &stranger), vec![Privilege::Read, Privilege::Write]);
    }

    #[test]
    fn write_only() {
        let st = status(0o200);
        let owner = Identity::new("alice", Vec::<String>::new());
        assert_eq!(privileges(&st, &owner), vec![Privilege::Write]);
    }
}
