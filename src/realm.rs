// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//

//! User database in the hash-realm properties format:
//!
//! ```text
//! # user: password[, group ...]
//! alice: secret, staff, admin
//! bob = hunter2
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::acl::Identity;
use crate::error::ConfigError;

#[derive(Debug, Clone)]
struct RealmUser {
    password: String,
    groups: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UserRealm {
    users: HashMap<String, RealmUser>,
}

impl UserRealm {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut users = HashMap::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let malformed = || ConfigError::RealmEntry {
                line: n + 1,
                text: line.to_string(),
            };
            let (user, credentials) = line.split_once([':', '=']).ok_or_else(malformed)?;
            let user = user.trim();
            let mut fields = credentials.split(',').map(str::trim);
            let password = fields.next().unwrap_or_default();
            if user.is_empty() || password.is_empty() {
                return Err(malformed());
            }
            let groups = fields.filter(|g| !g.is_empty()).map(str::to_string).collect();
            users.insert(
                user.to_string(),
                RealmUser {
                    password: password.to_string(),
                    groups,
                },
            );
        }
        debug!("realm loaded with {} users", users.len());
        Ok(UserRealm { users })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        UserRealm::parse(&text)
    }

    /// Identity of `user` if `password` matches.
    pub fn authenticate(&self, user: &str, password: &str) -> Option<Identity> {
        match self.users.get(user) {
            Some(entry) if entry.password == password => {
                Some(Identity::new(user, entry.groups.iter().cloned()))
            }
            Some(_) => {
                debug!("wrong password for {}", user);
                None
            }
            None => {
                debug!("unknown user {}", user);
                None
            }
        }
    }

    pub fn user_groups(&self, user: &str) -> Option<&[String]> {
        self.users.get(user).map(|entry| entry.groups.as_slice())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const REALM: &str = "\
# gateway users
alice: secret, staff, admin
bob = hunter2
! legacy comment

carol:pw,
";

    #[test]
    fn parses_entries() {
        let realm = UserRealm::parse(REALM).unwrap();
        assert_eq!(realm.len(), 3);
        assert_eq!(
            realm.user_groups("alice"),
            Some(&["staff".to_string(), "admin".to_string()][..])
        );
        assert_eq!(realm.user_groups("bob"), Some(&[][..]));
        assert_eq!(realm.user_groups("carol"), Some(&[][..]));
        assert!(realm.user_groups("dave").is_none());
    }

    #[test]
    fn authenticates() {
        let realm = UserRealm::parse(REALM).unwrap();
        let alice = realm.authenticate("alice", "secret").unwrap();
        assert_eq!(alice, Identity::new("alice", ["staff", "admin"]));
        assert!(realm.authenticate("alice", "wrong").is_none());
        assert!(realm.authenticate("nobody", "secret").is_none());
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            UserRealm::parse("alice: pw\njust-a-name\n"),
            Err(ConfigError::RealmEntry { line: 2, .. })
        ));
        assert!(UserRealm::parse("alice:\n").is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alice: secret, staff").unwrap();
        let realm = UserRealm::load(file.path()).unwrap();
        assert!(realm.authenticate("alice", "secret").is_some());

        assert!(matches!(
            UserRealm::load("/definitely/not/here.properties"),
            Err(ConfigError::Read { .. })
        ));
    }
}
