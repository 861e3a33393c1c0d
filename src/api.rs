// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
use std::fmt::{self, Debug, Display, Formatter};
use std::pin::Pin;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::acl::Identity;
pub use crate::error::ApiError;

/// Content stream returned by [`FsApi::open`]. Dropping it closes the file.
pub type FsReader = Pin<Box<dyn AsyncRead + Send>>;

/// Content sink returned by [`FsApi::create`]. Data is committed on shutdown.
pub type FsWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Trait that defines the interface for interaction with the filesystem client.
///
/// Paths are normalized absolute paths (`/`, `/a/b`). Calls that report a
/// `bool` follow the convention of the native client: `false` means the
/// operation was refused without an I/O failure.
#[async_trait]
pub trait FsApi: Send + Sync + Debug {
    /// Check whether a path exists.
    async fn exists(&self, path: &str) -> Result<bool, ApiError>;

    /// Fetch the metadata of a path.
    async fn stat(&self, path: &str) -> Result<FsStatus, ApiError>;

    /// List a directory. Listing a file yields the file itself.
    async fn ls(&self, path: &str) -> Result<Vec<FsStatus>, ApiError>;

    /// Open a file for reading.
    async fn open(&self, path: &str) -> Result<FsReader, ApiError>;

    /// Create or truncate a file for writing, creating missing parents.
    async fn create(&self, path: &str) -> Result<FsWriter, ApiError>;

    /// Create an empty file. Returns `false` if it already exists.
    async fn create_new_file(&self, path: &str) -> Result<bool, ApiError>;

    /// Make a directory and all missing parents. Returns `true` if the
    /// directory exists afterwards.
    async fn mkdirs(&self, path: &str) -> Result<bool, ApiError>;

    /// Delete a path. Returns `false` if nothing was removed.
    async fn delete(&self, path: &str, recursive: bool) -> Result<bool, ApiError>;

    /// Rename a path atomically.
    async fn rename(&self, path: &str, dest: &str) -> Result<(), ApiError>;

    /// Copy a path, descending into directories.
    async fn copy(&self, path: &str, dest: &str) -> Result<(), ApiError>;

    /// A client of the same filesystem acting as `identity`, so that the
    /// filesystem enforces its permissions for that user. `None` when the
    /// backend has no notion of users and serves everyone as one principal.
    fn for_identity(&self, _identity: &Identity) -> Option<Box<dyn FsApi>> {
        None
    }
}

/// Metadata of a filesystem entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsStatus {
    /// Absolute path of the entity.
    pub path: String,

    /// Size in bytes (zero for directories).
    pub len: u64,

    /// Whether the entity is a directory.
    pub is_dir: bool,

    /// Time of last modification.
    pub modification_time: SystemTime,

    pub owner: String,

    pub group: String,

    pub permission: FsPermission,
}

/// Access bits of one permission tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsAction(u8);

impl FsAction {
    pub const NONE: FsAction = FsAction(0);
    pub const EXECUTE: FsAction = FsAction(0o1);
    pub const WRITE: FsAction = FsAction(0o2);
    pub const READ: FsAction = FsAction(0o4);
    pub const READ_WRITE: FsAction = FsAction(0o6);
    pub const ALL: FsAction = FsAction(0o7);

    pub fn from_bits(bits: u8) -> Self {
        FsAction(bits & 0o7)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is granted by `self`.
    pub fn implies(self, other: FsAction) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Display for FsAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let flag = |action: FsAction, c: char| if self.implies(action) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(FsAction::READ, 'r'),
            flag(FsAction::WRITE, 'w'),
            flag(FsAction::EXECUTE, 'x')
        )
    }
}

/// Owner, group and other permission tiers, in the classic octal layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsPermission(u16);

impl FsPermission {
    pub const DEFAULT_DIR: FsPermission = FsPermission(0o755);
    pub const DEFAULT_FILE: FsPermission = FsPermission(0o644);

    pub fn from_mode(mode: u16) -> Self {
        FsPermission(mode & 0o777)
    }

    pub fn new(user: FsAction, group: FsAction, other: FsAction) -> Self {
        FsPermission(
            (user.bits() as u16) << 6 | (group.bits() as u16) << 3 | other.bits() as u16,
        )
    }

    pub fn mode(self) -> u16 {
        self.0
    }

    pub fn user_action(self) -> FsAction {
        FsAction::from_bits((self.0 >> 6) as u8)
    }

    pub fn group_action(self) -> FsAction {
        FsAction::from_bits((self.0 >> 3) as u8)
    }

    pub fn other_action(self) -> FsAction {
        FsAction::from_bits(self.0 as u8)
    }
}

impl Display for FsPermission {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.user_action(), self.group_action(), self.other_action())
    }
}

#[inline]
pub(crate) fn concat_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent of an absolute path, `None` for the root.
#[inline]
pub(crate) fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Final segment of an absolute path, empty for the root.
#[inline]
pub(crate) fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_tiers() {
        let perm = FsPermission::from_mode(0o640);
        assert_eq!(perm.user_action(), FsAction::READ_WRITE);
        assert_eq!(perm.group_action(), FsAction::READ);
        assert_eq!(perm.other_action(), FsAction::NONE);
        assert_eq!(perm.to_string(), "rw-r-----");
        assert_eq!(
            FsPermission::new(FsAction::ALL, FsAction::READ, FsAction::EXECUTE).mode(),
            0o741
        );
    }

    #[test]
    fn implies() {
        assert!(FsAction::ALL.implies(FsAction::READ_WRITE));
        assert!(FsAction::READ.implies(FsAction::NONE));
        assert!(!FsAction::READ.implies(FsAction::WRITE));
    }

    #[test]
    fn path_helpers() {
        assert_eq!(concat_path("/", "a"), "/a");
        assert_eq!(concat_path("/a", "b"), "/a/b");
        assert_eq!(parent_path("/"), None);
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(file_name("/a/b"), "b");
        assert_eq!(file_name("/"), "");
    }
}
