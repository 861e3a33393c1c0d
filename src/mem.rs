// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//

//! In-process filesystem with owners, groups and permission bits.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWrite;

use crate::acl::{self, Identity, Privilege};
use crate::api::{concat_path, parent_path, ApiError, FsApi, FsPermission, FsReader, FsStatus, FsWriter};

/// Principal that bypasses permission checks.
pub const SUPERUSER: &str = "root";
pub const SUPERGROUP: &str = "supergroup";

type Tree = HashMap<String, MemEntry>;

#[derive(Debug, Clone)]
struct MemEntry {
    is_dir: bool,
    data: Vec<u8>,
    owner: String,
    group: String,
    permission: FsPermission,
    mtime: SystemTime,
}

impl MemEntry {
    fn status(&self, path: &str) -> FsStatus {
        FsStatus {
            path: path.to_string(),
            len: if self.is_dir { 0 } else { self.data.len() as u64 },
            is_dir: self.is_dir,
            modification_time: self.mtime,
            owner: self.owner.clone(),
            group: self.group.clone(),
            permission: self.permission,
        }
    }
}

/// Filesystem kept in memory, bound to the principal its client acts as.
///
/// Like a native filesystem client, every call is made on behalf of that
/// one principal and the permission bits are enforced for it: reading
/// needs read access to the entity, mutations need write access to the
/// parent directory. The superuser is never checked.
#[derive(Debug, Clone)]
pub struct MemApi {
    tree: Arc<RwLock<Tree>>,
    client: Option<Identity>,
}

impl MemApi {
    /// Creates an empty filesystem whose client acts as the superuser.
    pub fn new() -> Box<MemApi> {
        MemApi::with_client(None)
    }

    /// Creates an empty filesystem whose client acts as `user`.
    pub fn as_user<G, S>(user: &str, groups: G) -> Box<MemApi>
    where
        G: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MemApi::with_client(Some(Identity::new(user, groups)))
    }

    /// A view of the same tree whose client acts as `user`.
    pub fn bind_user<G, S>(&self, user: &str, groups: G) -> Box<MemApi>
    where
        G: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Box::new(MemApi {
            tree: self.tree.clone(),
            client: Some(Identity::new(user, groups)),
        })
    }

    fn with_client(client: Option<Identity>) -> Box<MemApi> {
        let mut tree = Tree::new();
        tree.insert(
            "/".to_string(),
            MemEntry {
                is_dir: true,
                data: Vec::new(),
                owner: SUPERUSER.to_string(),
                group: SUPERGROUP.to_string(),
                permission: FsPermission::from_mode(0o777),
                mtime: SystemTime::now(),
            },
        );
        Box::new(MemApi {
            tree: Arc::new(RwLock::new(tree)),
            client,
        })
    }

    /// Changes the owner and group of a path.
    pub fn set_owner(&self, path: &str, owner: &str, group: &str) -> Result<(), ApiError> {
        let tree = &mut *self.tree.write();
        let entry = tree
            .get_mut(path)
            .ok_or_else(|| ApiError::NotFound(path.to_string()))?;
        entry.owner = owner.to_string();
        entry.group = group.to_string();
        Ok(())
    }

    /// Changes the permission bits of a path.
    pub fn set_permission(&self, path: &str, permission: FsPermission) -> Result<(), ApiError> {
        let tree = &mut *self.tree.write();
        let entry = tree
            .get_mut(path)
            .ok_or_else(|| ApiError::NotFound(path.to_string()))?;
        entry.permission = permission;
        Ok(())
    }

    fn new_entry(&self, is_dir: bool) -> MemEntry {
        let (owner, group) = match &self.client {
            None => (SUPERUSER.to_string(), SUPERGROUP.to_string()),
            Some(client) => (
                client.user.clone(),
                client
                    .groups
                    .first()
                    .cloned()
                    .unwrap_or_else(|| client.user.clone()),
            ),
        };
        MemEntry {
            is_dir,
            data: Vec::new(),
            owner,
            group,
            permission: if is_dir {
                FsPermission::DEFAULT_DIR
            } else {
                FsPermission::DEFAULT_FILE
            },
            mtime: SystemTime::now(),
        }
    }

    fn check(&self, tree: &Tree, path: &str, privilege: Privilege) -> Result<(), ApiError> {
        let client = match &self.client {
            None => return Ok(()),
            Some(client) if client.user == SUPERUSER => return Ok(()),
            Some(client) => client,
        };
        let entry = tree
            .get(path)
            .ok_or_else(|| ApiError::NotFound(path.to_string()))?;
        if acl::privileges(&entry.status(path), client).contains(&privilege) {
            Ok(())
        } else {
            Err(ApiError::AccessDenied(format!(
                "{} lacks {} access to {}",
                client.user, privilege, path
            )))
        }
    }

    fn check_parent(&self, tree: &Tree, path: &str) -> Result<(), ApiError> {
        match parent_path(path) {
            None => Err(ApiError::InvalidPath(path.to_string())),
            Some(parent) => self.check(tree, parent, Privilege::Write),
        }
    }

    fn mkdirs_locked(&self, tree: &mut Tree, path: &str) -> Result<bool, ApiError> {
        let mut current = "/".to_string();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let child = concat_path(&current, segment);
            match tree.get(&child) {
                Some(entry) if entry.is_dir => {}
                Some(_) => return Ok(false),
                None => {
                    self.check(tree, &current, Privilege::Write)?;
                    tree.insert(child.clone(), self.new_entry(true));
                    touch(tree, &current);
                }
            }
            current = child;
        }
        Ok(true)
    }

    fn ensure_parent(&self, tree: &mut Tree, path: &str) -> Result<(), ApiError> {
        let parent = parent_path(path).ok_or_else(|| ApiError::InvalidPath(path.to_string()))?;
        if self.mkdirs_locked(tree, parent)? {
            Ok(())
        } else {
            Err(ApiError::InvalidPath(format!("{}: parent is not a directory", path)))
        }
    }
}

#[async_trait]
impl FsApi for MemApi {
    async fn exists(&self, path: &str) -> Result<bool, ApiError> {
        Ok(self.tree.read().contains_key(path))
    }

    async fn stat(&self, path: &str) -> Result<FsStatus, ApiError> {
        let tree = self.tree.read();
        tree.get(path)
            .map(|entry| entry.status(path))
            .ok_or_else(|| ApiError::NotFound(path.to_string()))
    }

    async fn ls(&self, path: &str) -> Result<Vec<FsStatus>, ApiError> {
        let tree = self.tree.read();
        let entry = tree
            .get(path)
            .ok_or_else(|| ApiError::NotFound(path.to_string()))?;
        if !entry.is_dir {
            return Ok(vec![entry.status(path)]);
        }
        self.check(&tree, path, Privilege::Read)?;
        let mut children: Vec<FsStatus> = tree
            .iter()
            .filter(|(k, _)| k.as_str() != path && parent_path(k) == Some(path))
            .map(|(k, e)| e.status(k))
            .collect();
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    async fn open(&self, path: &str) -> Result<FsReader, ApiError> {
        let tree = self.tree.read();
        let entry = tree
            .get(path)
            .ok_or_else(|| ApiError::NotFound(path.to_string()))?;
        if entry.is_dir {
            return Err(ApiError::IsDirectory(path.to_string()));
        }
        self.check(&tree, path, Privilege::Read)?;
        Ok(Box::pin(Cursor::new(entry.data.clone())))
    }

    async fn create(&self, path: &str) -> Result<FsWriter, ApiError> {
        {
            let tree = &mut *self.tree.write();
            self.ensure_parent(tree, path)?;
            let existing = tree.get(path).map(|entry| entry.is_dir);
            match existing {
                Some(true) => return Err(ApiError::IsDirectory(path.to_string())),
                Some(false) => {
                    self.check(tree, path, Privilege::Write)?;
                    if let Some(entry) = tree.get_mut(path) {
                        entry.data.clear();
                        entry.mtime = SystemTime::now();
                    }
                }
                None => {
                    self.check_parent(tree, path)?;
                    tree.insert(path.to_string(), self.new_entry(false));
                    touch_parent(tree, path);
                }
            }
        }
        Ok(Box::pin(MemWriter {
            tree: self.tree.clone(),
            path: path.to_string(),
        }))
    }

    async fn create_new_file(&self, path: &str) -> Result<bool, ApiError> {
        let tree = &mut *self.tree.write();
        if tree.contains_key(path) {
            return Ok(false);
        }
        let parent = parent_path(path).ok_or_else(|| ApiError::InvalidPath(path.to_string()))?;
        if !self.mkdirs_locked(tree, parent)? {
            return Ok(false);
        }
        self.check_parent(tree, path)?;
        tree.insert(path.to_string(), self.new_entry(false));
        touch_parent(tree, path);
        Ok(true)
    }

    async fn mkdirs(&self, path: &str) -> Result<bool, ApiError> {
        let tree = &mut *self.tree.write();
        self.mkdirs_locked(tree, path)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<bool, ApiError> {
        let tree = &mut *self.tree.write();
        if path == "/" {
            return Ok(false);
        }
        let is_dir = match tree.get(path) {
            None => return Ok(false),
            Some(entry) => entry.is_dir,
        };
        if is_dir && !recursive && tree.keys().any(|k| is_descendant(k, path)) {
            return Err(ApiError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("directory {} is not empty", path),
            )));
        }
        self.check_parent(tree, path)?;
        tree.retain(|k, _| k != path && !is_descendant(k, path));
        touch_parent(tree, path);
        Ok(true)
    }

    async fn rename(&self, path: &str, dest: &str) -> Result<(), ApiError> {
        let tree = &mut *self.tree.write();
        if path == "/" || dest == "/" || dest == path || is_descendant(dest, path) {
            return Err(ApiError::InvalidPath(format!("cannot rename {} to {}", path, dest)));
        }
        if !tree.contains_key(path) {
            return Err(ApiError::NotFound(path.to_string()));
        }
        if tree.contains_key(dest) {
            return Err(ApiError::AlreadyExists(dest.to_string()));
        }
        require_dir(tree, dest)?;
        self.check_parent(tree, path)?;
        self.check_parent(tree, dest)?;

        let moved: Vec<String> = tree
            .keys()
            .filter(|k| k.as_str() == path || is_descendant(k, path))
            .cloned()
            .collect();
        for key in moved {
            if let Some(entry) = tree.remove(&key) {
                tree.insert(format!("{}{}", dest, &key[path.len()..]), entry);
            }
        }
        touch_parent(tree, path);
        touch_parent(tree, dest);
        Ok(())
    }

    async fn copy(&self, path: &str, dest: &str) -> Result<(), ApiError> {
        let tree = &mut *self.tree.write();
        if dest == "/" || dest == path || is_descendant(dest, path) {
            return Err(ApiError::InvalidPath(format!("cannot copy {} to {}", path, dest)));
        }
        let source_is_dir = match tree.get(path) {
            None => return Err(ApiError::NotFound(path.to_string())),
            Some(entry) => entry.is_dir,
        };
        self.check(tree, path, Privilege::Read)?;
        require_dir(tree, dest)?;
        match tree.get(dest).map(|entry| entry.is_dir) {
            Some(dest_is_dir) if dest_is_dir || source_is_dir => {
                return Err(ApiError::AlreadyExists(dest.to_string()));
            }
            Some(_) => self.check(tree, dest, Privilege::Write)?,
            None => self.check_parent(tree, dest)?,
        }

        let now = SystemTime::now();
        let copies: Vec<(String, MemEntry)> = tree
            .iter()
            .filter(|(k, _)| k.as_str() == path || is_descendant(k, path))
            .map(|(k, entry)| {
                let mut copy = self.new_entry(entry.is_dir);
                copy.data = entry.data.clone();
                copy.permission = entry.permission;
                copy.mtime = now;
                (format!("{}{}", dest, &k[path.len()..]), copy)
            })
            .collect();
        tree.extend(copies);
        touch_parent(tree, dest);
        Ok(())
    }

    fn for_identity(&self, identity: &Identity) -> Option<Box<dyn FsApi>> {
        let api: Box<dyn FsApi> = self.bind_user(&identity.user, identity.groups.iter().cloned());
        Some(api)
    }
}

/// Sink that appends to a file of the tree as bytes arrive.
struct MemWriter {
    tree: Arc<RwLock<Tree>>,
    path: String,
}

impl AsyncWrite for MemWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let tree = &mut *self.tree.write();
        match tree.get_mut(&self.path) {
            Some(entry) if !entry.is_dir => {
                entry.data.extend_from_slice(buf);
                entry.mtime = SystemTime::now();
                Poll::Ready(Ok(buf.len()))
            }
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} was removed while writing", self.path),
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn require_dir(tree: &Tree, path: &str) -> Result<(), ApiError> {
    let parent = parent_path(path).ok_or_else(|| ApiError::InvalidPath(path.to_string()))?;
    match tree.get(parent) {
        Some(entry) if entry.is_dir => Ok(()),
        Some(_) => Err(ApiError::InvalidPath(format!("{} is not a directory", parent))),
        None => Err(ApiError::NotFound(parent.to_string())),
    }
}

#[inline]
fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path != "/";
    }
    path.len() > ancestor.len() && path.starts_with(ancestor) && path[ancestor.len()..].starts_with('/')
}

fn touch(tree: &mut Tree, path: &str) {
    if let Some(entry) = tree.get_mut(path) {
        entry.mtime = SystemTime::now();
    }
}

fn touch_parent(tree: &mut Tree, path: &str) {
    if let Some(parent) = parent_path(path) {
        touch(tree, parent);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn write(api: &MemApi, path: &str, data: &[u8]) {
        let mut out = api.create(path).await.unwrap();
        out.write_all(data).await.unwrap();
        out.shutdown().await.unwrap();
    }

    async fn read(api: &MemApi, path: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        api.open(path).await.unwrap().read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn create_makes_parents_and_truncates() {
        let api = MemApi::new();
        write(&api, "/a/b/c.txt", b"first version").await;
        assert!(api.stat("/a/b").await.unwrap().is_dir);
        write(&api, "/a/b/c.txt", b"second").await;
        assert_eq!(read(&api, "/a/b/c.txt").await, b"second");
        assert_eq!(api.stat("/a/b/c.txt").await.unwrap().len, 6);
    }

    #[tokio::test]
    async fn ls_is_sorted_and_direct_only() {
        let api = MemApi::new();
        write(&api, "/d/z", b"").await;
        write(&api, "/d/a", b"").await;
        write(&api, "/d/sub/deep", b"").await;
        let names: Vec<String> = api.ls("/d").await.unwrap().into_iter().map(|s| s.path).collect();
        assert_eq!(names, vec!["/d/a", "/d/sub", "/d/z"]);
        assert!(matches!(api.ls("/missing").await, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn create_new_file_and_mkdirs() {
        let api = MemApi::new();
        assert!(api.create_new_file("/x/y").await.unwrap());
        assert!(!api.create_new_file("/x/y").await.unwrap());
        assert!(api.mkdirs("/x").await.unwrap());
        assert!(!api.mkdirs("/x/y/z").await.unwrap());
    }

    #[tokio::test]
    async fn delete_rename_copy() {
        let api = MemApi::new();
        write(&api, "/src/one", b"1").await;
        write(&api, "/src/sub/two", b"2").await;

        api.copy("/src", "/dup").await.unwrap();
        assert_eq!(read(&api, "/dup/sub/two").await, b"2");

        api.rename("/dup", "/moved").await.unwrap();
        assert!(!api.exists("/dup").await.unwrap());
        assert_eq!(read(&api, "/moved/one").await, b"1");

        assert!(api.delete("/moved", true).await.unwrap());
        assert!(!api.exists("/moved/sub/two").await.unwrap());
        assert!(!api.delete("/moved", true).await.unwrap());
        assert!(api.delete("/src", false).await.is_err());
        assert!(matches!(api.rename("/nope", "/x").await, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn permissions_are_enforced_for_the_client() {
        let admin = MemApi::new();
        write(&admin, "/private/secret", b"s").await;
        admin.set_owner("/private", "alice", "staff").unwrap();
        admin.set_owner("/private/secret", "alice", "staff").unwrap();
        admin.set_permission("/private", FsPermission::from_mode(0o750)).unwrap();
        admin.set_permission("/private/secret", FsPermission::from_mode(0o600)).unwrap();

        let bob = admin.bind_user("bob", ["staff"]);
        assert_eq!(bob.ls("/private").await.unwrap().len(), 1);
        assert!(matches!(bob.open("/private/secret").await, Err(ApiError::AccessDenied(_))));
        assert!(matches!(bob.create_new_file("/private/mine").await, Err(ApiError::AccessDenied(_))));

        let alice = admin.bind_user("alice", ["staff"]);
        assert_eq!(read(&alice, "/private/secret").await, b"s");
        assert!(alice.create_new_file("/private/mine").await.unwrap());
        assert_eq!(alice.stat("/private/mine").await.unwrap().owner, "alice");
    }
}
