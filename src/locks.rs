// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use uuid::Uuid;
use webdav_handler::davpath::DavPath;
use webdav_handler::ls::{DavLock, DavLockSystem};
use xmltree::{Element, XMLNode};

use crate::error::DavError;
use crate::factory::resource_identity;
use crate::props::{dav_element, write_xml};

/// Timeout applied when a lock request does not carry a usable one.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    Exclusive,
    Shared,
}

/// A lock request. `owner` holds the serialized owner element.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub kind: LockType,
    pub scope: LockScope,
    pub owner: Option<String>,
    pub timeout: Option<Duration>,
    pub deep: bool,
}

impl LockInfo {
    pub fn exclusive_write() -> Self {
        LockInfo {
            kind: LockType::Write,
            scope: LockScope::Exclusive,
            owner: None,
            timeout: None,
            deep: false,
        }
    }
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLock {
    pub token: String,
    pub path: String,
    pub kind: LockType,
    pub scope: LockScope,
    pub owner: Option<String>,
    pub principal: Option<String>,
    pub timeout: Duration,
    pub expires_at: SystemTime,
    pub deep: bool,
}

impl ActiveLock {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at <= now
    }
}

/// Process-local lock table keyed by resource identity.
///
/// Grants are unconditional: a new lock is recorded even when the path
/// already carries one. Nothing survives a restart.
#[derive(Default, Debug, Clone)]
pub struct LockRegistry {
    locks: Arc<RwLock<HashMap<String, Vec<ActiveLock>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_lock(&self, path: &str, info: &LockInfo, principal: Option<&str>) -> ActiveLock {
        let timeout = lock_timeout(info.timeout);
        let lock = ActiveLock {
            token: format!("opaquelocktoken:{}", Uuid::new_v4()),
            path: path.to_string(),
            kind: info.kind,
            scope: info.scope,
            owner: info.owner.clone(),
            principal: principal.map(str::to_string),
            timeout,
            expires_at: SystemTime::now() + timeout,
            deep: info.deep,
        };
        debug!("lock {} granted on {}", lock.token, path);
        let now = SystemTime::now();
        let locks = &mut *self.locks.write();
        locks.retain(|_, records| {
            records.retain(|l| !l.is_expired(now));
            !records.is_empty()
        });
        locks.entry(path.to_string()).or_default().push(lock.clone());
        lock
    }

    pub fn refresh_lock(
        &self, path: &str, token: &str, timeout: Option<Duration>,
    ) -> Result<ActiveLock, DavError> {
        let now = SystemTime::now();
        let locks = &mut *self.locks.write();
        let records = locks.get_mut(path).ok_or_else(|| unknown_token(token))?;
        records.retain(|l| !l.is_expired(now));
        let lock = records
            .iter_mut()
            .find(|l| l.token == token)
            .ok_or_else(|| unknown_token(token))?;
        lock.timeout = lock_timeout(timeout);
        lock.expires_at = now + lock.timeout;
        debug!("lock {} refreshed on {}", token, path);
        Ok(lock.clone())
    }

    pub fn release_lock(&self, path: &str, token: &str) -> Result<(), DavError> {
        let locks = &mut *self.locks.write();
        let records = locks.get_mut(path).ok_or_else(|| unknown_token(token))?;
        let before = records.len();
        records.retain(|l| l.token != token);
        if records.len() == before {
            return Err(unknown_token(token));
        }
        if records.is_empty() {
            locks.remove(path);
        }
        debug!("lock {} released on {}", token, path);
        Ok(())
    }

    /// First live lock of the given type and scope on `path`.
    pub fn get_lock(&self, path: &str, kind: LockType, scope: LockScope) -> Option<ActiveLock> {
        self.locks(path)
            .into_iter()
            .find(|l| l.kind == kind && l.scope == scope)
    }

    /// Live locks on `path`. Expired records are dropped on the way.
    pub fn locks(&self, path: &str) -> Vec<ActiveLock> {
        let now = SystemTime::now();
        let locks = &mut *self.locks.write();
        match locks.get_mut(path) {
            None => Vec::new(),
            Some(records) => {
                records.retain(|l| !l.is_expired(now));
                let live = records.clone();
                if live.is_empty() {
                    locks.remove(path);
                }
                live
            }
        }
    }

    /// Drops every lock held on `path` and below it.
    pub fn remove_all(&self, path: &str) {
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        let locks = &mut *self.locks.write();
        locks.retain(|k, _| k != path && !k.starts_with(&prefix));
    }
}

fn lock_timeout(requested: Option<Duration>) -> Duration {
    match requested {
        Some(d) if !d.is_zero() && d <= DEFAULT_LOCK_TIMEOUT => d,
        _ => DEFAULT_LOCK_TIMEOUT,
    }
}

fn unknown_token(token: &str) -> DavError {
    DavError::PreconditionFailed(format!("no lock for token {}", token))
}

#[inline]
fn lock_path(path: &DavPath) -> String {
    let raw = path.as_url_string();
    resource_identity(&raw).unwrap_or(raw)
}

/// Rebuilds a stored owner. Plain text becomes the content of a `DAV:owner` element.
fn owner_element(owner: &str) -> Element {
    match Element::parse(owner.as_bytes()) {
        Ok(elem) => elem,
        Err(_) => {
            let mut elem = dav_element("owner");
            elem.children.push(XMLNode::Text(owner.to_string()));
            elem
        }
    }
}

fn to_dav_lock(lock: ActiveLock, path: &DavPath) -> DavLock {
    DavLock {
        owner: lock.owner.as_deref().map(owner_element),
        token: lock.token,
        path: path.clone(),
        principal: lock.principal,
        timeout_at: Some(lock.expires_at),
        timeout: Some(lock.timeout),
        shared: lock.scope == LockScope::Shared,
        deep: lock.deep,
    }
}

impl DavLockSystem for LockRegistry {
    fn lock(
        &self, path: &DavPath, principal: Option<&str>, owner: Option<&Element>,
        timeout: Option<Duration>, shared: bool, deep: bool,
    ) -> Result<DavLock, DavLock>
    {
        trace!("DLS: lock {:?}", path);
        let info = LockInfo {
            kind: LockType::Write,
            scope: if shared { LockScope::Shared } else { LockScope::Exclusive },
            owner: owner.map(|elem| String::from_utf8_lossy(&write_xml(elem, false)).into_owned()),
            timeout,
            deep,
        };
        let lock = self.create_lock(&lock_path(path), &info, principal);
        Ok(to_dav_lock(lock, path))
    }

    fn unlock(&self, path: &DavPath, token: &str) -> Result<(), ()> {
        trace!("DLS: unlock {:?}", path);
        self.release_lock(&lock_path(path), token).map_err(|_| ())
    }

    fn refresh(
        &self, path: &DavPath, token: &str, timeout: Option<Duration>,
    ) -> Result<DavLock, ()> {
        trace!("DLS: refresh {:?}", path);
        self.refresh_lock(&lock_path(path), token, timeout)
            .map(|lock| to_dav_lock(lock, path))
            .map_err(|_| ())
    }

    fn check(
        &self, _path: &DavPath, _principal: Option<&str>, _ignore_principal: bool, _deep: bool,
        _submitted_tokens: Vec<&str>,
    ) -> Result<(), DavLock>
    {
        Ok(())
    }

    fn discover(&self, path: &DavPath) -> Vec<DavLock> {
        self.locks(&lock_path(path))
            .into_iter()
            .map(|lock| to_dav_lock(lock, path))
            .collect()
    }

    fn delete(&self, path: &DavPath) -> Result<(), ()> {
        trace!("DLS: delete {:?}", path);
        self.remove_all(&lock_path(path));
        Ok(())
    }
}
