// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::acl::Identity;
use crate::api::FsApi;
use crate::error::{ApiError, DavError};
use crate::locks::LockRegistry;
use crate::resource::DavResource;

/// Characters escaped when a resource identity is turned back into a protocol path.
const PATH_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Request-scoped context: who is asking.
#[derive(Debug, Clone)]
pub struct DavSession {
    identity: Arc<Identity>,
}

impl DavSession {
    pub fn new(identity: Identity) -> Self {
        DavSession {
            identity: Arc::new(identity),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// Protocol-level address of a resource: routing prefix plus the raw,
/// percent-encoded resource path below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLocator {
    prefix: String,
    resource_path: String,
}

impl ResourceLocator {
    pub fn new(prefix: &str, resource_path: &str) -> Self {
        ResourceLocator {
            prefix: prefix.to_string(),
            resource_path: resource_path.to_string(),
        }
    }

    /// Locator of an already normalized filesystem path under the same prefix.
    pub fn for_identity(prefix: &str, path: &str) -> Self {
        ResourceLocator::new(prefix, &utf8_percent_encode(path, PATH_ESCAPE).to_string())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }
}

/// Builds resource nodes bound to one shared filesystem handle and lock table.
#[derive(Clone)]
pub struct ResourceFactory {
    api: Arc<dyn FsApi>,
    locks: LockRegistry,
}

impl ResourceFactory {
    pub fn new(api: Box<dyn FsApi>, locks: LockRegistry) -> Self {
        ResourceFactory {
            api: Arc::from(api),
            locks,
        }
    }

    pub fn api(&self) -> &Arc<dyn FsApi> {
        &self.api
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    /// A factory for one request, whose filesystem client acts as the
    /// session's requester when the backend supports it. The lock table
    /// stays shared.
    pub fn for_session(&self, session: &DavSession) -> ResourceFactory {
        match self.api.for_identity(session.identity()) {
            Some(api) => ResourceFactory {
                api: Arc::from(api),
                locks: self.locks.clone(),
            },
            None => self.clone(),
        }
    }

    /// Resolves a locator into a resource for a request that does not create a collection.
    pub fn create_resource(
        &self, locator: &ResourceLocator, session: &DavSession,
    ) -> Result<DavResource, DavError> {
        self.create_resource_for_request(locator, session, false)
    }

    /// Resolves a locator into a resource. `collection_request` records that
    /// the inbound method intends to create a collection at this path.
    pub fn create_resource_for_request(
        &self, locator: &ResourceLocator, session: &DavSession, collection_request: bool,
    ) -> Result<DavResource, DavError> {
        let path = resource_identity(locator.resource_path()).map_err(|e| {
            warn!("unable to resolve {:?}: {}", locator.resource_path(), e);
            e
        })?;
        Ok(DavResource::new(
            self.clone(),
            locator.clone(),
            session.clone(),
            path,
            collection_request,
        ))
    }
}

impl Debug for ResourceFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceFactory")
            .field("api", &self.api)
            .finish()
    }
}

/// Decodes a protocol path into a normalized absolute filesystem path.
///
/// An empty path is the root. `.` segments and repeated slashes vanish and
/// `..` never climbs above the root.
pub fn resource_identity(raw: &str) -> Result<String, DavError> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| invalid_path(raw))?;
    if decoded.contains('\0') {
        return Err(invalid_path(raw));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.trim().split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Ok("/".to_string());
    }
    Ok(segments.iter().fold(String::new(), |mut path, s| {
        path.push('/');
        path.push_str(s);
        path
    }))
}

fn invalid_path(raw: &str) -> DavError {
    DavError::Internal(ApiError::InvalidPath(raw.to_string()))
}
