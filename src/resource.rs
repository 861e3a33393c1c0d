// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
use std::fmt::{Debug, Formatter};
use std::io::Cursor;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::acl;
use crate::api::{file_name, parent_path, ApiError, FsApi, FsReader, FsStatus};
use crate::error::DavError;
use crate::factory::{DavSession, ResourceFactory, ResourceLocator};
use crate::locks::{ActiveLock, LockInfo, LockRegistry, LockScope, LockType};
use crate::props::{
    http_date, DavProperty, PropertyChange, PropertyName, PropertySet, PropertyValue,
    CURRENT_USER_PRIVILEGE_SET, DISPLAYNAME, GETCONTENTLENGTH, GETLASTMODIFIED, GROUP,
    ISCOLLECTION, OWNER, RESOURCETYPE,
};

/// Compliance class advertised for every resource.
pub const COMPLIANCE_CLASS: &str = "2";

/// Methods advertised as supported. Property modification is deliberately absent.
pub const SUPPORTED_METHODS: &str =
    "OPTIONS, GET, HEAD, POST, TRACE, MKCOL, COPY, PUT, DELETE, MOVE, PROPFIND";

/// Children of a collection, one per directory entry. An entry whose
/// resource could not be built is kept as an error so callers decide
/// whether to skip it.
pub type Members = Vec<Result<DavResource, DavError>>;

/// Content attached to a creation request.
pub struct InputContext {
    body: Option<FsReader>,
    content_length: Option<u64>,
}

impl InputContext {
    /// No payload: the member is created empty.
    pub fn empty() -> Self {
        InputContext {
            body: None,
            content_length: None,
        }
    }

    pub fn new(body: FsReader, content_length: Option<u64>) -> Self {
        InputContext {
            body: Some(body),
            content_length,
        }
    }

    pub fn from_bytes(data: Bytes) -> Self {
        let len = data.len() as u64;
        InputContext::new(Box::pin(Cursor::new(data)), Some(len))
    }

    pub fn has_stream(&self) -> bool {
        self.body.is_some()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// The payload, if there is one of known length.
    fn into_stream(self) -> Option<FsReader> {
        match self.content_length {
            Some(_) => self.body,
            None => None,
        }
    }
}

/// One addressed filesystem path seen as a WebDAV resource.
///
/// Built per request by [`ResourceFactory`]; never shared across requests.
#[derive(Clone)]
pub struct DavResource {
    factory: ResourceFactory,
    locator: ResourceLocator,
    session: DavSession,
    path: String,
    collection_request: bool,
    properties: PropertySet,
}

impl DavResource {
    pub(crate) fn new(
        factory: ResourceFactory, locator: ResourceLocator, session: DavSession, path: String,
        collection_request: bool,
    ) -> Self {
        DavResource {
            factory,
            locator,
            session,
            path,
            collection_request,
            properties: PropertySet::default(),
        }
    }

    /// Normalized filesystem path of the resource.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn locator(&self) -> &ResourceLocator {
        &self.locator
    }

    pub fn session(&self) -> &DavSession {
        &self.session
    }

    pub fn factory(&self) -> &ResourceFactory {
        &self.factory
    }

    /// Whether the request that built this resource asked for a collection.
    /// Says nothing about what exists on the filesystem.
    pub fn is_collection_request(&self) -> bool {
        self.collection_request
    }

    pub fn compliance_class(&self) -> &'static str {
        COMPLIANCE_CLASS
    }

    pub fn supported_methods(&self) -> &'static str {
        SUPPORTED_METHODS
    }

    pub fn display_name(&self) -> &str {
        file_name(&self.path)
    }

    fn api(&self) -> &Arc<dyn FsApi> {
        self.factory.api()
    }

    fn lock_registry(&self) -> &LockRegistry {
        self.factory.locks()
    }

    pub async fn exists(&self) -> Result<bool, DavError> {
        self.api()
            .exists(&self.path)
            .await
            .map_err(|e| fatal(&self.path, e))
    }

    /// Live collection flag. Any failure, a missing path included, reads as `false`.
    pub async fn is_collection(&self) -> bool {
        match self.api().stat(&self.path).await {
            Ok(status) => status.is_dir,
            Err(_) => false,
        }
    }

    pub async fn metadata(&self) -> Result<FsStatus, DavError> {
        self.api()
            .stat(&self.path)
            .await
            .map_err(|e| fatal(&self.path, e))
    }

    pub async fn modification_time(&self) -> Result<SystemTime, DavError> {
        let status = self.metadata().await?;
        trace!("modification time of {}: {:?}", self.path, status.modification_time);
        Ok(status.modification_time)
    }

    /// Creates `member` as a directory or a file. A file's content is
    /// replaced by the payload when one of known length is attached.
    pub async fn add_member(&self, member: &DavResource, input: InputContext) -> Result<(), DavError> {
        let dest = member.path();
        if member.is_collection_request() {
            debug!("creating new directory: {}", dest);
            return match self.api().mkdirs(dest).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(DavError::Conflict(format!("unable to create directory {}", dest))),
                Err(ApiError::AlreadyExists(_)) => Ok(()),
                Err(e) => Err(internal(dest, e)),
            };
        }

        match input.into_stream() {
            None => {
                debug!("creating new file: {}", dest);
                match self.api().create_new_file(dest).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(DavError::Conflict(format!("unable to create file {}", dest))),
                    Err(e) => Err(internal(dest, e)),
                }
            }
            Some(mut body) => {
                debug!("writing new file: {}", dest);
                let mut out = self.api().create(dest).await.map_err(|e| internal(dest, e))?;
                let written = tokio::io::copy(&mut body, &mut out)
                    .await
                    .map_err(|e| internal(dest, ApiError::from(e)))?;
                out.shutdown()
                    .await
                    .map_err(|e| internal(dest, ApiError::from(e)))?;
                trace!("wrote {} bytes to {}", written, dest);
                Ok(())
            }
        }
    }

    /// Deletes `member` and everything below it.
    pub async fn remove_member(&self, member: &DavResource) -> Result<(), DavError> {
        let dest = member.path();
        match self.api().delete(dest, true).await {
            Ok(removed) => {
                info!("delete {}: {}", dest, removed);
                if !removed {
                    return Err(DavError::NotFound);
                }
                self.lock_registry().remove_all(dest);
                Ok(())
            }
            Err(e) => Err(internal(dest, e)),
        }
    }

    /// Copies this resource to `dest`. Collections are always copied with
    /// their descendants; a shallow copy of a collection is refused.
    pub async fn copy(&self, dest: &DavResource, shallow: bool) -> Result<(), DavError> {
        if !self.exists().await? {
            return Err(DavError::NotFound);
        }
        if shallow && self.is_collection().await {
            return Err(DavError::Forbidden("unable to perform shallow copy".to_string()));
        }
        self.api()
            .copy(&self.path, dest.path())
            .await
            .map_err(|e| internal(&self.path, e))
    }

    pub async fn move_to(&self, dest: &DavResource) -> Result<(), DavError> {
        self.api()
            .rename(&self.path, dest.path())
            .await
            .map_err(|e| internal(&self.path, e))
    }

    /// Lists the children of this resource.
    ///
    /// Failing to list is fatal; failing to build one child only turns that
    /// entry into an error.
    pub async fn members(&self) -> Result<Members, DavError> {
        let entries = self
            .api()
            .ls(&self.path)
            .await
            .map_err(|e| fatal(&self.path, e))?;
        Ok(entries
            .iter()
            .map(|entry| {
                trace!("member: {}", entry.path);
                let locator = ResourceLocator::for_identity(self.locator.prefix(), &entry.path);
                self.factory.create_resource(&locator, &self.session)
            })
            .collect())
    }

    /// The enclosing collection, `None` for the root.
    pub fn collection(&self) -> Result<Option<DavResource>, DavError> {
        let parent = match parent_path(&self.path) {
            None => return Ok(None),
            Some(parent) => parent,
        };
        let locator = ResourceLocator::for_identity(self.locator.prefix(), parent);
        match self.factory.create_resource(&locator, &self.session) {
            Ok(resource) => Ok(Some(resource)),
            Err(DavError::Internal(e)) => Err(DavError::Fatal(e)),
            Err(e) => Err(e),
        }
    }

    /// Opens the content of a file for reading. Collections have none.
    pub async fn content(&self) -> Result<Option<FsReader>, DavError> {
        if self.is_collection().await {
            return Ok(None);
        }
        self.api()
            .open(&self.path)
            .await
            .map(Some)
            .map_err(|e| fatal(&self.path, e))
    }

    /// Streams the content of a file into `sink`. Collections have no content.
    pub async fn spool<W>(&self, sink: &mut W) -> Result<u64, DavError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut input = match self.content().await? {
            Some(input) => input,
            None => return Ok(0),
        };
        let copied = tokio::io::copy(&mut input, sink).await;
        drop(input);
        copied.map_err(|e| fatal(&self.path, ApiError::from(e)))
    }

    /// Absolute path of the resource, rebuilt segment by segment from the root.
    pub fn href(&self) -> String {
        let mut segments = Vec::new();
        let mut current = Some(self.path.as_str());
        while let Some(path) = current {
            let name = file_name(path);
            if name.is_empty() {
                break;
            }
            segments.push(name);
            current = parent_path(path);
        }
        if segments.is_empty() {
            return "/".to_string();
        }
        segments.iter().rev().fold(String::new(), |mut href, name| {
            href.push('/');
            href.push_str(name);
            href
        })
    }

    /*-------------------------------------------------------------------*/
    /*                             Properties                            */
    /*-------------------------------------------------------------------*/

    async fn init_properties(&mut self) {
        if self.properties.is_initialized() {
            return;
        }

        let mut collection = false;
        let snapshot = self.api().stat(&self.path).await;
        match snapshot {
            Ok(status) => {
                collection = status.is_dir;
                let privileges = acl::privileges(&status, self.session.identity());
                self.properties.add(DavProperty::text(GETCONTENTLENGTH, status.len));
                self.properties
                    .add(DavProperty::text(GETLASTMODIFIED, http_date(status.modification_time)));
                self.properties.add(DavProperty::text(OWNER, &status.owner));
                self.properties.add(DavProperty::text(GROUP, &status.group));
                self.properties.add(DavProperty {
                    name: PropertyName::dav(CURRENT_USER_PRIVILEGE_SET),
                    value: PropertyValue::Privileges(privileges),
                });
            }
            Err(e) => warn!("unable to read properties of {}: {}", self.path, e),
        }

        let display_name = self.display_name().to_string();
        self.properties.add(DavProperty::text(DISPLAYNAME, display_name));
        self.properties.add(DavProperty {
            name: PropertyName::dav(RESOURCETYPE),
            value: PropertyValue::ResourceType { collection },
        });
        self.properties
            .add(DavProperty::text(ISCOLLECTION, if collection { "1" } else { "0" }));

        self.properties.mark_initialized();
    }

    pub async fn properties(&mut self) -> &PropertySet {
        self.init_properties().await;
        &self.properties
    }

    pub async fn property(&mut self, name: &PropertyName) -> Option<&DavProperty> {
        self.init_properties().await;
        self.properties.get(name)
    }

    pub async fn property_names(&mut self) -> Vec<PropertyName> {
        self.init_properties().await;
        self.properties.names()
    }

    /// Accepted, but nothing is written to the filesystem or the cache.
    pub async fn set_property(&mut self, _prop: DavProperty) -> Result<(), DavError> {
        self.init_properties().await;
        Ok(())
    }

    /// Drops the property from this resource's cached set only.
    pub async fn remove_property(&mut self, name: &PropertyName) -> Result<(), DavError> {
        self.init_properties().await;
        self.properties.remove(name);
        Ok(())
    }

    /// Applies a property update to the cached set. Every change is
    /// reported as forbidden because none of them is persisted.
    pub async fn alter_properties(
        &mut self, changes: Vec<PropertyChange>,
    ) -> Vec<(PropertyName, StatusCode)> {
        let mut res = Vec::with_capacity(changes.len());
        for change in changes {
            let name = change.name().clone();
            let applied = match change {
                PropertyChange::Set(prop) => self.set_property(prop).await,
                PropertyChange::Remove(name) => self.remove_property(&name).await,
            };
            if let Err(e) = applied {
                debug!("property {:?} of {} not applied: {}", name, self.path, e);
            }
            res.push((name, StatusCode::FORBIDDEN));
        }
        res
    }

    /*-------------------------------------------------------------------*/
    /*                              Locking                              */
    /*-------------------------------------------------------------------*/

    pub fn is_lockable(&self, kind: LockType, _scope: LockScope) -> bool {
        kind == LockType::Write
    }

    pub fn lock(&self, info: &LockInfo) -> Result<ActiveLock, DavError> {
        let principal = self.session.identity().user.as_str();
        Ok(self.lock_registry().create_lock(&self.path, info, Some(principal)))
    }

    pub fn refresh_lock(&self, info: &LockInfo, token: &str) -> Result<ActiveLock, DavError> {
        self.lock_registry().refresh_lock(&self.path, token, info.timeout)
    }

    pub fn unlock(&self, token: &str) -> Result<(), DavError> {
        self.lock_registry().release_lock(&self.path, token)
    }

    pub fn lock_of(&self, kind: LockType, scope: LockScope) -> Option<ActiveLock> {
        self.lock_registry().get_lock(&self.path, kind, scope)
    }

    pub fn has_lock(&self, kind: LockType, scope: LockScope) -> bool {
        self.lock_of(kind, scope).is_some()
    }

    pub fn locks(&self) -> Vec<ActiveLock> {
        self.lock_registry().locks(&self.path)
    }
}

impl Debug for DavResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DavResource")
            .field("path", &self.path)
            .field("collection_request", &self.collection_request)
            .finish()
    }
}

fn fatal(path: &str, e: ApiError) -> DavError {
    warn!("{}: {}", path, e);
    DavError::Fatal(e)
}

fn internal(path: &str, e: ApiError) -> DavError {
    warn!("{}: {}", path, e);
    DavError::Internal(e)
}
