// Copyright 2022 Debox Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
use std::fmt::{Debug, Formatter};
use std::io::{Error, ErrorKind, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Buf, Bytes};
use futures::future::{BoxFuture, FutureExt};
use futures::{future, stream};
use http::StatusCode;
use parking_lot::Mutex;
use tokio::io::{sink, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use webdav_handler::davpath::DavPath;
use webdav_handler::fs::{
    DavDirEntry, DavFile, DavFileSystem, DavMetaData, DavProp, FsError, FsFuture, FsResult,
    FsStream, OpenOptions, ReadDirMeta,
};

use crate::api::{ApiError, FsReader, FsStatus};
use crate::error::DavError;
use crate::factory::{DavSession, ResourceFactory, ResourceLocator};
use crate::props::{
    DavProperty, PropertyChange, PropertyName, PropertyValue, CURRENT_USER_PRIVILEGE_SET, DAV_NS,
    GROUP, ISCOLLECTION, OWNER,
};
use crate::resource::{DavResource, InputContext};

/// Properties served to the handler as stored ones. The others it computes itself.
const EXPORTED_PROPS: [&str; 4] = [OWNER, GROUP, CURRENT_USER_PRIVILEGE_SET, ISCOLLECTION];

/// Buffer between an upload and the backend write it feeds.
const PIPE_CAPACITY: usize = 64 * 1024;

/// `DavFileSystem` view of the resource layer for one request.
#[derive(Clone)]
pub struct GatewayFs {
    factory: ResourceFactory,
    session: DavSession,
    prefix: String,
    denied: Arc<AtomicBool>,
    content_length: Option<u64>,
}

#[derive(Debug, Clone)]
struct GatewayMeta {
    len: u64,
    modified: SystemTime,
    is_dir: bool,
}

struct GatewayEntry {
    resource: DavResource,
    denied: Arc<AtomicBool>,
}

struct GatewayFile {
    resource: DavResource,
    denied: Arc<AtomicBool>,
    modified: SystemTime,
    body: FileBody,
}

enum FileBody {
    /// Content streamed from the backend. Seeking backwards reopens it.
    Reader {
        // Only reached through `get_mut`; the lock makes the stream `Sync`.
        input: Option<Mutex<FsReader>>,
        len: u64,
        pos: u64,
    },
    /// Upload of announced length, piped into the parent while it arrives.
    Upload {
        pipe: Option<DuplexStream>,
        task: Option<JoinHandle<Result<(), DavError>>>,
        written: u64,
    },
    /// Content held in memory and committed to the parent on flush.
    Buffer {
        parent: DavResource,
        data: Vec<u8>,
        pos: usize,
        append: bool,
        dirty: bool,
    },
}

impl GatewayFs {
    pub fn new(factory: ResourceFactory, session: DavSession, prefix: &str) -> Box<GatewayFs> {
        Box::new(GatewayFs {
            factory,
            session,
            prefix: prefix.to_string(),
            denied: Arc::new(AtomicBool::new(false)),
            content_length: None,
        })
    }

    /// Announced size of the request body. Uploads of known size are
    /// streamed to the backend instead of being buffered.
    pub fn with_content_length(mut self: Box<Self>, len: Option<u64>) -> Box<GatewayFs> {
        self.content_length = len;
        self
    }

    /// Raised once any operation of this view hit a backend access-control failure.
    pub fn access_denied(&self) -> Arc<AtomicBool> {
        self.denied.clone()
    }

    fn resource(&self, path: &DavPath, collection_request: bool) -> FsResult<DavResource> {
        let locator = ResourceLocator::new(&self.prefix, &path.as_url_string());
        self.factory
            .create_resource_for_request(&locator, &self.session, collection_request)
            .map_err(|e| fs_error(e, &self.denied))
    }

    fn parent_of(&self, resource: &DavResource) -> FsResult<DavResource> {
        match resource.collection() {
            Ok(Some(parent)) => Ok(parent),
            Ok(None) => Err(FsError::Forbidden),
            Err(e) => Err(fs_error(e, &self.denied)),
        }
    }

    async fn do_open(&self, path: &DavPath, options: OpenOptions) -> FsResult<Box<dyn DavFile>> {
        let resource = self.resource(path, false)?;
        let existing = match resource.metadata().await {
            Ok(status) if status.is_dir => return Err(FsError::Forbidden),
            Ok(status) => Some(status),
            Err(e) => match fs_error(e, &self.denied) {
                FsError::NotFound => None,
                e => return Err(e),
            },
        };

        if !options.write && !options.append {
            let status = existing.ok_or(FsError::NotFound)?;
            let input = resource
                .content()
                .await
                .map_err(|e| fs_error(e, &self.denied))?
                .ok_or(FsError::Forbidden)?;
            let body = FileBody::Reader {
                input: Some(Mutex::new(input)),
                len: status.len,
                pos: 0,
            };
            return Ok(Box::new(GatewayFile::new(resource, self.denied.clone(), body)));
        }

        match &existing {
            Some(_) if options.create_new => return Err(FsError::Exists),
            None if !options.create && !options.create_new => return Err(FsError::NotFound),
            _ => {}
        }
        let parent = self.parent_of(&resource)?;
        if let (true, false, Some(len)) = (options.truncate, options.append, self.content_length) {
            trace!("DFS: streaming {} bytes to {:?}", len, path);
            let body = upload(parent, resource.clone(), len);
            return Ok(Box::new(GatewayFile::new(resource, self.denied.clone(), body)));
        }

        let mut data = Vec::new();
        if existing.is_some() && !options.truncate {
            resource
                .spool(&mut data)
                .await
                .map_err(|e| fs_error(e, &self.denied))?;
        }
        let body = FileBody::Buffer {
            parent,
            data,
            pos: 0,
            append: options.append,
            dirty: existing.is_none() || options.truncate,
        };
        Ok(Box::new(GatewayFile::new(resource, self.denied.clone(), body)))
    }

    async fn do_remove(&self, path: &DavPath) -> FsResult<()> {
        let resource = self.resource(path, false)?;
        let parent = self.parent_of(&resource)?;
        parent
            .remove_member(&resource)
            .await
            .map_err(|e| fs_error(e, &self.denied))
    }
}

impl Debug for GatewayFs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayFs")
            .field("prefix", &self.prefix)
            .field("user", &self.session.identity().user)
            .finish()
    }
}

impl DavFileSystem for GatewayFs {
    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<Box<dyn DavFile>> {
        async move {
            trace!("DFS: open {:?}", path);
            self.do_open(path, options).await
        }
        .boxed()
    }

    fn read_dir<'a>(
        &'a self, path: &'a DavPath, _meta: ReadDirMeta,
    ) -> FsFuture<FsStream<Box<dyn DavDirEntry>>> {
        async move {
            trace!("DFS: read_dir {:?}", path);
            let resource = self.resource(path, false)?;
            let members = resource
                .members()
                .await
                .map_err(|e| fs_error(e, &self.denied))?;
            let mut v: Vec<Box<dyn DavDirEntry>> = Vec::with_capacity(members.len());
            for member in members {
                match member {
                    Ok(resource) => v.push(Box::new(GatewayEntry {
                        resource,
                        denied: self.denied.clone(),
                    })),
                    Err(e) => warn!("skipping member of {:?}: {}", path, e),
                }
            }
            let stream = stream::iter(v.into_iter());
            Ok(Box::pin(stream) as FsStream<Box<dyn DavDirEntry>>)
        }
        .boxed()
    }

    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<Box<dyn DavMetaData>> {
        async move {
            let resource = self.resource(path, false)?;
            let status = resource
                .metadata()
                .await
                .map_err(|e| fs_error(e, &self.denied))?;
            Ok(Box::new(GatewayMeta::from(&status)) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<()> {
        async move {
            trace!("DFS: create_dir {:?}", path);
            let resource = self.resource(path, true)?;
            if resource
                .exists()
                .await
                .map_err(|e| fs_error(e, &self.denied))?
            {
                return Err(FsError::Exists);
            }
            let parent = self.parent_of(&resource)?;
            if !parent.is_collection().await {
                return Err(FsError::NotFound);
            }
            parent
                .add_member(&resource, InputContext::empty())
                .await
                .map_err(|e| fs_error(e, &self.denied))
        }
        .boxed()
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<()> {
        async move {
            trace!("DFS: remove_dir {:?}", path);
            self.do_remove(path).await
        }
        .boxed()
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<()> {
        async move {
            trace!("DFS: remove_file {:?}", path);
            self.do_remove(path).await
        }
        .boxed()
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<()> {
        async move {
            trace!("DFS: rename {:?} {:?}", from, to);
            let source = self.resource(from, false)?;
            let dest = self.resource(to, false)?;
            source
                .move_to(&dest)
                .await
                .map_err(|e| fs_error(e, &self.denied))
        }
        .boxed()
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<()> {
        async move {
            trace!("DFS: copy {:?} {:?}", from, to);
            let source = self.resource(from, false)?;
            let dest = self.resource(to, false)?;
            source
                .copy(&dest, false)
                .await
                .map_err(|e| fs_error(e, &self.denied))
        }
        .boxed()
    }

    fn have_props<'a>(&'a self, _path: &'a DavPath) -> BoxFuture<'a, bool> {
        future::ready(true).boxed()
    }

    fn patch_props<'a>(
        &'a self, path: &'a DavPath, patch: Vec<(bool, DavProp)>,
    ) -> FsFuture<Vec<(StatusCode, DavProp)>> {
        async move {
            trace!("DFS: patch_props {:?}", path);
            let mut resource = self.resource(path, false)?;
            let mut names = Vec::with_capacity(patch.len());
            let mut changes = Vec::with_capacity(patch.len());
            for (set, p) in patch.into_iter() {
                let name = prop_name(&p);
                names.push(clone_prop(&p));
                changes.push(if set {
                    let text = p
                        .xml
                        .as_ref()
                        .map(|xml| String::from_utf8_lossy(xml).into_owned())
                        .unwrap_or_default();
                    PropertyChange::Set(DavProperty {
                        name,
                        value: PropertyValue::Text(text),
                    })
                } else {
                    PropertyChange::Remove(name)
                });
            }
            let statuses = resource.alter_properties(changes).await;
            Ok(statuses
                .into_iter()
                .zip(names)
                .map(|((_, status), prop)| (status, prop))
                .collect())
        }
        .boxed()
    }

    fn get_props<'a>(&'a self, path: &'a DavPath, do_content: bool) -> FsFuture<Vec<DavProp>> {
        async move {
            let mut resource = self.resource(path, false)?;
            let props = resource.properties().await;
            Ok(props
                .iter()
                .filter(|p| is_exported(&p.name))
                .map(|p| to_dav_prop(p, do_content))
                .collect())
        }
        .boxed()
    }

    fn get_prop<'a>(&'a self, path: &'a DavPath, prop: DavProp) -> FsFuture<Vec<u8>> {
        async move {
            let name = prop_name(&prop);
            if !is_exported(&name) {
                return Err(FsError::NotFound);
            }
            let mut resource = self.resource(path, false)?;
            let p = resource.property(&name).await.ok_or(FsError::NotFound)?;
            Ok(p.to_xml())
        }
        .boxed()
    }
}

impl From<&FsStatus> for GatewayMeta {
    fn from(status: &FsStatus) -> Self {
        GatewayMeta {
            len: status.len,
            modified: status.modification_time,
            is_dir: status.is_dir,
        }
    }
}

impl DavMetaData for GatewayMeta {
    fn len(&self) -> u64 {
        self.len
    }

    fn modified(&self) -> FsResult<SystemTime> {
        Ok(self.modified)
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }
}

impl Debug for GatewayEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GatewayEntry").field(&self.resource.path()).finish()
    }
}

impl DavDirEntry for GatewayEntry {
    fn name(&self) -> Vec<u8> {
        self.resource.display_name().as_bytes().to_vec()
    }

    fn metadata<'a>(&'a self) -> FsFuture<Box<dyn DavMetaData>> {
        async move {
            let status = self
                .resource
                .metadata()
                .await
                .map_err(|e| fs_error(e, &self.denied))?;
            Ok(Box::new(GatewayMeta::from(&status)) as Box<dyn DavMetaData>)
        }
        .boxed()
    }
}

/// Starts storing `member` through `parent` from a pipe fed by the writes.
fn upload(parent: DavResource, member: DavResource, len: u64) -> FileBody {
    let (pipe, input) = tokio::io::duplex(PIPE_CAPACITY);
    let task = tokio::spawn(async move {
        let input = InputContext::new(Box::pin(input), Some(len));
        parent.add_member(&member, input).await
    });
    FileBody::Upload {
        pipe: Some(pipe),
        task: Some(task),
        written: 0,
    }
}

impl GatewayFile {
    fn new(resource: DavResource, denied: Arc<AtomicBool>, body: FileBody) -> Self {
        GatewayFile {
            resource,
            denied,
            modified: SystemTime::now(),
            body,
        }
    }

    fn len(&self) -> u64 {
        match &self.body {
            FileBody::Reader { len, .. } => *len,
            FileBody::Upload { written, .. } => *written,
            FileBody::Buffer { data, .. } => data.len() as u64,
        }
    }

    async fn put(&mut self, chunk: &[u8]) -> FsResult<()> {
        match &mut self.body {
            FileBody::Reader { .. } => Err(FsError::Forbidden),
            FileBody::Upload { pipe, written, .. } => {
                let sent = match pipe {
                    Some(pipe) => pipe.write_all(chunk).await,
                    None => return Err(FsError::GeneralFailure),
                };
                match sent {
                    Ok(()) => {
                        *written += chunk.len() as u64;
                        Ok(())
                    }
                    Err(e) => {
                        debug!("upload of {} cut short: {}", self.resource.path(), e);
                        let stored = self.finish_upload().await;
                        stored.and(Err(FsError::GeneralFailure))
                    }
                }
            }
            FileBody::Buffer {
                data,
                pos,
                append,
                dirty,
                ..
            } => {
                if *append {
                    *pos = data.len();
                }
                let end = *pos + chunk.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[*pos..end].copy_from_slice(chunk);
                *pos = end;
                *dirty = true;
                Ok(())
            }
        }
    }

    async fn take(&mut self, count: usize) -> FsResult<Bytes> {
        let path = self.resource.path();
        match &mut self.body {
            FileBody::Reader { input, pos, .. } => {
                let input = match input {
                    Some(input) => input.get_mut(),
                    None => return Ok(Bytes::new()),
                };
                let mut buf = vec![0u8; count];
                let mut filled = 0;
                while filled < count {
                    let n = input.read(&mut buf[filled..]).await.map_err(|e| {
                        warn!("reading {}: {}", path, e);
                        FsError::GeneralFailure
                    })?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                *pos += filled as u64;
                Ok(Bytes::from(buf))
            }
            FileBody::Upload { .. } => Err(FsError::Forbidden),
            FileBody::Buffer { data, pos, .. } => {
                let start = (*pos).min(data.len());
                let end = (start + count).min(data.len());
                *pos = end;
                Ok(Bytes::copy_from_slice(&data[start..end]))
            }
        }
    }

    async fn seek_to(&mut self, to: SeekFrom) -> FsResult<u64> {
        let len = self.len();
        let GatewayFile {
            resource,
            denied,
            body,
            ..
        } = self;
        match body {
            FileBody::Reader { input, pos, .. } => {
                let target = seek_target(to, *pos, len)?;
                if target < *pos || input.is_none() {
                    let reopened = resource
                        .content()
                        .await
                        .map_err(|e| fs_error(e, denied))?
                        .ok_or(FsError::Forbidden)?;
                    *input = Some(Mutex::new(reopened));
                    *pos = 0;
                }
                if let Some(input) = input {
                    let skipped = tokio::io::copy(&mut input.get_mut().take(target - *pos), &mut sink())
                        .await
                        .map_err(|e| {
                            warn!("seeking in {}: {}", resource.path(), e);
                            FsError::GeneralFailure
                        })?;
                    trace!("DF: skipped {} bytes", skipped);
                }
                *pos = target;
                Ok(target)
            }
            FileBody::Upload { written, .. } => {
                let target = seek_target(to, *written, len)?;
                if target != *written {
                    return Err(FsError::NotImplemented);
                }
                Ok(target)
            }
            FileBody::Buffer { pos, .. } => {
                let target = seek_target(to, *pos as u64, len)?;
                *pos = target as usize;
                Ok(target)
            }
        }
    }

    /// Closes the pipe and waits for the parent to store what was sent.
    async fn finish_upload(&mut self) -> FsResult<()> {
        let task = match &mut self.body {
            FileBody::Upload { pipe, task, .. } => {
                drop(pipe.take());
                task.take()
            }
            _ => None,
        };
        let task = match task {
            Some(task) => task,
            None => return Ok(()),
        };
        match task.await {
            Ok(Ok(())) => {
                self.modified = SystemTime::now();
                Ok(())
            }
            Ok(Err(e)) => Err(fs_error(e, &self.denied)),
            Err(e) => {
                warn!("upload of {} did not finish: {}", self.resource.path(), e);
                Err(FsError::GeneralFailure)
            }
        }
    }

    async fn commit(&mut self) -> FsResult<()> {
        if let FileBody::Upload { .. } = self.body {
            return self.finish_upload().await;
        }
        let (parent, data) = match &self.body {
            FileBody::Buffer {
                parent,
                data,
                dirty: true,
                ..
            } => (parent, data),
            _ => return Ok(()),
        };
        let input = InputContext::from_bytes(Bytes::copy_from_slice(data));
        parent
            .add_member(&self.resource, input)
            .await
            .map_err(|e| fs_error(e, &self.denied))?;
        if let FileBody::Buffer { dirty, .. } = &mut self.body {
            *dirty = false;
        }
        self.modified = SystemTime::now();
        Ok(())
    }
}

impl Drop for GatewayFile {
    fn drop(&mut self) {
        if let FileBody::Upload { task: Some(task), .. } = &self.body {
            debug!("upload of {} abandoned", self.resource.path());
            task.abort();
        }
    }
}

impl Debug for GatewayFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.body {
            FileBody::Reader { .. } => "read",
            FileBody::Upload { .. } => "upload",
            FileBody::Buffer { .. } => "buffer",
        };
        f.debug_struct("GatewayFile")
            .field("path", &self.resource.path())
            .field("mode", &mode)
            .field("len", &self.len())
            .finish()
    }
}

impl DavFile for GatewayFile {
    fn metadata<'a>(&'a mut self) -> FsFuture<Box<dyn DavMetaData>> {
        let meta = GatewayMeta {
            len: self.len(),
            modified: self.modified,
            is_dir: false,
        };
        future::ok(Box::new(meta) as Box<dyn DavMetaData>).boxed()
    }

    fn write_buf<'a>(&'a mut self, mut buf: Box<dyn Buf + Send>) -> FsFuture<()> {
        async move {
            trace!("DF: write_buf");
            while buf.has_remaining() {
                let chunk = Bytes::copy_from_slice(buf.chunk());
                self.put(&chunk).await?;
                buf.advance(chunk.len());
            }
            Ok(())
        }
        .boxed()
    }

    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<()> {
        async move {
            trace!("DF: write_bytes");
            self.put(&buf).await
        }
        .boxed()
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<Bytes> {
        async move {
            trace!("DF: read_bytes ({:?} bytes)", count);
            self.take(count).await
        }
        .boxed()
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<u64> {
        async move {
            trace!("DF: seek");
            self.seek_to(pos).await
        }
        .boxed()
    }

    fn flush(&mut self) -> FsFuture<()> {
        async move {
            trace!("DF: flush");
            self.commit().await
        }
        .boxed()
    }
}

fn seek_target(to: SeekFrom, current: u64, len: u64) -> FsResult<u64> {
    let (start, offset): (u64, i64) = match to {
        SeekFrom::Start(pos) => return Ok(pos),
        SeekFrom::Current(pos) => (current, pos),
        SeekFrom::End(pos) => (len, pos),
    };
    if offset < 0 {
        start
            .checked_sub(offset.unsigned_abs())
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "invalid seek").into())
    } else {
        Ok(start + offset as u64)
    }
}

/// Maps a resource failure onto the handler's error kinds, raising the
/// access-denied flag on the way.
fn fs_error(e: DavError, denied: &AtomicBool) -> FsError {
    if e.is_access_denied() {
        denied.store(true, Ordering::SeqCst);
    }
    match e {
        DavError::NotFound => FsError::NotFound,
        DavError::Conflict(_) | DavError::Forbidden(_) => FsError::Forbidden,
        DavError::PreconditionFailed(_) => FsError::GeneralFailure,
        DavError::Internal(ApiError::NotFound(_)) | DavError::Fatal(ApiError::NotFound(_)) => {
            FsError::NotFound
        }
        DavError::Internal(ApiError::AlreadyExists(_)) => FsError::Exists,
        DavError::Internal(ApiError::AccessDenied(_)) | DavError::Fatal(ApiError::AccessDenied(_)) => {
            FsError::Forbidden
        }
        DavError::Internal(_) | DavError::Fatal(_) => FsError::GeneralFailure,
    }
}

#[inline]
fn prop_name(p: &DavProp) -> PropertyName {
    PropertyName::new(p.namespace.as_deref().unwrap_or(""), &p.name)
}

#[inline]
fn is_exported(name: &PropertyName) -> bool {
    name.namespace == DAV_NS && EXPORTED_PROPS.contains(&name.name.as_str())
}

fn to_dav_prop(p: &DavProperty, do_content: bool) -> DavProp {
    DavProp {
        name: p.name.name.clone(),
        prefix: Some("D".to_string()),
        namespace: Some(p.name.namespace.clone()),
        xml: if do_content { Some(p.to_xml()) } else { None },
    }
}

#[inline]
fn clone_prop(p: &DavProp) -> DavProp {
    DavProp {
        name: p.name.clone(),
        namespace: p.namespace.clone(),
        prefix: p.prefix.clone(),
        xml: None,
    }
}
