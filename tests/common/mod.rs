// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use dfs_webdav::acl::Identity;
use dfs_webdav::api::{ApiError, FsApi, FsReader, FsStatus, FsWriter};
use dfs_webdav::locks::LockRegistry;
use dfs_webdav::mem::MemApi;
use dfs_webdav::{DavResource, DavSession, ResourceFactory, ResourceLocator};

/// Misbehaviour a `FaultyApi` can be told to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `exists` fails.
    Exists,
    /// `stat` fails.
    Stat,
    /// `ls` fails.
    Ls,
    /// `create_new_file` answers `false`.
    CreateNewFileRefused,
    /// `mkdirs` answers `false`.
    MkdirsRefused,
    /// `delete` answers `false`.
    NotRemoved,
}

/// `MemApi` wrapper that records calls and injects failures.
#[derive(Debug, Clone)]
pub struct FaultyApi {
    inner: Box<MemApi>,
    faults: Arc<Mutex<HashSet<Fault>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FaultyApi {
    pub fn new(inner: Box<MemApi>) -> Self {
        FaultyApi {
            inner,
            faults: Arc::default(),
            calls: Arc::default(),
        }
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().insert(fault);
    }

    pub fn heal(&self) {
        self.faults.lock().clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: &str, path: &str) {
        self.calls.lock().push(format!("{} {}", call, path));
    }

    fn has(&self, fault: Fault) -> bool {
        self.faults.lock().contains(&fault)
    }
}

fn injected(path: &str) -> ApiError {
    ApiError::Backend(format!("injected failure on {}", path))
}

#[async_trait]
impl FsApi for FaultyApi {
    async fn exists(&self, path: &str) -> Result<bool, ApiError> {
        self.record("exists", path);
        if self.has(Fault::Exists) {
            return Err(injected(path));
        }
        self.inner.exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FsStatus, ApiError> {
        self.record("stat", path);
        if self.has(Fault::Stat) {
            return Err(injected(path));
        }
        self.inner.stat(path).await
    }

    async fn ls(&self, path: &str) -> Result<Vec<FsStatus>, ApiError> {
        self.record("ls", path);
        if self.has(Fault::Ls) {
            return Err(injected(path));
        }
        self.inner.ls(path).await
    }

    async fn open(&self, path: &str) -> Result<FsReader, ApiError> {
        self.record("open", path);
        self.inner.open(path).await
    }

    async fn create(&self, path: &str) -> Result<FsWriter, ApiError> {
        self.record("create", path);
        self.inner.create(path).await
    }

    async fn create_new_file(&self, path: &str) -> Result<bool, ApiError> {
        self.record("create_new_file", path);
        if self.has(Fault::CreateNewFileRefused) {
            return Ok(false);
        }
        self.inner.create_new_file(path).await
    }

    async fn mkdirs(&self, path: &str) -> Result<bool, ApiError> {
        self.record("mkdirs", path);
        if self.has(Fault::MkdirsRefused) {
            return Ok(false);
        }
        self.inner.mkdirs(path).await
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<bool, ApiError> {
        self.record("delete", path);
        if self.has(Fault::NotRemoved) {
            return Ok(false);
        }
        self.inner.delete(path, recursive).await
    }

    async fn rename(&self, path: &str, dest: &str) -> Result<(), ApiError> {
        self.record("rename", path);
        self.inner.rename(path, dest).await
    }

    async fn copy(&self, path: &str, dest: &str) -> Result<(), ApiError> {
        self.record("copy", path);
        self.inner.copy(path, dest).await
    }
}

/// Factory over a fresh in-memory filesystem, plus handles to poke at it.
pub fn setup() -> (ResourceFactory, FaultyApi, Box<MemApi>) {
    let mem = MemApi::new();
    let api = FaultyApi::new(mem.clone());
    let factory = ResourceFactory::new(Box::new(api.clone()), LockRegistry::new());
    (factory, api, mem)
}

pub fn session(user: &str, groups: &[&str]) -> DavSession {
    DavSession::new(Identity::new(user, groups.iter().copied()))
}

pub fn resource(factory: &ResourceFactory, session: &DavSession, path: &str) -> DavResource {
    factory
        .create_resource(&ResourceLocator::new("", path), session)
        .unwrap()
}

pub fn collection_request(
    factory: &ResourceFactory, session: &DavSession, path: &str,
) -> DavResource {
    factory
        .create_resource_for_request(&ResourceLocator::new("", path), session, true)
        .unwrap()
}
