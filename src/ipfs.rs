// Copyright 2022 Debox Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::executor::block_on;
use futures::TryStreamExt;
use ipfs_api_backend_hyper::request::{FilesLs, FilesRead, FilesWrite};
use ipfs_api_backend_hyper::{Error, IpfsApi as _, IpfsClient, TryFromUri};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::{spawn_blocking, JoinError, JoinHandle};

use crate::api::{concat_path, parent_path, ApiError, FsApi, FsPermission, FsReader, FsStatus, FsWriter};
use crate::error::ConfigError;

/// Ownership reported for MFS entities, which carry none of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpfsOwnership {
    pub owner: String,
    pub group: String,
    pub dir_mode: FsPermission,
    pub file_mode: FsPermission,
}

impl Default for IpfsOwnership {
    fn default() -> Self {
        IpfsOwnership {
            owner: "ipfs".to_string(),
            group: "ipfs".to_string(),
            dir_mode: FsPermission::DEFAULT_DIR,
            file_mode: FsPermission::DEFAULT_FILE,
        }
    }
}

impl IpfsOwnership {
    fn status(&self, path: String, is_dir: bool, len: u64) -> FsStatus {
        FsStatus {
            path,
            len: if is_dir { 0 } else { len },
            is_dir,
            // MFS keeps no modification time.
            modification_time: SystemTime::now(),
            owner: self.owner.clone(),
            group: self.group.clone(),
            permission: if is_dir { self.dir_mode } else { self.file_mode },
        }
    }
}

/// `FsApi` over the mutable file system (MFS) of an IPFS node, spoken to
/// through the IPFS RPC API.
pub struct IpfsApi {
    ipfs: IpfsClient,
    ownership: IpfsOwnership,
}

impl IpfsApi {
    /// Creates an instance talking to the default local RPC endpoint.
    pub fn new() -> Box<IpfsApi> {
        IpfsApi::from_ipfs_client(IpfsClient::default())
    }

    /// Creates an instance from an IPFS RPC API server URI.
    pub fn from_str(uri: &str) -> Result<Box<IpfsApi>, ConfigError> {
        let ipfs = IpfsClient::from_str(uri)
            .map_err(|e| ConfigError::BackendUri(format!("{}: {}", uri, e)))?;
        Ok(IpfsApi::from_ipfs_client(ipfs))
    }

    /// Creates an instance from a provided `IpfsClient`.
    pub fn from_ipfs_client(ipfs: IpfsClient) -> Box<IpfsApi> {
        Box::new(IpfsApi {
            ipfs,
            ownership: IpfsOwnership::default(),
        })
    }

    pub fn with_ownership(mut self: Box<Self>, ownership: IpfsOwnership) -> Box<IpfsApi> {
        self.ownership = ownership;
        self
    }

    async fn stat_entry(&self, path: &str) -> Result<FsStatus, ApiError> {
        let ipfs = self.ipfs.clone();
        let target = path.to_string();
        let stat = blocking(path, move || async move { ipfs.files_stat(&target).await }).await?;
        Ok(self
            .ownership
            .status(path.to_string(), stat.typ == "directory", stat.size))
    }
}

impl Debug for IpfsApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IpfsApi")
    }
}

#[async_trait]
impl FsApi for IpfsApi {
    async fn exists(&self, path: &str) -> Result<bool, ApiError> {
        match self.stat_entry(path).await {
            Ok(_) => Ok(true),
            Err(ApiError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn stat(&self, path: &str) -> Result<FsStatus, ApiError> {
        self.stat_entry(path).await
    }

    async fn ls(&self, path: &str) -> Result<Vec<FsStatus>, ApiError> {
        let status = self.stat_entry(path).await?;
        if !status.is_dir {
            return Ok(vec![status]);
        }
        let ipfs = self.ipfs.clone();
        let target = path.to_string();
        let res = blocking(path, move || async move {
            let req = FilesLs {
                path: Some(&target),
                long: Some(true),
                ..Default::default()
            };
            ipfs.files_ls_with_options(req).await
        })
        .await?;
        Ok(res
            .entries
            .iter()
            .map(|e| {
                self.ownership
                    .status(concat_path(path, &e.name), e.typ == 1, e.size)
            })
            .collect())
    }

    async fn open(&self, path: &str) -> Result<FsReader, ApiError> {
        if self.stat_entry(path).await?.is_dir {
            return Err(ApiError::IsDirectory(path.to_string()));
        }
        Ok(Box::pin(IpfsReader {
            ipfs: self.ipfs.clone(),
            path: path.to_string(),
            offset: 0,
            state: ReadState::Ready(Bytes::new()),
        }))
    }

    async fn create(&self, path: &str) -> Result<FsWriter, ApiError> {
        match self.stat_entry(path).await {
            Ok(status) if status.is_dir => return Err(ApiError::IsDirectory(path.to_string())),
            Ok(_) => {}
            Err(ApiError::NotFound(_)) => self.make_parents(path).await?,
            Err(e) => return Err(e),
        }
        Ok(Box::pin(IpfsWriter {
            ipfs: self.ipfs.clone(),
            path: path.to_string(),
            offset: 0,
            state: WriteState::Buffering(Vec::new()),
        }))
    }

    async fn create_new_file(&self, path: &str) -> Result<bool, ApiError> {
        if self.exists(path).await? {
            return Ok(false);
        }
        self.make_parents(path).await?;
        let ipfs = self.ipfs.clone();
        let target = path.to_string();
        blocking(path, move || async move { commit(&ipfs, &target, Bytes::new()).await }).await?;
        Ok(true)
    }

    async fn mkdirs(&self, path: &str) -> Result<bool, ApiError> {
        match self.stat_entry(path).await {
            Ok(status) => return Ok(status.is_dir),
            Err(ApiError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let ipfs = self.ipfs.clone();
        let target = path.to_string();
        match blocking(path, move || async move { ipfs.files_mkdir(&target, true).await }).await {
            Ok(()) => Ok(true),
            Err(ApiError::InvalidPath(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<bool, ApiError> {
        if path == "/" {
            return Ok(false);
        }
        let ipfs = self.ipfs.clone();
        let target = path.to_string();
        match blocking(path, move || async move { ipfs.files_rm(&target, recursive).await }).await {
            Ok(()) => Ok(true),
            Err(ApiError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn rename(&self, path: &str, dest: &str) -> Result<(), ApiError> {
        let ipfs = self.ipfs.clone();
        let (from, to) = (path.to_string(), dest.to_string());
        blocking(path, move || async move { ipfs.files_mv(&from, &to).await }).await
    }

    async fn copy(&self, path: &str, dest: &str) -> Result<(), ApiError> {
        let ipfs = self.ipfs.clone();
        let (from, to) = (path.to_string(), dest.to_string());
        blocking(path, move || async move { ipfs.files_cp(&from, &to).await }).await
    }
}

impl IpfsApi {
    async fn make_parents(&self, path: &str) -> Result<(), ApiError> {
        let parent = parent_path(path).ok_or_else(|| ApiError::InvalidPath(path.to_string()))?;
        if parent == "/" {
            return Ok(());
        }
        let ipfs = self.ipfs.clone();
        let target = parent.to_string();
        blocking(parent, move || async move { ipfs.files_mkdir(&target, true).await }).await
    }
}

/// Bytes fetched from MFS per read call.
const READ_CHUNK: usize = 256 * 1024;

/// Bytes collected before they are written to MFS.
const WRITE_CHUNK: usize = 1024 * 1024;

enum ReadState {
    Ready(Bytes),
    Fetching(JoinHandle<Result<Bytes, Error>>),
    Eof,
}

/// Reads a file from MFS in ranges of `READ_CHUNK` bytes, fetching the
/// next range once the previous one was consumed.
struct IpfsReader {
    ipfs: IpfsClient,
    path: String,
    offset: u64,
    state: ReadState,
}

impl AsyncRead for IpfsReader {
    fn poll_read(
        self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ReadState::Ready(chunk) if chunk.has_remaining() => {
                    let n = chunk.len().min(buf.remaining());
                    buf.put_slice(&chunk.split_to(n));
                    return Poll::Ready(Ok(()));
                }
                ReadState::Ready(_) => {
                    let ipfs = this.ipfs.clone();
                    let path = this.path.clone();
                    let offset = this.offset;
                    trace!("IPFS: read {} at {}", path, offset);
                    this.state = ReadState::Fetching(spawn_blocking(move || {
                        block_on(async { read_range(&ipfs, &path, offset).await })
                    }));
                }
                ReadState::Fetching(handle) => {
                    let chunk = match Pin::new(handle).poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(joined) => joined,
                    };
                    match chunk {
                        Ok(Ok(chunk)) if chunk.is_empty() => this.state = ReadState::Eof,
                        Ok(Ok(chunk)) => {
                            this.offset += chunk.len() as u64;
                            this.state = ReadState::Ready(chunk);
                        }
                        Ok(Err(e)) => {
                            this.state = ReadState::Eof;
                            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
                        }
                        Err(e) => {
                            this.state = ReadState::Eof;
                            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                        }
                    }
                }
                ReadState::Eof => return Poll::Ready(Ok(())),
            }
        }
    }
}

async fn read_range(ipfs: &IpfsClient, path: &str, offset: u64) -> Result<Bytes, Error> {
    let req = FilesRead {
        path,
        offset: Some(offset as i64),
        count: Some(READ_CHUNK as i64),
    };
    let data = ipfs
        .files_read_with_options(req)
        .map_ok(|chunk| chunk.to_vec())
        .try_concat()
        .await?;
    Ok(Bytes::from(data))
}

enum WriteState {
    Buffering(Vec<u8>),
    Writing(JoinHandle<Result<(), Error>>),
    Committing(JoinHandle<Result<(), Error>>),
    Done,
}

/// Writes a file to MFS in chunks of `WRITE_CHUNK` bytes. The first chunk
/// replaces whatever was there; shutdown writes the rest and flushes.
struct IpfsWriter {
    ipfs: IpfsClient,
    path: String,
    offset: u64,
    state: WriteState,
}

impl IpfsWriter {
    fn spawn_write(&mut self, data: Bytes, last: bool) -> JoinHandle<Result<(), Error>> {
        let ipfs = self.ipfs.clone();
        let path = self.path.clone();
        let offset = self.offset;
        self.offset += data.len() as u64;
        trace!("IPFS: write {} bytes to {} at {}", data.len(), path, offset);
        spawn_blocking(move || block_on(async { write_range(&ipfs, &path, offset, data, last).await }))
    }
}

impl AsyncWrite for IpfsWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                WriteState::Writing(handle) => {
                    let written = match Pin::new(handle).poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(joined) => joined_io(joined),
                    };
                    if let Err(e) = written {
                        this.state = WriteState::Done;
                        return Poll::Ready(Err(e));
                    }
                    this.state = WriteState::Buffering(Vec::new());
                }
                WriteState::Buffering(data) => {
                    data.extend_from_slice(buf);
                    if data.len() >= WRITE_CHUNK {
                        let chunk = Bytes::from(std::mem::take(data));
                        let handle = this.spawn_write(chunk, false);
                        this.state = WriteState::Writing(handle);
                    }
                    return Poll::Ready(Ok(buf.len()));
                }
                _ => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "write after shutdown",
                    )))
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                WriteState::Writing(handle) => {
                    let written = match Pin::new(handle).poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(joined) => joined_io(joined),
                    };
                    if let Err(e) = written {
                        this.state = WriteState::Done;
                        return Poll::Ready(Err(e));
                    }
                    this.state = WriteState::Buffering(Vec::new());
                }
                WriteState::Buffering(data) => {
                    let chunk = Bytes::from(std::mem::take(data));
                    let handle = this.spawn_write(chunk, true);
                    this.state = WriteState::Committing(handle);
                }
                WriteState::Committing(handle) => {
                    let result = match Pin::new(handle).poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(joined) => joined_io(joined),
                    };
                    this.state = WriteState::Done;
                    return Poll::Ready(result);
                }
                WriteState::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

fn joined_io(joined: Result<Result<(), Error>, JoinError>) -> io::Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}

/// Writes `data` at `offset`, creating the file. The write at offset zero
/// truncates; the last one is followed by a flush.
async fn write_range(
    ipfs: &IpfsClient, path: &str, offset: u64, data: Bytes, last: bool,
) -> Result<(), Error> {
    let req = FilesWrite {
        path,
        create: Some(true),
        truncate: Some(offset == 0),
        offset: Some(offset as i64),
        flush: Some(false),
        ..Default::default()
    };
    ipfs.files_write_with_options(req, data.reader()).await?;
    if last {
        ipfs.files_flush(Some(path)).await?;
    }
    Ok(())
}

async fn commit(ipfs: &IpfsClient, path: &str, data: Bytes) -> Result<(), Error> {
    write_range(ipfs, path, 0, data, true).await
}

/// Runs an MFS call off the async runtime and classifies its failure.
async fn blocking<T, C, F>(path: &str, call: C) -> Result<T, ApiError>
where
    T: Send + 'static,
    C: FnOnce() -> F + Send + 'static,
    F: Future<Output = Result<T, Error>>,
{
    spawn_blocking(move || block_on(call()))
        .await
        .map_err(|e| ApiError::Backend(e.to_string()))?
        .map_err(|e| classify(path, &e.to_string()))
}

/// Maps an RPC error message onto the backend error kinds.
fn classify(path: &str, message: &str) -> ApiError {
    let lower = message.to_lowercase();
    if lower.contains("does not exist") || lower.contains("no link named") {
        ApiError::NotFound(path.to_string())
    } else if lower.contains("already exists") || lower.contains("already has entry") {
        ApiError::AlreadyExists(path.to_string())
    } else if lower.contains("not a directory") {
        ApiError::InvalidPath(format!("{}: {}", path, message))
    } else if lower.contains("is a directory") || lower.contains("not a file") {
        ApiError::IsDirectory(path.to_string())
    } else {
        ApiError::Backend(format!("{}: {}", path, message))
    }
}
