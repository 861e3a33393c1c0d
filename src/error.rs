// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//

use std::io;

use http::StatusCode;
use thiserror::Error;

/// Failure reported by a filesystem backend.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    AccessDenied(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("backend failure: {0}")]
    Backend(String),
}

/// Failure of a resource operation, mapped at the resource boundary.
///
/// `Fatal` covers the calls (existence checks, metadata, listing, parent
/// resolution) whose failures cannot be expressed as a protocol status at
/// the call site; the front door turns them into a generic server error.
#[derive(Debug, Error)]
pub enum DavError {
    #[error("resource not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("internal server error: {0}")]
    Internal(#[source] ApiError),

    #[error("unrecoverable backend failure: {0}")]
    Fatal(#[source] ApiError),
}

impl DavError {
    /// HTTP status the error is rendered as.
    pub fn status(&self) -> StatusCode {
        match self {
            DavError::NotFound => StatusCode::NOT_FOUND,
            DavError::Conflict(_) => StatusCode::CONFLICT,
            DavError::Forbidden(_) => StatusCode::FORBIDDEN,
            DavError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            DavError::Internal(_) | DavError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the underlying cause is a backend access-control violation.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            DavError::Internal(ApiError::AccessDenied(_)) | DavError::Fatal(ApiError::AccessDenied(_))
        )
    }
}

/// Failure while loading gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("malformed realm entry at line {line}: {text}")]
    RealmEntry { line: usize, text: String },

    #[error("invalid backend uri: {0}")]
    BackendUri(String),
}
