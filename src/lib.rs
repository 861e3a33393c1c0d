// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//

#[macro_use]
extern crate log;

pub mod acl;
pub mod api;
pub mod config;
pub mod error;
pub mod factory;
pub mod fs;
pub mod ipfs;
pub mod locks;
pub mod mem;
pub mod props;
pub mod realm;
pub mod resource;
pub mod server;

pub use crate::api::FsApi;
pub use crate::error::{ApiError, ConfigError, DavError};
pub use crate::factory::{DavSession, ResourceFactory, ResourceLocator};
pub use crate::resource::{DavResource, InputContext};
pub use crate::server::DavServer;

/// Creates a WebDAV server over the given filesystem, open to anonymous requests.
pub fn make_server(api: Box<dyn FsApi>) -> DavServer {
    DavServer::new(api)
}
