// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::acl::Identity;
use crate::api::FsApi;
use crate::error::ConfigError;
use crate::ipfs::{IpfsApi, IpfsOwnership};
use crate::mem::MemApi;
use crate::realm::UserRealm;

/// Backend name selecting the in-memory filesystem.
pub const MEM_BACKEND: &str = "mem";

/// Command line of the gateway.
#[derive(Debug, Clone, Parser)]
#[command(name = "dfs-webdav", version, about = "WebDAV gateway to a distributed filesystem")]
pub struct Config {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    pub listen: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 19800)]
    pub port: u16,

    /// IPFS RPC API URI, or `mem` for an in-memory filesystem
    #[arg(short = 'n', long = "fs", default_value = "http://127.0.0.1:5001")]
    pub fs: String,

    /// URL path under which resources are served
    #[arg(long, default_value = "")]
    pub prefix: String,

    /// Hash-realm file with `user: password[, group ...]` entries
    #[arg(long)]
    pub realm: Option<PathBuf>,

    /// Value of the WWW-Authenticate header sent with 401 responses
    #[arg(long, default_value = "Basic realm=\"dfs-webdav\"")]
    pub authenticate_header: String,

    /// Identity of requests when no realm is configured
    #[arg(long, default_value = "anonymous")]
    pub user: String,

    /// Groups of the anonymous identity (repeatable)
    #[arg(long = "group")]
    pub groups: Vec<String>,

    /// Owner reported for IPFS entries
    #[arg(long, default_value = "ipfs")]
    pub owner: String,

    /// Group reported for IPFS entries
    #[arg(long, default_value = "ipfs")]
    pub owner_group: String,
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    /// Resource path prefix with a leading slash and no trailing one; empty for the root.
    pub fn prefix(&self) -> String {
        let trimmed = self.prefix.trim().trim_end_matches('/');
        if trimmed.is_empty() || trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        }
    }

    pub fn anonymous(&self) -> Identity {
        Identity::new(self.user.as_str(), self.groups.iter().cloned())
    }

    pub fn ownership(&self) -> IpfsOwnership {
        IpfsOwnership {
            owner: self.owner.clone(),
            group: self.owner_group.clone(),
            ..IpfsOwnership::default()
        }
    }

    pub fn backend(&self) -> Result<Box<dyn FsApi>, ConfigError> {
        if self.fs == MEM_BACKEND {
            return Ok(MemApi::new());
        }
        Ok(IpfsApi::from_str(&self.fs)?.with_ownership(self.ownership()))
    }

    pub fn user_realm(&self) -> Result<Option<UserRealm>, ConfigError> {
        self.realm.as_ref().map(UserRealm::load).transpose()
    }
}
