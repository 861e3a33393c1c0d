// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use log::info;

use dfs_webdav::config::Config;
use dfs_webdav::DavServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::parse();
    let server = Arc::new(DavServer::from_config(&config).context("invalid configuration")?);
    let addr = config.socket_addr();

    let make_service = make_service_fn(move |_| {
        let server = server.clone();
        async move {
            let func = move |req| {
                let server = server.clone();
                async move { Ok::<_, Infallible>(server.handle(req).await) }
            };
            Ok::<_, Infallible>(service_fn(func))
        }
    });

    info!("serving {} on http://{}{}/", config.fs, addr, config.prefix());
    hyper::Server::try_bind(&addr)
        .with_context(|| format!("unable to bind {}", addr))?
        .serve(make_service)
        .await?;
    Ok(())
}
