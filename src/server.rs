// Copyright 2022-2023 Debox Network
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
use std::sync::atomic::Ordering;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::{ALLOW, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use webdav_handler::body::Body;
use webdav_handler::{DavConfig, DavHandler};
use xmltree::XMLNode;

use crate::acl::Identity;
use crate::api::FsApi;
use crate::config::Config;
use crate::error::ConfigError;
use crate::factory::{DavSession, ResourceFactory, ResourceLocator};
use crate::fs::GatewayFs;
use crate::locks::LockRegistry;
use crate::props::{dav_child, dav_element, write_xml};
use crate::realm::UserRealm;
use crate::resource::SUPPORTED_METHODS;

/// Answer given when the backend refused access to the requester.
pub const ACCESS_DENIED_MESSAGE: &str = "Can't access to resource. You don't have permissions.";

const DEFAULT_AUTHENTICATE: &str = "Basic realm=\"dfs-webdav\"";

const DEPTH: &str = "depth";
const DESTINATION: &str = "destination";

/// Locking on top of the advertised methods.
const LOCK_METHODS: [&str; 2] = ["LOCK", "UNLOCK"];

/// Front door of the gateway: resolves the requester, builds the
/// per-request filesystem view and hands the request to the WebDAV handler.
pub struct DavServer {
    handler: DavHandler,
    factory: ResourceFactory,
    prefix: String,
    realm: Option<UserRealm>,
    anonymous: Identity,
    authenticate: String,
}

impl DavServer {
    pub fn new(api: Box<dyn FsApi>) -> Self {
        let locks = LockRegistry::new();
        let handler = DavHandler::builder()
            .locksystem(Box::new(locks.clone()))
            .build_handler();
        DavServer {
            handler,
            factory: ResourceFactory::new(api, locks),
            prefix: String::new(),
            realm: None,
            anonymous: Identity::new("anonymous", Vec::<String>::new()),
            authenticate: DEFAULT_AUTHENTICATE.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut server = DavServer::new(config.backend()?)
            .with_prefix(&config.prefix())
            .with_anonymous(config.anonymous())
            .with_authenticate_header(&config.authenticate_header);
        if let Some(realm) = config.user_realm()? {
            server = server.with_realm(realm);
        }
        Ok(server)
    }

    /// Serves resources below `prefix`, which must have no trailing slash.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Requires HTTP Basic credentials known to `realm`.
    pub fn with_realm(mut self, realm: UserRealm) -> Self {
        self.realm = Some(realm);
        self
    }

    /// Identity of every request while no realm is configured.
    pub fn with_anonymous(mut self, identity: Identity) -> Self {
        self.anonymous = identity;
        self
    }

    pub fn with_authenticate_header(mut self, value: &str) -> Self {
        self.authenticate = value.to_string();
        self
    }

    pub fn factory(&self) -> &ResourceFactory {
        &self.factory
    }

    pub async fn handle(&self, req: Request<hyper::Body>) -> Response<Body> {
        if !is_supported(req.method()) {
            debug!("{} {}: method not allowed", req.method(), req.uri().path());
            return method_not_allowed();
        }
        let identity = match self.identify(&req) {
            Some(identity) => identity,
            None => return self.unauthorized(),
        };
        debug!("{} {} as {}", req.method(), req.uri().path(), identity.user);

        let href = req.uri().path().to_string();
        let session = DavSession::new(identity);
        let factory = self.factory.for_session(&session);
        if let Some(res) = self.shallow_collection_copy(&req, &factory, &session).await {
            return res;
        }

        let fs = GatewayFs::new(factory, session.clone(), &self.prefix)
            .with_content_length(content_length(&req));
        let denied = fs.access_denied();
        let mut config = DavConfig::new()
            .filesystem(fs)
            .principal(session.identity().user.clone());
        if !self.prefix.is_empty() {
            config = config.strip_prefix(self.prefix.clone());
        }

        let res = self.handler.handle_with(config, req).await;
        if denied.load(Ordering::SeqCst) {
            info!("access to {} denied for {}", href, session.identity().user);
            return access_denied(&href);
        }
        res
    }

    /// The handler copies a collection at depth 0 by creating an empty one
    /// at the destination. Such copies are refused here instead, through the
    /// resource layer.
    async fn shallow_collection_copy<B>(
        &self, req: &Request<B>, factory: &ResourceFactory, session: &DavSession,
    ) -> Option<Response<Body>> {
        if req.method().as_str() != "COPY" || !is_depth_zero(req) {
            return None;
        }
        let source = factory
            .create_resource(&self.locate(req.uri().path())?, session)
            .ok()?;
        if !source.is_collection().await {
            return None;
        }
        let dest: Uri = req.headers().get(DESTINATION)?.to_str().ok()?.parse().ok()?;
        let dest = factory
            .create_resource(&self.locate(dest.path())?, session)
            .ok()?;

        debug!("shallow copy of collection {} to {}", source.path(), dest.path());
        match source.copy(&dest, true).await {
            Ok(()) => Some(status_response(StatusCode::CREATED)),
            Err(e) if e.is_access_denied() => Some(access_denied(req.uri().path())),
            Err(e) => Some(status_response(e.status())),
        }
    }

    /// Locator of a request path, `None` when it lies outside the prefix.
    fn locate(&self, path: &str) -> Option<ResourceLocator> {
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        Some(ResourceLocator::new(&self.prefix, rest))
    }

    fn identify<B>(&self, req: &Request<B>) -> Option<Identity> {
        let realm = match &self.realm {
            None => return Some(self.anonymous.clone()),
            Some(realm) => realm,
        };
        let (user, password) = basic_credentials(req)?;
        realm.authenticate(&user, &password)
    }

    fn unauthorized(&self) -> Response<Body> {
        let mut res = Response::new(Body::from("Unauthorized"));
        *res.status_mut() = StatusCode::UNAUTHORIZED;
        if let Ok(value) = HeaderValue::from_str(&self.authenticate) {
            res.headers_mut().insert(WWW_AUTHENTICATE, value);
        }
        res
    }
}

fn is_supported(method: &Method) -> bool {
    SUPPORTED_METHODS
        .split(',')
        .map(str::trim)
        .chain(LOCK_METHODS)
        .any(|m| m == method.as_str())
}

fn basic_credentials<B>(req: &Request<B>) -> Option<(String, String)> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn is_depth_zero<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(DEPTH)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.trim() == "0")
}

fn content_length<B>(req: &Request<B>) -> Option<u64> {
    req.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = status;
    res
}

fn method_not_allowed() -> Response<Body> {
    let mut res = Response::new(Body::from("Method Not Allowed"));
    *res.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
    let allow = format!("{}, {}", SUPPORTED_METHODS, LOCK_METHODS.join(", "));
    if let Ok(value) = HeaderValue::from_str(&allow) {
        res.headers_mut().insert(ALLOW, value);
    }
    res
}

fn access_denied(href: &str) -> Response<Body> {
    let mut response = dav_child("response");
    for (name, text) in [
        ("href", href),
        ("status", "HTTP/1.1 401 Unauthorized"),
        ("responsedescription", ACCESS_DENIED_MESSAGE),
    ] {
        let mut elem = dav_child(name);
        elem.children.push(XMLNode::Text(text.to_string()));
        response.children.push(XMLNode::Element(elem));
    }
    let mut multistatus = dav_element("multistatus");
    multistatus.children.push(XMLNode::Element(response));

    let mut res = Response::new(Body::from(Bytes::from(write_xml(&multistatus, true))));
    *res.status_mut() = StatusCode::MULTI_STATUS;
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    res
}
