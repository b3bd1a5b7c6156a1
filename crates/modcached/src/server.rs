//! HTTP front-end: request parsing, routing, the pass-through monitor and
//! cached-only serving.
//!
//! Pass-through requests are answered with a 301 to the canonical upstream
//! while the cache populates in the background; cached-only requests are
//! served synchronously out of the local mirrors.

use bytes::Bytes;
use camino::Utf8PathBuf;
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::archive::{self, Artifact, Ext};
use crate::discover::{UPSTREAM_HOST, UPSTREAM_SCHEME};
use crate::ident;
use crate::populate::Populator;
use crate::version;

pub type Body = BoxBody<Bytes, std::io::Error>;

pub struct ProxyServer {
    /// URL prefix with leading and trailing slash, e.g. `/modules/`.
    prefix: String,
    cached_prefix: String,
    populator: Arc<Populator>,
}

impl ProxyServer {
    pub fn new(prefix: &str, workdir: Utf8PathBuf) -> std::io::Result<Self> {
        let mut prefix = prefix.to_string();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let cached_prefix = format!("{prefix}cached-only/");
        let populator = Arc::new(Populator::new(workdir)?);
        Ok(ProxyServer {
            prefix,
            cached_prefix,
            populator,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response<Body> {
        let path = req.uri().path().to_string();
        if let Some(rest) = path.strip_prefix(&self.cached_prefix) {
            return self.serve_cached_only(rest).await;
        }
        if let Some(rest) = path.strip_prefix(&self.prefix) {
            return self.monitor_fetch(&req, rest);
        }
        text_response(StatusCode::NOT_FOUND, "404 page not found")
    }

    /// Pass-through mode: schedule background population for artifact
    /// requests, then redirect everything to upstream.
    fn monitor_fetch(&self, req: &Request<Incoming>, rest: &str) -> Response<Body> {
        let (escaped_module_path, prop) = match parse_request(rest) {
            Ok(parsed) => parsed,
            Err(response) => return response,
        };

        if let Some((_, ver)) = Ext::from_property(prop) {
            let key = rest[..rest.len() - (prop.len() - ver.len())].to_string();
            let Some(module_path) = ident::unescape_path(escaped_module_path) else {
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("invalid escaped module path {escaped_module_path}"),
                );
            };
            if ident::check_module_path_ver(&module_path, ver).is_none() {
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("module path/ver {module_path}[{ver}] is invalid or not supported"),
                );
            }
            self.populator.process_request(
                key,
                escaped_module_path.to_string(),
                module_path,
                ver.to_string(),
            );
        } else if prop != "latest" && prop != "list" {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Invalid URL path: {rest}"),
            );
        }
        // `latest` and `list` are purely upstream's business.

        redirect_to_upstream(req)
    }

    /// Cached-only mode: explicit versions only, served synchronously.
    async fn serve_cached_only(&self, rest: &str) -> Response<Body> {
        let (escaped_module_path, prop) = match parse_request(rest) {
            Ok(parsed) => parsed,
            Err(response) => return response,
        };
        let Some((ext, ver)) = Ext::from_property(prop) else {
            // No @latest or version lists here: dependents must pin.
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Invalid URL path: {rest}"),
            );
        };
        let Some(module_path) = ident::unescape_path(escaped_module_path) else {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("invalid escaped module path {escaped_module_path}"),
            );
        };
        let Some(pv) = ident::check_module_path_ver(&module_path, ver) else {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("module path/ver {module_path}[{ver}] is invalid or not supported"),
            );
        };
        let Some(canonical) = version::canonical(ver) else {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("invalid version {ver}"),
            );
        };

        let artifact = archive::serve_cached(
            self.populator.workdir(),
            &pv.path,
            &pv.major,
            &canonical,
            ext,
            pv.incompatible,
        )
        .await;
        match artifact {
            Ok(Artifact::Buffered(data)) => {
                let mut response = Response::new(full_body(data));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, ext.content_type().parse().unwrap());
                response
            }
            Ok(Artifact::File(file, len)) => {
                let file = tokio::fs::File::from_std(file);
                let stream = ReaderStream::new(file).map_ok(Frame::data);
                let mut response = Response::new(BoxBody::new(StreamBody::new(stream)));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, ext.content_type().parse().unwrap());
                response.headers_mut().insert(CONTENT_LENGTH, len.into());
                response
            }
            Err(err) => {
                debug!(module = %module_path, version = %ver, error = %err, "cached-only serve failed");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
            }
        }
    }
}

/// Split a routed path into (escaped module path, property).
///
/// Accepted shapes: `<path>/@v/<prop>` and `<path>/@latest`; the checksum
/// database is explicitly not served.
fn parse_request(path: &str) -> Result<(&str, &str), Response<Body>> {
    if path.starts_with("sumdb/") {
        return Err(text_response(StatusCode::NOT_FOUND, "not found"));
    }
    if let Some((module, prop)) = path.split_once("/@v/") {
        return Ok((module, prop));
    }
    if let Some(module) = path.strip_suffix("/@latest") {
        return Ok((module, "latest"));
    }
    Err(text_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &format!("Unsupported URL path: {path}"),
    ))
}

/// The canonical upstream URL for a request: scheme and host swapped, the
/// request path (local prefix included) and query kept as-is.
fn upstream_redirect_target(path_and_query: &str) -> String {
    format!("{UPSTREAM_SCHEME}://{UPSTREAM_HOST}{path_and_query}")
}

fn redirect_to_upstream(req: &Request<Incoming>) -> Response<Body> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = upstream_redirect_target(path_and_query);
    let mut response = text_response(StatusCode::MOVED_PERMANENTLY, "Moved Permanently");
    match location.parse() {
        Ok(value) => {
            response.headers_mut().insert(LOCATION, value);
        }
        Err(_) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("cannot redirect {path_and_query} upstream"),
            )
        }
    }
    response
}

fn full_body(data: impl Into<Bytes>) -> Body {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        "text/plain; charset=utf-8".parse().unwrap(),
    );
    response
}
