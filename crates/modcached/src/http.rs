//! Outbound HTTP: one shared HTTPS client plus GET helpers.
//!
//! Every call carries a deadline. The legacy client does not follow
//! redirects on its own, and `?go-get=1` endpoints redirect routinely, so
//! a small manual redirect loop lives here.

use hyper::body::Incoming;
use hyper::header::LOCATION;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

type HttpsConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

/// Deadline for upstream and direct discovery fetches.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid URI: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),

    #[error("HTTP request failed: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("HTTP error {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("HTTP builder error: {0}")]
    Builder(#[from] hyper::http::Error),

    #[error("invalid UTF-8 in response body")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("HTTP error {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("request to {url} did not finish within {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("too many redirects fetching {url}")]
    TooManyRedirects { url: String },
}

/// Get the shared HTTPS client instance.
fn client() -> &'static Client<HttpsConnector, String> {
    static CLIENT: OnceLock<Client<HttpsConnector, String>> = OnceLock::new();
    CLIENT.get_or_init(|| {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("failed to load native roots")
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        Client::builder(TokioExecutor::new()).build(https)
    })
}

/// Resolve a `Location` header against the URI it came from.
/// Handles absolute and root-relative targets; anything else is refused.
fn resolve_location(base: &Uri, location: &str) -> Option<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Some(location.to_string());
    }
    if location.starts_with('/') {
        let scheme = base.scheme_str()?;
        let authority = base.authority()?;
        return Some(format!("{scheme}://{authority}{location}"));
    }
    None
}

/// GET with a deadline, following up to [`MAX_REDIRECTS`] redirects.
pub async fn get(url: &str, timeout: Duration) -> Result<Response<Incoming>, HttpError> {
    let fetch = async {
        let mut target = url.to_string();
        for _ in 0..MAX_REDIRECTS {
            let uri: Uri = target.parse()?;
            let req = Request::builder().uri(uri.clone()).body(String::new())?;
            let response = client().request(req).await?;

            if response.status().is_redirection() {
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|loc| resolve_location(&uri, loc));
                if let Some(next) = next {
                    target = next;
                    continue;
                }
            }
            return Ok(response);
        }
        Err(HttpError::TooManyRedirects {
            url: url.to_string(),
        })
    };

    match tokio::time::timeout(timeout, fetch).await {
        Ok(result) => result,
        Err(_) => Err(HttpError::Timeout {
            url: url.to_string(),
            timeout,
        }),
    }
}

/// GET and collect the full response body; a non-2xx status is an error
/// carrying the body text.
pub async fn get_bytes(url: &str, timeout: Duration) -> Result<Vec<u8>, HttpError> {
    use http_body_util::BodyExt;

    let collect = async {
        let response = get(url, timeout).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            return Err(HttpError::Status {
                status,
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        Ok(body.to_vec())
    };

    match tokio::time::timeout(timeout, collect).await {
        Ok(result) => result,
        Err(_) => Err(HttpError::Timeout {
            url: url.to_string(),
            timeout,
        }),
    }
}

/// GET and collect the response as a UTF-8 string.
pub async fn get_text(url: &str, timeout: Duration) -> Result<String, HttpError> {
    let bytes = get_bytes(url, timeout).await?;
    let text = String::from_utf8(bytes)?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_resolution() {
        let base: Uri = "https://example.com/a/b?go-get=1".parse().unwrap();
        assert_eq!(
            resolve_location(&base, "https://other.com/x").as_deref(),
            Some("https://other.com/x")
        );
        assert_eq!(
            resolve_location(&base, "/moved").as_deref(),
            Some("https://example.com/moved")
        );
        assert_eq!(resolve_location(&base, "relative/path"), None);
    }
}
