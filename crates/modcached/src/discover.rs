//! Repository discovery for modules the cache has never seen: first the
//! upstream proxy's `@latest` metadata, then the module host's own
//! `?go-get=1` page with its `go-import` meta tags.

use thiserror::Error;
use tracing::{info, warn};

use crate::http::{self, FETCH_TIMEOUT};
use crate::types::{MetaImport, RevInfo};

/// Canonical upstream proxy.
pub const UPSTREAM_SCHEME: &str = "https";
pub const UPSTREAM_HOST: &str = "proxy.golang.org";
pub const UPSTREAM: &str = "https://proxy.golang.org";

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error(transparent)]
    Http(#[from] http::HttpError),

    #[error("failed to decode upstream revision info: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("not found")]
    NotFound,
}

/// Ask the upstream proxy what it knows about a module.
pub async fn check_upstream(escaped_module_path: &str) -> Result<RevInfo, DiscoverError> {
    let url = format!("{UPSTREAM}/{escaped_module_path}/@latest");
    let body = http::get_bytes(&url, FETCH_TIMEOUT).await?;
    let info: RevInfo = serde_json::from_slice(&body)?;
    Ok(info)
}

/// Fetch `https://<module-path>?go-get=1` and scan it for go-import metas.
async fn check_direct(module_path: &str) -> Result<Vec<MetaImport>, DiscoverError> {
    let url = format!("https://{module_path}?go-get=1");
    info!(module = %module_path, "trying direct discovery");
    let body = http::get_text(&url, FETCH_TIMEOUT).await?;
    Ok(scan_meta_imports(&body))
}

/// Walk `module_path` upward, one trailing segment at a time, until a
/// `?go-get=1` fetch succeeds. Returns the path that answered plus its
/// imports.
pub async fn search_direct(module_path: &str) -> Result<(String, Vec<MetaImport>), DiscoverError> {
    let mut path = module_path;
    loop {
        match check_direct(path).await {
            Ok(imports) => return Ok((path.to_string(), imports)),
            Err(err) => {
                warn!(module = %path, error = %err, "direct discovery failed, continue trying");
            }
        }
        match path.rfind('/') {
            Some(idx) => path = &path[..idx],
            None => return Err(DiscoverError::NotFound),
        }
    }
}

/// Pull `<meta name="go-import" content="PREFIX VCS REPOROOT">` tags out of
/// an HTML page.
///
/// The scan is deliberately permissive: it walks raw tags without building
/// a tree, stops at the first `<body>` start or `</head>` end, and accepts
/// any meta whose content has exactly three space-separated fields.
pub fn scan_meta_imports(html: &str) -> Vec<MetaImport> {
    let mut imports = Vec::new();
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        rest = &rest[open + 1..];
        if let Some(after) = rest.strip_prefix("!--") {
            // Comment: skip to the closing marker, or give up on the page.
            match after.find("-->") {
                Some(end) => {
                    rest = &after[end + 3..];
                    continue;
                }
                None => break,
            }
        }
        let Some(close) = rest.find('>') else { break };
        let tag = rest[..close].trim().trim_end_matches('/');
        rest = &rest[close + 1..];

        let (name, attrs) = match tag.find(|c: char| c.is_ascii_whitespace()) {
            Some(idx) => (&tag[..idx], &tag[idx..]),
            None => (tag, ""),
        };
        if name.eq_ignore_ascii_case("body") || name.eq_ignore_ascii_case("/head") {
            break;
        }
        if !name.eq_ignore_ascii_case("meta") {
            continue;
        }
        if attr_value(attrs, "name").as_deref() != Some("go-import") {
            continue;
        }
        let Some(content) = attr_value(attrs, "content") else {
            continue;
        };
        let fields: Vec<&str> = content.split_ascii_whitespace().collect();
        if let [prefix, vcs, repo_root] = fields[..] {
            imports.push(MetaImport {
                prefix: prefix.to_string(),
                vcs: vcs.to_string(),
                repo_root: repo_root.to_string(),
            });
        }
    }
    imports
}

/// Find an attribute by (case-insensitive) name in a raw attribute string.
fn attr_value(attrs: &str, wanted: &str) -> Option<String> {
    let mut rest = attrs;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return None;
        }
        let name_end = rest
            .find(|c: char| c == '=' || c.is_ascii_whitespace())
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        rest = rest[name_end..].trim_start();

        let mut value = String::new();
        if let Some(after_eq) = rest.strip_prefix('=') {
            let after_eq = after_eq.trim_start();
            if let Some(quote) = after_eq.chars().next().filter(|&c| c == '"' || c == '\'') {
                let inner = &after_eq[1..];
                match inner.find(quote) {
                    Some(end) => {
                        value = inner[..end].to_string();
                        rest = &inner[end + 1..];
                    }
                    None => {
                        value = inner.to_string();
                        rest = "";
                    }
                }
            } else {
                let end = after_eq
                    .find(|c: char| c.is_ascii_whitespace())
                    .unwrap_or(after_eq.len());
                value = after_eq[..end].to_string();
                rest = &after_eq[end..];
            }
        }

        if name.eq_ignore_ascii_case(wanted) {
            return Some(value);
        }
    }
}
