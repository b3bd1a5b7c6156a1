//! Wire types for the module-distribution protocol.
//!
//! The protocol's JSON uses capitalized keys; decoding is lenient because
//! upstream omits most fields most of the time.

use serde::{Deserialize, Serialize};

/// Provenance of a resolved module version, as advertised by upstream.
///
/// Only `vcs`, `url` and `subdir` are consumed here; the rest is carried
/// so upstream responses round-trip into the logs intact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Origin {
    #[serde(default, rename = "VCS", skip_serializing_if = "String::is_empty")]
    pub vcs: String,

    #[serde(default, rename = "URL", skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(default, rename = "Subdir", skip_serializing_if = "String::is_empty")]
    pub subdir: String,

    #[serde(default, rename = "TagPrefix", skip_serializing_if = "String::is_empty")]
    pub tag_prefix: String,

    #[serde(default, rename = "TagSum", skip_serializing_if = "String::is_empty")]
    pub tag_sum: String,

    #[serde(default, rename = "Ref", skip_serializing_if = "String::is_empty")]
    pub reference: String,

    #[serde(default, rename = "Hash", skip_serializing_if = "String::is_empty")]
    pub hash: String,

    #[serde(default, rename = "RepoSum", skip_serializing_if = "String::is_empty")]
    pub repo_sum: String,
}

/// A single revision in a module repository.
///
/// Serialized as the body of `.info` responses; deserialized from the
/// upstream `@latest` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevInfo {
    #[serde(default, rename = "Version")]
    pub version: String,

    /// Commit time, RFC 3339 in UTC.
    #[serde(default, rename = "Time", skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    #[serde(default, rename = "Origin", skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

/// A parsed `<meta name="go-import" content="prefix vcs reporoot">` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaImport {
    pub prefix: String,
    pub vcs: String,
    pub repo_root: String,
}
