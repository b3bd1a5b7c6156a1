//! modcached - caching proxy for the Go module-distribution protocol.
//!
//! The daemon serves the well-known module proxy URL scheme out of locally
//! mirrored bare git repositories. In pass-through mode requests are
//! redirected to the canonical upstream while the cache populates in the
//! background; under `cached-only/` the `.info`, `.mod` and `.zip`
//! artifacts are assembled synchronously from the mirrors.

pub mod archive;
pub mod discover;
pub mod http;
pub mod ident;
pub mod populate;
pub mod server;
pub mod types;
pub mod version;
