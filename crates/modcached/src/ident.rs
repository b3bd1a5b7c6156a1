//! Module identity: escaped-path decoding, major-version splitting, and the
//! longest-prefix lookup that maps a module path onto a cached repository.

use camino::Utf8Path;

use crate::version;

/// Decode the escaped form of a module path: `!c` stands for uppercase `C`,
/// and the escaped form itself must not contain uppercase letters.
pub fn unescape_path(escaped: &str) -> Option<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut bang = false;
    for c in escaped.chars() {
        if bang {
            if !c.is_ascii_lowercase() {
                return None;
            }
            out.push(c.to_ascii_uppercase());
            bang = false;
        } else if c == '!' {
            bang = true;
        } else if c.is_ascii_uppercase() {
            return None;
        } else {
            out.push(c);
        }
    }
    if bang {
        return None;
    }
    Some(out)
}

/// Split a trailing major-version component (`v2`, `v3`, ...) off a module
/// path. Does not handle `gopkg.in/` paths.
///
/// Returns `None` when the path has an empty component or one that begins
/// with `.`; those never name a module.
pub fn split_major_version(module_path: &str) -> Option<(String, String)> {
    let components: Vec<&str> = module_path.split('/').collect();
    for comp in &components {
        if comp.is_empty() || comp.starts_with('.') {
            return None;
        }
    }
    if components.len() < 2 {
        return Some((module_path.to_string(), String::new()));
    }
    let last = components[components.len() - 1];
    let tag = match last.strip_prefix('v') {
        Some(num) if !num.is_empty() && num.bytes().all(|b| b.is_ascii_digit()) => last,
        _ => return Some((module_path.to_string(), String::new())),
    };
    let path = components[..components.len() - 1].join("/");
    Some((path, tag.to_string()))
}

/// A module path paired with a requested version, validated and split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathVersion {
    /// Module path with any major-version component removed.
    pub path: String,
    /// Major-version tag (`v2`, ...) or empty.
    pub major: String,
    /// Whether the version carries `+incompatible` build metadata.
    pub incompatible: bool,
}

/// Validate a module path against a requested version and split the
/// major-version tag.
///
/// `gopkg.in/` paths keep the version in a `.vN` suffix of the last
/// component instead; there the requested version must start with that
/// `vN`, `+incompatible` is rejected, and the reported tag stays empty.
/// Everywhere else a tagless path only accepts `v0.`/`v1.` versions or
/// `+incompatible` ones.
pub fn check_module_path_ver(module_path: &str, ver: &str) -> Option<PathVersion> {
    let incompatible = version::build_metadata(ver) == "+incompatible";
    if module_path.starts_with("gopkg.in/") {
        if incompatible {
            return None;
        }
        let idx = module_path.rfind('.')?;
        if ver.starts_with(&module_path[idx + 1..]) {
            return Some(PathVersion {
                path: module_path.to_string(),
                major: String::new(),
                incompatible: false,
            });
        }
        return None;
    }
    let (path, major) = split_major_version(module_path)?;
    if major.is_empty() && !ver.starts_with("v0.") && !ver.starts_with("v1.") && !incompatible {
        return None;
    }
    Some(PathVersion {
        path,
        major,
        incompatible,
    })
}

/// Backend kind of a cached repository, read off the `.vcs` symlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcsKind {
    Git,
    Plain,
}

impl VcsKind {
    fn from_symlink(target: &std::path::Path, module_path: &str) -> Self {
        match target.to_str() {
            Some(".git") => VcsKind::Git,
            Some(".mod") => VcsKind::Plain,
            _ => panic!(
                "invalid local VCS type {} for module {}, should not happen",
                target.display(),
                module_path
            ),
        }
    }
}

/// A module path resolved against the local cache.
#[derive(Debug, Clone)]
pub struct LocalModule {
    /// Repository-root module path (equals the cache directory name).
    pub root: String,
    /// Path of the module inside the repository; empty at the root.
    pub subdir: String,
    pub vcs: VcsKind,
}

/// Find the cached repository backing `module_path` by probing `<p>/.vcs`
/// from the longest prefix down.
///
/// Longest-first matters: `example.com/a` and `example.com/a/b` may be
/// distinct repositories, and the deeper one must win.
///
/// Returns `None` when no prefix is cached; the caller must discover.
pub fn lookup_local(workdir: &Utf8Path, module_path: &str) -> Option<LocalModule> {
    let mut sep = module_path.len();
    let mut subdir = "";
    loop {
        let parent = &module_path[..sep];
        let link = workdir.join(parent).join(".vcs");
        if let Ok(target) = std::fs::read_link(&link) {
            return Some(LocalModule {
                root: parent.to_string(),
                subdir: subdir.to_string(),
                vcs: VcsKind::from_symlink(&target, parent),
            });
        }
        match parent.rfind('/') {
            Some(idx) => {
                sep = idx;
                subdir = &module_path[idx + 1..];
            }
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn unescape_basics() {
        assert_eq!(
            unescape_path("github.com/!burnt!sushi/toml").as_deref(),
            Some("github.com/BurntSushi/toml")
        );
        assert_eq!(unescape_path("example.com/plain").as_deref(), Some("example.com/plain"));
    }

    #[test]
    fn unescape_rejects_bad_forms() {
        // Uppercase may only appear escaped.
        assert_eq!(unescape_path("github.com/BurntSushi/toml"), None);
        // Bang must be followed by a lowercase letter.
        assert_eq!(unescape_path("example.com/!1bad"), None);
        assert_eq!(unescape_path("example.com/trailing!"), None);
    }

    #[test]
    fn major_version_split() {
        assert_eq!(
            split_major_version("example.com/mod/v2"),
            Some(("example.com/mod".to_string(), "v2".to_string()))
        );
        assert_eq!(
            split_major_version("example.com/mod"),
            Some(("example.com/mod".to_string(), String::new()))
        );
        // A bare host is never split, even if it looks like a tag.
        assert_eq!(
            split_major_version("v2"),
            Some(("v2".to_string(), String::new()))
        );
        // Not a tag: "v" followed by non-digits.
        assert_eq!(
            split_major_version("example.com/verse"),
            Some(("example.com/verse".to_string(), String::new()))
        );
        assert_eq!(
            split_major_version("example.com/v-1"),
            Some(("example.com/v-1".to_string(), String::new()))
        );
    }

    #[test]
    fn major_version_split_rejects_bad_components() {
        assert_eq!(split_major_version("example.com//mod"), None);
        assert_eq!(split_major_version("example.com/.hidden"), None);
        assert_eq!(split_major_version("example.com/../etc"), None);
        assert_eq!(split_major_version(""), None);
    }

    #[test]
    fn split_is_idempotent() {
        let (path, _) = split_major_version("example.com/mod/v3").unwrap();
        let (again, tag) = split_major_version(&path).unwrap();
        assert_eq!(again, path);
        assert_eq!(tag, "");
    }

    #[test]
    fn path_version_compatibility() {
        let pv = check_module_path_ver("example.com/mod/v2", "v2.0.0").unwrap();
        assert_eq!(pv.path, "example.com/mod");
        assert_eq!(pv.major, "v2");
        assert!(!pv.incompatible);

        let pv = check_module_path_ver("example.com/mod", "v1.4.2").unwrap();
        assert_eq!(pv.major, "");

        // v2 without a /v2 path needs +incompatible.
        assert_eq!(check_module_path_ver("example.com/mod", "v2.0.0"), None);
        let pv = check_module_path_ver("example.com/mod", "v2.0.0+incompatible").unwrap();
        assert!(pv.incompatible);
    }

    #[test]
    fn gopkg_in_rules() {
        let pv = check_module_path_ver("gopkg.in/yaml.v2", "v2.4.0").unwrap();
        assert_eq!(pv.path, "gopkg.in/yaml.v2");
        assert_eq!(pv.major, "");
        assert!(!pv.incompatible);

        // The requested version must match the .vN suffix.
        assert_eq!(check_module_path_ver("gopkg.in/yaml.v2", "v1.0.0"), None);
        // +incompatible never applies on this host.
        assert_eq!(
            check_module_path_ver("gopkg.in/yaml.v2", "v2.0.0+incompatible"),
            None
        );
    }

    #[cfg(unix)]
    #[test]
    fn local_lookup_walks_prefixes() {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();

        let repo = workdir.join("example.com/mod");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::os::unix::fs::symlink(".git", repo.join(".vcs")).unwrap();

        let hit = lookup_local(&workdir, "example.com/mod/sub/pkg").unwrap();
        assert_eq!(hit.root, "example.com/mod");
        assert_eq!(hit.subdir, "sub/pkg");
        assert_eq!(hit.vcs, VcsKind::Git);

        let direct = lookup_local(&workdir, "example.com/mod").unwrap();
        assert_eq!(direct.subdir, "");

        assert!(lookup_local(&workdir, "example.com/other").is_none());
    }
}
