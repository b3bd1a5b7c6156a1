//! Archive assembler: serves `.info`, `.mod` and `.zip` for a cached module
//! straight out of its bare mirror, without materializing a working tree.
//!
//! The ZIP is built in multiple passes over `git archive` output: survey the
//! tree (licenses, versioned subdirectory, nested modules, irregular
//! entries), then stream the real content into a ZIP with the module prefix,
//! stored entries only, and no directory entries. A LICENSE from the
//! repository root is injected when the packaged subtree has none.

use camino::Utf8Path;
use jiff::tz::TimeZone;
use jiff::Timestamp;
use std::io::{Read, Seek, SeekFrom, Write};
use thiserror::Error;
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use modcache_git as git;

use crate::ident::{self, VcsKind};
use crate::types::RevInfo;
use crate::version;

/// Vendor-directory pathspecs passed to every archive pass. Upstream keeps
/// top-level non-Go files like `vendor/modules.txt`, so only Go files and
/// subdirectories of top-level `vendor/` are dropped, plus nested `vendor/`
/// trees wholesale.
const VENDOR_EXCLUDES: [&str; 3] = [
    ":(exclude)vendor/*.go",
    ":(exclude)vendor/*/**",
    ":(exclude,top)**/vendor/*",
];

/// Requested artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ext {
    Info,
    Mod,
    Zip,
}

impl Ext {
    /// Split a request property like `v1.2.3.zip` into kind and version.
    pub fn from_property(prop: &str) -> Option<(Ext, &str)> {
        for ext in [Ext::Info, Ext::Mod, Ext::Zip] {
            if let Some(ver) = prop.strip_suffix(ext.suffix()) {
                return Some((ext, ver));
            }
        }
        None
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Ext::Info => ".info",
            Ext::Mod => ".mod",
            Ext::Zip => ".zip",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Ext::Info => "application/json",
            Ext::Mod => "text/plain; charset=UTF-8",
            Ext::Zip => "application/zip",
        }
    }
}

/// An assembled artifact ready to stream to the client.
#[derive(Debug)]
pub enum Artifact {
    Buffered(Vec<u8>),
    /// Anonymous temp file, rewound, plus its length.
    File(std::fs::File, u64),
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("cached module {module} not found")]
    NotCached { module: String },

    #[error("invalid version {ver}")]
    InvalidVersion { ver: String },

    #[error("failed to get commit date: {detail}")]
    CommitDate { detail: String },

    #[error("timestamp mismatch: {pseudo} vs {commit}")]
    TimestampMismatch { pseudo: Timestamp, commit: Timestamp },

    #[error("failed to run git archive ({what}): {source}")]
    Archive {
        what: &'static str,
        source: git::GitError,
    },

    #[error("failed to encode revision info: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("archive i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to assemble zip: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("NOT IMPLEMENTED")]
    NotImplemented,
}

/// Serve a cached-only request. The module must already be resolved to a
/// version in canonical form.
pub async fn serve_cached(
    workdir: &Utf8Path,
    module_path: &str,
    major: &str,
    canonical_ver: &str,
    ext: Ext,
    incompatible: bool,
) -> Result<Artifact, ServeError> {
    let local = ident::lookup_local(workdir, module_path).ok_or_else(|| ServeError::NotCached {
        module: module_path.to_string(),
    })?;
    match local.vcs {
        VcsKind::Git => {
            serve_git(
                workdir,
                &local.root,
                major,
                &local.subdir,
                canonical_ver,
                ext,
                incompatible,
            )
            .await
        }
        VcsKind::Plain => Err(ServeError::NotImplemented),
    }
}

async fn serve_git(
    workdir: &Utf8Path,
    module_path: &str,
    major: &str,
    subdir: &str,
    ver: &str,
    ext: Ext,
    incompatible: bool,
) -> Result<Artifact, ServeError> {
    let pseudo = version::is_pseudo(ver);
    let mut expected_time = None;
    let mut refspec = ver.to_string();
    if pseudo {
        expected_time = Some(version::pseudo_timestamp(ver).ok_or_else(|| {
            ServeError::InvalidVersion {
                ver: ver.to_string(),
            }
        })?);
        refspec = version::pseudo_rev(ver)
            .ok_or_else(|| ServeError::InvalidVersion {
                ver: ver.to_string(),
            })?
            .to_string();
    } else if !subdir.is_empty() {
        refspec = format!("{subdir}/{refspec}");
    }

    let gitdir = workdir.join(module_path).join(".git");
    let (refspec, commit_time) =
        resolve_commit_time(&gitdir, refspec, pseudo, !subdir.is_empty()).await?;
    if let Some(expected) = expected_time {
        // The time a pseudo-version claims must match the commit exactly.
        if expected != commit_time {
            return Err(ServeError::TimestampMismatch {
                pseudo: expected,
                commit: commit_time,
            });
        }
    }

    let full_ver = if incompatible {
        format!("{ver}+incompatible")
    } else {
        ver.to_string()
    };
    let mut full_path = module_path.to_string();
    if !subdir.is_empty() {
        full_path = format!("{full_path}/{subdir}");
    }
    if !major.is_empty() {
        full_path = format!("{full_path}/{major}");
    }

    match ext {
        Ext::Info => {
            let info = RevInfo {
                version: full_ver,
                time: Some(commit_time.to_string()),
                origin: None,
            };
            Ok(Artifact::Buffered(serde_json::to_vec(&info)?))
        }
        Ext::Mod => serve_mod(&gitdir, &refspec, subdir, major, &full_path).await,
        Ext::Zip => {
            let prefix = format!("{full_path}@{full_ver}/");
            serve_zip(workdir, &gitdir, &refspec, subdir, major, &prefix).await
        }
    }
}

/// Resolve the commit time behind a refspec, with the one tag-name quirk
/// the wild demands: some repositories tag `X.Y.Z` without the leading `v`,
/// so a failed lookup retries once with the `v` stripped (only for plain
/// root-module versions).
async fn resolve_commit_time(
    gitdir: &Utf8Path,
    mut refspec: String,
    pseudo: bool,
    has_subdir: bool,
) -> Result<(String, Timestamp), ServeError> {
    loop {
        // git log, not git show: show prints annotations for annotated tags.
        let attempt = git::run_collect(
            gitdir,
            &["log", "-1", "--format=%ct", &refspec],
            git::LOCAL_TIMEOUT,
        )
        .await;
        let detail;
        match attempt {
            Ok(out) => {
                let text = String::from_utf8_lossy(&out);
                match text.trim().parse::<i64>() {
                    Ok(secs) => match Timestamp::from_second(secs) {
                        Ok(ts) => return Ok((refspec, ts)),
                        Err(err) => detail = err.to_string(),
                    },
                    Err(err) => detail = err.to_string(),
                }
            }
            Err(err) => detail = err.to_string(),
        }
        if !pseudo && !has_subdir && refspec.starts_with('v') {
            refspec.remove(0);
            continue;
        }
        return Err(ServeError::CommitDate { detail });
    }
}

/// Serve `go.mod`: from `<subdir>/<major>/go.mod`, then `<subdir>/go.mod`,
/// then synthesized.
async fn serve_mod(
    gitdir: &Utf8Path,
    refspec: &str,
    subdir: &str,
    major: &str,
    full_path: &str,
) -> Result<Artifact, ServeError> {
    let mut treeish = format!("{refspec}^{{tree}}:");
    if !subdir.is_empty() {
        treeish.push_str(subdir);
        treeish.push('/');
    }

    let mut targets = Vec::new();
    if !major.is_empty() {
        // The module may live in a versioned subdirectory; try that first.
        targets.push(format!("{treeish}{major}"));
    }
    targets.push(treeish);

    for target in &targets {
        let bytes = match archive_tar(gitdir, &[target.as_str(), "go.mod"], "go.mod").await {
            Ok(bytes) => bytes,
            // A git that cannot even start is a hard error, not a fallback.
            Err(
                err @ ServeError::Archive {
                    source: git::GitError::Spawn { .. },
                    ..
                },
            ) => return Err(err),
            Err(_) => continue,
        };
        if let Some(data) = single_file_from_tar(&bytes, "go.mod") {
            return Ok(Artifact::Buffered(data));
        }
    }

    warn!(module = %full_path, "using synthesized go.mod");
    Ok(Artifact::Buffered(
        format!("module {full_path}\n").into_bytes(),
    ))
}

async fn serve_zip(
    workdir: &Utf8Path,
    gitdir: &Utf8Path,
    refspec: &str,
    subdir: &str,
    major: &str,
    prefix: &str,
) -> Result<Artifact, ServeError> {
    let mut treeish = format!("{refspec}^{{tree}}:{subdir}");

    // Pass 1: survey the tree with only the vendor rules applied.
    let mut survey_args = vec![treeish.as_str()];
    survey_args.extend(VENDOR_EXCLUDES);
    let survey_tar = archive_tar(gitdir, &survey_args, "survey").await?;
    let survey = survey_entries(&survey_tar, major, prefix)?;
    drop(survey_args);

    let mut has_license = survey.has_license;
    let mut excluded = survey.excluded;
    if survey.use_versioned_dir {
        // The module lives under <major>/; archive that subtree and rebase
        // the exclusions onto it.
        has_license = survey.has_ver_license;
        if !treeish.ends_with(':') {
            treeish.push('/');
        }
        treeish.push_str(major);
        let tag_prefix = format!("{major}/");
        excluded = excluded
            .into_iter()
            .filter_map(|path| path.strip_prefix(&tag_prefix).map(str::to_string))
            .collect();
    }

    // Pass 4 decision happens up front: a root-module request needs no
    // injection, and a LICENSE found in scope wins.
    let license = if has_license || (subdir.is_empty() && major.is_empty()) {
        None
    } else {
        license_for(workdir, gitdir, refspec, prefix).await
    };

    // Pass 2: the real content.
    let mut content_args = vec![treeish.as_str()];
    content_args.extend(VENDOR_EXCLUDES);
    let content_tar = archive_tar(gitdir, &content_args, "content").await?;

    let out = tempfile::tempfile_in(workdir.join(".tmp"))?;
    let mut file = build_zip(&content_tar, prefix, &excluded, license, out)?;
    let len = file.seek(SeekFrom::End(0))?;
    file.rewind()?;
    Ok(Artifact::File(file, len))
}

/// Run `git archive --format=tar` with the given trailing arguments and
/// collect the stream.
async fn archive_tar(
    gitdir: &Utf8Path,
    rest: &[&str],
    what: &'static str,
) -> Result<Vec<u8>, ServeError> {
    let mut args = vec!["archive", "--format=tar"];
    args.extend_from_slice(rest);
    let stream = git::run_streaming(gitdir, &args, git::LOCAL_TIMEOUT)
        .await
        .map_err(|source| ServeError::Archive { what, source })?;
    stream
        .collect()
        .await
        .map_err(|source| ServeError::Archive { what, source })
}

/// What the first pass learned about the tree.
#[derive(Debug, Default, PartialEq, Eq)]
struct Survey {
    /// `LICENSE` exists at the archive root.
    has_license: bool,
    /// `<major>/LICENSE` exists.
    has_ver_license: bool,
    /// `<major>/go.mod` exists: the module lives in a versioned directory.
    use_versioned_dir: bool,
    /// Paths to leave out of the final archive: nested module directories
    /// (with trailing `/`) and irregular entries (exact names).
    excluded: Vec<String>,
}

fn survey_entries(tar_bytes: &[u8], major: &str, prefix: &str) -> Result<Survey, ServeError> {
    let mut survey = Survey::default();
    let ver_license = format!("{major}/LICENSE");

    let mut archive = tar::Archive::new(tar_bytes);
    for entry in archive.entries()? {
        let entry = entry?;
        let header = entry.header();
        match header.entry_type() {
            tar::EntryType::XGlobalHeader | tar::EntryType::XHeader => continue,
            tar::EntryType::Directory => continue,
            ty if ty.is_file() => {}
            _ => {
                let name = entry_name(&entry);
                warn!(entry = %name, prefix = %prefix, "ignoring irregular archive entry");
                survey.excluded.push(name);
                continue;
            }
        }
        let name = entry_name(&entry);
        if name == "LICENSE" {
            survey.has_license = true;
        } else if !major.is_empty() && name == ver_license {
            survey.has_ver_license = true;
        }
        if let Some(dir) = name.strip_suffix("/go.mod") {
            if !major.is_empty() && dir == major {
                survey.use_versioned_dir = true;
                continue;
            }
            // A nested module packages separately; exclude its whole tree.
            survey.excluded.push(format!("{dir}/"));
        }
    }
    Ok(survey)
}

fn entry_name(entry: &tar::Entry<'_, &[u8]>) -> String {
    match entry.path() {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
    }
}

fn is_excluded(name: &str, excluded: &[String]) -> bool {
    excluded
        .iter()
        .any(|ex| name == ex || (ex.ends_with('/') && name.starts_with(ex.as_str())))
}

/// Stream tar entries into a ZIP: module prefix on every name, stored
/// entries only, no directory entries, entry mtimes carried over so the
/// output is bit-stable for a given tree.
fn build_zip(
    tar_bytes: &[u8],
    prefix: &str,
    excluded: &[String],
    license: Option<Vec<u8>>,
    out: std::fs::File,
) -> Result<std::fs::File, ServeError> {
    let mut zip = ZipWriter::new(out);

    let mut archive = tar::Archive::new(tar_bytes);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry_name(&entry);
        if is_excluded(&name, excluded) {
            continue;
        }
        let mode = entry.header().mode().unwrap_or(0o644);
        let mtime = entry.header().mtime().unwrap_or(0);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .unix_permissions(mode)
            .last_modified_time(zip_datetime(mtime));
        zip.start_file(format!("{prefix}{name}"), options)?;
        std::io::copy(&mut entry, &mut zip)?;
    }

    if let Some(data) = license {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .unix_permissions(0o644);
        zip.start_file(format!("{prefix}LICENSE"), options)?;
        zip.write_all(&data)?;
    }

    Ok(zip.finish()?)
}

fn zip_datetime(mtime: u64) -> zip::DateTime {
    let Ok(ts) = Timestamp::from_second(mtime as i64) else {
        return zip::DateTime::default();
    };
    let civil = ts.to_zoned(TimeZone::UTC).datetime();
    zip::DateTime::from_date_and_time(
        civil.year() as u16,
        civil.month() as u8,
        civil.day() as u8,
        civil.hour() as u8,
        civil.minute() as u8,
        civil.second() as u8,
    )
    .unwrap_or_default()
}

/// Extract a single expected file from a tar stream: the first real entry
/// must be that file.
fn single_file_from_tar(tar_bytes: &[u8], wanted: &str) -> Option<Vec<u8>> {
    let mut archive = tar::Archive::new(tar_bytes);
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        match entry.header().entry_type() {
            tar::EntryType::XGlobalHeader | tar::EntryType::XHeader => continue,
            ty if ty.is_file() => {}
            _ => return None,
        }
        if entry_name(&entry) != wanted {
            return None;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data).ok()?;
        return Some(data);
    }
    None
}

/// Fetch the repository-root LICENSE through the per-prefix cache.
///
/// The cache write goes through a temp file persisted without clobbering,
/// so concurrent injectors never observe a partial file. Absence of a
/// LICENSE is not an error.
async fn license_for(
    workdir: &Utf8Path,
    gitdir: &Utf8Path,
    refspec: &str,
    prefix: &str,
) -> Option<Vec<u8>> {
    let dir = workdir.join(".tmp").join("licenses").join(prefix);
    let cached = dir.join("LICENSE");
    if let Ok(data) = std::fs::read(&cached) {
        return Some(data);
    }

    let treeish = format!("{refspec}^{{tree}}");
    let bytes = match archive_tar(gitdir, &[&treeish, "LICENSE"], "LICENSE").await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(prefix = %prefix, error = %err, "LICENSE extraction failed (ignored)");
            return None;
        }
    };
    let Some(data) = single_file_from_tar(&bytes, "LICENSE") else {
        warn!(prefix = %prefix, "LICENSE file not found (ignored)");
        return None;
    };

    if std::fs::create_dir_all(&dir).is_ok() {
        if let Ok(mut tmp) = tempfile::NamedTempFile::new_in(&dir) {
            if tmp.write_all(&data).is_ok() {
                // Losing this race just means another request cached it.
                let _ = tmp.persist_noclobber(&cached);
            }
        }
    }
    Some(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FileSpec {
        name: &'static str,
        contents: &'static [u8],
        mtime: u64,
    }

    fn tar_with(files: &[FileSpec], dirs: &[&str], symlinks: &[&str]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for dir in dirs {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_path(dir).unwrap();
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, std::io::empty()).unwrap();
        }
        for file in files {
            let mut header = tar::Header::new_gnu();
            header.set_path(file.name).unwrap();
            header.set_size(file.contents.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(file.mtime);
            header.set_cksum();
            builder.append(&header, file.contents).unwrap();
        }
        for link in symlinks {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_path(link).unwrap();
            header.set_link_name("target").unwrap();
            header.set_size(0);
            header.set_mode(0o777);
            header.set_cksum();
            builder.append(&header, std::io::empty()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    const MTIME: u64 = 1554923332; // 2019-04-10T19:08:52Z

    #[test]
    fn survey_finds_licenses_and_nested_modules() {
        let tar = tar_with(
            &[
                FileSpec { name: "LICENSE", contents: b"l", mtime: MTIME },
                FileSpec { name: "go.mod", contents: b"module m", mtime: MTIME },
                FileSpec { name: "a.go", contents: b"package a", mtime: MTIME },
                FileSpec { name: "nested/go.mod", contents: b"module n", mtime: MTIME },
                FileSpec { name: "nested/n.go", contents: b"package n", mtime: MTIME },
            ],
            &["nested/"],
            &["weird-link"],
        );
        let survey = survey_entries(&tar, "", "m@v1.0.0/").unwrap();
        assert!(survey.has_license);
        assert!(!survey.use_versioned_dir);
        assert_eq!(
            survey.excluded,
            vec!["nested/".to_string(), "weird-link".to_string()]
        );
    }

    #[test]
    fn survey_detects_versioned_directory() {
        let tar = tar_with(
            &[
                FileSpec { name: "v2/go.mod", contents: b"module m/v2", mtime: MTIME },
                FileSpec { name: "v2/LICENSE", contents: b"l", mtime: MTIME },
                FileSpec { name: "v2/a.go", contents: b"package a", mtime: MTIME },
            ],
            &["v2/"],
            &[],
        );
        let survey = survey_entries(&tar, "v2", "m/v2@v2.0.0/").unwrap();
        assert!(survey.use_versioned_dir);
        assert!(survey.has_ver_license);
        assert!(!survey.has_license);
        // The versioned go.mod itself is not an exclusion.
        assert!(survey.excluded.is_empty());
    }

    fn zip_names(file: &mut std::fs::File) -> Vec<String> {
        file.rewind().unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn zip_has_prefixed_stored_file_entries_only() {
        let tar = tar_with(
            &[
                FileSpec { name: "go.mod", contents: b"module m", mtime: MTIME },
                FileSpec { name: "pkg/a.go", contents: b"package a", mtime: MTIME },
                FileSpec { name: "nested/go.mod", contents: b"module n", mtime: MTIME },
                FileSpec { name: "nested/n.go", contents: b"package n", mtime: MTIME },
            ],
            &["pkg/", "nested/"],
            &[],
        );
        let out = tempfile::tempfile().unwrap();
        let excluded = vec!["nested/".to_string()];
        let mut file = build_zip(&tar, "example.com/m@v1.0.0/", &excluded, None, out).unwrap();

        let names = zip_names(&mut file);
        assert_eq!(
            names,
            vec![
                "example.com/m@v1.0.0/go.mod".to_string(),
                "example.com/m@v1.0.0/pkg/a.go".to_string(),
            ]
        );
        assert!(names.iter().all(|n| !n.ends_with('/')));

        file.rewind().unwrap();
        let mut archive = zip::ZipArchive::new(&mut file).unwrap();
        let entry = archive.by_index(0).unwrap();
        assert_eq!(entry.compression(), CompressionMethod::Stored);
    }

    #[test]
    fn zip_output_is_deterministic() {
        let tar = tar_with(
            &[
                FileSpec { name: "go.mod", contents: b"module m", mtime: MTIME },
                FileSpec { name: "a.go", contents: b"package a", mtime: MTIME },
            ],
            &[],
            &[],
        );
        let mut first = Vec::new();
        let mut second = Vec::new();
        for buf in [&mut first, &mut second] {
            let out = tempfile::tempfile().unwrap();
            let mut file = build_zip(&tar, "m@v1.0.0/", &[], None, out).unwrap();
            file.rewind().unwrap();
            file.read_to_end(buf).unwrap();
        }
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn zip_appends_injected_license() {
        let tar = tar_with(
            &[FileSpec { name: "a.go", contents: b"package a", mtime: MTIME }],
            &[],
            &[],
        );
        let out = tempfile::tempfile().unwrap();
        let mut file = build_zip(
            &tar,
            "m/sub@v1.0.0/",
            &[],
            Some(b"MIT".to_vec()),
            out,
        )
        .unwrap();
        let names = zip_names(&mut file);
        assert_eq!(
            names,
            vec![
                "m/sub@v1.0.0/a.go".to_string(),
                "m/sub@v1.0.0/LICENSE".to_string(),
            ]
        );
    }

    #[test]
    fn single_file_extraction_wants_exact_first_entry() {
        let tar = tar_with(
            &[FileSpec { name: "go.mod", contents: b"module m\n", mtime: MTIME }],
            &[],
            &[],
        );
        assert_eq!(
            single_file_from_tar(&tar, "go.mod").as_deref(),
            Some(b"module m\n".as_slice())
        );
        assert_eq!(single_file_from_tar(&tar, "LICENSE"), None);
        assert_eq!(single_file_from_tar(&[], "go.mod"), None);
    }

    #[test]
    fn exclusion_matching() {
        let excluded = vec!["nested/".to_string(), "odd-entry".to_string()];
        assert!(is_excluded("nested/go.mod", &excluded));
        assert!(is_excluded("odd-entry", &excluded));
        assert!(!is_excluded("nested.go", &excluded));
        assert!(!is_excluded("odd-entry/x", &excluded));
    }
}
