//! Cache population engine.
//!
//! Owns the on-disk cache layout and the background workers that clone or
//! refresh bare mirrors. Two maps deduplicate in-flight work: one keyed by
//! the request path (minus extension), one keyed by the repository-root
//! module path. At most one clone or update runs per repository root.

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use modcache_git as git;

use crate::discover;
use crate::ident::{self, VcsKind};
use crate::version;

pub struct Populator {
    /// Cache working directory; module directories live directly under it.
    workdir: Utf8PathBuf,

    /// Request-level dedup, keyed by request path minus extension.
    pending_mod: Mutex<HashSet<String>>,

    /// Repository-level dedup, keyed by repository-root module path. The
    /// value is the remote URL; empty means "refresh the existing mirror".
    pending_git: Mutex<HashMap<String, String>>,

    /// Work queue feeding the clone workers. Bounded at the worker count:
    /// submission blocks when every worker is busy, which is the intended
    /// backpressure, and must only ever happen off the request path.
    clone_tx: mpsc::Sender<String>,
    clone_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,

    /// Remaining workers that may still be spawned. Workers live for the
    /// process lifetime once started.
    worker_slots: AtomicI64,
}

impl Populator {
    /// Set up the working-directory layout and the (empty) worker pool.
    pub fn new(workdir: Utf8PathBuf) -> std::io::Result<Self> {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        std::fs::create_dir_all(workdir.join(".gittemplate"))?;
        std::fs::create_dir_all(workdir.join(".tmp"))?;

        let (clone_tx, clone_rx) = mpsc::channel(parallelism);

        Ok(Populator {
            workdir,
            pending_mod: Mutex::new(HashSet::new()),
            pending_git: Mutex::new(HashMap::new()),
            clone_tx,
            clone_rx: Arc::new(tokio::sync::Mutex::new(clone_rx)),
            worker_slots: AtomicI64::new(parallelism as i64),
        })
    }

    pub fn workdir(&self) -> &Utf8Path {
        &self.workdir
    }

    /// Handle one pass-through request: dedup on `key` and, if this request
    /// is the first, kick off resolution and population in the background.
    pub fn process_request(
        self: &Arc<Self>,
        key: String,
        escaped_module_path: String,
        module_path: String,
        ver: String,
    ) {
        {
            let mut pending = self.pending_mod.lock().unwrap();
            if !pending.insert(key.clone()) {
                // Another request already owns this key.
                return;
            }
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.refresh(&escaped_module_path, &module_path, &ver).await;
            this.pending_mod.lock().unwrap().remove(&key);
        });
    }

    /// Resolve where a module lives and make sure its repository is cached:
    /// local lookup first, then upstream metadata, then go-import discovery.
    async fn refresh(self: &Arc<Self>, escaped_module_path: &str, module_path: &str, ver: &str) {
        let Some(pv) = ident::check_module_path_ver(module_path, ver) else {
            warn!(module = %module_path, "module path is invalid");
            return;
        };
        let module_path = pv.path;

        if let Some(local) = ident::lookup_local(&self.workdir, &module_path) {
            // Already cached; refresh only if the version is missing.
            match local.vcs {
                VcsKind::Git => self.cache_git(&local.root, &local.subdir, ver, "").await,
                VcsKind::Plain => self.cache_plain(&local.root, &local.subdir, ver),
            }
            return;
        }

        let info = match discover::check_upstream(escaped_module_path).await {
            Ok(info) => info,
            Err(err) => {
                error!(module = %module_path, error = %err, "failed to check module path on upstream");
                return;
            }
        };
        if let Some(origin) = info.origin {
            // Upstream knows the repo; trust it.
            let subdir = origin.subdir;
            let root = module_path
                .strip_suffix(subdir.as_str())
                .unwrap_or(&module_path)
                .trim_end_matches('/')
                .to_string();
            if origin.vcs == "git" {
                self.cache_git(&root, &subdir, ver, &origin.url).await;
            } else {
                self.cache_plain(&root, &subdir, ver);
            }
            return;
        }

        // Upstream was silent about provenance; ask the module host itself.
        let (prefix, imports) = match discover::search_direct(&module_path).await {
            Ok(found) => found,
            Err(err) => {
                error!(module = %module_path, error = %err, "cannot find go-import paths");
                return;
            }
        };
        let subdir = module_path
            .strip_prefix(&prefix)
            .unwrap_or("")
            .trim_start_matches('/')
            .to_string();
        info!(module = %prefix, subdir = %subdir, "go-import found");
        for import in &imports {
            if import.vcs == "git" {
                self.cache_git(&prefix, &subdir, ver, &import.repo_root).await;
                return;
            }
            warn!(
                prefix = %import.prefix,
                vcs = %import.vcs,
                repo = %import.repo_root,
                "ignoring go-import with unsupported VCS"
            );
        }
        warn!(module = %prefix, "no git go-import, would have to fetch files from upstream");
        self.cache_plain(&prefix, &subdir, ver);
    }

    /// Ensure a git-backed module is cached. An empty `remote` means the
    /// mirror exists and only needs the requested version checked.
    async fn cache_git(self: &Arc<Self>, module_path: &str, subdir: &str, ver: &str, remote: &str) {
        if remote.is_empty() && self.version_cached(module_path, subdir, ver).await {
            return;
        }

        info!(module = %module_path, remote = %remote, version = %ver, "trying to create/update mirror");
        {
            let mut pending = self.pending_git.lock().unwrap();
            if pending.contains_key(module_path) {
                info!(module = %module_path, "clone/update already running");
                return;
            }
            pending.insert(module_path.to_string(), remote.to_string());
        }

        // First N submissions each bring a worker with them; afterwards the
        // pool is saturated and submissions just queue.
        if self.worker_slots.fetch_sub(1, Ordering::AcqRel) <= 0 {
            self.worker_slots.fetch_add(1, Ordering::AcqRel);
        } else {
            self.spawn_worker();
            info!("starting clone worker");
        }

        // Blocking here is fine; we are on a background task, not in the
        // request handler.
        if self.clone_tx.send(module_path.to_string()).await.is_err() {
            unreachable!("clone queue closed while the populator is alive");
        }
    }

    /// Plain-file backend: recognized but not implemented.
    fn cache_plain(&self, module_path: &str, _subdir: &str, _ver: &str) {
        debug!(module = %module_path, "plain-file backend not implemented, skipping population");
    }

    /// Quick local probe: does the mirror already resolve the requested
    /// version?
    async fn version_cached(&self, module_path: &str, subdir: &str, ver: &str) -> bool {
        let pseudo;
        let mut refspec = match version::canonical(ver) {
            Some(canonical) => {
                pseudo = version::is_pseudo(&canonical);
                if pseudo {
                    match version::pseudo_rev(&canonical) {
                        Some(rev) => rev.to_string(),
                        None => return false,
                    }
                } else if !subdir.is_empty() {
                    format!("{subdir}/{canonical}")
                } else {
                    canonical
                }
            }
            None => return false,
        };

        let gitdir = self.workdir.join(module_path).join(".git");
        loop {
            let result = git::run(
                &gitdir,
                &["log", "-1", "--format=%H", &refspec],
                git::LOCAL_TIMEOUT,
            )
            .await;
            match result {
                Ok(()) => return true,
                Err(_) => {
                    // Some repositories tag X.Y.Z without the leading v.
                    if !pseudo && subdir.is_empty() && refspec.starts_with('v') {
                        refspec.remove(0);
                        continue;
                    }
                    return false;
                }
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let module_path = {
                    let mut rx = this.clone_rx.lock().await;
                    rx.recv().await
                };
                let Some(module_path) = module_path else { break };

                let remote = this
                    .pending_git
                    .lock()
                    .unwrap()
                    .get(&module_path)
                    .cloned()
                    .unwrap_or_else(|| {
                        panic!("pending-git entry for {module_path} must exist")
                    });

                this.clone_or_update(&module_path, &remote).await;
                this.pending_git.lock().unwrap().remove(&module_path);
            }
        });
    }

    /// The worker body: mirror-clone a new repository, or update an
    /// existing one.
    async fn clone_or_update(&self, module_path: &str, remote: &str) {
        if remote.is_empty() {
            info!(module = %module_path, "updating mirror");
            let gitdir = self.workdir.join(module_path).join(".git");
            if let Err(err) = git::run(&gitdir, &["remote", "update"], git::CLONE_TIMEOUT).await {
                warn!(module = %module_path, error = %err, "remote update failed");
            }
            return;
        }

        let module_dir = self.workdir.join(module_path);
        if let Err(err) = std::fs::create_dir_all(&module_dir) {
            error!(module = %module_path, error = %err, "failed to create module directory");
            return;
        }

        // Clone into a sibling temp dir and rename into place, so a partial
        // clone is never observable under the final name.
        let tmp = match tempfile::Builder::new()
            .prefix(".gittmp")
            .tempdir_in(&module_dir)
        {
            Ok(tmp) => tmp,
            Err(err) => {
                error!(module = %module_path, error = %err, "failed to create temp git dir");
                return;
            }
        };
        #[allow(deprecated)]
        let tmp_path = tmp.into_path();

        info!(module = %module_path, remote = %remote, tmp = %tmp_path.display(), "cloning mirror");
        let clone = git::run(
            &self.workdir,
            &[
                "clone",
                "--template=.gittemplate",
                "--quiet",
                "--mirror",
                remote,
                tmp_path.to_str().expect("temp dir under a UTF-8 workdir"),
            ],
            git::CLONE_TIMEOUT,
        )
        .await;
        if let Err(err) = clone {
            error!(remote = %remote, error = %err, "clone failed");
            let _ = std::fs::remove_dir_all(&tmp_path);
            return;
        }

        let gitdir = module_dir.join(".git");
        if std::fs::rename(&tmp_path, &gitdir).is_err() {
            // Lost the race to another worker; its clone stands.
            warn!(module = %module_path, "git dir already exists, cleaning up");
            let _ = std::fs::remove_dir_all(&tmp_path);
            return;
        }

        // The `.vcs` symlink is the readiness signal; it comes last.
        #[cfg(unix)]
        let linked = std::os::unix::fs::symlink(".git", module_dir.join(".vcs"));
        #[cfg(not(unix))]
        let linked = Err::<(), _>(std::io::Error::other("symlinks unsupported on this platform"));
        match linked {
            Ok(()) => info!(module = %module_path, remote = %remote, "done cloning"),
            Err(err) => error!(module = %module_path, error = %err, "failed to create .vcs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_populator() -> Arc<Populator> {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        // Leak the guard: the populator outlives the test body's scope
        // through spawned tasks.
        std::mem::forget(tmp);
        Arc::new(Populator::new(workdir).unwrap())
    }

    #[tokio::test]
    async fn layout_created_on_init() {
        let populator = test_populator();
        assert!(populator.workdir().join(".gittemplate").is_dir());
        assert!(populator.workdir().join(".tmp").is_dir());
    }

    #[tokio::test]
    async fn request_dedup_is_first_wins() {
        let populator = test_populator();
        let first = populator
            .pending_mod
            .lock()
            .unwrap()
            .insert("example.com/m/@v/v1.0.0".to_string());
        assert!(first);
        let second = populator
            .pending_mod
            .lock()
            .unwrap()
            .insert("example.com/m/@v/v1.0.0".to_string());
        assert!(!second);
    }

    #[tokio::test]
    async fn version_probe_fails_without_mirror() {
        let populator = test_populator();
        assert!(
            !populator
                .version_cached("example.com/missing", "", "v1.0.0")
                .await
        );
    }

    fn sh_git(dir: &std::path::Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_DATE", "2019-04-10T19:08:52Z")
            .env("GIT_COMMITTER_DATE", "2019-04-10T19:08:52Z")
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    /// A throwaway source repository with one commit tagged v1.0.0.
    fn source_repo(root: &Utf8Path) -> Utf8PathBuf {
        let src = root.join("src-repo");
        std::fs::create_dir_all(&src).unwrap();
        sh_git(src.as_std_path(), &["init", "--quiet"]);
        std::fs::write(src.join("go.mod"), "module example.com/mod\n").unwrap();
        std::fs::write(src.join("a.go"), "package a\n").unwrap();
        sh_git(src.as_std_path(), &["add", "."]);
        sh_git(src.as_std_path(), &["commit", "--quiet", "-m", "initial"]);
        sh_git(src.as_std_path(), &["tag", "v1.0.0"]);
        src
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clone_publishes_mirror_atomically() {
        let populator = test_populator();
        let src = source_repo(populator.workdir());

        populator
            .clone_or_update("example.com/mod", src.as_str())
            .await;

        let module_dir = populator.workdir().join("example.com/mod");
        let target = std::fs::read_link(module_dir.join(".vcs")).unwrap();
        assert_eq!(target, std::path::Path::new(".git"));
        assert!(module_dir.join(".git/HEAD").is_file());
        assert!(
            populator
                .version_cached("example.com/mod", "", "v1.0.0")
                .await
        );

        // A second clone loses the rename race and cleans up after itself.
        populator
            .clone_or_update("example.com/mod", src.as_str())
            .await;
        let leftovers: Vec<_> = std::fs::read_dir(&module_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".gittmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_refresh_fetches_missing_version() {
        let populator = test_populator();
        let src = source_repo(populator.workdir());
        populator
            .clone_or_update("example.com/mod", src.as_str())
            .await;

        // The mirror predates this tag.
        sh_git(src.as_std_path(), &["tag", "v1.1.0"]);
        assert!(
            !populator
                .version_cached("example.com/mod", "", "v1.1.0")
                .await
        );

        populator.process_request(
            "example.com/mod/@v/v1.1.0".to_string(),
            "example.com/mod".to_string(),
            "example.com/mod".to_string(),
            "v1.1.0".to_string(),
        );

        for _ in 0..100 {
            if populator
                .version_cached("example.com/mod", "", "v1.1.0")
                .await
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("background update never made v1.1.0 resolvable");
    }
}
