//! Thin subprocess driver around the git client.
//!
//! Every invocation carries a deadline; a lapsed deadline kills the child.
//! Three shapes are exposed: fire-and-forget ([`run`]), collect-small-output
//! ([`run_collect`]) and streaming stdout ([`run_streaming`]), which hands
//! back a [`GitStream`] the caller drains and then waits on.

use camino::Utf8Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

/// The git executable, resolved through `PATH`.
pub const GIT_COMMAND: &str = "git";

/// Deadline for clone and remote-update operations.
pub const CLONE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Deadline for queries against an already-cached repository.
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How much stderr to keep in an error report.
const STDERR_EXCERPT_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to spawn `git {args}`: {source}")]
    Spawn {
        args: String,
        source: std::io::Error,
    },

    #[error("`git {args}` did not finish within {timeout:?}")]
    Timeout { args: String, timeout: Duration },

    #[error("`git {args}` exited with {status}: {stderr}")]
    Exit {
        args: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("i/o error while running `git {args}`: {source}")]
    Io {
        args: String,
        source: std::io::Error,
    },
}

fn join_args(args: &[&str]) -> String {
    args.join(" ")
}

fn stderr_excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_EXCERPT_LEN {
        trimmed.to_string()
    } else {
        let mut end = STDERR_EXCERPT_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

fn command(workdir: &Utf8Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(GIT_COMMAND);
    cmd.args(args);
    cmd.current_dir(workdir);
    cmd.stdin(Stdio::null());
    // A lapsed deadline drops the wait future; the child must die with it.
    cmd.kill_on_drop(true);
    cmd
}

/// Run a git command for its side effects. Stdout is discarded.
pub async fn run(workdir: &Utf8Path, args: &[&str], timeout: Duration) -> Result<(), GitError> {
    run_collect(workdir, args, timeout).await.map(|_| ())
}

/// Run a git command and collect its (small) stdout.
pub async fn run_collect(
    workdir: &Utf8Path,
    args: &[&str],
    timeout: Duration,
) -> Result<Vec<u8>, GitError> {
    let mut cmd = command(workdir, args);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|source| GitError::Spawn {
        args: join_args(args),
        source,
    })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| GitError::Timeout {
            args: join_args(args),
            timeout,
        })?
        .map_err(|source| GitError::Io {
            args: join_args(args),
            source,
        })?;

    if !output.status.success() {
        return Err(GitError::Exit {
            args: join_args(args),
            status: output.status,
            stderr: stderr_excerpt(&output.stderr),
        });
    }
    Ok(output.stdout)
}

/// Run a git command whose stdout the caller consumes incrementally.
///
/// The returned [`GitStream`] owns the child; dropping it kills the process,
/// so an early error on the read path cannot leak a running git.
pub async fn run_streaming(
    workdir: &Utf8Path,
    args: &[&str],
    timeout: Duration,
) -> Result<GitStream, GitError> {
    let mut cmd = command(workdir, args);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| GitError::Spawn {
        args: join_args(args),
        source,
    })?;

    let stdout = child
        .stdout
        .take()
        .expect("stdout was requested piped above");

    Ok(GitStream {
        child,
        stdout: Some(stdout),
        args: join_args(args),
        deadline: tokio::time::Instant::now() + timeout,
        timeout,
    })
}

/// A running git process with a streaming stdout.
///
/// Read the stream to end-of-file, then call [`GitStream::wait`]. The whole
/// exchange shares the deadline the stream was created with.
pub struct GitStream {
    child: Child,
    stdout: Option<ChildStdout>,
    args: String,
    deadline: tokio::time::Instant,
    timeout: Duration,
}

impl GitStream {
    /// Take ownership of the stdout pipe. Panics if taken twice.
    pub fn stdout(&mut self) -> ChildStdout {
        self.stdout.take().expect("stdout already taken")
    }

    /// Wait for the process to exit and check its status.
    ///
    /// Any stdout the caller left unread is drained first so the child
    /// cannot block on a full pipe.
    pub async fn wait(mut self) -> Result<(), GitError> {
        let deadline = self.deadline;
        match tokio::time::timeout_at(deadline, self.finish()).await {
            Ok(result) => result,
            Err(_) => Err(GitError::Timeout {
                args: self.args,
                timeout: self.timeout,
            }),
        }
    }

    async fn finish(&mut self) -> Result<(), GitError> {
        if let Some(mut stdout) = self.stdout.take() {
            let mut sink = Vec::new();
            stdout
                .read_to_end(&mut sink)
                .await
                .map_err(|source| GitError::Io {
                    args: self.args.clone(),
                    source,
                })?;
        }
        let mut stderr_buf = Vec::new();
        if let Some(mut stderr) = self.child.stderr.take() {
            stderr
                .read_to_end(&mut stderr_buf)
                .await
                .map_err(|source| GitError::Io {
                    args: self.args.clone(),
                    source,
                })?;
        }
        let status = self.child.wait().await.map_err(|source| GitError::Io {
            args: self.args.clone(),
            source,
        })?;
        if !status.success() {
            return Err(GitError::Exit {
                args: self.args.clone(),
                status,
                stderr: stderr_excerpt(&stderr_buf),
            });
        }
        Ok(())
    }

    /// Drain stdout to a buffer, then wait. Convenience for callers that
    /// want the whole output but with the streaming deadline semantics.
    pub async fn collect(mut self) -> Result<Vec<u8>, GitError> {
        let deadline = self.deadline;
        let mut stdout = self.stdout();
        let mut buf = Vec::new();
        let read = stdout.read_to_end(&mut buf);
        match tokio::time::timeout_at(deadline, read).await {
            Ok(result) => {
                result.map_err(|source| GitError::Io {
                    args: self.args.clone(),
                    source,
                })?;
            }
            Err(_) => {
                return Err(GitError::Timeout {
                    args: self.args,
                    timeout: self.timeout,
                })
            }
        }
        drop(stdout);
        self.wait().await?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn tmp_workdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn collect_captures_stdout() {
        let (_guard, dir) = tmp_workdir();
        let out = run_collect(&dir, &["--version"], LOCAL_TIMEOUT)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&out).starts_with("git version"));
    }

    #[tokio::test]
    async fn failure_reports_status_and_stderr() {
        let (_guard, dir) = tmp_workdir();
        let err = run(&dir, &["rev-parse", "HEAD"], LOCAL_TIMEOUT)
            .await
            .unwrap_err();
        match err {
            GitError::Exit { status, stderr, .. } => {
                assert!(!status.success());
                assert!(!stderr.is_empty());
            }
            other => panic!("expected Exit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn streaming_drains_and_waits() {
        let (_guard, dir) = tmp_workdir();
        let stream = run_streaming(&dir, &["--version"], LOCAL_TIMEOUT)
            .await
            .unwrap();
        let out = stream.collect().await.unwrap();
        assert!(String::from_utf8_lossy(&out).contains("git"));
    }

    #[tokio::test]
    async fn wait_drains_unread_stdout() {
        let (_guard, dir) = tmp_workdir();
        let stream = run_streaming(&dir, &["help", "-a"], LOCAL_TIMEOUT)
            .await
            .unwrap();
        // Never touch stdout; wait must still reap the child cleanly.
        stream.wait().await.unwrap();
    }
}
