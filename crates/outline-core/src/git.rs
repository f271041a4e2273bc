use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    executor::{StageCommand, StageExecutor},
    sink::{format_line, CollectingSink, LogSink},
};

/// Repository checkout operations the pipeline needs before running stages.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Clone `url` into the existing, empty directory `dest`.
    async fn clone_repo(&self, url: &str, dest: &Path, sink: &dyn LogSink) -> Result<()>;

    /// Check out `branch` in `dir`, fetching the pull request head if the
    /// branch is not available locally.
    async fn checkout(
        &self,
        dir: &Path,
        branch: &str,
        pr_number: u64,
        sink: &dyn LogSink,
    ) -> Result<()>;
}

/// `git` subprocess implementation.
pub struct GitCli {
    executor: StageExecutor,
}

impl GitCli {
    pub fn new(timeout_s: u64) -> Self {
        Self {
            executor: StageExecutor::new(timeout_s),
        }
    }

    async fn git(&self, dir: &Path, step: &str, args: &[&str], sink: &dyn LogSink) -> Result<()> {
        let cmd = StageCommand::new("git")
            .args(args.iter().copied())
            .env("GIT_TERMINAL_PROMPT", "0");
        let shown = redact_credentials(&cmd.display());
        debug!(dir = %dir.display(), "running {shown}");

        let outcome = self
            .executor
            .execute(&cmd, dir, &mut |_, line| {
                sink.append(format_line(step, &redact_credentials(line)))
            })
            .await
            .with_context(|| format!("failed to spawn {shown}"))?;

        if outcome.timed_out {
            return Err(anyhow!(
                "{shown} timed out after {}s",
                self.executor.timeout_s()
            ));
        }
        if !outcome.success() {
            return Err(anyhow!(
                "{shown} exited with code {}: {}",
                outcome.exit_code,
                redact_credentials(&outcome.combined_output())
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn clone_repo(&self, url: &str, dest: &Path, sink: &dyn LogSink) -> Result<()> {
        self.git(dest, "clone", &["clone", "--no-progress", url, "."], sink)
            .await?;
        info!(dest = %dest.display(), "cloned {}", redact_credentials(url));
        Ok(())
    }

    async fn checkout(
        &self,
        dir: &Path,
        branch: &str,
        pr_number: u64,
        sink: &dyn LogSink,
    ) -> Result<()> {
        // The first attempt is expected to fail for fork branches; keep its
        // output out of the run log.
        let attempt = CollectingSink::new();
        match self.git(dir, "checkout", &["checkout", branch], &attempt).await {
            Ok(()) => return Ok(()),
            // Branches from forks only exist under the pull request ref.
            Err(e) => debug!(branch, pr = pr_number, "direct checkout failed: {e:#}"),
        }
        sink.append(format_line(
            "checkout",
            &format!("branch {branch} not in clone, fetching pull request #{pr_number} head"),
        ));
        let refspec = format!("pull/{pr_number}/head:{branch}");
        self.git(dir, "checkout", &["fetch", "origin", refspec.as_str()], sink)
            .await?;
        self.git(dir, "checkout", &["checkout", branch], sink).await
    }
}

/// Strip `user:password@` userinfo from any URL in `text`.
pub fn redact_credentials(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("://") {
        let (head, tail) = rest.split_at(pos + 3);
        out.push_str(head);
        let authority_end = tail
            .find(|c: char| c == '/' || c.is_whitespace())
            .unwrap_or(tail.len());
        match tail[..authority_end].rfind('@') {
            Some(at) => {
                out.push_str("***@");
                rest = &tail[at + 1..];
            }
            None => rest = tail,
        }
    }
    out.push_str(rest);
    out
}
