// Copyright 2026 Wormcast maintainers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Privilege helper: every operation that needs root (mounting the produced ISO, reading its
//! extents, opening dm-crypt/dm-verity mappings) goes through `sudo -S`, with the operator's
//! password piped on stdin rather than typed at a TTY prompt `sudo` would otherwise open.
//! Behind a trait so the orchestrator and tests don't depend on an actual `sudo` binary.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::watch;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs a privileged command, feeding `password` (if any) on stdin to satisfy `sudo -S`.
/// Manually desugared to boxed futures (rather than `async fn` in a trait) so the trait stays
/// object-safe and callable as `&dyn PrivilegeHelper`.
pub trait PrivilegeHelper: Send + Sync {
    fn run<'a>(&'a self, program: &'a str, args: &'a [&'a str]) -> BoxFuture<'a, Result<String>> {
        self.run_with_stdin(program, args, &[])
    }

    /// Like `run`, but appends `extra_stdin` to the command's stdin after the cached sudo
    /// password — e.g. `cryptsetup open --key-file=-`, which reads its key material from the
    /// remainder of the same stream `sudo -S` consumed the password line from.
    fn run_with_stdin<'a>(
        &'a self,
        program: &'a str,
        args: &'a [&'a str],
        extra_stdin: &'a [u8],
    ) -> BoxFuture<'a, Result<String>>;

    /// Re-checks that the cached password still authorizes `sudo`, without running a real
    /// command. Used by the background re-validation task in C7 step 2.
    fn validate<'a>(&'a self) -> BoxFuture<'a, Result<()>>;
}

pub struct SudoHelper {
    password: Option<Vec<u8>>,
}

impl SudoHelper {
    pub fn new(password: Option<Vec<u8>>) -> Self {
        Self { password }
    }
}

impl SudoHelper {
    async fn run_impl(&self, program: &str, args: &[&str], extra_stdin: &[u8]) -> Result<String> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let mut cmd = Command::new("sudo");
        cmd.arg("-S").arg(program).args(args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning sudo -S {program}"))?;
        if self.password.is_some() || !extra_stdin.is_empty() {
            let mut stdin = child
                .stdin
                .take()
                .context("child has no stdin handle")?;
            if let Some(pw) = &self.password {
                stdin
                    .write_all(pw)
                    .await
                    .with_context(|| format!("writing password to sudo -S {program}"))?;
            }
            if !extra_stdin.is_empty() {
                stdin
                    .write_all(extra_stdin)
                    .await
                    .with_context(|| format!("writing stdin payload to sudo -S {program}"))?;
            }
            drop(stdin);
        } else {
            drop(child.stdin.take());
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("running sudo -S {program}"))?;
        if !output.status.success() {
            anyhow::bail!(
                "sudo -S {program} failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        String::from_utf8(output.stdout)
            .with_context(|| format!("decoding output of sudo -S {program}"))
    }
}

impl PrivilegeHelper for SudoHelper {
    fn run_with_stdin<'a>(
        &'a self,
        program: &'a str,
        args: &'a [&'a str],
        extra_stdin: &'a [u8],
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.run_impl(program, args, extra_stdin))
    }

    fn validate<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.run_impl("-v", &[], &[]).await.map(|_| ()) })
    }
}

/// Mounts `iso_path` read-only at `mountpoint` (created if missing) via the privilege helper.
pub async fn mount_iso(
    helper: &dyn PrivilegeHelper,
    iso_path: &Path,
    mountpoint: &Path,
) -> Result<()> {
    tokio::fs::create_dir_all(mountpoint)
        .await
        .with_context(|| format!("creating mountpoint {}", mountpoint.display()))?;
    let iso_str = iso_path.to_string_lossy().into_owned();
    let mount_str = mountpoint.to_string_lossy().into_owned();
    helper
        .run("mount", &["-r", &iso_str, &mount_str])
        .await
        .map(|_| ())
}

pub async fn umount_iso(helper: &dyn PrivilegeHelper, mountpoint: &Path) -> Result<()> {
    let mount_str = mountpoint.to_string_lossy().into_owned();
    helper.run("umount", &[&mount_str]).await?;
    tokio::fs::remove_dir(mountpoint)
        .await
        .with_context(|| format!("removing mountpoint {}", mountpoint.display()))?;
    Ok(())
}

/// Spawns the background task that re-validates the cached credential every 10 seconds, per
/// spec.md §4.7 step 2. The returned `watch::Receiver` reports the last validation's outcome;
/// the orchestrator can poll it before any further privileged operation.
pub fn spawn_revalidation(
    helper: std::sync::Arc<dyn PrivilegeHelper>,
) -> (tokio::task::JoinHandle<()>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(true);
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            let ok = helper.validate().await.is_ok();
            if tx.send(ok).is_err() {
                return;
            }
        }
    });
    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeHelper {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl PrivilegeHelper for FakeHelper {
        fn run_with_stdin<'a>(
            &'a self,
            _program: &'a str,
            _args: &'a [&'a str],
            _extra_stdin: &'a [u8],
        ) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    anyhow::bail!("simulated failure");
                }
                Ok(String::new())
            })
        }

        fn validate<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move { self.run("-v", &[]).await.map(|_| ()) })
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mount_then_umount_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mountpoint = tmp.path().join("mnt");
        let calls = Arc::new(AtomicUsize::new(0));
        let helper = FakeHelper {
            calls: calls.clone(),
            fail: false,
        };
        let iso = tmp.path().join("image.iso");
        std::fs::write(&iso, b"fake iso").unwrap();

        mount_iso(&helper, &iso, &mountpoint).await.unwrap();
        assert!(mountpoint.is_dir());
        umount_iso(&helper, &mountpoint).await.unwrap();
        assert!(!mountpoint.exists());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn revalidation_reports_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let helper: Arc<dyn PrivilegeHelper> = Arc::new(FakeHelper { calls, fail: true });
        let (handle, mut rx) = spawn_revalidation(helper);
        tokio::time::advance(Duration::from_secs(10)).await;
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
        handle.abort();
    }
}
