//! Thin gateway over the device root shell.
//!
//! Everything that touches root-owned paths goes through here as a plain
//! command string, mirroring how the toolkit itself is driven. The gateway
//! does not interpret output beyond splitting lines.

use anyhow::{Context, Result, bail};
use log::debug;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Which pipe a streamed line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

pub type LineSink = Arc<dyn Fn(Stream, &str) + Send + Sync>;

#[derive(Debug, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub out: Vec<String>,
    pub err: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn err_joined(&self) -> String {
        self.err.join("\n")
    }
}

/// Executes commands with superuser privilege through `su -c`, or directly
/// through `sh -c` when the process already runs privileged (and in tests).
#[derive(Debug, Clone)]
pub struct RootShell {
    program: PathBuf,
}

impl RootShell {
    pub fn su() -> Result<Self> {
        let program = which::which("su").context("su binary not found in PATH")?;
        Ok(Self { program })
    }

    pub fn direct() -> Self {
        let program = which::which("sh").unwrap_or_else(|_| PathBuf::from("/bin/sh"));
        Self { program }
    }

    pub async fn exec(&self, cmd: &str) -> Result<CommandOutput> {
        debug!("shell: {cmd}");

        let output = Command::new(&self.program)
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            out: split_lines(&output.stdout),
            err: split_lines(&output.stderr),
        })
    }

    /// Runs a command forwarding every output line to `on_line` as it is
    /// produced. The sink is invoked from reader tasks, not the caller's
    /// task, and must marshal accordingly.
    pub async fn exec_streamed(&self, cmd: &str, on_line: LineSink) -> Result<i32> {
        debug!("shell (streamed): {cmd}");

        let mut child = Command::new(&self.program)
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        let stdout = child.stdout.take().context("missing stdout pipe")?;
        let stderr = child.stderr.take().context("missing stderr pipe")?;

        let sink = Arc::clone(&on_line);
        let out_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink(Stream::Stdout, &line);
            }
        });

        let sink = on_line;
        let err_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink(Stream::Stderr, &line);
            }
        });

        let status = child.wait().await?;
        let _ = out_task.await;
        let _ = err_task.await;

        Ok(status.code().unwrap_or(-1))
    }

    pub async fn is_root(&self) -> bool {
        self.exec("id -u")
            .await
            .map(|res| res.success() && res.out.first().is_some_and(|uid| uid.trim() == "0"))
            .unwrap_or(false)
    }

    pub async fn file_exists(&self, path: &Path) -> bool {
        self.exec(&format!("[ -e \"{}\" ] && echo exists", path.display()))
            .await
            .map(|res| res.out.iter().any(|line| line.contains("exists")))
            .unwrap_or(false)
    }

    pub async fn mkdir_p(&self, path: &Path) -> Result<()> {
        let res = self.exec(&format!("mkdir -p \"{}\"", path.display())).await?;
        if !res.success() {
            bail!("mkdir -p {} failed: {}", path.display(), res.err_joined());
        }
        Ok(())
    }

    pub async fn rm_rf(&self, path: &Path) -> Result<()> {
        let res = self.exec(&format!("rm -rf \"{}\"", path.display())).await?;
        if !res.success() {
            bail!("rm -rf {} failed: {}", path.display(), res.err_joined());
        }
        Ok(())
    }

    pub async fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let res = self
            .exec(&format!("cp \"{}\" \"{}\"", src.display(), dst.display()))
            .await?;
        if !res.success() {
            bail!(
                "copy {} -> {} failed: {}",
                src.display(),
                dst.display(),
                res.err_joined()
            );
        }
        Ok(())
    }

    pub async fn chmod(&self, mode: &str, path: &Path) -> Result<()> {
        let res = self
            .exec(&format!("chmod {mode} \"{}\"", path.display()))
            .await?;
        if !res.success() {
            bail!("chmod {} {} failed: {}", mode, path.display(), res.err_joined());
        }
        Ok(())
    }

    pub async fn read_to_string(&self, path: &Path) -> Result<String> {
        let res = self.exec(&format!("cat \"{}\"", path.display())).await?;
        if !res.success() {
            bail!("cat {} failed: {}", path.display(), res.err_joined());
        }
        Ok(res.out.join("\n"))
    }

    /// Places `content` into a (possibly root-owned) destination by staging
    /// it in a local temp file and copying through the shell, the same way
    /// the app side hands scripts to root.
    pub async fn write_via_shell(&self, content: &str, dest: &Path, mode: &str) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;

        let res = self
            .exec(&format!(
                "cp \"{}\" \"{}\" && chmod {mode} \"{}\"",
                tmp.path().display(),
                dest.display(),
                dest.display()
            ))
            .await?;

        if !res.success() {
            bail!("failed to write {}: {}", dest.display(), res.err_joined());
        }
        Ok(())
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn exec_captures_output_and_exit_code() {
        let shell = RootShell::direct();

        let ok = shell.exec("echo hello; echo oops >&2").await.unwrap();
        assert!(ok.success());
        assert_eq!(ok.out, vec!["hello"]);
        assert_eq!(ok.err, vec!["oops"]);

        let failed = shell.exec("exit 3").await.unwrap();
        assert_eq!(failed.code, 3);
    }

    #[tokio::test]
    async fn streamed_lines_keep_their_channel() {
        let shell = RootShell::direct();
        let lines: Arc<Mutex<Vec<(Stream, String)>>> = Arc::default();

        let sink = Arc::clone(&lines);
        let code = shell
            .exec_streamed(
                "echo one; echo two >&2",
                Arc::new(move |stream, line| {
                    sink.lock().unwrap().push((stream, line.to_owned()));
                }),
            )
            .await
            .unwrap();

        assert_eq!(code, 0);
        let lines = lines.lock().unwrap();
        assert!(lines.contains(&(Stream::Stdout, "one".into())));
        assert!(lines.contains(&(Stream::Stderr, "two".into())));
    }

    #[tokio::test]
    async fn write_via_shell_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        let shell = RootShell::direct();

        shell.write_via_shell("payload\n", &dest, "644").await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "payload\n");
    }
}
