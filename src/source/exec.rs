//! Shell-command source and the shared process runner.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::json::parse_command_output;
use super::{Record, Source};
use crate::context::Context;
use crate::resilience::{BreakerSnapshot, Resilience};
use crate::types::{Error, Result, SourceConfig};

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const STDERR_EXCERPT_BYTES: usize = 512;

/// Run `command` through `sh -c` in `cwd` and return its stdout.
///
/// The shell leads its own process group. If the returned future is dropped
/// or the timeout fires, the whole group is killed, so pipelines and
/// background jobs started by the command die with it.
pub async fn run_shell(label: &str, command: &str, cwd: &Path, timeout: Duration) -> Result<String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    let child = cmd
        .spawn()
        .map_err(|e| Error::permanent(label, "spawn", e.to_string()))?;
    let mut group = GroupKill::new(child.id());

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| Error::timeout(format!("{label}: command exceeded {timeout:?}")))?;
    group.disarm();
    let output = output.map_err(|e| Error::permanent(label, "wait", e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let excerpt: String = stderr.chars().take(STDERR_EXCERPT_BYTES).collect();
        return Err(Error::permanent(
            label,
            "exec",
            format!("command failed ({}): {}", output.status, excerpt),
        ));
    }

    String::from_utf8(output.stdout)
        .map_err(|_| Error::permanent(label, "exec", "command output is not valid UTF-8"))
}

/// Kills a child's process group on drop unless disarmed.
struct GroupKill {
    pgid: Option<u32>,
}

impl GroupKill {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// The child exited on its own; leave the group alone.
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    // ESRCH: every member already exited.
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        tracing::debug!(pgid, error = %err, "process group kill failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

pub struct ExecSource {
    name: String,
    command: String,
    cwd: PathBuf,
    timeout: Duration,
    policy: Resilience,
}

impl ExecSource {
    pub fn new(name: &str, config: &SourceConfig, policy: Resilience) -> Result<Self> {
        let command = config
            .cmd
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::config(format!("source {name:?}: cmd is required")))?;
        Ok(Self {
            name: name.to_string(),
            command: command.to_string(),
            cwd: config.cwd.clone().unwrap_or_else(|| PathBuf::from(".")),
            timeout: config.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT),
            policy,
        })
    }

    async fn fetch_once(&self) -> Result<Vec<Record>> {
        tracing::debug!(source = %self.name, cmd = %self.command, "running exec source");
        let stdout = run_shell(&self.name, &self.command, &self.cwd, self.timeout).await?;
        parse_command_output(&stdout).map_err(|e| Error::permanent(&self.name, "parse", e.to_string()))
    }
}

#[async_trait]
impl Source for ExecSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, ctx: &Context) -> Result<Vec<Record>> {
        self.policy.call(ctx, || self.fetch_once()).await
    }

    fn health(&self) -> Option<BreakerSnapshot> {
        Some(self.policy.breaker().snapshot())
    }
}

impl std::fmt::Debug for ExecSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSource")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("cwd", &self.cwd)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CircuitBreakerConfig, ErrorKind, RetryConfig, SourceType};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn policy() -> Resilience {
        Resilience::new(
            "test",
            RetryConfig {
                max_retries: 0,
                enable_log: false,
                ..RetryConfig::default()
            },
            CircuitBreakerConfig::default(),
        )
    }

    fn script_source(dir: &Path, file: &str, body: &str) -> ExecSource {
        let path = dir.join(file);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        let mut cfg = SourceConfig::new(SourceType::Exec);
        cfg.cmd = Some(format!("./{file}"));
        cfg.cwd = Some(dir.to_path_buf());
        ExecSource::new("test", &cfg, policy()).unwrap()
    }

    #[test]
    fn test_empty_command_rejected() {
        let mut cfg = SourceConfig::new(SourceType::Exec);
        cfg.cmd = Some("   ".into());
        let err = ExecSource::new("test", &cfg, policy()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_fetch_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let src = script_source(
            dir.path(),
            "data.sh",
            r#"echo '[{"name":"Alice","age":30},{"name":"Bob","age":25}]'"#,
        );
        let records = src.fetch(&Context::background()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], "Alice");
    }

    #[tokio::test]
    async fn test_fetch_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let src = script_source(
            dir.path(),
            "ndjson.sh",
            "echo '{\"id\":1}'\necho '{\"id\":2}'\necho '{\"id\":3}'",
        );
        let records = src.fetch(&Context::background()).await.unwrap();
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = script_source(dir.path(), "empty.sh", "true");
        assert!(src.fetch(&Context::background()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_json_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let src = script_source(dir.path(), "invalid.sh", "echo 'not json'");
        let err = src.fetch(&Context::background()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.to_string().contains("invalid JSON output"));
    }

    #[tokio::test]
    async fn test_command_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let src = script_source(dir.path(), "fail.sh", "echo 'boom' >&2\nexit 1");
        let err = src.fetch(&Context::background()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("command failed"), "{message}");
        assert!(message.contains("boom"), "{message}");
    }

    /// Live (non-zombie) process check.
    #[cfg(target_os = "linux")]
    fn alive(pid: &str) -> bool {
        match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| !rest.starts_with('Z')),
            Err(_) => false,
        }
    }

    /// Wait for the pid file written by a grandchild of the shell.
    #[cfg(target_os = "linux")]
    async fn read_pid(path: &Path) -> String {
        for _ in 0..100 {
            if let Ok(pid) = fs::read_to_string(path) {
                if !pid.trim().is_empty() {
                    return pid.trim().to_string();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("pid file {} never written", path.display());
    }

    #[cfg(target_os = "linux")]
    async fn assert_gone(pid: &str) {
        for _ in 0..50 {
            if !alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process {pid} outlived the command");
    }

    /// The inner shell forks, so `sleep` is a grandchild of the spawned `sh`.
    const SLEEPER: &str = "sh -c 'echo $$ > sleeper.pid; exec sleep 30'; echo '[]'";

    #[tokio::test]
    async fn test_cancellation_stops_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = SourceConfig::new(SourceType::Exec);
        cfg.cmd = Some(SLEEPER.into());
        cfg.cwd = Some(dir.path().to_path_buf());
        let src = ExecSource::new("sleepy", &cfg, policy()).unwrap();
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let err = src.fetch(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));

        #[cfg(target_os = "linux")]
        {
            let pid = read_pid(&dir.path().join("sleeper.pid")).await;
            assert_gone(&pid).await;
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_shell("slow", SLEEPER, dir.path(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("command exceeded"), "{err}");

        #[cfg(target_os = "linux")]
        {
            let pid = read_pid(&dir.path().join("sleeper.pid")).await;
            assert_gone(&pid).await;
        }
    }
}
