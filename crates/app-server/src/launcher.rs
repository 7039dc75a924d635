//! Process launcher: spawns the agent binary with piped stdio and tears
//! the whole process tree down again.
//!
//! On POSIX the child is made the leader of a fresh process group so a
//! single signal reaps any grandchildren the agent forks. Termination is
//! SIGTERM to the group, a one-second grace wait, then SIGKILL; the exit
//! status is always reaped.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use car_domain::error::{Error, Result};

/// How many trailing stderr lines are kept for disconnect diagnostics.
const STDERR_TAIL_LINES: usize = 5;

const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// A spawned agent subprocess with its pipes split out.
pub struct AgentProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub pid: Option<u32>,
    /// Process-group id when the child was made a group leader.
    pub pgid: Option<i32>,
    /// Ring of the last few stderr lines, fed by a background drain task.
    pub stderr_tail: StderrTail,
    pub stderr_task: Option<JoinHandle<()>>,
}

/// Shared ring buffer of trailing stderr lines.
#[derive(Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

/// Spawn the agent with piped stdio. Spawn failures surface as typed
/// errors without any internal retry; retrying is the supervisor's job.
pub fn spawn_agent(
    argv: &[String],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
) -> Result<AgentProcess> {
    let program = argv
        .first()
        .ok_or_else(|| Error::Config("agent command must not be empty".into()))?;
    let mut cmd = Command::new(program);
    cmd.args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Spawn(format!("failed to spawn {program}: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Spawn("child stdin unavailable".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Spawn("child stdout unavailable".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Spawn("child stderr unavailable".into()))?;

    let pid = child.id();
    // process_group(0) makes the child its own group leader, so the group
    // id equals the child pid.
    #[cfg(unix)]
    let pgid = pid.map(|p| p as i32);
    #[cfg(not(unix))]
    let pgid = None;

    let stderr_tail = StderrTail::default();
    let stderr_task = {
        let tail = stderr_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                tracing::debug!(line_len = trimmed.len(), "app_server.stderr");
                tail.push(trimmed.to_string());
            }
        })
    };

    Ok(AgentProcess {
        child,
        stdin,
        stdout,
        pid,
        pgid,
        stderr_tail,
        stderr_task: Some(stderr_task),
    })
}

impl AgentProcess {
    /// Terminate the process tree and reap the exit status.
    pub async fn terminate(mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        terminate_child(&mut self.child, self.pgid).await;
    }
}

/// SIGTERM the group (or the child), wait up to the grace period, then
/// SIGKILL. Always waits until the exit status is observable.
pub async fn terminate_child(child: &mut Child, pgid: Option<i32>) {
    if child.try_wait().ok().flatten().is_some() {
        return;
    }
    signal_group(child, pgid, Signal::Term);
    if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
        return;
    }
    signal_group(child, pgid, Signal::Kill);
    let _ = child.kill().await;
    let _ = child.wait().await;
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, pgid: Option<i32>, signal: Signal) {
    let signum = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    if let Some(pgid) = pgid {
        unsafe {
            libc::killpg(pgid, signum);
        }
    } else if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, signum);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pgid: Option<i32>, signal: Signal) {
    if matches!(signal, Signal::Kill) {
        let _ = child.start_kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn spawn_missing_binary_is_typed_error() {
        let err = spawn_agent(
            &["definitely-not-a-real-binary-xyz".into()],
            None,
            &HashMap::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Spawn(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn empty_command_is_config_error() {
        let err = spawn_agent(&[], None, &HashMap::new()).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn stderr_tail_keeps_last_lines() {
        let proc = spawn_agent(
            &sh("for i in 1 2 3 4 5 6 7; do echo line-$i 1>&2; done"),
            None,
            &HashMap::new(),
        )
        .unwrap();
        let tail = proc.stderr_tail.clone();
        // Give the tail task time to drain before terminating.
        tokio::time::sleep(Duration::from_millis(300)).await;
        proc.terminate().await;
        let lines = tail.snapshot();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines.last().map(String::as_str), Some("line-7"));
    }

    #[tokio::test]
    async fn env_is_passed_through() {
        let mut env = HashMap::new();
        env.insert("CAR_TEST_MARKER".to_string(), "present".to_string());
        let mut proc = spawn_agent(&sh("printf '%s' \"$CAR_TEST_MARKER\""), None, &env).unwrap();
        let mut output = String::new();
        use tokio::io::AsyncReadExt;
        proc.stdout.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "present");
        proc.terminate().await;
    }

    #[tokio::test]
    async fn terminate_kills_stubborn_process() {
        let proc = spawn_agent(&sh("trap '' TERM; sleep 60"), None, &HashMap::new()).unwrap();
        let started = std::time::Instant::now();
        proc.terminate().await;
        // SIGTERM is trapped, so this exercises the SIGKILL escalation and
        // must not hang anywhere near the sleep duration.
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
