//! Child process spawning and I/O pumping.
//!
//! This module launches a shell command and turns its lifetime into a stream
//! of [`ChildEvent`]s:
//! - stdout/stderr are read in chunks as they arrive
//! - signals can be delivered while the child is still unreaped
//! - on unix the child leads its own process group, and signals go to the
//!   whole group so commands started by the shell die with it
//! - exactly one `Exit` event is sent, after both output streams are drained
//!
//! Record keeping (status, ring buffer, persistence) lives in
//! [`crate::process::ProcessTable`]; this module only talks to the OS.
//!
//! # Event order
//!
//! ```text
//! Output* ... Output* Exit
//! ```
//!
//! Output from stdout and stderr interleaves in arrival order. `Exit` is
//! always last, and is sent even when a pipe is held open by a background job
//! (after a short drain grace period).
//!
//! # Signals
//!
//! [`ChildControl::signal`] queues a signal for the task that owns the child.
//! Delivery happens only while the child is unreaped, so a recycled pid can
//! never be hit. On platforms without signals every request is a forced kill.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::shell::{build_login_shell_command, ShellError};

const READ_BUFFER_SIZE: usize = 4096;

/// How long to keep draining pipes after exit; background jobs can hold them open.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Signals that can be requested through `kill`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Signal {
    #[default]
    Term,
    Kill,
    Int,
    Hup,
}

impl Signal {
    /// Conventional name, e.g. `SIGTERM`. Used in exit frames and snapshots.
    pub fn name(self) -> &'static str {
        match self {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Int => "SIGINT",
            Signal::Hup => "SIGHUP",
        }
    }

    #[cfg(unix)]
    fn raw(self) -> i32 {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Int => libc::SIGINT,
            Signal::Hup => libc::SIGHUP,
        }
    }

    #[cfg(unix)]
    fn from_raw(raw: i32) -> Option<Self> {
        [Signal::Term, Signal::Kill, Signal::Int, Signal::Hup]
            .into_iter()
            .find(|s| s.raw() == raw)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown signal: {0}")]
pub struct UnknownSignal(pub String);

impl FromStr for Signal {
    type Err = UnknownSignal;

    /// Accepts `SIGTERM`, `term`, `sigkill`, ... (case-insensitive, prefix optional).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "TERM" => Ok(Signal::Term),
            "KILL" => Ok(Signal::Kill),
            "INT" => Ok(Signal::Int),
            "HUP" => Ok(Signal::Hup),
            _ => Err(UnknownSignal(s.to_string())),
        }
    }
}

/// How a child terminated.
///
/// Exactly one of the two fields is normally set: `code` for a regular exit,
/// `signal` for a signal death. Both are `None` when the wait itself failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Signal name such as `SIGKILL`, or `SIG<n>` for signals without a name here.
    pub signal: Option<String>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: exit_signal_name(&status),
        }
    }

    fn lost(reason: &str) -> Self {
        log::warn!("Lost track of child process: {}", reason);
        Self {
            code: None,
            signal: None,
        }
    }
}

#[cfg(unix)]
fn exit_signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|raw| match Signal::from_raw(raw) {
        Some(sig) => sig.name().to_string(),
        None => format!("SIG{}", raw),
    })
}

#[cfg(not(unix))]
fn exit_signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

/// Events emitted by a running child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Output { stream: StreamKind, data: String },
    Exit(ExitInfo),
}

/// Configuration for spawning a child.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Shell code to run.
    pub command: String,
    /// Working directory for the process
    pub working_dir: Option<String>,
    /// Custom shell prefix (e.g., "/bin/zsh -l -c")
    pub shell_prefix: Option<String>,
}

impl SpawnConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            shell_prefix: None,
        }
    }

    /// Run in `dir` instead of the daemon's working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Override the login-shell wrapper, e.g. `/bin/bash -l -c`.
    pub fn shell_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shell_prefix = Some(prefix.into());
        self
    }
}

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error("Failed to spawn: {0}")]
    Io(#[from] std::io::Error),
}

/// Control handle for a spawned child.
///
/// Dropping the handle does not kill the child; the pump task keeps reaping
/// it until it exits on its own.
#[derive(Debug, Clone)]
pub struct ChildControl {
    signals: mpsc::UnboundedSender<Signal>,
}

impl ChildControl {
    /// Queue a signal for delivery. Returns false once the child has been reaped.
    pub fn signal(&self, signal: Signal) -> bool {
        self.signals.send(signal).is_ok()
    }
}

/// A running child process.
pub struct ChildProcess {
    pub pid: Option<u32>,
    pub control: ChildControl,
    pub events: mpsc::UnboundedReceiver<ChildEvent>,
}

impl ChildProcess {
    /// Spawn a child under the login shell.
    ///
    /// Must be called from within a tokio runtime; returns as soon as the OS
    /// process exists and never waits for it. stdin is closed, stdout and
    /// stderr are piped into [`ChildEvent::Output`].
    ///
    /// # Arguments
    /// * `config` - command, working directory and optional shell prefix
    ///
    /// # Errors
    /// * [`SpawnError::Shell`] when the command or shell prefix is unusable
    /// * [`SpawnError::Io`] when the OS refuses to start the shell (missing
    ///   binary, bad working directory, ...)
    pub fn spawn(config: SpawnConfig) -> Result<Self, SpawnError> {
        let mut cmd = build_login_shell_command(
            &config.command,
            config.working_dir.as_deref(),
            config.shell_prefix.as_deref(),
        )?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let readers = [
            child
                .stdout
                .take()
                .map(|s| tokio::spawn(pump_stream(s, StreamKind::Stdout, event_tx.clone()))),
            child
                .stderr
                .take()
                .map(|s| tokio::spawn(pump_stream(s, StreamKind::Stderr, event_tx.clone()))),
        ];

        tokio::spawn(async move {
            let exit = wait_for_exit(&mut child, signal_rx).await;
            // Output must reach consumers before the exit event.
            for mut reader in readers.into_iter().flatten() {
                if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut reader).await.is_err() {
                    reader.abort();
                }
            }
            let _ = event_tx.send(ChildEvent::Exit(exit));
        });

        Ok(Self {
            pid,
            control: ChildControl { signals: signal_tx },
            events: event_rx,
        })
    }
}

async fn wait_for_exit(child: &mut Child, mut signals: mpsc::UnboundedReceiver<Signal>) -> ExitInfo {
    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => ExitInfo::from_status(status),
                    Err(e) => ExitInfo::lost(&e.to_string()),
                };
            }
            Some(signal) = signals.recv() => deliver_signal(child, signal),
        }
    }
}

#[cfg(unix)]
fn deliver_signal(child: &mut Child, signal: Signal) {
    // `id()` is None once reaped, so the pid cannot have been recycled.
    // The child leads its group, so the group id is its pid.
    if let Some(pid) = child.id() {
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal.raw()) };
        if rc != 0 {
            log::warn!(
                "Failed to deliver {} to process group {}: {}",
                signal,
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn deliver_signal(child: &mut Child, _signal: Signal) {
    if let Err(e) = child.start_kill() {
        log::warn!("Failed to kill child: {}", e);
    }
}

async fn pump_stream<R>(mut stream: R, kind: StreamKind, tx: mpsc::UnboundedSender<ChildEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                if tx.send(ChildEvent::Output { stream: kind, data }).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::debug!("{:?} read error, dropping rest of stream: {}", kind, e);
                break;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod signal {
        use super::*;

        #[test]
        fn parses_with_and_without_prefix() {
            assert_eq!("SIGTERM".parse::<Signal>(), Ok(Signal::Term));
            assert_eq!("kill".parse::<Signal>(), Ok(Signal::Kill));
            assert_eq!("SigInt".parse::<Signal>(), Ok(Signal::Int));
            assert_eq!(" hup ".parse::<Signal>(), Ok(Signal::Hup));
        }

        #[test]
        fn rejects_unknown_names() {
            let err = "SIGWINCH".parse::<Signal>().unwrap_err();
            assert_eq!(err.to_string(), "Unknown signal: SIGWINCH");
        }

        #[test]
        fn default_is_graceful() {
            assert_eq!(Signal::default(), Signal::Term);
        }
    }

    #[test]
    fn stream_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&StreamKind::Stderr).unwrap(), "\"stderr\"");
    }

    #[test]
    fn spawn_config_builder() {
        let config = SpawnConfig::new("ls -la")
            .working_dir("/tmp")
            .shell_prefix("/bin/sh -c");
        assert_eq!(config.command, "ls -la");
        assert_eq!(config.working_dir.as_deref(), Some("/tmp"));
        assert_eq!(config.shell_prefix.as_deref(), Some("/bin/sh -c"));
    }

    #[cfg(unix)]
    async fn collect(mut child: ChildProcess) -> (String, String, ExitInfo) {
        let (mut out, mut err) = (String::new(), String::new());
        while let Some(event) = child.events.recv().await {
            match event {
                ChildEvent::Output { stream: StreamKind::Stdout, data } => out.push_str(&data),
                ChildEvent::Output { stream: StreamKind::Stderr, data } => err.push_str(&data),
                ChildEvent::Exit(exit) => return (out, err, exit),
            }
        }
        panic!("event stream ended without exit");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn captures_both_streams_then_exit() {
        let child = ChildProcess::spawn(
            SpawnConfig::new("echo out; echo err 1>&2; exit 3").shell_prefix("/bin/sh -c"),
        )
        .unwrap();
        assert!(child.pid.is_some());

        let (out, err, exit) = collect(child).await;
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.signal, None);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn signal_terminates_child() {
        let child =
            ChildProcess::spawn(SpawnConfig::new("exec sleep 30").shell_prefix("/bin/sh -c"))
                .unwrap();
        assert!(child.control.signal(Signal::Kill));

        let (_, _, exit) = collect(child).await;
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
    }

    /// Alive and not a zombie waiting to be reaped by init.
    #[cfg(target_os = "linux")]
    fn pid_is_alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_dead(pid: i32) -> bool {
        for _ in 0..40 {
            if !pid_is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    #[cfg(target_os = "linux")]
    async fn signal_reaches_commands_started_by_the_shell() {
        let mut child = ChildProcess::spawn(
            SpawnConfig::new("sleep 30 & echo $!; wait").shell_prefix("/bin/sh -c"),
        )
        .unwrap();
        let sleeper: i32 = match child.events.recv().await {
            Some(ChildEvent::Output { data, .. }) => data.trim().parse().unwrap(),
            other => panic!("expected the background pid, got {:?}", other),
        };
        assert!(pid_is_alive(sleeper));

        assert!(child.control.signal(Signal::Kill));
        let (_, _, exit) = collect(child).await;
        assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
        assert!(wait_until_dead(sleeper).await, "pid {} outlived its shell", sleeper);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn missing_shell_fails_to_spawn() {
        let result = ChildProcess::spawn(
            SpawnConfig::new("true").shell_prefix("/nonexistent/shell -c"),
        );
        assert!(matches!(result, Err(SpawnError::Io(_))));
    }
}
