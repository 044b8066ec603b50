//! Managed process handles.
//!
//! A supervisor owns at most one live [`ProcessHandle`] at any time. The
//! child is spawned into its own process group so that everything it forks
//! can be terminated atomically, its output is line-streamed into the log
//! sink, and its exit is observed by a dedicated task so the supervisor can
//! confirm death without blocking.

use crate::config::Descriptor;
use crate::error::{Error, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Environment marker handed to every managed process.
pub const DEV_MODE_ENV: &str = "DEVWATCH_ENV";

/// Observed termination of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally (None when killed by a
    /// signal).
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn is_error(&self) -> bool {
        self.code != Some(0)
    }
}

/// Ownership of one live operating-system process and its process group.
pub struct ProcessHandle {
    service: String,
    pid: u32,
    pgid: Pid,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    /// Spawn the descriptor's run command in its own process group, with the
    /// supervisor's environment plus descriptor overrides plus the
    /// development-mode marker. Stdout and stderr are line-streamed to the
    /// log sink.
    pub fn spawn(descriptor: &Descriptor) -> Result<ProcessHandle> {
        let argv = descriptor.run_command();
        let service = descriptor.name.clone();

        tracing::debug!(service = %service, command = ?argv, "spawning");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&descriptor.dir)
            .envs(&descriptor.env)
            .env(DEV_MODE_ENV, "development")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // New process group so the whole descendant tree can be killed
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| Error::SpawnFailed {
            service: service.clone(),
            source: e,
        })?;

        let pid = child.id().ok_or_else(|| Error::SpawnFailed {
            service: service.clone(),
            source: std::io::Error::other("process exited before its pid could be read"),
        })?;

        let _ = stream_output(&service, child.stdout.take());
        let _ = stream_output(&service, child.stderr.take());

        // Exit observer: the only other task that ever touches this process,
        // and all it does is complete the watch channel.
        let (exit_tx, exit_rx) = watch::channel(None);
        let observer_service = service.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let exit = ProcessExit {
                code: status.as_ref().ok().and_then(|s| s.code()),
            };
            tracing::debug!(service = %observer_service, code = ?exit.code, "process exited");
            let _ = exit_tx.send(Some(exit));
        });

        Ok(ProcessHandle {
            service,
            pid,
            // process_group(0) makes the child the leader of a fresh group,
            // so the group id equals its pid
            pgid: Pid::from_raw(pid as i32),
            exit: exit_rx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The observed exit, if the process has died and been reaped.
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.exit().is_none()
    }

    /// Signal the whole process group, falling back to the process itself if
    /// the group signal is rejected.
    pub fn signal_group(&self, signal: Signal) -> nix::Result<()> {
        killpg(self.pgid, signal).or_else(|_| nix::sys::signal::kill(self.pgid, signal))
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("service", &self.service)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Run a command to completion in `dir`, streaming its output to the log
/// sink. Used for install and code-generation commands.
pub async fn run_streamed(
    service: &str,
    argv: &[String],
    dir: &Path,
    env: &HashMap<String, String>,
) -> Result<std::process::ExitStatus> {
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::Config(format!(
            "Service '{service}' has an empty command"
        )));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(dir)
        .envs(env)
        .env(DEV_MODE_ENV, "development")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| Error::SpawnFailed {
        service: service.to_string(),
        source: e,
    })?;

    let stdout_task = stream_output(service, child.stdout.take());
    let stderr_task = stream_output(service, child.stderr.take());

    let status = child.wait().await?;

    // Let the pipes drain so no trailing output is lost
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    Ok(status)
}

/// Forward each line of a child stream to the log sink with the service name
/// attached. The task ends when the stream hits EOF.
fn stream_output(
    service: &str,
    stream: Option<impl AsyncRead + Unpin + Send + 'static>,
) -> JoinHandle<()> {
    let service = service.to_string();
    tokio::spawn(async move {
        if let Some(stream) = stream {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(service = %service, "{line}");
            }
        }
    })
}
