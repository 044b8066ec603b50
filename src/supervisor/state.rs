//! The lifecycle state machine.
//!
//! Each supervisor drives exactly one [`State`] value through the loop in
//! `supervisor::Supervisor::run`: `wait()` performs the current state's
//! blocking work, then the next queued action (or the state's default) is fed
//! to `step()` to compute the successor state. Every variant owns exactly the
//! data it needs: Running owns the live process handle, the stopping family
//! owns the dying one, Stopped owns the last error.
//!
//! Illegal (state, action) pairs, spawn failures and kill failures all route
//! to `Invalid`: they signal misconfiguration or an ordering bug that
//! retrying will not fix, so the supervisor freezes and relies on the log
//! sink for visibility while other services keep running.

use super::process::{run_streamed, ProcessHandle};
use super::{Action, Ctx};
use crate::error::Error;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Idle tick between polls in Running and Stopped, and the settle pause in
/// Starting. Matches the restart debounce window.
const IDLE_INTERVAL: Duration = Duration::from_millis(250);

/// Interval between readiness probes while blocked on dependencies.
const DEPENDENCY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Exponential backoff while waiting for a signalled process to die.
const KILL_BACKOFF_START: Duration = Duration::from_millis(100);
const KILL_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// How long a process gets to exit after SIGTERM before SIGKILL is sent.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Observable state of a supervisor, without the owned data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Initializing,
    Starting,
    Installing,
    Dependencies,
    Running,
    Stopping,
    Restarting,
    Ending,
    Stopped,
    Ended,
    Invalid,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Initializing => "initializing",
            StateKind::Starting => "starting",
            StateKind::Installing => "installing",
            StateKind::Dependencies => "dependencies",
            StateKind::Running => "running",
            StateKind::Stopping => "stopping",
            StateKind::Restarting => "restarting",
            StateKind::Ending => "ending",
            StateKind::Stopped => "stopped",
            StateKind::Ended => "ended",
            StateKind::Invalid => "invalid",
        };
        write!(f, "{name}")
    }
}

pub(crate) enum State {
    Initializing,
    Starting,
    Installing {
        /// Install failure recorded by `wait()`, surfaced by `step()`.
        error: Option<String>,
    },
    Dependencies,
    Running {
        process: Option<ProcessHandle>,
        /// Spawn failure recorded by `wait()`; routes to Invalid.
        failure: Option<String>,
    },
    Stopping {
        process: Option<ProcessHandle>,
        /// Kill failure recorded by `wait()`; routes to Invalid.
        failure: Option<String>,
    },
    Restarting {
        process: Option<ProcessHandle>,
        failure: Option<String>,
    },
    Ending {
        process: Option<ProcessHandle>,
        failure: Option<String>,
    },
    Stopped {
        error: Option<String>,
    },
    Ended,
    Invalid {
        error: String,
    },
}

impl State {
    pub(crate) fn kind(&self) -> StateKind {
        match self {
            State::Initializing => StateKind::Initializing,
            State::Starting => StateKind::Starting,
            State::Installing { .. } => StateKind::Installing,
            State::Dependencies => StateKind::Dependencies,
            State::Running { .. } => StateKind::Running,
            State::Stopping { .. } => StateKind::Stopping,
            State::Restarting { .. } => StateKind::Restarting,
            State::Ending { .. } => StateKind::Ending,
            State::Stopped { .. } => StateKind::Stopped,
            State::Ended => StateKind::Ended,
            State::Invalid { .. } => StateKind::Invalid,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, State::Ended | State::Invalid { .. })
    }

    pub(crate) fn default_action(&self) -> Action {
        Action::Nothing
    }

    /// Perform the state's blocking work.
    ///
    /// Returns an action when the wait was preempted by one (only the
    /// Dependencies wait is preemptible); the caller must consume it instead
    /// of reading the queue again.
    pub(crate) async fn wait(
        &mut self,
        ctx: &Ctx,
        actions: &mut mpsc::Receiver<Action>,
    ) -> Option<Action> {
        let service = ctx.descriptor.name.as_str();
        match self {
            State::Initializing | State::Ended => None,

            State::Invalid { error } => {
                tracing::error!(service, "{error}");
                None
            }

            // Let a burst of filesystem events settle before deciding how to
            // come up.
            State::Starting => {
                sleep(IDLE_INTERVAL).await;
                None
            }

            State::Installing { error } => {
                tracing::info!(service, "Installing...");
                let descriptor = &ctx.descriptor;
                *error = match run_streamed(
                    service,
                    &descriptor.install,
                    &descriptor.dir,
                    &descriptor.env,
                )
                .await
                {
                    Ok(status) if status.success() => None,
                    Ok(status) => Some(
                        Error::InstallFailed(
                            service.to_string(),
                            format!("install command exited with {status}"),
                        )
                        .to_string(),
                    ),
                    Err(e) => Some(e.to_string()),
                };
                None
            }

            State::Dependencies => {
                let dependencies = ctx.dependencies();
                let mut announced = false;
                loop {
                    let mut blocking = None;
                    for dependency in &dependencies {
                        if !dependency.is_ready().await {
                            blocking = Some(dependency.name().to_string());
                            break;
                        }
                    }
                    let Some(blocking) = blocking else {
                        return None;
                    };
                    if !announced {
                        tracing::info!(service, "Waiting for {blocking} to be ready...");
                        announced = true;
                    }
                    // A stop or end request must interrupt this wait promptly
                    // rather than letting it run to completion.
                    tokio::select! {
                        action = actions.recv() => {
                            match action {
                                Some(action) => return Some(action),
                                // sender gone: nothing can preempt, keep polling
                                None => sleep(DEPENDENCY_POLL_INTERVAL).await,
                            }
                        }
                        _ = sleep(DEPENDENCY_POLL_INTERVAL) => {}
                    }
                }
            }

            State::Running { process, failure } => {
                if process.is_none() && failure.is_none() {
                    tracing::info!(service, "Running...");
                    match ProcessHandle::spawn(&ctx.descriptor) {
                        Ok(handle) => {
                            ctx.set_pid(Some(handle.pid()));
                            *process = Some(handle);
                        }
                        Err(e) => *failure = Some(e.to_string()),
                    }
                }
                sleep(IDLE_INTERVAL).await;
                None
            }

            State::Stopping { process, failure }
            | State::Restarting { process, failure }
            | State::Ending { process, failure } => {
                match wait_for_death(service, process.as_ref()).await {
                    Ok(()) => ctx.set_pid(None),
                    Err(error) => *failure = Some(error.to_string()),
                }
                None
            }

            State::Stopped { error } => {
                if let Some(error) = error.take() {
                    tracing::error!(service, "{error}");
                }
                sleep(IDLE_INTERVAL).await;
                None
            }
        }
    }

    /// The transition function: feed an action to the current state and get
    /// the successor.
    pub(crate) fn step(self, action: Action, ctx: &Ctx) -> State {
        use Action::*;

        match (self, action) {
            (State::Initializing, Nothing | Start) => State::Starting,
            (State::Initializing, Stop) => State::Stopped { error: None },
            (State::Initializing, End) => State::Ended,

            (State::Starting, Nothing) => {
                if !ctx.descriptor.has_run_command() {
                    State::Installing { error: None }
                } else if ctx.descriptor.has_dependencies() {
                    State::Dependencies
                } else {
                    State::running()
                }
            }
            (state @ State::Starting, Start) => state,

            (State::Installing { error: Some(error) }, Nothing) => State::Stopped {
                error: Some(error),
            },
            (State::Installing { .. }, Nothing) => {
                if ctx.descriptor.has_dependencies() {
                    State::Dependencies
                } else {
                    State::running()
                }
            }
            // A restart requested mid-install is already satisfied by the
            // install in progress.
            (state @ State::Installing { .. }, Restart | Start) => state,

            (State::Dependencies, Nothing) => State::running(),
            (State::Dependencies, Stop) => State::Stopping {
                process: None,
                failure: None,
            },
            (State::Dependencies, End) => State::Ending {
                process: None,
                failure: None,
            },
            (state @ State::Dependencies, Start) => state,

            (State::Running { failure: Some(failure), .. }, _) => State::Invalid { error: failure },
            (State::Running { process, .. }, Nothing) => {
                match process.as_ref().and_then(ProcessHandle::exit) {
                    Some(exit) => {
                        ctx.set_pid(None);
                        State::Stopped {
                            error: exit.is_error().then(|| match exit.code {
                                Some(code) => {
                                    format!("process exited unexpectedly with code {code}")
                                }
                                None => "process was terminated by a signal".to_string(),
                            }),
                        }
                    }
                    None => State::Running {
                        process,
                        failure: None,
                    },
                }
            }
            (State::Running { process, .. }, Stop) => State::Stopping {
                process,
                failure: None,
            },
            (State::Running { process, .. }, Restart) => {
                if process.as_ref().is_some_and(ProcessHandle::is_alive) {
                    State::Restarting {
                        process,
                        failure: None,
                    }
                } else {
                    ctx.set_pid(None);
                    State::Starting
                }
            }
            (State::Running { process, .. }, End) => State::Ending {
                process,
                failure: None,
            },
            (state @ State::Running { .. }, Start) => state,

            (
                State::Stopping { failure: Some(failure), .. }
                | State::Restarting { failure: Some(failure), .. }
                | State::Ending { failure: Some(failure), .. },
                _,
            ) => State::Invalid { error: failure },
            (State::Stopping { .. }, Nothing) => State::Stopped { error: None },
            (State::Restarting { .. }, Nothing) => State::Starting,
            (State::Ending { .. }, Nothing) => State::Ended,
            (
                state @ (State::Stopping { .. } | State::Restarting { .. } | State::Ending { .. }),
                Start,
            ) => state,

            (state @ State::Stopped { .. }, Nothing) => state,
            (State::Stopped { .. }, Restart | Start) => State::Starting,
            (State::Stopped { .. }, End) => State::Ended,

            (State::Ended, _) => State::Ended,
            (state @ State::Invalid { .. }, _) => state,

            (state, action) => {
                let error = Error::InvalidAction {
                    state: state.kind().to_string(),
                    action: action.to_string(),
                }
                .to_string();
                State::Invalid { error }
            }
        }
    }

    fn running() -> State {
        State::Running {
            process: None,
            failure: None,
        }
    }
}

/// Signal the process group and wait until the exit observer confirms death,
/// backing off exponentially. There is no hard deadline; SIGTERM escalates to
/// SIGKILL after the grace period.
async fn wait_for_death(service: &str, process: Option<&ProcessHandle>) -> Result<(), Error> {
    let Some(handle) = process else {
        return Ok(());
    };
    if handle.exit().is_some() {
        return Ok(());
    }

    tracing::info!(service, "Stopping...");
    if let Err(errno) = handle.signal_group(Signal::SIGTERM) {
        // ESRCH means the group is already gone; the observer will confirm
        if errno != Errno::ESRCH {
            return Err(Error::KillFailed {
                service: service.to_string(),
                reason: format!("could not signal process group: {errno}"),
            });
        }
    }

    let signalled = tokio::time::Instant::now();
    let mut backoff = KILL_BACKOFF_START;
    let mut killed = false;
    loop {
        if handle.exit().is_some() {
            return Ok(());
        }
        sleep(backoff).await;
        backoff = (backoff * 2).min(KILL_BACKOFF_CAP);

        if !killed && signalled.elapsed() >= KILL_GRACE_PERIOD {
            tracing::warn!(service, "no exit after SIGTERM grace period, sending SIGKILL");
            if let Err(errno) = handle.signal_group(Signal::SIGKILL) {
                if errno != Errno::ESRCH {
                    return Err(Error::KillFailed {
                        service: service.to_string(),
                        reason: format!("could not kill process group: {errno}"),
                    });
                }
            }
            killed = true;
        }
    }
}
