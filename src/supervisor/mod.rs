//! Per-service lifecycle supervision.
//!
//! A [`Supervisor`] owns one service descriptor, two watch subscriptions
//! (sources and proto inputs), a pair of debouncers and a single sequential
//! driving loop. External intents are injected through a single-slot action
//! hand-off; the loop consumes them strictly in order, interleaved with each
//! state's own blocking work.

pub mod process;
mod state;

pub use state::StateKind;

use crate::codegen;
use crate::config::Descriptor;
use crate::debounce::Debouncer;
use crate::probe::{HttpProbe, Probe};
use crate::registry::Registry;
use crate::watch::{self, Change, WatchHandle};
use notify::event::EventKind;
use state::State;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch as watch_ch};

/// Debounce window for restart and regeneration intents.
const ACTION_DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);

/// Debounce window for coalescing raw filesystem noise.
const FS_DEBOUNCE_WINDOW: Duration = Duration::from_millis(5);

/// An intent injected into a supervisor's action queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Idle poll; also each state's default when nothing is queued.
    Nothing,
    Start,
    Stop,
    Restart,
    End,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Nothing => "nothing",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::End => "end",
        };
        write!(f, "{name}")
    }
}

/// Read-only context threaded through every state of one supervisor.
#[derive(Clone)]
pub(crate) struct Ctx {
    pub(crate) descriptor: Arc<Descriptor>,
    pub(crate) registry: Weak<Registry>,
    /// Pid of the currently live managed process, for observability.
    pub(crate) pid: Arc<parking_lot::Mutex<Option<u32>>>,
}

impl Ctx {
    /// Resolve the declared dependency names against the registry.
    /// Unresolvable names are a configuration error, silently dropped.
    pub(crate) fn dependencies(&self) -> Vec<Arc<Supervisor>> {
        self.registry
            .upgrade()
            .map(|registry| registry.resolve(&self.descriptor.dependencies))
            .unwrap_or_default()
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock() = pid;
    }
}

/// The per-service lifecycle supervisor.
pub struct Supervisor {
    ctx: Ctx,
    /// Self-reference for the watcher and debouncer callbacks; a supervisor
    /// only ever lives inside an `Arc`.
    weak_self: Weak<Supervisor>,
    actions_tx: mpsc::Sender<Action>,
    /// Taken by the driving loop on first `start()`.
    actions_rx: parking_lot::Mutex<Option<mpsc::Receiver<Action>>>,
    status_tx: watch_ch::Sender<StateKind>,
    status_rx: watch_ch::Receiver<StateKind>,
    done_tx: watch_ch::Sender<bool>,
    done_rx: watch_ch::Receiver<bool>,
    started: AtomicBool,
    action_debounce: Debouncer,
    fs_debounce: Debouncer,
    readiness: Box<dyn Probe>,
    liveness: Box<dyn Probe>,
    watches: parking_lot::Mutex<Vec<WatchHandle>>,
    runtime: tokio::runtime::Handle,
}

impl Supervisor {
    /// Create the supervisor and establish its watch subscriptions. Must be
    /// called from within the tokio runtime; the driving loop is only
    /// spawned by the first `start()`.
    pub(crate) fn new(descriptor: Descriptor, registry: Weak<Registry>) -> Arc<Supervisor> {
        let status_port = descriptor.status_port;
        let ctx = Ctx {
            descriptor: Arc::new(descriptor),
            registry,
            pid: Arc::new(parking_lot::Mutex::new(None)),
        };

        let (actions_tx, actions_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch_ch::channel(StateKind::Initializing);
        let (done_tx, done_rx) = watch_ch::channel(false);

        let supervisor = Arc::new_cyclic(|weak_self| Supervisor {
            ctx,
            weak_self: weak_self.clone(),
            actions_tx,
            actions_rx: parking_lot::Mutex::new(Some(actions_rx)),
            status_tx,
            status_rx,
            done_tx,
            done_rx,
            started: AtomicBool::new(false),
            action_debounce: Debouncer::new(ACTION_DEBOUNCE_WINDOW),
            fs_debounce: Debouncer::new(FS_DEBOUNCE_WINDOW),
            readiness: Box::new(HttpProbe::readiness(status_port)),
            liveness: Box::new(HttpProbe::liveness(status_port)),
            watches: parking_lot::Mutex::new(Vec::new()),
            runtime: tokio::runtime::Handle::current(),
        });

        supervisor.init_watchers();
        supervisor
    }

    pub fn name(&self) -> &str {
        &self.ctx.descriptor.name
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.ctx.descriptor
    }

    /// The supervisor's currently observable state.
    pub fn status(&self) -> StateKind {
        *self.status_rx.borrow()
    }

    /// Pid of the live managed process, if one is running.
    pub fn pid(&self) -> Option<u32> {
        *self.ctx.pid.lock()
    }

    /// True when the service reports it can accept requests.
    pub async fn is_ready(&self) -> bool {
        self.readiness.check().await
    }

    /// True when the service reports it has not hung or crashed.
    pub async fn is_alive(&self) -> bool {
        self.liveness.check().await
    }

    /// Start supervising. The first call spawns the driving loop; later
    /// calls deliver a `Start` action, which is a no-op unless the service
    /// is stopped.
    pub async fn start(&self) {
        if *self.done_rx.borrow() {
            return;
        }
        if !self.started.swap(true, Ordering::SeqCst) {
            let rx = self.actions_rx.lock().take();
            if let (Some(actions_rx), Some(supervisor)) = (rx, self.weak_self.upgrade()) {
                tokio::spawn(async move { supervisor.run(actions_rx).await });
            }
            return;
        }
        self.send_action(Action::Start).await;
    }

    /// Request a stop and block until the managed process is confirmed dead.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) || *self.done_rx.borrow() {
            return;
        }
        self.send_action(Action::Stop).await;
        let mut status = self.status_rx.clone();
        let _ = status
            .wait_for(|kind| {
                matches!(
                    kind,
                    StateKind::Stopped | StateKind::Ended | StateKind::Invalid
                )
            })
            .await;
    }

    /// Request termination and block until the driving loop has fully
    /// exited. Idempotent; delivery after termination is a no-op.
    pub async fn end(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            // Never started: nothing to unwind, just seal the supervisor
            let _ = self.done_tx.send(true);
            return;
        }
        self.send_action(Action::End).await;
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Request a restart. Debounced: a burst of calls within one window
    /// delivers a single `Restart`.
    pub fn restart(&self) {
        let Some(supervisor) = self.weak_self.upgrade() else {
            return;
        };
        self.action_debounce.debounce("restart", async move {
            supervisor.send_action(Action::Restart).await;
        });
    }

    /// Regenerate protobuf code. Debounced; independent of lifecycle state.
    pub fn generate_protos(&self) {
        let Some(supervisor) = self.weak_self.upgrade() else {
            return;
        };
        self.action_debounce.debounce("protos", async move {
            if let Err(error) = codegen::generate_protos(&supervisor.ctx.descriptor).await {
                tracing::error!(service = %supervisor.name(), %error, "proto generation failed");
            }
        });
    }

    /// Regenerate schema artifacts. Debounced; independent of lifecycle
    /// state.
    pub fn generate_schema(&self) {
        let Some(supervisor) = self.weak_self.upgrade() else {
            return;
        };
        self.action_debounce.debounce("schema", async move {
            if let Err(error) = codegen::generate_schema(&supervisor.ctx.descriptor).await {
                tracing::error!(service = %supervisor.name(), %error, "schema generation failed");
            }
        });
    }

    /// Deliver an action through the single-slot hand-off. A delivery made
    /// after the supervisor has terminated is a documented no-op, not an
    /// error: a caller must never deadlock against a finished loop.
    async fn send_action(&self, action: Action) {
        if *self.done_rx.borrow() {
            tracing::debug!(service = %self.name(), %action, "action after termination ignored");
            return;
        }
        if self.actions_tx.send(action).await.is_err() {
            tracing::debug!(service = %self.name(), %action, "action after termination ignored");
        }
    }

    /// The sequential driving loop: wait, pick the next action (queued or
    /// default), transition. Terminates only on a terminal state.
    async fn run(self: Arc<Self>, mut actions: mpsc::Receiver<Action>) {
        tracing::debug!(service = %self.name(), "supervisor starting");
        let mut current = State::Initializing;

        loop {
            let preempted = current.wait(&self.ctx, &mut actions).await;
            if current.is_terminal() {
                break;
            }

            let action = match preempted {
                Some(action) => action,
                None => actions
                    .try_recv()
                    .unwrap_or_else(|_| current.default_action()),
            };

            let from = current.kind();
            current = current.step(action, &self.ctx);
            let to = current.kind();
            if from != to {
                tracing::debug!(service = %self.name(), %from, %to, %action, "transition");
            }
            let _ = self.status_tx.send(to);
        }

        // Closing the queue turns any in-flight delivery into a no-op
        drop(actions);
        let _ = self.done_tx.send(true);
        tracing::debug!(service = %self.name(), "supervisor exited");
    }

    /// Establish the two watch subscriptions: one over the service's own
    /// source folders, one over the proto files it generates code from.
    fn init_watchers(&self) {
        let descriptor = Arc::clone(&self.ctx.descriptor);

        let handler = self.watch_handler(|supervisor, path, kind| {
            match watch::classify(&path, kind) {
                Change::Restart => supervisor.restart(),
                Change::GenerateProtos => supervisor.generate_protos(),
                Change::GenerateSchema => supervisor.generate_schema(),
            }
        });
        self.subscribe(&descriptor.folders, handler);

        if !descriptor.protos.is_empty() {
            // Changes to generation inputs always regenerate, never restart
            let handler =
                self.watch_handler(|supervisor, _path, _kind| supervisor.generate_protos());
            self.subscribe(&descriptor.proto_inputs(), handler);
        }
    }

    fn subscribe(&self, paths: &[PathBuf], handler: WatchEventHandler) {
        let weak = self.weak_self.clone();
        let runtime = self.runtime.clone();
        let on_error: Arc<dyn Fn(notify::Error) + Send + Sync> = Arc::new(move |error| {
            let Some(supervisor) = weak.upgrade() else {
                return;
            };
            tracing::error!(service = %supervisor.name(), %error, "watcher failed, stopping service");
            // notify delivers errors on its own thread; hop onto the runtime
            runtime.spawn(async move { supervisor.stop().await });
        });

        match watch::watch_paths(
            self.name(),
            paths,
            self.fs_debounce.clone(),
            handler,
            on_error,
        ) {
            Ok(handle) => self.watches.lock().push(handle),
            Err(error) => {
                tracing::error!(service = %self.name(), %error, "could not establish watch")
            }
        }
    }

    fn watch_handler(&self, handle: fn(Arc<Supervisor>, PathBuf, EventKind)) -> WatchEventHandler {
        let weak = self.weak_self.clone();
        Arc::new(move |path, kind| {
            if let Some(supervisor) = weak.upgrade() {
                handle(supervisor, path, kind);
            }
        })
    }
}

type WatchEventHandler = Arc<dyn Fn(PathBuf, EventKind) + Send + Sync>;

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}
