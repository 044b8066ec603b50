//! Integration tests for the lifecycle supervisor: the full state machine
//! driven against real processes in a temp service tree.

use devwatch::{Registry, StateKind, Supervisor};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn write_service(root: &Path, name: &str, config: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("devwatch.yaml"), config).unwrap();
}

async fn wait_for_status(supervisor: &Arc<Supervisor>, kind: StateKind, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if supervisor.status() == kind {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "service '{}' did not reach {kind}, still {}",
                supervisor.name(),
                supervisor.status()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_pid(supervisor: &Arc<Supervisor>, timeout: Duration) -> u32 {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(pid) = supervisor.pid() {
            return pid;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("service '{}' never exposed a pid", supervisor.name());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A service whose process exits immediately runs through
/// Initializing → Starting → Running, then the next poll observes the exit
/// and lands in Stopped without an error. Restart from Stopped brings it
/// back around.
#[tokio::test]
async fn short_lived_process_stops_cleanly_and_restarts() {
    let tmp = tempfile::tempdir().unwrap();
    write_service(tmp.path(), "echoer", "run: [echo, hi]\nstatus_port: 59801\n");

    let registry = Registry::discover(tmp.path(), &[]).unwrap();
    let supervisor = registry.get("echoer").unwrap();

    supervisor.start().await;
    wait_for_status(&supervisor, StateKind::Stopped, Duration::from_secs(5)).await;
    assert_eq!(supervisor.pid(), None);

    // Restart picks it up again: the machine leaves Stopped...
    supervisor.restart();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if supervisor.status() != StateKind::Stopped {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("restart from Stopped never left Stopped");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // ...and the process runs and exits once more
    wait_for_status(&supervisor, StateKind::Stopped, Duration::from_secs(5)).await;

    registry.shutdown().await;
}

/// Start while already Running is a no-op: the same process keeps running.
#[tokio::test]
async fn start_while_running_is_a_noop() {
    let tmp = tempfile::tempdir().unwrap();
    write_service(tmp.path(), "sleeper", "run: [sleep, \"30\"]\nstatus_port: 59802\n");

    let registry = Registry::discover(tmp.path(), &[]).unwrap();
    let supervisor = registry.get("sleeper").unwrap();

    supervisor.start().await;
    wait_for_status(&supervisor, StateKind::Running, Duration::from_secs(5)).await;
    let pid = wait_for_pid(&supervisor, Duration::from_secs(2)).await;

    supervisor.start().await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(supervisor.status(), StateKind::Running);
    assert_eq!(supervisor.pid(), Some(pid));

    registry.shutdown().await;
}

/// After stop() returns, the managed process and everything it forked into
/// the same process group have exited.
#[tokio::test]
async fn stop_kills_the_whole_process_group() {
    let tmp = tempfile::tempdir().unwrap();
    write_service(
        tmp.path(),
        "forker",
        "run: [sh, -c, \"sleep 30 & exec sleep 30\"]\nstatus_port: 59803\n",
    );

    let registry = Registry::discover(tmp.path(), &[]).unwrap();
    let supervisor = registry.get("forker").unwrap();

    supervisor.start().await;
    wait_for_status(&supervisor, StateKind::Running, Duration::from_secs(5)).await;
    let pid = wait_for_pid(&supervisor, Duration::from_secs(2)).await;

    supervisor.stop().await;
    assert_eq!(supervisor.status(), StateKind::Stopped);
    assert_eq!(supervisor.pid(), None);

    // The group leader is the spawned pid; signalling the group must now
    // fail because every member (including the forked child) is gone.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let group = nix::unistd::Pid::from_raw(pid as i32);
    assert!(
        nix::sys::signal::killpg(group, None).is_err(),
        "process group {pid} still has live members"
    );

    registry.shutdown().await;
}

/// Once End is processed the supervisor loop has exited and every further
/// delivery is a silent no-op.
#[tokio::test]
async fn end_is_terminal_and_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    write_service(tmp.path(), "sleeper", "run: [sleep, \"30\"]\nstatus_port: 59804\n");

    let registry = Registry::discover(tmp.path(), &[]).unwrap();
    let supervisor = registry.get("sleeper").unwrap();

    supervisor.start().await;
    wait_for_status(&supervisor, StateKind::Running, Duration::from_secs(5)).await;
    let pid = wait_for_pid(&supervisor, Duration::from_secs(2)).await;

    supervisor.end().await;
    assert_eq!(supervisor.status(), StateKind::Ended);

    // The managed process died with the loop
    tokio::time::sleep(Duration::from_millis(200)).await;
    let group = nix::unistd::Pid::from_raw(pid as i32);
    assert!(nix::sys::signal::killpg(group, None).is_err());

    // All of these are documented no-ops now
    supervisor.end().await;
    supervisor.stop().await;
    supervisor.start().await;
    supervisor.restart();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(supervisor.status(), StateKind::Ended);
}

/// Ending a supervisor that was never started seals it without hanging.
#[tokio::test]
async fn end_before_start_is_a_noop() {
    let tmp = tempfile::tempdir().unwrap();
    write_service(tmp.path(), "idle", "run: [sleep, \"30\"]\nstatus_port: 59805\n");

    let registry = Registry::discover(tmp.path(), &[]).unwrap();
    let supervisor = registry.get("idle").unwrap();

    supervisor.end().await;
    supervisor.stop().await;
    supervisor.start().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    // Sealed: the loop never ran and never will
    assert_eq!(supervisor.status(), StateKind::Initializing);
}

/// A failing install surfaces as Stopped with the error logged, and the
/// service can be asked to try again.
#[tokio::test]
async fn install_failure_lands_in_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    // No run command, so the supervisor installs first; the install fails
    write_service(
        tmp.path(),
        "broken",
        "install: [sh, -c, \"exit 1\"]\nstatus_port: 59806\n",
    );

    let registry = Registry::discover(tmp.path(), &[]).unwrap();
    let supervisor = registry.get("broken").unwrap();

    supervisor.start().await;
    wait_for_status(&supervisor, StateKind::Stopped, Duration::from_secs(5)).await;

    registry.shutdown().await;
}
