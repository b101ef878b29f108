//! The lifecycle controller: the single owner of the VM's run.
//!
//! Signals, control socket commands and UI window events are all funneled
//! into one event queue; the controller multiplexes them against the
//! long-lived run future. Event sources never touch the machine directly,
//! they only enqueue.
//!
//! ```text
//! start/resume ─► Running ──┬─ run future resolves ──► guest stopped, exit 0
//!                           ├─ Stop ─────────────────► force stop, exit 0
//!                           ├─ RequestStop ──────────► guest ACPI-like nudge
//!                           └─ Suspend ──────────────► pause → save → exit 0
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use tartlet_core::error::{EngineError, Result};

/// Events accepted by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Immediate-but-graceful shutdown (SIGINT, control `stop`).
    Stop,
    /// Ask the guest OS to shut itself down (SIGUSR2, control
    /// `request-stop`).
    RequestStop,
    /// Suspend to disk (SIGUSR1, control `suspend`).
    Suspend,
    /// The UI window host reported its window closed (control
    /// `window-closed`); suspends when possible, stops otherwise.
    WindowClosed,
}

/// Cloneable sending side of the event queue.
///
/// Sends never block and never fail loudly: a full queue drops the event
/// (the queue is far deeper than any plausible signal burst) and a closed
/// queue means the controller is already past caring.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<LifecycleEvent>,
}

impl EventSender {
    /// Enqueues an event.
    pub fn send(&self, event: LifecycleEvent) {
        if let Err(err) = self.tx.try_send(event) {
            warn!(?event, error = %err, "lifecycle event dropped");
        }
    }
}

/// Creates the event queue shared by all event sources.
#[must_use]
pub fn event_channel() -> (EventSender, mpsc::Receiver<LifecycleEvent>) {
    let (tx, rx) = mpsc::channel(64);
    (EventSender { tx }, rx)
}

/// The machine operations the controller needs.
///
/// The macOS adapter wraps the virtualization framework; tests drive the
/// controller with a scripted mock.
#[async_trait]
pub trait MachineHandle: Send + Sync {
    /// Starts the VM, optionally into recovery.
    async fn start(&self, recovery: bool) -> Result<()>;
    /// Resumes a paused or freshly restored VM.
    async fn resume(&self) -> Result<()>;
    /// Restores saved machine state from `path`.
    async fn restore_state(&self, path: &Path) -> Result<()>;
    /// Force-stops the VM.
    async fn stop(&self) -> Result<()>;
    /// Delivers a stop request to the guest OS.
    fn request_stop(&self) -> Result<()>;
    /// Pauses the VM.
    async fn pause(&self) -> Result<()>;
    /// Saves the paused VM's state into `path`.
    async fn save_state(&self, path: &Path) -> Result<()>;
    /// Resolves when the VM has exited.
    async fn wait_until_stopped(&self) -> Result<()>;
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest shut down on its own (or after a stop request).
    GuestStopped,
    /// The engine force-stopped the VM.
    ForcedStop,
    /// The VM state was saved to disk; resume later with a fresh run.
    Suspended,
}

/// Provider of running-peer names for error enrichment; best-effort.
pub type PeerNames = Box<dyn Fn() -> Vec<String> + Send + Sync>;

/// Drives one VM from start (or resume) to exit.
pub struct LifecycleController {
    machine: Arc<dyn MachineHandle>,
    state_path: PathBuf,
    suspendable: bool,
    recovery: bool,
    peer_names: PeerNames,
    on_started: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl LifecycleController {
    /// Creates a controller for `machine`.
    ///
    /// `state_path` is where suspend writes (and resume reads) the saved
    /// machine state; `peer_names` enriches limit-exceeded start failures.
    pub fn new(
        machine: Arc<dyn MachineHandle>,
        state_path: PathBuf,
        suspendable: bool,
        recovery: bool,
        peer_names: PeerNames,
    ) -> Self {
        Self {
            machine,
            state_path,
            suspendable,
            recovery,
            peer_names,
            on_started: Mutex::new(None),
        }
    }

    /// Registers a callback fired once the VM has started (or resumed).
    /// The chrome bridge uses this to publish the remote-display URL.
    #[must_use]
    pub fn on_started(self, callback: impl FnOnce() + Send + 'static) -> Self {
        *self.on_started.lock().unwrap() = Some(Box::new(callback));
        self
    }

    /// Runs the VM until it terminates.
    ///
    /// With `resume` the saved state is restored and deleted before the VM
    /// continues, so a crash mid-resume cannot loop on stale state.
    pub async fn run(
        &self,
        resume: bool,
        mut events: mpsc::Receiver<LifecycleEvent>,
    ) -> Result<RunOutcome> {
        if resume {
            println!("restoring VM state...");
            self.machine.restore_state(&self.state_path).await?;
            std::fs::remove_file(&self.state_path)?;
            self.machine
                .resume()
                .await
                .map_err(|err| self.enrich(err))?;
        } else {
            self.machine
                .start(self.recovery)
                .await
                .map_err(|err| self.enrich(err))?;
        }
        info!("VM is running");
        if let Some(callback) = self.on_started.lock().unwrap().take() {
            callback();
        }

        let machine = Arc::clone(&self.machine);
        let mut run_future = Box::pin(async move { machine.wait_until_stopped().await });

        loop {
            tokio::select! {
                result = &mut run_future => {
                    info!("VM exited");
                    return result.map(|()| RunOutcome::GuestStopped);
                }
                event = events.recv() => match event {
                    Some(LifecycleEvent::Stop) => {
                        info!("stopping VM");
                        self.machine.stop().await?;
                        return Ok(RunOutcome::ForcedStop);
                    }
                    Some(LifecycleEvent::RequestStop) => {
                        info!("asking the guest to stop");
                        if let Err(err) = self.machine.request_stop() {
                            warn!(error = %err, "guest stop request failed");
                        }
                    }
                    Some(LifecycleEvent::Suspend) => {
                        if !self.suspendable {
                            warn!("ignoring suspend request: not started with --suspendable");
                            continue;
                        }
                        return self.suspend().await;
                    }
                    Some(LifecycleEvent::WindowClosed) => {
                        if self.suspendable {
                            return self.suspend().await;
                        }
                        info!("window closed, stopping VM");
                        self.machine.stop().await?;
                        return Ok(RunOutcome::ForcedStop);
                    }
                    None => {
                        // Every event source is gone; only the guest can
                        // end the run now.
                        let result = (&mut run_future).await;
                        return result.map(|()| RunOutcome::GuestStopped);
                    }
                },
            }
        }
    }

    /// The suspend sequence: pause, then save. A failed pause aborts the
    /// sequence before any state is written.
    async fn suspend(&self) -> Result<RunOutcome> {
        info!("suspending VM");
        self.machine
            .pause()
            .await
            .map_err(|err| EngineError::SuspendFailed(format!("pause failed: {err}")))?;
        self.machine
            .save_state(&self.state_path)
            .await
            .map_err(|err| EngineError::SuspendFailed(format!("saving state failed: {err}")))?;
        info!(path = %self.state_path.display(), "VM state saved");
        Ok(RunOutcome::Suspended)
    }

    fn enrich(&self, err: EngineError) -> EngineError {
        match err {
            EngineError::VirtualMachineLimitExceeded { peers } if peers.is_empty() => {
                EngineError::VirtualMachineLimitExceeded {
                    peers: (self.peer_names)(),
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    struct MockVm {
        ops: Mutex<Vec<String>>,
        exited: Notify,
        fail_pause: bool,
        fail_start_with_limit: bool,
    }

    impl MockVm {
        fn new() -> Self {
            Self {
                ops: Mutex::new(Vec::new()),
                exited: Notify::new(),
                fail_pause: false,
                fail_start_with_limit: false,
            }
        }

        fn record(&self, op: impl Into<String>) {
            self.ops.lock().unwrap().push(op.into());
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn trigger_guest_exit(&self) {
            // notify_one stores a permit, so the wakeup is never lost even
            // if it fires before the controller awaits.
            self.exited.notify_one();
        }
    }

    #[async_trait]
    impl MachineHandle for MockVm {
        async fn start(&self, recovery: bool) -> Result<()> {
            if self.fail_start_with_limit {
                return Err(EngineError::VirtualMachineLimitExceeded { peers: vec![] });
            }
            self.record(if recovery { "start:recovery" } else { "start" });
            Ok(())
        }

        async fn resume(&self) -> Result<()> {
            self.record("resume");
            Ok(())
        }

        async fn restore_state(&self, path: &Path) -> Result<()> {
            assert!(path.exists(), "restore must see the state blob");
            self.record("restore");
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.record("stop");
            Ok(())
        }

        fn request_stop(&self) -> Result<()> {
            self.record("request-stop");
            Ok(())
        }

        async fn pause(&self) -> Result<()> {
            if self.fail_pause {
                return Err(EngineError::internal("pause rejected"));
            }
            self.record("pause");
            Ok(())
        }

        async fn save_state(&self, path: &Path) -> Result<()> {
            std::fs::write(path, b"saved").unwrap();
            self.record("save");
            Ok(())
        }

        async fn wait_until_stopped(&self) -> Result<()> {
            self.exited.notified().await;
            Ok(())
        }
    }

    fn controller(machine: Arc<MockVm>, state_path: PathBuf, suspendable: bool) -> LifecycleController {
        LifecycleController::new(machine, state_path, suspendable, false, Box::new(|| Vec::new()))
    }

    fn temp_state_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        (dir, path)
    }

    #[tokio::test]
    async fn test_stop_event_forces_stop() {
        let vm = Arc::new(MockVm::new());
        let (_dir, state) = temp_state_path();
        let (tx, rx) = event_channel();

        let ctrl = controller(Arc::clone(&vm), state, false);
        tx.send(LifecycleEvent::Stop);
        let outcome = ctrl.run(false, rx).await.unwrap();

        assert_eq!(outcome, RunOutcome::ForcedStop);
        assert_eq!(vm.ops(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_guest_exit_ends_run() {
        let vm = Arc::new(MockVm::new());
        let (_dir, state) = temp_state_path();
        let (_tx, rx) = event_channel();

        let ctrl = controller(Arc::clone(&vm), state, false);
        let run = tokio::spawn({
            let vm = Arc::clone(&vm);
            async move {
                // Give the controller a moment to start waiting.
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                vm.trigger_guest_exit();
            }
        });
        let outcome = ctrl.run(false, rx).await.unwrap();
        run.await.unwrap();

        assert_eq!(outcome, RunOutcome::GuestStopped);
        assert_eq!(vm.ops(), vec!["start"]);
    }

    #[tokio::test]
    async fn test_request_stop_keeps_running() {
        let vm = Arc::new(MockVm::new());
        let (_dir, state) = temp_state_path();
        let (tx, rx) = event_channel();

        tx.send(LifecycleEvent::RequestStop);
        let ctrl = controller(Arc::clone(&vm), state, false);
        let exit = tokio::spawn({
            let vm = Arc::clone(&vm);
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                vm.trigger_guest_exit();
            }
        });
        let outcome = ctrl.run(false, rx).await.unwrap();
        exit.await.unwrap();

        assert_eq!(outcome, RunOutcome::GuestStopped);
        assert_eq!(vm.ops(), vec!["start", "request-stop"]);
    }

    #[tokio::test]
    async fn test_suspend_pauses_then_saves() {
        let vm = Arc::new(MockVm::new());
        let (_dir, state) = temp_state_path();
        let (tx, rx) = event_channel();

        tx.send(LifecycleEvent::Suspend);
        let ctrl = controller(Arc::clone(&vm), state.clone(), true);
        let outcome = ctrl.run(false, rx).await.unwrap();

        assert_eq!(outcome, RunOutcome::Suspended);
        assert_eq!(vm.ops(), vec!["start", "pause", "save"]);
        assert!(state.exists(), "suspend leaves the state blob behind");
    }

    #[tokio::test]
    async fn test_failed_pause_skips_save() {
        let mut inner = MockVm::new();
        inner.fail_pause = true;
        let vm = Arc::new(inner);
        let (_dir, state) = temp_state_path();
        let (tx, rx) = event_channel();

        tx.send(LifecycleEvent::Suspend);
        let ctrl = controller(Arc::clone(&vm), state.clone(), true);
        let err = ctrl.run(false, rx).await.unwrap_err();

        assert!(matches!(err, EngineError::SuspendFailed(_)));
        assert!(!vm.ops().contains(&"save".to_string()));
        assert!(!state.exists(), "failed pause must not leave state behind");
    }

    #[tokio::test]
    async fn test_suspend_ignored_without_suspendable() {
        let vm = Arc::new(MockVm::new());
        let (_dir, state) = temp_state_path();
        let (tx, rx) = event_channel();

        tx.send(LifecycleEvent::Suspend);
        let ctrl = controller(Arc::clone(&vm), state, false);
        let exit = tokio::spawn({
            let vm = Arc::clone(&vm);
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                vm.trigger_guest_exit();
            }
        });
        let outcome = ctrl.run(false, rx).await.unwrap();
        exit.await.unwrap();

        assert_eq!(outcome, RunOutcome::GuestStopped);
        assert!(!vm.ops().contains(&"pause".to_string()));
    }

    #[tokio::test]
    async fn test_window_closed_suspends_when_possible() {
        let vm = Arc::new(MockVm::new());
        let (_dir, state) = temp_state_path();
        let (tx, rx) = event_channel();

        tx.send(LifecycleEvent::WindowClosed);
        let ctrl = controller(Arc::clone(&vm), state.clone(), true);
        let outcome = ctrl.run(false, rx).await.unwrap();

        assert_eq!(outcome, RunOutcome::Suspended);
        assert_eq!(vm.ops(), vec!["start", "pause", "save"]);
        assert!(state.exists());
    }

    #[tokio::test]
    async fn test_window_closed_stops_otherwise() {
        let vm = Arc::new(MockVm::new());
        let (_dir, state) = temp_state_path();
        let (tx, rx) = event_channel();

        tx.send(LifecycleEvent::WindowClosed);
        let ctrl = controller(Arc::clone(&vm), state, false);
        let outcome = ctrl.run(false, rx).await.unwrap();

        assert_eq!(outcome, RunOutcome::ForcedStop);
        assert_eq!(vm.ops(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_resume_restores_then_deletes_state() {
        let vm = Arc::new(MockVm::new());
        let (_dir, state) = temp_state_path();
        std::fs::write(&state, b"old state").unwrap();
        let (tx, rx) = event_channel();

        let ctrl = controller(Arc::clone(&vm), state.clone(), true);
        tx.send(LifecycleEvent::Stop);
        let outcome = ctrl.run(true, rx).await.unwrap();

        assert_eq!(outcome, RunOutcome::ForcedStop);
        assert_eq!(vm.ops(), vec!["restore", "resume", "stop"]);
        assert!(!state.exists(), "state blob is consumed by resume");
    }

    #[tokio::test]
    async fn test_limit_exceeded_enriched_with_peers() {
        let mut inner = MockVm::new();
        inner.fail_start_with_limit = true;
        let vm = Arc::new(inner);
        let (_dir, state) = temp_state_path();
        let (_tx, rx) = event_channel();

        let ctrl = LifecycleController::new(
            vm,
            state,
            false,
            false,
            Box::new(|| vec!["sonoma".into(), "jammy".into()]),
        );
        let err = ctrl.run(false, rx).await.unwrap_err();

        match err {
            EngineError::VirtualMachineLimitExceeded { peers } => {
                assert_eq!(peers, vec!["sonoma", "jammy"]);
            }
            other => panic!("expected limit error, got {other}"),
        }
    }
}
