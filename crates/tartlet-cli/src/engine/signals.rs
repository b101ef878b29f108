//! The signal pump: maps process signals onto lifecycle events.
//!
//! - `SIGINT` — immediate-but-graceful shutdown.
//! - `SIGUSR1` — suspend to disk (honored only with `--suspendable`).
//! - `SIGUSR2` — deliver a stop request to the guest OS.
//!
//! Installing the streams replaces the default terminate disposition of
//! SIGUSR1/SIGUSR2, so the pump must be created after the VM is configured
//! and *before* `start`; a signal arriving in between is queued by the
//! runtime, never fatal. Handlers only enqueue, they never touch the VM.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tartlet_core::error::Result;

use super::lifecycle::{EventSender, LifecycleEvent};

/// Installs the signal handlers and spawns the pump task.
///
/// The task exits when `shutdown` is cancelled.
pub fn spawn(events: EventSender, shutdown: CancellationToken) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sigint.recv() => {
                    debug!("SIGINT");
                    events.send(LifecycleEvent::Stop);
                }
                _ = sigusr1.recv() => {
                    debug!("SIGUSR1");
                    events.send(LifecycleEvent::Suspend);
                }
                _ = sigusr2.recv() => {
                    debug!("SIGUSR2");
                    events.send(LifecycleEvent::RequestStop);
                }
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lifecycle::event_channel;
    use nix::sys::signal::{Signal, raise};
    use tokio::sync::mpsc;

    /// Signals raised by concurrently running tests land in every pump, so
    /// drain until the wanted event shows up.
    async fn expect_event(rx: &mut mpsc::Receiver<LifecycleEvent>, wanted: LifecycleEvent) {
        let deadline = std::time::Duration::from_secs(2);
        let result = tokio::time::timeout(deadline, async {
            while let Some(event) = rx.recv().await {
                if event == wanted {
                    return;
                }
            }
            panic!("event channel closed before {wanted:?} arrived");
        })
        .await;
        result.unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
    }

    #[tokio::test]
    async fn test_sigusr2_maps_to_request_stop() {
        let (tx, mut rx) = event_channel();
        let shutdown = CancellationToken::new();
        spawn(tx, shutdown.clone()).unwrap();

        // Give the pump a moment to install its streams before raising.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        raise(Signal::SIGUSR2).unwrap();

        expect_event(&mut rx, LifecycleEvent::RequestStop).await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_sigusr1_maps_to_suspend() {
        let (tx, mut rx) = event_channel();
        let shutdown = CancellationToken::new();
        spawn(tx, shutdown.clone()).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        raise(Signal::SIGUSR1).unwrap();

        expect_event(&mut rx, LifecycleEvent::Suspend).await;
        shutdown.cancel();
    }
}
