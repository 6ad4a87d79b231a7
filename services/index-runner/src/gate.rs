//! Exclusive run gate.
//!
//! At most one engine run is in flight. A trigger that arrives while a run
//! is active is dropped, not queued; manual runs can wait for the gate
//! instead.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// What happened to a gated trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum GateOutcome<T> {
    /// The work ran and produced `T`.
    Ran(T),
    /// Another run held the gate.
    Skipped,
}

impl<T> GateOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// The result, if the work ran.
    pub fn into_ran(self) -> Option<T> {
        match self {
            Self::Ran(value) => Some(value),
            Self::Skipped => None,
        }
    }
}

/// Cloneable handle to a single run slot.
#[derive(Debug, Clone, Default)]
pub struct RunGate {
    slot: Arc<Mutex<()>>,
}

impl RunGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a run currently holds the gate.
    pub fn is_busy(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Run `work` if the gate is free, otherwise skip it.
    pub async fn try_run<F, T>(&self, label: &str, work: F) -> GateOutcome<T>
    where
        F: Future<Output = T>,
    {
        let Ok(_guard) = self.slot.try_lock() else {
            info!(job = %label, "Run already in progress, skipping trigger");
            return GateOutcome::Skipped;
        };

        debug!(job = %label, "Acquired run gate");
        GateOutcome::Ran(work.await)
    }

    /// Wait for the gate, then run `work`.
    pub async fn run_blocking<F, T>(&self, label: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        if self.is_busy() {
            info!(job = %label, "Waiting for the active run to finish");
        }
        let _guard = self.slot.lock().await;
        debug!(job = %label, "Acquired run gate");
        work.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_concurrent_trigger_is_skipped() {
        let gate = RunGate::new();
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let held = gate.clone();
        let first = tokio::spawn(async move {
            held.try_run("first", async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                1
            })
            .await
        });

        started_rx.await.unwrap();
        assert!(gate.is_busy());
        let second = gate.try_run("second", async { 2 }).await;
        assert!(second.is_skipped());

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), GateOutcome::Ran(1));
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_run_blocking_waits_for_gate() {
        let gate = RunGate::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let held = gate.clone();
        let first = tokio::spawn(async move {
            held.try_run("first", async move {
                let _ = release_rx.await;
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = gate.clone();
        let manual = tokio::spawn(async move { waiter.run_blocking("manual", async { 7 }).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!manual.is_finished());

        release_tx.send(()).unwrap();
        first.await.unwrap();
        assert_eq!(manual.await.unwrap(), 7);
    }

    #[test]
    fn test_sequential_runs_both_execute() {
        let gate = RunGate::new();
        let first = tokio_test::block_on(gate.try_run("a", async { "a" }));
        let second = tokio_test::block_on(gate.try_run("b", async { "b" }));
        assert_eq!(first.into_ran(), Some("a"));
        assert_eq!(second.into_ran(), Some("b"));
    }
}
