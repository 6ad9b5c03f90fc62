use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Process-wide lock that serializes full fetch-reconcile-notify cycles.
///
/// Waiters are admitted in arrival order. Cloning shares the same lock.
#[derive(Debug, Clone, Default)]
pub struct CycleGate {
    inner: Arc<Mutex<()>>,
}

/// Held for the duration of one cycle.
#[derive(Debug)]
pub struct CycleGuard {
    _guard: OwnedMutexGuard<()>,
}

impl CycleGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enter(&self) -> CycleGuard {
        CycleGuard {
            _guard: Arc::clone(&self.inner).lock_owned().await,
        }
    }

    /// Whether a cycle currently holds the gate.
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_entrant_waits_for_release() {
        let gate = CycleGate::new();
        let first = gate.enter().await;
        assert!(gate.is_busy());

        let contender = gate.clone();
        let waiter = tokio::spawn(async move {
            let _guard = contender.enter().await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter admitted")
            .expect("waiter task");
        assert!(!gate.is_busy());
    }
}
