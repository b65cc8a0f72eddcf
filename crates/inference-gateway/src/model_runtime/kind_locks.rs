use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::descriptor::BackendKind;
use crate::metrics;

/// Held for the duration of one inference call. Dropping it (including during
/// unwinding) releases the kind.
pub type KindGuard = OwnedMutexGuard<()>;

/// One mutex per backend kind. Two calls against the same kind never overlap,
/// calls against different kinds run in parallel.
#[derive(Default)]
pub struct KindLocks {
    locks: DashMap<BackendKind, Arc<Mutex<()>>>,
}

impl KindLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, kind: &BackendKind) -> Arc<Mutex<()>> {
        self.locks
            .entry(kind.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, kind: &BackendKind) -> KindGuard {
        let started = Instant::now();
        let guard = self.lock_for(kind).lock_owned().await;
        metrics::observe_kind_lock_wait(started.elapsed().as_secs_f64());
        guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_kind_never_overlaps() {
        let locks = Arc::new(KindLocks::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire(&BackendKind::Llama).await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_kinds_run_in_parallel() {
        let locks = Arc::new(KindLocks::new());
        let barrier = Arc::new(Barrier::new(2));

        let mut tasks = Vec::new();
        for kind in [BackendKind::Llama, BackendKind::Whisper] {
            let locks = locks.clone();
            let barrier = barrier.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire(&kind).await;
                // Both holders must reach the barrier while holding their lock.
                barrier.wait().await;
            }));
        }

        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            for task in tasks {
                task.await.unwrap();
            }
        })
        .await;
        assert!(joined.is_ok(), "different kinds serialized each other");
    }

    #[tokio::test]
    async fn test_lock_released_after_panicking_holder() {
        let locks = Arc::new(KindLocks::new());

        let holder = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&BackendKind::Piper).await;
                panic!("inference blew up");
            })
        };
        assert!(holder.await.is_err());

        let reacquired = tokio::time::timeout(Duration::from_secs(1), locks.acquire(&BackendKind::Piper)).await;
        assert!(reacquired.is_ok());
    }
}
