//! Bounded cap on simultaneous control-server connections.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting gate with fixed capacity.
///
/// However many internal workers exist, the control server never sees
/// more than `capacity` simultaneous connections from this agent
/// instance. [`acquire`](Self::acquire) blocks until a permit frees up;
/// the permit releases itself on drop, so every exit path, error paths
/// included, gives the slot back exactly once.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held connection slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    /// Create a gate with `capacity` permits. The stock deployment runs
    /// with 2: one slot nominally for fetch, one for upload.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> GatePermit {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("gate semaphore is never closed");
        GatePermit { _permit: permit }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_capacity_is_respected() {
        let gate = ConcurrencyGate::new(2);
        assert_eq!(gate.available(), 2);

        let p1 = gate.acquire().await;
        let p2 = gate.acquire().await;
        assert_eq!(gate.available(), 0);

        drop(p1);
        assert_eq!(gate.available(), 1);
        drop(p2);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn test_third_acquire_blocks_until_release() {
        let gate = Arc::new(ConcurrencyGate::new(2));
        let _p1 = gate.acquire().await;
        let p2 = gate.acquire().await;

        let blocked = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        drop(p2);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("acquire should unblock after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_held_permits_never_exceed_capacity() {
        let gate = Arc::new(ConcurrencyGate::new(3));
        let held = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..30 {
            let gate = Arc::clone(&gate);
            let held = Arc::clone(&held);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await;
                let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                held.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(gate.available(), 3);
    }
}
