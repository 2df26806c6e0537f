//! Resizable counting semaphore that bounds in-flight work items.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Concurrency gate whose permit count follows the worker budget.
///
/// Growing adds permits immediately. Shrinking acquires the surplus permits
/// and forgets them, so it waits for in-flight holders to release. Resizes are
/// serialized through `resize_lock` so concurrent callers never lose an update.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    resize_lock: Mutex<()>,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
            resize_lock: Mutex::new(()),
        }
    }

    /// Current permit limit.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a permit. Returns `None` only if the gate was closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    /// Resize the gate to `desired` permits and return the applied limit.
    pub async fn resize(&self, desired: usize) -> usize {
        let _guard = self.resize_lock.lock().await;
        let current = self.limit.load(Ordering::Acquire);

        if desired > current {
            self.semaphore.add_permits(desired - current);
        } else if desired < current {
            let surplus = u32::try_from(current - desired).unwrap_or(u32::MAX);
            match self.semaphore.acquire_many(surplus).await {
                Ok(permits) => permits.forget(),
                Err(_) => return current,
            }
        } else {
            return current;
        }

        tracing::debug!("Concurrency gate resized {} -> {}", current, desired);
        self.limit.store(desired, Ordering::Release);
        desired
    }
}
