//! Swap queue with a bounded lock wait
//!
//! Used on the latency-sensitive CDR path: when the lock cannot be taken
//! within the budget the caller gets [`AdapterError::LockTimeout`] instead
//! of blocking.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::shared::AdapterError;

pub struct BoundedQueue<T> {
    name: &'static str,
    items: Mutex<Vec<T>>,
    lock_budget: Duration,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, lock_budget: Duration) -> Self {
        Self {
            name,
            items: Mutex::new(Vec::new()),
            lock_budget,
        }
    }

    async fn acquire(&self) -> Result<MutexGuard<'_, Vec<T>>, AdapterError> {
        tokio::time::timeout(self.lock_budget, self.items.lock())
            .await
            .map_err(|_| AdapterError::LockTimeout {
                resource: self.name,
                waited_ms: self.lock_budget.as_millis() as u64,
            })
    }

    /// Append all items; returns the queue length afterwards.
    pub async fn push_all(&self, items: impl IntoIterator<Item = T>) -> Result<usize, AdapterError> {
        let mut queue = self.acquire().await?;
        queue.extend(items);
        Ok(queue.len())
    }

    /// Atomically capture and empty the queue.
    pub async fn swap_and_clear(&self) -> Result<Vec<T>, AdapterError> {
        let mut queue = self.acquire().await?;
        Ok(std::mem::take(&mut *queue))
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
