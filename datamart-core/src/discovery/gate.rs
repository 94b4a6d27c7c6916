use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Bounds how many on-demand queries a discoverer instance handles at once.
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// One unit of [`AdmissionGate`] capacity, returned on drop.
#[derive(Debug)]
pub struct QueryTicket {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub const DEFAULT_CAPACITY: usize = 4;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits for a free ticket. Fails only once the gate has been closed.
    pub async fn acquire(&self) -> Result<QueryTicket, AcquireError> {
        let permit = Arc::clone(&self.permits).acquire_owned().await?;
        Ok(QueryTicket { _permit: permit })
    }

    /// Wakes pending and future `acquire` calls with an error. Tickets
    /// already handed out stay valid.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available().min(self.capacity)
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn tickets_are_bounded_and_returned_on_drop() {
        let gate = AdmissionGate::new(2);
        let a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_use(), 2);

        let third =
            tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(third.is_err(), "third ticket must wait");

        drop(a);
        let _c = tokio::time::timeout(Duration::from_secs(1), gate.acquire())
            .await
            .expect("ticket released")
            .unwrap();
        assert_eq!(gate.available(), 0);
    }

    #[tokio::test]
    async fn closing_fails_waiters() {
        let gate = AdmissionGate::new(1);
        let _held = gate.acquire().await.unwrap();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.is_err() })
        };
        tokio::task::yield_now().await;
        gate.close();
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        assert_eq!(AdmissionGate::new(0).capacity(), 1);
        assert_eq!(AdmissionGate::default().capacity(), 4);
    }
}
