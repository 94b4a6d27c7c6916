use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{WorkerError, panic_message};

/// Bounded pool for blocking work: plugin code that does not cooperate with
/// the scheduler, and CPU-heavy format conversions.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// `min(cpus + 4, 32)` threads.
    pub fn default_size() -> usize {
        (num_cpus::get() + 4).min(32)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on a blocking thread once a pool slot is free.
    pub async fn run<F, R>(&self, job: F) -> Result<R, WorkerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Closed)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|err| {
            if err.is_panic() {
                WorkerError::Panicked(panic_message(err.into_panic()))
            } else {
                WorkerError::Closed
            }
        })
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(Self::default_size())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn never_runs_more_jobs_than_slots() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..6).map(|_| {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            })
        });
        for job in futures::future::join_all(jobs).await {
            job.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn panics_are_reported_not_propagated() {
        let pool = WorkerPool::new(1);
        let result = pool.run(|| -> u8 { panic!("boom") }).await;
        assert!(matches!(result, Err(WorkerError::Panicked(msg)) if msg == "boom"));
        assert_eq!(pool.run(|| 7).await.unwrap(), 7);
    }
}
