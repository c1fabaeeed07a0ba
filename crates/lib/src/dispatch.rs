//! Bounded background work for the webhook.
//!
//! The webhook must answer within the satellite gateway's short timeout, so sends happen in
//! background jobs. Jobs go into a fixed-size queue; one worker takes them out and runs at most
//! `max_in_flight` at a time. A full queue is reported to the caller instead of growing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch queue is full")]
    Full,
    #[error("dispatcher is shut down")]
    Closed,
}

/// Handle for submitting jobs. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl Dispatcher {
    /// Start the worker. When `shutdown` flips to true the queue stops accepting jobs, the jobs
    /// already queued still run, and the returned handle completes once all of them finished.
    pub fn start(
        max_in_flight: usize,
        queue_capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let max_in_flight = max_in_flight.clamp(1, u32::MAX as usize);
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let permits = Arc::new(Semaphore::new(max_in_flight));
        let worker = tokio::spawn(run_worker(rx, permits.clone(), max_in_flight, shutdown));
        (
            Self {
                tx,
                permits,
                max_in_flight,
            },
            worker,
        )
    }

    /// Queue a job without waiting.
    pub fn submit<F>(&self, job: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.try_send(Box::pin(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::Full,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }

    /// Jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Job>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut closing = false;
    loop {
        let job = if closing {
            rx.recv().await
        } else {
            tokio::select! {
                job = rx.recv() => job,
                _ = shutdown.changed() => {
                    log::info!("dispatch: shutting down, draining queued jobs");
                    rx.close();
                    closing = true;
                    continue;
                }
            }
        };
        let Some(job) = job else { break };
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        tokio::spawn(async move {
            job.await;
            drop(permit);
        });
    }
    // Every running job holds one permit; holding them all means everything finished.
    let all = u32::try_from(max_in_flight).unwrap_or(u32::MAX);
    let _ = permits.acquire_many(all).await;
    log::info!("dispatch: all jobs finished");
}

/// Await the worker, giving up after `timeout` (remaining jobs are abandoned).
pub async fn drain(worker: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, worker).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("dispatch worker failed: {}", e),
        Err(_) => log::warn!("dispatch: jobs still running after {:?}, abandoning them", timeout),
    }
}
