//! # Upstream Worker Pool
//!
//! Runs a bounded number of workers that pull target URIs from a shared queue
//! and dispatch them. Every dispatch runs to completion even when a sibling
//! fails, so partial results are always available after `run` returns.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::error::UpstreamError;
use crate::response::ResponseTree;

/// Result of a single dispatch: the fragment is always present, the error
/// only when the call failed
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub response: ResponseTree,
    pub error: Option<UpstreamError>,
}

impl Dispatched {
    pub fn ok(response: ResponseTree) -> Self {
        Self { response, error: None }
    }

    pub fn failed(response: ResponseTree, error: UpstreamError) -> Self {
        Self {
            response,
            error: Some(error),
        }
    }
}

/// Capability invoked by each worker for one target
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, uri: &str) -> Dispatched;
}

// Closures make convenient dispatchers, mostly for tests
#[async_trait]
impl<F, Fut> Dispatch for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Dispatched> + Send + 'static,
{
    async fn dispatch(&self, uri: &str) -> Dispatched {
        (self)(uri.to_string()).await
    }
}

/// A completed upstream call
#[derive(Debug, Clone)]
pub struct Completed {
    pub uri: String,
    pub response: ResponseTree,
}

/// Manages parallel upstream requests; one instance per `run`
#[derive(Debug)]
pub struct UpstreamWorkerPool {
    worker_count: usize,
    results: Vec<Completed>,
}

impl UpstreamWorkerPool {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            results: Vec::new(),
        }
    }

    /// Dispatch every target and wait for all of them
    ///
    /// Returns the first error observed. Results are collected for every
    /// target regardless and are in completion order.
    pub async fn run(&mut self, targets: &[String], dispatcher: Arc<dyn Dispatch>) -> Result<(), UpstreamError> {
        if targets.is_empty() {
            return Ok(());
        }

        let workers = self.worker_count.clamp(1, targets.len());
        debug!(count = workers, targets = targets.len(), "Starting workers");

        // fill the queue up front and close it so workers exit once it drains
        let (work_tx, work_rx) = mpsc::channel::<String>(targets.len());
        for uri in targets {
            // capacity equals the number of targets so this never waits
            if work_tx.send(uri.clone()).await.is_err() {
                break;
            }
        }
        drop(work_tx);

        let work_rx = Arc::new(Mutex::new(work_rx));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, Dispatched)>();

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let work_rx = Arc::clone(&work_rx);
            let done_tx = done_tx.clone();
            let dispatcher = Arc::clone(&dispatcher);

            set.spawn(async move {
                loop {
                    let next = work_rx.lock().await.recv().await;
                    let Some(uri) = next else { break };

                    debug!(uri = %uri, "Starting work");
                    let dispatched = dispatcher.dispatch(&uri).await;
                    debug!(uri = %uri, failed = dispatched.error.is_some(), "Finished work");

                    if done_tx.send((uri, dispatched)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);

        let mut first_error = None;
        while let Some((uri, dispatched)) = done_rx.recv().await {
            if let Some(err) = dispatched.error {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }

            self.results.push(Completed {
                uri,
                response: dispatched.response,
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Upstream worker terminated abnormally");
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Responses from the upstream calls, valid once `run` has returned
    pub fn results(&self) -> &[Completed] {
        &self.results
    }

    pub fn into_results(self) -> Vec<Completed> {
        self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn targets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("http://upstream-{}:9090", i)).collect()
    }

    fn named(uri: &str) -> ResponseTree {
        ResponseTree {
            name: uri.to_string(),
            code: 200,
            ..ResponseTree::default()
        }
    }

    #[tokio::test]
    async fn test_fewer_workers_than_targets_dispatches_all() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let dispatcher = Arc::new(move |uri: String| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                Dispatched::ok(named(&uri))
            }
        });

        let uris = targets(7);
        let mut pool = UpstreamWorkerPool::new(2);
        pool.run(&uris, dispatcher).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 7);
        assert_eq!(pool.results().len(), 7);

        let seen: HashSet<_> = pool.results().iter().map(|c| c.uri.clone()).collect();
        assert_eq!(seen, uris.into_iter().collect());
    }

    #[tokio::test]
    async fn test_one_failure_still_collects_every_result() {
        let dispatcher = Arc::new(|uri: String| async move {
            if uri.contains("upstream-1") {
                let mut response = named(&uri);
                response.code = 503;
                Dispatched::failed(response, UpstreamError::UnexpectedStatus { uri, code: 503 })
            } else {
                // slower than the failing call so the error is seen first
                tokio::time::sleep(Duration::from_millis(20)).await;
                Dispatched::ok(named(&uri))
            }
        });

        let uris = targets(3);
        let mut pool = UpstreamWorkerPool::new(3);
        let err = pool.run(&uris, dispatcher).await.unwrap_err();

        assert_eq!(
            err,
            UpstreamError::UnexpectedStatus {
                uri: "http://upstream-1:9090".to_string(),
                code: 503
            }
        );
        assert_eq!(pool.results().len(), 3);
        assert_eq!(pool.results().iter().filter(|c| c.response.code == 200).count(), 2);
    }

    #[tokio::test]
    async fn test_workers_run_in_parallel() {
        let dispatcher = Arc::new(|uri: String| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Dispatched::ok(named(&uri))
        });

        let start = std::time::Instant::now();
        let mut pool = UpstreamWorkerPool::new(4);
        pool.run(&targets(4), dispatcher).await.unwrap();

        assert!(start.elapsed() < Duration::from_millis(190));
    }

    #[tokio::test]
    async fn test_single_worker_is_sequential() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (in_flight_c, peak_c) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let dispatcher = Arc::new(move |uri: String| {
            let in_flight = Arc::clone(&in_flight_c);
            let peak = Arc::clone(&peak_c);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Dispatched::ok(named(&uri))
            }
        });

        let mut pool = UpstreamWorkerPool::new(1);
        pool.run(&targets(5), dispatcher).await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(pool.into_results().len(), 5);
    }

    #[tokio::test]
    async fn test_empty_targets_is_a_no_op() {
        let dispatcher = Arc::new(|uri: String| async move { Dispatched::ok(named(&uri)) });

        let mut pool = UpstreamWorkerPool::new(3);
        pool.run(&[], dispatcher).await.unwrap();

        assert!(pool.results().is_empty());
    }
}
