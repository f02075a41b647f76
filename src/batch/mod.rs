//! Bounded worker-pool batch variant.
//!
//! A fixed set of workers pulls `(index, url)` tasks from a shared queue
//! and runs them through the shared [`Crawler`] fetch unit. Results are
//! reassembled by input index, so output order matches input order no
//! matter the completion order. Each task carries its own result timeout,
//! independent of the fetch unit's request timeouts, so a worker that never
//! returns cannot stall the batch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

use crate::crawler::{Crawler, Page};

/// Worker-pool orchestrator over a shared crawl engine.
pub struct WorkerPool {
    crawler: Arc<Crawler>,
    workers: usize,
    task_timeout: Duration,
}

impl WorkerPool {
    pub fn new(crawler: Arc<Crawler>) -> Self {
        let workers = crawler.config().worker_count.max(1);
        let task_timeout = crawler.config().task_timeout;
        Self {
            crawler,
            workers,
            task_timeout,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Fetch a batch of URLs. The result vector has the same length and
    /// order as the input; failed or timed-out positions hold `None`.
    pub async fn fetch_many(&self, urls: &[String]) -> Vec<Option<Page>> {
        let total = urls.len();
        if total == 0 {
            return Vec::new();
        }
        log::info!("worker pool: dispatching {total} URLs to {} workers", self.workers);

        let (task_tx, task_rx) = mpsc::channel::<(usize, String)>(total);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, Option<Page>)>(total);

        for (index, url) in urls.iter().enumerate() {
            // Capacity equals the task count, so sends cannot fail.
            let _ = task_tx.send((index, url.clone())).await;
        }
        drop(task_tx);

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers.min(total) {
            let crawler = Arc::clone(&self.crawler);
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let task_timeout = self.task_timeout;

            handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = task_rx.lock().await;
                        rx.recv().await
                    };
                    let Some((index, url)) = task else {
                        break;
                    };

                    let result = match timeout(task_timeout, crawler.fetch(&url)).await {
                        Ok(page) => page,
                        Err(_) => {
                            log::warn!(
                                "task {index} exceeded the {task_timeout:?} result timeout: {url}"
                            );
                            None
                        }
                    };
                    if result_tx.send((index, result)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut results: Vec<Option<Page>> = (0..total).map(|_| None).collect();
        let mut completed = 0usize;
        while let Some((index, result)) = result_rx.recv().await {
            results[index] = result;
            completed += 1;
            if completed % 10 == 0 || completed == total {
                log::info!("worker pool progress: {completed}/{total}");
            }
        }

        for handle in handles {
            if let Err(err) = handle.await {
                log::warn!("worker task panicked: {err}");
            }
        }

        let succeeded = results.iter().filter(|result| result.is_some()).count();
        log::info!("worker pool batch complete: {succeeded}/{total} succeeded");
        results
    }
}
