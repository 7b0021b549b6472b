//! Batch aggregation
//!
//! Runs one extraction task per admitted URL and joins them back in input
//! order. A failing or panicking task only affects its own slot.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::admission::ValidUrl;
use crate::extract::{BatchEntry, MetadataExtractor};

/// Default number of extractions in flight per batch
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Fan-out/fan-in over [`MetadataExtractor`]
#[derive(Clone)]
pub struct BatchAggregator {
    extractor: MetadataExtractor,
    max_concurrency: usize,
}

impl BatchAggregator {
    pub fn new(extractor: MetadataExtractor, max_concurrency: usize) -> Self {
        Self {
            extractor,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Extract every URL. `result[i]` always belongs to `urls[i]`.
    pub async fn run(&self, urls: Vec<ValidUrl>) -> Vec<BatchEntry> {
        if urls.is_empty() {
            return Vec::new();
        }

        let started = std::time::Instant::now();
        let permits = Arc::new(Semaphore::new(self.max_concurrency));

        let handles: Vec<_> = urls
            .iter()
            .cloned()
            .map(|url| {
                let extractor = self.extractor.clone();
                let permits = Arc::clone(&permits);
                tokio::spawn(async move {
                    // The semaphore is never closed, so acquire only fails if it is.
                    let _permit = permits.acquire_owned().await.ok();
                    extractor.extract(&url).await
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (url, handle) in urls.into_iter().zip(handles) {
            let entry = match handle.await {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(target: "batch", url = %url, error = %e, "extraction task failed");
                    BatchEntry::failure(url, "Internal extraction error")
                }
            };
            results.push(entry);
        }

        let failed = results.iter().filter(|e| !e.is_success()).count();
        tracing::info!(
            target: "batch",
            total = results.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch complete"
        );

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchConfig, PageFetcher};

    fn aggregator(max_concurrency: usize) -> BatchAggregator {
        let fetcher = PageFetcher::new(FetchConfig::default().with_timeout_ms(2_000));
        BatchAggregator::new(MetadataExtractor::new(fetcher), max_concurrency)
    }

    #[tokio::test]
    async fn test_empty_batch() {
        assert!(aggregator(4).run(Vec::new()).await.is_empty());
    }

    #[test]
    fn test_concurrency_floor() {
        assert_eq!(aggregator(0).max_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_failures_keep_their_slot() {
        // Guard rejects these before any connection is attempted.
        let urls: Vec<ValidUrl> = ["http://localhost:1/a", "http://10.0.0.1/b", "http://127.0.0.1:1/c"]
            .into_iter()
            .filter_map(ValidUrl::parse)
            .collect();

        let results = aggregator(2).run(urls.clone()).await;

        assert_eq!(results.len(), urls.len());
        for (entry, url) in results.iter().zip(&urls) {
            assert_eq!(entry.url(), url);
            assert!(!entry.is_success());
        }
    }
}
