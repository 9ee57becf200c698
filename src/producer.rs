use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, RpcError},
    message::{sample_requests, PdfRequest},
    queue::BoundedRequestQueue,
    source::RecordSource,
    state::PipelineCounters,
};

/// Reads the record source and feeds the request queue.
///
/// The producer never closes the queue. When the source is exhausted it
/// marks loading as finished and the stream driver takes it from there.
pub struct RequestProducer {
    source: Arc<dyn RecordSource>,
    queue: BoundedRequestQueue,
    counters: Arc<PipelineCounters>,
    cancel: CancellationToken,
}

impl RequestProducer {
    pub fn new(
        source: Arc<dyn RecordSource>,
        queue: BoundedRequestQueue,
        counters: Arc<PipelineCounters>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            queue,
            counters,
            cancel,
        }
    }

    /// Load every valid record into the request queue.
    ///
    /// Returns the number of requests this call enqueued. Loading is marked
    /// finished on every exit path so downstream stages can terminate.
    pub async fn run(&self) -> Result<u64> {
        info!("Loading requests from {}", self.source.describe());
        let res = self.load().await;
        self.counters.finish_loading();
        match &res {
            Ok(count) => info!("Successfully queued {} requests", count),
            Err(err) => warn!("Request loading stopped early: {}", err),
        }
        res
    }

    async fn load(&self) -> Result<u64> {
        let mut records = match self.source.open() {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    "Record source unavailable ({}), adding sample requests instead",
                    err
                );
                return self.load_samples().await;
            }
        };

        let mut queued = 0;
        let mut skipped = 0;
        while let Some(record) = records.next().await {
            if self.cancel.is_cancelled() {
                return Err(RpcError::Cancelled);
            }
            let fields = match record {
                Ok(fields) => fields,
                Err(err) if queued == 0 => {
                    warn!(
                        "Record source unreadable ({}), adding sample requests instead",
                        err
                    );
                    return self.load_samples().await;
                }
                Err(err) => {
                    warn!("Record source failed after {} requests: {}", queued, err);
                    break;
                }
            };
            match PdfRequest::from_record(&fields) {
                Some(request) => {
                    self.push(request).await?;
                    queued += 1;
                }
                None => {
                    debug!("Skipping malformed record: {:?}", fields);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            info!("Skipped {} malformed records", skipped);
        }
        Ok(queued)
    }

    async fn load_samples(&self) -> Result<u64> {
        let samples = sample_requests();
        let count = samples.len() as u64;
        for request in samples {
            self.push(request).await?;
        }
        info!("Added {} sample requests", count);
        Ok(count)
    }

    /// Count the request, then enqueue it. Counting first keeps
    /// `items_completed <= items_loaded` even when a reply is consumed before
    /// this call returns.
    async fn push(&self, request: PdfRequest) -> Result<()> {
        self.counters.record_loaded();
        if let Err(err) = self.queue.enqueue(request, &self.cancel).await {
            self.counters.revoke_loaded();
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CsvRecordSource, MemoryRecordSource};
    use std::time::Duration;

    const POLL: Duration = Duration::from_millis(20);

    fn producer(source: Arc<dyn RecordSource>, capacity: usize) -> RequestProducer {
        RequestProducer::new(
            source,
            BoundedRequestQueue::new(capacity),
            Arc::new(PipelineCounters::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_skips_malformed_records() {
        let source = MemoryRecordSource::new(vec![
            vec!["Smith", "Alice"],
            vec!["Nobody"],
            vec!["", "Ghost"],
            vec!["Johnson", "Bob", "ignored"],
        ]);
        let producer = producer(Arc::new(source), 16);

        assert_eq!(producer.run().await, Ok(2));
        assert_eq!(producer.counters.items_loaded(), 2);
        assert!(producer.counters.loading_finished());
        assert_eq!(
            producer.queue.try_dequeue(POLL).await,
            Some(PdfRequest::new("Alice", "Smith"))
        );
        assert_eq!(
            producer.queue.try_dequeue(POLL).await,
            Some(PdfRequest::new("Bob", "Johnson"))
        );
    }

    #[tokio::test]
    async fn test_missing_source_falls_back_to_samples() {
        let dir = tempfile::tempdir().unwrap();
        let source = CsvRecordSource::new(dir.path().join("missing.csv"));
        let producer = producer(Arc::new(source), 16);

        assert_eq!(producer.run().await, Ok(4));
        assert_eq!(producer.counters.items_loaded(), 4);
        assert_eq!(producer.queue.len(), 4);
    }

    #[tokio::test]
    async fn test_unreadable_source_falls_back_to_samples() {
        let dir = tempfile::tempdir().unwrap();
        let producer = producer(Arc::new(CsvRecordSource::new(dir.path())), 16);

        assert_eq!(producer.run().await, Ok(4));
        assert_eq!(
            producer.queue.try_dequeue(POLL).await,
            Some(PdfRequest::new("Alice", "Smith"))
        );
    }

    #[tokio::test]
    async fn test_cancelled_while_blocked() {
        let rows: Vec<Vec<String>> = (0..10)
            .map(|i| vec![format!("Last{i}"), format!("First{i}")])
            .collect();
        let producer = Arc::new(producer(Arc::new(MemoryRecordSource::new(rows)), 2));

        let handle = {
            let producer = producer.clone();
            tokio::spawn(async move { producer.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        producer.cancel.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, Err(RpcError::Cancelled));
        // Only the items that fit in the queue count as loaded
        assert_eq!(producer.counters.items_loaded(), 2);
        assert!(producer.counters.loading_finished());
    }
}
