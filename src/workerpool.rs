use std::{sync::Arc, time::Duration};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, RpcError},
    message::PdfReply,
    persist::{unique_file_name, PersistenceSink},
    progress::ProgressReporter,
    queue::UnboundedResponseQueue,
    state::PipelineCounters,
};

/// What one worker did before exiting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    /// Replies taken off the queue.
    pub consumed: u64,
    /// Payloads written by the sink.
    pub persisted: u64,
    /// Payloads the sink failed to write.
    pub failed: u64,
    /// Replies with an empty payload.
    pub empty: u64,
}

impl std::ops::Add for WorkerStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            consumed: self.consumed + rhs.consumed,
            persisted: self.persisted + rhs.persisted,
            failed: self.failed + rhs.failed,
            empty: self.empty + rhs.empty,
        }
    }
}

/// Shared by every worker of the pool.
struct WorkerContext {
    queue: UnboundedResponseQueue,
    sink: Arc<dyn PersistenceSink>,
    counters: Arc<PipelineCounters>,
    progress: Arc<ProgressReporter>,
    poll_timeout: Duration,
    cancel: CancellationToken,
}

/// A fixed set of workers draining the response queue.
pub struct ResponseConsumerPool {
    workers: usize,
    context: Arc<WorkerContext>,
}

impl ResponseConsumerPool {
    /// A zero worker count is coerced to the available parallelism.
    pub fn new(
        workers: usize,
        queue: UnboundedResponseQueue,
        sink: Arc<dyn PersistenceSink>,
        counters: Arc<PipelineCounters>,
        progress: Arc<ProgressReporter>,
        poll_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let workers = if workers == 0 { num_cpus::get() } else { workers };
        Self {
            workers,
            context: Arc::new(WorkerContext {
                queue,
                sink,
                counters,
                progress,
                poll_timeout,
                cancel,
            }),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every worker to completion and sum their stats.
    ///
    /// Workers exit independently; the pool is drained once all of them did.
    /// A cancelled pool reports [`RpcError::Cancelled`].
    pub async fn run(self) -> Result<WorkerStats> {
        let mut set = JoinSet::new();
        for worker_id in 0..self.workers {
            let context = self.context.clone();
            set.spawn(async move { worker_loop(worker_id, context).await });
        }

        let mut total = WorkerStats::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(stats) => total = total + stats,
                Err(err) => warn!("Consumer worker panicked: {}", err),
            }
        }

        if self.context.cancel.is_cancelled() {
            warn!("Consumer pool cancelled after {} replies", total.consumed);
            return Err(RpcError::Cancelled);
        }
        // The last completion may have raced the end of loading.
        let counters = &self.context.counters;
        if counters.loading_finished() {
            self.context
                .progress
                .finish(counters.items_completed(), counters.items_loaded());
        }
        info!(
            "Consumer pool drained: {} replies, {} written, {} failed writes",
            total.consumed, total.persisted, total.failed
        );
        Ok(total)
    }
}

async fn worker_loop(worker_id: usize, context: Arc<WorkerContext>) -> WorkerStats {
    debug!("Consumer worker {} started", worker_id);
    let mut stats = WorkerStats::default();

    while !context.cancel.is_cancelled() {
        match context.queue.try_dequeue(context.poll_timeout).await {
            Some(reply) => consume(worker_id, &context, reply, &mut stats).await,
            None => {
                // Done once every loaded item completed, or once the reply
                // stream ended and nothing is left to drain.
                let counters = &context.counters;
                if counters.is_drained()
                    || (counters.replies_finished() && context.queue.is_empty())
                {
                    break;
                }
            }
        }
    }

    debug!("Consumer worker {} stopped: {:?}", worker_id, stats);
    stats
}

async fn consume(
    worker_id: usize,
    context: &WorkerContext,
    reply: PdfReply,
    stats: &mut WorkerStats,
) {
    stats.consumed += 1;
    if reply.is_empty() {
        stats.empty += 1;
    } else {
        let file_name = unique_file_name();
        match context.sink.write(&reply.pdf, &file_name).await {
            Ok(_) => stats.persisted += 1,
            Err(err) => {
                warn!("Worker {} failed to save {}: {}", worker_id, file_name, err);
                stats.failed += 1;
            }
        }
    }

    let counters = &context.counters;
    let completed = counters.record_completed();
    // The flag is read first: once it is set, the loaded count is final.
    let total_is_final = counters.loading_finished();
    let total = counters.items_loaded();
    context.progress.report(completed, total, total_is_final);
}
