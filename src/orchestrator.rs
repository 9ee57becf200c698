//! Wires the pipeline stages together and joins them under one deadline.

use std::{fmt, sync::Arc, time::Duration};

use tokio::{
    task::{JoinError, JoinHandle},
    time::{timeout, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::{DriverState, StreamDriver},
    common::PipelineOptions,
    error::{Result, RpcError},
    persist::PersistenceSink,
    producer::RequestProducer,
    progress::{ProgressReporter, ProgressSink},
    queue::{BoundedRequestQueue, UnboundedResponseQueue},
    source::RecordSource,
    state::PipelineCounters,
    transport::DuplexTransport,
    workerpool::ResponseConsumerPool,
};

/// One concurrent activity of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Producer,
    RequestStream,
    ResponseStream,
    Consumers,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Producer => "producer",
            Stage::RequestStream => "request stream",
            Stage::ResponseStream => "response stream",
            Stage::Consumers => "consumer pool",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageStatus {
    /// The stage returned normally with the number of items it handled.
    Finished(u64),
    Failed(RpcError),
    Panicked(String),
    /// The stage outlived the shutdown grace period and was aborted.
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
}

impl StageOutcome {
    fn from_join(stage: Stage, joined: std::result::Result<Result<u64>, JoinError>) -> Self {
        let status = match joined {
            Ok(Ok(count)) => StageStatus::Finished(count),
            Ok(Err(err)) => StageStatus::Failed(err),
            Err(err) if err.is_cancelled() => StageStatus::Aborted,
            Err(err) => StageStatus::Panicked(err.to_string()),
        };
        Self { stage, status }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, StageStatus::Finished(_))
    }
}

/// What a streaming run achieved.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub items_loaded: u64,
    pub items_completed: u64,
    pub elapsed: Duration,
    /// The global deadline passed before every stage finished.
    pub timed_out: bool,
    pub driver_state: DriverState,
    /// Why the stream failed, when it did.
    pub transport_failure: Option<RpcError>,
    pub stages: Vec<StageOutcome>,
}

impl RunReport {
    /// Stages that did not finish normally.
    pub fn failures(&self) -> impl Iterator<Item = &StageOutcome> {
        self.stages.iter().filter(|outcome| !outcome.is_finished())
    }

    pub fn is_success(&self) -> bool {
        !self.timed_out
            && self.driver_state == DriverState::Completed
            && self.failures().next().is_none()
    }

    pub fn log_summary(&self) {
        for outcome in self.failures() {
            warn!("Stage {} ended with {:?}", outcome.stage, outcome.status);
        }
        if let Some(err) = &self.transport_failure {
            error!("Streaming session failed: {}", err);
        }
        if self.timed_out {
            warn!(
                "Run timed out with {} of {} items completed",
                self.items_completed, self.items_loaded
            );
        }
        info!(
            "Processed {} of {} items, stream {:?}. Elapsed time: {}",
            self.items_completed,
            self.items_loaded,
            self.driver_state,
            format_elapsed(self.elapsed)
        );
    }
}

/// `HHh MMm SSs mmmms`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{:02}h {:02}m {:02}s {:03}ms",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60,
        elapsed.subsec_millis()
    )
}

struct RunningStage {
    stage: Stage,
    handle: JoinHandle<Result<u64>>,
}

/// Runs one streaming pass: producer, both halves of the stream driver and
/// the consumer pool, each as its own task.
pub struct Orchestrator {
    options: PipelineOptions,
    transport: Arc<dyn DuplexTransport>,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn PersistenceSink>,
    progress: Arc<dyn ProgressSink>,
    counters: Arc<PipelineCounters>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        options: PipelineOptions,
        transport: Arc<dyn DuplexTransport>,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn PersistenceSink>,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            transport,
            source,
            sink,
            progress,
            counters: Arc::new(PipelineCounters::new()),
            cancel,
        }
    }

    /// Counters of this run, readable while it is in progress.
    pub fn counters(&self) -> Arc<PipelineCounters> {
        self.counters.clone()
    }

    /// Run the pipeline until every stage finished or the global timeout
    /// elapsed. Never fails: partial results land in the report.
    pub async fn run(self) -> RunReport {
        let started = Instant::now();
        let timeouts = self.options.timeouts.clone();
        let deadline = started + timeouts.join_timeout;
        // Cancelling the run must not cancel the caller's token.
        let run_token = self.cancel.child_token();

        let driver = Arc::new(StreamDriver::new(
            self.counters.clone(),
            timeouts.clone(),
            &run_token,
        ));

        let opened = match timeout(timeouts.connect_timeout, self.transport.open()).await {
            Ok(opened) => opened,
            Err(_) => Err(RpcError::Timeout(format!(
                "stream not opened within {:?}",
                timeouts.connect_timeout
            ))),
        };
        let (sink, events) = match opened {
            Ok(handle) => handle.split(),
            Err(err) => {
                error!("Failed to open the duplex stream: {}", err);
                return RunReport {
                    items_loaded: 0,
                    items_completed: 0,
                    elapsed: started.elapsed(),
                    timed_out: false,
                    driver_state: DriverState::Failed,
                    transport_failure: Some(err),
                    stages: Vec::new(),
                };
            }
        };

        let request_queue = BoundedRequestQueue::new(self.options.channel_capacity);
        let response_queue = UnboundedResponseQueue::new();
        let reporter = Arc::new(ProgressReporter::new(
            self.options.progress_threshold,
            self.progress.clone(),
        ));
        info!(
            "Starting pipeline: capacity {}, {} consumers",
            request_queue.capacity(),
            self.options.workers
        );

        // The producer waits on the driver's abort token so a dead stream
        // releases it from a full queue.
        let producer = RequestProducer::new(
            self.source.clone(),
            request_queue.clone(),
            self.counters.clone(),
            driver.abort_token(),
        );
        let pool = ResponseConsumerPool::new(
            self.options.workers,
            response_queue.clone(),
            self.sink.clone(),
            self.counters.clone(),
            reporter,
            timeouts.poll_timeout,
            run_token.clone(),
        );

        let stages = vec![
            RunningStage {
                stage: Stage::Producer,
                handle: tokio::spawn(async move { producer.run().await }),
            },
            RunningStage {
                stage: Stage::RequestStream,
                handle: {
                    let driver = driver.clone();
                    tokio::spawn(async move { driver.send_loop(sink, request_queue).await })
                },
            },
            RunningStage {
                stage: Stage::ResponseStream,
                handle: {
                    let driver = driver.clone();
                    tokio::spawn(async move { driver.recv_loop(events, response_queue).await })
                },
            },
            RunningStage {
                stage: Stage::Consumers,
                handle: tokio::spawn(async move { pool.run().await.map(|stats| stats.consumed) }),
            },
        ];

        let (outcomes, timed_out) =
            join_stages(stages, deadline, timeouts.shutdown_grace, &run_token).await;

        RunReport {
            items_loaded: self.counters.items_loaded(),
            items_completed: self.counters.items_completed(),
            elapsed: started.elapsed(),
            timed_out,
            driver_state: driver.state(),
            transport_failure: driver.failure(),
            stages: outcomes,
        }
    }
}

/// Join every stage before `deadline`. Once the deadline passes, the run is
/// cancelled and the remaining stages get `grace` to unwind before they are
/// aborted.
async fn join_stages(
    stages: Vec<RunningStage>,
    deadline: Instant,
    grace: Duration,
    run_token: &CancellationToken,
) -> (Vec<StageOutcome>, bool) {
    let mut outcomes = Vec::with_capacity(stages.len());
    let mut unfinished = Vec::new();

    for mut running in stages {
        if unfinished.is_empty() {
            if let Ok(joined) = timeout_at(deadline, &mut running.handle).await {
                outcomes.push(StageOutcome::from_join(running.stage, joined));
                continue;
            }
        }
        unfinished.push(running);
    }

    if unfinished.is_empty() {
        return (outcomes, false);
    }

    warn!(
        "Pipeline did not finish before the deadline, cancelling {} stage(s)",
        unfinished.len()
    );
    run_token.cancel();

    let grace_deadline = Instant::now() + grace;
    for mut running in unfinished {
        match timeout_at(grace_deadline, &mut running.handle).await {
            Ok(joined) => outcomes.push(StageOutcome::from_join(running.stage, joined)),
            Err(_) => {
                warn!("Stage {} ignored cancellation, aborting it", running.stage);
                running.handle.abort();
                outcomes.push(StageOutcome {
                    stage: running.stage,
                    status: StageStatus::Aborted,
                });
            }
        }
    }
    (outcomes, true)
}
