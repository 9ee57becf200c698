use std::time::Duration;

/// Default capacity of the request queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;
/// Default number of completed items between two progress updates.
pub const DEFAULT_PROGRESS_THRESHOLD: u64 = 10;
/// Maximum encoded or decoded message size on the wire (32MB).
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Timeouts that bound every wait in the pipeline.
#[derive(Debug, Clone)]
pub struct TimeoutOptions {
    /// How long a stage waits on an empty queue before re-checking its
    /// termination predicate.
    pub poll_timeout: Duration,
    /// Global deadline for the whole streaming run.
    pub join_timeout: Duration,
    /// Extra time given to stages after cancellation before they are aborted.
    pub shutdown_grace: Duration,
    /// Timeout for establishing the transport connection.
    pub connect_timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            join_timeout: Duration::from_secs(5 * 60),
            shutdown_grace: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Sizing of a single pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Capacity of the bounded request queue.
    pub channel_capacity: usize,
    /// Number of response consumer workers.
    pub workers: usize,
    /// Completed items between two progress updates.
    pub progress_threshold: u64,
    pub timeouts: TimeoutOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            workers: num_cpus::get(),
            progress_threshold: DEFAULT_PROGRESS_THRESHOLD,
            timeouts: TimeoutOptions::default(),
        }
    }
}
