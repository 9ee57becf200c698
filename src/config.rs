//! Command line and environment configuration of the client binary.

use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};

use crate::{
    common::{PipelineOptions, TimeoutOptions, DEFAULT_CHANNEL_CAPACITY, DEFAULT_PROGRESS_THRESHOLD},
    error::RpcError,
    source::DEFAULT_SOURCE_PATH,
};

/// Which calls a run issues.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Stream every record of the source.
    #[default]
    Stream,
    /// One unary probe request only.
    Unary,
    /// The unary probe, then the streaming run.
    Both,
}

impl RunMode {
    pub fn runs_unary(&self) -> bool {
        matches!(self, Self::Unary | Self::Both)
    }

    pub fn runs_stream(&self) -> bool {
        matches!(self, Self::Stream | Self::Both)
    }
}

/// Raw settings, parsed from CLI arguments or environment variables.
///
/// Numeric values are signed so that zero or negative settings can be
/// coerced to their defaults instead of rejected.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pdf-stream-client",
    version,
    about = "Streams PDF generation requests to a MakePDF gRPC service"
)]
pub struct CliArgs {
    /// Address of the MakePDF service, e.g. `http://127.0.0.1:50051`.
    ///
    /// Environment variable: `SERVICE_URL`
    #[arg(long, env = "SERVICE_URL")]
    pub service_url: Option<String>,

    /// Directory receiving the generated documents. Defaults to `./output`.
    ///
    /// Environment variable: `OUTPUT_PATH`
    #[arg(long, env = "OUTPUT_PATH")]
    pub output_path: Option<PathBuf>,

    /// Write every reply to its own file in the output directory.
    ///
    /// Environment variable: `WRITE_TO_DISK`
    #[arg(long, env = "WRITE_TO_DISK", default_value_t = false)]
    pub write_to_disk: bool,

    /// Draw a progress bar instead of logging progress lines.
    ///
    /// Environment variable: `SHOW_ENHANCED_PROGRESS_BAR`
    #[arg(long, env = "SHOW_ENHANCED_PROGRESS_BAR", default_value_t = false)]
    pub show_enhanced_progress_bar: bool,

    /// Capacity of the request queue. Values below one use the default.
    ///
    /// Environment variable: `CHANNEL_CAPACITY`
    #[arg(
        long,
        env = "CHANNEL_CAPACITY",
        default_value_t = DEFAULT_CHANNEL_CAPACITY as i64,
        allow_negative_numbers = true
    )]
    pub channel_capacity: i64,

    /// Number of reply consumers. Values below one use the number of CPUs.
    ///
    /// Environment variable: `MAX_DEGREE_OF_PARALLELISM`
    #[arg(
        long,
        env = "MAX_DEGREE_OF_PARALLELISM",
        default_value_t = 0,
        allow_negative_numbers = true
    )]
    pub max_degree_of_parallelism: i64,

    /// Completed items between two progress updates. Values below one use
    /// the default.
    ///
    /// Environment variable: `PROGRESS_UPDATE_THRESHOLD`
    #[arg(
        long,
        env = "PROGRESS_UPDATE_THRESHOLD",
        default_value_t = DEFAULT_PROGRESS_THRESHOLD as i64,
        allow_negative_numbers = true
    )]
    pub progress_update_threshold: i64,

    /// CSV file with one `last name, first name` record per line.
    ///
    /// Environment variable: `INPUT_PATH`
    #[arg(long, env = "INPUT_PATH", default_value = DEFAULT_SOURCE_PATH)]
    pub input_path: PathBuf,

    /// Global timeout of a streaming run, in seconds.
    ///
    /// Environment variable: `STREAM_TIMEOUT_SECS`
    #[arg(long, env = "STREAM_TIMEOUT_SECS", default_value_t = 300)]
    pub stream_timeout_secs: u64,

    /// How long a stage waits on an empty queue before re-checking whether
    /// it is done, in milliseconds.
    ///
    /// Environment variable: `POLL_TIMEOUT_MS`
    #[arg(long, env = "POLL_TIMEOUT_MS", default_value_t = 100)]
    pub poll_timeout_ms: u64,

    /// Environment variable: `RUN_MODE`
    #[arg(long = "mode", env = "RUN_MODE", value_enum, default_value_t = RunMode::Stream)]
    pub mode: RunMode,
}

/// Validated client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub service_url: String,
    pub output_path: PathBuf,
    pub write_to_disk: bool,
    pub show_enhanced_progress_bar: bool,
    pub channel_capacity: usize,
    pub workers: usize,
    pub progress_threshold: u64,
    pub input_path: PathBuf,
    pub mode: RunMode,
    pub timeouts: TimeoutOptions,
}

impl ClientConfig {
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            channel_capacity: self.channel_capacity,
            workers: self.workers,
            progress_threshold: self.progress_threshold,
            timeouts: self.timeouts.clone(),
        }
    }
}

/// `value` if it is positive, `default` otherwise.
fn positive_or(value: i64, default: usize) -> usize {
    usize::try_from(value)
        .ok()
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

impl TryFrom<CliArgs> for ClientConfig {
    type Error = RpcError;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let service_url = args
            .service_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| RpcError::Config("SERVICE_URL must be set".to_string()))?;

        let output_path = match args.output_path {
            Some(path) if !path.as_os_str().is_empty() => path,
            _ => std::env::current_dir()
                .map_err(|err| {
                    RpcError::Config(format!("cannot resolve working directory: {err}"))
                })?
                .join("output"),
        };

        let mut timeouts = TimeoutOptions::default();
        if args.stream_timeout_secs > 0 {
            timeouts.join_timeout = Duration::from_secs(args.stream_timeout_secs);
        }
        if args.poll_timeout_ms > 0 {
            timeouts.poll_timeout = Duration::from_millis(args.poll_timeout_ms);
        }

        Ok(Self {
            service_url,
            output_path,
            write_to_disk: args.write_to_disk,
            show_enhanced_progress_bar: args.show_enhanced_progress_bar,
            channel_capacity: positive_or(args.channel_capacity, DEFAULT_CHANNEL_CAPACITY),
            workers: positive_or(args.max_degree_of_parallelism, num_cpus::get()),
            progress_threshold: positive_or(
                args.progress_update_threshold,
                DEFAULT_PROGRESS_THRESHOLD as usize,
            ) as u64,
            input_path: args.input_path,
            mode: args.mode,
            timeouts,
        })
    }
}
