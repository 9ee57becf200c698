use std::sync::Arc;

use clap::Parser;
use pdf_stream_client::{
    config::{CliArgs, ClientConfig},
    message::PdfRequest,
    orchestrator::Orchestrator,
    persist::{DiscardSink, DiskSink, PersistenceSink},
    progress::{ConsoleProgressBar, ProgressSink, TracingProgressSink},
    source::CsvRecordSource,
    telemetry::init_tracing,
    transport::GrpcTransport,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = CliArgs::parse();
    init_tracing();

    // Configuration errors are the only fatal ones.
    let config = ClientConfig::try_from(args)?;
    let transport = Arc::new(GrpcTransport::connect_lazy(
        &config.service_url,
        &config.timeouts,
    )?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, shutting down");
                cancel.cancel();
            }
        });
    }

    if config.mode.runs_unary() {
        match transport.generate_pdf(PdfRequest::new("John", "Doe")).await {
            Ok(reply) => info!("Unary call returned {} bytes", reply.pdf.len()),
            Err(err) => error!("Unary call failed: {}", err),
        }
    }

    if config.mode.runs_stream() {
        let sink: Arc<dyn PersistenceSink> = if config.write_to_disk {
            match DiskSink::create(&config.output_path).await {
                Ok(sink) => Arc::new(sink),
                Err(err) => {
                    error!("{}; documents will not be saved", err);
                    Arc::new(DiscardSink)
                }
            }
        } else {
            Arc::new(DiscardSink)
        };
        let progress: Arc<dyn ProgressSink> = if config.show_enhanced_progress_bar {
            Arc::new(ConsoleProgressBar::from_env())
        } else {
            Arc::new(TracingProgressSink)
        };

        let orchestrator = Orchestrator::new(
            config.pipeline_options(),
            transport,
            Arc::new(CsvRecordSource::new(&config.input_path)),
            sink,
            progress,
            cancel,
        );
        orchestrator.run().await.log_summary();
    }

    Ok(())
}
