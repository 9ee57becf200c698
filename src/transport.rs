//! The duplex channel the stream driver talks to.
//!
//! A transport is opened once per run and split into two independent halves:
//! a [`RequestSink`] for the outbound direction and [`ReplyEvents`] for
//! everything the remote sends back. Replies and the terminal signals arrive
//! as messages, so the receive side never shares mutable state with the send
//! side.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    client::Grpc,
    codec::ProstCodec,
    codegen::http::uri::PathAndQuery,
    transport::{Channel, Endpoint},
    Request,
};
use tracing::{debug, error, info};

use crate::{
    common::{TimeoutOptions, MAX_MESSAGE_SIZE},
    error::{Result, RpcError},
    message::{PdfReply, PdfRequest, GENERATE_PDF_PATH, STREAM_PDFS_PATH},
};

/// Requests buffered between the send loop and the wire.
const OUTBOUND_BUFFER: usize = 64;

/// Something the remote side of the stream did.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One reply arrived.
    Reply(PdfReply),
    /// The stream failed. Terminal.
    Failed(RpcError),
    /// The remote finished the stream after our half-close. Terminal.
    Completed,
}

/// A duplex connection factory.
#[async_trait]
pub trait DuplexTransport: Send + Sync {
    /// Open a new bidirectional stream.
    async fn open(&self) -> Result<DuplexHandle>;
}

/// Both directions of an open stream.
pub struct DuplexHandle {
    sink: RequestSink,
    events: ReplyEvents,
}

impl DuplexHandle {
    /// Assemble a handle from the raw channel ends used by a transport:
    /// `outbound` feeds requests to the wire and `events` delivers what the
    /// remote sends back.
    pub fn new(
        outbound: mpsc::Sender<PdfRequest>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            sink: RequestSink {
                outbound: Some(outbound),
            },
            events: ReplyEvents { events },
        }
    }

    pub fn split(self) -> (RequestSink, ReplyEvents) {
        (self.sink, self.events)
    }
}

/// The outbound half of a stream.
#[derive(Debug)]
pub struct RequestSink {
    outbound: Option<mpsc::Sender<PdfRequest>>,
}

impl RequestSink {
    /// Transmit one request. Fails once the stream is half-closed or the
    /// transport dropped its end.
    pub async fn send(&self, request: PdfRequest) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| RpcError::Transport("request stream already half-closed".to_string()))?;
        outbound
            .send(request)
            .await
            .map_err(|_| RpcError::Transport("request stream closed by transport".to_string()))
    }

    /// Signal that no further requests will be sent. Returns `true` only for
    /// the call that actually closed the stream.
    pub fn half_close(&mut self) -> bool {
        self.outbound.take().is_some()
    }

    pub fn is_half_closed(&self) -> bool {
        self.outbound.is_none()
    }
}

/// The inbound half of a stream.
#[derive(Debug)]
pub struct ReplyEvents {
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl ReplyEvents {
    /// Wait for the next event. `None` means the transport went away without
    /// a terminal signal.
    pub async fn next(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// gRPC implementation of the `MakePDF` service client.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    channel: Channel,
}

impl GrpcTransport {
    /// Build a lazily connected channel to `url`.
    ///
    /// Only an invalid URL fails here; connection problems surface on the
    /// first call.
    pub fn connect_lazy(url: &str, options: &TimeoutOptions) -> Result<Self> {
        let endpoint = Endpoint::from_shared(url.to_string())
            .map_err(|err| RpcError::Config(format!("invalid service url {url}: {err}")))?
            .connect_timeout(options.connect_timeout)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10))
            .keep_alive_while_idle(true);
        info!("Using gRPC service at {}", url);
        Ok(Self {
            channel: endpoint.connect_lazy(),
        })
    }

    fn grpc(&self) -> Grpc<Channel> {
        Grpc::new(self.channel.clone())
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE)
    }

    /// Issue a single unary `GeneratePDF` call.
    pub async fn generate_pdf(&self, request: PdfRequest) -> Result<PdfReply> {
        let mut grpc = self.grpc();
        grpc.ready().await?;
        let codec: ProstCodec<PdfRequest, PdfReply> = ProstCodec::default();
        let response = grpc
            .unary(
                Request::new(request),
                PathAndQuery::from_static(GENERATE_PDF_PATH),
                codec,
            )
            .await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl DuplexTransport for GrpcTransport {
    async fn open(&self) -> Result<DuplexHandle> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut grpc = self.grpc();

        // Pump replies from the wire into the event channel. The call is made
        // here rather than in `open` so that servers which hold back response
        // headers until the first request cannot stall the caller.
        tokio::spawn(async move {
            let terminal = match stream_replies(&mut grpc, outbound_rx, &event_tx).await {
                Ok(()) => TransportEvent::Completed,
                Err(err) => {
                    error!("Streaming RPC failed: {}", err);
                    TransportEvent::Failed(err)
                }
            };
            if event_tx.send(terminal).is_err() {
                debug!("Reply receiver dropped before the terminal event");
            }
        });

        Ok(DuplexHandle::new(outbound_tx, event_rx))
    }
}

async fn stream_replies(
    grpc: &mut Grpc<Channel>,
    outbound: mpsc::Receiver<PdfRequest>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> Result<()> {
    grpc.ready().await?;
    let codec: ProstCodec<PdfRequest, PdfReply> = ProstCodec::default();
    let mut inbound = grpc
        .streaming(
            Request::new(ReceiverStream::new(outbound)),
            PathAndQuery::from_static(STREAM_PDFS_PATH),
            codec,
        )
        .await?
        .into_inner();

    while let Some(reply) = inbound.message().await? {
        debug!("Received reply with {} bytes", reply.pdf.len());
        if events.send(TransportEvent::Reply(reply)).is_err() {
            return Err(RpcError::ChannelClosed(
                "reply receiver dropped mid-stream".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_half_close_exactly_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        let (mut sink, _events) = DuplexHandle::new(tx, event_rx).split();

        sink.send(PdfRequest::new("Alice", "Smith")).await.unwrap();
        assert!(sink.half_close());
        assert!(!sink.half_close());
        assert!(sink.is_half_closed());
        assert!(sink.send(PdfRequest::new("Bob", "Johnson")).await.is_err());

        assert_eq!(rx.recv().await, Some(PdfRequest::new("Alice", "Smith")));
        // Closing the sender ends the outbound stream
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_reply_events_in_order() {
        let (tx, _rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (_sink, mut events) = DuplexHandle::new(tx, event_rx).split();

        event_tx
            .send(TransportEvent::Reply(PdfReply::new(b"one".to_vec())))
            .unwrap();
        event_tx.send(TransportEvent::Completed).unwrap();
        drop(event_tx);

        assert_eq!(
            events.next().await,
            Some(TransportEvent::Reply(PdfReply::new(b"one".to_vec())))
        );
        assert_eq!(events.next().await, Some(TransportEvent::Completed));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let err = GrpcTransport::connect_lazy("not a url", &TimeoutOptions::default()).unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));
    }
}
