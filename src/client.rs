use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    common::TimeoutOptions,
    error::{Result, RpcError},
    queue::{BoundedRequestQueue, UnboundedResponseQueue},
    state::PipelineCounters,
    transport::{ReplyEvents, RequestSink, TransportEvent},
};

/// Lifecycle of the duplex stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Requests are being transmitted.
    Streaming,
    /// Loading finished and the request queue is empty.
    Draining,
    /// No further requests will be sent; replies may still arrive.
    HalfClosed,
    /// The remote finished the stream.
    Completed,
    /// The stream failed.
    Failed,
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug)]
struct DriverStatus {
    state: DriverState,
    failure: Option<RpcError>,
}

/// Owns the duplex channel for one run.
///
/// The send loop and the receive loop run as separate tasks sharing the
/// driver through an `Arc`. They only meet at the state machine, which is
/// never locked across a network send.
pub struct StreamDriver {
    status: Mutex<DriverStatus>,
    counters: Arc<PipelineCounters>,
    timeout_options: TimeoutOptions,
    /// Fired when the stream fails or the run is cancelled. Child of the
    /// pipeline token.
    abort: CancellationToken,
}

impl StreamDriver {
    pub fn new(
        counters: Arc<PipelineCounters>,
        timeout_options: TimeoutOptions,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            status: Mutex::new(DriverStatus {
                state: DriverState::Streaming,
                failure: None,
            }),
            counters,
            timeout_options,
            abort: cancel.child_token(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.status.lock().state
    }

    pub fn failure(&self) -> Option<RpcError> {
        self.status.lock().failure.clone()
    }

    /// Token fired when the stream can no longer accept requests. Upstream
    /// stages select on it so they never block on a dead stream.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Move to `next` unless the stream already reached a terminal state.
    fn transition(&self, next: DriverState) -> bool {
        let mut status = self.status.lock();
        if status.state.is_terminal() {
            return false;
        }
        debug!("Stream driver: {:?} -> {:?}", status.state, next);
        status.state = next;
        true
    }

    fn fail(&self, err: RpcError) {
        {
            let mut status = self.status.lock();
            if status.state.is_terminal() {
                return;
            }
            status.state = DriverState::Failed;
            status.failure = Some(err);
        }
        self.abort.cancel();
    }

    /// Drain the request queue into the stream, in order, then half-close.
    ///
    /// Returns the number of requests transmitted.
    pub async fn send_loop(
        &self,
        mut sink: RequestSink,
        request_queue: BoundedRequestQueue,
    ) -> Result<u64> {
        let mut sent = 0;
        let res = loop {
            if self.abort.is_cancelled() {
                break Err(self.failure().unwrap_or(RpcError::Cancelled));
            }

            match request_queue
                .try_dequeue(self.timeout_options.poll_timeout)
                .await
            {
                Some(request) => {
                    let res = tokio::select! {
                        res = sink.send(request) => res,
                        _ = self.abort.cancelled() => {
                            Err(self.failure().unwrap_or(RpcError::Cancelled))
                        }
                    };
                    if let Err(err) = res {
                        if err != RpcError::Cancelled {
                            error!("Failed to send request: {}", err);
                            self.fail(err.clone());
                        }
                        break Err(err);
                    }
                    sent += 1;
                }
                None => {
                    if self.counters.loading_finished() && request_queue.is_empty() {
                        self.transition(DriverState::Draining);
                        break Ok(sent);
                    }
                }
            }
        };

        // Half-close on every exit path so the remote can finish.
        if sink.half_close() {
            self.transition(DriverState::HalfClosed);
        }
        match &res {
            Ok(sent) => info!("Request stream completed, {} requests sent", sent),
            Err(err) => warn!("Request stream stopped after {} requests: {}", sent, err),
        }
        res
    }

    /// Move every reply into the response queue until the stream ends.
    ///
    /// Returns the number of replies received.
    pub async fn recv_loop(
        &self,
        mut events: ReplyEvents,
        response_queue: UnboundedResponseQueue,
    ) -> Result<u64> {
        let mut received = 0;
        let res = loop {
            let event = tokio::select! {
                biased;
                event = events.next() => event,
                _ = self.abort.cancelled() => {
                    break Err(self.failure().unwrap_or(RpcError::Cancelled));
                }
            };
            match event {
                Some(TransportEvent::Reply(reply)) => {
                    if let Err(err) = response_queue.enqueue(reply) {
                        self.fail(err.clone());
                        break Err(err);
                    }
                    received += 1;
                }
                Some(TransportEvent::Completed) => {
                    self.transition(DriverState::Completed);
                    break Ok(received);
                }
                Some(TransportEvent::Failed(err)) => {
                    error!("Response stream failed: {}", err);
                    self.fail(err.clone());
                    break Err(err);
                }
                None => {
                    let err = RpcError::Transport(
                        "transport closed without a completion signal".to_string(),
                    );
                    error!("Response stream failed: {}", err);
                    self.fail(err.clone());
                    break Err(err);
                }
            }
        };

        self.counters.finish_replies();
        if res.is_ok() {
            info!("Response stream completed, {} replies received", received);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{PdfReply, PdfRequest},
        transport::DuplexHandle,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn options() -> TimeoutOptions {
        TimeoutOptions {
            poll_timeout: Duration::from_millis(10),
            ..TimeoutOptions::default()
        }
    }

    #[tokio::test]
    async fn test_send_loop_preserves_order_and_half_closes() {
        let counters = Arc::new(PipelineCounters::new());
        let cancel = CancellationToken::new();
        let driver = StreamDriver::new(counters.clone(), options(), &cancel);

        let queue = BoundedRequestQueue::new(16);
        for i in 0..10 {
            counters.record_loaded();
            queue
                .enqueue(PdfRequest::new(format!("F{i}"), format!("L{i}")), &cancel)
                .await
                .unwrap();
        }
        counters.finish_loading();

        let (tx, mut rx) = mpsc::channel(16);
        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        let (sink, _events) = DuplexHandle::new(tx, event_rx).split();

        assert_eq!(driver.send_loop(sink, queue).await, Ok(10));
        assert_eq!(driver.state(), DriverState::HalfClosed);

        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap().first_name, format!("F{i}"));
        }
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_loop_waits_for_loading() {
        let counters = Arc::new(PipelineCounters::new());
        let cancel = CancellationToken::new();
        let driver = Arc::new(StreamDriver::new(counters.clone(), options(), &cancel));
        let queue = BoundedRequestQueue::new(4);

        let (tx, mut rx) = mpsc::channel(16);
        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        let (sink, _events) = DuplexHandle::new(tx, event_rx).split();

        let handle = {
            let driver = driver.clone();
            let queue = queue.clone();
            tokio::spawn(async move { driver.send_loop(sink, queue).await })
        };

        // An empty queue is not the end while loading is in progress
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.state(), DriverState::Streaming);

        counters.record_loaded();
        queue
            .enqueue(PdfRequest::new("Alice", "Smith"), &cancel)
            .await
            .unwrap();
        counters.finish_loading();

        assert_eq!(handle.await.unwrap(), Ok(1));
        assert_eq!(rx.recv().await, Some(PdfRequest::new("Alice", "Smith")));
    }

    #[tokio::test]
    async fn test_recv_loop_enqueues_and_completes() {
        let counters = Arc::new(PipelineCounters::new());
        let cancel = CancellationToken::new();
        let driver = StreamDriver::new(counters.clone(), options(), &cancel);
        let responses = UnboundedResponseQueue::new();

        let (tx, _rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (_sink, events) = DuplexHandle::new(tx, event_rx).split();

        for payload in [b"a".to_vec(), Vec::new(), b"c".to_vec()] {
            event_tx
                .send(TransportEvent::Reply(PdfReply::new(payload)))
                .unwrap();
        }
        event_tx.send(TransportEvent::Completed).unwrap();

        assert_eq!(driver.recv_loop(events, responses.clone()).await, Ok(3));
        assert_eq!(driver.state(), DriverState::Completed);
        assert!(counters.replies_finished());
        assert_eq!(responses.len(), 3);
    }

    #[tokio::test]
    async fn test_failure_unblocks_send_loop() {
        let counters = Arc::new(PipelineCounters::new());
        let cancel = CancellationToken::new();
        let driver = Arc::new(StreamDriver::new(counters.clone(), options(), &cancel));
        let queue = BoundedRequestQueue::new(4);

        // Outbound buffer of one with nobody reading: the second send blocks.
        let (tx, _rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (sink, events) = DuplexHandle::new(tx, event_rx).split();

        for i in 0..3 {
            counters.record_loaded();
            queue
                .enqueue(PdfRequest::new(format!("F{i}"), "L"), &cancel)
                .await
                .unwrap();
        }

        let send = {
            let driver = driver.clone();
            let queue = queue.clone();
            tokio::spawn(async move { driver.send_loop(sink, queue).await })
        };
        let recv = {
            let driver = driver.clone();
            tokio::spawn(async move {
                driver
                    .recv_loop(events, UnboundedResponseQueue::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let failure = RpcError::Transport("connection reset".to_string());
        event_tx.send(TransportEvent::Failed(failure.clone())).unwrap();

        let send_res = tokio::time::timeout(Duration::from_secs(1), send)
            .await
            .expect("send loop ignored the failure")
            .unwrap();
        assert_eq!(send_res, Err(failure.clone()));
        assert_eq!(recv.await.unwrap(), Err(failure.clone()));
        assert_eq!(driver.state(), DriverState::Failed);
        assert_eq!(driver.failure(), Some(failure));
        assert!(driver.abort_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_transport_gone_without_signal() {
        let counters = Arc::new(PipelineCounters::new());
        let cancel = CancellationToken::new();
        let driver = StreamDriver::new(counters, options(), &cancel);

        let (tx, _rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (_sink, events) = DuplexHandle::new(tx, event_rx).split();
        drop(event_tx);

        let res = driver.recv_loop(events, UnboundedResponseQueue::new()).await;
        assert!(matches!(res, Err(RpcError::Transport(_))));
        assert_eq!(driver.state(), DriverState::Failed);
    }

    #[tokio::test]
    async fn test_cancellation_stops_both_loops() {
        let counters = Arc::new(PipelineCounters::new());
        let cancel = CancellationToken::new();
        let driver = Arc::new(StreamDriver::new(counters, options(), &cancel));

        let (tx, _rx) = mpsc::channel(1);
        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        let (sink, events) = DuplexHandle::new(tx, event_rx).split();

        let send = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.send_loop(sink, BoundedRequestQueue::new(1)).await })
        };
        let recv = {
            let driver = driver.clone();
            tokio::spawn(async move {
                driver
                    .recv_loop(events, UnboundedResponseQueue::new())
                    .await
            })
        };

        cancel.cancel();
        let (send_res, recv_res) = tokio::time::timeout(Duration::from_secs(1), async {
            (send.await.unwrap(), recv.await.unwrap())
        })
        .await
        .unwrap();
        assert_eq!(send_res, Err(RpcError::Cancelled));
        assert_eq!(recv_res, Err(RpcError::Cancelled));
        assert_eq!(driver.state(), DriverState::HalfClosed);
    }
}
