use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::Status;

use crate::subscriber::error::AckError;

/// The request half of the bidirectional stream protocol.
///
/// The first request on a session carries the subscription, client identity,
/// stream deadline, and flow-control limits; it also re-leases every
/// identifier the subscriber still holds, so a reconnect does not orphan
/// in-flight messages. Subsequent requests are deadline modifications or
/// empty keepalives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamRequest {
    pub subscription: String,
    pub client_id: String,
    pub stream_ack_deadline_seconds: i32,
    pub max_outstanding_messages: i64,
    pub max_outstanding_bytes: i64,
    pub modify_deadline_seconds: Vec<i32>,
    pub modify_deadline_ack_ids: Vec<String>,
}

impl StreamRequest {
    /// An empty request, pushed periodically to keep intermediaries from
    /// tearing down an idle stream.
    pub fn keepalive() -> Self {
        Self::default()
    }
}

/// A batch of messages delivered by the broker on the stream.
#[derive(Debug, Clone, Default)]
pub struct StreamResponse {
    pub messages: Vec<PulledMessage>,
}

/// A single message as it arrives on the wire, before the subscriber wraps it
/// with a completion handle.
#[derive(Debug, Clone, Default)]
pub struct PulledMessage {
    /// Opaque token used to acknowledge or re-lease this delivery.
    pub ack_id: String,
    /// Broker-assigned message identifier, unique within the topic.
    pub message_id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// Empty when the message carries no ordering key.
    pub ordering_key: String,
    /// 1 on first delivery; grows with nacks and expired deadlines.
    pub delivery_attempt: u32,
    pub publish_time: Option<prost_types::Timestamp>,
}

/// The push half of an open session. Cheap to clone; pushes are buffered and
/// forwarded by the transport.
#[derive(Debug, Clone)]
pub struct RequestSink {
    sender: UnboundedSender<StreamRequest>,
}

impl RequestSink {
    /// Creates a sink and the receiver a transport drains it from.
    pub fn new() -> (Self, UnboundedReceiver<StreamRequest>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Enqueues a request. Returns false once the session is gone.
    pub fn push(&self, request: StreamRequest) -> bool {
        self.sender.send(request).is_ok()
    }
}

/// The pull half of an open session: response batches until the broker ends
/// the stream or fails it.
pub struct ResponseSource {
    inner: Pin<Box<dyn Stream<Item = Result<StreamResponse, Status>> + Send>>,
}

impl ResponseSource {
    pub fn new(stream: impl Stream<Item = Result<StreamResponse, Status>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// Adapts a channel of server events into a source.
    pub fn from_channel(receiver: UnboundedReceiver<Result<StreamResponse, Status>>) -> Self {
        Self::new(UnboundedReceiverStream::new(receiver))
    }

    /// The next batch, `Ok(None)` on a clean end of stream, or the error that
    /// tore the session down.
    pub async fn next(&mut self) -> Result<Option<StreamResponse>, Status> {
        match self.inner.next().await {
            Some(Ok(response)) => Ok(Some(response)),
            Some(Err(status)) => Err(status),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for ResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSource").finish_non_exhaustive()
    }
}

/// An open bidirectional session.
#[derive(Debug)]
pub struct StreamSession {
    pub requests: RequestSink,
    pub responses: ResponseSource,
}

/// Factory for bidirectional sessions against the broker.
///
/// The subscriber owns exactly one live session at a time and opens a
/// replacement (with a fresh `initial` request) whenever the current one
/// fails. Implementations are injected at construction, so tests substitute
/// an in-process double without touching the subscriber.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, initial: StreamRequest) -> Result<StreamSession, Status>;
}

/// The unary acknowledge / modify-ack-deadline paths.
///
/// Implementations surface per-identifier partial failures through
/// [`AckError::failures`] when the broker reports them.
#[async_trait]
pub trait AckService: Send + Sync {
    async fn acknowledge(&self, subscription: &str, ack_ids: Vec<String>)
        -> Result<(), AckError>;

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline_seconds: i32,
    ) -> Result<(), AckError>;
}
