//! End-to-end scenarios against an in-process fake broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tonic::Status;

use pullsub::{
    AckError, AckService, PulledMessage, ReceivedMessage, RequestSink, ResponseSource,
    StreamRequest, StreamResponse, StreamSession, StreamingSubscriber, SubscriberConfig,
    SubscriberError, Transport,
};

/// The server half of one opened stream session.
struct ServerSession {
    initial: StreamRequest,
    requests: UnboundedReceiver<StreamRequest>,
    responses: UnboundedSender<Result<StreamResponse, Status>>,
}

struct FakeTransport {
    opens: Mutex<Vec<StreamRequest>>,
    sessions: UnboundedSender<ServerSession>,
}

impl FakeTransport {
    fn new() -> (Arc<Self>, UnboundedReceiver<ServerSession>) {
        let (sessions, session_rx) = unbounded_channel();
        (
            Arc::new(Self {
                opens: Mutex::new(Vec::new()),
                sessions,
            }),
            session_rx,
        )
    }

    fn opens(&self) -> Vec<StreamRequest> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, initial: StreamRequest) -> Result<StreamSession, Status> {
        let (sink, requests) = RequestSink::new();
        let (responses_tx, responses_rx) = unbounded_channel();
        self.opens.lock().unwrap().push(initial.clone());
        self.sessions
            .send(ServerSession {
                initial,
                requests,
                responses: responses_tx,
            })
            .ok();
        Ok(StreamSession {
            requests: sink,
            responses: ResponseSource::from_channel(responses_rx),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
enum AckCall {
    Acknowledge(Vec<String>),
    ModifyDeadline(i32, Vec<String>),
}

#[derive(Default)]
struct FakeAckService {
    calls: Mutex<Vec<AckCall>>,
}

impl FakeAckService {
    fn calls(&self) -> Vec<AckCall> {
        self.calls.lock().unwrap().clone()
    }

    fn acked_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                AckCall::Acknowledge(ids) => Some(ids),
                AckCall::ModifyDeadline(..) => None,
            })
            .flatten()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl AckService for FakeAckService {
    async fn acknowledge(
        &self,
        _subscription: &str,
        mut ack_ids: Vec<String>,
    ) -> Result<(), AckError> {
        ack_ids.sort();
        self.calls
            .lock()
            .unwrap()
            .push(AckCall::Acknowledge(ack_ids));
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        _subscription: &str,
        mut ack_ids: Vec<String>,
        ack_deadline_seconds: i32,
    ) -> Result<(), AckError> {
        ack_ids.sort();
        self.calls
            .lock()
            .unwrap()
            .push(AckCall::ModifyDeadline(ack_deadline_seconds, ack_ids));
        Ok(())
    }
}

fn message(ack_id: &str, ordering_key: &str) -> PulledMessage {
    PulledMessage {
        ack_id: ack_id.to_string(),
        message_id: format!("msg-{}", ack_id),
        data: b"payload".to_vec(),
        attributes: HashMap::new(),
        ordering_key: ordering_key.to_string(),
        delivery_attempt: 1,
        publish_time: None,
    }
}

fn batch(messages: Vec<PulledMessage>) -> Result<StreamResponse, Status> {
    Ok(StreamResponse { messages })
}

async fn next_session(session_rx: &mut UnboundedReceiver<ServerSession>) -> ServerSession {
    tokio::time::timeout(Duration::from_secs(30), session_rx.recv())
        .await
        .expect("timed out waiting for the subscriber to open a session")
        .expect("transport gone")
}

async fn next_message(message_rx: &mut UnboundedReceiver<ReceivedMessage>) -> ReceivedMessage {
    tokio::time::timeout(Duration::from_secs(30), message_rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("callback channel closed")
}

/// A callback that hands every delivery to the test, which settles them at
/// its own pace.
fn forwarding_callback(
) -> (
    impl Fn(ReceivedMessage) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    UnboundedReceiver<ReceivedMessage>,
) {
    let (tx, rx) = unbounded_channel();
    let callback = move |received: ReceivedMessage| {
        let tx = tx.clone();
        let fut: futures::future::BoxFuture<'static, ()> = Box::pin(async move {
            tx.send(received).ok();
        });
        fut
    };
    (callback, rx)
}

#[tokio::test(start_paused = true)]
async fn flow_control_pauses_at_the_limit_and_resumes_below_the_band() {
    let (transport, mut session_rx) = FakeTransport::new();
    let ack_service = Arc::new(FakeAckService::default());
    let (callback, mut message_rx) = forwarding_callback();

    let config = SubscriberConfig::new("projects/p/subscriptions/s")
        .set_max_outstanding_messages(2)
        .set_flow_control_at_server(false);
    let handle =
        StreamingSubscriber::new(config, transport.clone(), ack_service.clone(), callback).start();

    let server = next_session(&mut session_rx).await;
    assert_eq!(server.initial.subscription, "projects/p/subscriptions/s");
    assert_eq!(server.initial.max_outstanding_messages, 0);
    assert!(server.initial.modify_deadline_ack_ids.is_empty());

    // Two deliveries fill the inventory.
    server.responses.send(batch(vec![message("a1", "")])).ok();
    let first = next_message(&mut message_rx).await;
    server.responses.send(batch(vec![message("a2", "")])).ok();
    let _second = next_message(&mut message_rx).await;

    // The stream is paused at the limit: a third message stays queued.
    server.responses.send(batch(vec![message("a3", "")])).ok();
    assert!(
        tokio::time::timeout(Duration::from_secs(5), message_rx.recv())
            .await
            .is_err(),
        "the paused stream must not deliver"
    );

    // One completion drains the inventory to 1 < 0.8 * 2; the stream resumes.
    first.ack();
    let third = next_message(&mut message_rx).await;
    assert_eq!(third.message_id(), "msg-a3");

    // The acknowledge reaches the broker on the flush timer.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(ack_service.acked_ids(), vec!["a1".to_string()]);

    handle.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn a_reconnect_leases_every_held_identifier_in_the_initial_request() {
    let (transport, mut session_rx) = FakeTransport::new();
    let ack_service = Arc::new(FakeAckService::default());
    let (callback, mut message_rx) = forwarding_callback();

    let disconnects = Arc::new(Mutex::new(Vec::new()));
    let disconnects_clone = disconnects.clone();

    let config = SubscriberConfig::new("projects/p/subscriptions/s");
    let handle = StreamingSubscriber::new(config, transport.clone(), ack_service, callback)
        .on_error(move |error| {
            if let SubscriberError::StreamDisconnected { status } = error {
                disconnects_clone.lock().unwrap().push(status.code());
            }
        })
        .start();

    let server = next_session(&mut session_rx).await;
    server
        .responses
        .send(batch(vec![message("held-a", ""), message("held-b", "")]))
        .ok();

    // Keep both messages unsettled while the stream fails.
    let _a = next_message(&mut message_rx).await;
    let _b = next_message(&mut message_rx).await;
    server
        .responses
        .send(Err(Status::unavailable("stream broke")))
        .ok();

    let replacement = next_session(&mut session_rx).await;
    let mut releases = replacement.initial.modify_deadline_ack_ids.clone();
    releases.sort();
    assert_eq!(releases, vec!["held-a".to_string(), "held-b".to_string()]);
    assert_eq!(replacement.initial.modify_deadline_seconds.len(), 2);
    assert!(replacement.initial.modify_deadline_seconds[0] > 0);

    assert_eq!(transport.opens().len(), 2);
    assert_eq!(
        *disconnects.lock().unwrap(),
        vec![tonic::Code::Unavailable]
    );

    handle.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn an_unexpected_end_of_stream_also_reconnects() {
    let (transport, mut session_rx) = FakeTransport::new();
    let ack_service = Arc::new(FakeAckService::default());
    let (callback, _message_rx) = forwarding_callback();

    let config = SubscriberConfig::new("projects/p/subscriptions/s");
    let handle =
        StreamingSubscriber::new(config, transport.clone(), ack_service, callback).start();

    let server = next_session(&mut session_rx).await;
    drop(server.responses);

    let _replacement = next_session(&mut session_rx).await;
    assert_eq!(transport.opens().len(), 2);

    handle.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn ordered_messages_start_in_arrival_order_despite_latency_inversion() {
    let (transport, mut session_rx) = FakeTransport::new();
    let ack_service = Arc::new(FakeAckService::default());

    let starts: Arc<Mutex<Vec<String>>> = Arc::default();
    let starts_clone = starts.clone();
    let callback = move |received: ReceivedMessage| {
        let starts = starts_clone.clone();
        let fut: futures::future::BoxFuture<'static, ()> = Box::pin(async move {
            let id = received.message_id().to_string();
            starts.lock().unwrap().push(id.clone());
            // Earlier arrivals take longer; order must hold regardless.
            let millis = match id.as_str() {
                "msg-o1" => 300,
                "msg-o2" => 100,
                _ => 10,
            };
            tokio::time::sleep(Duration::from_millis(millis)).await;
            received.ack();
        });
        fut
    };

    let config =
        SubscriberConfig::new("projects/p/subscriptions/s").set_message_ordering(true);
    let handle =
        StreamingSubscriber::new(config, transport.clone(), ack_service.clone(), callback).start();

    let server = next_session(&mut session_rx).await;
    server
        .responses
        .send(batch(vec![
            message("o1", "room"),
            message("o2", "room"),
            message("o3", "room"),
        ]))
        .ok();

    for _ in 0..200 {
        if starts.lock().unwrap().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        *starts.lock().unwrap(),
        vec![
            "msg-o1".to_string(),
            "msg-o2".to_string(),
            "msg-o3".to_string()
        ]
    );

    // All three acknowledgements eventually reach the broker.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        ack_service.acked_ids(),
        vec!["o1".to_string(), "o2".to_string(), "o3".to_string()]
    );

    handle.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn a_panicked_ordered_delivery_suspends_the_key_until_resumed() {
    let (transport, mut session_rx) = FakeTransport::new();
    let ack_service = Arc::new(FakeAckService::default());

    let delivered: Arc<Mutex<Vec<String>>> = Arc::default();
    let delivered_clone = delivered.clone();
    let callback = move |received: ReceivedMessage| {
        let delivered = delivered_clone.clone();
        let fut: futures::future::BoxFuture<'static, ()> = Box::pin(async move {
            let id = received.message_id().to_string();
            delivered.lock().unwrap().push(id.clone());
            if id == "msg-p1" {
                panic!("handler rejected the message");
            }
            received.ack();
        });
        fut
    };

    let halted: Arc<Mutex<Vec<String>>> = Arc::default();
    let halted_clone = halted.clone();

    let config =
        SubscriberConfig::new("projects/p/subscriptions/s").set_message_ordering(true);
    let handle = StreamingSubscriber::new(config, transport.clone(), ack_service, callback)
        .on_error(move |error| {
            if let SubscriberError::OrderedDeliveryHalted { ordering_key } = error {
                halted_clone.lock().unwrap().push(ordering_key);
            }
        })
        .start();

    let server = next_session(&mut session_rx).await;
    server
        .responses
        .send(batch(vec![
            message("p1", "room"),
            message("p2", "room"),
        ]))
        .ok();

    // The failed delivery halts the key; p2 stays parked.
    for _ in 0..200 {
        if !halted.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(*halted.lock().unwrap(), vec!["room".to_string()]);
    assert_eq!(*delivered.lock().unwrap(), vec!["msg-p1".to_string()]);

    handle.resume_ordering_key("room");
    for _ in 0..200 {
        if delivered.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        *delivered.lock().unwrap(),
        vec!["msg-p1".to_string(), "msg-p2".to_string()]
    );

    handle.stop(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn stop_flushes_settled_messages_before_returning() {
    let (transport, mut session_rx) = FakeTransport::new();
    let ack_service = Arc::new(FakeAckService::default());
    let (callback, mut message_rx) = forwarding_callback();

    let config = SubscriberConfig::new("projects/p/subscriptions/s")
        // A flush interval far beyond the test horizon: only the stop-time
        // flush can deliver the acknowledge.
        .set_ack_buffer_interval(Duration::from_secs(3600));
    let handle =
        StreamingSubscriber::new(config, transport.clone(), ack_service.clone(), callback).start();

    let server = next_session(&mut session_rx).await;
    server.responses.send(batch(vec![message("s1", "")])).ok();
    next_message(&mut message_rx).await.ack();

    handle.stop(Duration::from_secs(5)).await;

    assert_eq!(ack_service.acked_ids(), vec!["s1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn keepalives_flow_only_while_messages_are_outstanding() {
    let (transport, mut session_rx) = FakeTransport::new();
    let ack_service = Arc::new(FakeAckService::default());
    let (callback, mut message_rx) = forwarding_callback();

    let config = SubscriberConfig::new("projects/p/subscriptions/s");
    let handle =
        StreamingSubscriber::new(config, transport.clone(), ack_service, callback).start();

    let mut server = next_session(&mut session_rx).await;
    server.responses.send(batch(vec![message("k1", "")])).ok();
    let held = next_message(&mut message_rx).await;

    // With a message outstanding, a keepalive shows up within the interval.
    let keepalive = tokio::time::timeout(Duration::from_secs(60), server.requests.recv())
        .await
        .expect("expected a keepalive while holding a message")
        .expect("session closed");
    assert_eq!(keepalive, StreamRequest::keepalive());

    drop(held);
    handle.stop(Duration::from_secs(5)).await;
}
