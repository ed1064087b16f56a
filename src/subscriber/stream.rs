use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use hdrhistogram::Histogram;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tonic::Status;
use uuid::Uuid;

use crate::retry::{AsyncBackoff, BackoffConfig};
use crate::subscriber::ack_buffer::AckBuffer;
use crate::subscriber::config::SubscriberConfig;
use crate::subscriber::error::{is_transient_stream_error, ErrorHook, SubscriberError};
use crate::subscriber::executor::{Callback, CallbackExecutor};
use crate::subscriber::handle::SubscriberHandle;
use crate::subscriber::inventory::{AckId, Inventory};
use crate::subscriber::message::{AckHandle, MessageData, ReceivedMessage};
use crate::subscriber::sequencer::MessageSequencer;
use crate::subscriber::service::{
    AckService, RequestSink, ResponseSource, StreamRequest, StreamResponse, Transport,
};

/// The maximum number of identifiers in a single lease-renewal round.
const RENEWAL_MAX_BATCH_SIZE: usize = 2500;

/// How often due lease renewals are collected.
const LEASE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How often an empty request is pushed to keep intermediaries from tearing
/// down the stream. Half of the sixty seconds after which brokers typically
/// drop an inactive stream. Never pushed while the inventory is empty.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Messages sent to the driver task by completion handles, the callback
/// executor, and the public handle.
pub(crate) enum DriverMessage {
    /// A delivery was settled: explicitly (ack / deadline modification) or by
    /// dropping its handle (release).
    Completed {
        ack_id: AckId,
        outcome: CompletionOutcome,
        latency: Duration,
    },
    /// A callback future finished for a message with an ordering key; this —
    /// not the completion above — is what advances or suspends the sequencer.
    CallbackFinished {
        ordering_key: Arc<str>,
        panicked: bool,
    },
    /// Lift the suspension on an ordering key.
    ResumeKey(Arc<str>),
    /// Begin graceful shutdown.
    Stop {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionOutcome {
    Ack,
    /// Deadline of zero is a nack.
    ModifyDeadline(i32),
    /// Settled without any broker-visible intent; redelivery happens on
    /// lease expiry.
    Release,
}

/// A streaming-pull subscriber, configured but not yet running.
///
/// Construction wires the injected [`Transport`] and [`AckService`] to the
/// user callback; [`StreamingSubscriber::start`] spawns the driver task and
/// returns the [`SubscriberHandle`] that owns it.
pub struct StreamingSubscriber {
    config: SubscriberConfig,
    transport: Arc<dyn Transport>,
    ack_service: Arc<dyn AckService>,
    callback: Callback,
    error_hook: ErrorHook,
}

impl StreamingSubscriber {
    pub fn new<F, Fut>(
        config: SubscriberConfig,
        transport: Arc<dyn Transport>,
        ack_service: Arc<dyn AckService>,
        callback: F,
    ) -> Self
    where
        F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            config,
            transport,
            ack_service,
            callback: Arc::new(move |message: ReceivedMessage| (callback)(message).boxed()),
            error_hook: Arc::new(|error| {
                tracing::error!(?error, "subscriber error");
            }),
        }
    }

    /// Replaces the default log-only error hook. The hook observes every
    /// non-fatal but notable condition: reconnect causes, permanent
    /// per-message failures, callback panics, ordering halts.
    pub fn on_error<E>(mut self, error_hook: E) -> Self
    where
        E: Fn(SubscriberError) + Send + Sync + 'static,
    {
        self.error_hook = Arc::new(error_hook);
        self
    }

    /// Starts pulling: spawns the driver task that owns the transport
    /// session, the inventory, the ack buffer, and callback dispatch.
    pub fn start(self) -> SubscriberHandle {
        let client_id = Uuid::new_v4();
        let (sender, receiver) = unbounded_channel();

        let subscription = self.config.subscription.clone();
        let executor = CallbackExecutor::new(
            self.callback,
            self.config.callback_threads,
            sender.clone(),
            self.error_hook.clone(),
        );
        let ack_buffer = AckBuffer::new(
            subscription.clone(),
            self.config.ack_buffer_max_bytes,
            self.ack_service,
            self.error_hook.clone(),
        );
        let inventory = Inventory::new(
            self.config.max_outstanding_messages,
            self.config.max_outstanding_bytes,
            self.config.max_total_lease_duration,
        );
        let latency_histogram = Histogram::new_with_max(
            u64::from(self.config.max_duration_per_lease_extension) * 1000,
            3,
        )
        .expect("invariant: histogram bounds are validated by SubscriberConfig");

        let lease_seconds = self.config.min_duration_per_lease_extension;
        let mut driver = Driver {
            config: self.config,
            client_id,
            transport: self.transport,
            inventory,
            ack_buffer,
            sequencer: MessageSequencer::default(),
            executor,
            receiver,
            sender: sender.clone(),
            channel: StreamChannel::Closed,
            reconnect_backoff: AsyncBackoff::new(BackoffConfig {
                min_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
            }),
            paused: false,
            latency_histogram,
            lease_seconds,
            error_hook: self.error_hook,
        };
        driver.channel = driver.create_channel(false);

        let task = tokio::spawn(driver.main_loop());
        SubscriberHandle::new(subscription, client_id, sender, task.into())
    }
}

/// The driver owns every piece of mutable subscriber state and runs them
/// from a single task; everything else talks to it through the message
/// channel, so no lock is ever held across a callback or an RPC.
struct Driver {
    config: SubscriberConfig,
    client_id: Uuid,
    transport: Arc<dyn Transport>,
    inventory: Inventory,
    ack_buffer: AckBuffer,
    sequencer: MessageSequencer,
    executor: CallbackExecutor,
    receiver: UnboundedReceiver<DriverMessage>,
    sender: UnboundedSender<DriverMessage>,
    channel: StreamChannel,
    reconnect_backoff: AsyncBackoff,
    /// Set when the inventory fills; gates the transport read arm. Cleared
    /// only by the completion path, once outstanding work drains below the
    /// hysteresis band.
    paused: bool,
    /// Completion latencies in milliseconds, driving the adaptive lease
    /// duration.
    latency_histogram: Histogram<u64>,
    /// The current lease-extension duration requested from the broker.
    lease_seconds: u32,
    error_hook: ErrorHook,
}

enum Action {
    RenewLeases,
    Driver(DriverMessage),
    FlushAcks,
    Keepalive,
    Response(StreamResponse),
    StreamError(Option<Status>),
    TaskReaped,
}

impl Driver {
    async fn main_loop(mut self) {
        tracing::info!(
            subscription = %self.config.subscription,
            client_id = %self.client_id,
            "streaming subscriber starting"
        );

        let mut lease_interval = interval(LEASE_CHECK_INTERVAL);
        lease_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut flush_interval = interval(self.config.ack_buffer_interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut keepalive_interval = interval(KEEPALIVE_INTERVAL);
        keepalive_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // Arms are ordered by urgency: renewals keep leases alive under
            // pressure, completions free inventory and must drain before more
            // acks pile up, flushing beats reading more messages, and
            // background task reaping only matters when nothing else does.
            let action = tokio::select! {
                biased;

                _ = lease_interval.tick() => Action::RenewLeases,
                Some(message) = self.receiver.recv() => Action::Driver(message),
                _ = flush_interval.tick() => Action::FlushAcks,
                _ = keepalive_interval.tick() => Action::Keepalive,
                result = self.channel.next_message(), if !self.paused => {
                    match result {
                        Ok(Some(response)) => Action::Response(response),
                        Ok(None) => Action::StreamError(None),
                        Err(status) => Action::StreamError(Some(status)),
                    }
                }
                Some(_) = self.ack_buffer.tasks.join_next(), if !self.ack_buffer.tasks.is_empty() => {
                    Action::TaskReaped
                }
            };

            match action {
                Action::RenewLeases => self.handle_renew_leases(),
                Action::Driver(DriverMessage::Completed {
                    ack_id,
                    outcome,
                    latency,
                }) => self.handle_completion(ack_id, outcome, latency),
                Action::Driver(DriverMessage::CallbackFinished {
                    ordering_key,
                    panicked,
                }) => self.handle_callback_finished(ordering_key, panicked),
                Action::Driver(DriverMessage::ResumeKey(ordering_key)) => {
                    self.handle_resume_key(&ordering_key)
                }
                Action::Driver(DriverMessage::Stop { grace, done }) => {
                    self.shutdown(grace).await;
                    done.send(()).ok();
                    break;
                }
                Action::FlushAcks => self.ack_buffer.flush(),
                Action::Keepalive => self.handle_keepalive(),
                Action::Response(response) => self.handle_response(response),
                Action::StreamError(status) => self.handle_stream_error(status),
                Action::TaskReaped => {}
            }
        }

        tracing::info!(
            subscription = %self.config.subscription,
            client_id = %self.client_id,
            "streaming subscriber stopped"
        );
    }

    /// Builds the initial request for a fresh session. On reconnects it
    /// re-leases every identifier still held, so the broker does not
    /// redeliver in-flight messages prematurely.
    fn initial_request(&self) -> StreamRequest {
        let held = self.inventory.held_server_ids();
        let deadline = self.lease_seconds as i32;
        StreamRequest {
            subscription: self.config.subscription.clone(),
            client_id: self.client_id.to_string(),
            stream_ack_deadline_seconds: self.config.stream_ack_deadline_seconds as i32,
            max_outstanding_messages: if self.config.flow_control_at_server {
                self.config.max_outstanding_messages as i64
            } else {
                0
            },
            max_outstanding_bytes: if self.config.flow_control_at_server {
                self.config.max_outstanding_bytes as i64
            } else {
                0
            },
            modify_deadline_seconds: vec![deadline; held.len()],
            modify_deadline_ack_ids: held,
        }
    }

    fn create_channel(&mut self, disconnected: bool) -> StreamChannel {
        let subscription = self.config.subscription.clone();
        let client_id = self.client_id;
        let connection_delay = if disconnected {
            let retry_in = self.reconnect_backoff.fail();
            tracing::info!(
                %subscription,
                %client_id,
                "reconnecting to the stream in {:?}",
                retry_in
            );
            retry_in
        } else {
            tracing::info!(%subscription, %client_id, "connecting to the stream");
            Duration::ZERO
        };

        let transport = self.transport.clone();
        let initial = self.initial_request();
        let connection_future = async move {
            tokio::time::sleep(connection_delay).await;
            transport.open(initial).await
        };

        StreamChannel::Connecting {
            future: connection_future.boxed(),
        }
    }

    fn handle_response(&mut self, response: StreamResponse) {
        self.reconnect_backoff.succeed();

        tracing::debug!(
            subscription = %self.config.subscription,
            client_id = %self.client_id,
            "received {} message(s)",
            response.messages.len()
        );

        let received_at = std::time::Instant::now();
        let lease = Duration::from_secs(u64::from(self.lease_seconds));
        let mut fresh_ids = Vec::with_capacity(response.messages.len());

        for pulled in &response.messages {
            let data = MessageData::from_pulled(pulled);
            let ack_id = match self.inventory.register(&pulled.ack_id, data.size(), lease) {
                Some(ack_id) => ack_id,
                None => {
                    // A redelivery of something still being processed; its
                    // callback must not run twice concurrently.
                    tracing::debug!(
                        subscription = %self.config.subscription,
                        client_id = %self.client_id,
                        message_id = %pulled.message_id,
                        "dropping duplicate delivery of a held message"
                    );
                    continue;
                }
            };
            fresh_ids.push(pulled.ack_id.clone());

            let message = ReceivedMessage::new(
                data,
                AckHandle::new(self.sender.clone(), received_at, ack_id),
            );
            self.dispatch(message);
        }

        // Lease the new arrivals right away; the broker's stream deadline
        // alone may be shorter than the adaptive lease duration.
        self.ack_buffer.renew_lease(self.lease_seconds as i32, fresh_ids);
        if self.ack_buffer.over_byte_budget() {
            self.ack_buffer.flush();
        }

        if self.inventory.full() && !self.paused {
            self.paused = true;
            tracing::debug!(
                subscription = %self.config.subscription,
                client_id = %self.client_id,
                "inventory full ({} messages, {} bytes), pausing the stream",
                self.inventory.count(),
                self.inventory.bytes()
            );
        }
    }

    fn dispatch(&mut self, message: ReceivedMessage) {
        if self.config.message_ordering {
            if let Some(ready) = self.sequencer.add(message) {
                self.executor.submit(ready);
            }
        } else {
            self.executor.submit(message);
        }
    }

    fn handle_completion(&mut self, ack_id: AckId, outcome: CompletionOutcome, latency: Duration) {
        self.latency_histogram
            .saturating_record(latency.as_millis() as u64);

        // A completion for an identifier that is already gone (a duplicate
        // settle, or one that raced shutdown) is a no-op.
        let server_ack_id = match self.inventory.remove(ack_id) {
            Some(server_ack_id) => server_ack_id,
            None => return,
        };

        match outcome {
            CompletionOutcome::Ack => self.ack_buffer.acknowledge([server_ack_id]),
            CompletionOutcome::ModifyDeadline(seconds) => {
                self.ack_buffer.modify_ack_deadline(seconds, [server_ack_id])
            }
            CompletionOutcome::Release => {}
        }
        if self.ack_buffer.over_byte_budget() {
            self.ack_buffer.flush();
        }

        if self.paused && self.inventory.below_resume_threshold() {
            self.paused = false;
            tracing::debug!(
                subscription = %self.config.subscription,
                client_id = %self.client_id,
                "inventory drained to {} message(s), resuming the stream",
                self.inventory.count()
            );
        }
    }

    fn handle_callback_finished(&mut self, ordering_key: Arc<str>, panicked: bool) {
        if !self.config.message_ordering {
            return;
        }

        if panicked {
            if self.sequencer.suspend(ordering_key.clone()) {
                (self.error_hook)(SubscriberError::OrderedDeliveryHalted {
                    ordering_key: ordering_key.to_string(),
                });
            }
        } else if let Some(next) = self.sequencer.complete(&ordering_key) {
            self.executor.submit(next);
        }
    }

    fn handle_resume_key(&mut self, ordering_key: &str) {
        if let Some(next) = self.sequencer.resume(ordering_key) {
            self.executor.submit(next);
        }
    }

    /// Collects identifiers whose renewal target elapsed and queues a
    /// deadline extension for the survivors. Identifiers held past the total
    /// lease budget are abandoned to redelivery. The RPC itself (and its
    /// retries) belongs to the ack buffer.
    fn handle_renew_leases(&mut self) {
        self.recompute_lease_seconds();
        let lease = Duration::from_secs(u64::from(self.lease_seconds));

        loop {
            let due = self
                .inventory
                .collect_due_renewals(RENEWAL_MAX_BATCH_SIZE, lease);
            let collected = due.renew.len() + due.expired.len();
            if collected == 0 {
                break;
            }

            if !due.expired.is_empty() {
                tracing::warn!(
                    subscription = %self.config.subscription,
                    client_id = %self.client_id,
                    "abandoned leases on {} message(s) held past the total lease budget",
                    due.expired.len()
                );
            }

            if !due.renew.is_empty() {
                tracing::debug!(
                    subscription = %self.config.subscription,
                    client_id = %self.client_id,
                    "renewing leases for {} message(s) with a {}s deadline",
                    due.renew.len(),
                    self.lease_seconds
                );
                self.ack_buffer.renew_lease(self.lease_seconds as i32, due.renew);
            }

            if collected < RENEWAL_MAX_BATCH_SIZE {
                break;
            }
        }

        // Expiry frees inventory the same way completions do.
        if self.paused && self.inventory.below_resume_threshold() {
            self.paused = false;
            tracing::debug!(
                subscription = %self.config.subscription,
                client_id = %self.client_id,
                "inventory drained to {} message(s), resuming the stream",
                self.inventory.count()
            );
        }
    }

    /// Adapts the lease duration to the p99 of completion latency, rounded up
    /// to whole seconds and clamped to the configured extension bounds.
    fn recompute_lease_seconds(&mut self) {
        let mut p99_millis = self.latency_histogram.value_at_percentile(99.0);
        if p99_millis % 1000 != 0 {
            p99_millis += 1000 - (p99_millis % 1000);
        }

        let next = ((p99_millis / 1000) as u32).clamp(
            self.config.min_duration_per_lease_extension,
            self.config.max_duration_per_lease_extension,
        );

        if next != self.lease_seconds {
            tracing::debug!(
                subscription = %self.config.subscription,
                client_id = %self.client_id,
                "adjusting lease duration from {}s to {}s",
                self.lease_seconds,
                next
            );
            self.lease_seconds = next;
        }
    }

    fn handle_keepalive(&mut self) {
        if self.inventory.is_empty() {
            return;
        }
        self.channel.push(StreamRequest::keepalive());
    }

    fn handle_stream_error(&mut self, status: Option<Status>) {
        match &status {
            Some(status) if is_transient_stream_error(status.code()) => {
                tracing::warn!(
                    subscription = %self.config.subscription,
                    client_id = %self.client_id,
                    %status,
                    "stream failed transiently, reconnecting"
                );
            }
            Some(status) => {
                tracing::error!(
                    subscription = %self.config.subscription,
                    client_id = %self.client_id,
                    %status,
                    "stream failed unexpectedly, reconnecting"
                );
            }
            None => {
                tracing::warn!(
                    subscription = %self.config.subscription,
                    client_id = %self.client_id,
                    "stream ended unexpectedly, reconnecting"
                );
            }
        }

        (self.error_hook)(match status {
            Some(status) => SubscriberError::StreamDisconnected { status },
            None => SubscriberError::StreamEnded,
        });

        self.channel = self.create_channel(true);
    }

    /// Graceful shutdown: close the session, hand undispatched messages back
    /// to the broker, drain in-flight callbacks, then final-flush the ack
    /// buffer — all bounded by `grace`.
    async fn shutdown(&mut self, grace: Duration) {
        tracing::info!(
            subscription = %self.config.subscription,
            client_id = %self.client_id,
            "graceful stop requested"
        );

        let deadline = Instant::now() + grace;
        self.channel.close();

        // Messages parked behind ordering keys were never delivered; a
        // zero-second deadline sends them back for immediate redelivery.
        let parked = self.sequencer.drain();
        let mut returned = Vec::with_capacity(parked.len());
        for message in parked {
            let (_, mut handle) = message.into_parts();
            if let Some(ack_id) = handle.detach() {
                if let Some(server_ack_id) = self.inventory.remove(ack_id) {
                    returned.push(server_ack_id);
                }
            }
        }
        if !returned.is_empty() {
            tracing::debug!(
                subscription = %self.config.subscription,
                client_id = %self.client_id,
                "returning {} undispatched message(s) to the broker",
                returned.len()
            );
            self.ack_buffer.modify_ack_deadline(0, returned);
        }

        self.executor.stop(deadline).await;

        // Completions that arrived while waiting still count; fold them into
        // the final flush.
        while let Ok(message) = self.receiver.try_recv() {
            if let DriverMessage::Completed {
                ack_id,
                outcome,
                latency,
            } = message
            {
                self.handle_completion(ack_id, outcome, latency);
            }
        }

        tracing::debug!(
            subscription = %self.config.subscription,
            client_id = %self.client_id,
            "final flush of {} pending intent(s)",
            self.ack_buffer.pending_len()
        );
        self.ack_buffer.flush();
        self.ack_buffer.drain_inflight(deadline).await;
    }
}

/// The one live bidirectional session, or the connection attempt that will
/// produce it. The connect future is polled by reference from
/// [`StreamChannel::next_message`], so cancelling a read never loses
/// connection progress.
enum StreamChannel {
    Connecting {
        future: BoxFuture<'static, Result<crate::subscriber::service::StreamSession, Status>>,
    },
    Connected {
        sink: RequestSink,
        source: ResponseSource,
    },
    /// Only during shutdown. Reads park forever.
    Closed,
}

impl StreamChannel {
    /// Resolves with the next response batch, transitioning out of
    /// `Connecting` on the way. Never resolves once closed.
    async fn next_message(&mut self) -> Result<Option<StreamResponse>, Status> {
        loop {
            match self {
                StreamChannel::Connected { source, .. } => return source.next().await,
                StreamChannel::Connecting { future } => match future.await {
                    Ok(session) => {
                        *self = StreamChannel::Connected {
                            sink: session.requests,
                            source: session.responses,
                        };
                    }
                    Err(status) => {
                        *self = StreamChannel::Closed;
                        return Err(status);
                    }
                },
                StreamChannel::Closed => return std::future::pending().await,
            }
        }
    }

    fn push(&self, request: StreamRequest) {
        if let StreamChannel::Connected { sink, .. } = self {
            sink.push(request);
        }
    }

    fn close(&mut self) {
        *self = StreamChannel::Closed;
    }
}
