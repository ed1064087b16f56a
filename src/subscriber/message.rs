use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;

use crate::subscriber::inventory::AckId;
use crate::subscriber::service::PulledMessage;
use crate::subscriber::stream::{CompletionOutcome, DriverMessage};

/// Completion guard for one delivery.
///
/// Exactly one outcome reaches the subscriber per handle: an explicit
/// [`AckHandle::ack`], [`AckHandle::nack`], or
/// [`AckHandle::modify_ack_deadline`], or — when the handle is dropped
/// without any of those — a release that removes the message from the
/// in-flight inventory and lets the broker redeliver it after its lease
/// expires.
#[must_use]
pub struct AckHandle {
    state: HandleState,
}

enum HandleState {
    Pending {
        ack_id: AckId,
        received_at: Instant,
        driver: UnboundedSender<DriverMessage>,
    },
    Completed,
}

impl AckHandle {
    pub(crate) fn new(
        driver: UnboundedSender<DriverMessage>,
        received_at: Instant,
        ack_id: AckId,
    ) -> Self {
        Self {
            state: HandleState::Pending {
                ack_id,
                received_at,
                driver,
            },
        }
    }

    /// Marks the message as processed. The broker may discard it.
    pub fn ack(mut self) {
        self.complete(CompletionOutcome::Ack);
    }

    /// Marks the message as not processed. The broker redelivers it, usually
    /// immediately.
    pub fn nack(mut self) {
        self.complete(CompletionOutcome::ModifyDeadline(0));
    }

    /// Pushes the message's ack deadline `seconds` into the future without
    /// completing it on the broker. The message leaves this subscriber's
    /// inventory; redelivery happens once the new deadline lapses.
    pub fn modify_ack_deadline(mut self, seconds: i32) {
        self.complete(CompletionOutcome::ModifyDeadline(seconds));
    }

    /// Marks the handle completed without telling the driver anything; the
    /// caller has already settled the identifier through another path.
    pub(crate) fn detach(&mut self) -> Option<AckId> {
        match std::mem::replace(&mut self.state, HandleState::Completed) {
            HandleState::Pending { ack_id, .. } => Some(ack_id),
            HandleState::Completed => None,
        }
    }

    fn complete(&mut self, outcome: CompletionOutcome) {
        if let HandleState::Pending {
            ack_id,
            received_at,
            driver,
        } = std::mem::replace(&mut self.state, HandleState::Completed)
        {
            driver
                .send(DriverMessage::Completed {
                    ack_id,
                    outcome,
                    latency: received_at.elapsed(),
                })
                .ok();
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        self.complete(CompletionOutcome::Release);
    }
}

/// The payload and metadata of a delivery, free of completion machinery.
#[derive(Debug, Clone)]
pub struct MessageData {
    data: Vec<u8>,
    attributes: HashMap<String, String>,
    message_id: String,
    ordering_key: Option<Arc<str>>,
    delivery_attempt: u32,
    publish_time: Option<prost_types::Timestamp>,
    size: usize,
}

impl MessageData {
    pub(crate) fn from_pulled(message: &PulledMessage) -> Self {
        let size = message.data.len()
            + message.message_id.len()
            + message.ordering_key.len()
            + message
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>();

        Self {
            size,
            data: message.data.clone(),
            attributes: message.attributes.clone(),
            message_id: message.message_id.clone(),
            ordering_key: if message.ordering_key.is_empty() {
                None
            } else {
                Some(Arc::from(message.ordering_key.as_str()))
            },
            delivery_attempt: message.delivery_attempt,
            publish_time: message.publish_time.clone(),
        }
    }

    /// The message payload. May be empty when the message only carries
    /// attributes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Broker-assigned identifier, unique within the topic.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The key grouping messages whose callbacks must run in publish order,
    /// when the subscription enables ordering.
    pub fn ordering_key(&self) -> Option<&str> {
        self.ordering_key.as_deref()
    }

    /// Approximately 1 + nacks + expired deadlines for this message; 0 when
    /// the subscription tracks no delivery attempts.
    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    /// When the broker accepted the message from its publisher.
    pub fn publish_time(&self) -> Option<&prost_types::Timestamp> {
        self.publish_time.as_ref()
    }

    /// The size charged against the flow-control byte limit: payload plus
    /// message id, ordering key, and attribute key/value lengths.
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn ordering_key_arc(&self) -> Option<Arc<str>> {
        self.ordering_key.clone()
    }
}

/// A delivery handed to the user callback: payload plus its completion
/// handle. Dropping it without acking releases the message back to the
/// broker.
#[must_use]
pub struct ReceivedMessage {
    data: MessageData,
    handle: AckHandle,
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("message_id", &self.data.message_id)
            .finish()
    }
}

impl std::ops::Deref for ReceivedMessage {
    type Target = MessageData;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl ReceivedMessage {
    pub(crate) fn new(data: MessageData, handle: AckHandle) -> Self {
        Self { data, handle }
    }

    /// Acknowledges the message and returns its payload.
    pub fn ack(self) -> MessageData {
        self.handle.ack();
        self.data
    }

    /// Rejects the message for immediate redelivery and returns its payload.
    pub fn nack(self) -> MessageData {
        self.handle.nack();
        self.data
    }

    /// Splits the message into its payload and completion handle, for
    /// callers that settle deliveries outside the callback.
    pub fn into_parts(self) -> (MessageData, AckHandle) {
        (self.data, self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn pulled(ack_id: &str, data: &[u8], ordering_key: &str) -> PulledMessage {
        PulledMessage {
            ack_id: ack_id.to_string(),
            message_id: format!("m-{}", ack_id),
            data: data.to_vec(),
            ordering_key: ordering_key.to_string(),
            delivery_attempt: 1,
            ..Default::default()
        }
    }

    fn message(
        driver: &UnboundedSender<DriverMessage>,
        pulled_message: &PulledMessage,
    ) -> ReceivedMessage {
        ReceivedMessage::new(
            MessageData::from_pulled(pulled_message),
            AckHandle::new(driver.clone(), Instant::now(), AckId::new().next()),
        )
    }

    #[tokio::test]
    async fn ack_sends_exactly_one_completion() {
        let (tx, mut rx) = unbounded_channel();
        let msg = message(&tx, &pulled("a", b"payload", ""));

        msg.ack();

        match rx.try_recv().unwrap() {
            DriverMessage::Completed { outcome, .. } => {
                assert!(matches!(outcome, CompletionOutcome::Ack));
            }
            _ => panic!("expected a completion"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_an_unsettled_message_releases_it() {
        let (tx, mut rx) = unbounded_channel();
        drop(message(&tx, &pulled("a", b"payload", "")));

        match rx.try_recv().unwrap() {
            DriverMessage::Completed { outcome, .. } => {
                assert!(matches!(outcome, CompletionOutcome::Release));
            }
            _ => panic!("expected a completion"),
        }
    }

    #[tokio::test]
    async fn nack_is_a_zero_deadline_modification() {
        let (tx, mut rx) = unbounded_channel();
        message(&tx, &pulled("a", b"", "")).nack();

        match rx.try_recv().unwrap() {
            DriverMessage::Completed { outcome, .. } => {
                assert!(matches!(outcome, CompletionOutcome::ModifyDeadline(0)));
            }
            _ => panic!("expected a completion"),
        }
    }

    #[tokio::test]
    async fn detached_handles_go_silent() {
        let (tx, mut rx) = unbounded_channel();
        let msg = message(&tx, &pulled("a", b"", ""));
        let (_, mut handle) = msg.into_parts();

        assert!(handle.detach().is_some());
        assert!(handle.detach().is_none());
        drop(handle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn size_accounts_for_everything_but_the_ack_token() {
        let mut pulled_message = pulled("ack-token", b"12345", "room-7");
        pulled_message
            .attributes
            .insert("k".to_string(), "vv".to_string());

        let data = MessageData::from_pulled(&pulled_message);
        // payload(5) + message_id("m-ack-token" = 11) + ordering_key(6) + attrs(1 + 2)
        assert_eq!(data.size(), 5 + 11 + 6 + 3);
        assert_eq!(data.ordering_key(), Some("room-7"));
    }
}
