use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::subscriber::stream::DriverMessage;
use crate::task::AbortOnDrop;

/// Owns a running [`crate::StreamingSubscriber`].
///
/// Dropping the handle hard-stops the subscriber immediately; call
/// [`SubscriberHandle::stop`] for a graceful shutdown that flushes pending
/// acknowledgements first.
#[must_use]
pub struct SubscriberHandle {
    subscription: String,
    client_id: Uuid,
    sender: UnboundedSender<DriverMessage>,
    task: AbortOnDrop<()>,
}

impl SubscriberHandle {
    pub(crate) fn new(
        subscription: String,
        client_id: Uuid,
        sender: UnboundedSender<DriverMessage>,
        task: AbortOnDrop<()>,
    ) -> Self {
        Self {
            subscription,
            client_id,
            sender,
            task,
        }
    }

    /// The random identity this subscriber presents to the broker.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Lifts the suspension placed on an ordering key after a failed
    /// delivery, letting its parked messages flow again.
    pub fn resume_ordering_key(&self, ordering_key: &str) {
        self.sender
            .send(DriverMessage::ResumeKey(Arc::from(ordering_key)))
            .ok();
    }

    /// Stops the subscriber gracefully: the stream closes, undispatched
    /// messages return to the broker, in-flight callbacks get up to `grace`
    /// to finish, and pending acknowledgements are flushed with a bounded
    /// wait. If the driver has not converged once `grace` (plus a little
    /// slack) elapses, it is aborted.
    pub async fn stop(self, grace: Duration) {
        let Self {
            subscription,
            client_id,
            sender,
            task,
        } = self;

        let (done_tx, done_rx) = oneshot::channel();
        let join_handle = task.into_inner();

        if sender
            .send(DriverMessage::Stop {
                grace,
                done: done_tx,
            })
            .is_err()
        {
            // The driver is already gone; nothing to wait for.
            join_handle.abort();
            let _ = join_handle.await;
            return;
        }

        let slack = grace.saturating_add(Duration::from_secs(1));
        if tokio::time::timeout(slack, done_rx).await.is_err() {
            tracing::warn!(
                %subscription,
                %client_id,
                "graceful stop did not converge within {:?}, aborting",
                slack
            );
            join_handle.abort();
        }
        let _ = join_handle.await;
    }
}
