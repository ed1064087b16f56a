use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::subscriber::error::{ErrorHook, SubscriberError};
use crate::subscriber::message::ReceivedMessage;
use crate::subscriber::stream::DriverMessage;

/// The user callback, boxed once at construction so the executor stays free
/// of generics.
pub(crate) type Callback = Arc<dyn Fn(ReceivedMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs user callbacks concurrently, at most `callback_threads` at a time.
///
/// `submit` never blocks: each message gets its own tracked task that waits
/// for a pool permit. The callback runs under `catch_unwind`, so the
/// message's completion handle delivers its release even when the callback
/// panics, and the driver always learns how the delivery ended (which is
/// what advances — or suspends — the ordering sequencer). After `stop`,
/// submissions are dropped rather than queued; dropping releases the message
/// back to the broker.
pub(crate) struct CallbackExecutor {
    callback: Callback,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    driver: UnboundedSender<DriverMessage>,
    error_hook: ErrorHook,
}

impl CallbackExecutor {
    pub(crate) fn new(
        callback: Callback,
        callback_threads: usize,
        driver: UnboundedSender<DriverMessage>,
        error_hook: ErrorHook,
    ) -> Self {
        Self {
            callback,
            permits: Arc::new(Semaphore::new(callback_threads)),
            tracker: TaskTracker::new(),
            driver,
            error_hook,
        }
    }

    pub(crate) fn submit(&self, message: ReceivedMessage) {
        if self.tracker.is_closed() {
            tracing::debug!(
                message_id = %message.message_id(),
                "dropping submission after stop; the message is released"
            );
            return;
        }

        let callback = self.callback.clone();
        let permits = self.permits.clone();
        let driver = self.driver.clone();
        let error_hook = self.error_hook.clone();
        let message_id = message.message_id().to_string();
        let ordering_key = message.ordering_key_arc();

        self.tracker.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .expect("invariant: the callback semaphore is never closed");

            let outcome = AssertUnwindSafe((callback)(message)).catch_unwind().await;
            let panicked = outcome.is_err();

            if panicked {
                (error_hook)(SubscriberError::CallbackPanicked {
                    message_id: message_id.clone(),
                });
            }

            if let Some(ordering_key) = ordering_key {
                driver
                    .send(DriverMessage::CallbackFinished {
                        ordering_key,
                        panicked,
                    })
                    .ok();
            }
        });
    }

    /// Stops accepting work and waits for in-flight callbacks, up to
    /// `deadline`.
    pub(crate) async fn stop(&self, deadline: Instant) {
        self.tracker.close();
        if tokio::time::timeout_at(deadline, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "stopped waiting on {} unfinished callback(s)",
                self.tracker.len()
            );
        }
    }
}
