use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::retry::{AsyncBackoff, BackoffConfig};
use crate::subscriber::error::{
    is_transient_ack_error, AckIdFailure, AckKind, ErrorHook, SubscriberError,
};
use crate::subscriber::service::AckService;

/// How many delivery attempts a single flushed chunk gets before its
/// identifiers are dropped and left to redelivery.
const MAX_DELIVERY_ATTEMPTS: u32 = 15;

/// Total elapsed budget for retrying one chunk. The broker only honors
/// acknowledgements for ten minutes, so retrying past that is wasted load.
const MAX_DELIVERY_ELAPSED: Duration = Duration::from_secs(600);

const RETRY_MIN_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(64);

/// The one outstanding intent for an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingAction {
    Acknowledge,
    ModifyDeadline(i32),
}

/// Batches acknowledge and deadline-modification intents and delivers them
/// reliably without blocking the caller.
///
/// The register holds at most one intent per identifier: `acknowledge` and
/// `modify_ack_deadline` overwrite whatever is pending, `renew_lease` only
/// fills vacancies. `flush` drains the register into byte-budgeted requests
/// and dispatches each as a background task with bounded retries.
pub(crate) struct AckBuffer {
    subscription: String,
    max_bytes: usize,
    register: FxHashMap<String, PendingAction>,
    service: Arc<dyn AckService>,
    error_hook: ErrorHook,
    /// In-flight request tasks, reaped by the driver loop and drained on
    /// stop.
    pub(crate) tasks: JoinSet<()>,
}

impl AckBuffer {
    pub(crate) fn new(
        subscription: String,
        max_bytes: usize,
        service: Arc<dyn AckService>,
        error_hook: ErrorHook,
    ) -> Self {
        Self {
            subscription,
            max_bytes,
            register: FxHashMap::default(),
            service,
            error_hook,
            tasks: JoinSet::new(),
        }
    }

    /// Records an acknowledge intent for each identifier, superseding any
    /// pending deadline modification.
    pub(crate) fn acknowledge(&mut self, ack_ids: impl IntoIterator<Item = String>) {
        for ack_id in ack_ids {
            self.register.insert(ack_id, PendingAction::Acknowledge);
        }
    }

    /// Records a deadline-modification intent for each identifier,
    /// superseding whatever is pending.
    pub(crate) fn modify_ack_deadline(
        &mut self,
        deadline_seconds: i32,
        ack_ids: impl IntoIterator<Item = String>,
    ) {
        for ack_id in ack_ids {
            self.register
                .insert(ack_id, PendingAction::ModifyDeadline(deadline_seconds));
        }
    }

    /// Records a deadline extension only for identifiers with no pending
    /// intent. A lease renewal must never clobber an ack or a more urgent
    /// modification already queued.
    pub(crate) fn renew_lease(
        &mut self,
        deadline_seconds: i32,
        ack_ids: impl IntoIterator<Item = String>,
    ) {
        for ack_id in ack_ids {
            self.register
                .entry(ack_id)
                .or_insert(PendingAction::ModifyDeadline(deadline_seconds));
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.register.len()
    }

    /// True once the pending register alone would fill a request, meaning a
    /// flush should not wait for the timer.
    pub(crate) fn over_byte_budget(&self) -> bool {
        let mut size = request_base_len(&self.subscription);
        for ack_id in self.register.keys() {
            size += encoded_id_len(ack_id);
            if size >= self.max_bytes {
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn pending_action(&self, ack_id: &str) -> Option<PendingAction> {
        self.register.get(ack_id).copied()
    }

    /// Drains the register and dispatches everything in it: one partition for
    /// acks, one per distinct modification deadline, each split into chunks
    /// that stay under the serialized byte budget.
    pub(crate) fn flush(&mut self) {
        if self.register.is_empty() {
            return;
        }

        let register = std::mem::take(&mut self.register);
        let mut acks = Vec::new();
        let mut modifications: FxHashMap<i32, Vec<String>> = FxHashMap::default();
        for (ack_id, action) in register {
            match action {
                PendingAction::Acknowledge => acks.push(ack_id),
                PendingAction::ModifyDeadline(seconds) => {
                    modifications.entry(seconds).or_default().push(ack_id)
                }
            }
        }

        if !acks.is_empty() {
            tracing::debug!(
                subscription = %self.subscription,
                "flushing {} acknowledgement(s)",
                acks.len()
            );
            for chunk in split_into_chunks(&self.subscription, acks, self.max_bytes) {
                self.dispatch(AckKind::Acknowledge, chunk);
            }
        }

        for (seconds, ack_ids) in modifications {
            tracing::debug!(
                subscription = %self.subscription,
                "flushing {} deadline modification(s) to {}s",
                ack_ids.len(),
                seconds
            );
            for chunk in split_into_chunks(&self.subscription, ack_ids, self.max_bytes) {
                self.dispatch(AckKind::ModifyDeadline(seconds), chunk);
            }
        }
    }

    fn dispatch(&mut self, kind: AckKind, ack_ids: Vec<String>) {
        let service = self.service.clone();
        let subscription = self.subscription.clone();
        let error_hook = self.error_hook.clone();
        self.tasks.spawn(async move {
            deliver_with_retry(service, subscription, kind, ack_ids, error_hook).await;
        });
    }

    /// Waits for every in-flight request task, up to `deadline`. Called after
    /// the final flush during shutdown.
    pub(crate) async fn drain_inflight(&mut self, deadline: Instant) {
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        subscription = %self.subscription,
                        "stopped waiting on {} unfinished acknowledgement request(s)",
                        self.tasks.len()
                    );
                    break;
                }
            }
        }
    }
}

/// Delivers one request, retrying transient failures with exponential
/// backoff under bounded attempts and elapsed time. Per-identifier failure
/// partitions shrink the retried set: permanent identifiers are reported and
/// dropped, identifiers the broker does not name are done, and only the
/// transiently-failed remainder goes back out.
async fn deliver_with_retry(
    service: Arc<dyn AckService>,
    subscription: String,
    kind: AckKind,
    mut ack_ids: Vec<String>,
    error_hook: ErrorHook,
) {
    let mut backoff = AsyncBackoff::new(BackoffConfig {
        min_delay: RETRY_MIN_DELAY,
        max_delay: RETRY_MAX_DELAY,
        multiplier: 2.0,
    });
    let started = Instant::now();

    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        let result = match kind {
            AckKind::Acknowledge => service.acknowledge(&subscription, ack_ids.clone()).await,
            AckKind::ModifyDeadline(seconds) => {
                service
                    .modify_ack_deadline(&subscription, ack_ids.clone(), seconds)
                    .await
            }
        };

        let error = match result {
            Ok(()) => return,
            Err(error) => error,
        };

        // A partitioned response overrides code-level classification: the
        // broker said exactly which identifiers to retry.
        let partitioned = !error.failures.is_empty();
        if partitioned {
            let mut permanent = Vec::new();
            let mut transient = Vec::new();
            for ack_id in ack_ids {
                match error.failures.get(&ack_id) {
                    Some(AckIdFailure::Permanent(reason)) => {
                        tracing::debug!(
                            %subscription,
                            %ack_id,
                            %reason,
                            "{} rejected permanently by the broker",
                            kind
                        );
                        permanent.push(ack_id);
                    }
                    Some(AckIdFailure::Transient) => transient.push(ack_id),
                    None => {}
                }
            }
            if !permanent.is_empty() {
                (error_hook)(SubscriberError::PermanentAckFailure {
                    kind,
                    status: error.status.clone(),
                    ack_ids: permanent,
                });
            }
            ack_ids = transient;
            if ack_ids.is_empty() {
                return;
            }
        }

        if !partitioned && !is_transient_ack_error(error.status.code()) {
            tracing::error!(
                %subscription,
                ?error,
                "{} request failed permanently on attempt {}, dropping {} id(s)",
                kind,
                attempt,
                ack_ids.len()
            );
            (error_hook)(SubscriberError::PermanentAckFailure {
                kind,
                status: error.status,
                ack_ids,
            });
            return;
        }

        if attempt == MAX_DELIVERY_ATTEMPTS || started.elapsed() >= MAX_DELIVERY_ELAPSED {
            tracing::error!(
                %subscription,
                ?error,
                "{} request failed on attempt {}, giving up forever",
                kind,
                attempt
            );
            (error_hook)(SubscriberError::RetriesExhausted {
                kind,
                last_status: error.status,
                ack_ids,
            });
            return;
        }

        let retry_in = backoff.fail();
        tracing::warn!(
            %subscription,
            ?error,
            "{} request failed on attempt {}, retrying {} id(s) in {:?}",
            kind,
            attempt,
            ack_ids.len(),
            retry_in
        );
        tokio::time::sleep(retry_in).await;
    }
}

/// Approximate serialized size of an identifier inside a request: the string
/// plus framing overhead.
fn encoded_id_len(ack_id: &str) -> usize {
    ack_id.len() + 4
}

/// Approximate serialized size of an empty request for the subscription.
fn request_base_len(subscription: &str) -> usize {
    subscription.len() + 16
}

/// Splits identifiers into chunks whose serialized request size stays under
/// `max_bytes`. Every identifier lands in exactly one chunk; a single
/// identifier larger than the budget still gets its own request.
fn split_into_chunks(
    subscription: &str,
    ack_ids: Vec<String>,
    max_bytes: usize,
) -> Vec<Vec<String>> {
    let base = request_base_len(subscription);
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_size = base;

    for ack_id in ack_ids {
        let cost = encoded_id_len(&ack_id);
        if !current.is_empty() && current_size + cost > max_bytes {
            chunks.push(std::mem::take(&mut current));
            current_size = base;
        }
        current_size += cost;
        current.push(ack_id);
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}
