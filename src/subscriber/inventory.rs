use std::task::{Context, Poll};
use std::time::Duration;

use fxhash::FxHashMap;
use rand::{thread_rng, Rng};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{DelayQueue, Key};

/// Internal identifier for one delivery. Minted by the [`Inventory`]; the
/// broker's ack token stays inside the entry so completion handles stay
/// `Copy`.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub(crate) struct AckId(u64);

impl AckId {
    pub(crate) fn new() -> Self {
        AckId(0)
    }

    /// The next identifier in the sequence. Wrap-around of a u64 is not
    /// reachable in practice.
    pub(crate) fn next(&self) -> AckId {
        Self(self.0.wrapping_add(1))
    }
}

struct Entry {
    server_ack_id: String,
    size: usize,
    renewal_key: Key,
    /// Past this instant the lease is abandoned and the broker redelivers.
    expires_at: Instant,
}

/// One round of due lease work: identifiers to extend, and identifiers whose
/// total lease budget ran out (already removed from the inventory).
#[derive(Default)]
pub(crate) struct DueRenewals {
    pub(crate) renew: Vec<String>,
    pub(crate) expired: Vec<String>,
}

/// The set of messages delivered to this subscriber but not yet completed.
///
/// Bounds how much work is outstanding (by count and by bytes) and schedules
/// lease renewals for everything it holds. Renewal RPCs themselves belong to
/// the ack buffer; the inventory only decides *when* to ask.
pub(crate) struct Inventory {
    max_messages: usize,
    max_bytes: usize,
    /// How long a message may be held in total before its lease is abandoned.
    max_total_lease: Duration,
    entries: FxHashMap<AckId, Entry>,
    by_server_id: FxHashMap<String, AckId>,
    bytes: usize,
    last_ack_id: AckId,
    renewals: DelayQueue<AckId>,
}

impl Inventory {
    pub(crate) fn new(max_messages: usize, max_bytes: usize, max_total_lease: Duration) -> Self {
        Self {
            max_messages,
            max_bytes,
            max_total_lease,
            entries: FxHashMap::default(),
            by_server_id: FxHashMap::default(),
            bytes: 0,
            last_ack_id: AckId::new(),
            renewals: DelayQueue::with_capacity(max_messages),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once either limit is reached; the stream pauses on this.
    pub(crate) fn full(&self) -> bool {
        self.count() >= self.max_messages || self.bytes >= self.max_bytes
    }

    /// True once outstanding work has drained below 80% of both limits. The
    /// gap between this and [`Inventory::full`] keeps the stream from
    /// oscillating between paused and running.
    pub(crate) fn below_resume_threshold(&self) -> bool {
        (self.count() as f64) < 0.8 * self.max_messages as f64
            && (self.bytes as f64) < 0.8 * self.max_bytes as f64
    }

    /// Registers a delivery and schedules its first lease renewal. Returns
    /// `None` for a broker ack token that is already held (a redelivery racing
    /// the outstanding callback); the caller drops that delivery so a message
    /// is never processed twice concurrently.
    pub(crate) fn register(
        &mut self,
        server_ack_id: &str,
        size: usize,
        lease: Duration,
    ) -> Option<AckId> {
        if self.by_server_id.contains_key(server_ack_id) {
            return None;
        }

        let ack_id = self.last_ack_id.next();
        self.last_ack_id = ack_id;

        let renewal_key = self.renewals.insert(ack_id, renewal_delay(lease));
        self.entries.insert(
            ack_id,
            Entry {
                server_ack_id: server_ack_id.to_string(),
                size,
                renewal_key,
                expires_at: Instant::now() + self.max_total_lease,
            },
        );
        self.by_server_id.insert(server_ack_id.to_string(), ack_id);
        self.bytes += size;

        Some(ack_id)
    }

    /// Removes a delivery, returning the broker ack token it was registered
    /// under. Removing an identifier that is already gone is a no-op.
    pub(crate) fn remove(&mut self, ack_id: AckId) -> Option<String> {
        let entry = self.entries.remove(&ack_id)?;
        self.renewals.remove(&entry.renewal_key);
        self.by_server_id.remove(&entry.server_ack_id);
        self.bytes -= entry.size;
        Some(entry.server_ack_id)
    }

    /// Broker ack tokens for everything currently held, for re-leasing on a
    /// reconnect.
    pub(crate) fn held_server_ids(&self) -> Vec<String> {
        self.entries
            .values()
            .map(|entry| entry.server_ack_id.clone())
            .collect()
    }

    /// Collects up to `max_batch` identifiers whose renewal target has
    /// elapsed. Surviving identifiers are rescheduled with a fresh jittered
    /// target; identifiers past their total lease budget are removed instead
    /// and reported as expired. Never blocks; an empty inventory yields
    /// nothing.
    pub(crate) fn collect_due_renewals(&mut self, max_batch: usize, lease: Duration) -> DueRenewals {
        let noop_waker = futures::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);
        let now = Instant::now();

        let mut due = DueRenewals::default();
        while due.renew.len() + due.expired.len() < max_batch {
            let ack_id = match self.renewals.poll_expired(&mut context) {
                Poll::Ready(Some(expired)) => expired.into_inner(),
                Poll::Ready(None) | Poll::Pending => break,
            };

            let entry = match self.entries.get_mut(&ack_id) {
                Some(entry) => entry,
                None => continue,
            };

            if entry.expires_at <= now {
                // The delay item was just consumed, so only the maps and the
                // byte accounting need unwinding.
                let entry = self
                    .entries
                    .remove(&ack_id)
                    .expect("invariant: the entry was just looked up");
                self.by_server_id.remove(&entry.server_ack_id);
                self.bytes -= entry.size;
                due.expired.push(entry.server_ack_id);
                continue;
            }

            entry.renewal_key = self.renewals.insert(ack_id, renewal_delay(lease));
            due.renew.push(entry.server_ack_id.clone());
        }

        due
    }
}

/// How long to wait before renewing a lease granted for `lease`. The target
/// is a uniformly sampled fraction in [0.8, 0.9) of the lease minus a three
/// second safety margin, so renewals from many concurrent streams do not
/// land on the broker in lockstep.
fn renewal_delay(lease: Duration) -> Duration {
    let headroom = lease.saturating_sub(Duration::from_secs(3));
    let fraction = thread_rng().gen_range(0.8..0.9);
    headroom.mul_f64(fraction).max(Duration::from_secs(1))
}
