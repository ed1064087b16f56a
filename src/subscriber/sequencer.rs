use std::collections::VecDeque;
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::subscriber::message::ReceivedMessage;

#[derive(Default)]
struct KeyState {
    pending: VecDeque<ReceivedMessage>,
    /// A delivery for this key is outstanding; later arrivals park.
    delivering: bool,
    /// A delivery for this key failed; nothing moves until the key is
    /// explicitly resumed.
    suspended: bool,
}

/// Delivers messages sharing an ordering key strictly in arrival order,
/// never concurrently for the same key, while unrelated keys proceed in
/// parallel.
///
/// Owned by the driver; every method returns the message to dispatch (if
/// any) rather than dispatching itself.
#[derive(Default)]
pub(crate) struct MessageSequencer {
    keys: FxHashMap<Arc<str>, KeyState>,
}

impl MessageSequencer {
    /// Accepts an arrival. Unkeyed messages pass straight through; the first
    /// message of an idle key dispatches immediately, everything else parks
    /// behind it.
    pub(crate) fn add(&mut self, message: ReceivedMessage) -> Option<ReceivedMessage> {
        let key = match message.ordering_key_arc() {
            Some(key) => key,
            None => return Some(message),
        };

        let state = self.keys.entry(key).or_default();
        if state.suspended || state.delivering {
            state.pending.push_back(message);
            None
        } else {
            state.delivering = true;
            Some(message)
        }
    }

    /// Records that the outstanding delivery for `key` finished and pops the
    /// next message to dispatch, dropping the key's bookkeeping once drained.
    pub(crate) fn complete(&mut self, key: &str) -> Option<ReceivedMessage> {
        let state = self.keys.get_mut(key)?;
        if state.suspended {
            state.delivering = false;
            return None;
        }

        match state.pending.pop_front() {
            Some(next) => Some(next),
            None => {
                self.keys.remove(key);
                None
            }
        }
    }

    /// Suspends a key after a failed delivery. Returns true the first time,
    /// so the caller surfaces the halt exactly once per suspension.
    pub(crate) fn suspend(&mut self, key: Arc<str>) -> bool {
        let state = self.keys.entry(key).or_default();
        let newly_suspended = !state.suspended;
        state.suspended = true;
        state.delivering = false;
        newly_suspended
    }

    /// Lifts a suspension and pops the next message to dispatch, if one is
    /// parked.
    pub(crate) fn resume(&mut self, key: &str) -> Option<ReceivedMessage> {
        let state = self.keys.get_mut(key)?;
        if !state.suspended {
            return None;
        }
        state.suspended = false;

        match state.pending.pop_front() {
            Some(next) => {
                state.delivering = true;
                Some(next)
            }
            None => {
                if !state.delivering {
                    self.keys.remove(key);
                }
                None
            }
        }
    }

    /// Number of parked messages across all keys.
    pub(crate) fn parked_len(&self) -> usize {
        self.keys.values().map(|state| state.pending.len()).sum()
    }

    /// Removes and returns every parked message. Used at stop to hand
    /// undispatched messages back to the broker.
    pub(crate) fn drain(&mut self) -> Vec<ReceivedMessage> {
        let mut drained = Vec::with_capacity(self.parked_len());
        for (_, mut state) in self.keys.drain() {
            drained.extend(state.pending.drain(..));
        }
        drained
    }
}
