use std::time::Duration;

/// The minimum and default value for the per-extension lease duration floor.
const MIN_LEASE_EXTENSION_SECS: u32 = 10;

/// The maximum and default value for the per-extension lease duration ceiling.
const MAX_LEASE_EXTENSION_SECS: u32 = 600;

/// Configuration for a [`crate::StreamingSubscriber`].
///
/// Defaults mirror what a well-behaved subscriber wants in production: 1,000
/// outstanding messages, 100 MB outstanding bytes, a 60 second stream ack
/// deadline, acknowledgements flushed every second in requests no larger than
/// 500 kB, and 8 concurrent callbacks.
#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    pub(crate) subscription: String,
    pub(crate) max_outstanding_messages: usize,
    pub(crate) max_outstanding_bytes: usize,
    pub(crate) stream_ack_deadline_seconds: u32,
    pub(crate) flow_control_at_server: bool,
    pub(crate) ack_buffer_interval: Duration,
    pub(crate) ack_buffer_max_bytes: usize,
    pub(crate) callback_threads: usize,
    pub(crate) message_ordering: bool,
    pub(crate) min_duration_per_lease_extension: u32,
    pub(crate) max_duration_per_lease_extension: u32,
    pub(crate) max_total_lease_duration: Duration,
}

impl SubscriberConfig {
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            max_outstanding_messages: 1000,
            max_outstanding_bytes: 100_000_000,
            stream_ack_deadline_seconds: 60,
            flow_control_at_server: true,
            ack_buffer_interval: Duration::from_secs(1),
            ack_buffer_max_bytes: 500_000,
            callback_threads: 8,
            message_ordering: false,
            min_duration_per_lease_extension: MIN_LEASE_EXTENSION_SECS,
            max_duration_per_lease_extension: MAX_LEASE_EXTENSION_SECS,
            max_total_lease_duration: Duration::from_secs(3600),
        }
    }

    /// The subscription resource name carried in every stream and unary request.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// The maximum number of received-but-uncompleted messages before the
    /// stream pauses.
    ///
    /// Default: 1000.
    pub fn set_max_outstanding_messages(mut self, max_outstanding_messages: usize) -> Self {
        if max_outstanding_messages == 0 {
            panic!("max_outstanding_messages must be greater than zero");
        }
        self.max_outstanding_messages = max_outstanding_messages;
        self
    }

    /// The maximum total size of received-but-uncompleted messages before the
    /// stream pauses.
    ///
    /// Default: 100MB.
    pub fn set_max_outstanding_bytes(mut self, max_outstanding_bytes: usize) -> Self {
        if max_outstanding_bytes == 0 {
            panic!("max_outstanding_bytes must be greater than zero");
        }
        self.max_outstanding_bytes = max_outstanding_bytes;
        self
    }

    /// The ack deadline requested for the stream itself, in seconds.
    ///
    /// Must be within 10..=600. Default: 60.
    ///
    /// # Panics
    ///
    /// Panics when the deadline falls outside the accepted range.
    pub fn set_stream_ack_deadline_seconds(mut self, seconds: u32) -> Self {
        if !(MIN_LEASE_EXTENSION_SECS..=MAX_LEASE_EXTENSION_SECS).contains(&seconds) {
            panic!(
                "stream ack deadline of {} is outside the accepted range of {}..={}",
                seconds, MIN_LEASE_EXTENSION_SECS, MAX_LEASE_EXTENSION_SECS
            );
        }
        self.stream_ack_deadline_seconds = seconds;
        self
    }

    /// Whether the outstanding-message and outstanding-byte limits are also
    /// sent to the broker so it can enforce them server-side. When disabled,
    /// only the client-side pause/resume gate bounds the stream.
    ///
    /// Default: true.
    pub fn set_flow_control_at_server(mut self, flow_control_at_server: bool) -> Self {
        self.flow_control_at_server = flow_control_at_server;
        self
    }

    /// How often pending acknowledgements and deadline modifications are
    /// flushed to the broker.
    ///
    /// Default: 1 second.
    pub fn set_ack_buffer_interval(mut self, interval: Duration) -> Self {
        if interval.is_zero() {
            panic!("ack_buffer_interval must be non-zero");
        }
        self.ack_buffer_interval = interval;
        self
    }

    /// The serialized-size budget for a single acknowledge or
    /// modify-ack-deadline request. Larger flushes split into multiple
    /// requests.
    ///
    /// Default: 500,000 bytes.
    pub fn set_ack_buffer_max_bytes(mut self, max_bytes: usize) -> Self {
        if max_bytes == 0 {
            panic!("ack_buffer_max_bytes must be greater than zero");
        }
        self.ack_buffer_max_bytes = max_bytes;
        self
    }

    /// The number of user callbacks allowed to run concurrently.
    ///
    /// Default: 8.
    pub fn set_callback_threads(mut self, callback_threads: usize) -> Self {
        if callback_threads == 0 {
            panic!("callback_threads must be greater than zero");
        }
        self.callback_threads = callback_threads;
        self
    }

    /// Enables strict per-ordering-key delivery order.
    ///
    /// Default: false.
    pub fn set_message_ordering(mut self, message_ordering: bool) -> Self {
        self.message_ordering = message_ordering;
        self
    }

    /// How long a received message may be held awaiting processing before its
    /// lease stops being renewed and the broker is left to redeliver it.
    ///
    /// Default: 1 hour.
    pub fn set_max_total_lease_duration(mut self, duration: Duration) -> Self {
        if duration.is_zero() {
            panic!("max_total_lease_duration must be non-zero");
        }
        self.max_total_lease_duration = duration;
        self
    }

    /// Sets the minimum and maximum number of seconds any single lease
    /// extension may request. The adaptive lease duration (driven by observed
    /// callback latency) is clamped to this range.
    ///
    /// The minimum must be >= 10, the maximum <= 600, and min <= max.
    /// Default: (10, 600).
    ///
    /// # Panics
    ///
    /// Panics if any of the bounds above are violated.
    pub fn set_duration_per_lease_extension(mut self, min: u32, max: u32) -> Self {
        if min < MIN_LEASE_EXTENSION_SECS {
            panic!(
                "minimum of {} is under the accepted value of {}",
                min, MIN_LEASE_EXTENSION_SECS
            );
        }
        if max > MAX_LEASE_EXTENSION_SECS {
            panic!(
                "maximum of {} is above the accepted value of {}",
                max, MAX_LEASE_EXTENSION_SECS
            );
        }
        if min > max {
            panic!("minimum ({}) is greater than maximum ({})", min, max);
        }
        self.min_duration_per_lease_extension = min;
        self.max_duration_per_lease_extension = max;
        self
    }
}
