use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;

/// Backoff parameters for [`AsyncBackoff`].
#[derive(Clone)]
pub(crate) struct BackoffConfig {
    /// The initial retry interval.
    pub(crate) min_delay: Duration,
    /// The ceiling for the retry interval. Once reached, the interval stops growing.
    pub(crate) max_delay: Duration,
    /// The factor the current interval is multiplied with for each failure.
    pub(crate) multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60 * 5),
            multiplier: 2.0,
        }
    }
}

impl From<BackoffConfig> for ExponentialBackoff<backoff::SystemClock> {
    fn from(config: BackoffConfig) -> Self {
        ExponentialBackoff {
            initial_interval: config.min_delay,
            multiplier: config.multiplier,
            max_interval: config.max_delay,
            // Must stay None: a Some(duration) makes next_backoff() eventually
            // return None, and fail() would flatline at max_delay early.
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// A futures-safe exponential backoff.
pub(crate) struct AsyncBackoff {
    config: BackoffConfig,
    inner: ExponentialBackoff<backoff::SystemClock>,
}

impl AsyncBackoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            inner: config.into(),
        }
    }

    /// Consumes the next backoff interval, growing the one returned by the
    /// following call.
    pub(crate) fn fail(&mut self) -> Duration {
        self.inner.next_backoff().unwrap_or(self.config.max_delay)
    }

    /// Resets the backoff to its initial interval.
    pub(crate) fn succeed(&mut self) {
        self.inner.reset()
    }
}
