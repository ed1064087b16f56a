//! The streaming-pull subscriber: a long-lived bidirectional stream against
//! the broker, an in-flight inventory with lease renewal, batched
//! acknowledgements with bounded retries, optional per-key ordered dispatch,
//! and a bounded callback pool — all driven from a single task.
//!
//! To get started, see [`StreamingSubscriber::new`].

mod ack_buffer;
mod config;
mod error;
mod executor;
mod handle;
mod inventory;
mod message;
mod sequencer;
mod service;
mod stream;

pub use crate::subscriber::config::SubscriberConfig;
pub use crate::subscriber::error::{AckError, AckIdFailure, AckKind, SubscriberError};
pub use crate::subscriber::handle::SubscriberHandle;
pub use crate::subscriber::message::{AckHandle, MessageData, ReceivedMessage};
pub use crate::subscriber::service::{
    AckService, PulledMessage, RequestSink, ResponseSource, StreamRequest, StreamResponse,
    StreamSession, Transport,
};
pub use crate::subscriber::stream::StreamingSubscriber;
