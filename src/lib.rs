//! A streaming-pull subscriber client for a publish/subscribe broker.
//!
//! The subscriber maintains one long-lived bidirectional stream session,
//! bounds how many messages are outstanding (pausing the stream when full and
//! resuming once enough drain), keeps leases on everything it holds, batches
//! acknowledgements and deadline modifications into byte-budgeted requests
//! with bounded retries, and reconnects transparently on transport failures.
//! User callbacks run concurrently on a bounded pool; messages sharing an
//! ordering key are delivered strictly in arrival order.
//!
//! The broker itself sits behind two injected seams: [`Transport`] (the
//! bidirectional stream) and [`AckService`] (the unary acknowledge and
//! modify-ack-deadline paths). Network failures never reach the caller;
//! anything notable is surfaced asynchronously through the error hook
//! registered with [`StreamingSubscriber::on_error`].

mod retry;
mod task;

pub mod subscriber;

pub use crate::subscriber::{
    AckError, AckHandle, AckIdFailure, AckKind, AckService, MessageData, PulledMessage,
    ReceivedMessage, RequestSink, ResponseSource, StreamRequest, StreamResponse, StreamSession,
    StreamingSubscriber, SubscriberConfig, SubscriberError, SubscriberHandle, Transport,
};
