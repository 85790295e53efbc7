use std::{sync::Arc, time::Duration};

use crate::{Payload, TagId};

/// Outcome of a [`CompletionSource::poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polled {
    /// A previously submitted operation finished, successfully or not.
    Completion { tag: TagId, ok: bool },
    /// Nothing became ready within the requested wait.
    Timeout,
    /// The source has shut down and delivered everything it ever will.
    Shutdown,
}

/// Terminal status a streaming call is finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    Ok,
    Cancelled,
}

/// The transport's completion notification primitive.
///
/// The reactor treats this as a black box: it only ever asks "what finished
/// next" and injects one-shot triggers. Wire format and connection handling
/// live entirely behind this trait.
pub trait CompletionSource: Send + Sync {
    /// Polls for the next completed operation.
    ///
    /// `wait` bounds the blocking time: `Some(Duration::ZERO)` never blocks,
    /// `None` blocks until a completion arrives or the source shuts down.
    /// After [`shutdown`](Self::shutdown), remaining completions are still
    /// drained before [`Polled::Shutdown`] is reported.
    fn poll(&self, wait: Option<Duration>) -> Polled;

    /// Arms a one-shot trigger that delivers `tag` back through
    /// [`poll`](Self::poll) with `ok = true`.
    ///
    /// A tag must not be posted again before its completion has been
    /// delivered. [`Alarm`](crate::Alarm) enforces this cooperatively for
    /// its callers.
    fn post(&self, tag: TagId);

    fn shutdown(&self);
}

/// A single request/response call handed out by the transport.
///
/// `request` is valid once the accept tag has completed successfully.
pub trait UnaryCall: Send + Sync {
    fn request(&self) -> Payload;

    /// Sends the response and completes the call; `tag` is delivered when
    /// the finish operation is done.
    fn finish(&self, response: Payload, tag: TagId);
}

/// A server-to-client streaming call handed out by the transport.
pub trait StreamCall: Send + Sync {
    /// Registers the tag delivered when the call is torn down, including
    /// client-initiated cancellation.
    fn notify_on_teardown(&self, tag: TagId);

    /// Submits one outbound message; `tag` is delivered when the write is
    /// done. At most one write may be outstanding per call.
    fn write(&self, message: Payload, tag: TagId);

    fn finish(&self, status: FinishStatus, tag: TagId);
}

/// Server-side call registration, keyed by completion tags.
pub trait Transport: Send + Sync {
    /// Registers interest in the next incoming unary call for `method`.
    /// The returned call object becomes usable when `tag` completes with
    /// `ok = true`; `ok = false` means the call pipeline is closing.
    fn accept_unary(&self, method: &str, tag: TagId) -> Arc<dyn UnaryCall>;

    /// Streaming counterpart of [`accept_unary`](Self::accept_unary).
    fn accept_stream(&self, method: &str, tag: TagId) -> Arc<dyn StreamCall>;

    /// Stops accepting calls and fails all outstanding accepts with
    /// `ok = false`. Active calls keep working until finished.
    fn shutdown(&self);
}
