use std::sync::{Arc, Condvar, Mutex, Weak};

use super::MemCompletionQueue;
use crate::{
    Error, ErrorKind, FinishStatus, Payload, Result, StreamCall, TagId, UnaryCall,
};

#[derive(Default)]
pub(crate) struct UnaryTicketInner {
    response: Mutex<Option<Result<Payload>>>,
    ready_cv: Condvar,
}

impl UnaryTicketInner {
    pub(crate) fn fulfill(&self, result: Result<Payload>) {
        let mut response = self.response.lock().unwrap();
        if response.is_none() {
            *response = Some(result);
            self.ready_cv.notify_all();
        }
    }
}

/// Client-side handle for one unary call.
pub struct UnaryTicket(pub(crate) Arc<UnaryTicketInner>);

impl UnaryTicket {
    /// Returns the response if the call has completed.
    #[must_use]
    pub fn try_response(&self) -> Option<Result<Payload>> {
        self.0.response.lock().unwrap().clone()
    }

    /// Blocks until the response arrives or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when nothing arrived in time, or the call's own
    /// failure.
    pub fn wait(&self, timeout: std::time::Duration) -> Result<Payload> {
        let deadline = std::time::Instant::now() + timeout;
        let mut response = self.0.response.lock().unwrap();
        while response.is_none() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::kind(ErrorKind::Timeout));
            }
            let (guard, _) = self
                .0
                .ready_cv
                .wait_timeout(response, deadline - now)
                .unwrap();
            response = guard;
        }
        response.clone().unwrap()
    }
}

struct BoundUnary {
    request: Payload,
    ticket: Arc<UnaryTicketInner>,
}

/// Server-side unary call object. Bound to a client request when the accept
/// completes.
pub(crate) struct MemUnaryCall {
    queue: Arc<MemCompletionQueue>,
    bound: Mutex<Option<BoundUnary>>,
}

impl MemUnaryCall {
    pub(crate) fn create(queue: Arc<MemCompletionQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            bound: Mutex::new(None),
        })
    }

    pub(crate) fn bind(&self, request: Payload, ticket: Arc<UnaryTicketInner>) {
        *self.bound.lock().unwrap() = Some(BoundUnary { request, ticket });
    }
}

impl UnaryCall for MemUnaryCall {
    fn request(&self) -> Payload {
        self.bound
            .lock()
            .unwrap()
            .as_ref()
            .map(|bound| bound.request.clone())
            .unwrap_or_default()
    }

    fn finish(&self, response: Payload, tag: TagId) {
        match self.bound.lock().unwrap().take() {
            Some(bound) => {
                bound.ticket.fulfill(Ok(response));
                self.queue.post_with(tag, true);
            }
            None => {
                tracing::error!("finish on an unbound unary call");
                self.queue.post_with(tag, false);
            }
        }
    }
}

struct StreamTicketState {
    received: Vec<Payload>,
    finished: Option<Result<FinishStatus>>,
    call: Weak<MemStreamCall>,
}

pub(crate) struct StreamTicketInner {
    state: Mutex<StreamTicketState>,
    ready_cv: Condvar,
}

impl StreamTicketInner {
    pub(crate) fn create() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StreamTicketState {
                received: Vec::new(),
                finished: None,
                call: Weak::new(),
            }),
            ready_cv: Condvar::new(),
        })
    }

    fn attach(&self, call: &Arc<MemStreamCall>) {
        self.state.lock().unwrap().call = Arc::downgrade(call);
    }

    fn push(&self, message: Payload) {
        self.state.lock().unwrap().received.push(message);
        self.ready_cv.notify_all();
    }

    pub(crate) fn finish(&self, status: Result<FinishStatus>) {
        let mut state = self.state.lock().unwrap();
        if state.finished.is_none() {
            state.finished = Some(status);
            self.ready_cv.notify_all();
        }
    }
}

/// Client-side handle for one server-streaming call.
pub struct StreamTicket(pub(crate) Arc<StreamTicketInner>);

impl StreamTicket {
    /// Everything received so far.
    #[must_use]
    pub fn received(&self) -> Vec<Payload> {
        self.0.state.lock().unwrap().received.clone()
    }

    /// The terminal status, once the server finished the stream.
    #[must_use]
    pub fn finish_status(&self) -> Option<Result<FinishStatus>> {
        self.0.state.lock().unwrap().finished.clone()
    }

    /// Client-initiated cancellation. Fires the server's teardown watchdog.
    pub fn cancel(&self) {
        let call = self.0.state.lock().unwrap().call.upgrade();
        if let Some(call) = call {
            call.cancel();
        }
    }
}

struct StreamCallInner {
    ticket: Option<Arc<StreamTicketInner>>,
    teardown: Option<TagId>,
    cancelled: bool,
    finished: bool,
}

/// Server-side streaming call object.
pub(crate) struct MemStreamCall {
    queue: Arc<MemCompletionQueue>,
    inner: Mutex<StreamCallInner>,
}

impl MemStreamCall {
    pub(crate) fn create(queue: Arc<MemCompletionQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            inner: Mutex::new(StreamCallInner {
                ticket: None,
                teardown: None,
                cancelled: false,
                finished: false,
            }),
        })
    }

    pub(crate) fn bind(self: &Arc<Self>, ticket: Arc<StreamTicketInner>) {
        ticket.attach(self);
        self.inner.lock().unwrap().ticket = Some(ticket);
    }

    pub(crate) fn cancel(&self) {
        let (ticket, teardown) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.finished || inner.cancelled {
                return;
            }
            inner.cancelled = true;
            (inner.ticket.take(), inner.teardown.take())
        };
        if let Some(ticket) = ticket {
            ticket.finish(Ok(FinishStatus::Cancelled));
        }
        if let Some(tag) = teardown {
            self.queue.post_with(tag, true);
        }
    }

    /// Fails a still-registered teardown tag during transport shutdown, the
    /// way a real pipeline drops such registrations at teardown.
    pub(crate) fn fail_pending_teardown(&self) {
        let teardown = self.inner.lock().unwrap().teardown.take();
        if let Some(tag) = teardown {
            self.queue.post_with(tag, false);
        }
    }
}

impl StreamCall for MemStreamCall {
    fn notify_on_teardown(&self, tag: TagId) {
        let fire_now = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelled || inner.finished {
                true
            } else {
                inner.teardown = Some(tag);
                false
            }
        };
        if fire_now {
            self.queue.post_with(tag, true);
        }
    }

    fn write(&self, message: Payload, tag: TagId) {
        let ok = {
            let inner = self.inner.lock().unwrap();
            if inner.cancelled || inner.finished {
                false
            } else if let Some(ticket) = &inner.ticket {
                ticket.push(message);
                true
            } else {
                false
            }
        };
        self.queue.post_with(tag, ok);
    }

    fn finish(&self, status: FinishStatus, tag: TagId) {
        let (ticket, teardown) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.finished {
                tracing::error!("streaming call finished twice");
                drop(inner);
                self.queue.post_with(tag, false);
                return;
            }
            inner.finished = true;
            (inner.ticket.take(), inner.teardown.take())
        };
        if let Some(ticket) = ticket {
            ticket.finish(Ok(status));
        }
        self.queue.post_with(tag, true);
        // The watchdog fires on every call completion, cancelled or not;
        // the owner distinguishes by its own state.
        if let Some(teardown) = teardown {
            self.queue.post_with(teardown, true);
        }
    }
}
