use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use foldhash::fast::RandomState;

use super::{
    MemCompletionQueue, MemStreamCall, MemUnaryCall, StreamTicket, StreamTicketInner,
    UnaryTicket, UnaryTicketInner,
};
use crate::{
    Error, ErrorKind, Payload, StreamCall, TagId, Transport, UnaryCall,
};

struct WaitingUnary {
    tag: TagId,
    call: Arc<MemUnaryCall>,
}

struct BacklogUnary {
    request: Payload,
    ticket: Arc<UnaryTicketInner>,
}

struct WaitingStream {
    tag: TagId,
    call: Arc<MemStreamCall>,
}

struct TransportInner {
    stopping: bool,
    unary_waiting: HashMap<String, VecDeque<WaitingUnary>, RandomState>,
    unary_backlog: HashMap<String, VecDeque<BacklogUnary>, RandomState>,
    stream_waiting: HashMap<String, VecDeque<WaitingStream>, RandomState>,
    stream_backlog: HashMap<String, VecDeque<Arc<StreamTicketInner>>, RandomState>,
}

/// Process-local transport: matches client calls to server accepts by
/// method name and reports every operation through one shared
/// [`MemCompletionQueue`].
pub struct MemTransport {
    queue: Arc<MemCompletionQueue>,
    inner: Mutex<TransportInner>,
}

impl MemTransport {
    pub fn create(queue: Arc<MemCompletionQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            inner: Mutex::new(TransportInner {
                stopping: false,
                unary_waiting: HashMap::default(),
                unary_backlog: HashMap::default(),
                stream_waiting: HashMap::default(),
                stream_backlog: HashMap::default(),
            }),
        })
    }

    /// Issues a unary request. Matched to the next server accept for
    /// `method`, immediately if one is already waiting.
    pub fn call_unary(&self, method: &str, request: Payload) -> UnaryTicket {
        let ticket = Arc::new(UnaryTicketInner::default());

        enum Matched {
            Closed,
            Bound(WaitingUnary),
            Queued,
        }
        let matched = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopping {
                Matched::Closed
            } else if let Some(waiting) = inner
                .unary_waiting
                .get_mut(method)
                .and_then(VecDeque::pop_front)
            {
                Matched::Bound(waiting)
            } else {
                inner
                    .unary_backlog
                    .entry(method.to_string())
                    .or_default()
                    .push_back(BacklogUnary {
                        request: request.clone(),
                        ticket: ticket.clone(),
                    });
                Matched::Queued
            }
        };

        match matched {
            Matched::Closed => ticket.fulfill(Err(Error::kind(ErrorKind::TransportClosed))),
            Matched::Bound(waiting) => {
                waiting.call.bind(request, ticket.clone());
                self.queue.post_with(waiting.tag, true);
            }
            Matched::Queued => {}
        }
        UnaryTicket(ticket)
    }

    /// Opens a server-streaming call. Matched to the next stream accept for
    /// `method`.
    pub fn open_stream(&self, method: &str) -> StreamTicket {
        let ticket = StreamTicketInner::create();

        let waiting = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopping {
                ticket.finish(Err(Error::kind(ErrorKind::TransportClosed)));
                None
            } else if let Some(waiting) = inner
                .stream_waiting
                .get_mut(method)
                .and_then(VecDeque::pop_front)
            {
                Some(waiting)
            } else {
                inner
                    .stream_backlog
                    .entry(method.to_string())
                    .or_default()
                    .push_back(ticket.clone());
                None
            }
        };

        if let Some(waiting) = waiting {
            waiting.call.bind(ticket.clone());
            self.queue.post_with(waiting.tag, true);
        }
        StreamTicket(ticket)
    }
}

impl Transport for MemTransport {
    fn accept_unary(&self, method: &str, tag: TagId) -> Arc<dyn UnaryCall> {
        let call = MemUnaryCall::create(self.queue.clone());

        enum Matched {
            Closed,
            Bound(BacklogUnary),
            Waiting,
        }
        let matched = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopping {
                Matched::Closed
            } else if let Some(backlog) = inner
                .unary_backlog
                .get_mut(method)
                .and_then(VecDeque::pop_front)
            {
                Matched::Bound(backlog)
            } else {
                inner
                    .unary_waiting
                    .entry(method.to_string())
                    .or_default()
                    .push_back(WaitingUnary {
                        tag,
                        call: call.clone(),
                    });
                Matched::Waiting
            }
        };

        match matched {
            Matched::Closed => self.queue.post_with(tag, false),
            Matched::Bound(backlog) => {
                call.bind(backlog.request, backlog.ticket);
                self.queue.post_with(tag, true);
            }
            Matched::Waiting => {}
        }
        call
    }

    fn accept_stream(&self, method: &str, tag: TagId) -> Arc<dyn StreamCall> {
        let call = MemStreamCall::create(self.queue.clone());

        enum Matched {
            Closed,
            Bound(Arc<StreamTicketInner>),
            Waiting,
        }
        let matched = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopping {
                Matched::Closed
            } else if let Some(ticket) = inner
                .stream_backlog
                .get_mut(method)
                .and_then(VecDeque::pop_front)
            {
                Matched::Bound(ticket)
            } else {
                inner
                    .stream_waiting
                    .entry(method.to_string())
                    .or_default()
                    .push_back(WaitingStream {
                        tag,
                        call: call.clone(),
                    });
                Matched::Waiting
            }
        };

        match matched {
            Matched::Closed => self.queue.post_with(tag, false),
            Matched::Bound(ticket) => {
                call.bind(ticket);
                self.queue.post_with(tag, true);
            }
            Matched::Waiting => {}
        }
        call
    }

    fn shutdown(&self) {
        let (unary_waiting, unary_backlog, stream_waiting, stream_backlog) = {
            let mut inner = self.inner.lock().unwrap();
            inner.stopping = true;
            (
                std::mem::take(&mut inner.unary_waiting),
                std::mem::take(&mut inner.unary_backlog),
                std::mem::take(&mut inner.stream_waiting),
                std::mem::take(&mut inner.stream_backlog),
            )
        };

        for waiting in unary_waiting.into_values().flatten() {
            self.queue.post_with(waiting.tag, false);
        }
        for waiting in stream_waiting.into_values().flatten() {
            self.queue.post_with(waiting.tag, false);
            waiting.call.fail_pending_teardown();
        }
        for backlog in unary_backlog.into_values().flatten() {
            backlog
                .ticket
                .fulfill(Err(Error::kind(ErrorKind::TransportClosed)));
        }
        for ticket in stream_backlog.into_values().flatten() {
            ticket.finish(Err(Error::kind(ErrorKind::TransportClosed)));
        }
    }
}

impl std::fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MemTransport")
            .field("stopping", &inner.stopping)
            .finish()
    }
}
