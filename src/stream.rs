use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{
    Alarm, Error, ErrorKind, FinishStatus, Payload, Reactor, Result, Strand, StreamCall,
    Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Inactive,
    Listening,
    WaitingForAvailableData,
    WaitingForWriteDone,
    Stopping,
    Cancelled,
}

struct StreamInner {
    state: StreamState,
    call: Option<Arc<dyn StreamCall>>,
    /// Latest producer-supplied message not yet handed to the transport.
    /// Overwritten by newer exchanges: streaming is last-value-wins.
    pending: Option<Payload>,
    /// Message currently handed to the transport write.
    inflight: Option<Payload>,
    /// Last message confirmed written, held for the next `exchange_data`.
    written: Option<Payload>,
}

/// State machine for server-to-client streaming calls with externally
/// supplied data and double-buffered exchange.
///
/// At most one message is in flight to the transport and at most one
/// replacement is queued; older un-sent messages are overwritten. A
/// teardown watchdog registered with each accepted stream turns client
/// cancellation into a `Cancelled` excursion that finishes the call and
/// re-arms listening, so the endpoint heals itself after a client
/// disconnects.
pub struct StreamEndpoint {
    reactor: Arc<Reactor>,
    transport: Arc<dyn Transport>,
    method: String,
    strand: Arc<Strand>,
    start_alarm: Alarm,
    stop_alarm: Alarm,
    check_alarm: Alarm,
    stopping: AtomicBool,
    inner: Mutex<StreamInner>,
}

impl StreamEndpoint {
    pub fn create(
        reactor: &Arc<Reactor>,
        transport: Arc<dyn Transport>,
        method: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            strand: reactor.create_strand(),
            start_alarm: Alarm::new(reactor.clone()),
            stop_alarm: Alarm::new(reactor.clone()),
            check_alarm: Alarm::new(reactor.clone()),
            reactor: reactor.clone(),
            transport,
            method: method.into(),
            stopping: AtomicBool::new(false),
            inner: Mutex::new(StreamInner {
                state: StreamState::Inactive,
                call: None,
                pending: None,
                inflight: None,
                written: None,
            }),
        })
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.inner.lock().unwrap().state
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Begins listening for a client stream. The transition happens
    /// asynchronously on the drain loop.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let armed = self.start_alarm.trigger(Some(&self.strand), move |_| {
            this.start_alarm.reset();
            let mut inner = this.inner.lock().unwrap();
            if inner.state == StreamState::Inactive && !this.stopping() {
                this.begin_accept(&mut inner);
            }
        });
        if !armed {
            tracing::warn!("stream {} start already pending", self.method);
        }
    }

    /// Swaps in the latest outbound message and nudges the drain.
    ///
    /// Returns the last message confirmed written by the transport, if any,
    /// so the caller can recycle that buffer. A returned payload was
    /// definitely handed to the transport write before being returned here;
    /// an overwritten pending message is never transmitted and never
    /// returned.
    pub fn exchange_data(self: &Arc<Self>, message: Payload) -> Option<Payload> {
        let previously_written = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending = Some(message);
            inner.written.take()
        };

        let this = self.clone();
        self.check_alarm.trigger(Some(&self.strand), move |_| {
            this.check_alarm.reset();
            let mut inner = this.inner.lock().unwrap();
            this.pump(&mut inner);
        });

        previously_written
    }

    /// Gracefully finishes the active stream, asynchronously. A no-op while
    /// only listening.
    pub fn stop(self: &Arc<Self>) {
        let this = self.clone();
        self.stop_alarm.trigger(Some(&self.strand), move |_| {
            this.stop_alarm.reset();
            let mut inner = this.inner.lock().unwrap();
            match inner.state {
                StreamState::WaitingForAvailableData | StreamState::WaitingForWriteDone => {
                    this.finish_call(&mut inner, FinishStatus::Ok, StreamState::Stopping);
                }
                _ => {}
            }
        });
    }

    /// Blocking shutdown: stops the endpoint and drives the reactor in
    /// bounded slices until the machine reaches `Inactive`, guaranteeing no
    /// dangling handler references survive destruction.
    ///
    /// The transport must already be refusing new accepts or a listening
    /// endpoint never observes a failure and this times out.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` when the polling bound is exceeded.
    pub fn shutdown(self: &Arc<Self>) -> Result<()> {
        self.stopping.store(true, Ordering::Release);
        self.stop();

        let config = self.reactor.config();
        let slice = Duration::from_millis(config.shutdown_poll_ms);
        for _ in 0..config.shutdown_max_polls {
            if self.state() == StreamState::Inactive {
                return Ok(());
            }
            self.reactor.run_for(slice);
        }
        if self.state() == StreamState::Inactive {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::ShutdownTimeout,
                format!("stream endpoint {} still {:?}", self.method, self.state()),
            ))
        }
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn begin_accept(self: &Arc<Self>, inner: &mut StreamInner) {
        let this = self.clone();
        let accept_tag = self
            .reactor
            .create_tag(Some(&self.strand), move |ok| this.on_accept(ok));
        let call = self.transport.accept_stream(&self.method, accept_tag);

        let this = self.clone();
        let teardown_tag = self
            .reactor
            .create_teardown_tag(Some(&self.strand), move |ok| this.on_teardown(ok));
        call.notify_on_teardown(teardown_tag);

        inner.call = Some(call);
        inner.inflight = None;
        inner.state = StreamState::Listening;
    }

    fn on_accept(self: &Arc<Self>, ok: bool) {
        let mut inner = self.inner.lock().unwrap();
        if !ok {
            self.fail(&mut inner);
            return;
        }
        if self.stopping() {
            self.finish_call(&mut inner, FinishStatus::Ok, StreamState::Stopping);
            return;
        }
        inner.state = StreamState::WaitingForAvailableData;
        self.pump(&mut inner);
    }

    /// Hands the pending message to the transport when the stream is ready
    /// for one.
    fn pump(self: &Arc<Self>, inner: &mut StreamInner) {
        if inner.state != StreamState::WaitingForAvailableData {
            return;
        }
        let Some(message) = inner.pending.take() else {
            return;
        };
        let Some(call) = inner.call.clone() else {
            tracing::error!("stream {}: pumping without a registered call", self.method);
            self.fail(inner);
            return;
        };
        inner.inflight = Some(message.clone());
        let this = self.clone();
        let tag = self
            .reactor
            .create_tag(Some(&self.strand), move |ok| this.on_write_done(ok));
        call.write(message, tag);
        inner.state = StreamState::WaitingForWriteDone;
    }

    fn on_write_done(self: &Arc<Self>, ok: bool) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            StreamState::WaitingForWriteDone => {
                if ok {
                    inner.written = inner.inflight.take();
                    inner.state = StreamState::WaitingForAvailableData;
                    self.pump(&mut inner);
                } else {
                    self.fail(&mut inner);
                }
            }
            // The write raced a cancellation or stop; the finish path owns
            // the state now.
            _ => {
                Self::reclaim_unsent(&mut inner, ok);
            }
        }
    }

    /// A failed write never reached the client. Unless a newer message has
    /// been exchanged since, it stays the latest value and goes back to
    /// pending.
    fn reclaim_unsent(inner: &mut StreamInner, ok: bool) {
        if !ok && inner.pending.is_none() {
            inner.pending = inner.inflight.take();
        } else {
            inner.inflight = None;
        }
    }

    fn on_teardown(self: &Arc<Self>, ok: bool) {
        if !ok {
            // Dropped during transport teardown; the pool diagnostics would
            // have reported the leak had the tag never been delivered.
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            StreamState::WaitingForAvailableData | StreamState::WaitingForWriteDone => {
                tracing::info!("stream {}: client cancelled active stream", self.method);
                self.finish_call(&mut inner, FinishStatus::Cancelled, StreamState::Cancelled);
            }
            _ => {}
        }
    }

    fn on_finish_done(self: &Arc<Self>, _ok: bool) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            StreamState::Stopping => {
                inner.call = None;
                inner.inflight = None;
                inner.state = StreamState::Inactive;
            }
            StreamState::Cancelled => {
                inner.call = None;
                inner.inflight = None;
                if self.stopping() || self.reactor.is_shutting_down() {
                    inner.state = StreamState::Inactive;
                } else {
                    // Self-heal: the pending message, if any, survives for
                    // the next subscriber.
                    self.begin_accept(&mut inner);
                }
            }
            _ => {}
        }
    }

    fn finish_call(self: &Arc<Self>, inner: &mut StreamInner, status: FinishStatus, next: StreamState) {
        let Some(call) = inner.call.clone() else {
            self.fail(inner);
            return;
        };
        let this = self.clone();
        let tag = self
            .reactor
            .create_tag(Some(&self.strand), move |ok| this.on_finish_done(ok));
        call.finish(status, tag);
        inner.state = next;
    }

    fn fail(&self, inner: &mut StreamInner) {
        inner.state = StreamState::Inactive;
        inner.call = None;
        Self::reclaim_unsent(inner, false);
    }
}

impl std::fmt::Debug for StreamEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEndpoint")
            .field("method", &self.method)
            .field("state", &self.state())
            .finish()
    }
}
