use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{
    Alarm, Error, ErrorKind, Payload, Reactor, Result, Strand, Transport, UnaryCall,
};

/// Callback producing the response for one incoming request. Invoked
/// synchronously on the drain loop.
pub type ResponseWriter = Box<dyn Fn(&Payload) -> Payload + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryState {
    Inactive,
    Listening,
    RequestFulfilled,
}

struct UnaryInner {
    state: UnaryState,
    writer: Option<ResponseWriter>,
    call: Option<Arc<dyn UnaryCall>>,
}

/// State machine for single-request/single-response calls.
///
/// `start` and `stop` only arm alarms and are safe from any thread; every
/// state transition happens on the reactor's drain loop, serialized by the
/// endpoint's own strand. A successful finish re-arms listening, so one
/// endpoint serves its method for as long as the transport keeps accepting.
/// Any failure notification drives the machine to `Inactive`, which is
/// final unless `start` is called again.
pub struct UnaryEndpoint {
    reactor: Arc<Reactor>,
    transport: Arc<dyn Transport>,
    method: String,
    strand: Arc<Strand>,
    start_alarm: Alarm,
    stop_alarm: Alarm,
    stopping: AtomicBool,
    inner: Mutex<UnaryInner>,
}

impl UnaryEndpoint {
    pub fn create(
        reactor: &Arc<Reactor>,
        transport: Arc<dyn Transport>,
        method: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            strand: reactor.create_strand(),
            start_alarm: Alarm::new(reactor.clone()),
            stop_alarm: Alarm::new(reactor.clone()),
            reactor: reactor.clone(),
            transport,
            method: method.into(),
            stopping: AtomicBool::new(false),
            inner: Mutex::new(UnaryInner {
                state: UnaryState::Inactive,
                writer: None,
                call: None,
            }),
        })
    }

    #[must_use]
    pub fn state(&self) -> UnaryState {
        self.inner.lock().unwrap().state
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Installs `writer` and begins listening for requests. The transition
    /// happens asynchronously on the drain loop.
    pub fn start(self: &Arc<Self>, writer: ResponseWriter) {
        let this = self.clone();
        let armed = self.start_alarm.trigger(Some(&self.strand), move |_| {
            this.start_alarm.reset();
            this.on_start(writer);
        });
        if !armed {
            tracing::warn!("unary {} start already pending", self.method);
        }
    }

    /// Clears the response writer, asynchronously. Requests that arrive
    /// afterwards are finished with an empty payload.
    pub fn stop(self: &Arc<Self>) {
        let this = self.clone();
        self.stop_alarm.trigger(Some(&self.strand), move |_| {
            this.stop_alarm.reset();
            this.inner.lock().unwrap().writer = None;
        });
    }

    /// Blocking shutdown: stops the endpoint and drives the reactor in
    /// bounded slices until the machine reaches `Inactive`.
    ///
    /// The transport must already be refusing new accepts (see
    /// [`Transport::shutdown`]) or the outstanding accept never fails and
    /// this times out.
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
            if self.state() == UnaryState::Inactive {
                return Ok(());
            }
            self.reactor.run_for(slice);
        }
        if self.state() == UnaryState::Inactive {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::ShutdownTimeout,
                format!("unary endpoint {} still {:?}", self.method, self.state()),
            ))
        }
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn on_start(self: &Arc<Self>, writer: ResponseWriter) {
        let mut inner = self.inner.lock().unwrap();
        inner.writer = Some(writer);
        if inner.state == UnaryState::Inactive && !self.stopping() {
            self.begin_accept(&mut inner);
        }
    }

    fn begin_accept(self: &Arc<Self>, inner: &mut UnaryInner) {
        let this = self.clone();
        let tag = self
            .reactor
            .create_tag(Some(&self.strand), move |ok| this.on_request(ok));
        inner.call = Some(self.transport.accept_unary(&self.method, tag));
        inner.state = UnaryState::Listening;
    }

    fn on_request(self: &Arc<Self>, ok: bool) {
        let (call, writer) = {
            let mut inner = self.inner.lock().unwrap();
            if !ok || self.stopping() {
                inner.state = UnaryState::Inactive;
                inner.call = None;
                return;
            }
            let Some(call) = inner.call.clone() else {
                tracing::error!(
                    "unary {}: request completion without a registered call",
                    self.method
                );
                inner.state = UnaryState::Inactive;
                return;
            };
            (call, inner.writer.take())
        };

        // The writer runs outside the lock so it may observe the endpoint.
        // The strand keeps any other handler of this machine from
        // interleaving while the lock is released.
        let request = call.request();
        let response = match &writer {
            Some(writer) => writer(&request),
            None => Payload::default(),
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.writer = writer;
            inner.state = UnaryState::RequestFulfilled;
        }

        let this = self.clone();
        let tag = self
            .reactor
            .create_tag(Some(&self.strand), move |ok| this.on_finished(ok));
        call.finish(response, tag);
    }

    fn on_finished(self: &Arc<Self>, ok: bool) {
        let mut inner = self.inner.lock().unwrap();
        if ok && !self.stopping() {
            self.begin_accept(&mut inner);
        } else {
            inner.state = UnaryState::Inactive;
            inner.call = None;
        }
    }
}

impl std::fmt::Debug for UnaryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnaryEndpoint")
            .field("method", &self.method)
            .field("state", &self.state())
            .finish()
    }
}
