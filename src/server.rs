use std::sync::Arc;

use crate::{
    CompletionSource, Reactor, ReactorConfig, Result, StreamEndpoint, Transport, UnaryEndpoint,
    unary::ResponseWriter,
};

/// Binds registered call handlers to a transport endpoint and owns the
/// reactor's lifetime relative to the transport's shutdown sequence.
///
/// A hosting process typically drives [`Reactor::run_for`] in a loop from
/// one or more dedicated threads (via [`reactor`](Self::reactor)) and calls
/// endpoint `start`/`stop` from control threads.
///
/// # Examples
///
/// ```rust
/// use cqrpc::{Payload, ReactorConfig, Server, mem::{MemCompletionQueue, MemTransport}};
///
/// let queue = MemCompletionQueue::create();
/// let transport = MemTransport::create(queue.clone());
/// let mut server = Server::create(queue, transport, &ReactorConfig::default());
/// server.register_unary("Echo/echo", Box::new(|req: &Payload| req.clone()));
/// server.start();
/// server.stop().unwrap();
/// ```
pub struct Server {
    reactor: Arc<Reactor>,
    transport: Arc<dyn Transport>,
    unary: Vec<Arc<UnaryEndpoint>>,
    streams: Vec<Arc<StreamEndpoint>>,
    pending_writers: Vec<(Arc<UnaryEndpoint>, ResponseWriter)>,
}

impl Server {
    pub fn create(
        source: Arc<dyn CompletionSource>,
        transport: Arc<dyn Transport>,
        config: &ReactorConfig,
    ) -> Self {
        Self {
            reactor: Reactor::create(source, config),
            transport,
            unary: Vec::new(),
            streams: Vec::new(),
            pending_writers: Vec::new(),
        }
    }

    /// Registers a unary method; `writer` runs on the drain loop for each
    /// incoming request once the server is started.
    pub fn register_unary(&mut self, method: &str, writer: ResponseWriter) -> Arc<UnaryEndpoint> {
        let endpoint = UnaryEndpoint::create(&self.reactor, self.transport.clone(), method);
        self.unary.push(endpoint.clone());
        self.pending_writers.push((endpoint.clone(), writer));
        endpoint
    }

    /// Registers a streaming method. The caller feeds outbound data through
    /// the returned endpoint's `exchange_data`.
    pub fn register_stream(&mut self, method: &str) -> Arc<StreamEndpoint> {
        let endpoint = StreamEndpoint::create(&self.reactor, self.transport.clone(), method);
        self.streams.push(endpoint.clone());
        endpoint
    }

    /// Starts every registered endpoint. The transitions happen on the
    /// drain loop, so drive the reactor afterwards.
    pub fn start(&mut self) {
        tracing::info!(
            "starting rpc server with {} unary and {} streaming endpoints",
            self.unary.len(),
            self.streams.len()
        );
        for (endpoint, writer) in self.pending_writers.drain(..) {
            endpoint.start(writer);
        }
        for endpoint in &self.streams {
            endpoint.start();
        }
    }

    #[must_use]
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Stops the server: fails outstanding accepts at the transport, drives
    /// every endpoint back to `Inactive` with blocking shutdowns, then
    /// shuts down and drains the reactor.
    ///
    /// # Errors
    ///
    /// Returns the first endpoint shutdown timeout encountered. The reactor
    /// is shut down regardless.
    pub fn stop(&self) -> Result<()> {
        tracing::info!("stopping rpc server");
        self.transport.shutdown();

        let mut result = Ok(());
        for endpoint in &self.unary {
            if let Err(e) = endpoint.shutdown()
                && result.is_ok()
            {
                result = Err(e);
            }
        }
        for endpoint in &self.streams {
            if let Err(e) = endpoint.shutdown()
                && result.is_ok()
            {
                result = Err(e);
            }
        }

        self.reactor.shutdown();
        result
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("unary", &self.unary.len())
            .field("streams", &self.streams.len())
            .finish()
    }
}
