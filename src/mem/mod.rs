//! In-memory transport backend.
//!
//! Implements the narrow transport interfaces against process-local queues,
//! with the same shutdown semantics a real call pipeline exhibits: pending
//! completions drain before the source reports shutdown, and outstanding
//! accepts fail with `ok = false` once the transport stops. No wire format,
//! no connection establishment.

mod queue;
pub use queue::MemCompletionQueue;

mod calls;
pub(crate) use calls::{MemStreamCall, MemUnaryCall, StreamTicketInner, UnaryTicketInner};
pub use calls::{StreamTicket, UnaryTicket};

mod transport;
pub use transport::MemTransport;
