#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result};

mod payload;
pub use payload::Payload;

mod tag;
pub use tag::{TagId, TagPool};

mod strand;
pub use strand::{Strand, StrandId};

mod transport;
pub use transport::{
    CompletionSource, FinishStatus, Polled, StreamCall, Transport, UnaryCall,
};

mod alarm;
pub use alarm::Alarm;

mod reactor;
pub use reactor::{Reactor, ReactorConfig};

mod unary;
pub use unary::{ResponseWriter, UnaryEndpoint, UnaryState};

mod stream;
pub use stream::{StreamEndpoint, StreamState};

mod server;
pub use server::Server;

pub mod mem;
