pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod transport;

pub use bus::{EventBus, EventHandler};
pub use common::CorrelationId;
pub use config::BusConfig;
pub use envelope::{EventEnvelope, EventEnvelopeBuilder};
pub use error::{EventBusError, Result};
pub use transport::{ChannelTransport, InMemoryBroker, InMemoryTransport};
