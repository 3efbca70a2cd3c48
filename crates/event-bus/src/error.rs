use thiserror::Error;

/// Errors that can occur when interacting with the broker transport
/// or the event bus built on top of it.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The transport was used before `connect` or after `disconnect`.
    #[error("Transport is not connected")]
    NotConnected,

    /// The broker rejected or dropped the underlying channel for a topic.
    #[error("Broker channel closed for topic '{0}'")]
    ChannelClosed(String),

    /// No subscription exists for the given topic.
    #[error("No subscription for topic '{0}'")]
    NotSubscribed(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An event handler reported a failure during dispatch.
    #[error("Handler '{handler}' failed: {reason}")]
    Handler { handler: String, reason: String },
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;
