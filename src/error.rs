use thiserror::Error;

/// The error type for pupstream operations.
///
/// Peer protocol violations never surface here; they are logged and the
/// offending packet is dropped. Errors are returned for local misuse
/// (configuration, writing to a closed channel), for refusals that the caller
/// should know about (pool full, malformed rendezvous), and as the
/// end-of-stream signal seen by handlers blocked in a read.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Handler Errors
    // ============================================================================

    /// Low-level I/O error, typically raised by an application handler.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An application handler failed with its own error.
    #[error("Handler error: {0}")]
    Handler(String),

    // ============================================================================
    // Packet Errors
    // ============================================================================

    /// A raw type code that is not part of the BSP packet set.
    #[error("Unknown PUP type {0}")]
    UnknownPupType(u8),

    /// An acknowledgment payload shorter than the 6-byte record.
    #[error("Malformed acknowledgment payload ({len} bytes)")]
    MalformedAck { len: usize },

    // ============================================================================
    // Rendezvous Errors
    // ============================================================================

    /// `establish` was handed a packet that is not a rendezvous request.
    #[error("Expected RFC pup, got {0}")]
    NotRendezvous(String),

    /// The rendezvous payload does not carry a connection port.
    #[error("Malformed rendezvous request: {0}")]
    MalformedRendezvous(String),

    /// The peer's connection port is already bound to an active channel.
    #[error("Rendezvous for {client} duplicates channel on socket {socket:#x}")]
    DuplicateRendezvous { client: String, socket: u32 },

    // ============================================================================
    // Channel Errors
    // ============================================================================

    /// The channel is shutting down; no further data may be written.
    #[error("Channel is closing")]
    ChannelClosing,

    /// The channel completed its teardown handshake (end of stream).
    #[error("Channel closed")]
    ChannelClosed,

    /// The channel was aborted by either side.
    #[error("Channel aborted: {message}")]
    ChannelAborted { message: String },

    /// The worker bound to the channel was asked to terminate.
    #[error("Operation cancelled")]
    Cancelled,

    /// The peer stopped acknowledging data.
    #[error("Timed out waiting for acknowledgment")]
    AckTimeout,

    /// A single data byte was expected but a mark came next in the stream.
    #[error("Expected a data byte, found mark {0}")]
    UnexpectedMark(u8),

    // ============================================================================
    // Worker Pool Errors
    // ============================================================================

    /// The worker pool is at capacity; the channel was aborted.
    #[error("Worker pool full ({max_workers} workers)")]
    ServerFull { max_workers: usize },

    /// The channel already has a handler running on it.
    #[error("Socket {socket:#x} already has a worker")]
    AlreadyBound { socket: u32 },

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A configuration value is outside its permitted range.
    #[error("Invalid value for '{key}': {reason}")]
    InvalidConfig { key: &'static str, reason: String },
}

impl Error {
    /// Returns true for the errors a handler sees when its stream ends
    /// normally, including a write refused because the peer started closing.
    ///
    /// The worker treats these as a clean exit rather than a handler fault.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            Error::ChannelClosing
                | Error::ChannelClosed
                | Error::ChannelAborted { .. }
                | Error::Cancelled
        )
    }
}
