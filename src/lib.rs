//! pupstream - server-side BSP byte streams over PUP datagrams
//!
//! pupstream multiplexes reliable, ordered, flow-controlled byte streams over
//! an unreliable packet transport. Incoming rendezvous requests create
//! channels; each channel is served by an application handler on its own
//! thread, bounded by a worker pool. The transport itself, socket allocation
//! and name resolution are supplied by the embedding application through
//! [`PupRouter`] and [`SocketAllocator`].

// Internal-only modules
pub(crate) mod bsp;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod server;

pub mod pup;

// Reference handlers (optional feature, enabled by default)
#[cfg(feature = "handlers")]
pub mod handlers;

// These are the intended public API
pub use bsp::{
    BspAck, CancellationToken, Channel, ChannelState, Dispatcher, Handler, HandlerConstructor,
    HandlerKind, Mark, ReadOutcome, WorkerContext, WorkerId, WorkerInfo, WorkerPool, ACK_SIZE,
    SERVER_ERROR_MESSAGE, SERVER_FULL_MESSAGE,
};
pub use crate::config::BspConfig;
pub use error::Error;
pub use pup::{
    HostAddress, Pup, PupPort, PupRouter, PupType, SequentialSocketAllocator, SocketAllocator,
    MAX_PUP_DATA,
};
pub use server::BspServer;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::bsp::{
        Channel, ChannelState, Dispatcher, Handler, HandlerKind, Mark, ReadOutcome,
        WorkerContext, WorkerPool,
    };
    pub use crate::config::BspConfig;
    pub use crate::error::Error;
    pub use crate::pup::{HostAddress, Pup, PupPort, PupRouter, PupType, SocketAllocator};
    pub use crate::server::BspServer;
}
