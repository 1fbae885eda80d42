//! The BSP stream layer.
//!
//! [`Dispatcher`] owns the socket → [`Channel`] registry and a
//! [`WorkerPool`]. Each accepted channel gets one [`Handler`] running on its
//! own thread; inbound packets update channel state and wake the handler.

mod ack;
mod channel;
mod dispatcher;
mod handler;
mod mark;
mod pool;

pub use ack::{BspAck, ACK_SIZE};
pub use channel::{Channel, ChannelState, ReadOutcome};
pub use dispatcher::Dispatcher;
pub use handler::{CancellationToken, Handler, HandlerConstructor, HandlerKind, WorkerContext};
pub use mark::Mark;
pub use pool::{WorkerId, WorkerInfo, WorkerPool, SERVER_ERROR_MESSAGE, SERVER_FULL_MESSAGE};
