use super::channel::Channel;
use crate::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative stop flag shared between a worker and its pool.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// What a running handler gets to work with.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    channel: Arc<Channel>,
    token: CancellationToken,
}

impl WorkerContext {
    pub(crate) fn new(channel: Arc<Channel>, token: CancellationToken) -> Self {
        Self { channel, token }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// True once the pool asked this worker to stop. Blocking channel reads
    /// also return [`Error::Cancelled`] at that point.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// An application protocol served over one BSP channel.
///
/// `run` executes on the worker's own thread and usually loops on
/// [`Channel::read`] until the stream ends. Returning an end-of-stream error
/// (see [`Error::is_end_of_stream`]) counts as a clean exit; any other error,
/// or a panic, aborts the channel.
pub trait Handler: Send {
    fn run(&mut self, ctx: &WorkerContext) -> Result<(), Error>;
}

/// Constructor for handlers bound to a fresh channel.
pub type HandlerConstructor = fn(Arc<Channel>) -> Box<dyn Handler>;

/// A named handler constructor.
///
/// Services register a `HandlerKind` per well-known socket; the pool calls
/// `construct` for each channel it accepts.
#[derive(Clone, Copy)]
pub struct HandlerKind {
    pub name: &'static str,
    pub construct: HandlerConstructor,
}

impl HandlerKind {
    pub const fn new(name: &'static str, construct: HandlerConstructor) -> Self {
        Self { name, construct }
    }
}

impl fmt::Debug for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerKind").field("name", &self.name).finish()
    }
}
