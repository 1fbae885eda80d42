use super::{HostAddress, Pup};
use std::sync::atomic::{AtomicU32, Ordering};

/// Outbound side of the packet transport.
///
/// Implementations must not call back into the dispatcher from `send_pup`;
/// packets are handed over after channel locks have been released, but a
/// synchronous loop back would still re-enter the protocol path.
pub trait PupRouter: Send + Sync {
    /// Queues a packet for delivery. Delivery is unreliable.
    fn send_pup(&self, pup: Pup);

    /// Network and host of this server, used for server ports and to fill in
    /// the network of rendezvous replies.
    fn local_address(&self) -> HostAddress;
}

/// Source of socket ids for new channels.
pub trait SocketAllocator: Send + Sync {
    /// Returns an id not returned before during this process lifetime.
    fn next_socket_id(&self) -> u32;
}

/// Hands out consecutive socket ids from a base, skipping zero on wrap.
#[derive(Debug)]
pub struct SequentialSocketAllocator {
    next: AtomicU32,
}

impl SequentialSocketAllocator {
    pub fn new(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first.max(1)),
        }
    }
}

impl SocketAllocator for SequentialSocketAllocator {
    fn next_socket_id(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}
