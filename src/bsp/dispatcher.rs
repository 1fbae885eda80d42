//! Socket → channel registry and inbound packet routing.

use super::channel::Channel;
use super::handler::HandlerKind;
use super::pool::WorkerPool;
use crate::config::BspConfig;
use crate::error::Error;
use crate::pup::{Pup, PupPort, PupRouter, PupType, SequentialSocketAllocator, SocketAllocator};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, instrument, warn};

struct DispatcherInner {
    channels: Mutex<HashMap<u32, Arc<Channel>>>,
    pool: WorkerPool,
    router: Arc<dyn PupRouter>,
    allocator: Arc<dyn SocketAllocator>,
    config: BspConfig,
    destroyed: AtomicU64,
}

impl DispatcherInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Arc<Channel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Removes the entry only if it still refers to this very channel, so a
    // reused socket id is never dropped by a stale notification.
    fn remove(&self, channel: &Channel) {
        let mut channels = self.lock();
        let registered = channels
            .get(&channel.socket_id())
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), channel));
        if registered {
            channels.remove(&channel.socket_id());
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            info!(
                socket = channel.socket_id(),
                remaining = channels.len(),
                "Channel unregistered"
            );
        } else {
            debug!(socket = channel.socket_id(), "Destroyed channel already unregistered");
        }
    }
}

/// Owns the active channels and the worker pool, and routes every inbound
/// BSP packet to its channel.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Dispatcher {
    /// Creates a dispatcher with a sequential socket allocator starting at
    /// `config.first_socket_id`.
    pub fn new(config: BspConfig, router: Arc<dyn PupRouter>) -> Self {
        let allocator = Arc::new(SequentialSocketAllocator::new(config.first_socket_id));
        Self::with_allocator(config, router, allocator)
    }

    pub fn with_allocator(
        config: BspConfig,
        router: Arc<dyn PupRouter>,
        allocator: Arc<dyn SocketAllocator>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                channels: Mutex::new(HashMap::new()),
                pool: WorkerPool::new(&config),
                router,
                allocator,
                config,
                destroyed: AtomicU64::new(0),
            }),
        }
    }
}

// ============================================================================
// Rendezvous
// ============================================================================

impl Dispatcher {
    /// Sets up a channel for a rendezvous request and starts a handler on it.
    ///
    /// On success the rendezvous reply (carrying the new server port) has
    /// been sent and the new socket id is returned. If the pool is full the
    /// channel is aborted instead and [`Error::ServerFull`] is returned. A
    /// request from a connection port that already has a channel is ignored.
    #[instrument(skip(self, request, kind), fields(id = request.id, kind = kind.name))]
    pub fn establish(&self, request: &Pup, kind: HandlerKind) -> Result<u32, Error> {
        if request.pup_type != PupType::Rfc {
            error!(pup_type = %request.pup_type, "Expected RFC pup");
            return Err(Error::NotRendezvous(request.pup_type.to_string()));
        }

        let local = self.inner.router.local_address();
        let channel = loop {
            let socket_id = self.inner.allocator.next_socket_id();
            let channel = match Channel::from_rendezvous(
                request,
                socket_id,
                local,
                &self.inner.config,
                Arc::clone(&self.inner.router),
            ) {
                Ok(channel) => Arc::new(channel),
                Err(err) => {
                    warn!(%err, "Dropping rendezvous request");
                    return Err(err);
                }
            };

            let mut channels = self.inner.lock();
            if let Some(existing) = channels
                .values()
                .find(|existing| existing.client_port() == channel.client_port())
            {
                warn!(
                    client = %channel.client_port(),
                    socket = existing.socket_id(),
                    "Rendezvous from a port that already has a channel, ignoring"
                );
                return Err(Error::DuplicateRendezvous {
                    client: channel.client_port().to_string(),
                    socket: existing.socket_id(),
                });
            }
            if channels.contains_key(&socket_id) {
                warn!(socket = socket_id, "Allocator returned a socket in use, retrying");
                continue;
            }

            let registry = Arc::downgrade(&self.inner);
            channel.set_destroy_hook(Box::new(move |destroyed: &Channel| {
                notify_destroyed(&registry, destroyed);
            }));
            channels.insert(socket_id, Arc::clone(&channel));
            break channel;
        };

        info!(
            socket = channel.socket_id(),
            server = %channel.server_port(),
            client = %channel.client_port(),
            destination = %request.destination,
            "Setting up rendezvous"
        );

        self.inner.pool.bind(&channel, kind)?;

        // Reply from the port the client addressed, on our network.
        let source = PupPort {
            network: local.network,
            ..request.destination
        };
        let reply = Pup::new(
            PupType::Rfc,
            request.id,
            channel.client_port(),
            source,
            channel.server_port().to_bytes().to_vec(),
        );
        self.inner.router.send_pup(reply);
        channel.activate();

        info!(socket = channel.socket_id(), "Rendezvous established");
        Ok(channel.socket_id())
    }
}

// ============================================================================
// Dispatch
// ============================================================================

impl Dispatcher {
    /// Routes one inbound packet to the channel registered for its
    /// destination socket. Packets for unknown sockets are logged and
    /// dropped.
    pub fn dispatch(&self, pup: &Pup) {
        let Some(channel) = self.find_channel(pup) else {
            warn!(
                socket = pup.destination.socket,
                pup_type = %pup.pup_type,
                "Received BSP PUP on an unconnected socket, ignoring"
            );
            return;
        };

        debug!(socket = channel.socket_id(), pup_type = %pup.pup_type, id = pup.id, "Dispatching");

        match pup.pup_type {
            PupType::Rfc => {
                warn!(socket = channel.socket_id(), "Received RFC on established channel, ignoring");
            }
            PupType::Data | PupType::AData | PupType::Mark | PupType::AMark => {
                channel.recv_sequenced(pup);
            }
            PupType::Ack => channel.recv_ack(pup),
            PupType::End => channel.recv_end(pup),
            PupType::EndReply => channel.recv_end_reply(pup),
            PupType::Abort => {
                warn!(
                    socket = channel.socket_id(),
                    reason = %pup.contents_lossy(),
                    "BSP aborted by peer"
                );
                channel.recv_abort(pup);
            }
            PupType::Error => channel.recv_error(pup),
            PupType::Interrupt => channel.recv_interrupt(pup),
            PupType::InterruptReply => {
                debug!(socket = channel.socket_id(), "Unsolicited InterruptReply, ignoring");
            }
        }
    }

    /// True iff a channel is registered for the packet's destination socket.
    pub fn channel_exists(&self, pup: &Pup) -> bool {
        self.find_channel(pup).is_some()
    }

    /// Removes a destroyed channel from the registry.
    ///
    /// Channels call this through their destroy hook; calling it again, or
    /// for a channel that is no longer registered, does nothing.
    pub fn on_channel_destroyed(&self, channel: &Channel) {
        self.inner.remove(channel);
    }

    /// Tears a channel down without a handshake. The registry entry goes
    /// away through the destroy notification.
    pub fn destroy_channel(&self, channel: &Channel) {
        channel.destroy();
    }

    /// Terminates every active worker. Channels leave the registry through
    /// their own teardown.
    pub fn shutdown(&self) {
        info!(channels = self.channel_count(), "Shutting down dispatcher");
        self.inner.pool.shutdown();
    }

    fn find_channel(&self, pup: &Pup) -> Option<Arc<Channel>> {
        self.inner.lock().get(&pup.destination.socket).cloned()
    }
}

// ============================================================================
// Introspection
// ============================================================================

impl Dispatcher {
    pub fn channel(&self, socket_id: u32) -> Option<Arc<Channel>> {
        self.inner.lock().get(&socket_id).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Socket ids of all registered channels, ascending.
    pub fn socket_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inner.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of channels removed from the registry so far.
    pub fn destroyed_count(&self) -> u64 {
        self.inner.destroyed.load(Ordering::Relaxed)
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn config(&self) -> &BspConfig {
        &self.inner.config
    }
}

fn notify_destroyed(registry: &Weak<DispatcherInner>, channel: &Channel) {
    if let Some(inner) = registry.upgrade() {
        inner.remove(channel);
    }
}
