//! Service-level entry point: well-known sockets plus the dispatcher.

use crate::bsp::{Dispatcher, HandlerKind};
use crate::config::BspConfig;
use crate::error::Error;
use crate::pup::{Pup, PupRouter, PupType};

use ::config::Config;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A BSP server: a [`Dispatcher`] plus the table of well-known sockets
/// that accept rendezvous requests.
///
/// The embedding application feeds every inbound BSP packet to
/// [`deliver`](Self::deliver). Register services before delivering.
pub struct BspServer {
    dispatcher: Dispatcher,
    services: HashMap<u32, HandlerKind>,
}

impl BspServer {
    /// Creates a server configured from `config` (see [`BspConfig`]).
    pub fn new(config: &Config, router: Arc<dyn PupRouter>) -> Result<Self, Error> {
        Self::new_named(config, "", router)
    }

    /// Creates a server whose keys are looked up under `name` first.
    pub fn new_named(config: &Config, name: &str, router: Arc<dyn PupRouter>) -> Result<Self, Error> {
        let config = BspConfig::new_named(config, name)?;
        Ok(Self::with_config(config, router))
    }

    pub fn with_config(config: BspConfig, router: Arc<dyn PupRouter>) -> Self {
        Self {
            dispatcher: Dispatcher::new(config, router),
            services: HashMap::new(),
        }
    }

    /// Wraps an existing dispatcher.
    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            services: HashMap::new(),
        }
    }

    /// Accepts rendezvous requests on `socket`, serving them with `kind`.
    pub fn register_service(&mut self, socket: u32, kind: HandlerKind) -> &mut Self {
        info!(socket, kind = kind.name, "Registering BSP service");
        if let Some(previous) = self.services.insert(socket, kind) {
            warn!(socket, previous = previous.name, "Replaced BSP service");
        }
        self
    }

    /// Routes one inbound packet: to its channel if one exists, otherwise to
    /// rendezvous if it is an RFC for a registered service. Everything else
    /// is dropped.
    pub fn deliver(&self, pup: &Pup) {
        if self.dispatcher.channel_exists(pup) {
            self.dispatcher.dispatch(pup);
            return;
        }

        match (pup.pup_type, self.services.get(&pup.destination.socket)) {
            (PupType::Rfc, Some(kind)) => {
                if let Err(err) = self.dispatcher.establish(pup, *kind) {
                    debug!(%err, "Rendezvous not established");
                }
            }
            (pup_type, _) => {
                warn!(
                    socket = pup.destination.socket,
                    %pup_type,
                    source = %pup.source,
                    "No channel or service for PUP, dropping"
                );
            }
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Terminates every active worker.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}
