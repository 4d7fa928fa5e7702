//! The relay facade.
//!
//! [`Relay`] ties the registry, router and broadcaster together behind the
//! plain function-call API that transports drive: connect a client, submit
//! its commands, disconnect it.

use crate::broadcaster::{Broadcaster, BroadcasterConfig, DeliveryReport};
use crate::handle::SendHandle;
use crate::registry::{validate_display_name, ClientId, ClientRegistry};
use crate::router::{Router, RouterConfig};
use murmur_protocol::{Command, ProtocolError};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid display name.
    #[error("Invalid display name: {0}")]
    InvalidName(&'static str),
}

/// Relay configuration.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Routing behaviour.
    pub router: RouterConfig,
    /// Fan-out failure policy.
    pub broadcaster: BroadcasterConfig,
}

/// Registry, router and broadcaster sharing one client map.
pub struct Relay {
    registry: Arc<ClientRegistry>,
    router: Router,
    broadcaster: Broadcaster,
}

impl Relay {
    /// Create a relay with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    /// Create a relay with custom configuration.
    #[must_use]
    pub fn with_config(config: RelayConfig) -> Self {
        info!("Creating relay with config: {:?}", config);
        let registry = Arc::new(ClientRegistry::new());
        Self {
            router: Router::new(registry.clone(), config.router),
            broadcaster: Broadcaster::new(registry.clone(), config.broadcaster),
            registry,
        }
    }

    /// The shared client registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// The router.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Register a client, optionally with a display name, then send its
    /// welcome and announce it to everyone else.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested name is invalid; nothing is
    /// registered in that case.
    pub fn connect(&self, handle: SendHandle, name: Option<&str>) -> Result<ClientId, RelayError> {
        let name = name
            .map(validate_display_name)
            .transpose()
            .map_err(RelayError::InvalidName)?;

        // The welcome goes on the queue before the client is visible to any
        // fan-out, so it is always the first event the client sees.
        let id = self.registry.register_with(handle, name, |record| {
            let welcome = Arc::new(self.router.welcome(record));
            if let Err(failure) = record.handle.try_deliver(welcome) {
                debug!(client = %record.id, ?failure, "Welcome not enqueued");
            }
        });

        let report = self.broadcaster.deliver(self.router.arrival(id));
        self.settle(report);

        info!(client = %id, clients = self.registry.len(), "Client connected");
        Ok(id)
    }

    /// Route a command from a client and deliver the result.
    pub fn submit(&self, sender: ClientId, command: Command) -> DeliveryReport {
        let deliveries = self.router.dispatch(sender, command);
        let report = self.broadcaster.deliver(deliveries);
        self.settle(report)
    }

    /// Report a bad frame back to the client that sent it.
    pub fn reject(&self, sender: ClientId, error: &ProtocolError) -> DeliveryReport {
        debug!(client = %sender, error = %error, "Rejecting frame");
        let report = self.broadcaster.deliver(self.router.reject(sender, error));
        self.settle(report)
    }

    /// Unregister a client and tell everyone else it left.
    ///
    /// Returns `false` if the client was already gone (for example, evicted
    /// during a broadcast); no second notice is sent in that case.
    pub fn disconnect(&self, id: ClientId) -> bool {
        let removed = self.registry.unregister(id);
        // Must follow unregister: strikes recorded later are dropped by the
        // broadcaster, earlier ones here.
        self.broadcaster.forget(id);
        let Some(record) = removed else {
            return false;
        };

        info!(client = %id, name = %record.name, clients = self.registry.len(), "Client disconnected");
        let report = self.broadcaster.deliver(self.router.departure(&record));
        self.settle(report);
        true
    }

    /// Announce every client evicted while delivering, including clients
    /// evicted while delivering those announcements.
    fn settle(&self, mut report: DeliveryReport) -> DeliveryReport {
        let mut pending: VecDeque<_> = report.evicted.iter().cloned().collect();

        while let Some(record) = pending.pop_front() {
            self.broadcaster.forget(record.id);
            let follow_up = self.broadcaster.deliver(self.router.departure(&record));
            pending.extend(follow_up.evicted.iter().cloned());
            report.merge(follow_up);
        }

        report
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}
