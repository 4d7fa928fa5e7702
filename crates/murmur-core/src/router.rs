//! Command routing for Murmur.
//!
//! The router decides *what* to send and *to whom*. It reads and updates the
//! registry but never touches a connection: every operation returns a list
//! of [`Delivery`] values for the [`Broadcaster`](crate::Broadcaster).

use crate::registry::{validate_display_name, ClientId, ClientRecord, ClientRegistry};
use murmur_protocol::{
    Command, ErrorCode, Event, ProtocolError, StateFields, UserState, PROTOCOL_VERSION,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Whether chat senders receive their own message.
    pub echo_to_sender: bool,
    /// Whether whisper senders receive a `whisper_sent` confirmation.
    pub confirm_whispers: bool,
    /// Whether peers are told about arrivals, departures and renames.
    pub announce_presence: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            echo_to_sender: false,
            confirm_whispers: true,
            announce_presence: true,
        }
    }
}

/// One event addressed to one client.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Recipient.
    pub target: ClientId,
    /// Event to deliver; shared between recipients of the same fan-out.
    pub event: Arc<Event>,
}

impl Delivery {
    /// Create a delivery.
    #[must_use]
    pub fn new(target: ClientId, event: Arc<Event>) -> Self {
        Self { target, event }
    }
}

/// Decides fan-out targets for inbound commands.
pub struct Router {
    registry: Arc<ClientRegistry>,
    config: RouterConfig,
}

impl Router {
    /// Create a router over the given registry.
    #[must_use]
    pub fn new(registry: Arc<ClientRegistry>, config: RouterConfig) -> Self {
        Self { registry, config }
    }

    /// The router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Route one command from a registered client.
    ///
    /// Commands from a client that is no longer registered are dropped.
    pub fn dispatch(&self, sender: ClientId, command: Command) -> Vec<Delivery> {
        let Some(sender_name) = self.registry.name_of(sender) else {
            debug!(client = %sender, command = command.kind(), "Dropping command from departed client");
            return Vec::new();
        };

        trace!(client = %sender, command = command.kind(), "Dispatching");

        match command {
            Command::Username { username } => self.rename(sender, &sender_name, &username),
            Command::Chat { text } => self.chat(sender, &sender_name, text),
            Command::Whisper { target, text } => self.whisper(sender, &sender_name, target, text),
            Command::StateUpdate { fields } => self.state_update(sender, &sender_name, fields),
            Command::UsersRequest {} => {
                let users = self.registry.names();
                reply(sender, Event::UserList { users })
            }
            Command::StateRequest { target } => self.state_request(sender, target),
            Command::Ping { timestamp } => reply(sender, Event::Pong { timestamp }),
            Command::Help {} => reply(sender, Event::help()),
        }
    }

    /// Tell a client that its frame could not be processed.
    #[must_use]
    pub fn reject(&self, sender: ClientId, error: &ProtocolError) -> Vec<Delivery> {
        reply(sender, Event::error(error.code(), error.to_string()))
    }

    /// The welcome for a client that is about to be registered.
    #[must_use]
    pub fn welcome(&self, record: &ClientRecord) -> Event {
        Event::Welcome {
            client_id: record.id.to_string(),
            username: record.name.clone(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Join notice for everyone but a freshly registered client.
    #[must_use]
    pub fn arrival(&self, id: ClientId) -> Vec<Delivery> {
        if !self.config.announce_presence {
            return Vec::new();
        }
        let Some(name) = self.registry.name_of(id) else {
            return Vec::new();
        };
        self.to_others(id, Event::UserJoined { username: name })
    }

    /// Departure notice for a client that has already been unregistered.
    #[must_use]
    pub fn departure(&self, record: &ClientRecord) -> Vec<Delivery> {
        if !self.config.announce_presence {
            return Vec::new();
        }
        self.to_others(
            record.id,
            Event::UserLeft {
                username: record.name.clone(),
            },
        )
    }

    fn rename(&self, sender: ClientId, old_name: &str, requested: &str) -> Vec<Delivery> {
        let name = match validate_display_name(requested) {
            Ok(name) => name,
            Err(reason) => return reply(sender, Event::error(ErrorCode::InvalidName, reason)),
        };

        if self.registry.rename(sender, name.clone()).is_none() {
            return Vec::new();
        }
        debug!(client = %sender, from = %old_name, to = %name, "Client renamed");

        let mut deliveries = reply(
            sender,
            Event::system(format!("You are now known as {name}")),
        );
        if self.config.announce_presence && old_name != name {
            deliveries.extend(self.to_others(
                sender,
                Event::system(format!("{old_name} is now known as {name}")),
            ));
        }
        deliveries
    }

    fn chat(&self, sender: ClientId, sender_name: &str, text: String) -> Vec<Delivery> {
        let event = Arc::new(Event::chat(sender_name, text));
        self.registry
            .snapshot()
            .into_iter()
            .filter(|record| self.config.echo_to_sender || record.id != sender)
            .map(|record| Delivery::new(record.id, event.clone()))
            .collect()
    }

    fn whisper(
        &self,
        sender: ClientId,
        sender_name: &str,
        target: String,
        text: String,
    ) -> Vec<Delivery> {
        let target = target.trim().to_string();
        let recipients = self.registry.lookup_by_name(&target);
        if recipients.is_empty() {
            return reply(
                sender,
                Event::error(ErrorCode::TargetNotFound, format!("user not found: {target}")),
            );
        }

        // Duplicate names are allowed; every match gets the whisper.
        let event = Arc::new(Event::whisper(sender_name, text));
        let count = recipients.len();
        let mut deliveries: Vec<Delivery> = recipients
            .into_iter()
            .map(|id| Delivery::new(id, event.clone()))
            .collect();

        if self.config.confirm_whispers {
            deliveries.extend(reply(
                sender,
                Event::WhisperSent {
                    to: target,
                    recipients: count,
                },
            ));
        }
        deliveries
    }

    fn state_update(
        &self,
        sender: ClientId,
        sender_name: &str,
        fields: StateFields,
    ) -> Vec<Delivery> {
        if !self.registry.update_state(sender, &fields) {
            return Vec::new();
        }
        self.to_others(
            sender,
            Event::StateUpdate {
                from: sender_name.to_string(),
                fields,
            },
        )
    }

    fn state_request(&self, sender: ClientId, target: Option<String>) -> Vec<Delivery> {
        let target = target.map(|name| name.trim().to_string());
        let states: Vec<UserState> = self
            .registry
            .snapshot()
            .iter()
            .filter(|record| target.as_deref().map_or(true, |name| record.name == name))
            .map(ClientRecord::user_state)
            .collect();

        if let (Some(name), true) = (&target, states.is_empty()) {
            return reply(
                sender,
                Event::error(ErrorCode::TargetNotFound, format!("user not found: {name}")),
            );
        }
        reply(sender, Event::States { states })
    }

    fn to_others(&self, sender: ClientId, event: Event) -> Vec<Delivery> {
        let event = Arc::new(event);
        self.registry
            .snapshot()
            .into_iter()
            .filter(|record| record.id != sender)
            .map(|record| Delivery::new(record.id, event.clone()))
            .collect()
    }
}

fn reply(target: ClientId, event: Event) -> Vec<Delivery> {
    vec![Delivery::new(target, Arc::new(event))]
}
