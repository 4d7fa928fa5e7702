//! Envelope types for the Murmur protocol.
//!
//! Inbound envelopes are [`Command`]s, outbound envelopes are [`Event`]s.
//! Both are JSON objects carrying exactly one tag. Outbound envelopes always
//! use the `type` key; inbound envelopes may use either `type` or `command`
//! (see [`crate::codec::decode`]).

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Free-form presence fields, merged key by key (last write wins).
pub type StateFields = serde_json::Map<String, serde_json::Value>;

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A command sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Register with a display name, or rename once registered.
    #[serde(alias = "register", alias = "rename")]
    Username {
        /// Requested display name.
        #[serde(alias = "name")]
        username: String,
    },

    /// Broadcast text to every client.
    #[serde(alias = "message", alias = "broadcast")]
    Chat {
        /// Message text.
        #[serde(alias = "message", alias = "content")]
        text: String,
    },

    /// Private text to every client with the given display name.
    Whisper {
        /// Display name of the recipient.
        #[serde(alias = "targetName", alias = "target_name", alias = "to")]
        target: String,
        /// Message text.
        #[serde(alias = "message", alias = "content")]
        text: String,
    },

    /// Merge fields into the sender's presence state.
    StateUpdate {
        /// Fields to replace.
        #[serde(alias = "state")]
        fields: StateFields,
    },

    /// Ask for the display names of every connected client.
    #[serde(alias = "list")]
    UsersRequest {},

    /// Ask for the last known state of one named client, or of everyone.
    StateRequest {
        /// Display name to look up; everyone when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },

    /// Keepalive.
    Ping {
        /// Optional timestamp, echoed back in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Ask for the list of supported commands.
    Help {},
}

impl Command {
    /// Every tag accepted on the wire, aliases included.
    pub const TAGS: &'static [&'static str] = &[
        "username",
        "register",
        "rename",
        "chat",
        "message",
        "broadcast",
        "whisper",
        "state_update",
        "users_request",
        "list",
        "state_request",
        "ping",
        "help",
    ];

    /// Canonical tag of this command.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Username { .. } => "username",
            Command::Chat { .. } => "chat",
            Command::Whisper { .. } => "whisper",
            Command::StateUpdate { .. } => "state_update",
            Command::UsersRequest {} => "users_request",
            Command::StateRequest { .. } => "state_request",
            Command::Ping { .. } => "ping",
            Command::Help {} => "help",
        }
    }

    /// Create a `username` command.
    #[must_use]
    pub fn username(name: impl Into<String>) -> Self {
        Command::Username {
            username: name.into(),
        }
    }

    /// Create a `chat` command.
    #[must_use]
    pub fn chat(text: impl Into<String>) -> Self {
        Command::Chat { text: text.into() }
    }

    /// Create a `whisper` command.
    #[must_use]
    pub fn whisper(target: impl Into<String>, text: impl Into<String>) -> Self {
        Command::Whisper {
            target: target.into(),
            text: text.into(),
        }
    }

    /// Create a `state_update` command.
    #[must_use]
    pub fn state_update(fields: StateFields) -> Self {
        Command::StateUpdate { fields }
    }

    /// Create a `users_request` command.
    #[must_use]
    pub fn users_request() -> Self {
        Command::UsersRequest {}
    }
}

/// Machine-readable error codes carried by [`Event::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The frame was not a valid JSON envelope.
    DecodeError,
    /// The envelope tag is not a known command.
    UnknownCommand,
    /// No connected client has the requested name.
    TargetNotFound,
    /// A state update carried something other than an object.
    InvalidState,
    /// A requested display name was empty or too long.
    InvalidName,
    /// The frame exceeded the size limit.
    FrameTooLarge,
    /// The command requires a registered username first.
    NotRegistered,
}

impl ErrorCode {
    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DecodeError => "decode_error",
            ErrorCode::UnknownCommand => "unknown_command",
            ErrorCode::TargetNotFound => "target_not_found",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::InvalidName => "invalid_name",
            ErrorCode::FrameTooLarge => "frame_too_large",
            ErrorCode::NotRegistered => "not_registered",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known state of one client, as reported by `states`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    /// Display name.
    pub username: String,
    /// Presence fields.
    pub state: StateFields,
}

/// An event delivered to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Sent once after registration.
    Welcome {
        /// Identifier assigned to the connection.
        client_id: String,
        /// Display name in effect.
        username: String,
        /// Protocol version.
        version: String,
    },

    /// Broadcast text.
    Chat {
        /// Display name of the sender.
        from: String,
        /// Message text.
        text: String,
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// Private text.
    Whisper {
        /// Display name of the sender.
        from: String,
        /// Message text.
        text: String,
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// Confirmation that a whisper was handed to its recipients.
    WhisperSent {
        /// Requested recipient name.
        to: String,
        /// Number of clients matching that name.
        recipients: usize,
    },

    /// A peer changed its presence state.
    StateUpdate {
        /// Display name of the peer.
        from: String,
        /// Fields that changed.
        fields: StateFields,
    },

    /// Reply to `state_request`.
    States {
        /// One entry per matching client.
        states: Vec<UserState>,
    },

    /// Reply to `users_request`.
    UserList {
        /// Display names of every connected client.
        users: Vec<String>,
    },

    /// Informational notice from the relay.
    System {
        /// Notice text.
        text: String,
    },

    /// A peer registered.
    UserJoined {
        /// Display name of the peer.
        username: String,
    },

    /// A peer went away.
    UserLeft {
        /// Display name of the peer.
        username: String,
    },

    /// Something the client sent could not be processed.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable description.
        text: String,
    },

    /// Keepalive reply.
    Pong {
        /// Timestamp echoed from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Reply to `help`.
    Help {
        /// One line per supported command.
        commands: Vec<String>,
    },
}

impl Event {
    /// Canonical tag of this event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Welcome { .. } => "welcome",
            Event::Chat { .. } => "chat",
            Event::Whisper { .. } => "whisper",
            Event::WhisperSent { .. } => "whisper_sent",
            Event::StateUpdate { .. } => "state_update",
            Event::States { .. } => "states",
            Event::UserList { .. } => "user_list",
            Event::System { .. } => "system",
            Event::UserJoined { .. } => "user_joined",
            Event::UserLeft { .. } => "user_left",
            Event::Error { .. } => "error",
            Event::Pong { .. } => "pong",
            Event::Help { .. } => "help",
        }
    }

    /// Create a `chat` event stamped with the current time.
    #[must_use]
    pub fn chat(from: impl Into<String>, text: impl Into<String>) -> Self {
        Event::Chat {
            from: from.into(),
            text: text.into(),
            timestamp: now_millis(),
        }
    }

    /// Create a `whisper` event stamped with the current time.
    #[must_use]
    pub fn whisper(from: impl Into<String>, text: impl Into<String>) -> Self {
        Event::Whisper {
            from: from.into(),
            text: text.into(),
            timestamp: now_millis(),
        }
    }

    /// Create a `system` event.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Event::System { text: text.into() }
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Event::Error {
            code,
            text: text.into(),
        }
    }

    /// Create the `help` event.
    #[must_use]
    pub fn help() -> Self {
        let commands = [
            "username <name>: register or change your display name",
            "chat <text>: send text to everyone",
            "whisper <target> <text>: send text to every client named <target>",
            "state_update <fields>: merge fields into your presence state",
            "users_request: list connected clients",
            "state_request [target]: show presence state",
            "ping: keepalive",
            "help: show this list",
        ];
        Event::Help {
            commands: commands.iter().map(|c| (*c).to_string()).collect(),
        }
    }
}
