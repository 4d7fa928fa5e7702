//! # murmur-core
//!
//! Client registry, command routing and fan-out for the Murmur presence
//! relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **ClientRegistry** - Every live connection, its name and presence state
//! - **Router** - Decides which clients receive which events
//! - **Broadcaster** - Pushes events onto bounded per-client queues
//! - **Relay** - The facade transports drive
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│ Broadcaster │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   │
//!        │            ┌─────────────┐            │
//!        └────────────│  Registry   │◀───────────┘
//!      SendHandle     └─────────────┘   evictions
//! ```
//!
//! ## Example
//!
//! ```rust
//! use murmur_core::{Relay, SendHandle};
//! use murmur_protocol::{Command, Event};
//!
//! let relay = Relay::new();
//! let (alice, mut alice_rx) = SendHandle::channel(16);
//! let (bob, mut bob_rx) = SendHandle::channel(16);
//!
//! let alice = relay.connect(alice, Some("alice")).unwrap();
//! relay.connect(bob, Some("bob")).unwrap();
//! relay.submit(alice, Command::chat("hello"));
//!
//! // Bob sees his welcome, then the chat.
//! assert_eq!(bob_rx.try_recv().unwrap().kind(), "welcome");
//! assert!(matches!(*bob_rx.try_recv().unwrap(), Event::Chat { .. }));
//! # let _ = alice_rx.try_recv();
//! ```

pub mod broadcaster;
pub mod handle;
pub mod registry;
pub mod relay;
pub mod router;

pub use broadcaster::{Broadcaster, BroadcasterConfig, DeliveryReport, DEFAULT_MAX_STRIKES};
pub use handle::{OutboundReceiver, SendFailure, SendHandle, DEFAULT_OUTBOUND_QUEUE};
pub use registry::{validate_display_name, ClientId, ClientRecord, ClientRegistry, MAX_NAME_LENGTH};
pub use relay::{Relay, RelayConfig, RelayError};
pub use router::{Delivery, Router, RouterConfig};
