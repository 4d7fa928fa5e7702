//! # murmur-transport
//!
//! Transport abstraction layer for the Murmur presence relay.
//!
//! This crate provides a unified interface for different transports:
//!
//! - **TCP** - Newline-delimited JSON over a raw socket
//! - **WebSocket** - One envelope per message, served through axum
//! - **Memory** - In-process pipes for tests
//!
//! ## Transport Abstraction
//!
//! All transports implement the `Transport` and `Connection` traits,
//! allowing the server to be transport-agnostic.
//!
//! ```rust,ignore
//! use murmur_transport::{Connection, Transport};
//!
//! async fn handle_connection(conn: Box<dyn Connection>) {
//!     let (mut reader, mut writer) = conn.split();
//!     while let Ok(Some(frame)) = reader.read_frame().await {
//!         // Process frame
//!     }
//! }
//! ```

mod lines;
pub mod memory;
pub mod tcp;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use lines::{LineReader, LineWriter};
pub use memory::{MemoryClient, MemoryConnector, MemoryTransport};
pub use tcp::{TcpConfig, TcpTransport};
pub use traits::{Connection, FrameReader, FrameWriter, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnection};
