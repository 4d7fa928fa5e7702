//! # murmur-protocol
//!
//! Wire protocol definitions for the Murmur presence relay.
//!
//! Every envelope is a single UTF-8 JSON object on its own line. Clients
//! send [`Command`]s and the relay answers with [`Event`]s.
//!
//! ## Commands
//!
//! - `username` - Register (first frame) or rename
//! - `chat` - Broadcast text to everyone
//! - `whisper` - Private text to every client with a given name
//! - `state_update` - Merge fields into the sender's presence state
//! - `users_request` / `state_request` - Query the relay
//!
//! ## Example
//!
//! ```rust
//! use murmur_protocol::{codec, Command};
//!
//! let command = codec::decode(br#"{"command":"chat","text":"hi"}"#).unwrap();
//! assert_eq!(command, Command::chat("hi"));
//! ```

pub mod codec;
pub mod envelope;
pub mod version;

pub use codec::{decode, decode_event, encode, encode_line, LineFramer, ProtocolError, MAX_FRAME_SIZE};
pub use envelope::{Command, ErrorCode, Event, StateFields, UserState};
pub use version::{Version, PROTOCOL_VERSION};
