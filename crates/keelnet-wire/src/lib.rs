//! Keelnet wire protocol: encrypted request/response sessions over TCP.
//!
//! Peers exchange length-prefixed JSON frames. Any frame can travel inside an
//! AES-CBC envelope once an RSA-protected key exchange has installed a
//! session cipher on the connection.
//!
//! ## Architecture
//!
//! - **Connection**: one TCP session: framing, optional encryption, request/response correlation
//! - **Registry**: server-side accept loops plus the set of live connections
//! - **ProcessingModule**: pluggable handlers for inbound requests and notifications
//! - **Message**: the tagged JSON message model

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod message;
pub mod module;
pub mod registry;
pub mod reply;

pub use config::{load_config, ConnectionConfig, ServerConfig, WireConfig};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::WireError;
pub use message::{Message, Notification, Request, RequestBody, Response, ResponseBody};
pub use module::{CustomRequestModule, KeyExchangeModule, PingModule, ProcessingModule};
pub use registry::{Registry, RegistryEvent, RemoveReason};
pub use reply::ReplyType;
