//! Transport layer for remote camera sessions.
//!
//! Provides:
//! - Wire protocol (JSON + base64)
//! - Connection dispatcher driving a `SessionEndpoint` from a duplex channel
//! - WebSocket hosting (feature: websocket)
//! - Client proxy over any duplex channel, WebSocket connector (feature: ws-client)

pub mod client;
pub mod dispatch;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use client::{ClientError, RemoteCamera, RemoteControlClient, RemoteSettings};
pub use dispatch::{ServerContext, serve_connection, spawn_local};
pub use protocol::{ClientMessage, Outcome, ProtocolError, Request, Response, ServerMessage};
