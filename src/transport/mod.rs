//! Transport layer for the chat relay
//!
//! Carries JSON control messages between the signaling core and the relay.

pub mod websocket;

pub use websocket::{RelayClient, RelayEvent, RelayHandle};
