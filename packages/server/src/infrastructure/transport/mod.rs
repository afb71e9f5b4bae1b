//! Client transport 実装

pub mod websocket;

pub use websocket::{WebSocketFrameSink, websocket_events};
