//! Real-time chat connection core.
//!
//! Admission control, presence tracking, per-user rate limiting and room
//! fan-out for WebSocket chat sessions.

pub mod app;

// layers
pub mod domain;
pub mod infrastructure;
pub mod ui;
pub mod usecase;
