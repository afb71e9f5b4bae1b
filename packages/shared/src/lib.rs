//! Utilities shared between the Irori server binary and its tests.

pub mod logger;
pub mod time;
