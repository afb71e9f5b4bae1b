//! FanoutBus 実装

pub mod local;

pub use local::LocalFanoutBus;
