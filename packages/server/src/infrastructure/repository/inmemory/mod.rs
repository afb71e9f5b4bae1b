//! インメモリ実装
//!
//! 単一プロセスでの実行とテストのための実装です。

pub mod message_store;
pub mod seed;
pub mod user_directory;

pub use message_store::InMemoryMessageStore;
pub use seed::{Seed, SeedError};
pub use user_directory::InMemoryUserDirectory;
