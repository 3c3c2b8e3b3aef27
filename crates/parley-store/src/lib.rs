//! Persistence, cache and queue contracts consumed by the messaging core,
//! with a SQLite store and in-process engines behind them.

pub mod cache;
pub mod database;
pub mod error;
pub mod groups;
pub mod memory;
pub mod messages;
pub mod queue;
pub mod row_helpers;
pub mod schema;
pub mod traits;

pub use cache::{FastCache, MemoryCache};
pub use database::Database;
pub use error::{CacheError, QueueError, StoreError};
pub use groups::GroupRepo;
pub use memory::MemoryStore;
pub use messages::MessageRepo;
pub use queue::{DurableQueue, MemoryQueue, MessageHandler};
pub use traits::{GroupStore, MessageStore};
