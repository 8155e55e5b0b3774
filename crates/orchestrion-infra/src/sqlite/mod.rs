//! SQLite storage layer.
//!
//! One store type implements every engine repository on top of WAL-mode
//! SQLite with split read/write connection pools.

pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::SqliteStore;
