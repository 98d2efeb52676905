//! NewsBias Store — SQLite persistence for articles and model score history.

pub mod schema;
pub mod sqlite;
pub mod types;

pub use sqlite::SqliteStore;
pub use types::*;
