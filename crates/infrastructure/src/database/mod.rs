pub mod sqlite;

pub use sqlite::SqliteTaskRepository;
