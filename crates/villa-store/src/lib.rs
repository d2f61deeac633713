pub mod in_memory_backend;
pub mod schema;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory_backend::InMemoryRepository;

#[cfg(feature = "postgres")]
pub use postgres::{PgOptions, PgRepository};
