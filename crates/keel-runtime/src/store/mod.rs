//! Store implementations of the workflow repository.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;
