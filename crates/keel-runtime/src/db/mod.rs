mod pool;
mod schema;

pub use pool::{Database, DatabasePool};
pub use schema::{ensure_schema, SCHEMA_SQL};
