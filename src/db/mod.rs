pub mod executor;
pub mod introspect;
pub mod keys;
pub mod rows;
pub mod schema;
pub mod schema_cache;
pub mod statement;
pub mod store;
