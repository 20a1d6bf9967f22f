pub mod chunk_store;
pub mod kv;
pub mod queue;
pub mod store;
pub mod types;
