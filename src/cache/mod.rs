pub mod error;
pub mod keyed_locks;
pub mod store;
