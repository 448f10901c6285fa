//! Repository implementations.

pub mod host;

pub use host::PgHostStore;
