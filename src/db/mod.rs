#[cfg(test)]
pub mod memory;
pub mod models;
pub mod repository;

pub use repository::{PgStore, Store};
