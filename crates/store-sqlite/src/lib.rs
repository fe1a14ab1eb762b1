//! SQLite-backed record store.

mod open;
mod models;
mod insert;
mod query;
mod schema;
mod store;

pub use open::Db;
pub use store::SqliteStore;
