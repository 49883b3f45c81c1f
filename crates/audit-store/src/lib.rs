//! SQLite-backed scheduling store: known hosts, managed credentials and the
//! host x credential test queue.

mod insert;
mod models;
mod open;
mod query;
mod schema;

pub use models::*;
pub use open::{Db, StoreTx};
