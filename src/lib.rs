//! Review store - schema and serialization layer over SQLite
//!
//! Three related entity types live here:
//! - Customers, identified by a unique name
//! - Items, carrying a unique name and a price
//! - Reviews, joining one customer to one item with an optional comment
//!
//! Serialization walks the relationship graph and applies each type's
//! exclusion rules, so nested objects stop where the rules say they stop.

pub mod db;
pub mod error;
pub mod models;
pub mod serialize;

pub use db::Database;
pub use error::{Result, StoreError};
pub use models::customer::Customer;
pub use models::item::Item;
pub use models::review::Review;
pub use serialize::EntityKind;
