use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Item {
    pub id: i64,          // Surrogate key assigned by the database
    pub name: String,     // Item name, unique across the table
    pub price: f64,       // Unit price
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Item {}, {}, {}", self.id, self.name, self.price)
    }
}
