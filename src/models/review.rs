// src/models/review.rs
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Review {
    pub id: i64,                   // Surrogate key assigned by the database
    pub comment: Option<String>,   // Optional free-text comment
    pub customer_id: i64,          // Customer who wrote the review (required)
    pub item_id: i64,              // Item the review is about (required)
}

impl fmt::Display for Review {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Review {}, customer {}, item {}",
            self.id, self.customer_id, self.item_id
        )
    }
}
