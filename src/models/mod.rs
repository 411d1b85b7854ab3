pub mod customer;
pub mod item;
pub mod review;
