pub mod amount;
pub mod cache;
pub mod registry;
