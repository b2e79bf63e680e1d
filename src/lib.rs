pub mod alerts;
pub mod anomaly;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod listener;
pub mod matcher;
pub mod pipeline;
pub mod retention;
pub mod store;
pub mod tokens;

#[cfg(test)]
pub(crate) mod test_utils;
