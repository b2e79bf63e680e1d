pub mod blacklist;
pub mod engine;
pub mod rules;
pub mod types;

pub use engine::AnomalyEngine;
pub use types::{Anomaly, AnomalyStatus, AnomalyType, Finding, Severity};
