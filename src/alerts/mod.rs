pub mod channels;
pub mod dedup;
pub mod system;
pub mod types;

pub use channels::{ChannelDispatcher, Dispatch};
pub use system::{AlertStats, AlertSystem};
pub use types::{Alert, AlertRequest, AlertSeverity, AlertStatus, AlertType, ChannelType};
