pub mod connector;
pub mod decoder;
pub mod network;
pub mod supervisor;
pub mod types;

pub use connector::ChainConnector;
pub use supervisor::{ListenerStatusReport, ListenerSupervisor};
pub use types::{BridgeTransaction, EventKind, ListenerHealth, ListenerState, TxStatus};
