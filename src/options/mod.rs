pub mod monitor;
pub mod pool;
pub mod server;

pub use monitor::{ServerMonitorSettings, ServerMonitoringMode};
pub use pool::ConnectionPoolSettings;
pub use server::{ServerApi, ServerApiVersion, ServerSettings};
