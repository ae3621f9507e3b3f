pub mod config;
pub mod errors;
pub mod logging;

pub use config::{
    AppConfig, ClientConfig, DeviceConfig, PresenceConfig, RetentionConfig, ServiceEntryConfig, StoreConfig,
    ToolServerConfig, ToolsConfig, WorkerConfig,
};
pub use errors::{RelayError, Result};
