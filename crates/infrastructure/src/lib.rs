pub mod presence;
pub mod push;
pub mod registry;
pub mod retention;
pub mod store;

pub use presence::PresenceService;
pub use push::{InProcessPushChannel, NoopPushChannel};
pub use registry::StaticServiceRegistry;
pub use retention::{RetentionSweeper, SweepStats};
pub use store::memory::InMemoryRecordStore;
pub use store::sqlite::SqliteRecordStore;
