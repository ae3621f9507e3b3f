pub mod push;
pub mod record_store;
pub mod registry;

pub use push::PushChannel;
pub use record_store::{AnnouncementStore, RequestStore, ResponseStore};
pub use registry::ServiceRegistry;
