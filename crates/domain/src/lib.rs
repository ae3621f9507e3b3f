pub mod entities;
pub mod events;
pub mod handshake;
pub mod ports;
pub mod stats;

pub use entities::{
    ApiFormat, DeviceAnnouncement, DeviceKind, RelayRequest, RelayResponse, RequestStatus,
    ServiceDescriptor, ServiceKind,
};
pub use events::{RecordEvent, RelayEvent};
pub use handshake::HandshakePayload;
pub use ports::{AnnouncementStore, PushChannel, RequestStore, ResponseStore, ServiceRegistry};
pub use stats::RelaySideStats;
