pub mod connection;
pub mod submitter;


pub use connection::{choose_device, ConnectDecision};
pub use submitter::{RequestSubmitter, RequestSubmitterBuilder};
