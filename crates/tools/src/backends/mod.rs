pub mod builtin;
pub mod http;
pub mod rpc_server;
pub mod subprocess;
