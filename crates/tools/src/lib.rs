pub mod backend;
pub mod backends;
pub mod chat;
pub mod orchestrator;

pub use backend::{ToolBackend, ToolRegistry};
pub use backends::builtin::FsToolBackend;
pub use backends::http::{HttpToolBackend, HttpToolEndpoint};
pub use backends::rpc_server::ToolServerBackend;
pub use backends::subprocess::{OneShotProcessBackend, SubprocessTool};
pub use chat::{ChatMessage, FunctionCall, ToolCallInstruction, ToolDefinition};
pub use orchestrator::ToolOrchestrator;
