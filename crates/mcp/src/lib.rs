//! MCP provider supervision: subprocess lifecycle and JSON-RPC correlation
//! over line-delimited stdio.

pub mod protocol;
pub mod provider;
pub mod supervisor;

pub use provider::{ProviderHandle, ProviderState, ToolInfo};
pub use supervisor::ProviderSupervisor;
