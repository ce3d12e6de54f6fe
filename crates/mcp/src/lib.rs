// MCP (Model Context Protocol) server exposing Ren'Py project tools to agent clients

pub mod protocol;
pub mod resources;
pub mod server;
pub mod tools;

pub use server::McpServer;
pub use tools::ToolContext;
