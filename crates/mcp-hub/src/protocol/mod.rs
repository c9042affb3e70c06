pub mod client;
pub mod models;

pub use client::{McpClient, McpProtocolClient, McpTransport};
pub use models::*;

#[cfg(test)]
pub use client::MockMcpClient;
