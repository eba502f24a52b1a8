//! mcplink: MCP client transport and correlation core
//!
//! This crate implements the connection layer of a Model Context Protocol
//! (MCP) client: three wire transports, request/response correlation, and
//! the connection lifecycle around the `initialize` handshake.
//!
//! # Architecture
//!
//! - [`Coordinator`] owns at most one transport, runs the handshake, and
//!   exposes request builders for the protocol surface (`tools/list`,
//!   `tools/call`, `resources/*`, `prompts/*`, `completion/complete`,
//!   `ping`).
//! - [`Transport`] abstracts the three wire mechanisms: a child process
//!   over stdio pipes, a persistent SSE event stream with a POST
//!   back-channel, and a streamable HTTP endpoint with session
//!   negotiation.
//! - Each transport owns a `Correlator` that matches in-flight request ids
//!   to waiting callers, whatever order responses arrive in.
//!
//! Messages travel as raw [`serde_json::Value`] envelopes; mapping results
//! into typed domain objects is left to consumers.
//!
//! # Example
//!
//! ```no_run
//! use mcplink::{Coordinator, TransportConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = TransportConfig::process(
//!     "npx",
//!     vec!["-y".into(), "@modelcontextprotocol/server-everything".into()],
//! );
//! let mut coordinator = Coordinator::new(config);
//! coordinator.start().await?;
//!
//! let tools = coordinator.tool_list().await?;
//! println!("{tools}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod correlator;
pub mod error;
pub mod transport;
pub mod types;

pub use config::{TransportConfig, TransportKind};
pub use coordinator::Coordinator;
pub use error::{McplinkError, Result};
pub use transport::{SendOptions, Transport};
pub use types::{Capabilities, ClientInfo, PROTOCOL_VERSION};
