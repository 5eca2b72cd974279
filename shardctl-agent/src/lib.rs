//! shardctl Node Agent
//!
//! RPC interface to the management agent running next to every database
//! node, with an HTTP/JSON client and a deterministic fake for tests.

pub mod client;
pub mod fake;
pub mod http;

pub use client::{AgentError, AgentMethod, AgentResult, NodeAgentClient, TabletStatus};
pub use fake::{Fault, FakeNodeAgent, Gate};
pub use http::HttpAgentClient;
