//! HTTP Transport layer for the Model Context Protocol
//!
//! Provides the external API routing: the streamable `/mcp` endpoint, its
//! server-sent event framing, and the metadata endpoints.

pub mod handlers;
pub mod sse;
