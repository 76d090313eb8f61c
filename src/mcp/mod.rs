//! Model Context Protocol envelopes and engine
//!
//! Provides the JSON-RPC codec, error codes, the engine interface the transport
//! drives, and the built-in engine shipped with the binary.

pub mod codec;
pub mod engine;
pub mod rpc;
pub mod server;
