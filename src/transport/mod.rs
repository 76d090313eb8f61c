//! Streamable HTTP transport core
//!
//! Session registry, stream multiplexer, request dispatcher and the lifecycle
//! controller that tears them down in order.

pub mod dispatcher;
pub mod lifecycle;
pub mod session;
pub mod stream;
