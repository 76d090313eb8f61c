//! Behaviour of the built-in protocol engine
//!
//! Client-to-client messaging: queues, the client directory, the tools that
//! expose them and the logging notifications those tools emit.

pub mod clients;
pub mod messaging;
pub mod notifications;
pub mod tools;
