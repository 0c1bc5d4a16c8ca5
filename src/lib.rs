//! Supervisor core for llama model-serving workers.
//!
//! Starts, stops and watches worker processes, records host telemetry, and
//! fans status out to dashboard clients over a WebSocket control channel.

pub mod web;

pub use llama_proxy_types as types;

// Used by the `sys_*` logging macros so callers don't need their own `log` dep.
#[doc(hidden)]
pub use log as __log;
