//! Worker process supervision.
//!
//! Each model id maps to at most one worker process:
//! - `process_manager`: launching, signalling and reaping OS processes
//! - `supervisor`: the per-model state machine built on top of it

pub mod process_manager;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;
