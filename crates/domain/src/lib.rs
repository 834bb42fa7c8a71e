//! Shared types for the TurnGate crates.
//!
//! Configuration tree, the cross-crate error type, chat messages, the
//! backend chunk stream, and structured trace events.

pub mod config;
pub mod error;
pub mod message;
pub mod stream;
pub mod trace;
