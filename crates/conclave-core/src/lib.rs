//! Core types and error definitions for the Conclave orchestration runtime.
//!
//! This crate provides the foundational types shared across all Conclave crates,
//! including error handling, message representations, and the typed tool interface.
//!
//! # Main types
//!
//! - [`ConclaveError`]: Unified error enum for all Conclave subsystems.
//! - [`ConclaveResult`]: Convenience alias for `Result<T, ConclaveError>`.
//! - [`Message`]: A single message exchanged with an agent.
//! - [`Tool`]: Typed interface every callable tool implements.
//! - [`ToolRegistry`]: Name-keyed registry of tools, resolved once at startup.

/// Error taxonomy shared by every crate.
pub mod error;
/// Conversation messages passed to the completion backend.
pub mod message;
/// Tool calls, tool results, and the typed tool registry.
pub mod tool;

pub use error::{ConclaveError, ConclaveResult};
pub use message::{Message, Role};
pub use tool::{execute_call, Tool, ToolCall, ToolDescriptor, ToolRegistry, ToolResult};
