//! Colloquy – a conversational-flow execution engine
//!
//! This crate runs declarative dialogue scripts against per-user sessions:
//! - Scripts are JSON documents of named blocks, validated up front into a
//!   typed instruction set
//! - Each user's session is a resumable frame stack plus a variable store,
//!   persisted through a pluggable storage port
//! - The interpreter suspends mid-block to wait for replies and resumes on
//!   the next inbound event, with `${name}` placeholder substitution applied
//!   per execution
//! - A dispatcher serializes events per user and commits the session at a
//!   single save point

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Engine core modules implementing the script interpreter and dispatcher
pub mod engine;

// Re-export key types for convenience
pub use engine::error::{EngineError, EngineResult, ScriptError, ScriptResult};
pub use engine::program::Program;
pub use engine::session::Session;
pub use engine::{Engine, EngineConfig, RequestContext};

/// Current version of the Colloquy engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
