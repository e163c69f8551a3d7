//! Error types for the conversational-flow engine
//!
//! Domain errors use thiserror; collaborator adapters report failures as
//! `anyhow::Error` at the port boundary and the engine classifies them as
//! fatal or recoverable.

use thiserror::Error;

/// Script-level errors: malformed programs caught at load time and fatal
/// conditions hit while interpreting a well-formed document.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script document root was not a JSON object.
    #[error("script root must be a JSON object mapping block ids to entries")]
    InvalidRoot,

    /// A block or initialize entry did not match exactly one instruction shape.
    #[error("block '{block}' entry {index}: {detail}")]
    InvalidInstruction {
        /// Block identifier containing the entry
        block: String,
        /// Zero-based index of the entry within the block
        index: usize,
        /// Description of the problem
        detail: String,
    },

    /// A frame or goto referenced a block id absent from the program.
    #[error("unresolved block id: '{0}'")]
    UnresolvedBlock(String),

    /// A gallery item reference did not resolve to a named card.
    #[error("unresolved gallery item reference: '{0}'")]
    UnresolvedGalleryItem(String),

    /// A suspending instruction appeared inside a synchronous-only random group.
    #[error("only synchronous instructions are allowed in a random group: {0}")]
    AsyncInRandomGroup(String),

    /// An append instruction targeted a variable that is not a sequence.
    #[error("append target '{0}' does not hold a sequence")]
    AppendToNonSequence(String),

    /// The per-run instruction budget was exhausted, most likely a goto cycle.
    #[error("instruction budget of {budget} exhausted in block '{block}' (script goto cycle?)")]
    BudgetExhausted {
        /// Configured budget that was hit
        budget: usize,
        /// Block being executed when the budget ran out
        block: String,
    },
}

/// Convenience result alias for script loading and validation.
pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

/// Top-level engine error surfaced by dispatcher entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal script error (unresolved block, unsupported instruction, ...)
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    /// Session store failure: load, save, or log append.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// Platform-level initialize directive failed.
    #[error("platform initialization failed: {0}")]
    PlatformInit(#[source] anyhow::Error),
}

/// Result type using [`EngineError`].
pub type EngineResult<T> = std::result::Result<T, EngineError>;
