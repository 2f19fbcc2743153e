//! Error types for the llamapod crate.

use thiserror::Error;

/// Top-level error type for all pod operations.
///
/// Every engine call is treated as a fallible operation; failures map to
/// either "abort this job cleanly" (`PromptTooLong`, `EvalFailed`) or
/// "this slot is unusable" (`ModelLoad`, `ContextInit`) — never partial
/// state. Callers should treat `PromptTooLong` and `EvalFailed` as "zero
/// useful work done"; the slot itself stays usable for the next job.
#[derive(Error, Debug)]
pub enum PodError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("context creation failed: {0}")]
    ContextInit(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("prompt is too long ({tokens} tokens, max {max})")]
    PromptTooLong { tokens: usize, max: usize },

    #[error("engine evaluation failed: {0}")]
    EvalFailed(String),

    #[error("session cache load failed: {0}")]
    SessionLoad(String),

    #[error("grammar parse failed: {0}")]
    GrammarParse(String),

    #[error("slot {0} is not initialized")]
    SlotNotReady(usize),

    #[error("slot index {0} out of range")]
    SlotOutOfRange(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PodError>;
