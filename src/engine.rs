//! Collaborator interfaces for the inference engine, tokenizer, and grammar.
//!
//! This is the "narrow waist" of the llamapod stack: the orchestration and
//! sampling layers depend on *engine behavior*, not on any particular
//! implementation. A real deployment plugs in an FFI-backed engine; tests
//! plug in stubs.
//!
//! # Interior Mutability
//!
//! [`ModelBackend`] methods take `&self` so one backend instance can serve
//! all pod slots concurrently. Each [`EngineContext`] is owned by exactly
//! one slot and mutated only by the decode loop driving that slot, so its
//! methods take `&mut self` without further synchronization.

use crate::config::SlotConfig;
use crate::error::Result;
use crate::sampling::CandidateSet;

use std::path::Path;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// One engine execution context, bound to a loaded model.
///
/// Wraps the engine's `evaluate(tokens, pastLen) -> logits` operation plus
/// the model constants the sampling pipeline needs.
pub trait EngineContext: Send {
    /// Evaluate a batch of tokens at the given position offset.
    ///
    /// Synchronous; runs to completion. Any failure is fatal for the
    /// current job (the decode loop maps it to [`PodError::EvalFailed`])
    /// but leaves the context usable for the next job.
    ///
    /// [`PodError::EvalFailed`]: crate::error::PodError::EvalFailed
    fn evaluate(&mut self, tokens: &[TokenId], n_past: usize, threads: usize) -> Result<()>;

    /// Raw logits over the vocabulary from the most recent evaluation.
    fn logits(&self) -> &[f32];

    /// Vocabulary size of the loaded model.
    fn vocab_size(&self) -> usize;

    /// Context window length in tokens.
    fn context_length(&self) -> usize;

    /// The end-of-sequence token id.
    fn eos_token(&self) -> TokenId;

    /// The newline token id (needed for the `penalize_nl` carve-out).
    fn newline_token(&self) -> TokenId;
}

/// Loads models and constructs engine contexts.
///
/// Split into two operations so one loaded model can back a re-created
/// context without reloading weights.
pub trait ModelBackend: Send + Sync {
    /// Opaque handle to a loaded model.
    type Model: Send + Sync + 'static;

    /// Load a model from disk. Fatal to the slot on failure.
    fn load_model(&self, path: &Path, config: &SlotConfig) -> Result<Self::Model>;

    /// Construct an execution context bound to a loaded model.
    fn new_context(&self, model: &Self::Model, config: &SlotConfig)
        -> Result<Box<dyn EngineContext>>;
}

/// Text/token conversion, provided by the engine's tokenizer.
pub trait Tokenizer: Send + Sync {
    /// Convert text into a token sequence. `add_leading_marker` prepends
    /// the beginning-of-sequence marker.
    fn tokenize(&self, text: &str, add_leading_marker: bool) -> Result<Vec<TokenId>>;

    /// Convert a single token back into its text piece.
    fn token_text(&self, token: TokenId) -> String;
}

/// Active state of a compiled grammar constraint.
///
/// The state machine is advanced one-way as tokens are accepted; it is
/// never rolled back within a sampling call.
pub trait Grammar: Send {
    /// Mask out candidates that would violate the grammar in its current
    /// state (typically by setting their logits to `-inf`).
    fn constrain(&self, candidates: &mut CandidateSet);

    /// Accept the chosen token and advance the state machine.
    fn advance(&mut self, token: TokenId);
}

/// Compiles grammar text into an active [`Grammar`] state.
///
/// Parse failures are fatal at configuration time, before any job starts
/// ([`PodError::GrammarParse`]).
///
/// [`PodError::GrammarParse`]: crate::error::PodError::GrammarParse
pub trait GrammarCompiler: Send + Sync {
    fn parse(&self, grammar_text: &str) -> Result<Box<dyn Grammar>>;
}
