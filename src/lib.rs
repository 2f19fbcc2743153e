//! Multi-pod LLM inference orchestration.
//!
//! llamapod hosts up to eight independent inference slots ("pods") in one
//! process, each with its own model, context, and sampling configuration.
//! Jobs are dispatched to a slot, stream their output into a shared store,
//! and can be cancelled cooperatively mid-generation. A file-backed session
//! cache lets chat-style workloads skip re-evaluating the prompt prefix the
//! context has already seen.
//!
//! The engine itself sits behind the traits in [`engine`], so the
//! orchestration and sampling layers are engine-agnostic.

pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod pods;
pub mod sampling;
pub mod session;
pub mod store;
pub mod worker;

pub use config::{SlotConfig, GPU_MIN_BATCH, MAX_PODS};
pub use decode::{run_job, JobOutcome, JobRequest};
pub use engine::{
    EngineContext, Grammar, GrammarCompiler, ModelBackend, TokenId, Tokenizer,
};
pub use error::{PodError, Result};
pub use pods::PodManager;
pub use sampling::{MirostatMode, Sampler, SamplerConfig};
pub use session::{FileSessionCache, SessionPersistence};
pub use store::{JobEntry, SessionStore};
pub use worker::{SlotWorker, WorkerEvent, WorkerJob};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
