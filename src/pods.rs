//! Pod slot management.
//!
//! A process hosts up to [`MAX_PODS`] independent slots, each with its own
//! loaded model, engine context, and configuration. Slots are initialized
//! once and then serve jobs one at a time; different slots run concurrently.
//!
//! Each slot pairs its state mutex with a cancel flag that lives *outside*
//! the mutex, so a cancel request never has to wait for the running job to
//! release the slot.

use tracing::info;

use crate::config::{SlotConfig, MAX_PODS};
use crate::decode::{run_job, JobOutcome, JobRequest};
use crate::engine::{EngineContext, Grammar, GrammarCompiler, ModelBackend, Tokenizer};
use crate::error::{PodError, Result};
use crate::session::SessionPersistence;
use crate::store::SessionStore;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct SlotState<M> {
    #[allow(dead_code)]
    model: M,
    ctx: Box<dyn EngineContext>,
    config: SlotConfig,
}

/// Owner of all pod slots and the shared job store.
pub struct PodManager<B: ModelBackend> {
    backend: B,
    tokenizer: Arc<dyn Tokenizer>,
    sessions: Option<Arc<dyn SessionPersistence>>,
    store: Arc<SessionStore>,
    slots: Vec<Mutex<Option<SlotState<B::Model>>>>,
    cancel_flags: Vec<Arc<AtomicBool>>,
}

impl<B: ModelBackend> PodManager<B> {
    pub fn new(
        backend: B,
        tokenizer: Arc<dyn Tokenizer>,
        sessions: Option<Arc<dyn SessionPersistence>>,
    ) -> Self {
        PodManager {
            backend,
            tokenizer,
            sessions,
            store: Arc::new(SessionStore::new()),
            slots: (0..MAX_PODS).map(|_| Mutex::new(None)).collect(),
            cancel_flags: (0..MAX_PODS).map(|_| Arc::new(AtomicBool::new(false))).collect(),
        }
    }

    /// The shared job store, for API-facing pollers.
    pub fn store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.store)
    }

    /// The cancel flag for a slot. Cloned by workers so a stop request can
    /// land while the slot mutex is held by a running job.
    pub fn cancel_flag(&self, slot: usize) -> Result<Arc<AtomicBool>> {
        self.cancel_flags
            .get(slot)
            .cloned()
            .ok_or(PodError::SlotOutOfRange(slot))
    }

    fn slot(&self, slot: usize) -> Result<&Mutex<Option<SlotState<B::Model>>>> {
        self.slots.get(slot).ok_or(PodError::SlotOutOfRange(slot))
    }

    /// Load a model into a slot and build its engine context. Replaces any
    /// previous occupant of the slot.
    pub fn init_slot(&self, slot: usize, model_path: &Path, config: SlotConfig) -> Result<()> {
        let guard = self.slot(slot)?;
        let model = self.backend.load_model(model_path, &config)?;
        let ctx = self.backend.new_context(&model, &config)?;
        info!(
            slot,
            model = %model_path.display(),
            context_length = config.context_length,
            gpu_layers = config.gpu_layers(),
            "slot initialized"
        );
        *guard.lock().expect("slot poisoned") = Some(SlotState { model, ctx, config });
        Ok(())
    }

    /// Whether a slot has a model loaded.
    pub fn slot_ready(&self, slot: usize) -> bool {
        self.slots
            .get(slot)
            .map(|s| s.lock().expect("slot poisoned").is_some())
            .unwrap_or(false)
    }

    /// Run a job on a slot, blocking until the job finishes, fails, or is
    /// cancelled. The slot is exclusively held for the duration.
    pub fn dispatch_job(&self, slot: usize, request: &JobRequest<'_>) -> Result<JobOutcome> {
        self.dispatch_inner(slot, request, None)
    }

    /// Like [`dispatch_job`] but constrained by a compiled grammar.
    ///
    /// [`dispatch_job`]: PodManager::dispatch_job
    pub fn dispatch_job_with_grammar(
        &self,
        slot: usize,
        request: &JobRequest<'_>,
        grammar: Box<dyn Grammar>,
    ) -> Result<JobOutcome> {
        self.dispatch_inner(slot, request, Some(grammar))
    }

    /// Compile `grammar_text` and dispatch under the resulting constraint.
    /// Parse failures reject the job before it touches the slot.
    pub fn dispatch_job_with_grammar_text(
        &self,
        slot: usize,
        request: &JobRequest<'_>,
        compiler: &dyn GrammarCompiler,
        grammar_text: &str,
    ) -> Result<JobOutcome> {
        let grammar = compiler.parse(grammar_text)?;
        self.dispatch_inner(slot, request, Some(grammar))
    }

    fn dispatch_inner(
        &self,
        slot: usize,
        request: &JobRequest<'_>,
        grammar: Option<Box<dyn Grammar>>,
    ) -> Result<JobOutcome> {
        let cancel = self.cancel_flag(slot)?;
        let mut guard = self.slot(slot)?.lock().expect("slot poisoned");
        let state = guard.as_mut().ok_or(PodError::SlotNotReady(slot))?;

        // A stale cancel from a previous job must not kill this one.
        cancel.store(false, Ordering::Relaxed);

        run_job(
            state.ctx.as_mut(),
            self.tokenizer.as_ref(),
            &state.config,
            &self.store,
            self.sessions.as_deref(),
            &cancel,
            request,
            grammar,
        )
    }

    /// Request cancellation of whatever job the slot is running. The job
    /// stops at its next iteration boundary.
    pub fn cancel(&self, slot: usize) -> Result<()> {
        let flag = self.cancel_flag(slot)?;
        flag.store(true, Ordering::Relaxed);
        info!(slot, "cancel requested");
        Ok(())
    }

    /// Partial output accumulated for a job so far.
    pub fn partial_output(&self, job_id: &str) -> Option<String> {
        self.store.partial_output(job_id)
    }

    pub fn prompt_token_count(&self, job_id: &str) -> Option<usize> {
        self.store.prompt_token_count(job_id)
    }

    pub fn output_token_count(&self, job_id: &str) -> Option<usize> {
        self.store.output_token_count(job_id)
    }

    pub fn prompt_eval_latency(&self, job_id: &str) -> Option<f64> {
        self.store.prompt_eval_latency(job_id)
    }

    pub fn gen_eval_latency(&self, job_id: &str) -> Option<f64> {
        self.store.gen_eval_latency(job_id)
    }

    /// Drop a finished job's state from the store.
    pub fn remove_job(&self, job_id: &str) {
        self.store.remove(job_id);
    }
}
