//! The decode loop: prompt evaluation and token generation for one job.
//!
//! Mirrors the engine's natural shape: a pending batch (`embd`) is
//! evaluated at the top of each iteration, then the loop either pulls more
//! prompt tokens into the batch or samples one new token. Prompt
//! consumption always takes priority; sampling begins only once the whole
//! prompt has been evaluated.
//!
//! Cancellation is cooperative: the flag is polled once per iteration, so a
//! cancel lands between engine calls, never inside one.

use tracing::{debug, info, warn};

use crate::config::SlotConfig;
use crate::engine::{EngineContext, Grammar, TokenId, Tokenizer};
use crate::error::{PodError, Result};
use crate::sampling::{SampleInput, Sampler, TokenWindow};
use crate::session::{matching_prefix, SessionPersistence};
use crate::store::SessionStore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Tokens reserved at the end of the context window. Prompts must fit
/// below it, and generation stops on reaching it.
const CONTEXT_HEADROOM: usize = 4;

/// One inference request.
#[derive(Debug, Clone, Copy)]
pub struct JobRequest<'a> {
    pub job_id: &'a str,
    /// Session to resume and persist, if any.
    pub session_id: Option<&'a str>,
    pub prompt: &'a str,
}

/// What a finished (or cancelled) job actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    /// Prompt length after tokenization.
    pub prompt_tokens: usize,
    /// Prompt tokens skipped thanks to the session cache.
    pub reused_tokens: usize,
    /// Tokens generated before stopping.
    pub generated_tokens: usize,
    /// True if the job was stopped by a cancel request.
    pub cancelled: bool,
}

impl JobOutcome {
    /// Tokens actually processed by the engine: the evaluated portion of
    /// the prompt plus everything generated.
    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens - self.reused_tokens + self.generated_tokens
    }
}

/// Run one job to completion on an engine context.
///
/// On success the job's entry in `store` holds the full output (echoed
/// prompt plus generated text), token counts, and timing averages. A
/// [`PodError::PromptTooLong`] rejection happens before any store write, so
/// rejected jobs leave no entry behind. Cancellation is not an error: the
/// outcome reports it and all partial state (store entry, session file)
/// remains valid.
pub fn run_job(
    ctx: &mut dyn EngineContext,
    tokenizer: &dyn Tokenizer,
    config: &SlotConfig,
    store: &SessionStore,
    sessions: Option<&dyn SessionPersistence>,
    cancel: &AtomicBool,
    request: &JobRequest<'_>,
    mut grammar: Option<Box<dyn Grammar>>,
) -> Result<JobOutcome> {
    let n_ctx = ctx.context_length();
    let prompt = tokenizer.tokenize(request.prompt, true)?;
    let max_position = n_ctx.saturating_sub(CONTEXT_HEADROOM);
    if prompt.len() > max_position {
        return Err(PodError::PromptTooLong {
            tokens: prompt.len(),
            max: max_position,
        });
    }

    store.set_prompt_token_count(request.job_id, prompt.len());

    // Accelerated contexts do not restore evaluated state, so the session
    // cache only applies to CPU slots.
    let sessions = if config.is_gpu() { None } else { sessions };

    // Resume from the session cache: skip the prompt prefix the context has
    // already evaluated. When the cache covers the entire prompt, the last
    // prompt token is re-evaluated anyway so sampling starts from fresh
    // logits. A cache that fails to load is a miss, not an error.
    let mut session_tokens = match (sessions, request.session_id) {
        (Some(persistence), Some(session_id)) => match persistence.load_tokens(session_id) {
            Ok(tokens) => tokens.unwrap_or_default(),
            Err(err) => {
                warn!(session_id, %err, "session load failed, starting cold");
                Vec::new()
            }
        },
        _ => Vec::new(),
    };
    let mut n_reused = matching_prefix(&session_tokens, &prompt);
    if n_reused > 0 && n_reused == prompt.len() {
        n_reused = prompt.len() - 1;
    }
    session_tokens.truncate(n_reused);

    debug!(
        job_id = request.job_id,
        prompt_tokens = prompt.len(),
        reused = n_reused,
        "starting job"
    );

    let batch = config.effective_batch();
    let eos = ctx.eos_token();
    let mut sampler = Sampler::new(config.sampler.clone(), config.seed);
    let mut window = TokenWindow::new(n_ctx);
    for &token in &prompt[..n_reused] {
        window.push(token);
    }

    let mut embd: Vec<TokenId> = Vec::new();
    let mut embd_is_prompt = true;
    let mut n_past = n_reused;
    let mut consumed = n_reused;
    let mut generated = 0usize;
    let mut cancelled = false;

    let mut prompt_eval = Duration::ZERO;
    let mut prompt_eval_tokens = 0usize;
    let mut gen_eval = Duration::ZERO;
    let mut gen_eval_tokens = 0usize;

    loop {
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            break;
        }

        if !embd.is_empty() {
            let start = Instant::now();
            for chunk in embd.chunks(batch) {
                ctx.evaluate(chunk, n_past, config.threads)?;
                n_past += chunk.len();
            }
            let elapsed = start.elapsed();
            if embd_is_prompt {
                prompt_eval += elapsed;
                prompt_eval_tokens += embd.len();
            } else {
                gen_eval += elapsed;
                gen_eval_tokens += embd.len();
            }

            for &token in &embd {
                store.append_output(request.job_id, &tokenizer.token_text(token));
                session_tokens.push(token);
            }
            embd.clear();
        }

        if consumed < prompt.len() {
            while consumed < prompt.len() && embd.len() < batch {
                let token = prompt[consumed];
                embd.push(token);
                window.push(token);
                consumed += 1;
            }
            embd_is_prompt = true;
        } else {
            // Stop at the predict budget, or when the position counter hits
            // the reserved headroom at the end of the window.
            if generated >= config.n_predict || n_past >= max_position {
                break;
            }

            let input = SampleInput {
                vocab_size: ctx.vocab_size(),
                context_length: n_ctx,
                eos_token: eos,
                newline_token: ctx.newline_token(),
                generated_len: generated,
                guidance_logits: None,
            };
            let token = sampler.sample(ctx.logits(), &input, &window, grammar.as_deref_mut());
            window.push(token);

            if token == eos {
                break;
            }

            embd.push(token);
            embd_is_prompt = false;
            generated += 1;
            store.add_output_token(request.job_id);
        }
    }

    // Persist whatever the context has seen, cancelled or not, so the next
    // job in this session still benefits. A failed save loses the cache,
    // not the job.
    if let (Some(persistence), Some(session_id)) = (sessions, request.session_id) {
        if let Err(err) = persistence.save_tokens(session_id, &session_tokens) {
            warn!(session_id, %err, "session save failed");
        }
    }

    let avg_ms = |total: Duration, tokens: usize| {
        if tokens == 0 {
            0.0
        } else {
            total.as_secs_f64() * 1000.0 / tokens as f64
        }
    };
    let prompt_ms = avg_ms(prompt_eval, prompt_eval_tokens);
    let gen_ms = avg_ms(gen_eval, gen_eval_tokens);
    store.record_timings(request.job_id, prompt_ms, gen_ms);

    info!(
        job_id = request.job_id,
        prompt_tokens = prompt.len(),
        reused = n_reused,
        generated,
        cancelled,
        prompt_ms_per_token = prompt_ms,
        gen_ms_per_token = gen_ms,
        "job finished"
    );

    Ok(JobOutcome {
        prompt_tokens: prompt.len(),
        reused_tokens: n_reused,
        generated_tokens: generated,
        cancelled,
    })
}
