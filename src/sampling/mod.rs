//! Token sampling pipeline.
//!
//! After the engine produces logits (raw unnormalized scores over the
//! vocabulary), the sampler selects the next token. The pipeline runs a
//! fixed sequence of optional stages:
//!
//! 1. Pedantic-token pass (experimental short-circuit, see [`pedantic`])
//! 2. Classifier-free guidance blend
//! 3. Repetition penalty over the recent-token window
//! 4. Grammar constraint mask
//! 5. Terminal selection: greedy, mirostat v1/v2, or
//!    top-k → typical-p → top-p → temperature → weighted draw
//! 6. Grammar state advance
//!
//! Every stage keeps at least one candidate alive (`min_keep = 1`), so the
//! terminal draw always has something to pick. `temperature <= 0` forces
//! fully deterministic greedy selection regardless of the other knobs.

pub mod pedantic;

pub use pedantic::{PedanticConfig, PEDANTIC_TOKENS};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::engine::{Grammar, TokenId};

use std::collections::{HashSet, VecDeque};

/// Mirostat adaptive sampling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirostatMode {
    #[default]
    Off,
    V1,
    V2,
}

/// Sampling configuration, immutable per call.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Temperature for logit scaling. <= 0.0 forces greedy (deterministic)
    /// selection regardless of every other field.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Top-K: restrict to the K most likely tokens. <= 0 means the full
    /// vocabulary (values above the vocabulary size are clamped to it).
    #[serde(default = "default_top_k")]
    pub top_k: i32,

    /// Top-P (nucleus): restrict to the smallest set whose cumulative
    /// probability reaches P. 1.0 = disabled.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Typical-P filtering. 1.0 = disabled.
    #[serde(default = "default_typical_p")]
    pub typical_p: f32,

    /// Repetition penalty over the recent-token window. 1.0 = none.
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// How many recent tokens the penalty looks at. Negative = context
    /// length.
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i32,

    /// Whether the repetition penalty may suppress the newline token.
    /// When false, the newline logit is restored after penalties.
    #[serde(default = "default_penalize_nl")]
    pub penalize_nl: bool,

    /// Mirostat mode.
    #[serde(default)]
    pub mirostat: MirostatMode,

    /// Mirostat target surprise (tau).
    #[serde(default = "default_mirostat_tau")]
    pub mirostat_tau: f32,

    /// Mirostat learning rate (eta).
    #[serde(default = "default_mirostat_eta")]
    pub mirostat_eta: f32,

    /// Classifier-free guidance scale, applied when guidance logits are
    /// supplied. 1.0 = guidance has no effect.
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,

    /// Experimental pedantic-token heuristic. None = disabled.
    #[serde(default)]
    pub pedantic: Option<PedanticConfig>,
}

fn default_temperature() -> f32 {
    0.8
}
fn default_top_k() -> i32 {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_typical_p() -> f32 {
    1.0
}
fn default_repeat_penalty() -> f32 {
    1.10
}
fn default_repeat_last_n() -> i32 {
    -1
}
fn default_penalize_nl() -> bool {
    true
}
fn default_mirostat_tau() -> f32 {
    5.0
}
fn default_mirostat_eta() -> f32 {
    0.1
}
fn default_cfg_scale() -> f32 {
    1.0
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            typical_p: default_typical_p(),
            repeat_penalty: default_repeat_penalty(),
            repeat_last_n: default_repeat_last_n(),
            penalize_nl: default_penalize_nl(),
            mirostat: MirostatMode::Off,
            mirostat_tau: default_mirostat_tau(),
            mirostat_eta: default_mirostat_eta(),
            cfg_scale: default_cfg_scale(),
            pedantic: None,
        }
    }
}

impl SamplerConfig {
    /// Fully deterministic greedy selection.
    pub fn greedy() -> Self {
        SamplerConfig {
            temperature: 0.0,
            ..Default::default()
        }
    }
}

/// One vocabulary entry in a [`CandidateSet`].
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Ordered set of candidate tokens, rebuilt fresh every sampling step and
/// mutated in place by successive filter/reweight stages.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    data: Vec<Candidate>,
    sorted: bool,
}

impl CandidateSet {
    /// Build the full candidate set from raw logits, one entry per
    /// vocabulary token, in token-id order.
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| Candidate {
                id: id as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        CandidateSet {
            data,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.data
    }

    /// Mutable access for external stages (e.g. grammar masking). Callers
    /// that reorder or reweight entries must call [`mark_unsorted`].
    ///
    /// [`mark_unsorted`]: CandidateSet::mark_unsorted
    pub fn candidates_mut(&mut self) -> &mut [Candidate] {
        &mut self.data
    }

    pub fn mark_unsorted(&mut self) {
        self.sorted = false;
    }

    fn sort_by_logit(&mut self) {
        if !self.sorted {
            self.data.sort_unstable_by(|a, b| {
                b.logit
                    .partial_cmp(&a.logit)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            self.sorted = true;
        }
    }

    /// Sort descending by logit and fill in normalized probabilities.
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.sort_by_logit();
        let max_logit = self.data[0].logit;
        let mut sum = 0.0f32;
        for c in &mut self.data {
            c.p = (c.logit - max_logit).exp();
            sum += c.p;
        }
        if sum > 0.0 {
            for c in &mut self.data {
                c.p /= sum;
            }
        }
    }

    /// Keep the `k` highest-logit candidates, flooring at `min_keep`.
    pub fn top_k(&mut self, k: usize, min_keep: usize) {
        let k = k.max(min_keep).min(self.data.len());
        self.sort_by_logit();
        self.data.truncate(k);
    }

    /// Nucleus filtering: keep the smallest prefix of the sorted
    /// distribution whose cumulative probability reaches `p`.
    pub fn top_p(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 {
            return;
        }
        self.softmax();
        let mut cum = 0.0f32;
        let mut last = self.data.len();
        for (i, c) in self.data.iter().enumerate() {
            cum += c.p;
            if cum >= p && i + 1 >= min_keep {
                last = i + 1;
                break;
            }
        }
        self.data.truncate(last);
    }

    /// Locally typical filtering: keep candidates whose surprise is
    /// closest to the distribution's entropy, up to cumulative mass `p`.
    pub fn typical(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 {
            return;
        }
        self.softmax();

        let entropy: f32 = self
            .data
            .iter()
            .filter(|c| c.p > 0.0)
            .map(|c| -c.p * c.p.ln())
            .sum();

        // Distance of each candidate's surprise from the entropy.
        let mut order: Vec<(usize, f32)> = self
            .data
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let surprise = if c.p > 0.0 {
                    -c.p.ln()
                } else {
                    f32::INFINITY
                };
                (i, (surprise - entropy).abs())
            })
            .collect();
        order.sort_unstable_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut cum = 0.0f32;
        let mut last = order.len();
        for (rank, &(idx, _)) in order.iter().enumerate() {
            cum += self.data[idx].p;
            if cum >= p && rank + 1 >= min_keep {
                last = rank + 1;
                break;
            }
        }

        self.data = order[..last]
            .iter()
            .map(|&(idx, _)| self.data[idx])
            .collect();
        self.sorted = false;
    }

    /// Scale logits by the inverse temperature.
    pub fn scale_temperature(&mut self, temperature: f32) {
        for c in &mut self.data {
            c.logit /= temperature;
        }
    }

    /// Truncate to the first `n` candidates in the current order.
    pub fn truncate(&mut self, n: usize) {
        self.data.truncate(n);
    }

    /// Blend classifier-free guidance logits into the primary
    /// distribution: `l = g + scale * (l - g)` over log-softmaxed values.
    /// Non-finite results are clamped so later stages stay well-defined.
    pub fn blend_guidance(&mut self, guidance_logits: &[f32], scale: f32) {
        let main = log_softmax(self.data.iter().map(|c| c.logit));
        let guide = log_softmax(guidance_logits.iter().copied());
        for ((c, m), g) in self.data.iter_mut().zip(main).zip(guide) {
            let blended = g + scale * (m - g);
            c.logit = if blended.is_finite() {
                blended
            } else {
                f32::NEG_INFINITY
            };
        }
        self.sorted = false;
    }

    /// Reduce the logit of every candidate present in `recent`. Positive
    /// logits are divided by the penalty, negative ones multiplied, so a
    /// penalty >= 1.0 never increases a logit.
    pub fn repetition_penalty(&mut self, recent: &HashSet<TokenId>, penalty: f32) {
        for c in &mut self.data {
            if recent.contains(&c.id) {
                if c.logit <= 0.0 {
                    c.logit *= penalty;
                } else {
                    c.logit /= penalty;
                }
            }
        }
        self.sorted = false;
    }

    /// Overwrite one candidate's logit (used to restore the newline logit
    /// after penalties when `penalize_nl` is off).
    pub fn restore_logit(&mut self, id: TokenId, logit: f32) {
        if let Some(c) = self.data.iter_mut().find(|c| c.id == id) {
            c.logit = logit;
            self.sorted = false;
        }
    }

    /// The highest-logit candidate in iteration order; ties go to the
    /// first occurrence (lowest token id when the set is still in id
    /// order), making greedy selection fully deterministic.
    pub fn greedy_token(&self) -> TokenId {
        let mut best = f32::NEG_INFINITY;
        let mut id = self.data.first().map(|c| c.id).unwrap_or(0);
        for c in &self.data {
            if c.logit > best {
                best = c.logit;
                id = c.id;
            }
        }
        id
    }

    /// Weighted random draw from the remaining distribution.
    fn draw(&mut self, rng: &mut StdRng) -> Candidate {
        self.softmax();
        let r: f32 = rng.gen();
        let mut cum = 0.0f32;
        for c in &self.data {
            cum += c.p;
            if r < cum {
                return *c;
            }
        }
        // Rounding slack: fall back to the last candidate.
        *self.data.last().expect("candidate set never empty")
    }
}

fn log_softmax(values: impl Iterator<Item = f32> + Clone) -> Vec<f32> {
    let max = values
        .clone()
        .fold(f32::NEG_INFINITY, f32::max);
    let log_sum = values
        .clone()
        .map(|v| (v - max).exp())
        .sum::<f32>()
        .ln();
    values.map(|v| v - max - log_sum).collect()
}

/// Fixed-capacity window over the most recently emitted tokens (prompt and
/// generated alike), used for repetition-penalty lookups. Oldest entries
/// are evicted on push once the window is full.
#[derive(Debug, Clone)]
pub struct TokenWindow {
    buf: VecDeque<TokenId>,
    capacity: usize,
}

impl TokenWindow {
    pub fn new(capacity: usize) -> Self {
        TokenWindow {
            buf: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, token: TokenId) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(token);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Iterate over the last `n` tokens (or fewer if the window is
    /// shorter).
    pub fn recent(&self, n: usize) -> impl Iterator<Item = TokenId> + '_ {
        self.buf
            .iter()
            .skip(self.buf.len().saturating_sub(n))
            .copied()
    }
}

/// Engine-derived constants and per-step inputs the sampler needs besides
/// the logits themselves.
#[derive(Debug, Clone, Copy)]
pub struct SampleInput<'a> {
    pub vocab_size: usize,
    pub context_length: usize,
    pub eos_token: TokenId,
    pub newline_token: TokenId,
    /// How many tokens were generated so far in this job.
    pub generated_len: usize,
    /// Logits from an auxiliary guidance context, if any.
    pub guidance_logits: Option<&'a [f32]>,
}

/// Stateful sampler for one job.
///
/// Carries the per-job mirostat state (`mu`) and the RNG stream explicitly,
/// initialized once per job and threaded through every call — no hidden
/// cross-call or cross-job state.
pub struct Sampler {
    config: SamplerConfig,
    mu: f32,
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler for one job. A supplied seed yields a reproducible
    /// RNG stream; otherwise the stream is entropy-seeded.
    pub fn new(config: SamplerConfig, seed: Option<u64>) -> Self {
        let mu = 2.0 * config.mirostat_tau;
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Sampler { config, mu, rng }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Current mirostat threshold state.
    pub fn mu(&self) -> f32 {
        self.mu
    }

    /// Select one token from raw logits under the configured policy.
    pub fn sample(
        &mut self,
        logits: &[f32],
        input: &SampleInput<'_>,
        window: &TokenWindow,
        mut grammar: Option<&mut (dyn Grammar + 'static)>,
    ) -> TokenId {
        let vocab = input.vocab_size.min(logits.len()).max(1);
        let mut logits = logits[..vocab.min(logits.len())].to_vec();

        // Experimental sampling both creative for text and pedantic for
        // math. May short-circuit the whole pipeline; its EOS boost
        // persists into the regular stages either way.
        if let Some(ref ped) = self.config.pedantic {
            if let Some(id) = pedantic::pedantic_pass(
                ped,
                &mut logits,
                input.eos_token,
                input.generated_len,
                input.context_length,
            ) {
                return id;
            }
        }

        let mut candidates = CandidateSet::from_logits(&logits);

        if let Some(guidance) = input.guidance_logits {
            candidates.blend_guidance(guidance, self.config.cfg_scale);
        }

        // Repetition penalties over the recent window.
        if !window.is_empty() && self.config.repeat_penalty != 1.0 {
            let repeat_last_n = if self.config.repeat_last_n < 0 {
                input.context_length
            } else {
                self.config.repeat_last_n as usize
            };
            let last_n = window.len().min(repeat_last_n).min(input.context_length);
            if last_n > 0 {
                let nl_logit = logits.get(input.newline_token as usize).copied();
                let recent: HashSet<TokenId> = window.recent(last_n).collect();
                candidates.repetition_penalty(&recent, self.config.repeat_penalty);
                if !self.config.penalize_nl {
                    if let Some(nl_logit) = nl_logit {
                        candidates.restore_logit(input.newline_token, nl_logit);
                    }
                }
            }
        }

        if let Some(g) = grammar.as_deref_mut() {
            g.constrain(&mut candidates);
        }

        let temperature = self.config.temperature;
        let top_k = if self.config.top_k <= 0 {
            vocab
        } else {
            (self.config.top_k as usize).min(vocab)
        };

        let id = if temperature <= 0.0 {
            candidates.greedy_token()
        } else {
            match self.config.mirostat {
                MirostatMode::V1 => {
                    candidates.scale_temperature(temperature);
                    self.mirostat_v1(&mut candidates, vocab)
                }
                MirostatMode::V2 => {
                    candidates.top_k(top_k, 1);
                    candidates.scale_temperature(temperature);
                    self.mirostat_v2(&mut candidates)
                }
                MirostatMode::Off => {
                    candidates.top_k(top_k, 1);
                    candidates.typical(self.config.typical_p, 1);
                    candidates.top_p(self.config.top_p, 1);
                    candidates.scale_temperature(temperature);
                    candidates.draw(&mut self.rng).id
                }
            }
        };

        if let Some(g) = grammar {
            g.advance(id);
        }

        id
    }

    /// Mirostat v1: estimate the distribution's Zipf exponent from the top
    /// candidates, derive a truncation size from the current `mu`, sample,
    /// then move `mu` toward the target surprise.
    fn mirostat_v1(&mut self, candidates: &mut CandidateSet, n_vocab: usize) -> TokenId {
        candidates.softmax();

        let pairs = 100.min(candidates.len().saturating_sub(1));
        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..pairs {
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let p_i = candidates.candidates()[i].p.max(f32::MIN_POSITIVE);
            let p_next = candidates.candidates()[i + 1].p.max(f32::MIN_POSITIVE);
            let b_i = (p_i / p_next).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }

        let s_hat = if sum_ti_sq > 0.0 {
            sum_ti_bi / sum_ti_sq
        } else {
            1.0
        };

        let epsilon_hat = s_hat - 1.0;
        let k = if epsilon_hat > 0.0 && s_hat.is_finite() {
            let k = ((epsilon_hat * 2.0f32.powf(self.mu))
                / (1.0 - (n_vocab as f32).powf(-epsilon_hat)))
            .powf(1.0 / s_hat);
            (k.round() as usize).clamp(1, candidates.len())
        } else {
            candidates.len()
        };

        candidates.top_k(k, 1);
        let chosen = candidates.draw(&mut self.rng);
        self.update_mu(chosen.p);
        chosen.id
    }

    /// Mirostat v2: drop candidates whose surprise exceeds `mu`, sample
    /// from the rest, then move `mu` toward the target surprise.
    fn mirostat_v2(&mut self, candidates: &mut CandidateSet) -> TokenId {
        candidates.softmax();

        let keep = candidates
            .candidates()
            .iter()
            .take_while(|c| -(c.p.max(f32::MIN_POSITIVE)).log2() <= self.mu)
            .count()
            .max(1);
        candidates.truncate(keep);

        let chosen = candidates.draw(&mut self.rng);
        self.update_mu(chosen.p);
        chosen.id
    }

    fn update_mu(&mut self, observed_p: f32) {
        let surprise = -(observed_p.max(f32::MIN_POSITIVE)).log2();
        self.mu -= self.config.mirostat_eta * (surprise - self.config.mirostat_tau);
    }
}
