//! The "pedantic token" heuristic.
//!
//! An experimental sampling override for math-, code-, and JSON-heavy
//! output: tokens like digits and brackets are legitimately repetitive, so
//! when one of them is already the most probable candidate it is emitted
//! as-is, bypassing penalties and stochastic filtering that would otherwise
//! suppress it. A length-dependent boost to the end-of-sequence logit biases
//! long generations toward terminating.
//!
//! This is a heuristic override, not statistically principled, and the
//! allow-list hardcodes ids from one specific SentencePiece vocabulary —
//! treat it as experimental and model-specific.

use serde::Deserialize;

use crate::engine::TokenId;

/// Tokens frequently used for math, coding, and JSON. Repetition of these
/// is expected, so they bypass the regular pipeline when already on top.
pub const PEDANTIC_TOKENS: [TokenId; 24] = [
    29900, // "0"
    29896, // "1"
    29906, // "2"
    29941, // "3"
    29946, // "4"
    29945, // "5"
    29953, // "6"
    29955, // "7"
    29947, // "8"
    29929, // "9"
    29922, // "="
    29912, // "{"
    426,   // " {"
    29913, // "}"
    500,   // " }"
    29961, // "["
    518,   // " ["
    29962, // "]"
    4514,  // " ]"
    29898, // "("
    313,   // " ("
    29897, // ")"
    1723,  // " )"
    29901, // ":"
];

/// Configuration for the pedantic-token heuristic.
#[derive(Debug, Clone, Deserialize)]
pub struct PedanticConfig {
    /// Heuristic version. Only version 1 is defined; other values disable
    /// the pass.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Scale of the end-of-sequence boost: the EOS logit is multiplied by
    /// `1 + eos_boost * generated / context_length`.
    #[serde(default = "default_eos_boost")]
    pub eos_boost: f32,
}

fn default_version() -> u32 {
    1
}
fn default_eos_boost() -> f32 {
    10.0
}

impl Default for PedanticConfig {
    fn default() -> Self {
        PedanticConfig {
            version: default_version(),
            eos_boost: default_eos_boost(),
        }
    }
}

/// Run the pedantic pass over raw logits.
///
/// Boosts the end-of-sequence logit in place (the boost deliberately
/// persists into the regular pipeline when the pass does not short-circuit),
/// then returns the arg-max token if it is on the allow-list, or `None` to
/// fall through to regular sampling.
pub(crate) fn pedantic_pass(
    config: &PedanticConfig,
    logits: &mut [f32],
    eos_token: TokenId,
    generated_len: usize,
    context_length: usize,
) -> Option<TokenId> {
    if config.version != 1 || logits.is_empty() {
        return None;
    }

    // Help <EOS> pop up to avoid overly long generations.
    if context_length > 0 {
        if let Some(eos_logit) = logits.get_mut(eos_token as usize) {
            let coeff = 1.0 + config.eos_boost * generated_len as f32 / context_length as f32;
            *eos_logit *= coeff;
        }
    }

    // Token 0 is skipped, same as the deterministic top-token scan.
    let mut id: TokenId = 0;
    let mut best = f32::NEG_INFINITY;
    for (i, &logit) in logits.iter().enumerate().skip(1) {
        if logit > best {
            id = i as TokenId;
            best = logit;
        }
    }

    if PEDANTIC_TOKENS.contains(&id) {
        Some(id)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_top_allowlisted_token() {
        let mut logits = vec![0.0f32; 30000];
        logits[29922] = 5.0; // "="
        let config = PedanticConfig::default();
        assert_eq!(pedantic_pass(&config, &mut logits, 2, 0, 1024), Some(29922));
    }

    #[test]
    fn falls_through_when_top_token_not_listed() {
        let mut logits = vec![0.0f32; 30000];
        logits[100] = 5.0;
        let config = PedanticConfig::default();
        assert_eq!(pedantic_pass(&config, &mut logits, 2, 0, 1024), None);
    }

    #[test]
    fn eos_boost_grows_with_generated_length() {
        let mut logits = vec![0.0f32; 30000];
        logits[2] = 1.0;
        logits[100] = 5.0;
        let config = PedanticConfig::default();
        // generated 512 of 1024 => coeff = 1 + 10 * 0.5 = 6.0
        pedantic_pass(&config, &mut logits, 2, 512, 1024);
        assert!((logits[2] - 6.0).abs() < 1e-5);
    }

    #[test]
    fn disabled_version_is_inert() {
        let mut logits = vec![0.0f32; 30000];
        logits[2] = 1.0;
        logits[29922] = 5.0;
        let config = PedanticConfig {
            version: 0,
            ..Default::default()
        };
        assert_eq!(pedantic_pass(&config, &mut logits, 2, 512, 1024), None);
        // No boost applied either.
        assert!((logits[2] - 1.0).abs() < 1e-6);
    }
}
