//! Tests for sampler configuration.

use llamapod::sampling::{MirostatMode, SamplerConfig};

#[test]
fn test_default_sampler() {
    let config = SamplerConfig::default();
    assert_eq!(config.temperature, 0.8);
    assert_eq!(config.top_k, 40);
    assert_eq!(config.top_p, 0.95);
    assert_eq!(config.typical_p, 1.0);
    assert_eq!(config.repeat_penalty, 1.10);
    assert_eq!(config.repeat_last_n, -1);
    assert!(config.penalize_nl);
    assert_eq!(config.mirostat, MirostatMode::Off);
    assert!(config.pedantic.is_none());
}

#[test]
fn test_greedy_sampler() {
    let config = SamplerConfig::greedy();
    assert_eq!(config.temperature, 0.0);
    // Everything else keeps its default.
    assert_eq!(config.top_k, 40);
}

#[test]
fn test_sampler_from_json() {
    let json = r#"{
        "temperature": 0.5,
        "top_k": 100,
        "top_p": 0.9,
        "repeat_penalty": 1.2,
        "mirostat": "v1",
        "mirostat_tau": 4.0
    }"#;

    let config: SamplerConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.temperature, 0.5);
    assert_eq!(config.top_k, 100);
    assert_eq!(config.top_p, 0.9);
    assert_eq!(config.repeat_penalty, 1.2);
    assert_eq!(config.mirostat, MirostatMode::V1);
    assert_eq!(config.mirostat_tau, 4.0);
    // Unnamed fields fall back to defaults.
    assert_eq!(config.mirostat_eta, 0.1);
}

#[test]
fn test_pedantic_from_json() {
    let json = r#"{ "pedantic": { "eos_boost": 5.0 } }"#;
    let config: SamplerConfig = serde_json::from_str(json).unwrap();
    let pedantic = config.pedantic.expect("pedantic section parsed");
    assert_eq!(pedantic.version, 1);
    assert_eq!(pedantic.eos_boost, 5.0);
}

#[test]
fn test_unknown_mirostat_mode_rejected() {
    let json = r#"{ "mirostat": "v3" }"#;
    assert!(serde_json::from_str::<SamplerConfig>(json).is_err());
}
