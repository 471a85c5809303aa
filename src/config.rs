//! Configuration types for the voice-dialogue orchestrator.
//!
//! Loading configuration from files/env is an external collaborator (out of
//! scope); callers construct an [`EngineConfig`] directly, typically starting
//! from [`EngineConfig::default`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Edge audio format. Fixed at the boundary; multi-format is a non-goal.
    pub audio: AudioConfig,
    /// Wake/interrupt detector settings.
    pub detector: DetectorConfig,
    /// Verification engine settings.
    pub verify: VerifyConfig,
    /// Session lifecycle settings.
    pub session: SessionConfig,
    /// Observability-only latency thresholds.
    pub observability: ObservabilityConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            detector: DetectorConfig::default(),
            verify: VerifyConfig::default(),
            session: SessionConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Edge audio format: raw PCM, 16kHz, mono, 16-bit signed little-endian.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (mono only is supported at the boundary).
    pub channels: u16,
    /// Bit depth.
    pub bit_depth: u16,
    /// Below this many bytes, an utterance is discarded silently.
    ///
    /// Default is ~0.5s at 16kHz/16-bit mono: `16_000 * 2 * 0.5`.
    pub min_utterance_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bit_depth: 16,
            min_utterance_bytes: 16_000,
        }
    }
}

/// Wake/interrupt detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Phrases that wake the session from `interrupted`.
    pub wake_phrases: Vec<String>,
    /// Phrases that interrupt an active turn.
    pub interrupt_phrases: Vec<String>,
    /// Fuzzy-match sensitivity threshold, τ ∈ [0, 1].
    pub sensitivity: f32,
    /// Debounce interval between accepted positive classifications.
    pub debounce: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            wake_phrases: vec!["hey assistant".to_owned(), "ok assistant".to_owned()],
            interrupt_phrases: vec![
                "stop".to_owned(),
                "cancel".to_owned(),
                "wait".to_owned(),
                "never mind".to_owned(),
            ],
            sensitivity: 0.75,
            debounce: Duration::from_millis(1_000),
        }
    }
}

/// Which verification algorithm the engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Deterministic claim-extraction + similarity scoring. Default.
    Rule,
    /// Structured request to the language-model port; falls back to `Rule`
    /// on any failure.
    Llm,
}

/// Verification engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Whether verification runs at all. If `false`, replies bypass scoring entirely.
    pub enabled: bool,
    /// Which algorithm to use.
    pub mode: VerifyMode,
    /// τ_verify: minimum fraction of verified claims for an overall "verified" verdict.
    pub threshold: f32,
    /// Minimum sentence length (chars) to be considered a claim at all.
    pub min_claim_len: usize,
    /// Minimum best-match similarity for a claim to be marked verified.
    pub claim_match_threshold: f32,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: VerifyMode::Rule,
            threshold: 0.6,
            min_claim_len: 10,
            claim_match_threshold: 0.5,
        }
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity window before a session is reaped.
    pub session_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Observability-only thresholds; never gate behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Warn when a turn's end-to-end latency exceeds this.
    pub max_latency: Duration,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            max_latency: Duration::from_millis(2_500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.audio.sample_rate, 16_000);
        assert_eq!(cfg.audio.channels, 1);
        assert_eq!(cfg.audio.bit_depth, 16);
        assert_eq!(cfg.audio.min_utterance_bytes, 16_000);
        assert!((cfg.verify.threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(cfg.verify.mode, VerifyMode::Rule);
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: EngineConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.audio.sample_rate, cfg.audio.sample_rate);
        assert_eq!(back.detector.wake_phrases, cfg.detector.wake_phrases);
    }
}
