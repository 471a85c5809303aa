//! Error types for the voice-dialogue orchestrator.

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum VoxturnError {
    /// Upstream transcription call failed (after retries).
    #[error("transcription failed: {0}")]
    Transcription(String),

    /// Upstream language-model generation failed mid-stream.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Upstream speech synthesis call failed for one sentence.
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// Verification engine could not produce a verdict.
    #[error("verification unavailable: {0}")]
    VerificationUnavailable(String),

    /// An upstream's circuit breaker is open.
    #[error("upstream circuit open: {0:?}")]
    CircuitOpen(crate::resilience::UpstreamKind),

    /// An upstream's token bucket has no tokens available.
    #[error("upstream rate limited: {0:?}")]
    RateLimited(crate::resilience::UpstreamKind),

    /// An upstream call exceeded its hard timeout.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Referenced session does not exist in the store.
    #[error("session not found: {0}")]
    SessionNotFound(crate::session::SessionId),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// Internal channel closed unexpectedly.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoxturnError>;

impl VoxturnError {
    /// Whether this error leaves the owning session usable (`idle`) or
    /// forces session teardown. Mirrors the `recoverable` flag carried on
    /// `EventKind::Error`.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        !matches!(self, Self::SessionNotFound(_))
    }

    /// The stable error code surfaced on `EventKind::Error`.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transcription(_) => "transcription_failed",
            Self::Generation(_) => "generation_failed",
            Self::Synthesis(_) => "synthesis_failed",
            Self::VerificationUnavailable(_) => "verification_unavailable",
            Self::CircuitOpen(_) => "upstream_circuit_open",
            Self::RateLimited(_) => "upstream_rate_limited",
            Self::Timeout(_) => "timeout",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Config(_) => "config",
            Self::Channel(_) => "channel",
        }
    }
}
