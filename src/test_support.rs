//! Mock capability-port implementations used by this crate's tests.
//!
//! Not part of the engine's supported API surface; kept public only
//! because integration tests under `tests/` live in a separate crate and
//! need access to the same mocks as the inline unit tests.

use crate::error::{Result, VoxturnError};
use crate::ports::{BoxFuture, ContextSnapshot, ConversationTurn, Generator, Synthesizer, Transcriber, TokenStream};
use async_trait::async_trait;
use futures::stream;
use std::sync::Mutex;

/// A transcriber that always returns a fixed string, or always fails.
pub struct FixedTranscriber {
    outcome: Result<String>,
}

impl FixedTranscriber {
    #[must_use]
    pub fn ok(text: &str) -> Self {
        Self {
            outcome: Ok(text.to_owned()),
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            outcome: Err(VoxturnError::Transcription("mock failure".to_owned())),
        }
    }
}

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _wav_bytes: Vec<u8>) -> Result<String> {
        match &self.outcome {
            Ok(text) => Ok(text.clone()),
            Err(_) => Err(VoxturnError::Transcription("mock failure".to_owned())),
        }
    }
}

/// A generator that streams a fixed sequence of tokens, or fails before
/// producing any.
pub struct FixedGenerator {
    tokens: Vec<String>,
    fail_before_first_token: bool,
}

impl FixedGenerator {
    #[must_use]
    pub fn tokens(tokens: Vec<&str>) -> Self {
        Self {
            tokens: tokens.into_iter().map(str::to_owned).collect(),
            fail_before_first_token: false,
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            tokens: Vec::new(),
            fail_before_first_token: true,
        }
    }
}

#[async_trait]
impl Generator for FixedGenerator {
    async fn generate(
        &self,
        _conversation: &[ConversationTurn],
        _context: &ContextSnapshot,
    ) -> Result<TokenStream> {
        if self.fail_before_first_token {
            return Err(VoxturnError::Generation("mock failure".to_owned()));
        }
        let tokens = self.tokens.clone();
        Ok(Box::pin(stream::iter(tokens.into_iter().map(Ok))))
    }
}

/// A synthesizer that records every chunk of text it was asked to
/// synthesize and invokes the callback with a single placeholder chunk.
#[derive(Default)]
pub struct FixedSynthesizer {
    pub synthesized: Mutex<Vec<String>>,
}

#[async_trait]
impl Synthesizer for FixedSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        on_chunk: &mut (dyn FnMut(Vec<u8>) -> BoxFuture<'_, Result<()>> + Send),
    ) -> Result<()> {
        self.synthesized.lock().expect("mutex poisoned").push(text.to_owned());
        on_chunk(vec![0u8; 4]).await
    }
}

/// A synthesizer that always fails, to exercise per-sentence error
/// swallowing.
pub struct FailingSynthesizer;

#[async_trait]
impl Synthesizer for FailingSynthesizer {
    async fn synthesize(
        &self,
        _text: &str,
        _on_chunk: &mut (dyn FnMut(Vec<u8>) -> BoxFuture<'_, Result<()>> + Send),
    ) -> Result<()> {
        Err(VoxturnError::Synthesis("mock failure".to_owned()))
    }
}

/// A synthesizer that fails its first `fail_count` calls, then succeeds.
/// Used to exercise the retry path in `dispatch_sentence`.
pub struct FlakySynthesizer {
    remaining_failures: Mutex<u32>,
}

impl FlakySynthesizer {
    #[must_use]
    pub fn failing_then_ok(fail_count: u32) -> Self {
        Self {
            remaining_failures: Mutex::new(fail_count),
        }
    }
}

#[async_trait]
impl Synthesizer for FlakySynthesizer {
    async fn synthesize(
        &self,
        _text: &str,
        on_chunk: &mut (dyn FnMut(Vec<u8>) -> BoxFuture<'_, Result<()>> + Send),
    ) -> Result<()> {
        let should_fail = {
            let mut remaining = self.remaining_failures.lock().expect("mutex poisoned");
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        };
        if should_fail {
            return Err(VoxturnError::Synthesis("mock transient failure".to_owned()));
        }
        on_chunk(vec![0u8; 4]).await
    }
}

/// A context provider that always returns the same snapshot.
pub struct StaticContextProvider {
    snapshot: ContextSnapshot,
}

impl StaticContextProvider {
    #[must_use]
    pub fn new(snapshot: ContextSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl crate::ports::ContextProvider for StaticContextProvider {
    async fn snapshot(&self) -> Result<ContextSnapshot> {
        Ok(self.snapshot.clone())
    }
}
