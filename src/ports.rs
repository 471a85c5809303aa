//! Capability ports: the three narrow interfaces the engine consumes
//! from upstream providers, plus the read-only context accessor.
//!
//! None of these traits say anything about HTTP, gRPC, or any wire format —
//! that is the concrete provider's business. The engine only ever talks to
//! these trait objects.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// `(wav_bytes) -> text`. Retryable; idempotent.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav_bytes: Vec<u8>) -> Result<String>;
}

/// One turn of conversation handed to the generator, in order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

/// A message role, mirroring `memory::Message::role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A lazily-produced stream of token strings.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// `(conversation, context) -> async sequence of token-strings`.
/// Cancellable by dropping the returned stream; retryable only before the
/// first item has been observed (enforced by the pipeline, not this trait).
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        conversation: &[ConversationTurn],
        context: &ContextSnapshot,
    ) -> Result<TokenStream>;
}

/// A boxed future, used for the synthesis chunk callback.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `(text, on_chunk(audio)) -> completion`. Cancellable; retryable.
///
/// `on_chunk` is invoked once per produced audio chunk, in order. The
/// pipeline's callback re-checks liveness (state, response id) before each
/// invocation returns control to the synthesizer, so a synthesizer must
/// await each call before producing the next chunk.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        on_chunk: &mut (dyn FnMut(Vec<u8>) -> BoxFuture<'_, Result<()>> + Send),
    ) -> Result<()>;
}

/// A snapshot of external context, treated as immutable for one invocation.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ContextSnapshot {
    /// Opaque label -> JSON-like value, e.g. `api:status` -> `"healthy"`.
    pub data: BTreeMap<String, serde_json::Value>,
    /// Recent conversation slice, most relevant to this turn.
    pub recent_turns: Vec<ConversationTurn>,
    /// Free-text knowledge-base snippets.
    pub knowledge_base: Vec<String>,
}

/// Read-only accessor for the currently cached external-API data.
/// Refresh cadence is the provider's concern; the engine treats each
/// returned snapshot as immutable for the duration of one call.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn snapshot(&self) -> Result<ContextSnapshot>;
}

/// Write-through sink for conversation messages mirrored to an external
/// vector store. Never on the critical path: failures are logged by the
/// caller and never propagated.
#[async_trait]
pub trait VectorStoreSink: Send + Sync {
    async fn write(&self, conversation_id: crate::session::ConversationId, message: crate::memory::Message) -> Result<()>;
}

/// Default no-op sink, used when no external vector store is configured.
pub struct NullVectorStoreSink;

#[async_trait]
impl VectorStoreSink for NullVectorStoreSink {
    async fn write(&self, _conversation_id: crate::session::ConversationId, _message: crate::memory::Message) -> Result<()> {
        Ok(())
    }
}
