//! Conversation memory: a per-conversation append-only message log,
//! optionally mirrored through a write-through port to an external vector
//! store.

use crate::ports::VectorStoreSink;
use crate::session::ConversationId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Opaque message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// A message role.
pub use crate::ports::Role;

/// A citation backing part of an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// e.g. `api:status`, `conversation:user`, `general_knowledge`.
    pub source: String,
    pub verified: bool,
    pub snippet: String,
    pub claim_type: ClaimType,
}

/// The claim-type taxonomy used by the verification engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    Factual,
    Numerical,
    Temporal,
    Reference,
    Opinion,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub created_at: SystemTime,
    pub citations: Vec<Citation>,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            text: text.into(),
            created_at: SystemTime::now(),
            citations: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = citations;
        self
    }
}

/// An ordered, append-only conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: ConversationId,
    pub messages: Vec<Message>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Conversation {
    fn new(id: ConversationId) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = SystemTime::now();
    }
}

/// Conversation memory for one conversation: the in-memory log plus an
/// optional write-through sink mirroring appends to an external store.
///
/// The sink is never awaited on the critical path: failures are logged
/// and never propagated.
pub struct ConversationMemory {
    conversation: Mutex<Conversation>,
    sink: Arc<dyn VectorStoreSink>,
}

impl ConversationMemory {
    #[must_use]
    pub fn new(id: ConversationId, sink: Arc<dyn VectorStoreSink>) -> Self {
        Self {
            conversation: Mutex::new(Conversation::new(id)),
            sink,
        }
    }

    #[must_use]
    pub fn with_default_sink(id: ConversationId) -> Self {
        Self::new(id, Arc::new(crate::ports::NullVectorStoreSink))
    }

    /// Append `message` to the conversation, then fire-and-forget the
    /// write-through to the external sink. The sink write is spawned onto
    /// its own task rather than awaited here, so a slow or stuck sink never
    /// stalls the turn that's appending.
    pub async fn append(&self, message: Message) {
        let (conversation_id, to_mirror) = {
            let mut conversation = self.conversation.lock().await;
            let id = conversation.id;
            conversation.push(message.clone());
            (id, message)
        };

        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(err) = sink.write(conversation_id, to_mirror).await {
                tracing::warn!(error = %err, "vector store write-through failed");
            }
        });
    }

    /// Materialize the conversation as `ConversationTurn`s, in order, for
    /// handing to the generator.
    pub async fn as_turns(&self) -> Vec<crate::ports::ConversationTurn> {
        self.conversation
            .lock()
            .await
            .messages
            .iter()
            .map(|m| crate::ports::ConversationTurn {
                role: m.role,
                text: m.text.clone(),
            })
            .collect()
    }

    /// A snapshot of the most recent `n` messages, oldest first.
    pub async fn recent(&self, n: usize) -> Vec<Message> {
        let conversation = self.conversation.lock().await;
        let start = conversation.messages.len().saturating_sub(n);
        conversation.messages[start..].to_vec()
    }

    pub async fn len(&self) -> usize {
        self.conversation.lock().await.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_preserves_order() {
        let memory = ConversationMemory::with_default_sink(ConversationId::new());
        memory.append(Message::new(Role::User, "hi")).await;
        memory
            .append(Message::new(Role::Assistant, "hello"))
            .await;
        let turns = memory.as_turns().await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "hi");
        assert_eq!(turns[1].text, "hello");
    }

    #[tokio::test]
    async fn recent_returns_tail_only() {
        let memory = ConversationMemory::with_default_sink(ConversationId::new());
        for i in 0..5 {
            memory
                .append(Message::new(Role::User, format!("msg {i}")))
                .await;
        }
        let recent = memory.recent(2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "msg 3");
        assert_eq!(recent[1].text, "msg 4");
    }

    struct FailingSink;

    #[async_trait::async_trait]
    impl VectorStoreSink for FailingSink {
        async fn write(
            &self,
            _conversation_id: ConversationId,
            _message: Message,
        ) -> crate::error::Result<()> {
            Err(crate::error::VoxturnError::Channel("boom".to_owned()))
        }
    }

    #[tokio::test]
    async fn sink_failure_does_not_block_append() {
        let memory = ConversationMemory::new(ConversationId::new(), Arc::new(FailingSink));
        memory.append(Message::new(Role::User, "hi")).await;
        assert_eq!(memory.len().await, 1);
    }
}
