//! Event multiplexer: an ordered, lossless, back-pressured event
//! stream per session.
//!
//! Delivery is single-producer / single-consumer. There is no `try_send`
//! anywhere in this module: if the consumer is slow, `.send().await` blocks
//! the producer, because a dropped event is worse than a stalled one.

use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Channel capacity between the pipeline and the transport adapter. Small
/// and bounded on purpose: the point is to surface back-pressure quickly,
/// not to absorb bursts.
const EVENT_CHANNEL_SIZE: usize = 32;

/// One event on a session's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: SessionId,
    pub seq: u64,
    pub kind: EventKind,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Reason a session was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    User,
    Timeout,
    Error,
}

/// Verification verdict summary carried on `generation.end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictSummary {
    pub verified: bool,
    pub confidence: f32,
    pub citations: Vec<crate::memory::Citation>,
}

/// Every observable event a session can emit, from session creation
/// through a finished or interrupted turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    AudioChunk {
        size: usize,
        sample_rate: u32,
        channels: u16,
    },
    AudioEnd,
    TranscriptPartial {
        text: String,
        confidence: Option<f32>,
    },
    TranscriptFinal {
        text: String,
        confidence: Option<f32>,
    },
    GenerationStart,
    GenerationChunk {
        token: String,
    },
    GenerationEnd {
        text: String,
        verification: VerdictSummary,
    },
    SynthesisStart,
    SynthesisChunk {
        audio: Vec<u8>,
    },
    SynthesisStop,
    SynthesisEnd,
    SessionCreated {
        conversation_id: crate::session::ConversationId,
    },
    SessionInterrupted {
        reason: InterruptReason,
    },
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
}

/// Per-session event bus: one producer handle used by the pipeline, a
/// single consumer handed to the transport adapter at session creation.
pub struct EventBus {
    session_id: SessionId,
    seq: AtomicU64,
    sender: mpsc::Sender<Event>,
}

impl EventBus {
    /// Create a bus and its paired receiver. The receiver is meant for
    /// exactly one consumer (the transport adapter for this session).
    #[must_use]
    pub fn new(session_id: SessionId) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let bus = Arc::new(Self {
            session_id,
            seq: AtomicU64::new(0),
            sender,
        });
        (bus, receiver)
    }

    /// Publish `kind`, blocking if the consumer is behind. Returns `Err`
    /// only if the consumer has been dropped, in which case the caller
    /// should treat the session as detached.
    pub async fn emit(&self, kind: EventKind) -> Result<(), crate::error::VoxturnError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            session_id: self.session_id,
            seq,
            kind,
            at: chrono::Utc::now(),
        };
        self.sender
            .send(event)
            .await
            .map_err(|_| crate::error::VoxturnError::Channel("event consumer dropped".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_numbers_are_monotonic() {
        let (bus, mut rx) = EventBus::new(SessionId::new());
        bus.emit(EventKind::GenerationStart).await.unwrap();
        bus.emit(EventKind::GenerationChunk {
            token: "hi".to_owned(),
        })
        .await
        .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
    }

    #[tokio::test]
    async fn emit_after_consumer_drop_errors() {
        let (bus, rx) = EventBus::new(SessionId::new());
        drop(rx);
        let result = bus.emit(EventKind::AudioEnd).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn full_channel_back_pressures_producer() {
        let (bus, mut rx) = EventBus::new(SessionId::new());
        // Fill the channel beyond capacity on a background task; the
        // producer must block rather than drop, so we drain concurrently.
        let bus2 = Arc::clone(&bus);
        let producer = tokio::spawn(async move {
            for _ in 0..(EVENT_CHANNEL_SIZE * 2) {
                bus2.emit(EventKind::AudioEnd).await.unwrap();
            }
        });
        let mut received = 0;
        while received < EVENT_CHANNEL_SIZE * 2 {
            if rx.recv().await.is_some() {
                received += 1;
            }
        }
        producer.await.unwrap();
        assert_eq!(received, EVENT_CHANNEL_SIZE * 2);
    }
}
