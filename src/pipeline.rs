//! Pipeline engine: the central per-session turn state machine.
//!
//! One logical task drives a session through `listening -> processing ->
//! speaking -> idle`, fanning the generator's token stream into a
//! sentence-boundary pump, dispatching synthesis, verifying the reply, and
//! propagating interrupts. Every side-effecting emit re-checks the turn's
//! liveness (session state plus `active_response_id`) immediately before
//! acting, so a stale turn's generation or synthesis callbacks never reach
//! the event bus after a newer turn has started.

use crate::audio::{AudioGate, GateOutcome};
use crate::config::EngineConfig;
use crate::detector::{ClassifyKind, Detector};
use crate::error::{Result, VoxturnError};
use crate::events::{Event, EventBus, EventKind, InterruptReason, VerdictSummary};
use crate::memory::{ConversationMemory, Message, Role};
use crate::ports::{BoxFuture, ContextProvider, Generator, Synthesizer, Transcriber, VectorStoreSink};
use crate::resilience::{global_breaker, global_rate_limiters, UpstreamKind};
use crate::session::{ConversationId, ResponseId, SessionId, SessionState, SessionStore};
use crate::verify::Verifier;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Per-session mutable resources that are not part of the durable
/// `Session` record: the audio gate, detector debounce state, and the
/// event bus handle.
struct SessionRuntime {
    gate: AudioGate,
    detector: Detector,
    bus: Arc<EventBus>,
    /// Advisory flag a long-running synthesis call can poll; the
    /// authoritative liveness check is always state + `active_response_id`.
    interrupt_flag: Arc<AtomicBool>,
}

/// The pipeline engine: holds the session store, per-session runtime
/// state, conversation memories, and handles to the three capability
/// ports plus the context provider.
pub struct PipelineEngine {
    config: EngineConfig,
    sessions: SessionStore,
    runtimes: Mutex<HashMap<SessionId, Arc<Mutex<SessionRuntime>>>>,
    conversations: Mutex<HashMap<ConversationId, Arc<ConversationMemory>>>,
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn Generator>,
    synthesizer: Arc<dyn Synthesizer>,
    context_provider: Arc<dyn ContextProvider>,
    vector_sink: Arc<dyn VectorStoreSink>,
    verifier: Verifier,
}

impl PipelineEngine {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn Generator>,
        synthesizer: Arc<dyn Synthesizer>,
        context_provider: Arc<dyn ContextProvider>,
        vector_sink: Arc<dyn VectorStoreSink>,
    ) -> Self {
        let verifier = Verifier::new(config.verify.clone());
        Self {
            config,
            sessions: SessionStore::new(),
            runtimes: Mutex::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
            transcriber,
            generator,
            synthesizer,
            context_provider,
            vector_sink,
            verifier,
        }
    }

    /// Create a new session. Returns its id and the receiving half of its
    /// event stream, meant for exactly one transport-side consumer.
    pub async fn create_session(&self) -> (SessionId, mpsc::Receiver<Event>) {
        let handle = self.sessions.create().await;
        let (id, conversation_id) = {
            let session = handle.lock().await;
            (session.id, session.conversation_id)
        };

        let (bus, rx) = EventBus::new(id);
        let runtime = SessionRuntime {
            gate: AudioGate::new(self.config.audio),
            detector: Detector::new(self.config.detector.clone()),
            bus: Arc::clone(&bus),
            interrupt_flag: Arc::new(AtomicBool::new(false)),
        };
        self.runtimes.lock().await.insert(id, Arc::new(Mutex::new(runtime)));
        self.conversations.lock().await.insert(
            conversation_id,
            Arc::new(ConversationMemory::new(conversation_id, Arc::clone(&self.vector_sink))),
        );

        bus.emit(EventKind::SessionCreated { conversation_id }).await.ok();
        (id, rx)
    }

    /// Tear down a session: drops its runtime state and removes it from
    /// the store.
    pub async fn end_session(&self, session_id: SessionId) {
        self.sessions.end(session_id).await;
        self.runtimes.lock().await.remove(&session_id);
    }

    /// Reap sessions idle longer than the configured timeout.
    pub async fn reap_idle_sessions(&self) -> Vec<SessionId> {
        let reaped = self.sessions.reap(self.config.session.session_timeout).await;
        let mut runtimes = self.runtimes.lock().await;
        for id in &reaped {
            runtimes.remove(id);
        }
        reaped
    }

    /// Ingest one captured audio frame. Only extends the buffer while the
    /// session is `idle` or `listening`; frames arriving mid-turn
    /// (`processing`/`speaking`/`interrupted`) are dropped outright.
    pub async fn on_audio_chunk(&self, session_id: SessionId, frame: &[u8]) -> Result<()> {
        let state = self.state_of(session_id).await?;
        if !matches!(state, SessionState::Idle | SessionState::Listening) {
            return Ok(());
        }
        // `listening -> listening` is a legal self-transition; this also
        // touches the session's activity timestamp on every inbound frame.
        self.sessions.transition(session_id, SessionState::Listening).await?;
        let runtime = self.runtime(session_id).await?;
        runtime.lock().await.gate.push(frame);
        Ok(())
    }

    /// Close the current utterance. Spawns a turn if the buffer
    /// qualifies; otherwise returns the session to `idle` silently.
    pub async fn on_audio_end(self: &Arc<Self>, session_id: SessionId) -> Result<()> {
        let runtime = self.runtime(session_id).await?;
        let (outcome, bus) = {
            let mut rt = runtime.lock().await;
            (rt.gate.close(), Arc::clone(&rt.bus))
        };
        bus.emit(EventKind::AudioEnd).await.ok();

        match outcome {
            GateOutcome::TooShort => {
                self.sessions.transition(session_id, SessionState::Idle).await?;
            }
            GateOutcome::Qualifying(wav) => {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = engine.run_turn_from_audio(session_id, wav).await {
                        tracing::warn!(error = %err, %session_id, "turn failed");
                    }
                });
            }
        }
        Ok(())
    }

    /// Submit a transcript the transport obtained itself, bypassing the
    /// transcriber port entirely. Partial transcripts are only ever
    /// echoed as events; a final transcript starts a turn.
    pub async fn submit_transcript(self: &Arc<Self>, session_id: SessionId, text: String, is_final: bool) -> Result<()> {
        let bus = self.bus_of(session_id).await?;
        if !is_final {
            bus.emit(EventKind::TranscriptPartial { text, confidence: None }).await.ok();
            return Ok(());
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = engine.run_turn_common(session_id, text).await {
                tracing::warn!(error = %err, %session_id, "turn failed");
            }
        });
        Ok(())
    }

    /// Interrupt a session. Returns `false` (no-op, no event) if the
    /// session was not `processing` or `speaking`.
    pub async fn interrupt(&self, session_id: SessionId, reason: InterruptReason) -> Result<bool> {
        let handle = self.sessions.get(session_id).await?;
        let was_speaking = handle.lock().await.state == SessionState::Speaking;

        if !self.sessions.interrupt(session_id).await? {
            return Ok(false);
        }

        if let Ok(runtime) = self.runtime(session_id).await {
            let mut rt = runtime.lock().await;
            rt.interrupt_flag.store(true, Ordering::SeqCst);
            rt.gate.clear();
        }

        let bus = self.bus_of(session_id).await?;
        if was_speaking {
            bus.emit(EventKind::SynthesisStop).await.ok();
        }
        bus.emit(EventKind::SessionInterrupted { reason }).await.ok();
        Ok(true)
    }

    async fn run_turn_from_audio(self: Arc<Self>, session_id: SessionId, wav: Vec<u8>) -> Result<()> {
        self.sessions.transition(session_id, SessionState::Processing).await?;
        let bus = self.bus_of(session_id).await?;

        let transcriber = Arc::clone(&self.transcriber);
        let text = match call_with_resilience(UpstreamKind::Transcription, 3, move || {
            let transcriber = Arc::clone(&transcriber);
            let wav = wav.clone();
            async move { transcriber.transcribe(wav).await }
        })
        .await
        {
            Ok(text) => text,
            Err(err) => {
                bus.emit(EventKind::Error {
                    code: "transcription_failed".to_string(),
                    message: err.to_string(),
                    recoverable: true,
                })
                .await
                .ok();
                self.sessions.transition(session_id, SessionState::Idle).await?;
                return Ok(());
            }
        };

        if text.trim().is_empty() {
            self.sessions.transition(session_id, SessionState::Idle).await?;
            return Ok(());
        }

        self.run_turn_common(session_id, text).await
    }

    /// Runs a full turn from a finalized transcript: wake/interrupt
    /// classification, generation, sentence-level synthesis, and
    /// verification. Shared by the audio and text-injection entry points.
    async fn run_turn_common(self: Arc<Self>, session_id: SessionId, raw_transcript: String) -> Result<()> {
        let bus = self.bus_of(session_id).await?;
        let state = self.state_of(session_id).await?;

        let classification = {
            let runtime = self.runtime(session_id).await?;
            let result = runtime.lock().await.detector.classify(&raw_transcript);
            result
        };

        let user_input = match (state, classification) {
            (SessionState::Speaking, Some(c)) if c.kind == ClassifyKind::Interrupt => {
                self.interrupt(session_id, InterruptReason::User).await?;
                return Ok(());
            }
            (SessionState::Interrupted, Some(c)) if c.kind == ClassifyKind::Wake => {
                let tail = Detector::extract_command_after_wake(&raw_transcript, &c.matched);
                if tail.is_empty() {
                    bus.emit(EventKind::TranscriptFinal {
                        text: raw_transcript.clone(),
                        confidence: None,
                    })
                    .await
                    .ok();
                    return Ok(());
                }
                self.sessions.transition(session_id, SessionState::Processing).await?;
                tail
            }
            (state, Some(c)) if state != SessionState::Interrupted && c.kind == ClassifyKind::Wake => {
                let tail = Detector::extract_command_after_wake(&raw_transcript, &c.matched);
                if tail.is_empty() {
                    return Ok(());
                }
                self.sessions.transition(session_id, SessionState::Processing).await?;
                tail
            }
            _ => {
                self.sessions.transition(session_id, SessionState::Processing).await?;
                raw_transcript.clone()
            }
        };

        bus.emit(EventKind::TranscriptFinal {
            text: user_input.clone(),
            confidence: None,
        })
        .await
        .ok();
        let conversation = self.conversation_of(session_id).await?;
        conversation.append(Message::new(Role::User, user_input.clone())).await;

        // Mint the response id, invalidating any previous one.
        let handle = self.sessions.get(session_id).await?;
        let response_id = handle.lock().await.begin_response();
        if let Ok(runtime) = self.runtime(session_id).await {
            runtime.lock().await.interrupt_flag.store(false, Ordering::SeqCst);
        }

        // Begin generation.
        bus.emit(EventKind::GenerationStart).await.ok();
        let context = self.context_provider.snapshot().await.unwrap_or_default();
        let turns = conversation.as_turns().await;

        let generator = Arc::clone(&self.generator);
        let context_for_retry = context.clone();
        let mut stream = match call_with_resilience(UpstreamKind::Generation, 2, move || {
            let generator = Arc::clone(&generator);
            let turns = turns.clone();
            let context = context_for_retry.clone();
            async move { generator.generate(&turns, &context).await }
        })
        .await
        {
            Ok(stream) => stream,
            Err(err) => {
                bus.emit(EventKind::Error {
                    code: "generation_failed".to_string(),
                    message: err.to_string(),
                    recoverable: true,
                })
                .await
                .ok();
                self.sessions.transition(session_id, SessionState::Idle).await?;
                return Ok(());
            }
        };

        // Sentence-level streaming: tokens accumulate until a sentence
        // boundary is found, then that sentence is dispatched to synthesis.
        let mut full_reply = String::new();
        let mut sentence_buf = String::new();
        let mut speaking_started = false;

        loop {
            if !Self::is_turn_live(&self.sessions, session_id, response_id).await? {
                break;
            }
            match stream.next().await {
                Some(Ok(token)) => {
                    full_reply.push_str(&token);
                    sentence_buf.push_str(&token);
                    bus.emit(EventKind::GenerationChunk { token }).await.ok();

                    while let Some(idx) = find_sentence_boundary(&sentence_buf) {
                        let sentence: String = sentence_buf.drain(..=idx).collect();
                        let sentence = sentence.trim().to_owned();
                        if sentence.is_empty() {
                            continue;
                        }
                        if !speaking_started {
                            speaking_started = true;
                            self.sessions.transition(session_id, SessionState::Speaking).await?;
                            bus.emit(EventKind::SynthesisStart).await.ok();
                        }
                        self.dispatch_sentence(session_id, response_id, &bus, &sentence).await?;
                        if !Self::is_turn_live(&self.sessions, session_id, response_id).await? {
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    bus.emit(EventKind::Error {
                        code: "generation_failed".to_string(),
                        message: err.to_string(),
                        recoverable: true,
                    })
                    .await
                    .ok();
                    self.sessions.transition(session_id, SessionState::Idle).await?;
                    return Ok(());
                }
                None => break,
            }
        }

        // Flush the tail (text after the last sentence boundary), if the
        // turn is still live.
        if Self::is_turn_live(&self.sessions, session_id, response_id).await? && !sentence_buf.trim().is_empty() {
            if !speaking_started {
                speaking_started = true;
                self.sessions.transition(session_id, SessionState::Speaking).await?;
                bus.emit(EventKind::SynthesisStart).await.ok();
            }
            let tail = sentence_buf.trim().to_owned();
            self.dispatch_sentence(session_id, response_id, &bus, &tail).await?;
        }

        if !Self::is_turn_live(&self.sessions, session_id, response_id).await? {
            // Interrupted mid-turn; `interrupt()` already emitted
            // synthesis.stop and session.interrupted.
            return Ok(());
        }

        // Verify the finished reply against the context snapshot.
        let verdict = self
            .verifier
            .verify(&full_reply, &context, Some(self.generator.as_ref()))
            .await;
        let final_text = verdict.rewritten.clone().unwrap_or_else(|| full_reply.clone());
        conversation
            .append(Message::new(Role::Assistant, final_text.clone()).with_citations(verdict.citations.clone()))
            .await;
        bus.emit(EventKind::GenerationEnd {
            text: final_text,
            verification: VerdictSummary {
                verified: verdict.verified,
                confidence: verdict.confidence,
                citations: verdict.citations,
            },
        })
        .await
        .ok();

        // Finalize: close out synthesis and return to idle.
        if speaking_started {
            bus.emit(EventKind::SynthesisEnd).await.ok();
        }
        self.sessions.transition(session_id, SessionState::Idle).await?;
        Ok(())
    }

    /// Dispatch one sentence to synthesis, retrying transient failures with
    /// backoff like the other upstream calls. Per-sentence failures that
    /// survive all attempts are logged and swallowed; the reply text itself
    /// remains valid either way.
    async fn dispatch_sentence(
        &self,
        session_id: SessionId,
        response_id: ResponseId,
        bus: &EventBus,
        text: &str,
    ) -> Result<()> {
        if !Self::is_turn_live(&self.sessions, session_id, response_id).await? {
            return Ok(());
        }

        let sessions = &self.sessions;
        let synthesizer = self.synthesizer.as_ref();
        let result = call_with_resilience(UpstreamKind::Synthesis, 3, move || async move {
            let mut on_chunk = move |audio: Vec<u8>| -> BoxFuture<'_, Result<()>> {
                Box::pin(async move {
                    if Self::is_turn_live(sessions, session_id, response_id).await? {
                        bus.emit(EventKind::SynthesisChunk { audio }).await.ok();
                    }
                    Ok(())
                })
            };
            synthesizer.synthesize(text, &mut on_chunk).await
        })
        .await;

        if let Err(err) = result {
            tracing::warn!(error = %err, %session_id, "synthesis failed for sentence after retries; continuing");
        }
        Ok(())
    }

    /// Current lifecycle state of a session, for transport-side inspection.
    pub async fn session_state(&self, session_id: SessionId) -> Result<SessionState> {
        self.state_of(session_id).await
    }

    async fn state_of(&self, session_id: SessionId) -> Result<SessionState> {
        let handle = self.sessions.get(session_id).await?;
        let state = handle.lock().await.state;
        Ok(state)
    }

    async fn runtime(&self, session_id: SessionId) -> Result<Arc<Mutex<SessionRuntime>>> {
        self.runtimes
            .lock()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(VoxturnError::SessionNotFound(session_id))
    }

    async fn bus_of(&self, session_id: SessionId) -> Result<Arc<EventBus>> {
        let runtime = self.runtime(session_id).await?;
        let bus = Arc::clone(&runtime.lock().await.bus);
        Ok(bus)
    }

    async fn conversation_of(&self, session_id: SessionId) -> Result<Arc<ConversationMemory>> {
        let handle = self.sessions.get(session_id).await?;
        let conversation_id = handle.lock().await.conversation_id;
        self.conversations
            .lock()
            .await
            .get(&conversation_id)
            .cloned()
            .ok_or(VoxturnError::SessionNotFound(session_id))
    }

    /// Whether `response_id` is still current for `session_id` and the
    /// session has not been interrupted. The authoritative pre-emit check
    /// used throughout the turn.
    async fn is_turn_live(sessions: &SessionStore, session_id: SessionId, response_id: ResponseId) -> Result<bool> {
        let handle = sessions.get(session_id).await?;
        let session = handle.lock().await;
        Ok(session.state != SessionState::Interrupted && session.is_active_response(response_id))
    }
}

/// Byte index of the first sentence terminator (`. ! ? \n`) in `text`.
/// Deliberately narrower than a clause boundary: splitting on commas and
/// semicolons too would send half-thoughts to synthesis.
fn find_sentence_boundary(text: &str) -> Option<usize> {
    text.char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(i, _)| i)
}

/// Retry an idempotent upstream call up to `max_attempts` times with
/// exponential backoff (≈1s -> 5s), gated by the shared circuit breaker
/// and token bucket for `kind`.
async fn call_with_resilience<T, F, Fut>(kind: UpstreamKind, max_attempts: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_secs(1);
    for attempt in 0..max_attempts {
        let allowed = global_breaker().lock().expect("breaker mutex poisoned").should_attempt(kind);
        if !allowed {
            return Err(VoxturnError::CircuitOpen(kind));
        }
        if !global_rate_limiters().try_acquire(kind) {
            return Err(VoxturnError::RateLimited(kind));
        }

        match f().await {
            Ok(value) => {
                global_breaker().lock().expect("breaker mutex poisoned").record_success(kind);
                return Ok(value);
            }
            Err(err) => {
                global_breaker().lock().expect("breaker mutex poisoned").record_failure(kind);
                if attempt + 1 == max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(5));
            }
        }
    }
    unreachable!("loop always returns within max_attempts iterations")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FixedGenerator, FixedSynthesizer, FixedTranscriber, StaticContextProvider};
    use std::time::Duration as StdDuration;

    fn engine(
        transcript: &str,
        tokens: Vec<&str>,
        context: crate::ports::ContextSnapshot,
    ) -> Arc<PipelineEngine> {
        Arc::new(PipelineEngine::new(
            EngineConfig::default(),
            Arc::new(FixedTranscriber::ok(transcript)),
            Arc::new(FixedGenerator::tokens(tokens)),
            Arc::new(FixedSynthesizer::default()),
            Arc::new(StaticContextProvider::new(context)),
            Arc::new(crate::ports::NullVectorStoreSink),
        ))
    }

    async fn drain(rx: &mut mpsc::Receiver<Event>, n: usize) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        for _ in 0..n {
            match tokio::time::timeout(StdDuration::from_secs(2), rx.recv()).await {
                Ok(Some(event)) => kinds.push(event.kind),
                _ => break,
            }
        }
        kinds
    }

    #[tokio::test]
    async fn short_utterance_is_dropped_silently() {
        let engine = engine("unused", vec![], crate::ports::ContextSnapshot::default());
        let (session_id, mut rx) = engine.create_session().await;
        // Consume session.created.
        rx.recv().await;

        engine.on_audio_chunk(session_id, &[0u8; 8_000]).await.unwrap();
        engine.on_audio_end(session_id).await.unwrap();

        let kinds = drain(&mut rx, 1).await;
        assert!(matches!(kinds.as_slice(), [EventKind::AudioEnd]));
        assert_eq!(engine.state_of(session_id).await.unwrap(), SessionState::Idle);
    }

    #[tokio::test]
    async fn clean_turn_runs_all_nine_steps() {
        let context = {
            let mut data = std::collections::BTreeMap::new();
            data.insert(
                "api:status".to_owned(),
                serde_json::Value::String("All systems are healthy".to_owned()),
            );
            crate::ports::ContextSnapshot {
                data,
                recent_turns: Vec::new(),
                knowledge_base: Vec::new(),
            }
        };
        let engine = engine(
            "What is the status?",
            vec!["All ", "systems ", "are ", "healthy."],
            context,
        );
        let (session_id, mut rx) = engine.create_session().await;
        rx.recv().await; // session.created

        engine.on_audio_chunk(session_id, &[0u8; 20_000]).await.unwrap();
        engine.on_audio_end(session_id).await.unwrap();

        let kinds = drain(&mut rx, 16).await;
        assert!(matches!(kinds[0], EventKind::AudioEnd));
        assert!(matches!(&kinds[1], EventKind::TranscriptFinal { text, .. } if text == "What is the status?"));
        assert!(matches!(kinds[2], EventKind::GenerationStart));
        let generation_chunks = kinds
            .iter()
            .filter(|k| matches!(k, EventKind::GenerationChunk { .. }))
            .count();
        assert_eq!(generation_chunks, 4);
        assert!(kinds.iter().any(|k| matches!(k, EventKind::SynthesisStart)));
        assert!(kinds.iter().any(|k| matches!(k, EventKind::SynthesisEnd)));
        let generation_end = kinds
            .iter()
            .find_map(|k| match k {
                EventKind::GenerationEnd { verification, .. } => Some(verification),
                _ => None,
            })
            .expect("generation.end present");
        assert!(generation_end.verified);

        assert_eq!(engine.state_of(session_id).await.unwrap(), SessionState::Idle);
    }

    #[tokio::test]
    async fn mid_speech_interrupt_stops_synthesis() {
        let engine = engine("hello", vec!["Hi ", "there."], crate::ports::ContextSnapshot::default());
        let (session_id, mut rx) = engine.create_session().await;
        rx.recv().await;

        engine.on_audio_chunk(session_id, &[0u8; 20_000]).await.unwrap();
        engine.on_audio_end(session_id).await.unwrap();

        // Give the spawned turn a moment to reach `speaking`.
        for _ in 0..50 {
            if engine.state_of(session_id).await.unwrap() == SessionState::Speaking {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }

        let interrupted = engine.interrupt(session_id, InterruptReason::User).await.unwrap();
        assert!(interrupted);
        assert_eq!(engine.state_of(session_id).await.unwrap(), SessionState::Interrupted);

        // A second interrupt call is idempotent.
        assert!(!engine.interrupt(session_id, InterruptReason::User).await.unwrap());
    }

    #[tokio::test]
    async fn audio_during_active_turn_is_dropped_not_buffered() {
        let engine = engine("hello", vec!["Hi ", "there."], crate::ports::ContextSnapshot::default());
        let (session_id, mut rx) = engine.create_session().await;
        rx.recv().await;

        engine.on_audio_chunk(session_id, &[0u8; 20_000]).await.unwrap();
        engine.on_audio_end(session_id).await.unwrap();

        let mut state_before = SessionState::Idle;
        for _ in 0..50 {
            state_before = engine.state_of(session_id).await.unwrap();
            if matches!(state_before, SessionState::Processing | SessionState::Speaking) {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        assert!(matches!(state_before, SessionState::Processing | SessionState::Speaking));

        engine.on_audio_chunk(session_id, &[1u8; 1_000]).await.unwrap();

        let runtime = engine.runtime(session_id).await.unwrap();
        assert_eq!(runtime.lock().await.gate.buffered_len(), 0);
        assert_eq!(engine.state_of(session_id).await.unwrap(), state_before);
    }

    #[tokio::test]
    async fn interrupt_clears_buffered_audio() {
        let engine = engine("hello", vec!["Hi ", "there."], crate::ports::ContextSnapshot::default());
        let (session_id, mut rx) = engine.create_session().await;
        rx.recv().await;

        engine.on_audio_chunk(session_id, &[0u8; 20_000]).await.unwrap();
        engine.on_audio_end(session_id).await.unwrap();

        for _ in 0..50 {
            if engine.state_of(session_id).await.unwrap() == SessionState::Speaking {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }

        // Simulate stray buffered audio surviving into an active turn.
        {
            let runtime = engine.runtime(session_id).await.unwrap();
            runtime.lock().await.gate.push(&[9u8; 100]);
        }

        assert!(engine.interrupt(session_id, InterruptReason::User).await.unwrap());

        let runtime = engine.runtime(session_id).await.unwrap();
        assert_eq!(runtime.lock().await.gate.buffered_len(), 0);
    }

    #[tokio::test]
    async fn call_with_resilience_retries_transient_failure_and_succeeds() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let result: Result<&'static str> = call_with_resilience(UpstreamKind::Synthesis, 3, move || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(VoxturnError::Synthesis("mock transient failure".to_owned()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn synthesis_retries_transient_failure_within_a_turn() {
        let engine = Arc::new(PipelineEngine::new(
            EngineConfig::default(),
            Arc::new(FixedTranscriber::ok("hello")),
            Arc::new(FixedGenerator::tokens(vec!["Hi."])),
            Arc::new(crate::test_support::FlakySynthesizer::failing_then_ok(1)),
            Arc::new(StaticContextProvider::new(crate::ports::ContextSnapshot::default())),
            Arc::new(crate::ports::NullVectorStoreSink),
        ));
        let (session_id, mut rx) = engine.create_session().await;
        rx.recv().await;

        engine.on_audio_chunk(session_id, &[0u8; 20_000]).await.unwrap();
        engine.on_audio_end(session_id).await.unwrap();

        let kinds = drain(&mut rx, 16).await;
        assert!(kinds.iter().any(|k| matches!(k, EventKind::SynthesisChunk { .. })));
        assert!(kinds.iter().any(|k| matches!(k, EventKind::SynthesisEnd)));
    }
}
