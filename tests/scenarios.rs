//! End-to-end scenario tests, driving the engine through its public
//! API exactly as a transport adapter would.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use voxturn::config::EngineConfig;
use voxturn::events::{Event, EventKind, InterruptReason};
use voxturn::pipeline::PipelineEngine;
use voxturn::ports::{ContextSnapshot, NullVectorStoreSink};
use voxturn::session::SessionState;
use voxturn::test_support::{FixedGenerator, FixedSynthesizer, FixedTranscriber, StaticContextProvider};

fn build_engine(transcript: &str, tokens: Vec<&str>, context: ContextSnapshot) -> Arc<PipelineEngine> {
    Arc::new(PipelineEngine::new(
        EngineConfig::default(),
        Arc::new(FixedTranscriber::ok(transcript)),
        Arc::new(FixedGenerator::tokens(tokens)),
        Arc::new(FixedSynthesizer::default()),
        Arc::new(StaticContextProvider::new(context)),
        Arc::new(NullVectorStoreSink),
    ))
}

async fn drain_all(rx: &mut tokio::sync::mpsc::Receiver<Event>, timeout: Duration) -> Vec<EventKind> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(event)) => events.push(event.kind),
            _ => break,
        }
    }
    events
}

#[tokio::test]
async fn unverified_reply_carries_disclaimer_and_warnings() {
    let engine = build_engine(
        "ignored",
        vec!["There ", "are ", "999 ", "critical ", "errors."],
        ContextSnapshot::default(),
    );
    let (session_id, mut rx) = engine.create_session().await;
    rx.recv().await; // session.created

    engine.on_audio_chunk(session_id, &[0u8; 20_000]).await.unwrap();
    engine.on_audio_end(session_id).await.unwrap();

    let events = drain_all(&mut rx, Duration::from_secs(2)).await;
    let (text, verification) = events
        .into_iter()
        .find_map(|k| match k {
            EventKind::GenerationEnd { text, verification } => Some((text, verification)),
            _ => None,
        })
        .expect("generation.end present");

    assert!(!verification.verified);
    assert!(text.contains("could not be corroborated"));
}

#[tokio::test]
async fn safe_greeting_is_verified_with_no_disclaimer() {
    let engine = build_engine(
        "ignored",
        vec!["Hello! ", "How ", "can ", "I ", "help?"],
        ContextSnapshot::default(),
    );
    let (session_id, mut rx) = engine.create_session().await;
    rx.recv().await;

    engine.on_audio_chunk(session_id, &[0u8; 20_000]).await.unwrap();
    engine.on_audio_end(session_id).await.unwrap();

    let events = drain_all(&mut rx, Duration::from_secs(2)).await;
    let (text, verification) = events
        .into_iter()
        .find_map(|k| match k {
            EventKind::GenerationEnd { text, verification } => Some((text, verification)),
            _ => None,
        })
        .expect("generation.end present");

    assert!(verification.verified);
    assert!((verification.confidence - 1.0).abs() < f32::EPSILON);
    assert!(!text.contains("could not be corroborated"));
}

#[tokio::test]
async fn clean_turn_produces_two_conversation_messages() {
    let mut data = BTreeMap::new();
    data.insert(
        "api:status".to_owned(),
        serde_json::Value::String("All systems are healthy".to_owned()),
    );
    let context = ContextSnapshot {
        data,
        recent_turns: Vec::new(),
        knowledge_base: Vec::new(),
    };
    let engine = build_engine(
        "What is the status?",
        vec!["All ", "systems ", "are ", "healthy."],
        context,
    );
    let (session_id, mut rx) = engine.create_session().await;
    rx.recv().await;

    engine.on_audio_chunk(session_id, &[0u8; 20_000]).await.unwrap();
    engine.on_audio_end(session_id).await.unwrap();

    let events = drain_all(&mut rx, Duration::from_secs(2)).await;
    assert!(events.iter().any(|k| matches!(k, EventKind::TranscriptFinal { text, .. } if text == "What is the status?")));
    assert!(events.iter().any(|k| matches!(k, EventKind::SynthesisStart)));
    assert!(events.iter().any(|k| matches!(k, EventKind::SynthesisEnd)));
}

#[tokio::test]
async fn idempotent_interrupt_returns_false_on_second_call() {
    let engine = build_engine("hello", vec!["Hi ", "there."], ContextSnapshot::default());
    let (session_id, mut rx) = engine.create_session().await;
    rx.recv().await;

    engine.on_audio_chunk(session_id, &[0u8; 20_000]).await.unwrap();
    engine.on_audio_end(session_id).await.unwrap();

    for _ in 0..100 {
        if engine.session_state(session_id).await.unwrap() == SessionState::Speaking {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(engine.interrupt(session_id, InterruptReason::User).await.unwrap());
    assert!(!engine.interrupt(session_id, InterruptReason::User).await.unwrap());
}

#[tokio::test]
async fn short_utterance_never_reaches_generation() {
    let engine = build_engine("unused", vec!["unused"], ContextSnapshot::default());
    let (session_id, mut rx) = engine.create_session().await;
    rx.recv().await;

    engine.on_audio_chunk(session_id, &[0u8; 8_000]).await.unwrap();
    engine.on_audio_end(session_id).await.unwrap();

    let events = drain_all(&mut rx, Duration::from_millis(500)).await;
    assert!(events
        .iter()
        .all(|k| !matches!(k, EventKind::TranscriptFinal { .. } | EventKind::GenerationStart)));
}

#[tokio::test]
async fn wake_and_interrupt_together_yield_interrupt() {
    use voxturn::config::DetectorConfig;
    use voxturn::detector::{ClassifyKind, Detector};

    let mut detector = Detector::new(DetectorConfig {
        wake_phrases: vec!["hey assistant".to_owned()],
        interrupt_phrases: vec!["stop".to_owned()],
        sensitivity: 0.75,
        debounce: Duration::from_millis(0),
    });
    let result = detector
        .classify("hey assistant please stop")
        .expect("expected a classification");
    assert_eq!(result.kind, ClassifyKind::Interrupt);
}
