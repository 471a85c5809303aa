//! Verification engine: extracts factual claims from a reply, scores
//! each against a flattened context snapshot, and emits a verdict with
//! citations and an optional rewritten reply carrying a disclaimer.
//!
//! The rule-based pass is deterministic and sits on the critical latency
//! path; it is always available as a fallback even when `VerifyMode::Llm`
//! is configured.

use crate::config::VerifyConfig;
use crate::memory::{Citation, ClaimType};
use crate::ports::{ContextSnapshot, Generator};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Terms that count double in the weighted-Jaccard similarity score.
const KEY_TERMS: &[&str] = &[
    "error", "issue", "bug", "version", "update", "status", "count", "total", "name", "id",
];

const HEDGING_PATTERNS: &[&str] = &[
    "i think",
    "i believe",
    "probably",
    "might",
    "seems like",
    "perhaps",
    "possibly",
];

const TEMPORAL_RELATIVE: &[&str] = &["yesterday", "ago", "since", "last ", "next "];

const REFERENCE_CUES: &[&str] = &["according to", "based on", "as stated in"];

const SAFE_UNCERTAINTY: &[&str] = &[
    "i don't have that information",
    "i do not have that information",
    "i'm not sure",
    "i am not sure",
];

const GREETINGS: &[&str] = &["hello", "hi there", "hey there", "how can i help"];

const DISCLAIMER: &str =
    " Note: some of the information above could not be corroborated against available sources.";

/// An extracted claim sentence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub claim_type: ClaimType,
    pub verified: bool,
    pub confidence: f32,
    pub source: Option<String>,
}

/// Verdict produced for one reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub verified: bool,
    pub confidence: f32,
    pub claims: Vec<Claim>,
    pub citations: Vec<Citation>,
    pub warnings: Vec<String>,
    pub rewritten: Option<String>,
}

/// The verification engine.
pub struct Verifier {
    config: VerifyConfig,
}

impl Verifier {
    #[must_use]
    pub fn new(config: VerifyConfig) -> Self {
        Self { config }
    }

    /// Run verification. In `VerifyMode::Llm`, attempts an LLM-backed
    /// verdict first and falls back to the rule-based pass on any failure.
    pub async fn verify(
        &self,
        reply: &str,
        context: &ContextSnapshot,
        generator: Option<&dyn Generator>,
    ) -> Verdict {
        if let (crate::config::VerifyMode::Llm, Some(generator)) = (self.config.mode, generator) {
            match self.verify_via_llm(reply, context, generator).await {
                Ok(verdict) => return verdict,
                Err(err) => {
                    tracing::warn!(error = %err, "llm-backed verification failed, falling back to rule-based");
                }
            }
        }
        self.verify_rule_based(reply, context)
    }

    /// The deterministic rule-based algorithm.
    #[must_use]
    pub fn verify_rule_based(&self, reply: &str, context: &ContextSnapshot) -> Verdict {
        let flattened = flatten_context(context);
        let claims = extract_claims(reply, self.config.min_claim_len, &flattened, self.config.claim_match_threshold);

        if claims.is_empty() {
            return Verdict {
                verified: true,
                confidence: 1.0,
                claims,
                citations: Vec::new(),
                warnings: Vec::new(),
                rewritten: None,
            };
        }

        let verified_count = claims.iter().filter(|c| c.verified).count();
        let overall = verified_count as f32 / claims.len() as f32;
        let verified = overall >= self.config.threshold;

        let mut seen_sources = HashSet::new();
        let citations: Vec<Citation> = claims
            .iter()
            .filter(|c| c.verified)
            .filter_map(|c| {
                let source = c.source.clone().unwrap_or_else(|| "unknown".to_owned());
                if seen_sources.insert(source.clone()) {
                    Some(Citation {
                        source,
                        verified: true,
                        snippet: truncate(&c.text, 120),
                        claim_type: c.claim_type,
                    })
                } else {
                    None
                }
            })
            .collect();

        let warnings: Vec<String> = claims
            .iter()
            .filter(|c| !c.verified)
            .map(|c| truncate(&c.text, 50))
            .collect();

        let rewritten = if verified {
            None
        } else {
            Some(format!("{reply}{DISCLAIMER}"))
        };

        Verdict {
            verified,
            confidence: overall,
            claims,
            citations,
            warnings,
            rewritten,
        }
    }

    /// Structured LLM-backed verdict: prompt the generator for a JSON
    /// object matching [`Verdict`]'s schema, one shot, no streaming.
    async fn verify_via_llm(
        &self,
        reply: &str,
        context: &ContextSnapshot,
        generator: &dyn Generator,
    ) -> crate::error::Result<Verdict> {
        let prompt_turn = crate::ports::ConversationTurn {
            role: crate::ports::Role::User,
            text: format!(
                "Verify the following reply against the provided context. \
                 Respond with a JSON object matching the Verdict schema \
                 (verified, confidence, claims, citations, warnings, rewritten).\n\nReply: {reply}"
            ),
        };
        let mut stream = generator.generate(std::slice::from_ref(&prompt_turn), context).await?;

        use futures::StreamExt;
        let mut buf = String::new();
        while let Some(token) = stream.next().await {
            buf.push_str(&token?);
        }

        serde_json::from_str(&buf)
            .map_err(|e| crate::error::VoxturnError::VerificationUnavailable(e.to_string()))
    }
}

/// Split `reply` into candidate claim sentences, classify, score, and
/// return the resulting [`Claim`]s (opinions are dropped entirely).
fn extract_claims(
    reply: &str,
    min_claim_len: usize,
    flattened: &[(String, String)],
    claim_match_threshold: f32,
) -> Vec<Claim> {
    split_sentences(reply)
        .into_iter()
        .filter(|s| s.trim().len() >= min_claim_len)
        .filter_map(|sentence| classify_and_score(&sentence, flattened, claim_match_threshold))
        .collect()
}

/// Split on `.`, `!`, `?`, `\n`, dropping empty fragments.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '\n') {
            let trimmed = current.trim().to_owned();
            if !trimmed.is_empty() {
                sentences.push(trimmed);
            }
            current.clear();
        }
    }
    let trimmed = current.trim().to_owned();
    if !trimmed.is_empty() {
        sentences.push(trimmed);
    }
    sentences
}

fn classify_and_score(
    sentence: &str,
    flattened: &[(String, String)],
    claim_match_threshold: f32,
) -> Option<Claim> {
    let lower = sentence.to_lowercase();

    if HEDGING_PATTERNS.iter().any(|p| lower.contains(p)) {
        return None;
    }

    let claim_type = if contains_numerical(&lower) {
        ClaimType::Numerical
    } else if contains_temporal(&lower) {
        ClaimType::Temporal
    } else if REFERENCE_CUES.iter().any(|c| lower.contains(c)) {
        ClaimType::Reference
    } else {
        ClaimType::Factual
    };

    let (best_sim, best_source) = best_match(&lower, flattened);

    if best_sim >= claim_match_threshold {
        return Some(Claim {
            text: sentence.to_owned(),
            claim_type,
            verified: true,
            confidence: best_sim,
            source: best_source,
        });
    }

    if is_safe_general_knowledge(&lower) {
        return Some(Claim {
            text: sentence.to_owned(),
            claim_type,
            verified: true,
            confidence: 0.7,
            source: Some("general_knowledge".to_owned()),
        });
    }

    Some(Claim {
        text: sentence.to_owned(),
        claim_type,
        verified: false,
        confidence: 0.2,
        source: None,
    })
}

fn contains_numerical(lower: &str) -> bool {
    lower.contains('%')
        || lower.contains('$')
        || lower.split_whitespace().any(|w| w.chars().any(|c| c.is_ascii_digit()))
        || lower.contains("percent")
        || lower.contains("thousand")
        || lower.contains("million")
        || lower.contains("billion")
}

fn contains_temporal(lower: &str) -> bool {
    let has_year = lower
        .split_whitespace()
        .any(|w| w.len() == 4 && w.chars().all(|c| c.is_ascii_digit()));
    has_year || TEMPORAL_RELATIVE.iter().any(|t| lower.contains(t))
}

fn is_safe_general_knowledge(lower: &str) -> bool {
    GREETINGS.iter().any(|g| lower.contains(g))
        || SAFE_UNCERTAINTY.iter().any(|s| lower.contains(s))
        || lower.trim_end().ends_with('?')
}

/// Recursively flatten a [`ContextSnapshot`] into `(source_label, snippet)`
/// pairs, joining nested object keys with `:` so a claim can cite the
/// exact path it was matched against.
fn flatten_context(context: &ContextSnapshot) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (key, value) in &context.data {
        flatten_value(key, value, &mut out);
    }
    for turn in &context.recent_turns {
        let role = match turn.role {
            crate::ports::Role::System => "system",
            crate::ports::Role::User => "user",
            crate::ports::Role::Assistant => "assistant",
        };
        out.push((format!("conversation:{role}"), turn.text.clone()));
    }
    for entry in &context.knowledge_base {
        out.push(("knowledge_base".to_owned(), entry.clone()));
    }
    out
}

fn flatten_value(path: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                flatten_value(&format!("{path}.{k}"), v, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                flatten_value(path, item, out);
            }
        }
        serde_json::Value::String(s) => out.push((path.to_owned(), s.clone())),
        other => out.push((path.to_owned(), format!("{path}: {other}"))),
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .map(str::to_owned)
        .collect()
}

fn weight(word: &str) -> u32 {
    if KEY_TERMS.contains(&word) {
        2
    } else {
        1
    }
}

/// Weighted Jaccard-like similarity between two token sets.
fn weighted_similarity(q: &HashSet<String>, c: &HashSet<String>) -> f32 {
    let intersection: u32 = q.intersection(c).map(|w| weight(w)).sum();
    let q_weight: u32 = q.iter().map(|w| weight(w)).sum();
    let c_weight: u32 = c.iter().map(|w| weight(w)).sum();
    let denom = q_weight + c_weight - intersection;
    if denom == 0 {
        0.0
    } else {
        intersection as f32 / denom as f32
    }
}

fn best_match(sentence_lower: &str, flattened: &[(String, String)]) -> (f32, Option<String>) {
    let q = tokenize(sentence_lower);
    if q.is_empty() {
        return (0.0, None);
    }

    let mut best_sim = 0.0f32;
    let mut best_source = None;
    for (source, snippet) in flattened {
        let c = tokenize(snippet);
        let sim = weighted_similarity(&q, &c);
        if sim > best_sim {
            best_sim = sim;
            best_source = Some(source.clone());
        }
    }
    (best_sim, best_source)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_owned()
    } else {
        let mut s: String = text.chars().take(max_chars).collect();
        s.push('\u{2026}');
        s
    }
}
