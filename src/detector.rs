//! Wake/Interrupt detector: a pure text-level classifier, debounced,
//! fuzzy-matched by edit distance.
//!
//! A prefix-overlap heuristic is tempting but misclassifies near-miss
//! phrasing ("hey assistent" vs "hey assistant") as unrelated, so the
//! distance function below is true Levenshtein edit distance over
//! characters, not word overlap.

use crate::config::DetectorConfig;
use std::time::Instant;

const FILLER_WORDS: &[&str] = &["please", "can you", "could you", "would you"];

/// Classification kind returned by [`Detector::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyKind {
    Wake,
    Interrupt,
}

/// A positive classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: ClassifyKind,
    pub matched: String,
    pub confidence: f32,
}

/// Text-level wake/interrupt scanner with debounce state.
pub struct Detector {
    config: DetectorConfig,
    last_positive_at: Option<Instant>,
}

impl Detector {
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            last_positive_at: None,
        }
    }

    /// Classify `text`. Interrupt phrases are scanned before wake phrases,
    /// so on an utterance containing both, interrupt wins.
    pub fn classify(&mut self, text: &str) -> Option<Classification> {
        if let Some(at) = self.last_positive_at {
            if at.elapsed() < self.config.debounce {
                return None;
            }
        }

        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }

        let hit = Self::scan(&normalized, &self.config.interrupt_phrases, self.config.sensitivity, true)
            .map(|(matched, confidence)| Classification {
                kind: ClassifyKind::Interrupt,
                matched,
                confidence,
            })
            .or_else(|| {
                Self::scan(&normalized, &self.config.wake_phrases, self.config.sensitivity, false).map(
                    |(matched, confidence)| Classification {
                        kind: ClassifyKind::Wake,
                        matched,
                        confidence,
                    },
                )
            });

        if hit.is_some() {
            self.last_positive_at = Some(Instant::now());
        }
        hit
    }

    /// Scan `phrases` against `normalized` text, returning the first hit.
    ///
    /// Interrupt phrases can occur anywhere in the utterance, so they get a
    /// substring fast path. Wake phrases must lead the utterance: a wake
    /// phrase appearing mid-sentence is not a deliberate wake, so only a
    /// prefix match takes the 1.0-confidence fast path; anything else falls
    /// through to the fuzzy comparison against the leading words.
    fn scan(normalized: &str, phrases: &[String], sensitivity: f32, allow_substring: bool) -> Option<(String, f32)> {
        for phrase in phrases {
            let phrase_lower = phrase.to_lowercase();
            let fast_path_hit = if allow_substring {
                normalized.contains(&phrase_lower)
            } else {
                normalized.starts_with(&phrase_lower)
            };
            if fast_path_hit {
                return Some((phrase.clone(), 1.0));
            }

            let word_count = phrase_lower.split_whitespace().count().max(1);
            let prefix = leading_words(normalized, word_count);
            if prefix.is_empty() {
                continue;
            }
            let sim = normalized_levenshtein_similarity(&phrase_lower, &prefix);
            if sim >= sensitivity {
                return Some((phrase.clone(), sim));
            }
        }
        None
    }

    /// Strip the matched prefix and any leading filler words from `text`,
    /// returning the command tail (trimmed).
    #[must_use]
    pub fn extract_command_after_wake(text: &str, phrase: &str) -> String {
        let lower = text.to_lowercase();
        let phrase_lower = phrase.to_lowercase();

        let mut rest = if let Some(pos) = lower.find(&phrase_lower) {
            text[pos + phrase.len()..].trim_start()
        } else {
            text.trim_start()
        };

        loop {
            let rest_lower = rest.to_lowercase();
            let mut stripped = None;
            for filler in FILLER_WORDS {
                if rest_lower.starts_with(filler) {
                    let remainder = rest[filler.len()..].trim_start();
                    stripped = Some(remainder);
                    break;
                }
            }
            match stripped {
                Some(remainder) => rest = remainder,
                None => break,
            }
        }

        rest.trim().to_owned()
    }
}

/// First `n` whitespace-separated words of `text`, joined by single spaces.
fn leading_words(text: &str, n: usize) -> String {
    text.split_whitespace()
        .take(n)
        .collect::<Vec<_>>()
        .join(" ")
}

/// True Levenshtein edit distance between `a` and `b`, operating on chars.
#[must_use]
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (m, n) = (a.len(), b.len());

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (curr[j - 1] + 1)
                .min(prev[j] + 1)
                .min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Levenshtein similarity normalized to `[0, 1]`: `1 - distance / max_len`.
/// Two empty strings are defined as fully similar.
#[must_use]
pub fn normalized_levenshtein_similarity(a: &str, b: &str) -> f32 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein_distance(a, b);
    1.0 - (distance as f32 / max_len as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> DetectorConfig {
        DetectorConfig {
            wake_phrases: vec!["hey assistant".to_owned()],
            interrupt_phrases: vec!["stop".to_owned(), "cancel".to_owned()],
            sensitivity: 0.75,
            debounce: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn identical_strings_have_zero_distance() {
        assert_eq!(levenshtein_distance("hello", "hello"), 0);
    }

    #[test]
    fn distance_matches_known_values() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("abc", ""), 3);
    }

    #[test]
    fn similarity_is_one_for_identical_strings() {
        assert!((normalized_levenshtein_similarity("stop", "stop") - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn exact_substring_match_has_full_confidence() {
        let mut detector = Detector::new(config());
        let result = detector.classify("please stop now").unwrap();
        assert_eq!(result.kind, ClassifyKind::Interrupt);
        assert!((result.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn fuzzy_wake_match_above_sensitivity_is_accepted() {
        let mut detector = Detector::new(config());
        // "hey assistan" is a one-char-short fuzzy match of "hey assistant".
        let result = detector.classify("hey assistan what's up").unwrap();
        assert_eq!(result.kind, ClassifyKind::Wake);
    }

    #[test]
    fn interrupt_takes_priority_over_wake() {
        let mut detector = Detector::new(DetectorConfig {
            wake_phrases: vec!["hey assistant".to_owned()],
            interrupt_phrases: vec!["hey assistant stop".to_owned()],
            sensitivity: 0.75,
            debounce: Duration::from_millis(0),
        });
        let result = detector.classify("hey assistant stop please").unwrap();
        assert_eq!(result.kind, ClassifyKind::Interrupt);
    }

    #[test]
    fn debounce_suppresses_rapid_repeats() {
        let mut detector = Detector::new(DetectorConfig {
            debounce: Duration::from_secs(5),
            ..config()
        });
        assert!(detector.classify("stop").is_some());
        assert!(detector.classify("stop").is_none());
    }

    #[test]
    fn no_match_returns_none() {
        let mut detector = Detector::new(config());
        assert!(detector.classify("what is the weather today").is_none());
    }

    #[test]
    fn wake_phrase_mid_utterance_is_not_a_full_confidence_hit() {
        let mut detector = Detector::new(config());
        // "hey assistant" appears, but not leading the utterance, so it
        // must not take the substring fast path the way interrupt phrases do.
        let result = detector.classify("so i said hey assistant to my friend");
        assert!(result.is_none() || result.unwrap().confidence < 1.0);
    }

    #[test]
    fn extract_command_strips_phrase_and_filler() {
        let tail = Detector::extract_command_after_wake(
            "hey assistant could you tell me the time",
            "hey assistant",
        );
        assert_eq!(tail, "tell me the time");
    }

    #[test]
    fn extract_command_with_no_tail_is_empty() {
        let tail = Detector::extract_command_after_wake("hey assistant", "hey assistant");
        assert_eq!(tail, "");
    }
}
