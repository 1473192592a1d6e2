//! Request classifier: maps a free-text prompt to a tool domain.
//!
//! Pattern matching is synchronous and runs over immutable tables:
//!
//! 1. Normalize the prompt (case fold, punctuation to spaces).
//! 2. Scan the bilingual keyword tables. Latin keywords must sit on word
//!    boundaries; Hangul keywords may sit inside a larger word because
//!    Korean attaches particles and compounds without spaces.
//! 3. Count entity mentions (cities, listed companies, six-digit codes) as
//!    weaker signals, but only for domains that already have a keyword hit.
//!    A prompt with no keyword hit at all is "none" with confidence 0.
//! 4. The domain with the most signals wins. An exact tie is reported as
//!    "none" with the tied domains recorded.
//!
//! When no domain clears the threshold, `classify_with_fallback` may ask the
//! language model for a label.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::config::{AppConfig, ClassifierConfig};
use crate::inference::{ChatMessage, LanguageModel, SamplingParams};

use super::registry::{find_six_digit_codes, is_hangul, normalize, PhraseIndex, Registries};
use super::types::{ClassificationMethod, ClassificationVerdict, Domain, Signal, SignalKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Confidence arithmetic is done in whole percent.
const BASE_PCT: u32 = 45;
const KEYWORD_PCT: u32 = 15;
const ENTITY_PCT: u32 = 5;
const SPECIFIC_PCT: u32 = 5;
const CAP_PCT: u32 = 95;

/// Keywords at least this long (in chars) count as specific.
const SPECIFIC_MIN_CHARS: usize = 8;

/// Confidence given to a bare label answer that carries no number.
const DEFAULT_MODEL_CONFIDENCE: f32 = 0.7;
const MODEL_CONFIDENCE_CAP: f32 = 0.95;

const FALLBACK_MAX_TOKENS: u32 = 64;

// ─── Tallies ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    keywords: u32,
    entities: u32,
    specific: u32,
}

impl Tally {
    fn signals(&self) -> u32 {
        self.keywords + self.entities
    }

    /// Integer percent keeps threshold comparisons exact.
    fn confidence(&self) -> f32 {
        let pct = BASE_PCT
            + KEYWORD_PCT * self.keywords
            + ENTITY_PCT * self.entities
            + SPECIFIC_PCT * self.specific;
        pct.min(CAP_PCT) as f32 / 100.0
    }
}

fn is_specific(phrase: &str) -> bool {
    phrase.contains(' ') || phrase.chars().count() >= SPECIFIC_MIN_CHARS
}

// ─── RequestClassifier ───────────────────────────────────────────────────────

/// Keyword and entity tables for every configured domain.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    keywords: PhraseIndex<Domain>,
    /// Entity names and aliases, folded the same way as the prompt.
    entities: PhraseIndex<Domain>,
    /// Domains with at least one keyword; only these can be routed to.
    domains: Vec<Domain>,
    settings: ClassifierConfig,
}

impl RequestClassifier {
    pub fn new(
        keywords: impl IntoIterator<Item = (Domain, Vec<String>)>,
        registries: Arc<Registries>,
        settings: ClassifierConfig,
    ) -> Self {
        let mut domains = Vec::new();
        let mut phrases = Vec::new();
        for (domain, words) in keywords {
            let before = phrases.len();
            phrases.extend(
                words
                    .into_iter()
                    .filter(|w| !w.trim().is_empty())
                    .map(|w| (w, domain)),
            );
            if phrases.len() > before && !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        Self {
            keywords: PhraseIndex::new(phrases),
            entities: entity_index(&registries),
            domains,
            settings,
        }
    }

    pub fn from_config(config: &AppConfig, registries: Arc<Registries>) -> Self {
        let keywords = config
            .domains
            .iter()
            .map(|(domain, cfg)| (*domain, cfg.keywords.clone()));
        Self::new(keywords, registries, config.classifier.clone())
    }

    pub fn threshold(&self) -> f32 {
        self.settings.threshold
    }

    pub fn model_fallback_enabled(&self) -> bool {
        self.settings.model_fallback
    }

    /// Pattern-only classification. Pure: the same prompt always yields the
    /// same verdict.
    pub fn classify(&self, prompt: &str) -> ClassificationVerdict {
        let text = normalize(prompt);
        if text.is_empty() {
            return ClassificationVerdict::none();
        }

        let mut found: Vec<(usize, Signal)> = Vec::new();
        let mut tallies: BTreeMap<Domain, Tally> = BTreeMap::new();

        let keyword_hits = self.keywords.scan_where(&text, |m| {
            m.word_boundary || m.phrase.chars().next().is_some_and(is_hangul)
        });
        for hit in keyword_hits {
            let domain = *hit.payload;
            let tally = tallies.entry(domain).or_default();
            tally.keywords += 1;
            if is_specific(hit.phrase) {
                tally.specific += 1;
            }
            found.push((hit.start, signal(domain, hit.raw, SignalKind::Keyword)));
        }

        // Entities only reinforce a domain the keywords already point at.
        tallies.retain(|domain, _| self.keywords_cover(*domain));
        if tallies.is_empty() {
            return ClassificationVerdict::none();
        }

        for m in self.entities.scan_where(&text, |m| m.word_boundary) {
            let domain = *m.payload;
            if let Some(tally) = tallies.get_mut(&domain) {
                tally.entities += 1;
                found.push((m.start, signal(domain, m.raw, SignalKind::Entity)));
            }
        }

        if let Some(tally) = tallies.get_mut(&Domain::Stock) {
            for (start, code) in find_six_digit_codes(&text) {
                tally.entities += 1;
                found.push((start, signal(Domain::Stock, code, SignalKind::Entity)));
            }
        }

        let Some(top) = tallies.values().map(Tally::signals).max() else {
            return ClassificationVerdict::none();
        };
        found.sort_by_key(|(start, _)| *start);
        let matched_signals: Vec<Signal> = found.into_iter().map(|(_, s)| s).collect();

        let leaders: Vec<(Domain, Tally)> = tallies
            .iter()
            .filter(|(_, t)| t.signals() == top)
            .map(|(d, t)| (*d, *t))
            .collect();

        if leaders.len() > 1 {
            let confidence = leaders
                .iter()
                .map(|(_, t)| t.confidence())
                .fold(0.0_f32, f32::max);
            tracing::debug!(
                tied = ?leaders.iter().map(|(d, _)| d.as_str()).collect::<Vec<_>>(),
                signals = top,
                "classification tie, deferring"
            );
            return ClassificationVerdict {
                domain: None,
                confidence,
                matched_signals,
                method: ClassificationMethod::PatternMatch,
                ambiguous_between: leaders.into_iter().map(|(d, _)| d).collect(),
            };
        }

        let (domain, tally) = leaders[0];
        let confidence = tally.confidence();
        ClassificationVerdict {
            domain: (confidence >= self.settings.threshold).then_some(domain),
            confidence,
            matched_signals,
            method: ClassificationMethod::PatternMatch,
            ambiguous_between: Vec::new(),
        }
    }

    /// Pattern classification, then one low-temperature model call when the
    /// patterns are inconclusive (no domain above threshold, and not a tie).
    ///
    /// A failed or unparseable model answer leaves the pattern verdict as is.
    pub async fn classify_with_fallback(
        &self,
        prompt: &str,
        model: &dyn LanguageModel,
        model_name: &str,
    ) -> ClassificationVerdict {
        let verdict = self.classify(prompt);
        if verdict.domain.is_some() || verdict.is_ambiguous() || !self.settings.model_fallback {
            return verdict;
        }

        let messages = [
            ChatMessage::system(fallback_instruction()),
            ChatMessage::user(prompt),
        ];
        let answer = match model
            .complete_chat(model_name, &messages, SamplingParams::deterministic(FALLBACK_MAX_TOKENS))
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(error = %e, "model-assisted classification failed, keeping pattern verdict");
                return verdict;
            }
        };

        let Some((domain, confidence)) = parse_model_label(&answer) else {
            tracing::warn!(answer = %answer.trim(), "unusable classification answer, keeping pattern verdict");
            return verdict;
        };

        let mut matched_signals = verdict.matched_signals;
        if let Some(domain) = domain {
            matched_signals.push(signal(domain, domain.as_str().to_string(), SignalKind::Model));
        }

        let domain = domain
            .filter(|d| self.keywords_cover(*d))
            .filter(|_| confidence >= self.settings.threshold);
        tracing::info!(
            domain = domain.map(Domain::as_str).unwrap_or("none"),
            confidence,
            "model-assisted classification"
        );

        ClassificationVerdict {
            domain,
            confidence,
            matched_signals,
            method: ClassificationMethod::ModelAssisted,
            ambiguous_between: Vec::new(),
        }
    }

    fn keywords_cover(&self, domain: Domain) -> bool {
        self.domains.contains(&domain)
    }
}

/// Registry names and aliases normalized like prompts, so punctuated names
/// such as "Busanjin-gu" still match the normalized text.
fn entity_index(registries: &Registries) -> PhraseIndex<Domain> {
    let phrases = Domain::ALL.into_iter().flat_map(|domain| {
        registries
            .for_domain(domain)
            .into_iter()
            .flat_map(|registry| registry.entities())
            .flat_map(|entity| std::iter::once(&entity.name).chain(&entity.aliases))
            .map(move |phrase| (normalize(phrase), domain))
    });
    PhraseIndex::new(phrases)
}

fn signal(domain: Domain, cue: String, kind: SignalKind) -> Signal {
    Signal { domain, cue, kind }
}

fn fallback_instruction() -> String {
    let labels: Vec<&str> = Domain::ALL.iter().map(|d| d.as_str()).collect();
    format!(
        "Classify the user's request into exactly one of these labels: {}, none.\n\
         Use \"none\" when no external tool is needed.\n\
         Reply with JSON only: {{\"domain\": \"<label>\", \"confidence\": <number between 0 and 1>}}",
        labels.join(", ")
    )
}

// ─── Model answer parsing ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LabelAnswer {
    domain: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Read `{"domain": .., "confidence": ..}` or a bare label.
///
/// Returns `None` when the answer names no known label. `Some((None, c))`
/// means the model said "none".
fn parse_model_label(answer: &str) -> Option<(Option<Domain>, f32)> {
    let trimmed = answer.trim();

    let json_slice = trimmed
        .find('{')
        .zip(trimmed.rfind('}'))
        .filter(|(start, end)| start < end)
        .map(|(start, end)| &trimmed[start..=end]);

    let (label, confidence) = match json_slice.and_then(|s| serde_json::from_str::<LabelAnswer>(s).ok()) {
        Some(parsed) => (parsed.domain, parsed.confidence.unwrap_or(DEFAULT_MODEL_CONFIDENCE)),
        None => {
            let bare = trimmed
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            (bare, DEFAULT_MODEL_CONFIDENCE)
        }
    };

    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, MODEL_CONFIDENCE_CAP)
    } else {
        DEFAULT_MODEL_CONFIDENCE
    };

    if label.trim().eq_ignore_ascii_case("none") {
        return Some((None, confidence));
    }
    label.parse::<Domain>().ok().map(|d| (Some(d), confidence))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
