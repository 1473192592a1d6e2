//! Parameter extractor: pulls a tool argument out of free text.
//!
//! Strategies run strictly in order and the first hit wins:
//!
//! 1. Exact code (stock only): a standalone six-digit listed-company code.
//!    Confidence is fixed at 0.95 and nothing else runs.
//! 2. Registry: the longest known alias in the text. 0.8 on a word
//!    boundary, 0.6 inside a larger word.
//! 3. Model-assisted (optional): one bounded generation call naming the
//!    entity, normalized back through the registry. Never invents a name.
//!
//! Search queries take the prompt itself with trigger keywords removed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::AppConfig;
use crate::inference::{ChatMessage, LanguageModel, SamplingParams};

use super::registry::{find_six_digit_codes, is_hangul, EntityRegistry, PhraseIndex, Registries};
use super::types::{Domain, ExtractedArgument, Extraction, ExtractionStrategy};

// ─── Constants ───────────────────────────────────────────────────────────────

const EXACT_CODE_CONFIDENCE: f32 = 0.95;
const BOUNDARY_CONFIDENCE: f32 = 0.8;
const SUBSTRING_CONFIDENCE: f32 = 0.6;
const VERBATIM_CONFIDENCE: f32 = 0.6;

const MODEL_CONFIDENCE_MIN: f32 = 0.5;
const MODEL_CONFIDENCE_MAX: f32 = 0.95;
const MODEL_DEFAULT_CONFIDENCE: f32 = 0.7;
const MODEL_MAX_TOKENS: u32 = 64;

/// Registry names listed in the model instruction as examples.
const MODEL_HINT_NAMES: usize = 12;

// ─── ParameterExtractor ──────────────────────────────────────────────────────

/// Where a domain's argument comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotSource {
    City,
    Stock,
    Query,
}

impl SlotSource {
    fn for_domain(domain: Domain) -> Self {
        match domain {
            Domain::Weather => SlotSource::City,
            Domain::Stock => SlotSource::Stock,
            Domain::Search => SlotSource::Query,
        }
    }

    fn default_slot(self) -> &'static str {
        match self {
            SlotSource::City => "city",
            SlotSource::Stock => "stock_code",
            SlotSource::Query => "query",
        }
    }

    fn noun(self) -> &'static str {
        match self {
            SlotSource::City => "city",
            SlotSource::Stock => "listed company",
            SlotSource::Query => "search query",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParameterExtractor {
    registries: Arc<Registries>,
    /// Argument name per domain.
    slots: BTreeMap<Domain, String>,
    /// Phrases removed from the prompt to form a search query.
    query_noise: PhraseIndex<()>,
    model_budget: Option<Duration>,
}

impl ParameterExtractor {
    pub fn new(
        registries: Arc<Registries>,
        slots: BTreeMap<Domain, String>,
        query_keywords: Vec<String>,
        model_budget: Option<Duration>,
    ) -> Self {
        Self {
            registries,
            slots,
            query_noise: PhraseIndex::new(query_keywords.into_iter().map(|k| (k, ()))),
            model_budget,
        }
    }

    pub fn from_config(config: &AppConfig, registries: Arc<Registries>) -> Self {
        let slots = config
            .domains
            .iter()
            .map(|(domain, cfg)| (*domain, cfg.argument.clone()))
            .collect();
        let query_keywords = config
            .domain(Domain::Search)
            .map(|cfg| cfg.keywords.clone())
            .unwrap_or_default();
        Self::new(registries, slots, query_keywords, config.extractor.model_budget())
    }

    /// Argument name the domain's tool expects.
    pub fn slot(&self, domain: Domain) -> &str {
        self.slots
            .get(&domain)
            .map(String::as_str)
            .unwrap_or_else(|| SlotSource::for_domain(domain).default_slot())
    }

    /// Pattern strategies only; never touches the network.
    pub fn extract_local(&self, domain: Domain, prompt: &str) -> Extraction {
        let slot = self.slot(domain).to_string();
        let mut attempted = Vec::new();

        let argument = match SlotSource::for_domain(domain) {
            SlotSource::Query => {
                attempted.push(ExtractionStrategy::Verbatim);
                self.query_argument(&slot, prompt)
            }
            SlotSource::Stock => {
                attempted.push(ExtractionStrategy::ExactCode);
                match exact_code_argument(&slot, prompt, &self.registries.stocks) {
                    Some(argument) => Some(argument),
                    None => {
                        attempted.push(ExtractionStrategy::Registry);
                        registry_argument(&slot, prompt, &self.registries.stocks)
                    }
                }
            }
            SlotSource::City => {
                attempted.push(ExtractionStrategy::Registry);
                registry_argument(&slot, prompt, &self.registries.cities)
            }
        };

        Extraction {
            slot,
            argument,
            attempted,
        }
    }

    /// All strategies. The model is consulted only when the pattern
    /// strategies found nothing and a model budget is configured.
    pub async fn extract(
        &self,
        domain: Domain,
        prompt: &str,
        model: &dyn LanguageModel,
        model_name: &str,
    ) -> Extraction {
        let mut extraction = self.extract_local(domain, prompt);
        if extraction.argument.is_some() {
            return extraction;
        }

        let source = SlotSource::for_domain(domain);
        let (Some(budget), Some(registry)) = (self.model_budget, self.registries.for_domain(domain)) else {
            return extraction;
        };
        if source == SlotSource::Query {
            return extraction;
        }

        extraction.attempted.push(ExtractionStrategy::ModelAssisted);
        extraction.argument =
            model_assisted_argument(&extraction.slot, prompt, source, registry, budget, model, model_name).await;
        extraction
    }

    fn query_argument(&self, slot: &str, prompt: &str) -> Option<ExtractedArgument> {
        let trimmed = prompt.trim();
        if trimmed.is_empty() {
            return None;
        }

        let chars: Vec<char> = trimmed.chars().collect();
        let mut keep = vec![true; chars.len()];
        let noise = self.query_noise.scan_where(trimmed, |m| {
            m.word_boundary || m.phrase.chars().next().is_some_and(is_hangul)
        });
        for m in noise {
            keep[m.start..m.end].iter_mut().for_each(|k| *k = false);
        }

        let stripped: String = chars
            .iter()
            .zip(keep)
            .map(|(c, keep)| if keep { *c } else { ' ' })
            .collect();
        let collapsed = stripped
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let collapsed = collapsed.trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace());
        let query = if collapsed.is_empty() { trimmed } else { collapsed };

        Some(ExtractedArgument {
            slot: slot.to_string(),
            raw_text_span: trimmed.to_string(),
            normalized_name: None,
            value: Some(query.to_string()),
            alias_resolved: false,
            confidence: VERBATIM_CONFIDENCE,
            strategy: ExtractionStrategy::Verbatim,
        })
    }
}

// ─── Strategies ──────────────────────────────────────────────────────────────

fn exact_code_argument(slot: &str, prompt: &str, stocks: &EntityRegistry) -> Option<ExtractedArgument> {
    let (_, code) = find_six_digit_codes(prompt).into_iter().next()?;
    let name = stocks
        .by_code(&code)
        .map(|e| e.name.clone())
        .unwrap_or_else(|| code.clone());
    Some(ExtractedArgument {
        slot: slot.to_string(),
        raw_text_span: code.clone(),
        normalized_name: Some(name),
        value: Some(code),
        alias_resolved: false,
        confidence: EXACT_CODE_CONFIDENCE,
        strategy: ExtractionStrategy::ExactCode,
    })
}

/// First whole-word mention wins; a mention inside a larger word is used
/// only when there is no whole-word one.
fn registry_argument(slot: &str, prompt: &str, registry: &EntityRegistry) -> Option<ExtractedArgument> {
    let mentions = registry.find_all(prompt);
    let best = mentions
        .iter()
        .find(|m| m.word_boundary)
        .or_else(|| mentions.first())?;

    Some(ExtractedArgument {
        slot: slot.to_string(),
        raw_text_span: best.raw.clone(),
        normalized_name: Some(best.entity.name.clone()),
        value: Some(best.entity.tool_value().to_string()),
        alias_resolved: best.alias_resolved,
        confidence: if best.word_boundary {
            BOUNDARY_CONFIDENCE
        } else {
            SUBSTRING_CONFIDENCE
        },
        strategy: ExtractionStrategy::Registry,
    })
}

#[derive(Debug, Deserialize)]
struct EntityAnswer {
    #[serde(default)]
    entity: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

async fn model_assisted_argument(
    slot: &str,
    prompt: &str,
    source: SlotSource,
    registry: &EntityRegistry,
    budget: Duration,
    model: &dyn LanguageModel,
    model_name: &str,
) -> Option<ExtractedArgument> {
    let examples: Vec<&str> = registry
        .entities()
        .iter()
        .take(MODEL_HINT_NAMES)
        .map(|e| e.name.as_str())
        .collect();
    let instruction = format!(
        "Name the {noun} the user is asking about. Known values include: {examples}.\n\
         If the message names no {noun}, use null.\n\
         Reply with JSON only: {{\"entity\": \"<name or null>\", \"confidence\": <number between 0 and 1>}}",
        noun = source.noun(),
        examples = examples.join(", "),
    );
    let messages = [ChatMessage::system(instruction), ChatMessage::user(prompt)];

    let call = model.complete_chat(model_name, &messages, SamplingParams::deterministic(MODEL_MAX_TOKENS));
    let answer = match tokio::time::timeout(budget, call).await {
        Ok(Ok(answer)) => answer,
        Ok(Err(e)) => {
            tracing::warn!(slot, error = %e, "model-assisted extraction failed");
            return None;
        }
        Err(_) => {
            tracing::warn!(slot, budget_ms = budget.as_millis() as u64, "model-assisted extraction timed out");
            return None;
        }
    };

    let parsed = parse_entity_answer(&answer)?;
    let confidence = parsed
        .confidence
        .filter(|c| c.is_finite())
        .unwrap_or(MODEL_DEFAULT_CONFIDENCE)
        .clamp(MODEL_CONFIDENCE_MIN, MODEL_CONFIDENCE_MAX);
    let named = parsed.entity?;

    let resolved = match find_six_digit_codes(&named).into_iter().next() {
        Some((_, code)) if source == SlotSource::Stock => Some((
            registry.by_code(&code).map(|e| e.name.clone()).unwrap_or_else(|| code.clone()),
            code,
        )),
        _ => registry
            .resolve(&named)
            .map(|e| (e.name.clone(), e.tool_value().to_string())),
    };

    if resolved.is_none() {
        tracing::info!(slot, named = %named, "model named an entity the registry does not know");
    }

    let alias_resolved = resolved
        .as_ref()
        .is_some_and(|(name, _)| !name.eq_ignore_ascii_case(&named));
    let (normalized_name, value) = match resolved {
        Some((name, value)) => (Some(name), Some(value)),
        None => (None, None),
    };

    Some(ExtractedArgument {
        slot: slot.to_string(),
        raw_text_span: named,
        normalized_name,
        value,
        alias_resolved,
        confidence,
        strategy: ExtractionStrategy::ModelAssisted,
    })
}

/// Read `{"entity": .., "confidence": ..}`, tolerating text around the
/// object. A null, empty or "none" entity parses to `entity: None`.
fn parse_entity_answer(answer: &str) -> Option<EntityAnswer> {
    let trimmed = answer.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    let mut parsed: EntityAnswer = serde_json::from_str(&trimmed[start..=end]).ok()?;
    parsed.entity = parsed
        .entity
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty() && !e.eq_ignore_ascii_case("none") && !e.eq_ignore_ascii_case("null"));
    Some(parsed)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
