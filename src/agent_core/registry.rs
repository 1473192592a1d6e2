//! Immutable phrase tables built once at startup.
//!
//! `PhraseIndex` does case-insensitive, longest-first, non-overlapping
//! phrase scanning over raw text and reports spans in the original casing.
//! `EntityRegistry` (cities, listed companies) and the classifier's keyword
//! tables are both built on it.

use serde::{Deserialize, Serialize};

use crate::config::RegistriesConfig;

use super::types::Domain;

// ─── Character helpers ──────────────────────────────────────────────────────

/// Hangul syllable block. Korean particles attach directly after nouns, so a
/// Hangul-final match followed by more Hangul still counts as a word match.
pub fn is_hangul(c: char) -> bool {
    ('\u{AC00}'..='\u{D7A3}').contains(&c)
}

/// Single-char case fold that keeps character counts stable.
fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn fold_all(s: &str) -> Vec<char> {
    s.trim().chars().map(fold).collect()
}

/// Lowercase, turn punctuation into spaces, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let spaced: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { fold(c) } else { ' ' })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ─── PhraseIndex ────────────────────────────────────────────────────────────

/// One occurrence of a phrase in scanned text.
#[derive(Debug, Clone, PartialEq)]
pub struct PhraseMatch<'a, T> {
    pub payload: &'a T,
    /// The phrase as written in the table.
    pub phrase: &'a str,
    /// Matched text in its original casing.
    pub raw: String,
    /// Char offsets into the scanned text.
    pub start: usize,
    pub end: usize,
    /// Neither edge sits inside a larger word.
    pub word_boundary: bool,
}

#[derive(Debug, Clone)]
struct Phrase<T> {
    folded: Vec<char>,
    text: String,
    payload: T,
}

/// Phrases sorted longest first so the longest alias wins at any position.
#[derive(Debug, Clone)]
pub struct PhraseIndex<T> {
    phrases: Vec<Phrase<T>>,
}

impl<T> PhraseIndex<T> {
    pub fn new(entries: impl IntoIterator<Item = (String, T)>) -> Self {
        let mut phrases: Vec<Phrase<T>> = entries
            .into_iter()
            .filter_map(|(text, payload)| {
                let folded = fold_all(&text);
                (!folded.is_empty()).then(|| Phrase {
                    folded,
                    text: text.trim().to_string(),
                    payload,
                })
            })
            .collect();
        phrases.sort_by(|a, b| b.folded.len().cmp(&a.folded.len()));
        Self { phrases }
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// Every non-overlapping match, left to right.
    pub fn scan(&self, text: &str) -> Vec<PhraseMatch<'_, T>> {
        self.scan_where(text, |_| true)
    }

    /// Like [`scan`](Self::scan), but a candidate rejected by `accept` does
    /// not consume its span, so a shorter phrase may still match there.
    pub fn scan_where<F>(&self, text: &str, accept: F) -> Vec<PhraseMatch<'_, T>>
    where
        F: Fn(&PhraseMatch<'_, T>) -> bool,
    {
        let original: Vec<char> = text.chars().collect();
        let folded: Vec<char> = original.iter().map(|c| fold(*c)).collect();
        let mut matches = Vec::new();
        let mut i = 0;

        while i < folded.len() {
            let mut advanced = false;
            for phrase in &self.phrases {
                let end = i + phrase.folded.len();
                if end > folded.len() || folded[i..end] != phrase.folded[..] {
                    continue;
                }
                let candidate = PhraseMatch {
                    payload: &phrase.payload,
                    phrase: phrase.text.as_str(),
                    raw: original[i..end].iter().collect(),
                    start: i,
                    end,
                    word_boundary: at_word_boundary(&folded, i, end),
                };
                if accept(&candidate) {
                    matches.push(candidate);
                    i = end;
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                i += 1;
            }
        }

        matches
    }

    /// Exact (case-insensitive) lookup of a whole phrase.
    pub fn lookup(&self, text: &str) -> Option<&T> {
        let folded = fold_all(text);
        self.phrases
            .iter()
            .find(|p| p.folded == folded)
            .map(|p| &p.payload)
    }
}

fn at_word_boundary(chars: &[char], start: usize, end: usize) -> bool {
    let before_ok = start == 0 || !chars[start - 1].is_alphanumeric();
    let after_ok = match chars.get(end) {
        None => true,
        Some(next) if !next.is_alphanumeric() => true,
        Some(next) => is_hangul(*next) && is_hangul(chars[end - 1]),
    };
    before_ok && after_ok
}

// ─── Six-digit codes ────────────────────────────────────────────────────────

/// Standalone runs of exactly six ASCII digits (listed-company codes),
/// in order of appearance.
pub fn find_six_digit_codes(text: &str) -> Vec<(usize, String)> {
    let chars: Vec<char> = text.chars().collect();
    let mut found = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        let run_len = i - start;
        let before_ok = start == 0 || !chars[start - 1].is_alphanumeric();
        let after_ok = i == chars.len() || !chars[i].is_alphanumeric() || is_hangul(chars[i]);
        if run_len == 6 && before_ok && after_ok {
            found.push((start, chars[start..i].iter().collect()));
        }
    }

    found
}

// ─── EntityRegistry ─────────────────────────────────────────────────────────

/// A known entity: canonical name, optional code, and the aliases it is
/// written as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Entity {
    /// Value passed to a tool: the code when one is configured, else the name.
    pub fn tool_value(&self) -> &str {
        self.code.as_deref().unwrap_or(&self.name)
    }
}

/// An entity found in text.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMatch<'a> {
    pub entity: &'a Entity,
    pub raw: String,
    pub start: usize,
    pub word_boundary: bool,
    /// Matched through an alias rather than the canonical name.
    pub alias_resolved: bool,
}

/// Read-only alias table. The canonical name is always one of its aliases.
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    entities: Vec<Entity>,
    index: PhraseIndex<usize>,
}

impl EntityRegistry {
    pub fn new(entities: Vec<Entity>) -> Self {
        let mut phrases = Vec::new();
        for (i, entity) in entities.iter().enumerate() {
            phrases.push((entity.name.clone(), i));
            for alias in &entity.aliases {
                phrases.push((alias.clone(), i));
            }
        }
        Self {
            index: PhraseIndex::new(phrases),
            entities,
        }
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// All entity mentions in `text`, longest alias first at each position.
    pub fn find_all(&self, text: &str) -> Vec<EntityMatch<'_>> {
        self.index
            .scan(text)
            .into_iter()
            .map(|m| {
                let entity = &self.entities[*m.payload];
                EntityMatch {
                    alias_resolved: !m.raw.to_lowercase().eq(&entity.name.to_lowercase()),
                    entity,
                    raw: m.raw,
                    start: m.start,
                    word_boundary: m.word_boundary,
                }
            })
            .collect()
    }

    /// First mention in reading order.
    pub fn find_first(&self, text: &str) -> Option<EntityMatch<'_>> {
        self.find_all(text).into_iter().next()
    }

    /// Resolve a free-standing name (e.g. a model answer) to an entity.
    ///
    /// Tries an exact alias match first, then a mention inside the text.
    pub fn resolve(&self, name: &str) -> Option<&Entity> {
        if let Some(i) = self.index.lookup(name) {
            return Some(&self.entities[*i]);
        }
        self.find_first(name).map(|m| m.entity)
    }

    pub fn by_code(&self, code: &str) -> Option<&Entity> {
        self.entities
            .iter()
            .find(|e| e.code.as_deref() == Some(code))
    }
}

/// The process-wide registries, one per entity-bearing domain.
#[derive(Debug, Clone)]
pub struct Registries {
    pub cities: EntityRegistry,
    pub stocks: EntityRegistry,
}

impl Registries {
    pub fn from_config(config: &RegistriesConfig) -> Self {
        Self {
            cities: EntityRegistry::new(config.cities.clone()),
            stocks: EntityRegistry::new(config.stocks.clone()),
        }
    }

    /// Registry whose entities are arguments for `domain`; search has none.
    pub fn for_domain(&self, domain: Domain) -> Option<&EntityRegistry> {
        match domain {
            Domain::Weather => Some(&self.cities),
            Domain::Stock => Some(&self.stocks),
            Domain::Search => None,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cities() -> EntityRegistry {
        EntityRegistry::new(vec![
            Entity {
                name: "Seoul".into(),
                code: None,
                aliases: vec!["서울".into(), "서울시".into()],
            },
            Entity {
                name: "Busan".into(),
                code: None,
                aliases: vec!["부산".into()],
            },
            Entity {
                name: "Busanjin-gu".into(),
                code: None,
                aliases: vec!["부산진구".into()],
            },
        ])
    }

    #[test]
    fn test_normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("What's the WEATHER,  in Seoul?"), "what s the weather in seoul");
        assert_eq!(normalize("서울 날씨 어때?"), "서울 날씨 어때");
    }

    #[test]
    fn test_case_insensitive_with_original_span() {
        let reg = cities();
        let m = reg.find_first("Weather in SEOUL tomorrow").unwrap();
        assert_eq!(m.entity.name, "Seoul");
        assert_eq!(m.raw, "SEOUL");
        assert!(m.word_boundary);
        assert!(!m.alias_resolved);
    }

    #[test]
    fn test_longest_alias_wins() {
        let reg = cities();
        let m = reg.find_first("부산진구 날씨").unwrap();
        assert_eq!(m.entity.name, "Busanjin-gu");
        let m = reg.find_first("서울시 날씨").unwrap();
        assert_eq!(m.raw, "서울시");
        assert!(m.alias_resolved);
    }

    #[test]
    fn test_korean_particle_keeps_boundary() {
        let reg = cities();
        let m = reg.find_first("서울의 날씨는?").unwrap();
        assert_eq!(m.entity.name, "Seoul");
        assert!(m.word_boundary);
    }

    #[test]
    fn test_substring_match_is_not_boundary() {
        let reg = cities();
        let m = reg.find_first("the seoulful city").unwrap();
        assert!(!m.word_boundary);
    }

    #[test]
    fn test_matches_do_not_overlap() {
        let reg = cities();
        let all = reg.find_all("Seoul and Busan, then 서울 again");
        let names: Vec<&str> = all.iter().map(|m| m.entity.name.as_str()).collect();
        assert_eq!(names, vec!["Seoul", "Busan", "Seoul"]);
    }

    #[test]
    fn test_resolve_exact_then_contained() {
        let reg = cities();
        assert_eq!(reg.resolve("서울").unwrap().name, "Seoul");
        assert_eq!(reg.resolve("The city is Busan.").unwrap().name, "Busan");
        assert!(reg.resolve("Paris").is_none());
    }

    #[test]
    fn test_scan_where_rejection_does_not_consume() {
        let index = PhraseIndex::new(vec![("rain".to_string(), ()), ("train".to_string(), ())]);
        // "train" is rejected and "rain" inside it is not a whole word; only
        // the standalone "rain" is taken.
        let hits = index.scan_where("a train in the rain", |m| m.phrase != "train" && m.word_boundary);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].raw, "rain");
        assert_eq!(hits[0].start, 15);
    }

    #[test]
    fn test_six_digit_codes() {
        assert_eq!(
            find_six_digit_codes("005930 주가 알려줘"),
            vec![(0, "005930".to_string())]
        );
        assert_eq!(find_six_digit_codes("005930의 시세"), vec![(0, "005930".to_string())]);
        assert!(find_six_digit_codes("call 0059301").is_empty());
        assert!(find_six_digit_codes("A005930").is_empty());
        assert!(find_six_digit_codes("12345").is_empty());
    }
}
