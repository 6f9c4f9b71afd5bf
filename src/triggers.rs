use crate::normalization::{letters_and_digits, normalize};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

/// Reserved prefix marking an exact-phrase rule.
pub const EXACT_PREFIX: &str = "exact:";

/// Trigger text loaded when the stored trigger list is blank.
pub const DEFAULT_TRIGGERS: &[&str] = &["stoprugs", "solspoint", "@*rug*", "full*bundled*dont*buy"];

lazy_static! {
    // @ followed by a token containing "rug"
    static ref FALLBACK_RUG_MENTION: Regex = Regex::new(r"(?i)@\S*rug\S*").unwrap();
}

const FALLBACK_SUBSTRINGS: &[&str] = &["stoprugs", "solspoint"];

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Invalid wildcard trigger '{pattern}': {source}")]
    InvalidWildcard {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    ExactPhrase,
    Wildcard,
    Substring,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::ExactPhrase => write!(f, "exact"),
            TriggerKind::Wildcard => write!(f, "wildcard"),
            TriggerKind::Substring => write!(f, "substring"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TriggerRule {
    ExactPhrase { raw: String, letters: String },
    Wildcard {
        raw: String,
        regex: Regex,
        /// Same pattern over punctuation-free text; absent when stripping
        /// would empty a literal segment.
        loose: Option<Regex>,
    },
    Substring { raw: String, needle: String },
}

impl TriggerRule {
    /// Parse one trigger line. Returns `Ok(None)` for lines that cannot match
    /// anything useful (blank, or an exact phrase without letters or digits).
    pub fn parse(raw: &str) -> Result<Option<Self>, TriggerError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        if let Some(phrase) = raw.strip_prefix(EXACT_PREFIX) {
            let letters = letters_and_digits(phrase.trim());
            if letters.is_empty() {
                log::warn!("Ignoring exact trigger without letters or digits: '{raw}'");
                return Ok(None);
            }
            return Ok(Some(TriggerRule::ExactPhrase {
                raw: raw.to_string(),
                letters,
            }));
        }

        let normalized = normalize(raw);
        if raw.contains('*') {
            let regex = wildcard_regex(raw, &normalized)?;
            let loose = match loose_pattern(&normalized) {
                Some(pattern) => Some(wildcard_regex(raw, &pattern)?),
                None => None,
            };
            return Ok(Some(TriggerRule::Wildcard {
                raw: raw.to_string(),
                regex,
                loose,
            }));
        }

        Ok(Some(TriggerRule::Substring {
            raw: raw.to_string(),
            needle: normalized,
        }))
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerRule::ExactPhrase { .. } => TriggerKind::ExactPhrase,
            TriggerRule::Wildcard { .. } => TriggerKind::Wildcard,
            TriggerRule::Substring { .. } => TriggerKind::Substring,
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            TriggerRule::ExactPhrase { raw, .. }
            | TriggerRule::Wildcard { raw, .. }
            | TriggerRule::Substring { raw, .. } => raw,
        }
    }

    fn matches(&self, message: &PreparedMessage) -> bool {
        match self {
            TriggerRule::ExactPhrase { letters, .. } => *letters == message.letters,
            TriggerRule::Wildcard { regex, loose, .. } => {
                regex.is_match(&message.normalized)
                    || loose
                        .as_ref()
                        .is_some_and(|loose| loose.is_match(&message.unpunctuated))
            }
            TriggerRule::Substring { needle, .. } => message.normalized.contains(needle.as_str()),
        }
    }
}

/// The active rule list. An empty list classifies with the built-in
/// fallback patterns; user rules and fallback are never combined.
#[derive(Debug, Clone, Default)]
pub struct TriggerSet {
    rules: Vec<TriggerRule>,
}

impl TriggerSet {
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, TriggerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for pattern in patterns {
            if let Some(rule) = TriggerRule::parse(pattern.as_ref())? {
                rules.push(rule);
            }
        }
        Ok(Self { rules })
    }

    /// Parse stored trigger text: one rule per line, blank lines and `#`
    /// comment lines skipped. Text without any rule loads
    /// [`DEFAULT_TRIGGERS`].
    pub fn parse(text: &str) -> Result<Self, TriggerError> {
        let lines = parse_trigger_lines(text);
        if lines.is_empty() {
            log::debug!(
                "No custom triggers - using {} default patterns",
                DEFAULT_TRIGGERS.len()
            );
            return Self::defaults();
        }
        Self::from_patterns(&lines)
    }

    pub fn defaults() -> Result<Self, TriggerError> {
        Self::from_patterns(DEFAULT_TRIGGERS)
    }

    pub fn rules(&self) -> &[TriggerRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn is_spam(&self, raw: &str) -> bool {
        self.find_match(raw).is_some()
    }

    /// Name of the first rule matching `raw`, or of the fallback pattern
    /// that matched when no rules are configured.
    pub fn find_match(&self, raw: &str) -> Option<String> {
        if raw.trim().is_empty() {
            return None;
        }
        let normalized = normalize(raw);
        log::trace!(
            "Checking message against {} triggers (normalized: \"{}\")",
            self.rules.len(),
            truncate_chars(&normalized, 50)
        );

        if self.rules.is_empty() {
            return Self::fallback_match(&normalized);
        }

        let message = PreparedMessage::new(normalized);
        self.rules
            .iter()
            .find(|rule| rule.matches(&message))
            .map(|rule| rule.raw().to_string())
    }

    fn fallback_match(normalized: &str) -> Option<String> {
        if let Some(needle) = FALLBACK_SUBSTRINGS
            .iter()
            .find(|needle| normalized.contains(*needle))
        {
            return Some(needle.to_string());
        }
        if FALLBACK_RUG_MENTION.is_match(normalized) {
            return Some(FALLBACK_RUG_MENTION.as_str().to_string());
        }
        None
    }
}

/// Forms of one message shared by every rule check.
struct PreparedMessage {
    normalized: String,
    unpunctuated: String,
    letters: String,
}

impl PreparedMessage {
    fn new(normalized: String) -> Self {
        let letters = normalized
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .collect();
        let unpunctuated = strip_punctuation(&normalized);
        Self {
            normalized,
            unpunctuated,
            letters,
        }
    }
}

fn wildcard_regex(raw: &str, normalized: &str) -> Result<Regex, TriggerError> {
    let body = normalized
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?is){body}")).map_err(|source| TriggerError::InvalidWildcard {
        pattern: raw.to_string(),
        source,
    })
}

/// The wildcard pattern with punctuation removed, or `None` when a literal
/// segment would lose all of its letters and digits (`!!*!!` would turn
/// into a bare `*`).
fn loose_pattern(normalized: &str) -> Option<String> {
    let stripped = strip_punctuation(normalized);
    let degenerate = normalized
        .split('*')
        .zip(stripped.split('*'))
        .any(|(segment, kept)| kept != segment && !kept.chars().any(char::is_alphanumeric));
    (!degenerate).then_some(stripped)
}

// Keeps `*` so wildcard patterns survive stripping.
fn strip_punctuation(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '@' | '*'))
        .collect()
}

/// Split stored trigger text into rule lines, dropping blanks and comments.
pub fn parse_trigger_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[&str]) -> TriggerSet {
        TriggerSet::from_patterns(patterns).unwrap()
    }

    #[test]
    fn test_wildcard_spans_words_and_punctuation() {
        let triggers = set(&["full*bundled*dont*buy"]);
        assert!(triggers.is_spam("FULL random bundled, dont buy!!"));
        assert!(triggers.is_spam("FULL random bundled, don't buy!!"));
        assert!(!triggers.is_spam("buy the full bundle"));
    }

    #[test]
    fn test_wildcard_crosses_newlines() {
        let triggers = set(&["full*buy"]);
        assert!(triggers.is_spam("full\nbundle\nbuy"));
    }

    #[test]
    fn test_wildcard_escapes_regex_metacharacters() {
        let triggers = set(&["a.b*c"]);
        assert!(triggers.is_spam("a.b then c"));
        assert!(!triggers.is_spam("axb c"));
    }

    #[test]
    fn test_exact_phrase_compares_letters_and_digits() {
        let triggers = set(&["exact:stop rugs now"]);
        assert!(triggers.is_spam("Stop... RUGS now!"));
        assert!(triggers.is_spam("s-t-o-p rugs   now"));
        assert!(!triggers.is_spam("stop rugs"));
        assert!(!triggers.is_spam("please stop rugs now"));
        // digits are kept, so a zero is not an o
        assert!(!triggers.is_spam("St0p... RUGS now!"));

        let triggers = set(&["exact:st0p rugs now"]);
        assert!(triggers.is_spam("St0p... RUGS now!"));
    }

    #[test]
    fn test_exact_phrase_sees_through_homoglyphs() {
        let triggers = set(&["exact:stop rugs now"]);
        assert!(triggers.is_spam("ѕtοр rúgs ñow"));
    }

    #[test]
    fn test_exact_phrase_without_letters_is_dropped() {
        let triggers = set(&["exact: ... "]);
        assert!(triggers.is_empty());
    }

    #[test]
    fn test_substring_is_normalized_on_both_sides() {
        let triggers = set(&["SolsPoint"]);
        assert!(triggers.is_spam("visit ѕolѕpοint today"));
        assert!(!triggers.is_spam("sols point"));
    }

    #[test]
    fn test_first_match_wins() {
        let triggers = set(&["exact:gm", "g*m", "gm"]);
        assert_eq!(triggers.find_match("GM!").as_deref(), Some("exact:gm"));
        assert_eq!(triggers.find_match("good morning").as_deref(), Some("g*m"));
    }

    #[test]
    fn test_fallback_when_no_rules() {
        let triggers = TriggerSet::default();
        assert!(triggers.is_spam("@foo_rug_bot"));
        assert!(triggers.is_spam("check STOPRUGS"));
        assert!(triggers.is_spam("solspoint.io"));
        assert!(!triggers.is_spam("hello friend"));
        assert!(!triggers.is_spam("rug without mention"));
    }

    #[test]
    fn test_user_rules_replace_fallback() {
        let triggers = set(&["giveaway"]);
        assert!(!triggers.is_spam("@foo_rug_bot"));
        assert!(triggers.is_spam("free GIVEAWAY"));
    }

    #[test]
    fn test_blank_input_is_never_spam() {
        let triggers = TriggerSet::default();
        assert!(!triggers.is_spam(""));
        assert!(!triggers.is_spam("   \n\t"));
        assert!(!set(&["*"]).is_spam("  "));
    }

    #[test]
    fn test_punctuation_only_wildcard_is_not_a_catch_all() {
        let triggers = set(&["!!*!!"]);
        assert!(!triggers.is_spam("hello friend"));
        assert!(triggers.is_spam("wow!! free coins!!"));

        let triggers = set(&["$$$*$$$"]);
        assert!(!triggers.is_spam("gm everyone"));
        assert!(triggers.is_spam("$$$ pump $$$"));

        // Mixed segments still get the punctuation-free match.
        assert!(set(&["don't*buy"]).is_spam("dont ever buy"));
    }

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let triggers = TriggerSet::parse("# spam list\n\n  moon*soon \nexact:gm\n").unwrap();
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers.rules()[0].kind(), TriggerKind::Wildcard);
        assert_eq!(triggers.rules()[1].kind(), TriggerKind::ExactPhrase);
    }

    #[test]
    fn test_parse_blank_loads_defaults() {
        let triggers = TriggerSet::parse(" \n# only a comment\n").unwrap();
        let raws: Vec<&str> = triggers.rules().iter().map(|r| r.raw()).collect();
        assert_eq!(raws, DEFAULT_TRIGGERS);
        assert!(triggers.is_spam("@x_rug_y"));
        assert!(triggers.is_spam("Full bundled, dont buy"));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(TriggerKind::ExactPhrase.to_string(), "exact");
        assert_eq!(set(&["a*b"]).rules()[0].kind().to_string(), "wildcard");
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("ѕtοр", 2), "ѕt");
        assert_eq!(truncate_chars("ab", 5), "ab");
    }
}
