use lazy_static::lazy_static;
use std::collections::HashMap;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

lazy_static! {
    static ref NORMALIZER: TextNormalizer = TextNormalizer::new();
}

/// Canonicalize chat text for matching. See [`TextNormalizer::normalize`].
pub fn normalize(text: &str) -> String {
    NORMALIZER.normalize(text)
}

/// Normalized text reduced to ASCII letters and digits.
pub fn letters_and_digits(text: &str) -> String {
    NORMALIZER
        .normalize(text)
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfuscationTechnique {
    UnicodeHomoglyphs,
    ZeroWidthCharacters,
    CombiningCharacters,
    CompatibilityForms,
}

pub struct TextNormalizer {
    homoglyph_map: HashMap<char, char>,
    zero_width_chars: Vec<char>,
}

impl TextNormalizer {
    pub fn new() -> Self {
        let mut homoglyph_map = HashMap::new();

        let table: &[(&str, char)] = &[
            // Cyrillic, Greek, Devanagari and small-capital look-alikes
            ("оΟο०ᴏ", 'o'),
            ("рРᴘρ", 'p'),
            ("ѕʂ", 's'),
            ("υᴜ", 'u'),
            ("ɡɢ", 'g'),
            ("ʀ", 'r'),
            ("аα", 'a'),
            ("е", 'e'),
            ("і", 'i'),
            ("хΧχ", 'x'),
            ("јȷ", 'j'),
            ("с", 'c'),
            // Fullwidth forms
            ("Ｏｏ", 'o'),
            ("Ｐｐ", 'p'),
            ("Ｓｓ", 's'),
            ("Ｕｕ", 'u'),
            ("Ｇｇ", 'g'),
            ("Ｒｒ", 'r'),
            ("Ａａ", 'a'),
            ("Ｅｅ", 'e'),
            ("Ｉｉ", 'i'),
            ("Ｘｘ", 'x'),
        ];
        for (sources, latin) in table {
            for ch in sources.chars() {
                homoglyph_map.insert(ch, *latin);
            }
        }

        Self {
            homoglyph_map,
            zero_width_chars: vec!['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}'],
        }
    }

    /// Decompose (NFKD), lower-case, drop combining marks and zero-width
    /// characters, then fold homoglyphs to Latin. `@` is kept as-is.
    ///
    /// The result is stable under a second application.
    pub fn normalize(&self, text: &str) -> String {
        if text.is_ascii() {
            return text.to_ascii_lowercase();
        }

        let mut result = String::with_capacity(text.len());
        for decomposed in text.nfkd() {
            for ch in decomposed.to_lowercase() {
                if is_combining_mark(ch) || self.zero_width_chars.contains(&ch) {
                    continue;
                }
                match self.homoglyph_map.get(&ch) {
                    Some(&latin) => result.push(latin),
                    None => result.push(ch),
                }
            }
        }
        result
    }

    /// Report which evasion techniques appear in the raw text.
    pub fn obfuscation_indicators(&self, text: &str) -> Vec<ObfuscationTechnique> {
        let mut techniques = Vec::new();
        if text.is_ascii() {
            return techniques;
        }

        let lowered: String = text.chars().flat_map(char::to_lowercase).collect();
        if lowered.chars().any(|c| self.homoglyph_map.contains_key(&c)) {
            techniques.push(ObfuscationTechnique::UnicodeHomoglyphs);
        }
        if text.chars().any(|c| self.zero_width_chars.contains(&c)) {
            techniques.push(ObfuscationTechnique::ZeroWidthCharacters);
        }
        if text.nfd().any(is_combining_mark) {
            techniques.push(ObfuscationTechnique::CombiningCharacters);
        }
        if text.nfkd().collect::<String>() != text.nfd().collect::<String>() {
            techniques.push(ObfuscationTechnique::CompatibilityForms);
        }
        techniques
    }
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new()
    }
}
