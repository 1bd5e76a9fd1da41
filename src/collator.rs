use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A parsed locale identifier (e.g. `de_DE`, `ru`, `tr_TR`).
///
/// Accepts the `language_COUNTRY` form with `_` or `-` as separator. The
/// language tag is lowercased, the country tag uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locale {
    /// ISO 639-1 language code (lowercase, e.g. "de", "ru", "tr").
    pub language: String,
    /// ISO 3166-1 country code (uppercase); `None` for language-only locales.
    pub country: Option<String>,
}

impl Locale {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty locale identifier".to_string()));
        }

        let parts: Vec<&str> = s.split(['_', '-']).collect();
        let language = parts[0].to_ascii_lowercase();
        if language.len() < 2 || language.len() > 3 {
            return Err(Error::Config(format!("invalid language code: '{language}'")));
        }

        let country = if parts.len() > 1 && !parts[1].is_empty() {
            Some(parts[1].to_ascii_uppercase())
        } else {
            None
        };

        Ok(Self { language, country })
    }

    /// Canonical string form (e.g. `"de_DE"`).
    pub fn canonical(&self) -> String {
        match &self.country {
            Some(c) => format!("{}_{c}", self.language),
            None => self.language.clone(),
        }
    }
}

impl std::fmt::Display for Locale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Produces byte collation keys whose lexicographic order matches the
/// locale-intended text order.
///
/// Implements primary-level Unicode ordering with per-language tailoring for
/// the common European cases. A category configures its collator from its
/// ordered locales list; for each character the first locale that tailors it
/// wins, the rest fall through to the untailored weight (case folded, accents
/// stripped, code point order — which also covers Cyrillic and CJK).
#[derive(Debug, Clone, Default)]
pub struct Collator {
    locales: Vec<Locale>,
}

impl Collator {
    pub fn new(locales: &[Locale]) -> Self {
        Self {
            locales: locales.to_vec(),
        }
    }

    pub fn locales(&self) -> &[Locale] {
        &self.locales
    }

    /// The collation key of `text`: each character contributes one or more
    /// 3-byte big-endian primary weights, so byte order equals weight order.
    pub fn collation_key(&self, text: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(text.len() * 3);
        for ch in text.chars() {
            for weight in self.char_weights(ch) {
                // weights stay below 2^24: code points cap at 0x10FFFF and
                // tailoring offsets are small
                key.write_u24::<BigEndian>(weight).unwrap();
            }
        }
        key
    }

    pub fn compare(&self, left: &str, right: &str) -> std::cmp::Ordering {
        self.collation_key(left).cmp(&self.collation_key(right))
    }

    fn char_weights(&self, ch: char) -> Vec<u32> {
        for locale in &self.locales {
            if let Some(weights) = tailored_weights(ch, &locale.language) {
                return weights;
            }
        }
        vec![default_weight(ch)]
    }
}

/// Language-specific weight overrides. Returns `None` when the language does
/// not tailor the character.
fn tailored_weights(ch: char, lang: &str) -> Option<Vec<u32>> {
    match lang {
        "de" => match ch {
            '\u{00E4}' | '\u{00C4}' => Some(vec![u32::from('a'), u32::from('e')]),
            '\u{00F6}' | '\u{00D6}' => Some(vec![u32::from('o'), u32::from('e')]),
            '\u{00FC}' | '\u{00DC}' => Some(vec![u32::from('u'), u32::from('e')]),
            '\u{00DF}' => Some(vec![u32::from('s'), u32::from('s')]),
            _ => None,
        },
        "sv" | "fi" => match ch {
            // a-ring, a-diaeresis and o-diaeresis sort after z
            '\u{00E5}' | '\u{00C5}' => Some(vec![u32::from('z') + 1]),
            '\u{00E4}' | '\u{00C4}' => Some(vec![u32::from('z') + 2]),
            '\u{00F6}' | '\u{00D6}' => Some(vec![u32::from('z') + 3]),
            _ => None,
        },
        "tr" | "az" => match ch {
            '\u{0131}' | '\u{0130}' | 'i' => Some(vec![u32::from('i')]),
            // plain I sorts right after dotless i
            'I' => Some(vec![u32::from('i') + 1]),
            _ => None,
        },
        "es" => match ch {
            // n-tilde sorts between n and o
            '\u{00F1}' | '\u{00D1}' => Some(vec![u32::from('n') + 1]),
            _ => None,
        },
        _ => None,
    }
}

fn default_weight(ch: char) -> u32 {
    let base = strip_diacritic(ch);
    u32::from(base.to_lowercase().next().unwrap_or(base))
}

/// Strip common Latin diacritical marks, returning the base character.
///
/// Covers the Latin-1 Supplement block used by European languages; characters
/// outside it pass through unchanged.
fn strip_diacritic(ch: char) -> char {
    match ch {
        '\u{00C0}'..='\u{00C5}' | '\u{00C6}' => 'A',
        '\u{00E0}'..='\u{00E5}' | '\u{00E6}' => 'a',
        '\u{00C7}' => 'C',
        '\u{00E7}' => 'c',
        '\u{00C8}'..='\u{00CB}' => 'E',
        '\u{00E8}'..='\u{00EB}' => 'e',
        '\u{00CC}'..='\u{00CF}' => 'I',
        '\u{00EC}'..='\u{00EF}' => 'i',
        '\u{00D1}' => 'N',
        '\u{00F1}' => 'n',
        '\u{00D2}'..='\u{00D6}' | '\u{00D8}' => 'O',
        '\u{00F2}'..='\u{00F6}' | '\u{00F8}' => 'o',
        '\u{00D9}'..='\u{00DC}' => 'U',
        '\u{00F9}'..='\u{00FC}' => 'u',
        '\u{00DD}' => 'Y',
        '\u{00FD}' | '\u{00FF}' => 'y',
        _ => ch,
    }
}
