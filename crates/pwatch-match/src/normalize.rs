//! Text canonicalization primitives.
//!
//! Two folding modes coexist and are kept apart on purpose: [`simple_fold_name`]
//! backs the time-diffing path and [`fold_text`] backs identity resolution and
//! cross-site grouping. They disagree on accents and letter/digit boundaries.

use std::collections::HashSet;

use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::DictionaryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FoldMode {
    /// Lowercase, invisible-character and whitespace cleanup only.
    Strict,
    /// Accent stripping, letter/digit splitting, punctuation removal.
    Deep,
}

pub fn fold(mode: FoldMode, input: &str) -> String {
    match mode {
        FoldMode::Strict => simple_fold_name(input),
        FoldMode::Deep => fold_text(input),
    }
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deep normalization: `"Can-Am Outlander"` -> `"can am outlander"`,
/// `"Ninja500"` -> `"ninja 500"`, `"Modèle"` -> `"modele"`.
pub fn fold_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut prev = ' ';
    for ch in input
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
    {
        let ch = if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            ch
        } else {
            ' '
        };
        let boundary = (prev.is_ascii_lowercase() && ch.is_ascii_digit())
            || (prev.is_ascii_digit() && ch.is_ascii_lowercase());
        if boundary {
            out.push(' ');
        }
        out.push(ch);
        prev = ch;
    }
    collapse_whitespace(&out)
}

fn is_invisible(ch: char) -> bool {
    matches!(
        ch,
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
    )
}

fn is_curly_quote(ch: char) -> bool {
    matches!(
        ch,
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}'
    )
}

/// Light normalization used to key products by name across snapshots.
/// No accent stripping and no letter/digit splitting.
pub fn simple_fold_name(input: &str) -> String {
    let cleaned: String = input
        .to_lowercase()
        .chars()
        .filter(|c| !is_invisible(*c) && !is_curly_quote(*c))
        .collect();
    collapse_whitespace(&cleaned)
}

/// Case-insensitive `str::strip_prefix`.
fn strip_prefix_ci<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    let mut offset = 0;
    let mut chars = input.chars();
    for expected in prefix.chars() {
        let actual = chars.next()?;
        if !actual.to_lowercase().eq(expected.to_lowercase()) {
            return None;
        }
        offset += actual.len_utf8();
    }
    Some(&input[offset..])
}

/// Remove a leading `"<Label> :"` prefix such as `"Manufacturer: "` or `"Model : "`.
pub fn strip_label_prefix<S: AsRef<str>>(input: &str, labels: &[S]) -> String {
    let trimmed = input.trim_start();
    for label in labels {
        let Some(rest) = strip_prefix_ci(trimmed, label.as_ref()) else {
            continue;
        };
        if let Some(value) = rest.trim_start().strip_prefix(':') {
            return value.trim().to_string();
        }
    }
    input.trim().to_string()
}

/// Compiled dealer-noise patterns, applied to deep-folded text.
#[derive(Debug, Clone)]
pub struct DealerNoise {
    patterns: Vec<Regex>,
}

impl DealerNoise {
    pub fn new<S: AsRef<str>>(patterns: &[S], cities: &[S]) -> Result<Self, DictionaryError> {
        let mut compiled = Vec::with_capacity(patterns.len() + 1);
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let re = Regex::new(pattern).map_err(|source| DictionaryError::Pattern {
                pattern: pattern.to_string(),
                source,
            })?;
            compiled.push(re);
        }

        let cities = cities
            .iter()
            .map(|c| fold_text(c.as_ref()))
            .filter(|c| !c.is_empty())
            .map(|c| regex::escape(&c))
            .collect::<Vec<_>>();
        if !cities.is_empty() {
            let pattern = format!(r"\b(?:(?:in|at|a|de|du)\s+)?(?:{})\b.*$", cities.join("|"));
            let re = Regex::new(&pattern).map_err(|source| DictionaryError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
            compiled.push(re);
        }

        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Drop trailing "for sale at ..." / dealership / city clauses from folded text.
pub fn strip_dealer_noise(input: &str, noise: &DealerNoise) -> String {
    let mut text = input.to_string();
    for re in &noise.patterns {
        text = re.replace_all(&text, " ").into_owned();
    }
    collapse_whitespace(&text)
}

/// Deep-fold `input` and drop every token that is a known color word.
pub fn strip_colors(input: &str, colors: &HashSet<String>) -> String {
    fold_text(input)
        .split(' ')
        .filter(|token| !token.is_empty() && !colors.contains(*token))
        .collect::<Vec<_>>()
        .join(" ")
}
