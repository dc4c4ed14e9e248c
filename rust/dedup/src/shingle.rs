//! Shingling: normalized text → set of hashed n-grams.

use std::collections::HashSet;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{ShingleConfig, ShingleKind};

/// Turns text into a set of 64-bit shingle hashes.
#[derive(Debug, Clone)]
pub struct Shingler {
    config: ShingleConfig,
}

impl Shingler {
    /// Shingler for the given n-gram settings.
    pub fn new(config: ShingleConfig) -> Self {
        Self { config }
    }

    /// Generate the shingle set of `text`.
    ///
    /// Text shorter than one n-gram yields a single shingle of the whole
    /// text; empty text yields an empty set.
    pub fn shingles(&self, text: &str) -> HashSet<u64> {
        match self.config.kind {
            ShingleKind::Word => {
                let words: Vec<&str> = text.split_whitespace().collect();
                hash_windows(&words, self.config.size, " ")
            }
            ShingleKind::Char => {
                let chars: Vec<char> = text
                    .chars()
                    .filter(|c| !(self.config.strip_whitespace && c.is_whitespace()))
                    .collect();
                hash_char_windows(&chars, self.config.size)
            }
        }
    }

    /// Shingle settings in use.
    pub fn config(&self) -> &ShingleConfig {
        &self.config
    }
}

fn hash_windows(units: &[&str], n: usize, sep: &str) -> HashSet<u64> {
    let mut shingles = HashSet::new();
    if units.is_empty() {
        return shingles;
    }

    let mut buf = String::new();
    for window in units.windows(n.clamp(1, units.len())) {
        join_into(&mut buf, window, sep);
        shingles.insert(xxh3_64(buf.as_bytes()));
    }
    shingles
}

fn hash_char_windows(chars: &[char], n: usize) -> HashSet<u64> {
    let mut shingles = HashSet::new();
    if chars.is_empty() {
        return shingles;
    }

    let mut buf = String::new();
    for window in chars.windows(n.clamp(1, chars.len())) {
        buf.clear();
        buf.extend(window);
        shingles.insert(xxh3_64(buf.as_bytes()));
    }
    shingles
}

fn join_into(buf: &mut String, parts: &[&str], sep: &str) {
    buf.clear();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            buf.push_str(sep);
        }
        buf.push_str(part);
    }
}

/// True Jaccard similarity of two shingle sets.
///
/// Two empty sets are identical and score 1.0.
pub fn exact_jaccard(a: &HashSet<u64>, b: &HashSet<u64>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}
