//! Fuzzy text similarity
//!
//! All scores are in `0.0..=1.0`. The character ratio is the normalised
//! indel distance `2 * lcs / (len_a + len_b)`, so a single dropped letter in
//! an eight-letter name ("scrible" vs "scribble") still scores above 0.9.

use std::collections::HashSet;

/// Punctuation stripped from token edges before matching
const EDGE_PUNCTUATION: &[char] = &[
    '.', ',', '!', '?', ';', ':', '"', '\'', '(', ')', '[', ']', '{', '}', '*', '_', '~', '`',
];

/// Lowercase and collapse whitespace
#[must_use]
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split text into lowercase tokens with edge punctuation removed
#[must_use]
pub fn tokens(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(EDGE_PUNCTUATION).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Character-level similarity ratio
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    (2 * lcs_len(&a, &b)) as f64 / total as f64
}

/// Longest common subsequence length, two-row DP
fn lcs_len(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Best similarity between `phrase` and any same-length run of tokens in `text`
///
/// Case-insensitive. Multi-word phrases are compared against sliding windows
/// of the same word count.
#[must_use]
pub fn best_phrase_match(text: &str, phrase: &str) -> f64 {
    let phrase_tokens = tokens(phrase);
    if phrase_tokens.is_empty() {
        return 0.0;
    }
    let phrase = phrase_tokens.join(" ");
    let text_tokens = tokens(text);
    if text_tokens.len() < phrase_tokens.len() {
        return if text_tokens.is_empty() {
            0.0
        } else {
            ratio(&text_tokens.join(" "), &phrase)
        };
    }

    text_tokens
        .windows(phrase_tokens.len())
        .map(|window| ratio(&window.join(" "), &phrase))
        .fold(0.0, f64::max)
}

/// Whether two pieces of free text say the same thing
///
/// Either the character ratio or the word overlap (which ignores word order)
/// must reach `threshold`.
#[must_use]
pub fn is_near_duplicate(a: &str, b: &str, threshold: f64) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    a == b || ratio(&a, &b) >= threshold || word_jaccard(&a, &b) >= threshold
}

/// Word-level Jaccard similarity
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn word_jaccard(a: &str, b: &str) -> f64 {
    let a_words: HashSet<String> = tokens(a).into_iter().collect();
    let b_words: HashSet<String> = tokens(b).into_iter().collect();
    if a_words.is_empty() && b_words.is_empty() {
        return 1.0;
    }
    let intersection = a_words.intersection(&b_words).count();
    let union = a_words.union(&b_words).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}
