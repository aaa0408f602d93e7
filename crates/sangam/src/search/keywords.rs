use std::collections::{HashMap, HashSet};

/// Upper bound on the number of base keywords extracted from a query.
/// Boosted adjective/numeral tokens may push the final list past this.
pub const MAX_KEYWORDS: usize = 7;

// English only for now.
const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an",
    "and", "any", "are", "as", "at", "be", "because", "been", "before",
    "being", "below", "between", "both", "but", "by", "can", "could", "did",
    "do", "does", "doing", "down", "during", "each", "few", "for", "from",
    "further", "had", "has", "have", "having", "he", "her", "here", "hers",
    "him", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just",
    "me", "more", "most", "my", "no", "nor", "not", "now", "of", "off", "on",
    "once", "only", "or", "other", "our", "ours", "out", "over", "own",
    "same", "she", "should", "so", "some", "such", "than", "that", "the",
    "their", "theirs", "them", "then", "there", "these", "they", "this",
    "those", "through", "to", "too", "under", "until", "up", "very", "was",
    "we", "were", "what", "when", "where", "which", "while", "who", "whom",
    "why", "will", "with", "would", "you", "your", "yours",
];

const NUMBER_WORDS: &[&str] = &[
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight",
    "nine", "ten", "eleven", "twelve", "thirteen", "fourteen", "fifteen",
    "sixteen", "seventeen", "eighteen", "nineteen", "twenty", "thirty",
    "forty", "fifty", "sixty", "seventy", "eighty", "ninety", "hundred",
    "thousand", "million", "billion", "first", "second", "third", "fourth",
    "fifth", "sixth", "seventh", "eighth", "ninth", "tenth",
];

// Suffixes that mark a token as adjective-like. A heuristic stand-in for a
// real part-of-speech tagger; only applied to tokens of 5+ characters to
// limit false positives.
const ADJECTIVE_SUFFIXES: &[&str] = &[
    "ous", "ful", "ive", "able", "ible", "less", "ish", "ical", "ary", "ant",
    "ent",
];

/// Reduce a query sentence to its salient unigrams.
///
/// Up to [`MAX_KEYWORDS`] terms are picked by an unsupervised score built
/// from term frequency, position of first occurrence, and casing. A second
/// pass appends any adjective-like or numeral token not already selected —
/// appended after the base list so the extractor's priority ordering is
/// preserved.
pub fn extract(sentence: &str) -> Vec<String> {
    let tokens = tokenize(sentence);
    let mut keywords = score_candidates(&tokens);
    boost_modifiers(&mut keywords, &tokens);
    keywords
}

struct Token {
    raw: String,
    lower: String,
}

fn tokenize(sentence: &str) -> Vec<Token> {
    sentence
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .map(|w| Token {
            raw: w.to_string(),
            lower: w.to_lowercase(),
        })
        .collect()
}

fn score_candidates(tokens: &[Token]) -> Vec<String> {
    let stop_words: HashSet<&str> = STOP_WORDS.iter().copied().collect();

    struct Candidate {
        first_pos: usize,
        frequency: u32,
        cased: u32,
    }

    let mut candidates: HashMap<&str, Candidate> = HashMap::new();
    for (pos, token) in tokens.iter().enumerate() {
        if token.lower.len() < 2 || stop_words.contains(token.lower.as_str()) {
            continue;
        }
        let cased = token.raw.chars().next().is_some_and(|c| c.is_uppercase());
        let entry = candidates.entry(token.lower.as_str()).or_insert(Candidate {
            first_pos: pos,
            frequency: 0,
            cased: 0,
        });
        entry.frequency += 1;
        // Sentence-initial capitals carry no signal.
        if cased && pos > 0 {
            entry.cased += 1;
        }
    }

    // Lower is better: rare, late, uncased terms score high and drop out.
    let mut scored: Vec<(&str, f32)> = candidates
        .iter()
        .map(|(term, c)| {
            let relative_pos = c.first_pos as f32 / tokens.len().max(1) as f32;
            let score = (1.0 + relative_pos) / (c.frequency as f32 * (1.0 + c.cased as f32));
            (*term, score)
        })
        .collect();
    scored.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });

    scored
        .into_iter()
        .take(MAX_KEYWORDS)
        .map(|(term, _)| term.to_string())
        .collect()
}

/// Append adjectives and numerals found in the raw token stream, lowercased
/// and deduplicated, to the end of the keyword list.
fn boost_modifiers(keywords: &mut Vec<String>, tokens: &[Token]) {
    for token in tokens {
        if !is_numeral(&token.lower) && !is_adjective_like(&token.lower) {
            continue;
        }
        if !keywords.iter().any(|k| k == &token.lower) {
            keywords.push(token.lower.clone());
        }
    }
}

fn is_numeral(word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let bare: String = word.chars().filter(|c| *c != ',').collect();
    if bare.parse::<f64>().is_ok() {
        return true;
    }
    // Ordinals: 1st, 2nd, 3rd, 11th, ...
    let digits: String = bare.chars().take_while(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() {
        let rest = &bare[digits.len()..];
        if matches!(rest, "st" | "nd" | "rd" | "th") {
            return true;
        }
    }
    NUMBER_WORDS.contains(&word)
}

fn is_adjective_like(word: &str) -> bool {
    word.len() >= 5
        && !NUMBER_WORDS.contains(&word)
        && ADJECTIVE_SUFFIXES.iter().any(|s| word.ends_with(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_base_keywords_at_seven() {
        let sentence =
            "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo";
        let tokens = tokenize(sentence);
        assert_eq!(score_candidates(&tokens).len(), MAX_KEYWORDS);
    }

    #[test]
    fn drops_stop_words() {
        let keywords = extract("what is the fastest network protocol");
        assert!(!keywords.iter().any(|k| k == "the" || k == "is" || k == "what"));
        assert!(keywords.iter().any(|k| k == "network"));
        assert!(keywords.iter().any(|k| k == "protocol"));
    }

    #[test]
    fn repeated_terms_rank_higher() {
        let keywords = extract("cache invalidation cache coherence cache misses");
        assert_eq!(keywords[0], "cache");
    }

    #[test]
    fn numerals_are_boosted() {
        let keywords = extract("revenue for 2023 in the 3rd quarter");
        assert!(keywords.iter().any(|k| k == "2023"));
        assert!(keywords.iter().any(|k| k == "3rd"));
    }

    #[test]
    fn number_words_are_boosted() {
        let keywords = extract("the third paragraph of chapter seven");
        assert!(keywords.iter().any(|k| k == "third"));
        assert!(keywords.iter().any(|k| k == "seven"));
    }

    #[test]
    fn adjectives_are_boosted_without_duplicates() {
        let keywords = extract("dangerous chemicals in the dangerous warehouse");
        let count = keywords.iter().filter(|k| *k == "dangerous").count();
        assert_eq!(count, 1);
    }

    #[test]
    fn boost_preserves_base_ordering() {
        let sentence = "storage engines storage compaction with 42 shards";
        let keywords = extract(sentence);
        // "42" is appended by the boost pass, never prepended.
        let pos_storage = keywords.iter().position(|k| k == "storage").unwrap();
        let pos_42 = keywords.iter().position(|k| k == "42").unwrap();
        assert!(pos_storage < pos_42);
    }

    #[test]
    fn empty_query_yields_nothing() {
        assert!(extract("").is_empty());
        assert!(extract("   ").is_empty());
    }
}
