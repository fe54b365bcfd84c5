// ---------------------------------------------------------------------------
// Text utilities
// ---------------------------------------------------------------------------
//
// Token sets, Jaccard overlap and string normalization shared by topic
// canonicalization, content hashing and link enrichment.
// ---------------------------------------------------------------------------

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

// ---------------------------------------------------------------------------
// Stop words
// ---------------------------------------------------------------------------

/// Function words that carry no topic identity. Topic labels arrive in
/// English, Russian and Ukrainian.
const STOP_WORDS: &[&str] = &[
	// en
	"a", "an", "and", "as", "at", "by", "for", "from", "in", "into", "of", "on", "or", "over",
	"the", "to", "vs", "with",
	// ru
	"в", "во", "и", "к", "на", "над", "о", "об", "от", "по", "под", "при", "с", "со", "у",
	"для", "из", "за", "против",
	// uk
	"і", "й", "та", "від", "до", "щодо", "проти",
];

fn stop_words() -> &'static HashSet<&'static str> {
	static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
	SET.get_or_init(|| STOP_WORDS.iter().copied().collect())
}

fn whitespace_run() -> Option<&'static Regex> {
	static RE: OnceLock<Option<Regex>> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"\s+").ok()).as_ref()
}

// ---------------------------------------------------------------------------
// Tokenisation
// ---------------------------------------------------------------------------

/// Lowercase, split on whitespace and strip punctuation surrounding each
/// token. Interior punctuation ("u.s.", "covid-19") is kept.
pub fn tokenize(text: &str) -> Vec<String> {
	text.to_lowercase()
		.split_whitespace()
		.map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
		.filter(|t| !t.is_empty())
		.map(|t| t.to_string())
		.collect()
}

/// Token set with stop words removed. Falls back to the full token set when
/// every token is a stop word, so "The" still has an identity.
pub fn token_set(text: &str) -> HashSet<String> {
	let tokens = tokenize(text);
	let content: HashSet<String> = tokens
		.iter()
		.filter(|t| !stop_words().contains(t.as_str()))
		.cloned()
		.collect();
	if content.is_empty() {
		tokens.into_iter().collect()
	} else {
		content
	}
}

/// Jaccard index of two sets. 0 when either is empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
	if a.is_empty() || b.is_empty() {
		return 0.0;
	}
	let intersection = a.intersection(b).count();
	let union = a.len() + b.len() - intersection;
	intersection as f64 / union as f64
}

/// Token-set Jaccard similarity of two phrases.
pub fn token_jaccard(a: &str, b: &str) -> f64 {
	jaccard(&token_set(a), &token_set(b))
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Trim and collapse internal whitespace runs to single spaces.
pub fn collapse_whitespace(text: &str) -> String {
	match whitespace_run() {
		Some(re) => re.replace_all(text.trim(), " ").into_owned(),
		None => text.split_whitespace().collect::<Vec<_>>().join(" "),
	}
}

/// Uppercase the first letter of every word, lowercase the rest. In mixed
/// case text, short all-uppercase words are kept as written.
pub fn title_case(text: &str) -> String {
	let mixed_case = text.chars().any(|c| c.is_lowercase());
	text.split_whitespace()
		.map(|word| {
			if mixed_case && is_acronym(word) {
				return word.to_string();
			}
			let mut chars = word.chars();
			match chars.next() {
				Some(first) => first
					.to_uppercase()
					.chain(chars.flat_map(|c| c.to_lowercase()))
					.collect::<String>(),
				None => String::new(),
			}
		})
		.collect::<Vec<_>>()
		.join(" ")
}

/// Short all-uppercase words such as `NATO` or `EU`.
fn is_acronym(word: &str) -> bool {
	let letters = word.chars().filter(|c| c.is_alphabetic()).count();
	(2..=4).contains(&letters)
		&& word.chars().filter(|c| c.is_alphabetic()).all(|c| c.is_uppercase())
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
	match text.char_indices().nth(max_chars) {
		Some((idx, _)) => &text[..idx],
		None => text,
	}
}
