// ---------------------------------------------------------------------------
// Topic canonicalization
// ---------------------------------------------------------------------------
//
// Raw topic labels come from upstream scoring in several languages and with
// free phrasing. Each run folds them into canonical buckets:
//
// 1. normalize: trim, synonym table, title case keeping acronyms, default label
// 2. canonicalize: token-set Jaccard against topics already seen this run
//
// Groups are built in input order so the same items always produce the same
// canonical labels.
// ---------------------------------------------------------------------------

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::text::{collapse_whitespace, jaccard, title_case, token_set};
use crate::types::Item;

/// Label for items that arrive without a topic.
pub const DEFAULT_TOPIC: &str = "General";

/// Token-set Jaccard at or above which two labels share a bucket.
pub const TOPIC_MERGE_THRESHOLD: f64 = 0.8;

/// Spellings and scripts of the same entity, keyed by lowercase form.
const SYNONYMS: &[(&str, &[&str])] = &[
	("Ukraine", &["ukraine", "украина", "україна", "украине", "ukraina"]),
	("Russia", &["russia", "россия", "росія", "рф", "russian federation"]),
	("USA", &["usa", "us", "u.s.", "u.s.a.", "united states", "сша", "америка", "штати"]),
	("United Kingdom", &["uk", "united kingdom", "britain", "great britain", "великобритания", "британія"]),
	("European Union", &["eu", "european union", "ес", "евросоюз", "єс", "євросоюз"]),
	("China", &["china", "китай", "кнр", "prc"]),
	("Israel", &["israel", "израиль", "ізраїль"]),
	("Belarus", &["belarus", "беларусь", "белоруссия", "білорусь"]),
	("Kazakhstan", &["kazakhstan", "казахстан"]),
	("Moldova", &["moldova", "молдова", "молдавия"]),
];

fn synonym_index() -> &'static HashMap<&'static str, &'static str> {
	static INDEX: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
	INDEX.get_or_init(|| {
		SYNONYMS
			.iter()
			.flat_map(|(canonical, variants)| variants.iter().map(move |v| (*v, *canonical)))
			.collect()
	})
}

/// Normalize a raw label: synonym lookup on the lowercase form, otherwise
/// the trimmed label in title case with short acronyms kept. Blank labels
/// become [`DEFAULT_TOPIC`].
pub fn normalize_topic(raw: &str) -> String {
	let trimmed = collapse_whitespace(raw);
	if trimmed.is_empty() {
		return DEFAULT_TOPIC.to_string();
	}
	if let Some(canonical) = synonym_index().get(trimmed.to_lowercase().as_str()) {
		return (*canonical).to_string();
	}
	title_case(&trimmed)
}

/// Fold a normalized label into one of the canonical topics already seen,
/// or return it unchanged as a new canonical topic.
pub fn canonicalize_topic(normalized: &str, seen: &[String]) -> String {
	let mut canonicalizer = TopicCanonicalizer::default();
	for topic in seen {
		canonicalizer.register(topic);
	}
	canonicalizer
		.find_existing(normalized)
		.unwrap_or_else(|| normalized.to_string())
}

// ---------------------------------------------------------------------------
// TopicCanonicalizer
// ---------------------------------------------------------------------------

/// Canonical topics established so far in one run, in first-seen order.
pub struct TopicCanonicalizer {
	threshold: f64,
	canonical: Vec<String>,
	tokens: Vec<HashSet<String>>,
	/// normalized label -> canonical topic
	resolved: HashMap<String, String>,
}

impl TopicCanonicalizer {
	pub fn new(threshold: f64) -> Self {
		Self {
			threshold,
			canonical: Vec::new(),
			tokens: Vec::new(),
			resolved: HashMap::new(),
		}
	}

	fn register(&mut self, topic: &str) {
		self.canonical.push(topic.to_string());
		self.tokens.push(token_set(topic));
	}

	/// Best existing canonical topic for `normalized`: an exact
	/// case-insensitive match, else the highest Jaccard at or above the
	/// threshold (earliest wins ties).
	fn find_existing(&self, normalized: &str) -> Option<String> {
		let lowered = normalized.to_lowercase();
		if let Some(exact) = self.canonical.iter().find(|c| c.to_lowercase() == lowered) {
			return Some(exact.clone());
		}

		let candidate = token_set(normalized);
		let mut best: Option<(usize, f64)> = None;
		for (idx, tokens) in self.tokens.iter().enumerate() {
			let score = jaccard(&candidate, tokens);
			if score >= self.threshold && best.is_none_or(|(_, s)| score > s) {
				best = Some((idx, score));
			}
		}
		best.map(|(idx, _)| self.canonical[idx].clone())
	}

	/// Normalize and canonicalize a raw label, registering it as a new
	/// canonical topic when nothing matches.
	pub fn resolve(&mut self, raw: &str) -> String {
		let normalized = normalize_topic(raw);
		if let Some(hit) = self.resolved.get(&normalized) {
			return hit.clone();
		}

		let canonical = match self.find_existing(&normalized) {
			Some(existing) => existing,
			None => {
				self.register(&normalized);
				normalized.clone()
			}
		};
		self.resolved.insert(normalized, canonical.clone());
		canonical
	}

	pub fn canonical_topics(&self) -> &[String] {
		&self.canonical
	}
}

impl Default for TopicCanonicalizer {
	fn default() -> Self {
		Self::new(TOPIC_MERGE_THRESHOLD)
	}
}

// ---------------------------------------------------------------------------
// TopicGroups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TopicGroup {
	pub topic: String,
	/// Indices into the run's item slice, in input order.
	pub members: Vec<usize>,
}

/// Items of one window bucketed by canonical topic.
#[derive(Debug, Clone, Default)]
pub struct TopicGroups {
	groups: Vec<TopicGroup>,
	/// Canonical topic per item index.
	item_topics: Vec<String>,
}

impl TopicGroups {
	/// Build groups in input order. Groups appear in the order their first
	/// item appears.
	pub fn build(items: &[Item]) -> Self {
		let mut canonicalizer = TopicCanonicalizer::default();
		let mut groups: Vec<TopicGroup> = Vec::new();
		let mut group_index: HashMap<String, usize> = HashMap::new();
		let mut item_topics = Vec::with_capacity(items.len());

		for (idx, item) in items.iter().enumerate() {
			let topic = canonicalizer.resolve(&item.topic);
			let slot = *group_index.entry(topic.clone()).or_insert_with(|| {
				groups.push(TopicGroup {
					topic: topic.clone(),
					members: Vec::new(),
				});
				groups.len() - 1
			});
			groups[slot].members.push(idx);
			item_topics.push(topic);
		}

		Self {
			groups,
			item_topics,
		}
	}

	pub fn groups(&self) -> &[TopicGroup] {
		&self.groups
	}

	pub fn topic_of(&self, item_idx: usize) -> &str {
		self.item_topics
			.get(item_idx)
			.map(String::as_str)
			.unwrap_or(DEFAULT_TOPIC)
	}

	pub fn len(&self) -> usize {
		self.groups.len()
	}

	pub fn is_empty(&self) -> bool {
		self.groups.is_empty()
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
