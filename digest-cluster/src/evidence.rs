// ---------------------------------------------------------------------------
// Evidence boost
// ---------------------------------------------------------------------------
//
// Two items citing the same strongly agreeing external source are very
// likely the same event even when their embeddings diverge (different
// language, different angle). The boost is additive and bounded.
// ---------------------------------------------------------------------------

use std::collections::HashMap;

use url::Url;

use crate::config::ClusteringConfig;
use crate::types::EvidenceSource;

/// Evidence per item id.
pub type EvidenceMap = HashMap<String, Vec<EvidenceSource>>;

/// Canonical form of an evidence URL: no scheme, userinfo, default port or
/// fragment, lowercase host without a leading `www.`, no trailing slash.
///
/// Strings that do not parse as absolute URLs are normalized textually.
pub fn normalize_evidence_url(raw: &str) -> String {
	let trimmed = raw.trim();
	let parsed = match Url::parse(trimmed) {
		Ok(parsed) => parsed,
		Err(_) => return normalize_unparsed(trimmed),
	};
	let host = match parsed.host_str() {
		Some(host) if !host.is_empty() => host.to_lowercase(),
		_ => return normalize_unparsed(trimmed),
	};

	let mut key = host.strip_prefix("www.").unwrap_or(&host).to_string();
	if let Some(port) = parsed.port() {
		key.push_str(&format!(":{}", port));
	}
	key.push_str(parsed.path().trim_end_matches('/'));
	if let Some(query) = parsed.query() {
		key.push('?');
		key.push_str(query);
	}
	key
}

fn normalize_unparsed(trimmed: &str) -> String {
	let without_scheme = match trimmed.find("://") {
		Some(idx) => &trimmed[idx + 3..],
		None => trimmed,
	};
	let (host, rest) = match without_scheme.find(|c: char| matches!(c, '/' | '?' | '#')) {
		Some(idx) => without_scheme.split_at(idx),
		None => (without_scheme, ""),
	};
	let host = host.to_lowercase();
	let host = host.strip_prefix("www.").unwrap_or(&host);

	format!("{}{}", host, rest).trim_end_matches('/').to_string()
}

fn qualifying<'a>(
	evidence: &'a EvidenceMap,
	item_id: &str,
	min_agreement: f64,
) -> impl Iterator<Item = &'a EvidenceSource> {
	evidence
		.get(item_id)
		.into_iter()
		.flatten()
		.filter(move |e| e.agreement_score.is_finite() && e.agreement_score >= min_agreement)
}

/// Per-URL agreement for one item's qualifying evidence. A URL cited more
/// than once keeps its strongest agreement.
fn url_scores(evidence: &EvidenceMap, item_id: &str, min_agreement: f64) -> HashMap<String, f64> {
	let mut scores: HashMap<String, f64> = HashMap::new();
	for source in qualifying(evidence, item_id, min_agreement) {
		let score = scores
			.entry(normalize_evidence_url(&source.url))
			.or_insert(source.agreement_score);
		*score = score.max(source.agreement_score);
	}
	scores
}

/// Additive similarity bonus for items `a` and `b`.
///
/// Each URL both items cite with agreement at or above
/// `evidence_min_agreement` scores the weaker of its two agreements. The
/// boost is the lowest of those per-URL scores, capped at `evidence_boost`.
/// Zero when boosting is disabled or the items share no qualifying URL.
pub fn calculate_evidence_boost(
	item_a: &str,
	item_b: &str,
	evidence: &EvidenceMap,
	cfg: &ClusteringConfig,
) -> f64 {
	if !cfg.evidence_boost_enabled || !cfg.evidence_boost.is_finite() || cfg.evidence_boost <= 0.0 {
		return 0.0;
	}

	let scores_a = url_scores(evidence, item_a, cfg.evidence_min_agreement);
	if scores_a.is_empty() {
		return 0.0;
	}
	let scores_b = url_scores(evidence, item_b, cfg.evidence_min_agreement);

	let boost = scores_b
		.iter()
		.filter_map(|(url, &score_b)| scores_a.get(url).map(|&score_a| score_a.min(score_b)))
		.reduce(f64::min);

	match boost {
		Some(b) => b.clamp(0.0, cfg.evidence_boost),
		None => 0.0,
	}
}
