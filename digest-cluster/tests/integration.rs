// ---------------------------------------------------------------------------
// Integration tests for digest-cluster-engine
// ---------------------------------------------------------------------------
//
// Library tests drive `ClusterEngine` against `InMemoryStore` with stub
// collaborators. The last section spawns the binary on a snapshot file and
// reads its NDJSON output.
// ---------------------------------------------------------------------------

use std::collections::HashSet;
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use digest_cluster_engine::config::{keys, ClusteringDefaults, DedupConfig, DedupMode};
use digest_cluster_engine::cosine::cosine_similarity;
use digest_cluster_engine::deduplication::Deduplicator;
use digest_cluster_engine::engine::ClusterEngine;
use digest_cluster_engine::error::ClusterError;
use digest_cluster_engine::memory::InMemoryStore;
use digest_cluster_engine::ports::{ClusterRepository, LlmClient};
use digest_cluster_engine::snapshot::{compress, encode_embedding};
use digest_cluster_engine::types::{
	ClusterRunSummary, ClusterSource, EvidenceSource, Item, Link, RawMessage, RunWindow,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn window() -> RunWindow {
	RunWindow::new(
		Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
		Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
	)
}

fn item(id: &str, topic: &str, importance: f64, summary: &str, embedding: Vec<f32>) -> Item {
	Item {
		id: id.to_string(),
		topic: topic.to_string(),
		summary: summary.to_string(),
		importance_score: importance,
		embedding,
		tg_date: Some(Utc.with_ymd_and_hms(2026, 6, 1, 3, 0, 0).unwrap()),
		raw_message_id: Some(format!("raw-{}", id)),
		..Default::default()
	}
}

fn defaults(threshold: f64) -> ClusteringDefaults {
	ClusteringDefaults {
		similarity_threshold: threshold,
		evidence_boost_enabled: false,
		..Default::default()
	}
}

async fn run(
	engine: &ClusterEngine,
	source: ClusterSource,
	items: &[Item],
) -> Result<ClusterRunSummary, ClusterError> {
	engine
		.cluster_window(window(), source, items, &CancellationToken::new())
		.await
}

fn member_sets(summary: &ClusterRunSummary) -> Vec<Vec<String>> {
	let mut sets: Vec<Vec<String>> = summary
		.clusters
		.iter()
		.map(|c| {
			let mut ids = c.member_ids.clone();
			ids.sort();
			ids
		})
		.collect();
	sets.sort();
	sets
}

/// Deterministic pseudo-random unit-ish vectors (64-bit LCG).
fn pseudo_vectors(count: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
	let mut state = seed;
	let mut next = move || {
		state = state
			.wrapping_mul(6364136223846793005)
			.wrapping_add(1442695040888963407);
		((state >> 33) as f64 / (1u64 << 31) as f64) as f32
	};
	// A handful of centers with jitter, so clusters actually form.
	let centers: Vec<Vec<f32>> = (0..4).map(|_| (0..dims).map(|_| next() - 0.5).collect()).collect();
	(0..count)
		.map(|i| {
			centers[i % centers.len()]
				.iter()
				.map(|c| c + (next() - 0.5) * 0.6)
				.collect()
		})
		.collect()
}

// -- Stub LLM ---------------------------------------------------------------

#[derive(Default)]
struct StubLlm {
	answer: Option<String>,
	calls: Mutex<usize>,
	/// Cancel this token and hang on the given call (1-based).
	cancel_on_call: Option<(usize, CancellationToken)>,
}

#[async_trait]
impl LlmClient for StubLlm {
	async fn generate_cluster_topic(
		&self,
		_items: &[Item],
		_language: &str,
		_model: &str,
	) -> Result<String, ClusterError> {
		let call = {
			let mut calls = self.calls.lock().unwrap();
			*calls += 1;
			*calls
		};
		if let Some((n, token)) = &self.cancel_on_call {
			if call == *n {
				token.cancel();
				std::future::pending::<()>().await;
			}
		}
		self.answer
			.clone()
			.ok_or_else(|| ClusterError::Llm("model unavailable".into()))
	}

	async fn get_links_for_message(&self, _raw: &str) -> Result<Vec<Link>, ClusterError> {
		Ok(vec![])
	}
}

// -- Failing repository wrapper ---------------------------------------------

struct FlakyRepo {
	inner: Arc<InMemoryStore>,
	fail_membership_for: HashSet<String>,
	fail_delete: bool,
}

#[async_trait]
impl ClusterRepository for FlakyRepo {
	async fn delete_clusters_for_window(
		&self,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
	) -> Result<(), ClusterError> {
		self.inner.delete_clusters_for_window(start, end).await
	}

	async fn delete_clusters_for_window_and_source(
		&self,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
		source: ClusterSource,
	) -> Result<(), ClusterError> {
		if self.fail_delete {
			return Err(ClusterError::Storage("delete timed out".into()));
		}
		self.inner
			.delete_clusters_for_window_and_source(start, end, source)
			.await
	}

	async fn create_cluster_with_source(
		&self,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
		topic: &str,
		source: ClusterSource,
	) -> Result<String, ClusterError> {
		self.inner
			.create_cluster_with_source(start, end, topic, source)
			.await
	}

	async fn add_to_cluster(&self, cluster_id: &str, item_id: &str) -> Result<(), ClusterError> {
		if self.fail_membership_for.contains(item_id) {
			return Err(ClusterError::Storage("constraint violation".into()));
		}
		self.inner.add_to_cluster(cluster_id, item_id).await
	}

	async fn get_setting(&self, key: &str) -> Result<Option<Value>, ClusterError> {
		Err(ClusterError::Storage(format!("settings table missing ({})", key)))
	}

	async fn get_evidence_for_items(
		&self,
		item_ids: &[String],
	) -> Result<std::collections::HashMap<String, Vec<EvidenceSource>>, ClusterError> {
		self.inner.get_evidence_for_items(item_ids).await
	}
}

// ---------------------------------------------------------------------------
// Clustering scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_pair_forms_one_cluster_with_important_representative() {
	let store = Arc::new(InMemoryStore::new());
	let engine = ClusterEngine::new(store.clone(), defaults(0.8));
	let items = vec![
		item("a", "Energy", 0.4, "a long and detailed summary", vec![0.6, 0.8]),
		item("b", "Energy", 0.9, "short", vec![0.6, 0.8]),
	];

	let summary = run(&engine, ClusterSource::Digest, &items).await.unwrap();
	assert_eq!(summary.clusters.len(), 1);
	let cluster = &summary.clusters[0];
	assert_eq!(cluster.representative_id, "b");
	assert_eq!(cluster.member_ids, vec!["b", "a"]);
	assert_eq!(store.members_of(&cluster.id), vec!["b", "a"]);
}

#[tokio::test]
async fn importance_tie_picks_longer_summary() {
	let store = Arc::new(InMemoryStore::new());
	let engine = ClusterEngine::new(store.clone(), defaults(0.8));
	let items = vec![
		item("a", "Energy", 0.5, "short", vec![1.0, 0.0]),
		item("b", "Energy", 0.5, "the longer of the two summaries", vec![1.0, 0.0]),
	];

	let summary = run(&engine, ClusterSource::Digest, &items).await.unwrap();
	assert_eq!(summary.clusters[0].representative_id, "b");
}

#[tokio::test]
async fn incoherent_trio_depends_on_coherence_threshold() {
	// a-b and a-c at 0.8, b-c at 0.28: average 0.627.
	let items = vec![
		item("a", "Floods", 0.9, "a", vec![1.0, 0.0, 0.0]),
		item("b", "Floods", 0.5, "b", vec![0.8, 0.6, 0.0]),
		item("c", "Floods", 0.5, "c", vec![0.8, -0.6, 0.0]),
	];

	let lenient = ClusteringDefaults {
		coherence_threshold: 0.5,
		..defaults(0.75)
	};
	let store = Arc::new(InMemoryStore::new());
	let summary = run(&ClusterEngine::new(store.clone(), lenient), ClusterSource::Digest, &items)
		.await
		.unwrap();
	assert_eq!(member_sets(&summary), vec![vec!["a", "b", "c"]]);
	assert_eq!(summary.clusters_demoted, 0);

	let strict = ClusteringDefaults {
		coherence_threshold: 0.7,
		..defaults(0.75)
	};
	let store = Arc::new(InMemoryStore::new());
	let summary = run(&ClusterEngine::new(store.clone(), strict), ClusterSource::Digest, &items)
		.await
		.unwrap();
	// Demoted to singletons, none of which meet the digest minimum.
	assert!(summary.clusters.is_empty());
	assert_eq!(summary.clusters_demoted, 1);
	assert_eq!(summary.clusters_below_min_size, 3);
	assert!(store.clusters().is_empty());
}

#[tokio::test]
async fn run_invariants_hold_on_larger_window() {
	let vectors = pseudo_vectors(60, 8, 42);
	let topics = ["Energy", "energy", "Elections", "War in Ukraine", "Ukraine War"];
	let items: Vec<Item> = vectors
		.into_iter()
		.enumerate()
		.map(|(i, v)| item(&format!("i{:02}", i), topics[i % topics.len()], 0.5, "s", v))
		.collect();

	let coherence = 0.6;
	let cfg = ClusteringDefaults {
		coherence_threshold: coherence,
		cross_topic_enabled: true,
		..defaults(0.7)
	};
	let store = Arc::new(InMemoryStore::new());
	let summary = run(&ClusterEngine::new(store.clone(), cfg), ClusterSource::Research, &items)
		.await
		.unwrap();

	// Research keeps singletons, so every item lands somewhere exactly once.
	let mut seen = HashSet::new();
	for cluster in &summary.clusters {
		for id in &cluster.member_ids {
			assert!(seen.insert(id.clone()), "{} assigned twice", id);
		}
	}
	assert_eq!(seen.len(), items.len());

	for cluster in summary.clusters.iter().filter(|c| c.member_ids.len() > 2) {
		let members: Vec<&Item> = cluster
			.member_ids
			.iter()
			.map(|id| items.iter().find(|i| &i.id == id).unwrap())
			.collect();
		let mut total = 0.0;
		let mut pairs = 0;
		for (i, a) in members.iter().enumerate() {
			for b in &members[i + 1..] {
				total += cosine_similarity(&a.embedding, &b.embedding);
				pairs += 1;
			}
		}
		assert!(total / pairs as f64 >= coherence - 1e-9, "incoherent cluster {:?}", cluster.member_ids);
	}

	// Both phrasings of the Ukraine topic share one canonical bucket.
	assert_eq!(summary.topic_groups, 3);
}

#[tokio::test]
async fn rerun_replaces_previous_clusters() {
	let store = Arc::new(InMemoryStore::new());
	let engine = ClusterEngine::new(store.clone(), defaults(0.8));
	let items = vec![
		item("a", "Energy", 0.5, "a", vec![1.0, 0.0]),
		item("b", "Energy", 0.4, "b", vec![1.0, 0.0]),
		item("c", "Markets", 0.5, "c", vec![0.0, 1.0]),
		item("d", "Markets", 0.4, "d", vec![0.0, 1.0]),
	];

	let first = run(&engine, ClusterSource::Digest, &items).await.unwrap();
	let second = run(&engine, ClusterSource::Digest, &items).await.unwrap();
	assert_eq!(member_sets(&first), member_sets(&second));
	assert_eq!(store.clusters().len(), 2);
	assert_eq!(store.memberships().len(), 4);
}

#[tokio::test]
async fn research_run_keeps_singletons_and_leaves_digest_alone() {
	let store = Arc::new(InMemoryStore::new());
	let engine = ClusterEngine::new(store.clone(), defaults(0.8));
	let items = vec![
		item("a", "Energy", 0.5, "a", vec![1.0, 0.0]),
		item("b", "Energy", 0.4, "b", vec![1.0, 0.0]),
		item("c", "Markets", 0.5, "c", vec![0.0, 1.0]),
	];

	let digest = run(&engine, ClusterSource::Digest, &items).await.unwrap();
	assert_eq!(digest.clusters.len(), 1);

	let research = run(&engine, ClusterSource::Research, &items).await.unwrap();
	assert_eq!(member_sets(&research), vec![vec!["a", "b"], vec!["c"]]);

	let by_source = |s: ClusterSource| store.clusters().into_iter().filter(|c| c.source == s).count();
	assert_eq!(by_source(ClusterSource::Digest), 1);
	assert_eq!(by_source(ClusterSource::Research), 2);
}

#[tokio::test]
async fn cross_topic_and_evidence_come_from_dynamic_settings() {
	let store = Arc::new(InMemoryStore::new());
	// cos(a, b) = 0.7: below 0.75 on its own.
	let items = vec![
		item("a", "Energy", 0.5, "a", vec![1.0, 0.0]),
		item("b", "Power grid", 0.5, "b", vec![0.7, 0.714_142_8]),
	];
	let engine = ClusterEngine::new(store.clone(), defaults(0.75));
	assert!(run(&engine, ClusterSource::Digest, &items).await.unwrap().clusters.is_empty());

	let shared = |score| {
		vec![EvidenceSource {
			url: "https://www.reuters.com/world/grid".into(),
			agreement_score: score,
			is_contradiction: false,
		}]
	};
	store.set_evidence("a", shared(0.9));
	store.set_evidence("b", shared(0.8));
	store.set_setting(keys::CROSS_TOPIC_ENABLED, json!(true));
	store.set_setting(keys::EVIDENCE_BOOST_ENABLED, json!(true));
	store.set_setting(keys::EVIDENCE_BOOST, json!(0.1));

	let summary = run(&engine, ClusterSource::Digest, &items).await.unwrap();
	assert_eq!(member_sets(&summary), vec![vec!["a", "b"]]);
	assert_eq!(summary.clusters[0].canonical_topic, "Energy");
}

#[tokio::test]
async fn duplicate_item_ids_count_once() {
	let store = Arc::new(InMemoryStore::new());
	let engine = ClusterEngine::new(store.clone(), defaults(0.8));
	let items = vec![
		item("a", "Energy", 0.5, "a", vec![1.0, 0.0]),
		item("a", "Energy", 0.5, "a again", vec![1.0, 0.0]),
		item("b", "Energy", 0.5, "b", vec![1.0, 0.0]),
	];
	let summary = run(&engine, ClusterSource::Digest, &items).await.unwrap();
	assert_eq!(summary.items_considered, 2);
	assert_eq!(member_sets(&summary), vec![vec!["a", "b"]]);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn membership_and_delete_failures_are_skipped() {
	let store = Arc::new(InMemoryStore::new());
	let repo = Arc::new(FlakyRepo {
		inner: store.clone(),
		fail_membership_for: ["b".to_string()].into_iter().collect(),
		fail_delete: true,
	});
	let engine = ClusterEngine::new(repo, defaults(0.8));
	let items = vec![
		item("a", "Energy", 0.5, "a", vec![1.0, 0.0]),
		item("b", "Energy", 0.4, "b", vec![1.0, 0.0]),
		item("c", "Energy", 0.3, "c", vec![1.0, 0.0]),
	];

	let summary = run(&engine, ClusterSource::Digest, &items).await.unwrap();
	assert_eq!(summary.clusters.len(), 1);
	assert_eq!(summary.memberships_failed, 1);
	let cluster_id = &summary.clusters[0].id;
	assert_eq!(store.members_of(cluster_id), vec!["a", "c"]);
}

#[tokio::test]
async fn llm_label_used_when_available_with_fallback_otherwise() {
	let items = vec![
		item("a", "energy", 0.5, "a", vec![1.0, 0.0]),
		item("b", "Energy", 0.4, "b", vec![1.0, 0.0]),
	];

	let store = Arc::new(InMemoryStore::new());
	let llm = Arc::new(StubLlm {
		answer: Some("\"Blackout across the capital\"".into()),
		..Default::default()
	});
	let engine = ClusterEngine::new(store.clone(), defaults(0.8)).with_llm(llm.clone());
	let summary = run(&engine, ClusterSource::Digest, &items).await.unwrap();
	assert_eq!(summary.clusters[0].topic, "Blackout across the capital");
	assert_eq!(summary.clusters[0].canonical_topic, "Energy");
	assert_eq!(summary.labels_generated, 1);
	assert_eq!(store.clusters()[0].topic, "Blackout across the capital");

	let store = Arc::new(InMemoryStore::new());
	let failing = Arc::new(StubLlm::default());
	let engine = ClusterEngine::new(store.clone(), defaults(0.8)).with_llm(failing);
	let summary = run(&engine, ClusterSource::Digest, &items).await.unwrap();
	assert_eq!(summary.clusters[0].topic, "Energy");
	assert_eq!(summary.labels_generated, 0);
}

#[tokio::test]
async fn unreadable_settings_fall_back_to_defaults() {
	let store = Arc::new(InMemoryStore::new());
	let repo = Arc::new(FlakyRepo {
		inner: store.clone(),
		fail_membership_for: HashSet::new(),
		fail_delete: false,
	});
	let engine = ClusterEngine::new(repo, defaults(0.8));
	let items = vec![
		item("a", "Energy", 0.5, "a", vec![1.0, 0.0]),
		item("b", "Energy", 0.4, "b", vec![1.0, 0.0]),
	];
	let summary = run(&engine, ClusterSource::Digest, &items).await.unwrap();
	assert_eq!(summary.clusters.len(), 1);
}

#[tokio::test]
async fn cancellation_mid_run_keeps_persisted_clusters() {
	let store = Arc::new(InMemoryStore::new());
	let cancel = CancellationToken::new();
	let llm = Arc::new(StubLlm {
		answer: Some("Label".into()),
		cancel_on_call: Some((2, cancel.clone())),
		..Default::default()
	});
	let engine = ClusterEngine::new(store.clone(), defaults(0.8)).with_llm(llm);
	let items = vec![
		item("a", "Energy", 0.5, "a", vec![1.0, 0.0]),
		item("b", "Energy", 0.4, "b", vec![1.0, 0.0]),
		item("c", "Markets", 0.5, "c", vec![0.0, 1.0]),
		item("d", "Markets", 0.4, "d", vec![0.0, 1.0]),
	];

	let err = engine
		.cluster_window(window(), ClusterSource::Digest, &items, &cancel)
		.await
		.unwrap_err();
	assert!(err.is_cancelled());
	assert_eq!(store.clusters().len(), 1);
}

// ---------------------------------------------------------------------------
// Deduplication gate feeding the store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dedup_gate_accepts_then_rejects_repost() {
	let store = Arc::new(InMemoryStore::new());
	let cfg = DedupConfig {
		mode: DedupMode::Semantic,
		threshold: 0.95,
		window_days: 7,
	};
	let gate = Deduplicator::from_config(store.clone(), &cfg);

	let original = RawMessage {
		id: "m1".into(),
		text: "Dam breach floods the valley".into(),
		embedding: vec![0.3, 0.9, 0.1],
		tg_date: Some(Utc.with_ymd_and_hms(2026, 6, 1, 1, 0, 0).unwrap()),
	};
	let verdict = gate.is_duplicate(&original, &original.embedding).await.unwrap();
	assert!(!verdict.is_duplicate);
	store.record_message(original);

	let repost = RawMessage {
		id: "m2".into(),
		text: "The valley is flooded after a dam breach".into(),
		embedding: vec![0.31, 0.9, 0.1],
		tg_date: Some(Utc.with_ymd_and_hms(2026, 6, 1, 2, 0, 0).unwrap()),
	};
	let verdict = gate.is_duplicate(&repost, &repost.embedding).await.unwrap();
	assert!(verdict.is_duplicate);
	assert_eq!(verdict.original_id.as_deref(), Some("m1"));
}

// ---------------------------------------------------------------------------
// Binary
// ---------------------------------------------------------------------------

fn run_binary(args: &[&str]) -> (i32, Vec<Value>) {
	let output = Command::new(env!("CARGO_BIN_EXE_digest-cluster-engine"))
		.args(args)
		.env_remove("RUST_LOG")
		.output()
		.expect("failed to spawn digest-cluster-engine");
	let lines = String::from_utf8_lossy(&output.stdout)
		.lines()
		.filter(|l| !l.trim().is_empty())
		.map(|l| serde_json::from_str(l).unwrap_or_else(|e| panic!("bad line {l}: {e}")))
		.collect();
	(output.status.code().unwrap_or(-1), lines)
}

fn snapshot_json() -> Value {
	json!({
		"window": { "start": "2026-06-01T00:00:00Z", "end": "2026-06-01T12:00:00Z" },
		"source": "digest",
		"items": [
			{ "id": "a", "topic": "Energy", "summary": "Grid failure", "importanceScore": 0.9,
			  "embedding": [1.0, 0.0] },
			{ "id": "b", "topic": "energy", "summary": "Power out", "importanceScore": 0.4,
			  "embedding": encode_embedding(&[1.0, 0.0]) },
			{ "id": "c", "topic": "Sport", "summary": "Cup final", "importanceScore": 0.5 }
		],
		"settings": { "cluster_similarity_threshold": 0.8 },
		"embeddings": { "c": [0.0, 1.0] }
	})
}

#[test]
fn binary_prints_clusters_and_summary() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("window.json.gz");
	std::fs::write(&path, compress(snapshot_json().to_string().as_bytes()).unwrap()).unwrap();

	let (code, lines) = run_binary(&["--snapshot", path.to_str().unwrap()]);
	assert_eq!(code, 0);
	assert_eq!(lines.len(), 2);
	assert_eq!(lines[0]["type"], "cluster");
	assert_eq!(lines[0]["representativeId"], "a");
	assert_eq!(lines[0]["memberIds"], json!(["a", "b"]));
	assert_eq!(lines[1]["type"], "summary");
	assert_eq!(lines[1]["clusters"], 1);
	assert_eq!(lines[1]["clustersBelowMinSize"], 1);
}

#[test]
fn binary_source_flag_overrides_snapshot() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("window.json");
	std::fs::write(&path, snapshot_json().to_string()).unwrap();

	let (code, lines) = run_binary(&["--snapshot", path.to_str().unwrap(), "--source", "research"]);
	assert_eq!(code, 0);
	let summary = lines.last().unwrap();
	assert_eq!(summary["source"], "research");
	assert_eq!(summary["clusters"], 2);
}

#[test]
fn binary_reports_missing_snapshot() {
	let (code, lines) = run_binary(&["--snapshot", "/nonexistent/window.json"]);
	assert_eq!(code, 1);
	assert_eq!(lines.len(), 1);
	assert_eq!(lines[0]["type"], "error");
	assert_eq!(lines[0]["error"]["code"], "CLUSTER_IO");
}
