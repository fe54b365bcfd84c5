// ---------------------------------------------------------------------------
// Snapshot files — one window's input, loaded by the operator binary
// ---------------------------------------------------------------------------
//
// File format: JSON, optionally gzipped (detected by magic bytes):
//
//   {
//     "window":     { "start": RFC3339, "end": RFC3339 },
//     "source":     "digest" | "research",
//     "items":      [Item, ...],
//     "evidence":   { "<item id>": [EvidenceSource, ...] },
//     "settings":   { "<setting key>": <json value> },
//     "embeddings": { "<item id>": [f32, ...] | "<base64 f32 LE>" }
//   }
//
// Item embeddings accept the same two encodings. `embeddings` holds vectors
// for items that arrive without one, served through `ItemEmbeddings`.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::error::ClusterError;
use crate::memory::InMemoryStore;
use crate::types::{ClusterSource, EvidenceSource, Item, RunWindow};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SnapshotError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Corruption: {0}")]
	Corruption(String),
	#[error("Serialization: {0}")]
	Serialization(String),
	#[error("Invalid snapshot: {0}")]
	Invalid(String),
}

impl From<SnapshotError> for ClusterError {
	fn from(e: SnapshotError) -> Self {
		match e {
			SnapshotError::Io(e) => ClusterError::Io(e),
			other => ClusterError::Snapshot(other.to_string()),
		}
	}
}

// ---------------------------------------------------------------------------
// Embedding encode / decode
// ---------------------------------------------------------------------------

/// Encode a f32 slice as base64 of little-endian bytes.
pub fn encode_embedding(embedding: &[f32]) -> String {
	let bytes: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
	STANDARD.encode(&bytes)
}

/// Decode base64 little-endian f32 bytes.
pub fn decode_embedding(encoded: &str) -> Result<Vec<f32>, SnapshotError> {
	let bytes = STANDARD
		.decode(encoded.trim())
		.map_err(|e| SnapshotError::Corruption(format!("Invalid base64: {}", e)))?;
	if bytes.len() % 4 != 0 {
		return Err(SnapshotError::Corruption(
			"Invalid embedding length".into(),
		));
	}
	Ok(bytes
		.chunks_exact(4)
		.map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
		.collect())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingRepr {
	Floats(Vec<f32>),
	Encoded(String),
}

impl EmbeddingRepr {
	fn decode(self) -> Result<Vec<f32>, SnapshotError> {
		match self {
			Self::Floats(v) => Ok(v),
			Self::Encoded(s) if s.trim().is_empty() => Ok(Vec::new()),
			Self::Encoded(s) => decode_embedding(&s),
		}
	}
}

/// Serde hook for embedding fields: a float array, a base64 string, or null.
pub(crate) fn deserialize_embedding<'de, D>(deserializer: D) -> Result<Vec<f32>, D::Error>
where
	D: Deserializer<'de>,
{
	match Option::<EmbeddingRepr>::deserialize(deserializer)? {
		Some(repr) => repr.decode().map_err(serde::de::Error::custom),
		None => Ok(Vec::new()),
	}
}

// ---------------------------------------------------------------------------
// Gzip compress / decompress
// ---------------------------------------------------------------------------

pub fn compress(data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
	let mut encoder = GzEncoder::new(data, Compression::new(6));
	let mut compressed = Vec::new();
	encoder.read_to_end(&mut compressed)?;
	Ok(compressed)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, SnapshotError> {
	let mut decoder = GzDecoder::new(data);
	let mut decompressed = Vec::new();
	decoder
		.read_to_end(&mut decompressed)
		.map_err(|e| SnapshotError::Corruption(format!("Invalid gzip stream: {}", e)))?;
	Ok(decompressed)
}

/// Check if data starts with gzip magic bytes (0x1f, 0x8b).
pub fn is_gzipped(data: &[u8]) -> bool {
	data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawSnapshot")]
pub struct Snapshot {
	pub window: RunWindow,
	pub source: ClusterSource,
	pub items: Vec<Item>,
	pub evidence: HashMap<String, Vec<EvidenceSource>>,
	pub settings: HashMap<String, serde_json::Value>,
	pub embeddings: HashMap<String, Vec<f32>>,
}

#[derive(Deserialize)]
struct RawSnapshot {
	window: RunWindow,
	#[serde(default)]
	source: ClusterSource,
	#[serde(default)]
	items: Vec<Item>,
	#[serde(default)]
	evidence: HashMap<String, Vec<EvidenceSource>>,
	#[serde(default)]
	settings: HashMap<String, serde_json::Value>,
	#[serde(default)]
	embeddings: HashMap<String, EmbeddingRepr>,
}

impl TryFrom<RawSnapshot> for Snapshot {
	type Error = SnapshotError;

	fn try_from(raw: RawSnapshot) -> Result<Self, Self::Error> {
		if raw.window.end <= raw.window.start {
			return Err(SnapshotError::Invalid(format!(
				"window end {} is not after start {}",
				raw.window.end, raw.window.start
			)));
		}
		if let Some(item) = raw.items.iter().find(|i| i.id.trim().is_empty()) {
			return Err(SnapshotError::Invalid(format!(
				"item with empty id (topic {:?})",
				item.topic
			)));
		}

		let mut embeddings = HashMap::with_capacity(raw.embeddings.len());
		for (id, repr) in raw.embeddings {
			let vector = repr
				.decode()
				.map_err(|e| SnapshotError::Corruption(format!("embedding for {}: {}", id, e)))?;
			embeddings.insert(id, vector);
		}

		Ok(Self {
			window: raw.window,
			source: raw.source,
			items: raw.items,
			evidence: raw.evidence,
			settings: raw.settings,
			embeddings,
		})
	}
}

impl Snapshot {
	pub fn from_bytes(data: &[u8]) -> Result<Self, SnapshotError> {
		let json = if is_gzipped(data) {
			decompress(data)?
		} else {
			data.to_vec()
		};
		serde_json::from_slice(&json)
			.map_err(|e| SnapshotError::Serialization(format!("Failed to parse snapshot: {}", e)))
	}

	pub fn to_bytes(&self, gzip: bool) -> Result<Vec<u8>, SnapshotError> {
		let json = serde_json::to_vec(self)
			.map_err(|e| SnapshotError::Serialization(format!("Failed to serialize snapshot: {}", e)))?;
		if gzip {
			compress(&json)
		} else {
			Ok(json)
		}
	}

	/// Seed a fresh store with this snapshot's settings, evidence and
	/// fallback embeddings.
	pub fn to_store(&self) -> InMemoryStore {
		let store = InMemoryStore::new();
		for (key, value) in &self.settings {
			store.set_setting(key, value.clone());
		}
		for (item_id, sources) in &self.evidence {
			store.set_evidence(item_id, sources.clone());
		}
		for (item_id, embedding) in &self.embeddings {
			store.set_item_embedding(item_id, embedding.clone());
		}
		store
	}
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot, SnapshotError> {
	let data = std::fs::read(path)?;
	let snapshot = Snapshot::from_bytes(&data)?;
	tracing::debug!(
		path = %path.display(),
		items = snapshot.items.len(),
		gzipped = is_gzipped(&data),
		"Loaded snapshot"
	);
	Ok(snapshot)
}

pub fn save_snapshot(path: &Path, snapshot: &Snapshot, gzip: bool) -> Result<(), SnapshotError> {
	if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(path, snapshot.to_bytes(gzip)?)?;
	Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
