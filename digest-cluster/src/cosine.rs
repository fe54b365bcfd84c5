// ---------------------------------------------------------------------------
// Cosine similarity
// ---------------------------------------------------------------------------
//
// The one similarity primitive shared by deduplication, cluster building and
// coherence checking. Never errors, never returns NaN.
// ---------------------------------------------------------------------------

/// Cosine similarity between two embeddings.
///
/// Returns 0.0 for empty vectors, dimension mismatches, zero-magnitude
/// vectors and non-finite results. Clamped to [-1.0, 1.0].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
	if a.len() != b.len() || a.is_empty() {
		return 0.0;
	}

	let mut dot: f64 = 0.0;
	let mut norm_a: f64 = 0.0;
	let mut norm_b: f64 = 0.0;

	for (&x, &y) in a.iter().zip(b) {
		let (x, y) = (x as f64, y as f64);
		dot += x * y;
		norm_a += x * x;
		norm_b += y * y;
	}

	finish(dot, norm_a.sqrt() * norm_b.sqrt())
}

/// L2 norm of an embedding.
pub fn compute_magnitude(embedding: &[f32]) -> f64 {
	embedding
		.iter()
		.map(|&v| (v as f64) * (v as f64))
		.sum::<f64>()
		.sqrt()
}

/// Cosine similarity with magnitudes computed ahead of time.
///
/// Used where the same embedding is compared against many others in one
/// pass (anchor vs. candidate pool, pairwise coherence).
pub fn cosine_similarity_with_magnitude(a: &[f32], b: &[f32], mag_a: f64, mag_b: f64) -> f64 {
	if a.len() != b.len() || a.is_empty() {
		return 0.0;
	}

	let dot: f64 = a
		.iter()
		.zip(b)
		.map(|(&x, &y)| (x as f64) * (y as f64))
		.sum();

	finish(dot, mag_a * mag_b)
}

fn finish(dot: f64, denom: f64) -> f64 {
	if denom == 0.0 || !denom.is_finite() {
		return 0.0;
	}
	let result = dot / denom;
	if !result.is_finite() {
		return 0.0;
	}
	result.clamp(-1.0, 1.0)
}
