use serde_json::Value;

use crate::{Error, Result};

/// Scores `docs` against `query`. The returned vector is aligned with `docs`; documents the
/// provider leaves out score zero.
pub async fn rerank(
	cfg: &quarry_config::ProviderConfig,
	query: &str,
	docs: &[String],
) -> Result<Vec<f32>> {
	if docs.is_empty() {
		return Ok(Vec::new());
	}

	let body = serde_json::json!({ "model": cfg.model, "query": query, "documents": docs });
	let res = crate::client(cfg.timeout_ms)?
		.post(crate::endpoint(&cfg.api_base, &cfg.path))
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&body)
		.send()
		.await?;
	let json: Value = res.error_for_status()?.json().await?;

	parse_rerank_response(json, docs.len())
}

fn parse_rerank_response(json: Value, doc_count: usize) -> Result<Vec<f32>> {
	let mut scores = vec![0.0_f32; doc_count];
	let results = json
		.get("results")
		.or_else(|| json.get("data"))
		.and_then(Value::as_array)
		.ok_or_else(|| Error::response("Rerank response is missing results array."))?;

	for item in results {
		let index = item
			.get("index")
			.and_then(Value::as_u64)
			.ok_or_else(|| Error::response("Rerank result is missing index."))? as usize;
		let score = item
			.get("relevance_score")
			.or_else(|| item.get("score"))
			.and_then(Value::as_f64)
			.ok_or_else(|| Error::response("Rerank result is missing score."))? as f32;

		if let Some(slot) = scores.get_mut(index) {
			*slot = score;
		}
	}

	Ok(scores)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn aligns_scores_by_index() {
		let json = serde_json::json!({
			"results": [
				{ "index": 2, "relevance_score": 0.2 },
				{ "index": 0, "score": 0.9 },
				{ "index": 7, "score": 0.5 }
			]
		});
		let scores = parse_rerank_response(json, 3).expect("Failed to parse rerank scores.");

		assert_eq!(scores, vec![0.9, 0.0, 0.2]);
	}
}
