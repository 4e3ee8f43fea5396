use std::collections::HashSet;

use crate::{model::SearchResult, signature};

/// Drops duplicates in arrival order, keeping the first occurrence.
///
/// A result duplicates an earlier kept one when it shares its ID, its non-empty parent chunk
/// ID, or its non-empty content signature. A later duplicate is dropped even when it scores
/// higher.
pub fn dedup_results(results: Vec<SearchResult>) -> Vec<SearchResult> {
	let mut seen_keys = HashSet::with_capacity(results.len() * 2);
	let mut seen_signatures = HashSet::with_capacity(results.len());
	let mut kept = Vec::with_capacity(results.len());

	for result in results {
		let parent_key = result
			.parent_chunk_id
			.as_deref()
			.filter(|parent| !parent.is_empty())
			.map(|parent| format!("parent:{parent}"));
		let signature = signature::content_signature(&result.content);

		if seen_keys.contains(&result.id)
			|| parent_key.as_ref().is_some_and(|key| seen_keys.contains(key))
			|| (!signature.is_empty() && seen_signatures.contains(&signature))
		{
			continue;
		}

		seen_keys.insert(result.id.clone());

		if let Some(key) = parent_key {
			seen_keys.insert(key);
		}
		if !signature.is_empty() {
			seen_signatures.insert(signature);
		}

		kept.push(result);
	}

	kept
}
