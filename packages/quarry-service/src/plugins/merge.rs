use std::collections::HashMap;

use quarry_domain::SearchResult;

use crate::{BoxFuture, Next, Plugin, PluginResult, RequestContext, Stage, plugins::rerank};

/// Builds `merge_results` from the rerank output, or from the search results when rerank kept
/// nothing.
pub struct MergeResults;
impl Plugin for MergeResults {
	fn name(&self) -> &'static str {
		"merge"
	}

	fn stages(&self) -> &'static [Stage] {
		&[Stage::Merge]
	}

	fn on_stage<'a>(
		&'a self,
		_: Stage,
		ctx: &'a mut RequestContext,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			let source = if ctx.rerank_results.is_empty() {
				&ctx.search_results
			} else {
				&ctx.rerank_results
			};

			ctx.merge_results = merge_adjacent(source);

			tracing::debug!(
				request_id = %ctx.request_id,
				candidates = source.len(),
				merged = ctx.merge_results.len(),
				"Results merged."
			);

			next.run(ctx).await
		})
	}
}

pub struct FilterTopK;
impl Plugin for FilterTopK {
	fn name(&self) -> &'static str {
		"filter_top_k"
	}

	fn stages(&self) -> &'static [Stage] {
		&[Stage::FilterTopK]
	}

	fn on_stage<'a>(
		&'a self,
		_: Stage,
		ctx: &'a mut RequestContext,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			if ctx.rerank_top_k > 0 {
				ctx.merge_results.truncate(ctx.rerank_top_k);
			}

			next.run(ctx).await
		})
	}
}

/// Joins results of the same knowledge whose character ranges overlap or touch.
///
/// A merged result keeps the first passage's identity, spans the union of the ranges and takes
/// the best score. Results without a known range pass through. Output is best score first.
pub fn merge_adjacent(results: &[SearchResult]) -> Vec<SearchResult> {
	let mut merged = Vec::with_capacity(results.len());
	let mut groups: HashMap<(&str, &str), Vec<&SearchResult>> = HashMap::new();
	let mut group_order = Vec::new();

	for result in results {
		if !result.has_position() {
			merged.push(result.clone());

			continue;
		}

		let key = (result.collection_id.as_str(), result.knowledge_id.as_str());

		groups
			.entry(key)
			.or_insert_with(|| {
				group_order.push(key);

				Vec::new()
			})
			.push(result);
	}

	for key in group_order {
		let Some(mut group) = groups.remove(&key) else {
			continue;
		};

		group.sort_by_key(|result| (result.start_at, result.end_at));

		let mut current: Option<SearchResult> = None;

		for result in group {
			if let Some(open) = current.as_mut()
				&& result.start_at <= open.end_at
			{
				absorb(open, result);

				continue;
			}
			if let Some(done) = current.replace(result.clone()) {
				merged.push(done);
			}
		}

		merged.extend(current);
	}

	rerank::sorted_by_score(merged)
}

fn absorb(open: &mut SearchResult, next: &SearchResult) {
	if next.end_at > open.end_at {
		let overlap = (open.end_at - next.start_at).max(0) as usize;

		open.content.extend(next.content.chars().skip(overlap));

		open.end_at = next.end_at;
	}

	open.score = open.score.max(next.score);
}

#[cfg(test)]
mod tests {
	use quarry_domain::MatchType;

	use super::*;

	fn passage(
		id: &str,
		knowledge_id: &str,
		start_at: i32,
		content: &str,
		score: f32,
	) -> SearchResult {
		SearchResult {
			id: id.to_string(),
			parent_chunk_id: None,
			collection_id: "kb".to_string(),
			knowledge_id: knowledge_id.to_string(),
			knowledge_title: String::new(),
			content: content.to_string(),
			chunk_index: 0,
			start_at,
			end_at: start_at + content.chars().count() as i32,
			score,
			match_type: MatchType::Vector,
			metadata: HashMap::new(),
		}
	}

	#[test]
	fn overlapping_and_touching_ranges_merge() {
		let results = vec![
			passage("b", "doc", 5, "fghij", 0.7),
			passage("a", "doc", 0, "abcdefg", 0.6),
			passage("c", "doc", 10, "klm", 0.9),
			passage("d", "doc", 20, "uvw", 0.5),
		];
		let merged = merge_adjacent(&results);

		assert_eq!(merged.len(), 2);
		assert_eq!(merged[0].id, "a");
		assert_eq!(merged[0].content, "abcdefghijklm");
		assert_eq!((merged[0].start_at, merged[0].end_at), (0, 13));
		assert_eq!(merged[0].score, 0.9);
		assert_eq!(merged[1].id, "d");
	}

	#[test]
	fn different_documents_and_unpositioned_results_stay_apart() {
		let results = vec![
			passage("a", "doc-1", 0, "abc", 0.8),
			passage("b", "doc-2", 3, "def", 0.7),
			passage("w", "https://example.com", 0, "", 0.6),
		];
		let merged = merge_adjacent(&results);

		assert_eq!(merged.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["a", "b", "w"]);
	}
}
