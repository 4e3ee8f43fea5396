use std::sync::Arc;

use quarry_config::ProviderConfig;
use quarry_domain::SearchResult;

use crate::{BoxFuture, Next, Plugin, PluginResult, RequestContext, RerankProvider, Stage};

pub struct Rerank {
	provider: Arc<dyn RerankProvider>,
	cfg: ProviderConfig,
}
impl Rerank {
	pub fn new(provider: Arc<dyn RerankProvider>, cfg: ProviderConfig) -> Self {
		Self { provider, cfg }
	}

	async fn rerank(&self, ctx: &mut RequestContext) {
		if ctx.search_results.is_empty() {
			ctx.rerank_results.clear();

			return;
		}

		let docs =
			ctx.search_results.iter().map(|result| result.content.clone()).collect::<Vec<_>>();
		let outcome = self.provider.rerank(&self.cfg, ctx.search_query(), &docs).await;

		ctx.rerank_results = match outcome {
			Ok(scores) => apply_scores(&ctx.search_results, &scores, ctx.rerank_threshold),
			Err(err) => {
				tracing::warn!(
					request_id = %ctx.request_id,
					candidates = docs.len(),
					error = %err,
					"Rerank failed; keeping retrieval order by score."
				);

				sorted_by_score(ctx.search_results.clone())
			},
		};
	}
}
impl Plugin for Rerank {
	fn name(&self) -> &'static str {
		"rerank"
	}

	fn stages(&self) -> &'static [Stage] {
		&[Stage::Rerank]
	}

	fn on_stage<'a>(
		&'a self,
		_: Stage,
		ctx: &'a mut RequestContext,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			self.rerank(ctx).await;

			next.run(ctx).await
		})
	}
}

/// Replaces each score with its rerank score, drops those under `threshold` and sorts the rest
/// best first. Results without a score are dropped.
pub fn apply_scores(
	results: &[SearchResult],
	scores: &[f32],
	threshold: f32,
) -> Vec<SearchResult> {
	let ranked = results
		.iter()
		.zip(scores)
		.filter(|(_, score)| **score >= threshold)
		.map(|(result, score)| SearchResult { score: *score, ..result.clone() })
		.collect();

	sorted_by_score(ranked)
}

pub fn sorted_by_score(mut results: Vec<SearchResult>) -> Vec<SearchResult> {
	results.sort_by(|a, b| b.score.total_cmp(&a.score));

	results
}
