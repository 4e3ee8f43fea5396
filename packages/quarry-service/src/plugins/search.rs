//! The `hybrid_search` stage: concurrent retrieval over every target collection and the web,
//! followed by low-recall expansion, history references, dedup and keyword normalization.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::Instant,
};

use serde_json::json;
use tokio::{sync::Semaphore, task::JoinSet};

use quarry_domain::{
	MatchType, SearchParams, SearchResult, WebSearchConfig, WebSearchResult, dedup::dedup_results,
	expansion::expand_query, normalize::normalize_keyword_scores,
};

use crate::{
	BoxFuture, CompressRequest, Event, EventType, KnowledgeBaseService, Next, Plugin, PluginError,
	PluginErrorKind, PluginResult, RequestContext, SessionStore, Stage, TempKbState,
	WebSearchService,
};

/// Upper bound on concurrent expansion searches.
pub const MAX_EXPANSION_CONCURRENCY: usize = 16;
/// Multiplier applied to the keyword threshold for expansion searches.
pub const EXPANSION_KEYWORD_RELAX: f32 = 0.8;

/// Per-job result lists, tagged with the job's position so the fused order follows the
/// target order regardless of completion order.
type Sink = Arc<Mutex<Vec<(usize, Vec<SearchResult>)>>>;

pub struct SearchFusion {
	knowledge: Arc<dyn KnowledgeBaseService>,
	web: Option<Arc<dyn WebSearchService>>,
	sessions: Arc<dyn SessionStore>,
}
impl SearchFusion {
	pub fn new(
		knowledge: Arc<dyn KnowledgeBaseService>,
		web: Option<Arc<dyn WebSearchService>>,
		sessions: Arc<dyn SessionStore>,
	) -> Self {
		Self { knowledge, web, sessions }
	}

	/// Fills `ctx.search_results` or reports that nothing was found.
	pub async fn fuse(&self, ctx: &mut RequestContext) -> PluginResult {
		let collection_ids = ctx.target_collection_ids();

		if collection_ids.is_empty() {
			return Err(PluginError::new(
				PluginErrorKind::SearchUnavailable,
				"No target collection was given for retrieval.",
			));
		}

		let snapshot = Arc::new(ctx.clone());
		let params = base_params(&snapshot);
		let (mut results, web_results) = tokio::join!(
			self.search_collections(&collection_ids, &params),
			self.search_web(snapshot.clone()),
		);

		results.extend(web_results);

		if should_expand(&snapshot, results.len()) {
			results.extend(self.expand(&snapshot, &collection_ids).await);
		}

		results.extend(history_references(&snapshot.history));

		let mut results = dedup_results(results);

		normalize_keyword_scores(&mut results);

		if results.is_empty() {
			tracing::info!(
				request_id = %ctx.request_id,
				query = %snapshot.search_query(),
				"Hybrid search found nothing."
			);

			return Err(PluginError::search_nothing());
		}

		ctx.emit_telemetry(Event::new(EventType::SearchHits, hit_summary(&results))).await;

		ctx.search_results = results;

		Ok(())
	}

	/// One concurrent hybrid search per collection, all sharing `params`.
	///
	/// Failing collections are logged and contribute nothing. No collections means no results.
	pub async fn search_collections(
		&self,
		collection_ids: &[String],
		params: &SearchParams,
	) -> Vec<SearchResult> {
		let jobs = collection_ids.iter().map(|id| (id.clone(), params.clone())).collect();

		self.fan_out(jobs, None).await
	}

	async fn expand(&self, ctx: &RequestContext, collection_ids: &[String]) -> Vec<SearchResult> {
		let variants = expand_query(ctx.search_query(), &ctx.query);

		if variants.is_empty() {
			return Vec::new();
		}

		let params = expansion_params(ctx);
		let jobs = variants
			.iter()
			.flat_map(|variant| {
				collection_ids.iter().map(|id| {
					(id.clone(), SearchParams { query_text: variant.clone(), ..params.clone() })
				})
			})
			.collect::<Vec<_>>();
		let permits = Arc::new(Semaphore::new(jobs.len().min(MAX_EXPANSION_CONCURRENCY)));

		tracing::debug!(
			request_id = %ctx.request_id,
			variants = variants.len(),
			jobs = jobs.len(),
			"Expanding a low-recall query."
		);

		self.fan_out(jobs, Some(permits)).await
	}

	async fn fan_out(
		&self,
		jobs: Vec<(String, SearchParams)>,
		permits: Option<Arc<Semaphore>>,
	) -> Vec<SearchResult> {
		let sink: Sink = Arc::new(Mutex::new(Vec::with_capacity(jobs.len())));
		let mut tasks = JoinSet::new();

		for (position, (collection_id, params)) in jobs.into_iter().enumerate() {
			let knowledge = self.knowledge.clone();
			let sink = sink.clone();
			let permits = permits.clone();

			tasks.spawn(async move {
				let _permit = match permits {
					Some(permits) => match permits.acquire_owned().await {
						Ok(permit) => Some(permit),
						Err(_) => return,
					},
					None => None,
				};
				let started = Instant::now();

				match knowledge.hybrid_search(&collection_id, &params).await {
					Ok(hits) => {
						sink.lock().unwrap_or_else(|err| err.into_inner()).push((position, hits));
					},
					Err(err) => {
						tracing::warn!(
							collection_id = %collection_id,
							query = %params.query_text,
							elapsed_ms = started.elapsed().as_millis() as u64,
							error = %err,
							"Collection search failed; continuing without it."
						);
					},
				}
			});
		}

		while let Some(joined) = tasks.join_next().await {
			if let Err(err) = joined {
				tracing::warn!(error = %err, "Collection search task failed.");
			}
		}

		let mut collected =
			std::mem::take(&mut *sink.lock().unwrap_or_else(|err| err.into_inner()));

		collected.sort_by_key(|(position, _)| *position);

		collected.into_iter().flat_map(|(_, hits)| hits).collect()
	}

	/// Web results converted into search results. Every failure contributes nothing.
	async fn search_web(&self, ctx: Arc<RequestContext>) -> Vec<SearchResult> {
		if !ctx.web_search_enabled {
			return Vec::new();
		}

		let (Some(web), Some(config)) = (self.web.as_ref(), ctx.web_search.as_ref()) else {
			tracing::debug!(
				request_id = %ctx.request_id,
				"Web search is enabled but no provider or tenant settings are configured."
			);

			return Vec::new();
		};
		let query = ctx.search_query();
		let started = Instant::now();
		let raw = match web.search(config, query).await {
			Ok(raw) => raw,
			Err(err) => {
				tracing::warn!(
					request_id = %ctx.request_id,
					query = %query,
					elapsed_ms = started.elapsed().as_millis() as u64,
					error = %err,
					"Web search failed; continuing without it."
				);

				return Vec::new();
			},
		};

		if raw.is_empty() {
			return Vec::new();
		}

		let pages = if config.compression_method == "rag" {
			self.compress(web.as_ref(), &ctx, config, raw).await
		} else {
			raw
		};

		pages.into_iter().map(WebSearchResult::into_search_result).collect()
	}

	/// Falls back to the raw pages when compression fails.
	async fn compress(
		&self,
		web: &dyn WebSearchService,
		ctx: &RequestContext,
		config: &WebSearchConfig,
		raw: Vec<WebSearchResult>,
	) -> Vec<WebSearchResult> {
		let state = match self.sessions.web_search_temp_state(&ctx.session_id).await {
			Ok(state) => state,
			Err(err) => {
				tracing::warn!(
					session_id = %ctx.session_id,
					error = %err,
					"Web search state could not be loaded; starting fresh."
				);

				TempKbState::default()
			},
		};
		let questions = [ctx.search_query().to_string()];
		let req = CompressRequest {
			session_id: &ctx.session_id,
			questions: &questions,
			results: raw.clone(),
			config,
			state,
		};

		match web.compress_with_rag(req).await {
			Ok(outcome) => {
				if let Err(err) =
					self.sessions.save_web_search_temp_state(&ctx.session_id, outcome.state).await
				{
					tracing::warn!(
						session_id = %ctx.session_id,
						error = %err,
						"Web search state could not be saved."
					);
				}

				outcome.results
			},
			Err(err) => {
				tracing::warn!(
					request_id = %ctx.request_id,
					error = %err,
					"Web result compression failed; using raw results."
				);

				raw
			},
		}
	}
}
impl Plugin for SearchFusion {
	fn name(&self) -> &'static str {
		"search_fusion"
	}

	fn stages(&self) -> &'static [Stage] {
		&[Stage::HybridSearch]
	}

	fn on_stage<'a>(
		&'a self,
		_: Stage,
		ctx: &'a mut RequestContext,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			self.fuse(ctx).await?;

			next.run(ctx).await
		})
	}
}

pub fn base_params(ctx: &RequestContext) -> SearchParams {
	SearchParams {
		query_text: ctx.search_query().to_string(),
		vector_threshold: ctx.vector_threshold,
		keyword_threshold: ctx.keyword_threshold,
		match_count: ctx.embedding_top_k,
		disable_vector_match: false,
		disable_keywords_match: false,
	}
}

/// Keyword-only, with a relaxed threshold and a doubled limit.
pub fn expansion_params(ctx: &RequestContext) -> SearchParams {
	SearchParams {
		query_text: String::new(),
		vector_threshold: ctx.vector_threshold,
		keyword_threshold: ctx.keyword_threshold * EXPANSION_KEYWORD_RELAX,
		match_count: (ctx.embedding_top_k * 2).max(ctx.rerank_top_k * 2),
		disable_vector_match: true,
		disable_keywords_match: false,
	}
}

/// Expansion runs when enabled and fewer than `max(1, embedding_top_k / 2)` results arrived.
pub fn should_expand(ctx: &RequestContext, result_count: usize) -> bool {
	ctx.enable_query_expansion && result_count < (ctx.embedding_top_k / 2).max(1)
}

/// References of the newest turn that has any, tagged as history matches.
pub fn history_references(history: &[quarry_domain::HistoryTurn]) -> Vec<SearchResult> {
	history
		.iter()
		.rev()
		.find(|turn| !turn.knowledge_references.is_empty())
		.map(|turn| {
			turn.knowledge_references
				.iter()
				.cloned()
				.map(|mut reference| {
					reference.match_type = MatchType::History;

					reference
				})
				.collect()
		})
		.unwrap_or_default()
}

fn hit_summary(results: &[SearchResult]) -> serde_json::Value {
	let mut by_match_type = HashMap::new();

	for result in results {
		*by_match_type.entry(result.match_type.as_str()).or_insert(0_usize) += 1;
	}

	json!({ "total": results.len(), "by_match_type": by_match_type })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::EventBus;

	fn context(top_k: usize) -> RequestContext {
		let mut ctx = RequestContext::new("q", Arc::new(EventBus::default()));

		ctx.embedding_top_k = top_k;

		ctx
	}

	#[test]
	fn expansion_boundary_uses_integer_division() {
		let ctx = context(5);

		assert!(!should_expand(&ctx, 2));
		assert!(should_expand(&ctx, 1));
		assert!(should_expand(&context(1), 0));
		assert!(!should_expand(&context(1), 1));
	}

	#[test]
	fn expansion_is_keyword_only_and_relaxed() {
		let mut ctx = context(5);

		ctx.keyword_threshold = 0.5;
		ctx.rerank_top_k = 8;

		let params = expansion_params(&ctx);

		assert!(params.disable_vector_match);
		assert!(!params.disable_keywords_match);
		assert!((params.keyword_threshold - 0.4).abs() < 1e-6);
		assert_eq!(params.match_count, 16);
	}
}
