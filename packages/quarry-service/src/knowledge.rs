use std::sync::Arc;

use quarry_config::EmbeddingProviderConfig;
use quarry_domain::{RetrieveParams, RetrieverType, SearchParams, SearchResult};
use quarry_storage::RetrievalBackend;

use crate::{BoxFuture, EmbeddingProvider, Error, KnowledgeBaseService, Result};

/// Hybrid search over a single retrieval backend.
///
/// Each match type runs only when the request leaves it enabled and the backend declares it.
pub struct BackendKnowledgeBase {
	backend: Arc<dyn RetrievalBackend>,
	embedding: Arc<dyn EmbeddingProvider>,
	embedding_cfg: EmbeddingProviderConfig,
}
impl BackendKnowledgeBase {
	pub fn new(
		backend: Arc<dyn RetrievalBackend>,
		embedding: Arc<dyn EmbeddingProvider>,
		embedding_cfg: EmbeddingProviderConfig,
	) -> Self {
		Self { backend, embedding, embedding_cfg }
	}

	pub fn backend(&self) -> &Arc<dyn RetrievalBackend> {
		&self.backend
	}

	async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
		let texts = [query.to_string()];
		let mut vectors = self.embedding.embed(&self.embedding_cfg, &texts).await?;

		match vectors.pop() {
			Some(vector) if !vector.is_empty() => Ok(vector),
			_ => Err(Error::Provider(quarry_providers::Error::InvalidResponse {
				message: "Embedding provider returned no vector for the query.".to_string(),
			})),
		}
	}

	async fn search(
		&self,
		collection_id: &str,
		params: &SearchParams,
	) -> Result<Vec<SearchResult>> {
		let query = params.query_text.trim();

		if query.is_empty() || params.match_count == 0 {
			return Ok(Vec::new());
		}

		let collections = vec![collection_id.to_string()];
		let mut results = Vec::new();

		if !params.disable_vector_match && self.backend.supports(RetrieverType::Vector) {
			let embedding = self.embed_query(query).await?;
			let retrieve = RetrieveParams::vector(
				embedding,
				collections.clone(),
				params.match_count,
				params.vector_threshold,
			);

			results.extend(
				self.backend
					.retrieve(&retrieve)
					.await?
					.into_iter()
					.map(|hit| hit.into_search_result()),
			);
		}
		if !params.disable_keywords_match && self.backend.supports(RetrieverType::Keyword) {
			let retrieve = RetrieveParams::keyword(query, collections, params.match_count);

			results.extend(
				self.backend
					.retrieve(&retrieve)
					.await?
					.into_iter()
					.filter(|hit| hit.score >= params.keyword_threshold)
					.map(|hit| hit.into_search_result()),
			);
		}

		tracing::debug!(
			collection_id,
			engine = self.backend.engine_type().as_str(),
			hits = results.len(),
			"Hybrid search completed."
		);

		Ok(results)
	}
}
impl KnowledgeBaseService for BackendKnowledgeBase {
	fn hybrid_search<'a>(
		&'a self,
		collection_id: &'a str,
		params: &'a SearchParams,
	) -> BoxFuture<'a, Result<Vec<SearchResult>>> {
		Box::pin(self.search(collection_id, params))
	}
}
