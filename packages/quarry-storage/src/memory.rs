//! In-process engine for development and tests.

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	ops::Bound,
	sync::RwLock,
};

use quarry_domain::{
	EngineType, IndexInfo, IndexWithScore, MatchType, RetrieveParams, RetrieverType,
};

use crate::{
	BatchSaveReport, BoxFuture, COPY_BATCH_SIZE, CopyIndicesRequest, CopyReport, IndexParams,
	Result, RetrievalBackend,
};

const SUPPORT: &[RetrieverType] = &[RetrieverType::Vector, RetrieverType::Keyword];
const KEYWORD_SCORE: f32 = 1.0;

#[derive(Clone, Debug)]
struct StoredIndex {
	info: IndexInfo,
	embedding: Vec<f32>,
}

/// Entries are keyed by `(collection_id, source_id)`; the BTreeMap order doubles as the copy
/// cursor.
#[derive(Debug, Default)]
pub struct MemoryBackend {
	entries: RwLock<BTreeMap<(String, String), StoredIndex>>,
}
impl MemoryBackend {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Returns a stored item with its vector, for inspection in tests and tooling.
	pub fn get(&self, collection_id: &str, source_id: &str) -> Option<(IndexInfo, Vec<f32>)> {
		self.read()
			.get(&(collection_id.to_string(), source_id.to_string()))
			.map(|stored| (stored.info.clone(), stored.embedding.clone()))
	}

	fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<(String, String), StoredIndex>> {
		self.entries.read().unwrap_or_else(|err| err.into_inner())
	}

	fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<(String, String), StoredIndex>> {
		self.entries.write().unwrap_or_else(|err| err.into_inner())
	}

	fn insert(&self, info: IndexInfo, embedding: Vec<f32>) {
		let key = (info.collection_id.clone(), info.source_id.clone());

		self.write().insert(key, StoredIndex { info, embedding });
	}

	fn retain(&self, keep: impl Fn(&IndexInfo) -> bool) {
		self.write().retain(|_, stored| keep(&stored.info));
	}

	fn next_page(
		&self,
		collection_id: &str,
		cursor: Option<&(String, String)>,
	) -> Vec<((String, String), StoredIndex)> {
		let entries = self.read();
		let lower = match cursor {
			Some(key) => Bound::Excluded(key.clone()),
			None => Bound::Included((collection_id.to_string(), String::new())),
		};

		entries
			.range((lower, Bound::Unbounded))
			.take_while(|((collection, _), _)| collection == collection_id)
			.take(COPY_BATCH_SIZE)
			.map(|(key, stored)| (key.clone(), stored.clone()))
			.collect()
	}
}
impl RetrievalBackend for MemoryBackend {
	fn engine_type(&self) -> EngineType {
		EngineType::Memory
	}

	fn support(&self) -> &'static [RetrieverType] {
		SUPPORT
	}

	fn save<'a>(
		&'a self,
		item: &'a IndexInfo,
		params: &'a IndexParams,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let embedding = crate::require_embedding(item, params)?.to_vec();

			self.insert(item.clone(), embedding);

			Ok(())
		})
	}

	fn batch_save<'a>(
		&'a self,
		items: &'a [IndexInfo],
		params: &'a IndexParams,
	) -> BoxFuture<'a, Result<BatchSaveReport>> {
		Box::pin(async move {
			let mut report = BatchSaveReport::default();

			for item in items {
				let Some(embedding) = params.embedding_for(item) else {
					tracing::warn!(
						source_id = %item.source_id,
						chunk_id = %item.chunk_id,
						"Skipping index without embedding."
					);

					report.skipped += 1;

					continue;
				};

				self.insert(item.clone(), embedding.to_vec());

				report.saved += 1;
			}

			Ok(report)
		})
	}

	fn delete_by_chunk_ids<'a>(&'a self, chunk_ids: &'a [String]) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			if !chunk_ids.is_empty() {
				let ids = chunk_ids.iter().collect::<HashSet<_>>();

				self.retain(|info| !ids.contains(&info.chunk_id));
			}

			Ok(())
		})
	}

	fn delete_by_knowledge_ids<'a>(
		&'a self,
		knowledge_ids: &'a [String],
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			if !knowledge_ids.is_empty() {
				let ids = knowledge_ids.iter().collect::<HashSet<_>>();

				self.retain(|info| !ids.contains(&info.knowledge_id));
			}

			Ok(())
		})
	}

	fn delete_by_source_ids<'a>(&'a self, source_ids: &'a [String]) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			if !source_ids.is_empty() {
				let ids = source_ids.iter().collect::<HashSet<_>>();

				self.retain(|info| !ids.contains(&info.source_id));
			}

			Ok(())
		})
	}

	fn batch_update_enabled_status<'a>(
		&'a self,
		status: &'a HashMap<String, bool>,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let (enabled, disabled) = crate::partition_enabled(status);

			for (ids, is_enabled) in [(enabled, true), (disabled, false)] {
				if ids.is_empty() {
					continue;
				}

				let ids = ids.into_iter().collect::<HashSet<_>>();
				let mut entries = self.write();

				for stored in entries.values_mut() {
					if ids.contains(&stored.info.chunk_id) {
						stored.info.is_enabled = is_enabled;
					}
				}
			}

			Ok(())
		})
	}

	fn vector_retrieve<'a>(
		&'a self,
		params: &'a RetrieveParams,
	) -> BoxFuture<'a, Result<Vec<IndexWithScore>>> {
		Box::pin(async move {
			crate::require_query_embedding(params)?;

			let mut hits = self
				.read()
				.values()
				.filter(|stored| passes_base_filter(&stored.info, params))
				.filter_map(|stored| {
					let score = cosine_similarity(&params.embedding, &stored.embedding)?;

					(score >= params.threshold).then(|| IndexWithScore {
						index: stored.info.clone(),
						score,
						match_type: MatchType::Vector,
					})
				})
				.collect::<Vec<_>>();

			hits.sort_by(|a, b| b.score.total_cmp(&a.score));
			hits.truncate(params.top_k);

			Ok(hits)
		})
	}

	fn keyword_retrieve<'a>(
		&'a self,
		params: &'a RetrieveParams,
	) -> BoxFuture<'a, Result<Vec<IndexWithScore>>> {
		Box::pin(async move {
			let needle = params.query.trim().to_lowercase();

			if needle.is_empty() {
				return Ok(Vec::new());
			}

			let hits = self
				.read()
				.values()
				.filter(|stored| passes_base_filter(&stored.info, params))
				.filter(|stored| stored.info.content.to_lowercase().contains(&needle))
				.take(params.top_k)
				.map(|stored| IndexWithScore {
					index: stored.info.clone(),
					score: KEYWORD_SCORE,
					match_type: MatchType::Keyword,
				})
				.collect();

			Ok(hits)
		})
	}

	fn copy_indices<'a>(
		&'a self,
		req: &'a CopyIndicesRequest,
	) -> BoxFuture<'a, Result<CopyReport>> {
		Box::pin(async move {
			let mut report = CopyReport::default();
			let mut cursor = None;

			loop {
				let page = self.next_page(&req.source_collection_id, cursor.as_ref());
				let Some((last_key, _)) = page.last() else {
					break;
				};

				cursor = Some(last_key.clone());

				for (_, stored) in page {
					if stored.embedding.is_empty() {
						tracing::warn!(
							source_id = %stored.info.source_id,
							"Skipping copy of index without vector."
						);

						report.skipped_missing_vector += 1;

						continue;
					}

					let Some(copied) = crate::remap_index(&stored.info, req) else {
						tracing::warn!(
							chunk_id = %stored.info.chunk_id,
							knowledge_id = %stored.info.knowledge_id,
							"Skipping copy of index without ID mapping."
						);

						report.skipped_missing_mapping += 1;

						continue;
					};

					self.insert(copied, stored.embedding);

					report.copied += 1;
				}
			}

			Ok(report)
		})
	}
}

fn passes_base_filter(info: &IndexInfo, params: &RetrieveParams) -> bool {
	info.is_enabled
		&& (params.collection_ids.is_empty() || params.collection_ids.contains(&info.collection_id))
		&& !params.exclude_collection_ids.contains(&info.collection_id)
		&& !params.exclude_knowledge_ids.contains(&info.knowledge_id)
		&& !params.exclude_chunk_ids.contains(&info.chunk_id)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
	if a.len() != b.len() || a.is_empty() {
		return None;
	}

	let mut dot = 0.0_f32;
	let mut norm_a = 0.0_f32;
	let mut norm_b = 0.0_f32;

	for (x, y) in a.iter().zip(b) {
		dot += x * y;
		norm_a += x * x;
		norm_b += y * y;
	}

	if norm_a == 0.0 || norm_b == 0.0 {
		return None;
	}

	Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}
