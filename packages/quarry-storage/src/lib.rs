//! Uniform storage and retrieval over indexed passages.
//!
//! Every engine implements [`RetrievalBackend`]. Callers only route match types an engine
//! declares in [`RetrievalBackend::support`]; [`RetrievalBackend::retrieve`] rejects the rest.

pub mod memory;
pub mod postgres;
pub mod qdrant;

mod error;

pub use error::{Error, Result};

use std::{collections::HashMap, future::Future, pin::Pin};

use quarry_domain::{EngineType, IndexInfo, IndexWithScore, RetrieveParams, RetrieverType};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Page size used when copying a collection.
pub const COPY_BATCH_SIZE: usize = 64;

const SOURCE_TYPE_BYTES: u64 = 8;
const VECTOR_ELEMENT_BYTES: u64 = 4;
const HNSW_M: u64 = 16;
const ID_TRACKER_BYTES: u64 = 24;

/// Write-side arguments shared by every item of a save call.
#[derive(Clone, Debug, Default)]
pub struct IndexParams {
	/// Keyed by `IndexInfo::source_id`.
	pub embeddings: HashMap<String, Vec<f32>>,
}
impl IndexParams {
	pub fn embedding_for(&self, item: &IndexInfo) -> Option<&[f32]> {
		self.embeddings.get(&item.source_id).map(Vec::as_slice).filter(|vec| !vec.is_empty())
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSaveReport {
	pub saved: usize,
	pub skipped: usize,
}

#[derive(Clone, Debug, Default)]
pub struct CopyIndicesRequest {
	pub source_collection_id: String,
	pub target_collection_id: String,
	/// Source knowledge ID to target knowledge ID.
	pub knowledge_id_map: HashMap<String, String>,
	/// Source chunk ID to target chunk ID.
	pub chunk_id_map: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyReport {
	pub copied: usize,
	pub skipped_missing_mapping: usize,
	pub skipped_missing_vector: usize,
}

pub trait RetrievalBackend
where
	Self: Send + Sync,
{
	fn engine_type(&self) -> EngineType;

	fn support(&self) -> &'static [RetrieverType];

	/// Idempotent upsert of one item. Fails when the item has no embedding.
	fn save<'a>(
		&'a self,
		item: &'a IndexInfo,
		params: &'a IndexParams,
	) -> BoxFuture<'a, Result<()>>;

	/// Upserts every valid item; invalid items are skipped and logged one by one.
	fn batch_save<'a>(
		&'a self,
		items: &'a [IndexInfo],
		params: &'a IndexParams,
	) -> BoxFuture<'a, Result<BatchSaveReport>>;

	fn delete_by_chunk_ids<'a>(&'a self, chunk_ids: &'a [String]) -> BoxFuture<'a, Result<()>>;

	fn delete_by_knowledge_ids<'a>(
		&'a self,
		knowledge_ids: &'a [String],
	) -> BoxFuture<'a, Result<()>>;

	fn delete_by_source_ids<'a>(&'a self, source_ids: &'a [String]) -> BoxFuture<'a, Result<()>>;

	/// Applies the enabled and the disabled set as one bulk update each. Keys are chunk IDs.
	fn batch_update_enabled_status<'a>(
		&'a self,
		status: &'a HashMap<String, bool>,
	) -> BoxFuture<'a, Result<()>>;

	fn vector_retrieve<'a>(
		&'a self,
		params: &'a RetrieveParams,
	) -> BoxFuture<'a, Result<Vec<IndexWithScore>>>;

	/// Keyword hits carry a constant raw score; normalization happens upstream.
	fn keyword_retrieve<'a>(
		&'a self,
		params: &'a RetrieveParams,
	) -> BoxFuture<'a, Result<Vec<IndexWithScore>>>;

	/// Pages through the source collection with a cursor, re-keys every item through the
	/// request maps, and writes it into the target collection with its vector untouched.
	fn copy_indices<'a>(
		&'a self,
		req: &'a CopyIndicesRequest,
	) -> BoxFuture<'a, Result<CopyReport>>;

	fn supports(&self, retriever_type: RetrieverType) -> bool {
		self.support().contains(&retriever_type)
	}

	fn retrieve<'a>(
		&'a self,
		params: &'a RetrieveParams,
	) -> BoxFuture<'a, Result<Vec<IndexWithScore>>> {
		if !self.supports(params.retriever_type) {
			let err = Error::UnsupportedRetriever {
				engine: self.engine_type().as_str(),
				retriever_type: params.retriever_type.as_str(),
			};

			return Box::pin(async move { Err(err) });
		}

		match params.retriever_type {
			RetrieverType::Vector => self.vector_retrieve(params),
			RetrieverType::Keyword => self.keyword_retrieve(params),
		}
	}

	fn estimate_storage_size(&self, items: &[IndexInfo], params: &IndexParams) -> u64 {
		items
			.iter()
			.map(|item| {
				let dimensions = params.embedding_for(item).map(<[f32]>::len).unwrap_or(0);

				estimate_index_size(item, dimensions)
			})
			.sum()
	}
}

/// Bytes one indexed item occupies: payload strings, the raw vector, its HNSW links, and the
/// point id tracker entry.
pub fn estimate_index_size(item: &IndexInfo, dimensions: usize) -> u64 {
	let strings = [
		item.content.len(),
		item.source_id.len(),
		item.chunk_id.len(),
		item.knowledge_id.len(),
		item.collection_id.len(),
		item.parent_chunk_id.as_deref().map(str::len).unwrap_or(0),
	];
	let payload = strings.iter().map(|len| *len as u64).sum::<u64>() + SOURCE_TYPE_BYTES;
	let dimensions = dimensions as u64;
	let vector = dimensions * VECTOR_ELEMENT_BYTES;
	let hnsw = dimensions * (HNSW_M * 2) * VECTOR_ELEMENT_BYTES;

	payload + vector + hnsw + ID_TRACKER_BYTES
}

/// Splits a status map into sorted `(enabled, disabled)` ID lists.
pub fn partition_enabled(status: &HashMap<String, bool>) -> (Vec<String>, Vec<String>) {
	let mut enabled = Vec::new();
	let mut disabled = Vec::new();

	for (id, is_enabled) in status {
		if *is_enabled {
			enabled.push(id.clone());
		} else {
			disabled.push(id.clone());
		}
	}

	enabled.sort();
	disabled.sort();

	(enabled, disabled)
}

/// Re-keys `item` into the target collection. Returns `None` when a mapping is missing.
pub fn remap_index(item: &IndexInfo, req: &CopyIndicesRequest) -> Option<IndexInfo> {
	let chunk_id = req.chunk_id_map.get(&item.chunk_id)?;
	let knowledge_id = req.knowledge_id_map.get(&item.knowledge_id)?;
	let source_id = if item.source_id == item.chunk_id {
		chunk_id.clone()
	} else {
		req.chunk_id_map.get(&item.source_id).cloned().unwrap_or_else(|| item.source_id.clone())
	};
	let parent_chunk_id = item
		.parent_chunk_id
		.as_ref()
		.map(|parent| req.chunk_id_map.get(parent).cloned().unwrap_or_else(|| parent.clone()));

	Some(IndexInfo {
		source_id,
		chunk_id: chunk_id.clone(),
		knowledge_id: knowledge_id.clone(),
		collection_id: req.target_collection_id.clone(),
		parent_chunk_id,
		..item.clone()
	})
}

pub(crate) fn require_embedding<'a>(
	item: &IndexInfo,
	params: &'a IndexParams,
) -> Result<&'a [f32]> {
	params
		.embedding_for(item)
		.ok_or_else(|| Error::MissingEmbedding { source_id: item.source_id.clone() })
}

pub(crate) fn require_query_embedding(params: &RetrieveParams) -> Result<()> {
	if params.embedding.is_empty() {
		return Err(Error::InvalidArgument(
			"Vector retrieval requires a query embedding.".to_string(),
		));
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use quarry_domain::SourceType;

	use super::*;

	fn item() -> IndexInfo {
		IndexInfo {
			source_id: "c1".to_string(),
			source_type: SourceType::Chunk,
			chunk_id: "c1".to_string(),
			knowledge_id: "k1".to_string(),
			collection_id: "kb1".to_string(),
			parent_chunk_id: Some("p1".to_string()),
			content: "abcd".to_string(),
			chunk_index: 0,
			start_at: 0,
			end_at: 4,
			is_enabled: true,
		}
	}

	#[test]
	fn storage_estimate_counts_payload_vector_and_index() {
		// payload 4 + 2 + 2 + 2 + 3 + 2 + 8 = 23; vector 3 * 4 = 12; hnsw 3 * 32 * 4 = 384.
		assert_eq!(estimate_index_size(&item(), 3), 23 + 12 + 384 + 24);
		assert_eq!(estimate_index_size(&item(), 0), 23 + 24);
	}

	#[test]
	fn remap_requires_both_mappings() {
		let mut req = CopyIndicesRequest {
			source_collection_id: "kb1".to_string(),
			target_collection_id: "kb2".to_string(),
			..Default::default()
		};

		req.chunk_id_map.insert("c1".to_string(), "c9".to_string());

		assert!(remap_index(&item(), &req).is_none());

		req.knowledge_id_map.insert("k1".to_string(), "k9".to_string());

		let copied = remap_index(&item(), &req).expect("Expected a remapped item.");

		assert_eq!(copied.chunk_id, "c9");
		assert_eq!(copied.source_id, "c9");
		assert_eq!(copied.knowledge_id, "k9");
		assert_eq!(copied.collection_id, "kb2");
		assert_eq!(copied.parent_chunk_id.as_deref(), Some("p1"));
	}

	#[test]
	fn partition_splits_and_sorts() {
		let status = HashMap::from([
			("b".to_string(), true),
			("a".to_string(), true),
			("c".to_string(), false),
		]);

		assert_eq!(
			partition_enabled(&status),
			(vec!["a".to_string(), "b".to_string()], vec!["c".to_string()])
		);
	}
}
