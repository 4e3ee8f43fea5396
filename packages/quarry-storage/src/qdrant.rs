use std::collections::HashMap;

use qdrant_client::{
	Payload,
	qdrant::{
		Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
		DeletePointsBuilder, Distance, FieldType, Filter, PointId, PointStruct, Query,
		QueryPointsBuilder, RetrievedPoint, ScrollPointsBuilder, SetPayloadPointsBuilder,
		UpsertPointsBuilder, Value, Vector, VectorParamsBuilder, VectorsConfigBuilder,
		VectorsOutput, value::Kind, vectors_output::VectorsOptions,
	},
};
use uuid::Uuid;

use quarry_domain::{
	EngineType, IndexInfo, IndexWithScore, MatchType, RetrieveParams, RetrieverType, SourceType,
};

use crate::{
	BatchSaveReport, BoxFuture, COPY_BATCH_SIZE, CopyIndicesRequest, CopyReport, IndexParams,
	Result, RetrievalBackend,
};

pub const DENSE_VECTOR_NAME: &str = "dense";

const SUPPORT: &[RetrieverType] = &[RetrieverType::Vector, RetrieverType::Keyword];
const KEYWORD_SCORE: f32 = 1.0;
const KEYWORD_FIELDS: [&str; 4] = ["collection_id", "knowledge_id", "chunk_id", "source_id"];

pub struct QdrantBackend {
	pub client: qdrant_client::Qdrant,
	pub collection: String,
	pub vector_dim: u32,
}
impl QdrantBackend {
	pub fn new(cfg: &quarry_config::Qdrant) -> Result<Self> {
		let client = qdrant_client::Qdrant::from_url(&cfg.url).build()?;

		Ok(Self { client, collection: cfg.collection.clone(), vector_dim: cfg.vector_dim })
	}

	/// Creates the collection and its payload indexes when missing.
	pub async fn ensure_collection(&self) -> Result<()> {
		if self.client.collection_exists(self.collection.clone()).await? {
			return Ok(());
		}

		let mut vectors = VectorsConfigBuilder::default();

		vectors.add_named_vector_params(
			DENSE_VECTOR_NAME,
			VectorParamsBuilder::new(self.vector_dim as u64, Distance::Cosine),
		);

		self.client
			.create_collection(
				CreateCollectionBuilder::new(self.collection.clone()).vectors_config(vectors),
			)
			.await?;

		for field in KEYWORD_FIELDS {
			self.create_field_index(field, FieldType::Keyword).await?;
		}

		self.create_field_index("is_enabled", FieldType::Bool).await?;
		self.create_field_index("content", FieldType::Text).await?;

		tracing::info!(collection = %self.collection, "Qdrant collection created.");

		Ok(())
	}

	async fn create_field_index(&self, field: &str, field_type: FieldType) -> Result<()> {
		self.client
			.create_field_index(
				CreateFieldIndexCollectionBuilder::new(self.collection.clone(), field, field_type)
					.wait(true),
			)
			.await?;

		Ok(())
	}

	async fn upsert(&self, points: Vec<PointStruct>) -> Result<()> {
		if points.is_empty() {
			return Ok(());
		}

		self.client
			.upsert_points(UpsertPointsBuilder::new(self.collection.clone(), points).wait(true))
			.await?;

		Ok(())
	}

	async fn delete_matching(&self, field: &str, ids: &[String]) -> Result<()> {
		if ids.is_empty() {
			return Ok(());
		}

		self.client
			.delete_points(
				DeletePointsBuilder::new(self.collection.clone())
					.points(Filter::must([Condition::matches(field, ids.to_vec())]))
					.wait(true),
			)
			.await?;

		Ok(())
	}

	async fn set_enabled(&self, chunk_ids: Vec<String>, is_enabled: bool) -> Result<()> {
		if chunk_ids.is_empty() {
			return Ok(());
		}

		let mut payload = Payload::new();

		payload.insert("is_enabled", is_enabled);

		self.client
			.set_payload(
				SetPayloadPointsBuilder::new(self.collection.clone(), payload)
					.points_selector(Filter::must([Condition::matches("chunk_id", chunk_ids)]))
					.wait(true),
			)
			.await?;

		Ok(())
	}
}
impl RetrievalBackend for QdrantBackend {
	fn engine_type(&self) -> EngineType {
		EngineType::Qdrant
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
			let embedding = crate::require_embedding(item, params)?;

			self.upsert(vec![to_point(item, embedding.to_vec())]).await
		})
	}

	fn batch_save<'a>(
		&'a self,
		items: &'a [IndexInfo],
		params: &'a IndexParams,
	) -> BoxFuture<'a, Result<BatchSaveReport>> {
		Box::pin(async move {
			let mut report = BatchSaveReport::default();
			let mut points = Vec::with_capacity(items.len());

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

				points.push(to_point(item, embedding.to_vec()));
			}

			report.saved = points.len();

			self.upsert(points).await?;

			Ok(report)
		})
	}

	fn delete_by_chunk_ids<'a>(&'a self, chunk_ids: &'a [String]) -> BoxFuture<'a, Result<()>> {
		Box::pin(self.delete_matching("chunk_id", chunk_ids))
	}

	fn delete_by_knowledge_ids<'a>(
		&'a self,
		knowledge_ids: &'a [String],
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(self.delete_matching("knowledge_id", knowledge_ids))
	}

	fn delete_by_source_ids<'a>(&'a self, source_ids: &'a [String]) -> BoxFuture<'a, Result<()>> {
		Box::pin(self.delete_matching("source_id", source_ids))
	}

	fn batch_update_enabled_status<'a>(
		&'a self,
		status: &'a HashMap<String, bool>,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let (enabled, disabled) = crate::partition_enabled(status);

			self.set_enabled(enabled, true).await?;
			self.set_enabled(disabled, false).await?;

			Ok(())
		})
	}

	fn vector_retrieve<'a>(
		&'a self,
		params: &'a RetrieveParams,
	) -> BoxFuture<'a, Result<Vec<IndexWithScore>>> {
		Box::pin(async move {
			crate::require_query_embedding(params)?;

			let search = QueryPointsBuilder::new(self.collection.clone())
				.query(Query::new_nearest(params.embedding.clone()))
				.using(DENSE_VECTOR_NAME)
				.filter(base_filter(params))
				.limit(params.top_k as u64)
				.score_threshold(params.threshold)
				.with_payload(true);
			let response = self.client.query(search).await?;
			let mut hits = Vec::with_capacity(response.result.len());

			for point in response.result {
				let Some(index) = index_from_payload(&point.payload) else {
					tracing::warn!(
						collection = %self.collection,
						"Vector hit has an incomplete payload."
					);

					continue;
				};

				hits.push(IndexWithScore {
					index,
					score: point.score,
					match_type: MatchType::Vector,
				});
			}

			Ok(hits)
		})
	}

	fn keyword_retrieve<'a>(
		&'a self,
		params: &'a RetrieveParams,
	) -> BoxFuture<'a, Result<Vec<IndexWithScore>>> {
		Box::pin(async move {
			let query = params.query.trim();

			if query.is_empty() {
				return Ok(Vec::new());
			}

			let mut filter = base_filter(params);

			filter.must.push(Condition::matches_text("content", query));

			let scroll = ScrollPointsBuilder::new(self.collection.clone())
				.filter(filter)
				.limit(params.top_k as u32)
				.with_payload(true)
				.with_vectors(false);
			let response = self.client.scroll(scroll).await?;
			let hits = response
				.result
				.iter()
				.filter_map(|point| index_from_payload(&point.payload))
				.map(|index| IndexWithScore {
					index,
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
			let mut offset: Option<PointId> = None;

			loop {
				let mut scroll = ScrollPointsBuilder::new(self.collection.clone())
					.filter(Filter::must([Condition::matches(
						"collection_id",
						req.source_collection_id.clone(),
					)]))
					.limit(COPY_BATCH_SIZE as u32)
					.with_payload(true)
					.with_vectors(true);

				if let Some(offset) = offset.take() {
					scroll = scroll.offset(offset);
				}

				let response = self.client.scroll(scroll).await?;
				let mut points = Vec::with_capacity(response.result.len());

				for point in &response.result {
					if let Some(copied) = copy_point(point, req, &mut report) {
						points.push(copied);
					}
				}

				report.copied += points.len();

				self.upsert(points).await?;

				match response.next_page_offset {
					Some(next) => offset = Some(next),
					None => break,
				}
			}

			tracing::info!(
				source_collection_id = %req.source_collection_id,
				target_collection_id = %req.target_collection_id,
				copied = report.copied,
				skipped_missing_mapping = report.skipped_missing_mapping,
				skipped_missing_vector = report.skipped_missing_vector,
				"Indices copied."
			);

			Ok(report)
		})
	}
}

/// Point IDs derive from `(collection_id, source_id)`, which makes saves idempotent.
pub fn point_id(collection_id: &str, source_id: &str) -> Uuid {
	Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{collection_id}:{source_id}").as_bytes())
}

fn to_point(item: &IndexInfo, embedding: Vec<f32>) -> PointStruct {
	let mut vectors = HashMap::new();

	vectors.insert(DENSE_VECTOR_NAME.to_string(), Vector::from(embedding));

	PointStruct::new(
		point_id(&item.collection_id, &item.source_id).to_string(),
		vectors,
		to_payload(item),
	)
}

fn to_payload(item: &IndexInfo) -> Payload {
	let mut payload = Payload::new();

	payload.insert("content", item.content.clone());
	payload.insert("source_id", item.source_id.clone());
	payload.insert("source_type", item.source_type.as_i64());
	payload.insert("chunk_id", item.chunk_id.clone());
	payload.insert("knowledge_id", item.knowledge_id.clone());
	payload.insert("collection_id", item.collection_id.clone());
	if let Some(parent_chunk_id) = &item.parent_chunk_id {
		payload.insert("parent_chunk_id", parent_chunk_id.clone());
	}

	payload.insert("chunk_index", i64::from(item.chunk_index));
	payload.insert("start_at", i64::from(item.start_at));
	payload.insert("end_at", i64::from(item.end_at));
	payload.insert("is_enabled", item.is_enabled);

	payload
}

fn base_filter(params: &RetrieveParams) -> Filter {
	let mut must = vec![Condition::matches("is_enabled", true)];
	let mut must_not = Vec::new();

	if !params.collection_ids.is_empty() {
		must.push(Condition::matches("collection_id", params.collection_ids.clone()));
	}
	if !params.exclude_collection_ids.is_empty() {
		must_not.push(Condition::matches("collection_id", params.exclude_collection_ids.clone()));
	}
	if !params.exclude_knowledge_ids.is_empty() {
		must_not.push(Condition::matches("knowledge_id", params.exclude_knowledge_ids.clone()));
	}
	if !params.exclude_chunk_ids.is_empty() {
		must_not.push(Condition::matches("chunk_id", params.exclude_chunk_ids.clone()));
	}

	Filter { must, must_not, ..Default::default() }
}

fn copy_point(
	point: &RetrievedPoint,
	req: &CopyIndicesRequest,
	report: &mut CopyReport,
) -> Option<PointStruct> {
	let Some(index) = index_from_payload(&point.payload) else {
		tracing::warn!("Skipping copy of point with an incomplete payload.");

		report.skipped_missing_mapping += 1;

		return None;
	};
	let Some(vector) = dense_vector(point.vectors.as_ref()) else {
		tracing::warn!(source_id = %index.source_id, "Skipping copy of index without vector.");

		report.skipped_missing_vector += 1;

		return None;
	};
	let Some(copied) = crate::remap_index(&index, req) else {
		tracing::warn!(
			chunk_id = %index.chunk_id,
			knowledge_id = %index.knowledge_id,
			"Skipping copy of index without ID mapping."
		);

		report.skipped_missing_mapping += 1;

		return None;
	};

	Some(to_point(&copied, vector))
}

#[allow(deprecated)]
fn dense_vector(vectors: Option<&VectorsOutput>) -> Option<Vec<f32>> {
	let data = match vectors?.vectors_options.as_ref()? {
		VectorsOptions::Vector(vector) => vector.data.clone(),
		VectorsOptions::Vectors(named) => named.vectors.get(DENSE_VECTOR_NAME)?.data.clone(),
	};

	(!data.is_empty()).then_some(data)
}

fn index_from_payload(payload: &HashMap<String, Value>) -> Option<IndexInfo> {
	Some(IndexInfo {
		source_id: payload_string(payload, "source_id")?,
		source_type: payload_i64(payload, "source_type")
			.and_then(SourceType::from_i64)
			.unwrap_or_default(),
		chunk_id: payload_string(payload, "chunk_id")?,
		knowledge_id: payload_string(payload, "knowledge_id")?,
		collection_id: payload_string(payload, "collection_id")?,
		parent_chunk_id: payload_string(payload, "parent_chunk_id"),
		content: payload_string(payload, "content")?,
		chunk_index: payload_i32(payload, "chunk_index").unwrap_or(0),
		start_at: payload_i32(payload, "start_at").unwrap_or(0),
		end_at: payload_i32(payload, "end_at").unwrap_or(0),
		is_enabled: payload_bool(payload, "is_enabled").unwrap_or(true),
	})
}

fn payload_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
	match &payload.get(key)?.kind {
		Some(Kind::StringValue(text)) => Some(text.to_string()),
		_ => None,
	}
}

fn payload_i64(payload: &HashMap<String, Value>, key: &str) -> Option<i64> {
	match &payload.get(key)?.kind {
		Some(Kind::IntegerValue(value)) => Some(*value),
		Some(Kind::DoubleValue(value)) if value.fract() == 0.0 => Some(*value as i64),
		_ => None,
	}
}

fn payload_i32(payload: &HashMap<String, Value>, key: &str) -> Option<i32> {
	payload_i64(payload, key).and_then(|value| i32::try_from(value).ok())
}

fn payload_bool(payload: &HashMap<String, Value>, key: &str) -> Option<bool> {
	match &payload.get(key)?.kind {
		Some(Kind::BoolValue(value)) => Some(*value),
		_ => None,
	}
}
