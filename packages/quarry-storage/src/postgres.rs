use std::collections::HashMap;

use sqlx::{PgExecutor, PgPool, postgres::PgPoolOptions};

use quarry_domain::{
	EngineType, IndexInfo, IndexWithScore, MatchType, RetrieveParams, RetrieverType, SourceType,
};

use crate::{
	BatchSaveReport, BoxFuture, COPY_BATCH_SIZE, CopyIndicesRequest, CopyReport, IndexParams,
	Result, RetrievalBackend,
};

const SUPPORT: &[RetrieverType] = &[RetrieverType::Vector, RetrieverType::Keyword];
const KEYWORD_SCORE: f32 = 1.0;
const SCHEMA_LOCK_ID: i64 = 5_318_427;
const INDEX_COLUMNS: &str = "\
id,
	collection_id,
	source_id,
	source_type,
	chunk_id,
	knowledge_id,
	parent_chunk_id,
	content,
	chunk_index,
	start_at,
	end_at,
	is_enabled";
const UPSERT_CONFLICT: &str = "\
ON CONFLICT (collection_id, source_id) DO UPDATE
SET
	source_type = EXCLUDED.source_type,
	chunk_id = EXCLUDED.chunk_id,
	knowledge_id = EXCLUDED.knowledge_id,
	parent_chunk_id = EXCLUDED.parent_chunk_id,
	content = EXCLUDED.content,
	chunk_index = EXCLUDED.chunk_index,
	start_at = EXCLUDED.start_at,
	end_at = EXCLUDED.end_at,
	is_enabled = EXCLUDED.is_enabled,
	embedding = EXCLUDED.embedding,
	updated_at = now()";
const BASE_FILTER: &str = "\
is_enabled
	AND (cardinality($1::text[]) = 0 OR collection_id = ANY($1))
	AND NOT (collection_id = ANY($2))
	AND NOT (knowledge_id = ANY($3))
	AND NOT (chunk_id = ANY($4))";

#[derive(Debug, sqlx::FromRow)]
struct IndexRow {
	id: i64,
	collection_id: String,
	source_id: String,
	source_type: i64,
	chunk_id: String,
	knowledge_id: String,
	parent_chunk_id: Option<String>,
	content: String,
	chunk_index: i32,
	start_at: i32,
	end_at: i32,
	is_enabled: bool,
}
impl IndexRow {
	fn into_info(self) -> IndexInfo {
		IndexInfo {
			source_id: self.source_id,
			source_type: SourceType::from_i64(self.source_type).unwrap_or_default(),
			chunk_id: self.chunk_id,
			knowledge_id: self.knowledge_id,
			collection_id: self.collection_id,
			parent_chunk_id: self.parent_chunk_id,
			content: self.content,
			chunk_index: self.chunk_index,
			start_at: self.start_at,
			end_at: self.end_at,
			is_enabled: self.is_enabled,
		}
	}
}

#[derive(Debug, sqlx::FromRow)]
struct ScoredRow {
	#[sqlx(flatten)]
	row: IndexRow,
	score: f32,
}

/// pgvector-backed engine. All rows live in one table keyed by `(collection_id, source_id)`.
pub struct PgBackend {
	pub pool: PgPool,
	pub vector_dim: u32,
}
impl PgBackend {
	pub async fn connect(cfg: &quarry_config::Postgres) -> Result<Self> {
		let pool =
			PgPoolOptions::new().max_connections(cfg.pool_max_conns).connect(&cfg.dsn).await?;

		Ok(Self { pool, vector_dim: cfg.vector_dim })
	}

	pub async fn ensure_schema(&self) -> Result<()> {
		let sql = render_schema(self.vector_dim);
		let mut tx = self.pool.begin().await?;

		sqlx::query("SELECT pg_advisory_xact_lock($1)")
			.bind(SCHEMA_LOCK_ID)
			.execute(&mut *tx)
			.await?;

		for statement in sql.split(';') {
			let trimmed = statement.trim();

			if trimmed.is_empty() {
				continue;
			}

			sqlx::query(trimmed).execute(&mut *tx).await?;
		}

		tx.commit().await?;

		Ok(())
	}

	async fn delete_where(&self, column: &str, ids: &[String]) -> Result<()> {
		if ids.is_empty() {
			return Ok(());
		}

		let sql = format!("DELETE FROM quarry_indices WHERE {column} = ANY($1)");
		let result = sqlx::query(&sql).bind(ids).execute(&self.pool).await?;

		tracing::debug!(column, rows = result.rows_affected(), "Indices deleted.");

		Ok(())
	}

	async fn set_enabled(&self, chunk_ids: &[String], is_enabled: bool) -> Result<()> {
		if chunk_ids.is_empty() {
			return Ok(());
		}

		sqlx::query(
			"\
UPDATE quarry_indices
SET is_enabled = $1, updated_at = now()
WHERE chunk_id = ANY($2)",
		)
		.bind(is_enabled)
		.bind(chunk_ids)
		.execute(&self.pool)
		.await?;

		Ok(())
	}
}
impl RetrievalBackend for PgBackend {
	fn engine_type(&self) -> EngineType {
		EngineType::Postgres
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

			upsert_index(&self.pool, item, embedding).await
		})
	}

	fn batch_save<'a>(
		&'a self,
		items: &'a [IndexInfo],
		params: &'a IndexParams,
	) -> BoxFuture<'a, Result<BatchSaveReport>> {
		Box::pin(async move {
			let mut report = BatchSaveReport::default();
			let mut tx = self.pool.begin().await?;

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

				upsert_index(&mut *tx, item, embedding).await?;

				report.saved += 1;
			}

			tx.commit().await?;

			Ok(report)
		})
	}

	fn delete_by_chunk_ids<'a>(&'a self, chunk_ids: &'a [String]) -> BoxFuture<'a, Result<()>> {
		Box::pin(self.delete_where("chunk_id", chunk_ids))
	}

	fn delete_by_knowledge_ids<'a>(
		&'a self,
		knowledge_ids: &'a [String],
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(self.delete_where("knowledge_id", knowledge_ids))
	}

	fn delete_by_source_ids<'a>(&'a self, source_ids: &'a [String]) -> BoxFuture<'a, Result<()>> {
		Box::pin(self.delete_where("source_id", source_ids))
	}

	fn batch_update_enabled_status<'a>(
		&'a self,
		status: &'a HashMap<String, bool>,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let (enabled, disabled) = crate::partition_enabled(status);

			self.set_enabled(&enabled, true).await?;
			self.set_enabled(&disabled, false).await?;

			Ok(())
		})
	}

	fn vector_retrieve<'a>(
		&'a self,
		params: &'a RetrieveParams,
	) -> BoxFuture<'a, Result<Vec<IndexWithScore>>> {
		Box::pin(async move {
			crate::require_query_embedding(params)?;

			let sql = format!(
				"\
SELECT
	{INDEX_COLUMNS},
	(1 - (embedding <=> $5::text::vector))::real AS score
FROM quarry_indices
WHERE {BASE_FILTER}
	AND 1 - (embedding <=> $5::text::vector) >= $6
ORDER BY embedding <=> $5::text::vector
LIMIT $7"
			);
			let rows: Vec<ScoredRow> = sqlx::query_as(&sql)
				.bind(&params.collection_ids)
				.bind(&params.exclude_collection_ids)
				.bind(&params.exclude_knowledge_ids)
				.bind(&params.exclude_chunk_ids)
				.bind(vector_to_pg(&params.embedding))
				.bind(f64::from(params.threshold))
				.bind(params.top_k as i64)
				.fetch_all(&self.pool)
				.await?;

			Ok(rows
				.into_iter()
				.map(|scored| IndexWithScore {
					index: scored.row.into_info(),
					score: scored.score,
					match_type: MatchType::Vector,
				})
				.collect())
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

			let sql = format!(
				"\
SELECT
	{INDEX_COLUMNS}
FROM quarry_indices
WHERE {BASE_FILTER}
	AND content ILIKE $5 ESCAPE '\\'
ORDER BY id
LIMIT $6"
			);
			let rows: Vec<IndexRow> = sqlx::query_as(&sql)
				.bind(&params.collection_ids)
				.bind(&params.exclude_collection_ids)
				.bind(&params.exclude_knowledge_ids)
				.bind(&params.exclude_chunk_ids)
				.bind(like_pattern(query))
				.bind(params.top_k as i64)
				.fetch_all(&self.pool)
				.await?;

			Ok(rows
				.into_iter()
				.map(|row| IndexWithScore {
					index: row.into_info(),
					score: KEYWORD_SCORE,
					match_type: MatchType::Keyword,
				})
				.collect())
		})
	}

	fn copy_indices<'a>(
		&'a self,
		req: &'a CopyIndicesRequest,
	) -> BoxFuture<'a, Result<CopyReport>> {
		Box::pin(async move {
			let mut report = CopyReport::default();
			let mut cursor = 0_i64;
			let sql = format!(
				"\
SELECT
	{INDEX_COLUMNS}
FROM quarry_indices
WHERE collection_id = $1 AND id > $2
ORDER BY id
LIMIT $3"
			);

			loop {
				let rows: Vec<IndexRow> = sqlx::query_as(&sql)
					.bind(req.source_collection_id.as_str())
					.bind(cursor)
					.bind(COPY_BATCH_SIZE as i64)
					.fetch_all(&self.pool)
					.await?;
				let Some(last) = rows.last() else {
					break;
				};

				cursor = last.id;

				let mut tx = self.pool.begin().await?;

				for row in rows {
					let source_row_id = row.id;
					let info = row.into_info();
					let Some(copied) = crate::remap_index(&info, req) else {
						tracing::warn!(
							chunk_id = %info.chunk_id,
							knowledge_id = %info.knowledge_id,
							"Skipping copy of index without ID mapping."
						);

						report.skipped_missing_mapping += 1;

						continue;
					};

					copy_row(&mut *tx, source_row_id, &copied).await?;

					report.copied += 1;
				}

				tx.commit().await?;
			}

			tracing::info!(
				source_collection_id = %req.source_collection_id,
				target_collection_id = %req.target_collection_id,
				copied = report.copied,
				skipped_missing_mapping = report.skipped_missing_mapping,
				"Indices copied."
			);

			Ok(report)
		})
	}
}

pub fn render_schema(vector_dim: u32) -> String {
	include_str!("../sql/indices.sql").replace("<VECTOR_DIM>", &vector_dim.to_string())
}

pub fn vector_to_pg(vec: &[f32]) -> String {
	let mut out = String::with_capacity(vec.len() * 8 + 2);

	out.push('[');

	for (i, value) in vec.iter().enumerate() {
		if i > 0 {
			out.push(',');
		}

		out.push_str(&value.to_string());
	}

	out.push(']');

	out
}

/// Case-insensitive substring pattern with `LIKE` metacharacters escaped.
pub fn like_pattern(query: &str) -> String {
	let mut out = String::with_capacity(query.len() + 2);

	out.push('%');

	for ch in query.chars() {
		if matches!(ch, '%' | '_' | '\\') {
			out.push('\\');
		}

		out.push(ch);
	}

	out.push('%');

	out
}

async fn upsert_index<'e, E>(executor: E, item: &IndexInfo, embedding: &[f32]) -> Result<()>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"\
INSERT INTO quarry_indices (
	collection_id,
	source_id,
	source_type,
	chunk_id,
	knowledge_id,
	parent_chunk_id,
	content,
	chunk_index,
	start_at,
	end_at,
	is_enabled,
	embedding
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12::text::vector)
{UPSERT_CONFLICT}"
	);

	sqlx::query(&sql)
		.bind(item.collection_id.as_str())
		.bind(item.source_id.as_str())
		.bind(item.source_type.as_i64())
		.bind(item.chunk_id.as_str())
		.bind(item.knowledge_id.as_str())
		.bind(item.parent_chunk_id.as_deref())
		.bind(item.content.as_str())
		.bind(item.chunk_index)
		.bind(item.start_at)
		.bind(item.end_at)
		.bind(item.is_enabled)
		.bind(vector_to_pg(embedding))
		.execute(executor)
		.await?;

	Ok(())
}

/// Copies the stored vector server-side so it is never round-tripped through text.
async fn copy_row<'e, E>(executor: E, source_row_id: i64, copied: &IndexInfo) -> Result<()>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"\
INSERT INTO quarry_indices (
	collection_id,
	source_id,
	source_type,
	chunk_id,
	knowledge_id,
	parent_chunk_id,
	content,
	chunk_index,
	start_at,
	end_at,
	is_enabled,
	embedding
)
SELECT
	$2,
	$3,
	source_type,
	$4,
	$5,
	$6,
	content,
	chunk_index,
	start_at,
	end_at,
	is_enabled,
	embedding
FROM quarry_indices
WHERE id = $1
{UPSERT_CONFLICT}"
	);

	sqlx::query(&sql)
		.bind(source_row_id)
		.bind(copied.collection_id.as_str())
		.bind(copied.source_id.as_str())
		.bind(copied.chunk_id.as_str())
		.bind(copied.knowledge_id.as_str())
		.bind(copied.parent_chunk_id.as_deref())
		.execute(executor)
		.await?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn like_patterns_escape_metacharacters() {
		assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
		assert_eq!(like_pattern("refund"), "%refund%");
	}

	#[test]
	fn vectors_render_as_pgvector_literals() {
		assert_eq!(vector_to_pg(&[0.5, -1.0, 2.0]), "[0.5,-1,2]");
		assert_eq!(vector_to_pg(&[]), "[]");
	}

	#[test]
	fn schema_embeds_the_vector_dimension() {
		let sql = render_schema(1_024);

		assert!(sql.contains("vector(1024)"));
		assert!(!sql.contains("<VECTOR_DIM>"));
	}
}
