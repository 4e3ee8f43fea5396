use std::collections::HashMap;

use quarry_config::Postgres;
use quarry_domain::{IndexInfo, RetrieveParams, SourceType};
use quarry_storage::{CopyIndicesRequest, IndexParams, RetrievalBackend, postgres::PgBackend};
use quarry_testkit::TestDatabase;

fn index(chunk_id: &str, content: &str) -> IndexInfo {
	IndexInfo {
		source_id: chunk_id.to_string(),
		source_type: SourceType::Chunk,
		chunk_id: chunk_id.to_string(),
		knowledge_id: "k1".to_string(),
		collection_id: "kb1".to_string(),
		parent_chunk_id: None,
		content: content.to_string(),
		chunk_index: 0,
		start_at: 0,
		end_at: 0,
		is_enabled: true,
	}
}

async fn backend(test_db: &TestDatabase) -> PgBackend {
	let cfg = Postgres { dsn: test_db.dsn().to_string(), pool_max_conns: 2, vector_dim: 3 };
	let backend = PgBackend::connect(&cfg).await.expect("Failed to connect to Postgres.");

	backend.ensure_schema().await.expect("Failed to ensure schema.");

	backend
}

#[tokio::test]
#[ignore = "Requires external Postgres with pgvector. Set QUARRY_PG_DSN to run."]
async fn postgres_backend_saves_retrieves_and_copies() {
	let Some(base_dsn) = quarry_testkit::env_dsn() else {
		eprintln!("Skipping postgres_backend_saves_retrieves_and_copies; set QUARRY_PG_DSN.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let backend = backend(&test_db).await;
	let items = vec![index("c1", "Refunds take 14 days."), index("c2", "Shipping is free.")];
	let params = IndexParams {
		embeddings: HashMap::from([
			("c1".to_string(), vec![1.0, 0.0, 0.0]),
			("c2".to_string(), vec![0.0, 1.0, 0.0]),
		]),
	};
	let report = backend.batch_save(&items, &params).await.expect("Failed to save indices.");

	assert_eq!(report.saved, 2);

	// Saving twice must not duplicate rows.
	backend.save(&items[0], &params).await.expect("Failed to upsert index.");

	let vector = RetrieveParams::vector(vec![1.0, 0.0, 0.0], vec!["kb1".to_string()], 5, 0.5);
	let hits = backend.retrieve(&vector).await.expect("Vector retrieval failed.");

	assert_eq!(hits.len(), 1);
	assert_eq!(hits[0].index.chunk_id, "c1");

	let keyword = RetrieveParams::keyword("REFUND", vec!["kb1".to_string()], 5);
	let hits = backend.retrieve(&keyword).await.expect("Keyword retrieval failed.");

	assert_eq!(hits.len(), 1);

	backend
		.batch_update_enabled_status(&HashMap::from([("c1".to_string(), false)]))
		.await
		.expect("Failed to disable chunk.");

	assert!(backend.retrieve(&keyword).await.expect("Keyword retrieval failed.").is_empty());

	let req = CopyIndicesRequest {
		source_collection_id: "kb1".to_string(),
		target_collection_id: "kb2".to_string(),
		knowledge_id_map: HashMap::from([("k1".to_string(), "k2".to_string())]),
		chunk_id_map: HashMap::from([("c2".to_string(), "c2-copy".to_string())]),
	};
	let copied = backend.copy_indices(&req).await.expect("Copy failed.");

	assert_eq!(copied.copied, 1);
	assert_eq!(copied.skipped_missing_mapping, 1);

	let count: i64 =
		sqlx::query_scalar("SELECT count(*) FROM quarry_indices WHERE collection_id = 'kb2'")
			.fetch_one(&backend.pool)
			.await
			.expect("Failed to count copied rows.");

	assert_eq!(count, 1);

	backend.pool.close().await;
	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
