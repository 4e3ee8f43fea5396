use std::collections::HashMap;

use quarry_config::Qdrant;
use quarry_domain::{IndexInfo, RetrieveParams, SourceType};
use quarry_storage::{IndexParams, RetrievalBackend, qdrant::QdrantBackend};
use quarry_testkit::TestCollection;

fn index(chunk_id: &str, content: &str) -> IndexInfo {
	IndexInfo {
		source_id: chunk_id.to_string(),
		source_type: SourceType::Chunk,
		chunk_id: chunk_id.to_string(),
		knowledge_id: "k1".to_string(),
		collection_id: "kb1".to_string(),
		parent_chunk_id: Some("p1".to_string()),
		content: content.to_string(),
		chunk_index: 1,
		start_at: 0,
		end_at: content.len() as i32,
		is_enabled: true,
	}
}

#[tokio::test]
#[ignore = "Requires external Qdrant. Set QUARRY_QDRANT_URL to run."]
async fn qdrant_backend_saves_and_retrieves() {
	let Some(url) = quarry_testkit::env_qdrant_url() else {
		eprintln!("Skipping qdrant_backend_saves_and_retrieves; set QUARRY_QDRANT_URL.");

		return;
	};
	let collection = TestCollection::new(&url, "quarry_indices");
	let cfg = Qdrant { url: url.clone(), collection: collection.name.clone(), vector_dim: 3 };
	let backend = QdrantBackend::new(&cfg).expect("Failed to build Qdrant client.");

	backend.ensure_collection().await.expect("Failed to create collection.");

	let items = vec![index("c1", "refund window"), index("c2", "shipping costs")];
	let params = IndexParams {
		embeddings: HashMap::from([
			("c1".to_string(), vec![1.0, 0.0, 0.0]),
			("c2".to_string(), vec![0.0, 1.0, 0.0]),
		]),
	};

	backend.batch_save(&items, &params).await.expect("Failed to save indices.");
	backend.batch_save(&items, &params).await.expect("Failed to re-save indices.");

	let vector = RetrieveParams::vector(vec![1.0, 0.0, 0.0], vec!["kb1".to_string()], 5, 0.5);
	let hits = backend.retrieve(&vector).await.expect("Vector retrieval failed.");

	assert_eq!(hits.len(), 1);
	assert_eq!(hits[0].index, items[0]);

	backend.delete_by_chunk_ids(&["c1".to_string()]).await.expect("Delete failed.");

	assert!(backend.retrieve(&vector).await.expect("Vector retrieval failed.").is_empty());

	collection.cleanup().await.expect("Failed to delete test collection.");
}
