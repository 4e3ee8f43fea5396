use std::{
	env, fs,
	path::PathBuf,
	sync::atomic::{AtomicU64, Ordering},
	time::{SystemTime, UNIX_EPOCH},
};

use toml::Value;

use quarry_config::{Config, Error};

const SAMPLE_CONFIG_TEMPLATE_TOML: &str = include_str!("fixtures/sample_config.template.toml");

fn sample_toml_with(edit: impl FnOnce(&mut toml::Table)) -> String {
	let mut value: Value =
		toml::from_str(SAMPLE_CONFIG_TEMPLATE_TOML).expect("Failed to parse template config.");
	let root = value.as_table_mut().expect("Template config must be a table.");

	edit(root);

	toml::to_string(&value).expect("Failed to render template config.")
}

fn section<'a>(root: &'a mut toml::Table, name: &str) -> &'a mut toml::Table {
	root.get_mut(name)
		.and_then(Value::as_table_mut)
		.unwrap_or_else(|| panic!("Template config must include [{name}]."))
}

fn write_temp_config(payload: String) -> PathBuf {
	static COUNTER: AtomicU64 = AtomicU64::new(0);

	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("System time must be valid.")
		.as_nanos();
	let ordinal = COUNTER.fetch_add(1, Ordering::SeqCst);
	let pid = std::process::id();
	let mut path = env::temp_dir();

	path.push(format!("quarry_config_test_{nanos}_{pid}_{ordinal}.toml"));

	fs::write(&path, payload).expect("Failed to write test config.");

	path
}

fn load_payload(payload: String) -> quarry_config::Result<Config> {
	let path = write_temp_config(payload);
	let result = quarry_config::load(&path);

	fs::remove_file(&path).expect("Failed to remove test config.");

	result
}

fn base_config() -> Config {
	load_payload(SAMPLE_CONFIG_TEMPLATE_TOML.to_string()).expect("Failed to load base config.")
}

#[test]
fn sample_config_loads_with_default_pipelines() {
	let cfg = base_config();

	assert_eq!(cfg.storage.backend, "qdrant");
	assert_eq!(cfg.pipelines.len(), 4);

	let rag_stream = cfg.pipelines.get("rag_stream").expect("Missing rag_stream pipeline.");

	assert_eq!(rag_stream.stages.first().map(String::as_str), Some("rewrite_query"));
	assert_eq!(rag_stream.stages.last().map(String::as_str), Some("stream_filter"));
	assert_eq!(rag_stream.fallback.as_deref(), Some("fallback"));
	assert!(cfg.pipelines.get("chat").expect("Missing chat pipeline.").fallback.is_none());
}

#[test]
fn explicit_pipelines_replace_the_defaults() {
	let payload = sample_toml_with(|root| {
		let mut pipelines = toml::Table::new();
		let mut custom = toml::Table::new();

		custom.insert(
			"stages".to_string(),
			Value::Array(vec![
				Value::String("hybrid_search".to_string()),
				Value::String("complete".to_string()),
			]),
		);
		pipelines.insert("lean".to_string(), Value::Table(custom));
		root.insert("pipelines".to_string(), Value::Table(pipelines));
	});
	let cfg = load_payload(payload).expect("Expected custom pipelines to load.");

	assert_eq!(cfg.pipelines.len(), 1);
	assert!(cfg.pipelines.contains_key("lean"));
}

#[test]
fn blank_optional_strings_are_normalized_away() {
	let payload = sample_toml_with(|root| {
		section(root, "prompt")
			.insert("no_match_prefix".to_string(), Value::String("  ".to_string()));
	});
	let cfg = load_payload(payload).expect("Expected config to load.");

	assert!(cfg.prompt.no_match_prefix.is_none());
}

#[test]
fn unknown_storage_backend_is_rejected() {
	let payload = sample_toml_with(|root| {
		section(root, "storage").insert("backend".to_string(), Value::String("redis".to_string()));
	});
	let err = load_payload(payload).expect_err("Expected storage backend validation error.");

	assert!(
		err.to_string().contains("storage.backend must be one of qdrant, postgres, or memory."),
		"Unexpected error: {err}"
	);
}

#[test]
fn embedding_dimensions_must_match_backend_vector_dim() {
	let mut cfg = base_config();

	cfg.providers.embedding.dimensions = 768;

	let err = quarry_config::validate(&cfg).expect_err("Expected dimension mismatch error.");

	assert!(
		err.to_string()
			.contains("providers.embedding.dimensions must match storage.qdrant.vector_dim."),
		"Unexpected error: {err}"
	);
}

#[test]
fn memory_backend_needs_no_storage_sections() {
	let mut cfg = base_config();

	cfg.storage.backend = "memory".to_string();
	cfg.storage.qdrant = None;
	cfg.storage.postgres = None;

	assert!(quarry_config::validate(&cfg).is_ok());
}

#[test]
fn thresholds_must_stay_in_unit_range() {
	let mut cfg = base_config();

	cfg.retrieval.keyword_threshold = 1.5;

	let err = quarry_config::validate(&cfg).expect_err("Expected threshold validation error.");

	assert!(
		err.to_string().contains("retrieval.keyword_threshold must be in the range 0.0-1.0."),
		"Unexpected error: {err}"
	);

	cfg = base_config();
	cfg.retrieval.vector_threshold = f32::NAN;

	let err = quarry_config::validate(&cfg).expect_err("Expected finite validation error.");

	assert!(matches!(err, Error::Validation { .. }));
}

#[test]
fn top_k_must_be_positive() {
	let mut cfg = base_config();

	cfg.retrieval.embedding_top_k = 0;

	let err = quarry_config::validate(&cfg).expect_err("Expected top-k validation error.");

	assert!(
		err.to_string().contains("retrieval.embedding_top_k must be greater than zero."),
		"Unexpected error: {err}"
	);
}

#[test]
fn model_fallback_requires_a_prompt() {
	let mut cfg = base_config();

	cfg.fallback.strategy = "model".to_string();
	cfg.fallback.prompt = None;

	let err = quarry_config::validate(&cfg).expect_err("Expected fallback prompt error.");

	assert!(
		err.to_string().contains("fallback.prompt is required when fallback.strategy is model."),
		"Unexpected error: {err}"
	);
}

#[test]
fn provider_api_keys_must_be_present() {
	let mut cfg = base_config();

	cfg.providers.chat.api_key = " ".to_string();

	let err = quarry_config::validate(&cfg).expect_err("Expected api key validation error.");

	assert_eq!(err.to_string(), "Provider chat api_key must be non-empty.");
}

#[test]
fn empty_pipeline_stage_list_is_rejected() {
	let mut cfg = base_config();

	if let Some(pipeline) = cfg.pipelines.get_mut("rag") {
		pipeline.stages.clear();
	}

	let err = quarry_config::validate(&cfg).expect_err("Expected pipeline validation error.");

	assert!(matches!(&err, Error::Pipeline { name, .. } if name == "rag"));
	assert!(
		err.to_string().contains("pipelines.rag.stages must be non-empty."),
		"Unexpected error: {err}"
	);
}

#[test]
fn missing_file_reports_read_error() {
	let err = quarry_config::load(&PathBuf::from("/nonexistent/quarry.toml"))
		.expect_err("Expected read error.");

	assert!(matches!(err, Error::ReadConfig { .. }));
}
