mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Config, DEFAULT_PIPELINES, EmbeddingProviderConfig, Fallback, LlmProviderConfig,
	PipelineDefinition, Postgres, Prompt, ProviderConfig, Providers, Qdrant, Retrieval, Service,
	Storage, default_pipelines,
};

use std::{fs, path::Path};

pub const STORAGE_BACKENDS: [&str; 3] = ["qdrant", "postgres", "memory"];
pub const FALLBACK_STRATEGIES: [&str; 2] = ["fixed", "model"];

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;
	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.http_bind.trim().is_empty() {
		return Err(Error::Validation {
			message: "service.http_bind must be non-empty.".to_string(),
		});
	}

	validate_storage(cfg)?;

	for (label, key) in [
		("embedding", &cfg.providers.embedding.api_key),
		("rerank", &cfg.providers.rerank.api_key),
		("chat", &cfg.providers.chat.api_key),
	] {
		if key.trim().is_empty() {
			return Err(Error::Validation {
				message: format!("Provider {label} api_key must be non-empty."),
			});
		}
	}

	if let Some(web_search) = cfg.providers.web_search.as_ref()
		&& web_search.api_base.trim().is_empty()
	{
		return Err(Error::Validation {
			message: "providers.web_search.api_base must be non-empty.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions == 0 {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must be greater than zero.".to_string(),
		});
	}

	validate_retrieval(cfg)?;

	if cfg.prompt.system.trim().is_empty() {
		return Err(Error::Validation { message: "prompt.system must be non-empty.".to_string() });
	}
	if !cfg.prompt.context_template.contains("{{contexts}}") {
		return Err(Error::Validation {
			message: "prompt.context_template must reference {{contexts}}.".to_string(),
		});
	}
	if !FALLBACK_STRATEGIES.contains(&cfg.fallback.strategy.as_str()) {
		return Err(Error::Validation {
			message: "fallback.strategy must be one of fixed or model.".to_string(),
		});
	}
	if cfg.fallback.response.trim().is_empty() {
		return Err(Error::Validation {
			message: "fallback.response must be non-empty.".to_string(),
		});
	}
	if cfg.fallback.strategy == "model" && cfg.fallback.prompt.is_none() {
		return Err(Error::Validation {
			message: "fallback.prompt is required when fallback.strategy is model.".to_string(),
		});
	}

	for (name, pipeline) in &cfg.pipelines {
		if pipeline.stages.is_empty() {
			return Err(Error::Pipeline {
				name: name.clone(),
				message: format!("pipelines.{name}.stages must be non-empty."),
			});
		}
		if pipeline.stages.iter().any(|stage| stage.trim().is_empty()) {
			return Err(Error::Pipeline {
				name: name.clone(),
				message: format!("pipelines.{name}.stages must not contain blank names."),
			});
		}
	}

	Ok(())
}

fn validate_storage(cfg: &Config) -> Result<()> {
	let backend = cfg.storage.backend.as_str();

	if !STORAGE_BACKENDS.contains(&backend) {
		return Err(Error::Validation {
			message: "storage.backend must be one of qdrant, postgres, or memory.".to_string(),
		});
	}

	let vector_dim = match backend {
		"qdrant" => {
			let Some(qdrant) = cfg.storage.qdrant.as_ref() else {
				return Err(Error::Validation {
					message: "storage.qdrant is required when storage.backend is qdrant."
						.to_string(),
				});
			};

			if qdrant.collection.trim().is_empty() {
				return Err(Error::Validation {
					message: "storage.qdrant.collection must be non-empty.".to_string(),
				});
			}

			Some(qdrant.vector_dim)
		},
		"postgres" => {
			let Some(postgres) = cfg.storage.postgres.as_ref() else {
				return Err(Error::Validation {
					message: "storage.postgres is required when storage.backend is postgres."
						.to_string(),
				});
			};

			if postgres.pool_max_conns == 0 {
				return Err(Error::Validation {
					message: "storage.postgres.pool_max_conns must be greater than zero."
						.to_string(),
				});
			}

			Some(postgres.vector_dim)
		},
		_ => None,
	};

	if let Some(vector_dim) = vector_dim
		&& vector_dim != cfg.providers.embedding.dimensions
	{
		return Err(Error::Validation {
			message: format!(
				"providers.embedding.dimensions must match storage.{backend}.vector_dim."
			),
		});
	}

	Ok(())
}

fn validate_retrieval(cfg: &Config) -> Result<()> {
	let retrieval = &cfg.retrieval;

	for (label, value) in [
		("retrieval.vector_threshold", retrieval.vector_threshold),
		("retrieval.keyword_threshold", retrieval.keyword_threshold),
		("retrieval.rerank_threshold", retrieval.rerank_threshold),
	] {
		if !value.is_finite() {
			return Err(Error::Validation { message: format!("{label} must be a finite number.") });
		}
		if !(0.0..=1.0).contains(&value) {
			return Err(Error::Validation {
				message: format!("{label} must be in the range 0.0-1.0."),
			});
		}
	}

	if retrieval.embedding_top_k == 0 {
		return Err(Error::Validation {
			message: "retrieval.embedding_top_k must be greater than zero.".to_string(),
		});
	}
	if retrieval.rerank_top_k == 0 {
		return Err(Error::Validation {
			message: "retrieval.rerank_top_k must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	if cfg.prompt.no_match_prefix.as_deref().map(|prefix| prefix.trim().is_empty()).unwrap_or(false)
	{
		cfg.prompt.no_match_prefix = None;
	}
	if cfg.fallback.prompt.as_deref().map(|prompt| prompt.trim().is_empty()).unwrap_or(false) {
		cfg.fallback.prompt = None;
	}
	if cfg
		.providers
		.web_search
		.as_ref()
		.map(|web_search| web_search.api_key.trim().is_empty())
		.unwrap_or(false)
	{
		cfg.providers.web_search = None;
	}
	if cfg.pipelines.is_empty() {
		cfg.pipelines = default_pipelines();
	}

	cfg.storage.backend = cfg.storage.backend.trim().to_ascii_lowercase();
	cfg.fallback.strategy = cfg.fallback.strategy.trim().to_ascii_lowercase();
}
