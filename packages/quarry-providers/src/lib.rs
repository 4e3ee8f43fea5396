//! HTTP clients for the model and search vendors the pipeline calls out to.
//!
//! All endpoints speak the OpenAI-compatible JSON shapes; vendor differences live in
//! `default_headers` and the configured `path`.

pub mod chat;
pub mod embedding;
pub mod rerank;
pub mod web_search;

mod error;

pub use chat::ChatMessage;
pub use error::{Error, Result};

use std::time::Duration;

use reqwest::{
	Client,
	header::{AUTHORIZATION, HeaderMap, HeaderName},
};
use serde_json::{Map, Value};

pub fn auth_headers(api_key: &str, default_headers: &Map<String, Value>) -> Result<HeaderMap> {
	let mut headers = HeaderMap::new();

	headers.insert(AUTHORIZATION, format!("Bearer {api_key}").parse()?);

	for (key, value) in default_headers {
		let Some(raw) = value.as_str() else {
			return Err(Error::InvalidConfig {
				message: format!("Default header {key} must be a string."),
			});
		};

		headers.insert(HeaderName::from_bytes(key.as_bytes())?, raw.parse()?);
	}

	Ok(headers)
}

pub(crate) fn client(timeout_ms: u64) -> Result<Client> {
	Ok(Client::builder().timeout(Duration::from_millis(timeout_ms)).build()?)
}

pub(crate) fn endpoint(api_base: &str, path: &str) -> String {
	format!("{}/{}", api_base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn endpoint_joins_without_double_slashes() {
		assert_eq!(endpoint("http://h/v1/", "/embeddings"), "http://h/v1/embeddings");
		assert_eq!(endpoint("http://h/v1", "embeddings"), "http://h/v1/embeddings");
	}

	#[test]
	fn non_string_default_headers_are_rejected() {
		let mut headers = Map::new();

		headers.insert("x-retries".to_string(), Value::from(3));

		assert!(matches!(auth_headers("k", &headers), Err(Error::InvalidConfig { .. })));
	}
}
