use serde_json::Value;

use quarry_domain::{WebSearchConfig, WebSearchResult};

use crate::{Error, Result};

/// Queries the configured search API. A non-empty tenant API key takes precedence over the
/// service key. Results from blacklisted hosts are dropped.
pub async fn search(
	cfg: &quarry_config::ProviderConfig,
	tenant: &WebSearchConfig,
	query: &str,
) -> Result<Vec<WebSearchResult>> {
	let api_key = if tenant.api_key.trim().is_empty() { &cfg.api_key } else { &tenant.api_key };
	let body = serde_json::json!({
		"query": query,
		"max_results": tenant.max_results,
		"include_date": tenant.include_date,
	});
	let res = crate::client(cfg.timeout_ms)?
		.post(crate::endpoint(&cfg.api_base, &cfg.path))
		.headers(crate::auth_headers(api_key, &cfg.default_headers)?)
		.json(&body)
		.send()
		.await?;
	let json: Value = res.error_for_status()?.json().await?;
	let mut results = parse_search_response(json)?;
	let before = results.len();

	results.retain(|result| !is_blacklisted(&result.url, &tenant.blacklist));
	results.truncate(tenant.max_results);

	tracing::debug!(
		provider = %tenant.provider,
		returned = before,
		kept = results.len(),
		"Web search completed."
	);

	Ok(results)
}

fn parse_search_response(json: Value) -> Result<Vec<WebSearchResult>> {
	let items = json
		.get("results")
		.cloned()
		.ok_or_else(|| Error::response("Web search response is missing results array."))?;
	let results: Vec<WebSearchResult> = serde_json::from_value(items)?;

	Ok(results.into_iter().filter(|result| !result.url.trim().is_empty()).collect())
}

/// Matches a host or any of its subdomains, case-insensitively.
pub fn is_blacklisted(url: &str, blacklist: &[String]) -> bool {
	let Some(host) = host_of(url) else {
		return false;
	};

	blacklist.iter().map(|entry| entry.trim().to_ascii_lowercase()).any(|entry| {
		!entry.is_empty() && (host == entry || host.ends_with(&format!(".{entry}")))
	})
}

fn host_of(url: &str) -> Option<String> {
	let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
	let authority = rest.split(['/', '?', '#']).next()?;
	let host = authority.rsplit('@').next()?.split(':').next()?;

	(!host.is_empty()).then(|| host.to_ascii_lowercase())
}
