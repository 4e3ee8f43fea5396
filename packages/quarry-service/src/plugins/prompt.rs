use quarry_domain::SearchResult;

use crate::{
	BoxFuture, Next, Plugin, PluginResult, RequestContext, ResponseType, Stage, StreamResponse,
};

/// Renders the merged passages into the user message and publishes them as references.
pub struct BuildPrompt {
	template: String,
}
impl BuildPrompt {
	pub fn new(template: String) -> Self {
		Self { template }
	}
}
impl Plugin for BuildPrompt {
	fn name(&self) -> &'static str {
		"build_prompt"
	}

	fn stages(&self) -> &'static [Stage] {
		&[Stage::BuildPrompt]
	}

	fn on_stage<'a>(
		&'a self,
		_: Stage,
		ctx: &'a mut RequestContext,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			ctx.user_content =
				render_prompt(&self.template, ctx.search_query(), &ctx.merge_results);

			let references = StreamResponse::new(
				format!("{}:references", ctx.request_id),
				ResponseType::References,
				"",
				true,
			)
			.with_references(ctx.merge_results.clone());

			ctx.emit_response(references).await;

			next.run(ctx).await
		})
	}
}

/// Numbered passages, one block each, in the given order.
pub fn render_contexts(results: &[SearchResult]) -> String {
	results
		.iter()
		.enumerate()
		.map(|(i, result)| format!("[{}] {}", i + 1, result.content.trim()))
		.collect::<Vec<_>>()
		.join("\n\n")
}

pub fn render_prompt(template: &str, query: &str, results: &[SearchResult]) -> String {
	template.replace("{{contexts}}", &render_contexts(results)).replace("{{query}}", query)
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use quarry_domain::MatchType;

	use super::*;

	#[test]
	fn contexts_are_numbered_in_order() {
		let result = |content: &str| SearchResult {
			id: content.to_string(),
			parent_chunk_id: None,
			collection_id: "kb".to_string(),
			knowledge_id: "doc".to_string(),
			knowledge_title: String::new(),
			content: format!(" {content}\n"),
			chunk_index: 0,
			start_at: 0,
			end_at: 0,
			score: 1.0,
			match_type: MatchType::Keyword,
			metadata: HashMap::new(),
		};
		let rendered = render_prompt(
			"Q: {{query}}\n{{contexts}}",
			"refunds?",
			&[result("Refunds take 30 days."), result("Gifts are excluded.")],
		);

		assert_eq!(rendered, "Q: refunds?\n[1] Refunds take 30 days.\n\n[2] Gifts are excluded.");
	}
}
