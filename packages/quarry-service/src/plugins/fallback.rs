use std::sync::Arc;

use quarry_config::{Fallback, LlmProviderConfig};
use quarry_providers::ChatMessage;

use crate::{
	BoxFuture, ChatProvider, Next, Plugin, PluginResult, RequestContext, ResponseType, Stage,
	StreamResponse,
};

/// Answers a request whose retrieval found nothing.
///
/// The `model` strategy asks the chat provider with `fallback.prompt` and degrades to the fixed
/// response when that call fails, so this stage never fails.
pub struct FallbackResponder {
	chat: Arc<dyn ChatProvider>,
	cfg: LlmProviderConfig,
	fallback: Fallback,
}
impl FallbackResponder {
	pub fn new(chat: Arc<dyn ChatProvider>, cfg: LlmProviderConfig, fallback: Fallback) -> Self {
		Self { chat, cfg, fallback }
	}

	async fn answer(&self, ctx: &RequestContext) -> String {
		if self.fallback.strategy != "model" {
			return self.fallback.response.clone();
		}

		let Some(template) = self.fallback.prompt.as_deref() else {
			return self.fallback.response.clone();
		};
		let messages = [ChatMessage::user(template.replace("{{query}}", &ctx.query))];

		match self.chat.complete(&self.cfg, &messages).await {
			Ok(text) if !text.trim().is_empty() => text,
			Ok(_) => self.fallback.response.clone(),
			Err(err) => {
				tracing::warn!(
					request_id = %ctx.request_id,
					error = %err,
					"Model fallback failed; sending the fixed response."
				);

				self.fallback.response.clone()
			},
		}
	}
}
impl Plugin for FallbackResponder {
	fn name(&self) -> &'static str {
		"fallback"
	}

	fn stages(&self) -> &'static [Stage] {
		&[Stage::Fallback]
	}

	fn on_stage<'a>(
		&'a self,
		_: Stage,
		ctx: &'a mut RequestContext,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			let answer = self.answer(ctx).await;
			let record = StreamResponse::new(ctx.answer_id(), ResponseType::Answer, &answer, true);

			ctx.emit_response(record).await;

			ctx.chat_response = answer;

			next.run(ctx).await
		})
	}
}
