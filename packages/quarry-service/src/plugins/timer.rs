use std::time::Instant;

use serde_json::json;

use crate::{BoxFuture, Event, EventType, Next, Plugin, PluginResult, RequestContext, Stage};

/// Times the rest of each stage's chain and emits a `stage_timing` telemetry event.
pub struct StageTimer;
impl Plugin for StageTimer {
	fn name(&self) -> &'static str {
		"stage_timer"
	}

	fn stages(&self) -> &'static [Stage] {
		&Stage::ALL
	}

	fn on_stage<'a>(
		&'a self,
		stage: Stage,
		ctx: &'a mut RequestContext,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			let started = Instant::now();
			let result = next.run(ctx).await;
			let elapsed_ms = started.elapsed().as_millis() as u64;
			let event = Event::new(
				EventType::StageTiming,
				json!({ "stage": stage.as_str(), "elapsed_ms": elapsed_ms, "ok": result.is_ok() }),
			);

			ctx.emit_telemetry(event).await;

			result
		})
	}
}
