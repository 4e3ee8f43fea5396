use crate::model::{MatchType, SearchResult};

/// Results at or above this count clip the range to the 5th and 95th percentiles.
pub const PERCENTILE_CLIP_MIN_RESULTS: usize = 10;

/// Rescales keyword scores into `[0, 1]` with min-max normalization.
///
/// Other match types are left untouched. A single keyword result, or a set without variance,
/// scores 1.0. Larger sets clip outliers to the 5th/95th percentile before scaling.
pub fn normalize_keyword_scores(results: &mut [SearchResult]) {
	let mut keyword = results
		.iter_mut()
		.filter(|result| result.match_type == MatchType::Keyword)
		.collect::<Vec<_>>();

	match keyword.len() {
		0 => return,
		1 => {
			keyword[0].score = 1.0;

			return;
		},
		_ => {},
	}

	let mut min = f32::INFINITY;
	let mut max = f32::NEG_INFINITY;

	for result in &keyword {
		min = min.min(result.score);
		max = max.max(result.score);
	}

	if max <= min {
		keyword.iter_mut().for_each(|result| result.score = 1.0);

		return;
	}

	let (range_min, range_max) = if keyword.len() >= PERCENTILE_CLIP_MIN_RESULTS {
		let mut sorted = keyword.iter().map(|result| result.score).collect::<Vec<_>>();

		sorted.sort_by(f32::total_cmp);

		let low = sorted.len() * 5 / 100;
		let high = (sorted.len() * 95 / 100).min(sorted.len() - 1);

		(sorted[low], sorted[high])
	} else {
		(min, max)
	};

	if range_max <= range_min {
		keyword.iter_mut().for_each(|result| result.score = 1.0);

		return;
	}

	let width = range_max - range_min;

	for result in keyword.iter_mut() {
		let clamped = result.score.clamp(range_min, range_max);

		result.score = ((clamped - range_min) / width).clamp(0.0, 1.0);
	}
}
