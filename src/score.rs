use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::models::{Components, LetterGrade};
use crate::policy::Weights;

pub const MAX_SCORE: f64 = 20.0;

/// Lower bounds, inclusive. Anything under the last floor is an F.
const LETTER_BANDS: [(f64, LetterGrade); 5] = [
    (16.0, LetterGrade::A),
    (14.0, LetterGrade::B),
    (12.0, LetterGrade::C),
    (10.0, LetterGrade::D),
    (8.0, LetterGrade::E),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreOutcome {
    pub final_score: Option<f64>,
    pub letter: Option<LetterGrade>,
}

pub fn evaluate(components: &Components, weights: &Weights) -> Result<ScoreOutcome> {
    let final_score = compute_final_score(components, weights)?;
    Ok(ScoreOutcome {
        final_score,
        letter: final_score.map(letter_grade),
    })
}

/// Weighted mean over the components that are present, with their weights
/// rescaled to sum to one. Absent components are excluded, not zeroed.
pub fn compute_final_score(components: &Components, weights: &Weights) -> Result<Option<f64>> {
    validate_components(components)?;
    weights.validate()?;

    let present: Vec<(f64, f64)> = [
        (components.continuous, weights.continuous),
        (components.practical, weights.practical),
        (components.exam, weights.exam),
    ]
    .into_iter()
    .filter_map(|(score, weight)| score.map(|value| (value, weight)))
    .collect();

    if present.is_empty() {
        return Ok(None);
    }

    let weight_total: f64 = present.iter().map(|(_, weight)| weight).sum();
    let raw = if weight_total > 0.0 {
        present
            .iter()
            .map(|(score, weight)| score * (weight / weight_total))
            .sum::<f64>()
    } else {
        // every present component is unweighted
        present.iter().map(|(score, _)| score).sum::<f64>() / present.len() as f64
    };

    Ok(Some(round_half_up(raw)))
}

pub fn letter_grade(final_score: f64) -> LetterGrade {
    LETTER_BANDS
        .iter()
        .find(|(floor, _)| final_score >= *floor)
        .map(|(_, letter)| *letter)
        .unwrap_or(LetterGrade::F)
}

/// Two decimals, halves away from zero. The nudge absorbs binary
/// representation error so 12.345 rounds to 12.35 rather than 12.34.
pub fn round_half_up(value: f64) -> f64 {
    let scaled = value * 100.0;
    let nudged = scaled + scaled.signum() * 1e-9 * scaled.abs().max(1.0);
    nudged.round() / 100.0
}

pub fn validate_score(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=MAX_SCORE).contains(&value) {
        return Err(EngineError::invalid(format!(
            "{name} score must be between 0 and {MAX_SCORE}, got {value}"
        )));
    }
    Ok(())
}

pub fn validate_components(components: &Components) -> Result<()> {
    for (name, value) in [
        ("continuous", components.continuous),
        ("practical", components.practical),
        ("exam", components.exam),
    ] {
        if let Some(value) = value {
            validate_score(name, value)?;
        }
    }
    Ok(())
}
