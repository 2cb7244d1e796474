// THEORY:
// The `severity` module turns the model's continuous regression score into a
// discrete clinical stage of diabetic retinopathy.
//
// Key architectural principles:
// 1.  **Right-Open Binning**: The score is compared against four fixed boundaries.
//     The stage is the number of boundaries the score has reached, so a score sitting
//     exactly on a boundary belongs to the more severe stage. Scores outside the
//     nominal [0, 4] range are tolerated and simply land in the first or last stage.
// 2.  **Auditable Table**: Stage metadata lives in one immutable, ordered table
//     indexed by stage. There is no branching on stages anywhere else.
// 3.  **Narrow-Band Confidence**: Confidence grows with the score's proximity to the
//     center of its stage and is clamped to [72.0, 99.4]. It is a presentation
//     heuristic, not a calibrated probability, and the constants are kept exactly
//     as published so results stay comparable between deployments.

use crate::error::SeverityError;
use serde::Serialize;
use tracing::debug;

/// Stage boundaries on the regression scale.
pub const STAGE_BOUNDARIES: [f64; 4] = [0.5, 1.5, 2.5, 3.5];
pub const MIN_CONFIDENCE: f64 = 72.0;
pub const MAX_CONFIDENCE: f64 = 99.4;
pub const CONFIDENCE_SCALE: f64 = 25.0;
pub const CONFIDENCE_OFFSET: f64 = 74.5;

/// Static clinical metadata for one severity stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub label: &'static str,
    pub description: &'static str,
    pub regions: &'static [&'static str],
}

/// The five clinical stages, from healthy to most severe.
pub const STAGES: [Stage; 5] = [
    Stage {
        label: "No Diabetic Retinopathy",
        description: "Normal retina. No clinical signs of disease detected.",
        regions: &[],
    },
    Stage {
        label: "Mild Non-Proliferative DR",
        description: "Early stage. Small microaneurysms (red dots) are present.",
        regions: &["Retinal Vessels"],
    },
    Stage {
        label: "Moderate Non-Proliferative DR",
        description: "Intermediate stage. Multiple microaneurysms and hemorrhages.",
        regions: &["Macula", "Retinal Vessels"],
    },
    Stage {
        label: "Severe Non-Proliferative DR",
        description: "Advanced stage. Extensive hemorrhages and venous beading.",
        regions: &["Optic Disc", "Macula", "Vessels"],
    },
    Stage {
        label: "Proliferative Diabetic Retinopathy",
        description: "Critical stage. New abnormal blood vessel growth detected.",
        regions: &["Optic Nerve Head", "Macula", "Vessels", "Vitreous"],
    },
];

/// The graded outcome for one regression score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeverityRecord {
    /// Stage index in `0..=4`.
    pub stage: usize,
    pub label: &'static str,
    /// Percentage in `[72.0, 99.4]`, rounded to one decimal place.
    pub confidence: f64,
    pub regions: Vec<&'static str>,
    pub description: &'static str,
}

/// Maps a regression score to its stage index.
pub fn stage_index(score: f64) -> usize {
    let reached = STAGE_BOUNDARIES
        .iter()
        .filter(|&&boundary| score >= boundary)
        .count();
    reached.min(STAGES.len() - 1)
}

/// Confidence heuristic: `clamp((1 - |score - stage|) * 25 + 74.5, 72.0, 99.4)`, unrounded.
pub fn confidence(score: f64, stage: usize) -> f64 {
    let proximity = 1.0 - (score - stage as f64).abs();
    (proximity * CONFIDENCE_SCALE + CONFIDENCE_OFFSET).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

/// Rounds half to even (banker's rounding).
fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round_ties_even() / factor
}

/// Grades a regression score into a clinical severity record.
pub fn classify(score: f64) -> Result<SeverityRecord, SeverityError> {
    if !score.is_finite() {
        return Err(SeverityError::InvalidScore { score });
    }

    let stage = stage_index(score);
    let entry = &STAGES[stage];
    let confidence = round_to(confidence(score, stage), 1);
    debug!(score, stage, confidence, "graded regression score");

    Ok(SeverityRecord {
        stage,
        label: entry.label,
        confidence,
        regions: entry.regions.to_vec(),
        description: entry.description,
    })
}

/// Rounds a raw regression score for reporting.
pub fn rounded_score(score: f64) -> f64 {
    round_to(score, 2)
}
