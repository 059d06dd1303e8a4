//! Pure mappings from raw measurements to bounded reward terms.

use evoflow_core::config::{FitnessWeights, SaturatingCurve};

/// Map an unbounded, non-negative measurement (seconds, dollars) to
/// `[0, 100]`, where smaller is better.
pub fn saturate(curve: &SaturatingCurve, x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    let x = x.max(0.0);
    let value = match *curve {
        SaturatingCurve::CappedLinear {
            baseline,
            threshold,
        } => {
            if x <= baseline {
                100.0
            } else if x >= threshold || threshold <= baseline {
                0.0
            } else {
                100.0 * (threshold - x) / (threshold - baseline)
            }
        }
        SaturatingCurve::Logistic {
            midpoint,
            steepness,
        } => 100.0 / (1.0 + (steepness * (x - midpoint)).exp()),
    };
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Combine the three terms into a score. Efficiency terms are scaled by
/// `accuracy / 100`, so a wrong answer earns nothing for being fast or cheap.
pub fn combine(accuracy: f64, time_term: f64, cost_term: f64, weights: &FitnessWeights) -> u32 {
    let accuracy = if accuracy.is_nan() {
        0.0
    } else {
        accuracy.clamp(0.0, 100.0)
    };
    let gate = accuracy / 100.0;
    let raw = weights.accuracy * accuracy + gate * (weights.time * time_term + weights.cost * cost_term);
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as u32
}
