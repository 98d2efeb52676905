//! Composite score calculator.
//!
//! `score = Σ(sᵢ·cᵢ) / Σcᵢ`, `confidence = Σcᵢ / n`. Inputs are sorted with a
//! total order before summing so the result does not depend on the order in
//! which model calls finished.

/// One contributing model score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInput {
    pub score: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Composite {
    pub score: f64,
    pub confidence: f64,
}

/// Aggregate a run's scores. `None` when there is nothing to weight by:
/// no inputs, or every confidence is zero.
pub fn composite_score(inputs: &[ScoreInput]) -> Option<Composite> {
    if inputs.is_empty() {
        return None;
    }

    let mut sorted = inputs.to_vec();
    sorted.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then(a.confidence.total_cmp(&b.confidence))
    });

    let weight: f64 = sorted.iter().map(|i| i.confidence).sum();
    if !(weight > 0.0) || !weight.is_finite() {
        return None;
    }
    let weighted: f64 = sorted.iter().map(|i| i.score * i.confidence).sum();

    Some(Composite {
        score: (weighted / weight).clamp(-1.0, 1.0),
        confidence: (weight / sorted.len() as f64).clamp(0.0, 1.0),
    })
}
