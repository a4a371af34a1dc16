//! Pure exponential-moving-average utilities (spec.md §2.1). No I/O, no
//! shared state — every function is `(inputs) -> output`.

/// Fold one new sample into an existing EMA. The first sample for a
/// series has no prior average to blend with, so callers pass `None`
/// for `current` and get the sample back unchanged (spec.md §8 "EMA
/// first-sample law").
pub fn update_ema(current: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match current {
        None => sample,
        Some(prev) => alpha * sample + (1.0 - alpha) * prev,
    }
}

/// Confidence grows linearly with sample count up to `threshold`, then
/// saturates at 1.0 (spec.md §4.4).
pub fn confidence(sample_count: u64, threshold: u64) -> f64 {
    if threshold == 0 {
        return 1.0;
    }
    (sample_count as f64 / threshold as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_becomes_the_ema() {
        assert_eq!(update_ema(None, 1000.0, 0.3), 1000.0);
    }

    #[test]
    fn subsequent_samples_blend_toward_the_new_value() {
        let ema = update_ema(Some(5000.0), 1000.0, 0.3);
        assert!((ema - 3800.0).abs() < 1e-9);
    }

    #[test]
    fn ten_samples_converge_toward_the_sampled_value() {
        let mut ema = None;
        for _ in 0..10 {
            ema = Some(update_ema(ema, 1000.0, 0.3));
        }
        let ema = ema.unwrap();
        assert!((ema - 1000.0).abs() < 500.0, "ema={ema} should be within 500ms of 1000");
    }

    #[test]
    fn confidence_saturates_at_one() {
        assert_eq!(confidence(0, 100), 0.0);
        assert_eq!(confidence(10, 100), 0.10);
        assert_eq!(confidence(100, 100), 1.0);
        assert_eq!(confidence(500, 100), 1.0);
    }
}
