//! Descriptive statistics over `f64` samples.

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }

    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Population standard deviation (divides by `n`, not `n - 1`).
pub fn std_dev(samples: &[f64]) -> Option<f64> {
    let mean = mean(samples)?;

    let variance = samples
        .iter()
        .map(|sample| (sample - mean).powi(2))
        .sum::<f64>()
        / samples.len() as f64;

    Some(variance.sqrt())
}

/// Standard deviation divided by the mean.
///
/// Returns `None` for an empty slice or a non-positive mean, where relative
/// variability is undefined.
pub fn coefficient_of_variation(samples: &[f64]) -> Option<f64> {
    let mean = mean(samples)?;

    if mean <= 0.0 {
        return None;
    }

    Some(std_dev(samples)? / mean)
}

/// Mean absolute deviation of the samples from their mean.
pub fn mean_absolute_deviation(samples: &[f64]) -> Option<f64> {
    let mean = mean(samples)?;

    let total = samples.iter().map(|sample| (sample - mean).abs()).sum::<f64>();

    Some(total / samples.len() as f64)
}

/// Nearest-rank percentile of an already sorted slice.
///
/// Uses `index = floor(p * (n - 1))`; `percentile` is clamped to `[0, 1]`.
pub fn percentile_sorted(sorted: &[f64], percentile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }

    let percentile = percentile.clamp(0.0, 1.0);
    let index = (percentile * (sorted.len() - 1) as f64).floor() as usize;

    sorted.get(index).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mean_empty() {
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_mean() {
        assert!((mean(&[1.0, 2.0, 3.0, 4.0]).unwrap() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_std_dev_population() {
        // Population variance of {2,4,4,4,5,5,7,9} is exactly 4.
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((std_dev(&samples).unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_coefficient_of_variation_constant_is_zero() {
        let samples = [50.0; 6];
        assert_eq!(coefficient_of_variation(&samples), Some(0.0));
    }

    #[test]
    fn test_coefficient_of_variation_zero_mean() {
        assert_eq!(coefficient_of_variation(&[0.0, 0.0]), None);
        assert_eq!(coefficient_of_variation(&[]), None);
    }

    #[test]
    fn test_mean_absolute_deviation() {
        let mad = mean_absolute_deviation(&[10.0, 20.0, 30.0, 40.0]).unwrap();
        assert!((mad - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_percentile_sorted_nearest_rank() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile_sorted(&sorted, 0.05), Some(5.0));
        assert_eq!(percentile_sorted(&sorted, 0.5), Some(50.0));
        assert_eq!(percentile_sorted(&sorted, 0.95), Some(95.0));
        assert_eq!(percentile_sorted(&sorted, 1.0), Some(100.0));
        assert_eq!(percentile_sorted(&[], 0.5), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: scaling every sample leaves the coefficient of
        /// variation unchanged.
        #[test]
        fn coefficient_of_variation_is_scale_free(
            samples in prop::collection::vec(1.0f64..1_000.0, 2..32),
            scale in 0.001f64..1_000.0,
        ) {
            let scaled: Vec<f64> = samples.iter().map(|s| s * scale).collect();

            let original = coefficient_of_variation(&samples).unwrap();
            let rescaled = coefficient_of_variation(&scaled).unwrap();

            prop_assert!(
                (original - rescaled).abs() < 1e-9,
                "CoV changed under scaling: {} vs {}",
                original,
                rescaled
            );
        }

        /// Property: a percentile always lies between the extremes.
        #[test]
        fn percentile_within_bounds(
            mut samples in prop::collection::vec(-1e6f64..1e6, 1..64),
            p in 0.0f64..=1.0,
        ) {
            samples.sort_by(|a, b| a.total_cmp(b));
            let value = percentile_sorted(&samples, p).unwrap();

            prop_assert!(value >= samples[0]);
            prop_assert!(value <= samples[samples.len() - 1]);
        }
    }
}
