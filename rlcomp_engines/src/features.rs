use rlcomp_core::utils::mean_std;

/// Number of summary statistics appended after the histogram.
pub const MOMENT_FEATURES: usize = 4;

/// Fixed-length summary of an activation tensor: a normalised histogram over
/// `[min, max]` followed by mean, standard deviation, min and max.
pub fn activation_features(values: &[f32], bins: usize) -> Vec<f32> {
    let mut features = vec![0.0f32; bins + MOMENT_FEATURES];
    let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() || bins == 0 {
        return features;
    }
    let min = finite.iter().copied().fold(f32::INFINITY, f32::min);
    let max = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let width = max - min;
    for value in &finite {
        let bin = if width > 0.0 {
            (((value - min) / width) * bins as f32) as usize
        } else {
            0
        };
        features[bin.min(bins - 1)] += 1.0;
    }
    let total = finite.len() as f32;
    for count in features.iter_mut().take(bins) {
        *count /= total;
    }
    let (mean, std) = mean_std(&finite);
    features[bins] = mean;
    features[bins + 1] = std;
    features[bins + 2] = min;
    features[bins + 3] = max;
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_sums_to_one() {
        let values: Vec<f32> = (0..100).map(|i| i as f32 / 10.0).collect();
        let features = activation_features(&values, 8);
        assert_eq!(features.len(), 8 + MOMENT_FEATURES);
        let mass: f32 = features[..8].iter().sum();
        assert!((mass - 1.0).abs() < 1e-5);
        assert_eq!(features[10], 0.0);
        assert!((features[11] - 9.9).abs() < 1e-5);
    }

    #[test]
    fn constant_input_lands_in_first_bin() {
        let features = activation_features(&[3.0; 10], 4);
        assert_eq!(&features[..4], &[1.0, 0.0, 0.0, 0.0]);
        assert_eq!(features[4], 3.0);
    }

    #[test]
    fn empty_input_is_all_zeros() {
        assert_eq!(activation_features(&[], 3), vec![0.0; 3 + MOMENT_FEATURES]);
    }
}
