use std::cmp::Ordering::Less;

/// Index of the largest value. Ties resolve to the last maximum.
pub fn argmax(data: &[f32]) -> usize {
    data.iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Less))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

/// Population mean and standard deviation.
pub fn mean_std(data: &[f32]) -> (f32, f32) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let n = data.len() as f32;
    let mean = data.iter().sum::<f32>() / n;
    let var = data.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, var.sqrt())
}
