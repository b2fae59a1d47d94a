//! Frequency-cluster voting over the estimates of one pluck.

/// Picks the best frequency from a pluck's estimates.
///
/// The finite estimates are sorted and split greedily into ranges whose members
/// lie within `cohesion` Hz of the range's lowest value. The range with the
/// most members wins (the lowest one on a tie) and its mean is returned.
/// Non-finite estimates are dropped, so a few bad frames cannot sink the pluck.
pub fn best_frequency(estimates: &[f64], cohesion: f64) -> Option<f64> {
    best_frequency_in_place(&mut estimates.to_vec(), cohesion)
}

/// [`best_frequency`] without the copy: sorts `estimates` in place, which
/// allocates nothing and so is safe on the audio thread.
pub fn best_frequency_in_place(estimates: &mut [f64], cohesion: f64) -> Option<f64> {
    // total_cmp puts NaNs and infinities at the ends, leaving the finite run in the middle.
    estimates.sort_unstable_by(f64::total_cmp);
    let start = estimates.iter().position(|f| f.is_finite())?;
    let end = estimates.iter().rposition(|f| f.is_finite())? + 1;
    let sorted = &estimates[start..end];

    let mut best = 0..0;
    let mut start = 0;
    for i in 1..=sorted.len() {
        if i == sorted.len() || sorted[i] - sorted[start] > cohesion {
            if i - start > best.len() {
                best = start..i;
            }
            start = i;
        }
    }

    let range = &sorted[best];
    Some(range.iter().sum::<f64>() / range.len() as f64)
}
