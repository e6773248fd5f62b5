//! Curve to lookup-table compaction.
//!
//! Every table here is channel-interleaved: sample `i`, channel `c` lives at
//! `values[i * channels + c]`. All channels share one time axis.

use smallvec::SmallVec;

use crate::{curve::CurveEvaluator, options::DistributionOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleMode {
    /// Each sample is the curve value at its time.
    #[default]
    Sample,
    /// Each sample is the running sum of the previous samples, scaled by
    /// `1 / (count - 1)`. Sample 0 is always zero.
    Accumulate,
}

/// Time of sample `index` out of `count` evenly spaced over `[start, end]`.
#[inline]
pub fn sample_time(time_range: (f32, f32), index: usize, count: usize) -> f32 {
    let (start, end) = time_range;
    if count <= 1 {
        start
    } else {
        start + index as f32 * (end - start) / (count - 1) as f32
    }
}

/// Union of the time ranges of all curves.
pub fn curves_time_range(curves: &[&dyn CurveEvaluator]) -> (f32, f32) {
    curves
        .iter()
        .map(|curve| curve.time_range())
        .reduce(|(a0, a1), (b0, b1)| (a0.min(b0), a1.max(b1)))
        .unwrap_or((0.0, 0.0))
}

/// Samples every curve `count` times over `time_range` into an interleaved table.
pub fn sample_curves(
    curves: &[&dyn CurveEvaluator],
    mode: SampleMode,
    time_range: (f32, f32),
    count: usize,
) -> Vec<f32> {
    let channels = curves.len();
    let mut values = Vec::with_capacity(count * channels);

    match mode {
        SampleMode::Sample => {
            for i in 0..count {
                let time = sample_time(time_range, i, count);
                values.extend(curves.iter().map(|curve| curve.eval(time)));
            }
        }
        SampleMode::Accumulate => {
            let scale = if count > 1 { 1.0 / (count - 1) as f32 } else { 0.0 };
            let mut sums = SmallVec::<[f32; 4]>::from_elem(0.0, channels);
            for i in 0..count {
                values.extend_from_slice(&sums);
                let time = sample_time(time_range, i, count);
                for (sum, curve) in sums.iter_mut().zip(curves) {
                    *sum += curve.eval(time) * scale;
                }
            }
        }
    }

    values
}

/// Relative comparison with an absolute floor of 1.
#[inline]
pub fn nearly_equal(a: f32, b: f32, tolerance: f32) -> bool {
    (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0)
}

fn rows_nearly_equal(a: &[f32], b: &[f32], tolerance: f32) -> bool {
    a.iter().zip(b).all(|(a, b)| nearly_equal(*a, *b, tolerance))
}

/// Shrinks `time_range` to exclude flat leading and trailing regions.
///
/// A region is flat when every sample in it is nearly equal to the boundary
/// sample it starts from. A fully flat set of curves collapses to a zero width
/// range at its start.
pub fn reduce_time_range(
    curves: &[&dyn CurveEvaluator],
    time_range: (f32, f32),
    count: usize,
    tolerance: f32,
) -> (f32, f32) {
    let channels = curves.len();
    if channels == 0 || count < 2 {
        return time_range;
    }

    let values = sample_curves(curves, SampleMode::Sample, time_range, count);
    let rows = values.chunks_exact(channels).collect::<Vec<_>>();

    let first = rows[0];
    let Some(first_change) = rows
        .iter()
        .position(|row| !rows_nearly_equal(row, first, tolerance))
    else {
        return (time_range.0, time_range.0);
    };

    let last = rows[count - 1];
    let last_change = rows
        .iter()
        .rposition(|row| !rows_nearly_equal(row, last, tolerance))
        .unwrap_or(count - 1);

    (
        sample_time(time_range, first_change - 1, count),
        sample_time(time_range, (last_change + 1).min(count - 1), count),
    )
}

/// Piecewise-linear read of an interleaved table at `u` in `[0, 1]`.
pub fn sample_lut_into(values: &[f32], channels: usize, u: f32, out: &mut [f32]) {
    debug_assert!(out.len() >= channels);
    let count = if channels == 0 { 0 } else { values.len() / channels };

    match count {
        0 => out[..channels].fill(0.0),
        1 => out[..channels].copy_from_slice(&values[..channels]),
        _ => {
            let x = u.clamp(0.0, 1.0) * (count - 1) as f32;
            let i0 = (x.floor() as usize).min(count - 1);
            let i1 = (i0 + 1).min(count - 1);
            let frac = x - i0 as f32;
            for c in 0..channels {
                let a = values[i0 * channels + c];
                let b = values[i1 * channels + c];
                out[c] = a + (b - a) * frac;
            }
        }
    }
}

pub fn sample_lut(values: &[f32], channels: usize, u: f32) -> SmallVec<[f32; 4]> {
    let mut out = SmallVec::from_elem(0.0, channels);
    sample_lut_into(values, channels, u, &mut out);
    out
}

/// Resamples an interleaved table to `count` samples.
pub fn resample_lut(values: &[f32], channels: usize, count: usize) -> Vec<f32> {
    let mut out = vec![0.0; count * channels];
    for (i, row) in out.chunks_exact_mut(channels.max(1)).enumerate().take(count) {
        let u = if count > 1 {
            i as f32 / (count - 1) as f32
        } else {
            0.0
        };
        sample_lut_into(values, channels, u, row);
    }
    out
}

/// Compares two tables at the resolution of the larger one.
pub fn lut_almost_equal(a: &[f32], b: &[f32], channels: usize, threshold: f32) -> bool {
    if channels == 0 {
        return true;
    }
    let count = (a.len() / channels).max(b.len() / channels);
    let a = resample_lut(a, channels, count);
    let b = resample_lut(b, channels, count);
    a.iter().zip(&b).all(|(a, b)| (a - b).abs() <= threshold)
}

/// Smallest sample count whose table matches the `max_count` table within
/// `threshold`.
pub fn optimize_lut_size(
    curves: &[&dyn CurveEvaluator],
    mode: SampleMode,
    time_range: (f32, f32),
    max_count: usize,
    threshold: f32,
) -> usize {
    let channels = curves.len();
    let reference = sample_curves(curves, mode, time_range, max_count);

    let count = (2..max_count)
        .find(|count| {
            let candidate = sample_curves(curves, mode, time_range, *count);
            lut_almost_equal(&candidate, &reference, channels, threshold)
        })
        .unwrap_or(max_count);

    tracing::debug!(count, max_count, channels, "Optimized LUT size");
    count
}

/// A baked table and the time range it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Lut {
    pub values: Vec<f32>,
    pub time_range: (f32, f32),
}

/// Bakes `curves` into a table using `options`.
pub fn bake_curves(
    curves: &[&dyn CurveEvaluator],
    mode: SampleMode,
    options: &DistributionOptions,
) -> Lut {
    let max_count = options.max_lut_sample_count.max(2);
    let mut time_range = curves_time_range(curves);

    if options.reduce_time_range && mode == SampleMode::Sample {
        time_range = reduce_time_range(curves, time_range, max_count, options.time_range_tolerance);
    }

    let count = if options.optimize_lut_size {
        optimize_lut_size(curves, mode, time_range, max_count, options.lut_error_threshold)
    } else {
        max_count
    };

    Lut {
        values: sample_curves(curves, mode, time_range, count),
        time_range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::Curve;
    use rstest::rstest;

    #[rstest]
    #[case((0.0, 1.0), 0, 5, 0.0)]
    #[case((0.0, 1.0), 4, 5, 1.0)]
    #[case((2.0, 4.0), 1, 3, 3.0)]
    #[case((2.0, 4.0), 0, 1, 2.0)]
    fn test_sample_time(
        #[case] range: (f32, f32),
        #[case] index: usize,
        #[case] count: usize,
        #[case] expected: f32,
    ) {
        assert_eq!(sample_time(range, index, count), expected);
    }

    #[test]
    fn test_accumulate_starts_at_zero() {
        let curve = Curve::constant(2.0);
        let values = sample_curves(&[&curve], SampleMode::Accumulate, (0.0, 1.0), 5);
        assert_eq!(values, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_sample_curves_interleaves_channels() {
        let x = Curve::linear(&[(0.0, 0.0), (1.0, 1.0)]);
        let y = Curve::constant(7.0);
        let values = sample_curves(&[&x, &y], SampleMode::Sample, (0.0, 1.0), 3);
        assert_eq!(values, vec![0.0, 7.0, 0.5, 7.0, 1.0, 7.0]);
    }

    #[test]
    fn test_reduce_time_range_trims_plateaus() {
        let curve = Curve::linear(&[(0.0, 1.0), (0.25, 1.0), (0.75, 3.0), (1.0, 3.0)]);
        let range = reduce_time_range(&[&curve], (0.0, 1.0), 5, 1e-4);
        assert_eq!(range, (0.25, 0.75));
    }

    #[test]
    fn test_reduce_time_range_collapses_flat_curve() {
        let curve = Curve::linear(&[(0.0, 2.0), (1.0, 2.0)]);
        assert_eq!(reduce_time_range(&[&curve], (0.0, 1.0), 8, 1e-4), (0.0, 0.0));
    }

    #[test]
    fn test_reduce_time_range_keeps_slow_ramp() {
        let curve = Curve::linear(&[(0.0, 0.0), (1.0, 0.1)]);
        assert_eq!(reduce_time_range(&[&curve], (0.0, 1.0), 64, 1e-4), (0.0, 1.0));
    }

    #[rstest]
    #[case(0.0, 0.0)]
    #[case(0.5, 5.0)]
    #[case(0.25, 2.5)]
    #[case(2.0, 10.0)]
    #[case(-1.0, 0.0)]
    fn test_sample_lut(#[case] u: f32, #[case] expected: f32) {
        assert_eq!(sample_lut(&[0.0, 10.0], 1, u)[0], expected);
    }

    #[test]
    fn test_linear_curve_optimizes_to_two_samples() {
        let curve = Curve::linear(&[(0.0, 0.0), (1.0, 4.0)]);
        assert_eq!(optimize_lut_size(&[&curve], SampleMode::Sample, (0.0, 1.0), 64, 0.01), 2);
    }

    #[test]
    fn test_bent_curve_needs_more_samples() {
        let curve = Curve::linear(&[(0.0, 0.0), (0.5, 1.0), (1.0, 0.0)]);
        let count = optimize_lut_size(&[&curve], SampleMode::Sample, (0.0, 1.0), 64, 0.01);
        assert!(count > 2);
        assert!(count <= 64);
    }

    #[test]
    fn test_resample_preserves_endpoints() {
        let values = resample_lut(&[1.0, 2.0, 3.0, 4.0], 2, 3);
        assert_eq!(values, vec![1.0, 2.0, 2.0, 3.0, 3.0, 4.0]);
    }

    #[test]
    fn test_bake_curves_respects_disabled_optimisation() {
        let curve = Curve::linear(&[(0.0, 0.0), (1.0, 1.0)]);
        let options = DistributionOptions {
            max_lut_sample_count: 16,
            optimize_lut_size: false,
            ..Default::default()
        };
        let lut = bake_curves(&[&curve], SampleMode::Sample, &options);
        assert_eq!(lut.values.len(), 16);
        assert_eq!(lut.time_range, (0.0, 1.0));
    }
}
