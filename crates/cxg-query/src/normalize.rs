// SPDX-License-Identifier: Apache-2.0

/// Rescales embedding dimensions in place into `[0, 1]`, using one scale for
/// every dimension so the aspect ratio is kept, and centers each dimension.
///
/// Non-finite coordinates are ignored when computing the bounds.
pub fn normalize_embedding(dims: &mut [Vec<f32>]) {
    let bounds: Vec<(f32, f32)> = dims
        .iter()
        .map(|d| {
            d.iter()
                .filter(|v| v.is_finite())
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(*v), hi.max(*v))
                })
        })
        .collect();
    let scale = bounds
        .iter()
        .filter(|(lo, hi)| lo <= hi)
        .map(|(lo, hi)| hi - lo)
        .fold(0.0_f32, f32::max);
    for (d, (lo, hi)) in dims.iter_mut().zip(bounds) {
        if scale <= 0.0 || lo > hi {
            d.iter_mut().for_each(|v| {
                if v.is_finite() {
                    *v = 0.5;
                }
            });
            continue;
        }
        let offset = (1.0 - (hi - lo) / scale) / 2.0;
        for v in d.iter_mut() {
            *v = (*v - lo) / scale + offset;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wider_axis_spans_unit_interval_and_narrow_axis_is_centered() {
        let mut dims = vec![vec![-10.0, 10.0, 0.0], vec![0.0, 5.0, 10.0]];
        normalize_embedding(&mut dims);
        assert_eq!(dims[0], vec![0.0, 1.0, 0.5]);
        assert_eq!(dims[1], vec![0.25, 0.5, 0.75]);
    }

    #[test]
    fn constant_embedding_collapses_to_center() {
        let mut dims = vec![vec![3.0, 3.0], vec![3.0, 3.0]];
        normalize_embedding(&mut dims);
        assert_eq!(dims, vec![vec![0.5, 0.5], vec![0.5, 0.5]]);
    }
}
