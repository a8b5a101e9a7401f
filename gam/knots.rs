//! Knot placement and interval lookup for the cubic regression spline basis.

use ndarray::{Array1, ArrayView1};

/// Upper bound on the default number of knots per smooth predictor.
pub const MAX_DEFAULT_KNOTS: usize = 10;

/// The knot count used when a predictor does not configure one:
/// `min(10, n_rows)`.
pub fn default_num_knots(n_rows: usize) -> usize {
    n_rows.min(MAX_DEFAULT_KNOTS)
}

/// Finds the knot interval containing `x`.
///
/// Returns the index `i` in `[0, n-2]` such that `knots[i] <= x < knots[i+1]`.
/// Values at or below the first knot map to `0`, values at or above the last
/// knot map to `n-2`. The knots only need to be non-decreasing; spacing may be
/// arbitrary. When knots repeat, the last interval whose lower knot is `<= x`
/// is returned.
///
/// With fewer than two knots there is no interval to search and `0` is
/// returned.
pub fn locate_bin(x: f64, knots: ArrayView1<f64>) -> usize {
    let n = knots.len();
    if n < 2 {
        return 0;
    }
    let last_bin = n - 2;

    if x <= knots[0] {
        return 0;
    }
    if x >= knots[n - 1] {
        return last_bin;
    }

    // Invariant: knots[low] <= x < knots[high].
    let mut low = 0;
    let mut high = n - 1;
    while high - low > 1 {
        let mid = low + (high - low) / 2;
        if x >= knots[mid] {
            low = mid;
        } else {
            high = mid;
        }
    }
    low.min(last_bin)
}

/// Places `num_knots` knots evenly over `[min, max]`, endpoints included.
pub fn uniform_knots(min: f64, max: f64, num_knots: usize) -> Array1<f64> {
    if num_knots == 1 {
        return Array1::from_elem(1, min);
    }
    Array1::linspace(min, max, num_knots)
}

/// Observed `(min, max)` of a fully imputed column. Returns `None` for an
/// empty column or when a non-finite value is present.
pub fn data_range(values: ArrayView1<f64>) -> Option<(f64, f64)> {
    let mut iter = values.iter().copied();
    let first = iter.next()?;
    if !first.is_finite() {
        return None;
    }
    let mut range = (first, first);
    for v in iter {
        if !v.is_finite() {
            return None;
        }
        range.0 = range.0.min(v);
        range.1 = range.1.max(v);
    }
    Some(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn clamps_below_and_above_the_knot_range() {
        let knots = array![0.0, 1.0, 2.5, 4.0, 10.0];
        assert_eq!(locate_bin(-3.0, knots.view()), 0);
        assert_eq!(locate_bin(0.0, knots.view()), 0);
        assert_eq!(locate_bin(10.0, knots.view()), 3);
        assert_eq!(locate_bin(1e300, knots.view()), 3);
    }

    #[test]
    fn interior_points_land_in_their_interval() {
        let knots = array![0.0, 1.0, 2.5, 4.0, 10.0];
        assert_eq!(locate_bin(0.5, knots.view()), 0);
        assert_eq!(locate_bin(1.0, knots.view()), 1);
        assert_eq!(locate_bin(2.4999, knots.view()), 1);
        assert_eq!(locate_bin(2.5, knots.view()), 2);
        assert_eq!(locate_bin(9.99, knots.view()), 3);
    }

    #[test]
    fn every_interval_is_found_for_many_knot_counts() {
        for n in 2..40 {
            let knots = Array1::from_iter((0..n).map(|i| (i as f64).powf(1.3)));
            for i in 0..n - 1 {
                let mid = 0.5 * (knots[i] + knots[i + 1]);
                assert_eq!(locate_bin(mid, knots.view()), i, "n={n}, i={i}");
            }
        }
    }

    #[test]
    fn fewer_than_two_knots_return_the_first_interval() {
        let empty = Array1::<f64>::zeros(0);
        assert_eq!(locate_bin(1.0, empty.view()), 0);
        let single = array![2.0];
        assert_eq!(locate_bin(-1.0, single.view()), 0);
        assert_eq!(locate_bin(5.0, single.view()), 0);
    }

    #[test]
    fn two_knots_always_return_zero() {
        let knots = array![-1.0, 1.0];
        for x in [-5.0, -1.0, 0.0, 1.0, 5.0] {
            assert_eq!(locate_bin(x, knots.view()), 0);
        }
    }

    #[test]
    fn repeated_knots_stay_in_range() {
        let knots = array![0.0, 1.0, 1.0, 1.0, 2.0];
        let bin = locate_bin(1.0, knots.view());
        assert!(bin <= 3);
        assert!(knots[bin] <= 1.0);
        assert_eq!(locate_bin(1.5, knots.view()), 3);
    }

    #[test]
    fn default_knot_count_is_capped() {
        assert_eq!(default_num_knots(3), 3);
        assert_eq!(default_num_knots(10), 10);
        assert_eq!(default_num_knots(5000), 10);
    }

    #[test]
    fn uniform_knots_cover_the_range() {
        let knots = uniform_knots(2.0, 6.0, 5);
        assert_eq!(knots, array![2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(data_range(array![3.0, -1.0, 7.5].view()), Some((-1.0, 7.5)));
        assert_eq!(data_range(array![1.0, f64::NAN].view()), None);
    }
}
