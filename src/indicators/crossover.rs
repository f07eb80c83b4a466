/// Direction of a confirmed moving-average crossover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossover {
    /// Short MA moved from at-or-below to strictly above the long MA
    Up,
    /// Short MA moved from at-or-above to strictly below the long MA
    Down,
}

/// The two most recent indices `(prev, cur)` where both series are defined.
///
/// Indices where either series is `None` are skipped, so `prev` and `cur` need
/// not be adjacent.
pub fn last_two_defined(short: &[Option<f64>], long: &[Option<f64>]) -> Option<(usize, usize)> {
    let len = short.len().min(long.len());
    let mut defined = (0..len)
        .rev()
        .filter(|&i| short[i].is_some() && long[i].is_some());

    let cur = defined.next()?;
    let prev = defined.next()?;
    Some((prev, cur))
}

fn points(short: &[Option<f64>], long: &[Option<f64>]) -> Option<((f64, f64), (f64, f64))> {
    let (p, c) = last_two_defined(short, long)?;
    Some(((short[p]?, long[p]?), (short[c]?, long[c]?)))
}

/// Equality at `prev` counts as "not yet crossed"; `cur` must be strictly above.
pub fn is_cross_up(short: &[Option<f64>], long: &[Option<f64>]) -> bool {
    match points(short, long) {
        Some(((sp, lp), (sc, lc))) => sp <= lp && sc > lc,
        None => false,
    }
}

/// Mirror of [`is_cross_up`].
pub fn is_cross_down(short: &[Option<f64>], long: &[Option<f64>]) -> bool {
    match points(short, long) {
        Some(((sp, lp), (sc, lc))) => sp >= lp && sc < lc,
        None => false,
    }
}

/// Most recent confirmed crossover, if any
pub fn detect_crossover(short: &[Option<f64>], long: &[Option<f64>]) -> Option<Crossover> {
    if is_cross_up(short, long) {
        Some(Crossover::Up)
    } else if is_cross_down(short, long) {
        Some(Crossover::Down)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::sma_series;

    fn series(closes: &[f64]) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
        (sma_series(closes, 2), sma_series(closes, 3))
    }

    #[test]
    fn test_cross_up_confirmed() {
        // prev: 10 <= 10, cur: 15 > 13.33
        let (short, long) = series(&[10.0, 10.0, 10.0, 20.0]);
        assert!(is_cross_up(&short, &long));
        assert!(!is_cross_down(&short, &long));
        assert_eq!(detect_crossover(&short, &long), Some(Crossover::Up));
    }

    #[test]
    fn test_cross_down_confirmed() {
        // prev: 10 >= 10, cur: 5 < 6.67
        let (short, long) = series(&[10.0, 10.0, 10.0, 0.0]);
        assert!(is_cross_down(&short, &long));
        assert!(!is_cross_up(&short, &long));
        assert_eq!(detect_crossover(&short, &long), Some(Crossover::Down));
    }

    #[test]
    fn test_flat_market_has_no_cross() {
        let (short, long) = series(&[10.0, 10.0, 10.0, 10.0]);
        assert!(!is_cross_up(&short, &long));
        assert!(!is_cross_down(&short, &long));
        assert_eq!(detect_crossover(&short, &long), None);
    }

    #[test]
    fn test_already_above_is_not_a_new_cross() {
        let (short, long) = series(&[10.0, 10.0, 12.0, 20.0, 30.0]);
        assert!(!is_cross_up(&short, &long));
    }

    #[test]
    fn test_single_defined_point_is_no_cross() {
        let (short, long) = series(&[10.0, 10.0, 20.0]);
        assert_eq!(last_two_defined(&short, &long), None);
        assert!(!is_cross_up(&short, &long));
    }

    #[test]
    fn test_gaps_are_skipped() {
        let short = vec![Some(1.0), None, Some(3.0), None];
        let long = vec![Some(2.0), Some(2.0), Some(2.0), Some(2.0)];
        assert_eq!(last_two_defined(&short, &long), Some((0, 2)));
        assert!(is_cross_up(&short, &long));
    }
}
