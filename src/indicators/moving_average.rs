/// Simple Moving Average over every index of `values`.
///
/// Index `i` holds the mean of the `period` values ending at `i`, or `None`
/// while fewer than `period` values are available. A period of 0 or 1 returns
/// the input unchanged.
pub fn sma_series(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if period <= 1 {
        return values.iter().copied().map(Some).collect();
    }

    let mut out = vec![None; values.len()];
    let mut sum = 0.0;

    for (i, value) in values.iter().enumerate() {
        sum += value;
        if i >= period {
            sum -= values[i - period];
        }
        if i + 1 >= period {
            out[i] = Some(sum / period as f64);
        }
    }

    out
}

/// Latest Simple Moving Average value
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}
