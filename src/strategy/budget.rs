use crate::models::PairSettings;

/// Fiat available for a new entry on a pair.
///
/// Capped per transaction and by what is left of the pair's total allowance
/// after `invested_open`. A result of 0 means no entry this cycle.
pub fn order_budget(settings: &PairSettings, invested_open: f64) -> f64 {
    let remaining = (settings.max_invest_fiat - invested_open).max(0.0);
    settings.max_per_tx_fiat.min(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_invest: f64, max_per_tx: f64) -> PairSettings {
        PairSettings {
            pair: "ETH/EUR".to_string(),
            max_invest_fiat: max_invest,
            max_per_tx_fiat: max_per_tx,
            take_profit_pct: 0.0,
            stop_loss_pct: 0.0,
        }
    }

    #[test]
    fn test_capped_per_transaction() {
        assert_eq!(order_budget(&settings(100.0, 20.0), 0.0), 20.0);
    }

    #[test]
    fn test_capped_by_remaining_allowance() {
        assert_eq!(order_budget(&settings(100.0, 20.0), 90.0), 10.0);
    }

    #[test]
    fn test_exhausted_allowance() {
        assert_eq!(order_budget(&settings(100.0, 20.0), 100.0), 0.0);
        assert_eq!(order_budget(&settings(100.0, 20.0), 150.0), 0.0);
    }
}
