//! Portfolio risk metrics over a value series

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Percent below the running peak at the latest observation
    pub current_drawdown: f64,
    /// Largest percent drop from a running peak over the series
    pub max_drawdown: f64,
    /// Annualised standard deviation of period returns
    pub volatility: Option<f64>,
    pub sharpe: Option<f64>,
    /// Historical one-period loss in percent
    pub var_95: Option<f64>,
    pub var_99: Option<f64>,
    pub latest_value: f64,
    pub observations: usize,
}

/// Metrics for `values` (oldest first); `None` for an empty series
pub fn compute(values: &[f64], risk_free_rate: f64, periods_per_year: f64) -> Option<RiskMetrics> {
    let latest_value = *values.last()?;
    let (current_drawdown, max_drawdown) = drawdowns(values);
    let returns = period_returns(values);

    let volatility = std_dev(&returns).map(|sd| sd * periods_per_year.sqrt());
    let sharpe = volatility.filter(|v| *v > 0.0).map(|vol| {
        let annual_return = mean(&returns) * periods_per_year;
        (annual_return - risk_free_rate) / vol
    });

    let mut sorted = returns.clone();
    sorted.sort_by(f64::total_cmp);

    Some(RiskMetrics {
        current_drawdown,
        max_drawdown,
        volatility,
        sharpe,
        var_95: historical_var(&sorted, 0.05),
        var_99: historical_var(&sorted, 0.01),
        latest_value,
        observations: values.len(),
    })
}

/// (current, max) drawdown in percent
pub fn drawdowns(values: &[f64]) -> (f64, f64) {
    let mut peak = f64::MIN;
    let mut current = 0.0;
    let mut max = 0.0_f64;
    for &value in values {
        peak = peak.max(value);
        current = if peak > 0.0 {
            ((peak - value) / peak * 100.0).max(0.0)
        } else {
            0.0
        };
        max = max.max(current);
    }
    (current, max)
}

fn period_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Population standard deviation
fn std_dev(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let m = mean(xs);
    let variance = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64;
    Some(variance.sqrt())
}

/// Loss at the `tail` quantile of ascending `sorted_returns`, in percent; zero when
/// that quantile is a gain
fn historical_var(sorted_returns: &[f64], tail: f64) -> Option<f64> {
    let index = (sorted_returns.len() as f64 * tail) as usize;
    sorted_returns.get(index).map(|r| (-r).max(0.0) * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_twelve_percent_drawdown() {
        let values = [100_000.0, 104_000.0, 100_000.0, 91_520.0];
        let (current, max) = drawdowns(&values);
        assert!((current - 12.0).abs() < 1e-9);
        assert!((max - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_current_differs_from_max_after_rebound() {
        let values = [100.0, 80.0, 95.0];
        let (current, max) = drawdowns(&values);
        assert!((current - 5.0).abs() < 1e-9);
        assert!((max - 20.0).abs() < 1e-9);

        // a new peak clears the current drawdown
        let (current, _) = drawdowns(&[100.0, 80.0, 120.0]);
        assert_eq!(current, 0.0);
    }

    #[test]
    fn test_volatility_and_sharpe() {
        // alternating +10% / -10%
        let values = [100.0, 110.0, 99.0, 108.9];
        let metrics = compute(&values, 0.0, 1.0).unwrap();
        let vol = metrics.volatility.unwrap();
        // returns [0.1, -0.1, 0.1]: mean 1/30, population sd = sqrt(0.008/0.9)
        assert!((vol - (0.008_f64 / 0.9).sqrt()).abs() < 1e-9);
        let sharpe = metrics.sharpe.unwrap();
        assert!((sharpe - (0.1 / 3.0) / vol).abs() < 1e-9);
        assert_eq!(metrics.observations, 4);
        assert_eq!(metrics.latest_value, 108.9);
    }

    #[test]
    fn test_var_uses_worst_tail() {
        let series = |losses: &[(usize, f64)]| {
            let mut values = vec![100.0];
            for i in 0..20 {
                let last = *values.last().unwrap();
                let r = losses
                    .iter()
                    .find(|(at, _)| *at == i)
                    .map_or(0.01, |(_, r)| *r);
                values.push(last * (1.0 + r));
            }
            compute(&values, 0.02, 252.0).unwrap()
        };

        // 20 returns: the 5% index is 1, the second worst
        let metrics = series(&[(7, -0.08), (12, -0.03)]);
        assert!((metrics.var_95.unwrap() - 3.0).abs() < 1e-9);
        assert!((metrics.var_99.unwrap() - 8.0).abs() < 1e-9);

        // a gain at the quantile is no loss
        let metrics = series(&[(7, -0.08)]);
        assert_eq!(metrics.var_95, Some(0.0));
        assert!((metrics.var_99.unwrap() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_series() {
        assert!(compute(&[], 0.02, 252.0).is_none());

        let single = compute(&[100.0], 0.02, 252.0).unwrap();
        assert_eq!(single.current_drawdown, 0.0);
        assert!(single.volatility.is_none());
        assert!(single.sharpe.is_none());
        assert!(single.var_95.is_none());

        let flat = compute(&[100.0, 100.0, 100.0], 0.02, 252.0).unwrap();
        assert_eq!(flat.volatility, Some(0.0));
        assert!(flat.sharpe.is_none());
    }
}
