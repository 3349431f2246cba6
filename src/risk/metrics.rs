//! Performance and risk ratios over daily returns.
//!
//! Returns are fractions (0.01 = +1%). Every ratio needs at least
//! `MIN_SAMPLES` observations and reports 0 below that.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

pub const TRADING_DAYS: f64 = 252.0;
pub const MIN_SAMPLES: usize = 30;

/// Kelly fraction used until enough trades are recorded
pub const KELLY_BASELINE: f64 = 0.25;
pub const KELLY_MIN_TRADES: usize = 10;

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Annualized Sharpe ratio.
pub fn sharpe_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
    if returns.len() < MIN_SAMPLES {
        return 0.0;
    }
    let annual_return = mean(returns) * TRADING_DAYS;
    let annual_vol = std_dev(returns) * TRADING_DAYS.sqrt();
    if annual_vol == 0.0 {
        return 0.0;
    }
    (annual_return - risk_free_rate) / annual_vol
}

/// Annualized Sortino ratio. Infinite when no return fell below the target.
pub fn sortino_ratio(returns: &[f64], target_return: f64) -> f64 {
    if returns.len() < MIN_SAMPLES {
        return 0.0;
    }
    let daily_target = target_return / TRADING_DAYS;
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < daily_target).collect();
    if downside.is_empty() {
        return f64::INFINITY;
    }
    let downside_dev = (downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64).sqrt()
        * TRADING_DAYS.sqrt();
    if downside_dev == 0.0 {
        return f64::INFINITY;
    }
    (mean(returns) * TRADING_DAYS - target_return) / downside_dev
}

/// Linear-interpolated percentile, `q` in [0, 1].
fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Historical one-day VaR at `confidence` (0.95 = 95%), as an amount of `balance`.
pub fn value_at_risk(balance: Decimal, returns: &[f64], confidence: f64) -> Decimal {
    if returns.len() < MIN_SAMPLES {
        return Decimal::ZERO;
    }
    let worst = percentile(returns, 1.0 - confidence).min(0.0).abs();
    Decimal::from_f64_retain(worst)
        .map(|w| (balance * w).round_dp(8))
        .unwrap_or(Decimal::ZERO)
}

/// Annualized return over max drawdown (percent).
pub fn calmar_ratio(returns: &[f64], max_drawdown_percent: Decimal) -> f64 {
    if returns.len() < MIN_SAMPLES {
        return 0.0;
    }
    let max_dd = max_drawdown_percent.to_f64().unwrap_or(0.0) / 100.0;
    if max_dd <= 0.0 {
        return 0.0;
    }
    mean(returns) * TRADING_DAYS / max_dd
}

/// Kelly fraction from per-trade returns in percent, clamped to `[min, max]`.
pub fn kelly_fraction(trade_returns_percent: &[f64], min: f64, max: f64) -> f64 {
    if trade_returns_percent.len() < KELLY_MIN_TRADES {
        return KELLY_BASELINE;
    }
    let returns: Vec<f64> = trade_returns_percent.iter().map(|r| r / 100.0).collect();
    let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
    let losses: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();

    let win_rate = wins.len() as f64 / returns.len() as f64;
    let avg_win = mean(&wins);
    let avg_loss = if losses.is_empty() { 0.01 } else { mean(&losses).abs() };
    if avg_loss == 0.0 || avg_win == 0.0 {
        return KELLY_BASELINE.clamp(min, max);
    }

    let b = avg_win / avg_loss;
    ((b * win_rate - (1.0 - win_rate)) / b).clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternating(n: usize, up: f64, down: f64) -> Vec<f64> {
        (0..n).map(|i| if i % 2 == 0 { up } else { down }).collect()
    }

    #[test]
    fn test_ratios_need_thirty_samples() {
        let short = vec![0.01; 29];
        assert_eq!(sharpe_ratio(&short, 0.02), 0.0);
        assert_eq!(sortino_ratio(&short, 0.0), 0.0);
        assert_eq!(value_at_risk(Decimal::from(1000), &short, 0.95), Decimal::ZERO);
        assert_eq!(calmar_ratio(&short, Decimal::from(5)), 0.0);
    }

    #[test]
    fn test_sharpe_positive_for_steady_gains() {
        let returns = alternating(40, 0.02, 0.0);
        let sharpe = sharpe_ratio(&returns, 0.02);
        assert!(sharpe > 0.0, "sharpe {sharpe}");
    }

    #[test]
    fn test_sortino_without_downside_is_infinite() {
        assert!(sortino_ratio(&vec![0.01; 30], 0.0).is_infinite());
        let mixed = alternating(30, 0.02, -0.01);
        let sortino = sortino_ratio(&mixed, 0.0);
        assert!(sortino.is_finite() && sortino > 0.0);
    }

    #[test]
    fn test_var_uses_lower_tail() {
        let mut returns = vec![0.01; 37];
        returns.extend([-0.10; 3]);
        // 5th percentile of 40 samples falls inside the three worst days
        let var = value_at_risk(Decimal::from(10_000), &returns, 0.95);
        assert_eq!(var, Decimal::from(1_000));

        assert_eq!(value_at_risk(Decimal::from(10_000), &vec![0.01; 40], 0.95), Decimal::ZERO);
    }

    #[test]
    fn test_kelly_baseline_and_bounds() {
        assert_eq!(kelly_fraction(&[5.0; 9], 0.1, 0.5), KELLY_BASELINE);

        // Always winning: clamps at the upper bound
        let wins = vec![2.0; 10];
        assert_eq!(kelly_fraction(&wins, 0.1, 0.5), 0.5);

        // Mostly losing: clamps at the lower bound
        let mut losing = vec![-2.0; 8];
        losing.extend([1.0, 1.0]);
        assert_eq!(kelly_fraction(&losing, 0.1, 0.5), 0.1);

        // 60% wins at 2:1 -> (2*0.6 - 0.4) / 2 = 0.4
        let mut mixed = vec![4.0; 6];
        mixed.extend([-2.0; 4]);
        assert!((kelly_fraction(&mixed, 0.1, 0.5) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_std_dev() {
        assert_eq!(std_dev(&[1.0]), 0.0);
        assert!((std_dev(&[1.0, 3.0]) - 1.0).abs() < 1e-12);
    }
}
