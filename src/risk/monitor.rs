//! Risk Monitor - turns metric snapshots into alerts.
//!
//! Alerts are de-duplicated by a key derived from kind and value, and the
//! dedup set is cleared hourly so a persisting condition is re-reported.
//! Every position check also feeds a bounded PnL history per position, from
//! which `position_analytics` is derived.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::PositionSide;
use crate::events::{AlertKind, AlertLevel, RiskAlert};
use crate::portfolio::Position;
use crate::risk::RiskMetrics;

/// Warning levels, below the hard limits of `RiskLimits`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub drawdown_percent: Decimal,
    pub daily_loss_percent: Decimal,
    /// Risk score that raises a critical alert
    pub critical_risk_score: u32,
    pub max_open_positions: usize,
    /// Position loss (negative percent) that raises a warning
    pub position_loss_percent: Decimal,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            drawdown_percent: Decimal::from(10),
            daily_loss_percent: Decimal::from(3),
            critical_risk_score: 80,
            max_open_positions: 10,
            position_loss_percent: Decimal::from(-5),
        }
    }
}

/// PnL samples kept per position
const MAX_POSITION_SAMPLES: usize = 500;

/// Summary of one position's PnL path
#[derive(Debug, Clone, PartialEq)]
pub struct PositionAnalytics {
    pub max_profit: Decimal,
    pub max_loss: Decimal,
    pub current_pnl: Decimal,
    /// Standard deviation of the sampled PnL
    pub pnl_volatility: f64,
    pub samples: usize,
    /// First to last sample
    pub time_in_position: Duration,
}

struct PnlSample {
    at: DateTime<Utc>,
    pnl: Decimal,
}

struct Dedup {
    sent: HashSet<String>,
    last_cleanup: DateTime<Utc>,
}

pub struct RiskMonitor {
    thresholds: AlertThresholds,
    dedup: Mutex<Dedup>,
    history: Mutex<HashMap<String, VecDeque<PnlSample>>>,
}

fn f(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl RiskMonitor {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            dedup: Mutex::new(Dedup {
                sent: HashSet::new(),
                last_cleanup: Utc::now(),
            }),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Portfolio-level alerts not yet reported.
    pub fn check_metrics(&self, metrics: &RiskMetrics, open_positions: usize) -> Vec<RiskAlert> {
        self.check_metrics_at(metrics, open_positions, Utc::now())
    }

    pub fn check_metrics_at(
        &self,
        metrics: &RiskMetrics,
        open_positions: usize,
        now: DateTime<Utc>,
    ) -> Vec<RiskAlert> {
        let t = &self.thresholds;
        let mut candidates = Vec::new();

        if metrics.current_drawdown > t.drawdown_percent {
            candidates.push((
                format!("drawdown_{}", metrics.current_drawdown.round_dp(1)),
                RiskAlert {
                    kind: AlertKind::HighDrawdown,
                    level: AlertLevel::Warning,
                    message: format!("High drawdown: {}%", metrics.current_drawdown.round_dp(2)),
                    value: f(metrics.current_drawdown),
                    threshold: f(t.drawdown_percent),
                    symbol: None,
                },
            ));
        }

        if metrics.daily_loss > t.daily_loss_percent {
            candidates.push((
                format!("daily_loss_{}", metrics.daily_loss.round_dp(1)),
                RiskAlert {
                    kind: AlertKind::HighDailyLoss,
                    level: AlertLevel::Warning,
                    message: format!("High daily loss: {}%", metrics.daily_loss.round_dp(2)),
                    value: f(metrics.daily_loss),
                    threshold: f(t.daily_loss_percent),
                    symbol: None,
                },
            ));
        }

        if metrics.risk_score > t.critical_risk_score {
            candidates.push((
                format!("risk_score_{}", metrics.risk_score),
                RiskAlert {
                    kind: AlertKind::CriticalRiskScore,
                    level: AlertLevel::Critical,
                    message: format!("Critical risk score: {}/100", metrics.risk_score),
                    value: metrics.risk_score as f64,
                    threshold: t.critical_risk_score as f64,
                    symbol: None,
                },
            ));
        }

        if open_positions > t.max_open_positions {
            candidates.push((
                format!("positions_{}", open_positions),
                RiskAlert {
                    kind: AlertKind::TooManyPositions,
                    level: AlertLevel::Info,
                    message: format!("Many open positions: {}", open_positions),
                    value: open_positions as f64,
                    threshold: t.max_open_positions as f64,
                    symbol: None,
                },
            ));
        }

        self.filter_new(candidates, now)
    }

    /// Alerts for one position at `price`: large loss and breached stop.
    pub fn check_position(&self, position: &Position, price: Decimal) -> Vec<RiskAlert> {
        self.check_position_at(position, price, Utc::now())
    }

    pub fn check_position_at(
        &self,
        position: &Position,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<RiskAlert> {
        self.record_pnl(&position.id, position.pnl_at(price), now);
        let mut candidates = Vec::new();

        let notional = position.notional();
        let pnl_percent = if notional.is_zero() {
            Decimal::ZERO
        } else {
            position.pnl_at(price) / notional * Decimal::ONE_HUNDRED
        };
        if pnl_percent < self.thresholds.position_loss_percent {
            candidates.push((
                format!("loss_{}_{}", position.id, pnl_percent.round_dp(0)),
                RiskAlert {
                    kind: AlertKind::LargePositionLoss,
                    level: AlertLevel::Warning,
                    message: format!(
                        "Large loss on {} {}: {}%",
                        position.symbol,
                        position.id,
                        pnl_percent.round_dp(2)
                    ),
                    value: f(pnl_percent),
                    threshold: f(self.thresholds.position_loss_percent),
                    symbol: Some(position.symbol.clone()),
                },
            ));
        }

        if let Some(stop) = position.stop_loss {
            let hit = match position.side {
                PositionSide::Long => price <= stop,
                PositionSide::Short => price >= stop,
            };
            if hit {
                candidates.push((
                    format!("stop_{}", position.id),
                    RiskAlert {
                        kind: AlertKind::StopLossHit,
                        level: AlertLevel::High,
                        message: format!(
                            "Stop-loss reached for {} {} at {}",
                            position.symbol, position.id, price
                        ),
                        value: f(price),
                        threshold: f(stop),
                        symbol: Some(position.symbol.clone()),
                    },
                ));
            }
        }

        self.filter_new(candidates, now)
    }

    /// Analytics over the sampled PnL, `None` before the first check.
    pub fn position_analytics(&self, position_id: &str) -> Option<PositionAnalytics> {
        let history = self.history.lock();
        analytics(history.get(position_id)?)
    }

    /// Drop a closed position's history, returning its final analytics.
    pub fn forget_position(&self, position_id: &str) -> Option<PositionAnalytics> {
        let samples = self.history.lock().remove(position_id)?;
        analytics(&samples)
    }

    fn record_pnl(&self, position_id: &str, pnl: Decimal, at: DateTime<Utc>) {
        let mut history = self.history.lock();
        let samples = history.entry(position_id.to_string()).or_default();
        if samples.len() == MAX_POSITION_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(PnlSample { at, pnl });
    }

    fn filter_new(
        &self,
        candidates: Vec<(String, RiskAlert)>,
        now: DateTime<Utc>,
    ) -> Vec<RiskAlert> {
        let mut dedup = self.dedup.lock();
        if now - dedup.last_cleanup > Duration::hours(1) {
            dedup.sent.clear();
            dedup.last_cleanup = now;
        }
        candidates
            .into_iter()
            .filter_map(|(key, alert)| dedup.sent.insert(key).then_some(alert))
            .collect()
    }
}

fn analytics(samples: &VecDeque<PnlSample>) -> Option<PositionAnalytics> {
    let first = samples.front()?;
    let last = samples.back()?;
    let pnls: Vec<f64> = samples.iter().map(|s| f(s.pnl)).collect();
    let n = pnls.len() as f64;
    let mean = pnls.iter().sum::<f64>() / n;
    let variance = pnls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;

    Some(PositionAnalytics {
        max_profit: samples.iter().map(|s| s.pnl).max().unwrap_or(Decimal::ZERO),
        max_loss: samples.iter().map(|s| s.pnl).min().unwrap_or(Decimal::ZERO),
        current_pnl: last.pnl,
        pnl_volatility: variance.sqrt(),
        samples: samples.len(),
        time_in_position: last.at - first.at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Symbol;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn long(id: &str, entry: &str, qty: &str) -> Position {
        Position::new(id, Symbol::new("BTCUSDT"), PositionSide::Long, dec(entry), dec(qty))
    }

    fn metrics(drawdown: &str, daily: &str, score: u32) -> RiskMetrics {
        RiskMetrics {
            current_drawdown: dec(drawdown),
            max_drawdown: dec(drawdown),
            daily_loss: dec(daily),
            position_risk: Decimal::ZERO,
            var_95: Decimal::ZERO,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            calmar_ratio: 0.0,
            risk_score: score,
        }
    }

    #[test]
    fn test_alerts_are_deduplicated() {
        let monitor = RiskMonitor::new(AlertThresholds::default());
        let m = metrics("12", "4", 85);

        let alerts = monitor.check_metrics(&m, 11);
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::HighDrawdown,
                AlertKind::HighDailyLoss,
                AlertKind::CriticalRiskScore,
                AlertKind::TooManyPositions
            ]
        );
        assert!(alerts[2].is_critical());

        assert!(monitor.check_metrics(&m, 11).is_empty());

        // A worse reading is a new alert
        let worse = monitor.check_metrics(&metrics("13", "4", 85), 11);
        assert_eq!(worse.len(), 1);
        assert_eq!(worse[0].kind, AlertKind::HighDrawdown);
    }

    #[test]
    fn test_dedup_clears_after_an_hour() {
        let monitor = RiskMonitor::new(AlertThresholds::default());
        let m = metrics("12", "0", 0);
        assert_eq!(monitor.check_metrics(&m, 0).len(), 1);
        assert!(monitor.check_metrics(&m, 0).is_empty());
        let later = Utc::now() + Duration::minutes(61);
        assert_eq!(monitor.check_metrics_at(&m, 0, later).len(), 1);
    }

    #[test]
    fn test_quiet_below_thresholds() {
        let monitor = RiskMonitor::new(AlertThresholds::default());
        assert!(monitor.check_metrics(&metrics("10", "3", 80), 10).is_empty());
    }

    #[test]
    fn test_position_alerts() {
        let monitor = RiskMonitor::new(AlertThresholds::default());
        let position = long("p1", "100", "1").with_brackets(Some(dec("95")), None);

        assert!(monitor.check_position(&position, dec("97")).is_empty());

        let alerts = monitor.check_position(&position, dec("94"));
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::LargePositionLoss, AlertKind::StopLossHit]);
        assert_eq!(alerts[1].level, AlertLevel::High);

        let short = Position::new(
            "s1",
            Symbol::new("ETHUSDT"),
            PositionSide::Short,
            dec("100"),
            dec("1"),
        )
        .with_brackets(Some(dec("103")), None);
        let alerts = monitor.check_position(&short, dec("103"));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::StopLossHit);
    }

    #[test]
    fn test_position_analytics_track_the_pnl_path() {
        let monitor = RiskMonitor::new(AlertThresholds::default());
        let position = long("p1", "100", "2");
        assert!(monitor.position_analytics("p1").is_none());

        let start = Utc::now();
        for (minute, price) in [(0, "100"), (10, "103"), (20, "98"), (30, "101")] {
            let at = start + Duration::minutes(minute);
            monitor.check_position_at(&position, dec(price), at);
        }

        let analytics = monitor.position_analytics("p1").unwrap();
        assert_eq!(analytics.samples, 4);
        assert_eq!(analytics.max_profit, dec("6"));
        assert_eq!(analytics.max_loss, dec("-4"));
        assert_eq!(analytics.current_pnl, dec("2"));
        assert_eq!(analytics.time_in_position, Duration::minutes(30));
        // PnL 0, 6, -4, 2 around a mean of 1
        assert!((analytics.pnl_volatility - 13f64.sqrt()).abs() < 1e-9);

        let last = monitor.forget_position("p1").unwrap();
        assert_eq!(last, analytics);
        assert!(monitor.position_analytics("p1").is_none());
    }

    #[test]
    fn test_position_history_is_bounded() {
        let monitor = RiskMonitor::new(AlertThresholds::default());
        let position = long("p1", "100", "1");
        let start = Utc::now();
        for i in 0..(MAX_POSITION_SAMPLES as i64 + 20) {
            monitor.check_position_at(&position, dec("100"), start + Duration::seconds(i));
        }

        let analytics = monitor.position_analytics("p1").unwrap();
        assert_eq!(analytics.samples, MAX_POSITION_SAMPLES);
        assert_eq!(
            analytics.time_in_position,
            Duration::seconds(MAX_POSITION_SAMPLES as i64 - 1)
        );
    }
}
