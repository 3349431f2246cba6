//! Risk Gate - admission control and risk metrics.
//!
//! Every new position passes `check_admission` first. Entries admitted but not
//! yet filled are held as reservations, so a burst of intents is checked
//! against what is already on its way as well as what is on the ledger. The
//! same state feeds `metrics()` and `should_halt()`, which drive alerts and the
//! circuit breaker.

pub mod metrics;
pub mod monitor;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::{PositionSide, Side, Symbol};
use crate::portfolio::{Portfolio, Position};

pub use monitor::{AlertThresholds, PositionAnalytics, RiskMonitor};

const MAX_DAILY_SAMPLES: usize = 252;
const MAX_TRADES: usize = 1000;

/// Hard limits. Percent values are 0-100.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_position_size_percent: Decimal,
    pub max_daily_loss_percent: Decimal,
    pub max_drawdown_percent: Decimal,
    /// Default stop-loss distance for intents without one
    pub stop_loss_percent: Decimal,
    /// Default take-profit distance for intents without one
    pub take_profit_percent: Decimal,
    /// Open positions allowed on the same side
    pub max_same_side_positions: usize,
    pub max_symbol_concentration_percent: Decimal,
    /// Aggregate stop risk that scores 100
    pub position_risk_limit_percent: Decimal,
    /// Risk score (0-100) that halts trading
    pub emergency_risk_score: u32,
    /// Daily return volatility above which sizes shrink
    pub volatility_threshold: f64,
    pub risk_free_rate: f64,
    pub kelly_min: f64,
    pub kelly_max: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_percent: Decimal::from(2),
            max_daily_loss_percent: Decimal::from(5),
            max_drawdown_percent: Decimal::from(15),
            stop_loss_percent: Decimal::from(2),
            take_profit_percent: Decimal::from(4),
            max_same_side_positions: 3,
            max_symbol_concentration_percent: Decimal::from(20),
            position_risk_limit_percent: Decimal::from(10),
            emergency_risk_score: 90,
            volatility_threshold: 0.05,
            risk_free_rate: 0.02,
            kelly_min: 0.1,
            kelly_max: 0.5,
        }
    }
}

/// Why a position was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Denial {
    #[error("trading halted: {0}")]
    TradingHalted(String),

    #[error("no capital: total value {0}")]
    NoCapital(Decimal),

    #[error("position is {percent}% of portfolio, max {limit}%")]
    PositionTooLarge { percent: Decimal, limit: Decimal },

    #[error("daily loss {loss}% reached limit {limit}%")]
    DailyLossLimit { loss: Decimal, limit: Decimal },

    #[error("drawdown {drawdown}% reached limit {limit}%")]
    DrawdownLimit { drawdown: Decimal, limit: Decimal },

    #[error("{open} {side} positions already open, max {limit}")]
    SameSideLimit {
        side: PositionSide,
        open: usize,
        limit: usize,
    },

    #[error("{symbol} exposure would be {percent}%, max {limit}%")]
    ConcentrationLimit {
        symbol: Symbol,
        percent: Decimal,
        limit: Decimal,
    },
}

/// Hard limit that should stop new trading
#[derive(Debug, Clone, PartialEq)]
pub enum HaltReason {
    Drawdown(Decimal),
    DailyLoss(Decimal),
    RiskScore(u32),
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Drawdown(dd) => write!(f, "drawdown {}%", dd.round_dp(2)),
            HaltReason::DailyLoss(loss) => write!(f, "daily loss {}%", loss.round_dp(2)),
            HaltReason::RiskScore(score) => write!(f, "risk score {}/100", score),
        }
    }
}

/// Point-in-time risk snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskMetrics {
    pub current_drawdown: Decimal,
    pub max_drawdown: Decimal,
    pub daily_loss: Decimal,
    /// Capital at risk to stop-losses, percent of total value
    pub position_risk: Decimal,
    pub var_95: Decimal,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    /// 0-100
    pub risk_score: u32,
}

/// One closed trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub pnl: Decimal,
    pub return_percent: f64,
    pub strategy: String,
    pub closed_at: DateTime<Utc>,
}

impl From<&Position> for TradeRecord {
    fn from(position: &Position) -> Self {
        Self {
            symbol: position.symbol.clone(),
            side: position.side,
            pnl: position.pnl,
            return_percent: position.pnl_percent.to_f64().unwrap_or(0.0),
            strategy: position.strategy.clone(),
            closed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub win_rate: f64,
    pub avg_return_percent: f64,
    pub best_trade: Decimal,
    pub worst_trade: Decimal,
}

/// Exposure of an admitted entry that has not reached the ledger yet
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub notional: Decimal,
}

struct RiskState {
    peak_balance: Decimal,
    max_drawdown: Decimal,
    day: NaiveDate,
    day_start_balance: Decimal,
    daily_balances: VecDeque<(NaiveDate, Decimal)>,
    daily_returns: VecDeque<f64>,
    trades: VecDeque<TradeRecord>,
}

/// Risk Gate
pub struct RiskGate {
    limits: RiskLimits,
    portfolio: Arc<Portfolio>,
    state: Mutex<RiskState>,
    halted: RwLock<Option<String>>,
    reserved: Mutex<HashMap<String, Reservation>>,
}

impl RiskGate {
    pub fn new(limits: RiskLimits, portfolio: Arc<Portfolio>) -> Self {
        let start = portfolio.initial_balance();
        Self {
            limits,
            portfolio,
            state: Mutex::new(RiskState {
                peak_balance: start,
                max_drawdown: Decimal::ZERO,
                day: Utc::now().date_naive(),
                day_start_balance: start,
                daily_balances: VecDeque::new(),
                daily_returns: VecDeque::new(),
                trades: VecDeque::new(),
            }),
            halted: RwLock::new(None),
            reserved: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Pre-trade check for a new position, counting outstanding reservations.
    pub fn check_admission(
        &self,
        symbol: &Symbol,
        side: Side,
        entry_price: Decimal,
        quantity: Decimal,
    ) -> Result<(), Denial> {
        let reserved = self.reserved.lock();
        self.evaluate(symbol, side, entry_price, quantity, &reserved)
    }

    /// Check and reserve in one step. The reservation is held under `key`
    /// until `release`. A halted gate surfaces as `CriticalRiskBreach`.
    pub fn admit(
        &self,
        key: &str,
        symbol: &Symbol,
        side: Side,
        entry_price: Decimal,
        quantity: Decimal,
    ) -> crate::core::Result<()> {
        let mut reserved = self.reserved.lock();
        match self.evaluate(symbol, side, entry_price, quantity, &reserved) {
            Ok(()) => {}
            Err(Denial::TradingHalted(reason)) => {
                return Err(crate::core::Error::CriticalRiskBreach(reason));
            }
            Err(denial) => return Err(denial.into()),
        }
        reserved.insert(
            key.to_string(),
            Reservation {
                symbol: symbol.clone(),
                side: PositionSide::from(side),
                notional: entry_price * quantity,
            },
        );
        Ok(())
    }

    /// Drop a reservation; `false` when there was none.
    pub fn release(&self, key: &str) -> bool {
        self.reserved.lock().remove(key).is_some()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.reserved.lock().values().cloned().collect()
    }

    fn evaluate(
        &self,
        symbol: &Symbol,
        side: Side,
        entry_price: Decimal,
        quantity: Decimal,
        reserved: &HashMap<String, Reservation>,
    ) -> Result<(), Denial> {
        if let Some(reason) = self.halted.read().clone() {
            return Err(Denial::TradingHalted(reason));
        }

        let stats = self.portfolio.stats();
        let total = stats.total_value;
        if total <= Decimal::ZERO {
            return Err(Denial::NoCapital(total));
        }

        let value = entry_price * quantity;
        let percent = value / total * Decimal::ONE_HUNDRED;
        if percent >= self.limits.max_position_size_percent {
            return Err(Denial::PositionTooLarge {
                percent: percent.round_dp(4),
                limit: self.limits.max_position_size_percent,
            });
        }

        let (drawdown, daily_loss) = self.observe(total, Utc::now());
        if daily_loss >= self.limits.max_daily_loss_percent {
            return Err(Denial::DailyLossLimit {
                loss: daily_loss.round_dp(4),
                limit: self.limits.max_daily_loss_percent,
            });
        }
        if drawdown >= self.limits.max_drawdown_percent {
            return Err(Denial::DrawdownLimit {
                drawdown: drawdown.round_dp(4),
                limit: self.limits.max_drawdown_percent,
            });
        }

        let positions = self.portfolio.positions();
        let position_side = PositionSide::from(side);
        let same_side = positions.iter().filter(|p| p.side == position_side).count()
            + reserved.values().filter(|r| r.side == position_side).count();
        if same_side >= self.limits.max_same_side_positions {
            return Err(Denial::SameSideLimit {
                side: position_side,
                open: same_side,
                limit: self.limits.max_same_side_positions,
            });
        }

        let exposure: Decimal = positions
            .iter()
            .filter(|p| &p.symbol == symbol)
            .map(Position::notional)
            .chain(
                reserved
                    .values()
                    .filter(|r| &r.symbol == symbol)
                    .map(|r| r.notional),
            )
            .sum();
        let concentration = (exposure + value) / total * Decimal::ONE_HUNDRED;
        if concentration >= self.limits.max_symbol_concentration_percent {
            return Err(Denial::ConcentrationLimit {
                symbol: symbol.clone(),
                percent: concentration.round_dp(4),
                limit: self.limits.max_symbol_concentration_percent,
            });
        }

        Ok(())
    }

    /// Quantity that risks `risk_amount` over `stop_distance`.
    pub fn size_position(
        &self,
        balance: Decimal,
        risk_amount: Decimal,
        stop_distance: Decimal,
    ) -> Decimal {
        if stop_distance <= Decimal::ZERO || balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let mut size = risk_amount / stop_distance;

        let trades = self.state.lock().trades.len();
        if trades >= metrics::KELLY_MIN_TRADES {
            let scale = self.kelly_fraction() / metrics::KELLY_BASELINE;
            size *= Decimal::from_f64_retain(scale).unwrap_or(Decimal::ONE);
        }

        let max_size =
            balance * self.limits.max_position_size_percent / Decimal::ONE_HUNDRED / stop_distance;
        size = size.min(max_size);

        let volatility = metrics::std_dev(&self.returns());
        if volatility > self.limits.volatility_threshold {
            let scale = self.limits.volatility_threshold / volatility;
            size *= Decimal::from_f64_retain(scale).unwrap_or(Decimal::ONE);
        }

        size.max(Decimal::ZERO).round_dp(8)
    }

    pub fn metrics(&self) -> RiskMetrics {
        self.metrics_at(Utc::now())
    }

    pub fn metrics_at(&self, now: DateTime<Utc>) -> RiskMetrics {
        let stats = self.portfolio.stats();
        let total = stats.total_value;
        let (current_drawdown, daily_loss) = self.observe(total, now);
        let position_risk = self.position_risk(total);
        let returns = self.returns();
        let max_drawdown = self.state.lock().max_drawdown;

        RiskMetrics {
            current_drawdown,
            max_drawdown,
            daily_loss,
            position_risk,
            var_95: metrics::value_at_risk(total, &returns, 0.95),
            sharpe_ratio: metrics::sharpe_ratio(&returns, self.limits.risk_free_rate),
            sortino_ratio: metrics::sortino_ratio(&returns, 0.0),
            calmar_ratio: metrics::calmar_ratio(&returns, max_drawdown),
            risk_score: self.risk_score(current_drawdown, daily_loss, position_risk),
        }
    }

    /// Hard limit currently crossed, if any.
    pub fn should_halt(&self) -> Option<HaltReason> {
        let m = self.metrics();
        if m.current_drawdown >= self.limits.max_drawdown_percent {
            Some(HaltReason::Drawdown(m.current_drawdown))
        } else if m.daily_loss >= self.limits.max_daily_loss_percent {
            Some(HaltReason::DailyLoss(m.daily_loss))
        } else if m.risk_score >= self.limits.emergency_risk_score {
            Some(HaltReason::RiskScore(m.risk_score))
        } else {
            None
        }
    }

    /// Refuse all admissions until `resume`.
    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("🛑 Trading halted: {}", reason);
        *self.halted.write() = Some(reason);
    }

    pub fn resume(&self) {
        if self.halted.write().take().is_some() {
            info!("▶️ Trading resumed");
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.read().is_some()
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halted.read().clone()
    }

    /// Sample today's total value into the daily history.
    pub fn record_balance(&self) {
        let total = self.portfolio.stats().total_value;
        self.record_balance_at(Utc::now().date_naive(), total);
    }

    /// Record the balance for `day`; only the first sample of a day counts.
    pub fn record_balance_at(&self, day: NaiveDate, balance: Decimal) {
        let mut state = self.state.lock();
        if state.daily_balances.back().is_some_and(|(d, _)| *d == day) {
            return;
        }
        if let Some(&(_, prev)) = state.daily_balances.back() {
            if !prev.is_zero() {
                let ret = ((balance - prev) / prev).to_f64().unwrap_or(0.0);
                state.daily_returns.push_back(ret);
            }
        }
        state.daily_balances.push_back((day, balance));

        while state.daily_balances.len() > MAX_DAILY_SAMPLES {
            state.daily_balances.pop_front();
        }
        while state.daily_returns.len() > MAX_DAILY_SAMPLES - 1 {
            state.daily_returns.pop_front();
        }
    }

    pub fn record_trade(&self, trade: TradeRecord) {
        let mut state = self.state.lock();
        state.trades.push_back(trade);
        while state.trades.len() > MAX_TRADES {
            state.trades.pop_front();
        }
    }

    pub fn kelly_fraction(&self) -> f64 {
        let returns: Vec<f64> = self.state.lock().trades.iter().map(|t| t.return_percent).collect();
        metrics::kelly_fraction(&returns, self.limits.kelly_min, self.limits.kelly_max)
    }

    pub fn performance_summary(&self) -> PerformanceSummary {
        let state = self.state.lock();
        let trades = &state.trades;
        if trades.is_empty() {
            return PerformanceSummary {
                total_trades: 0,
                win_rate: 0.0,
                avg_return_percent: 0.0,
                best_trade: Decimal::ZERO,
                worst_trade: Decimal::ZERO,
            };
        }

        let n = trades.len();
        let wins = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
        PerformanceSummary {
            total_trades: n,
            win_rate: wins as f64 / n as f64,
            avg_return_percent: trades.iter().map(|t| t.return_percent).sum::<f64>() / n as f64,
            best_trade: trades.iter().map(|t| t.pnl).max().unwrap_or_default(),
            worst_trade: trades.iter().map(|t| t.pnl).min().unwrap_or_default(),
        }
    }

    fn returns(&self) -> Vec<f64> {
        self.state.lock().daily_returns.iter().copied().collect()
    }

    /// Update peak and day boundary, return (drawdown %, daily loss %).
    fn observe(&self, current: Decimal, now: DateTime<Utc>) -> (Decimal, Decimal) {
        let mut state = self.state.lock();

        let today = now.date_naive();
        if today != state.day {
            state.day = today;
            state.day_start_balance = current;
        }
        if current > state.peak_balance {
            state.peak_balance = current;
        }

        let drawdown = if state.peak_balance > Decimal::ZERO {
            ((state.peak_balance - current) / state.peak_balance * Decimal::ONE_HUNDRED)
                .max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
        state.max_drawdown = state.max_drawdown.max(drawdown);

        let daily_loss = if state.day_start_balance > Decimal::ZERO {
            ((state.day_start_balance - current) / state.day_start_balance * Decimal::ONE_HUNDRED)
                .max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        (drawdown, daily_loss)
    }

    fn position_risk(&self, total: Decimal) -> Decimal {
        if total <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let at_risk: Decimal = self
            .portfolio
            .positions()
            .iter()
            .filter_map(|p| {
                let stop = p.stop_loss?;
                let risk = match p.side {
                    PositionSide::Long => (p.entry_price - stop) * p.quantity,
                    PositionSide::Short => (stop - p.entry_price) * p.quantity,
                };
                Some(risk.max(Decimal::ZERO))
            })
            .sum();
        at_risk / total * Decimal::ONE_HUNDRED
    }

    fn risk_score(&self, drawdown: Decimal, daily_loss: Decimal, position_risk: Decimal) -> u32 {
        let normalised = |value: Decimal, limit: Decimal| -> f64 {
            if limit <= Decimal::ZERO {
                return 100.0;
            }
            (value / limit * Decimal::ONE_HUNDRED).to_f64().unwrap_or(100.0).min(100.0)
        };
        let score = 0.4 * normalised(drawdown, self.limits.max_drawdown_percent)
            + 0.3 * normalised(daily_loss, self.limits.max_daily_loss_percent)
            + 0.3 * normalised(position_risk, self.limits.position_risk_limit_percent);
        score.clamp(0.0, 100.0) as u32
    }
}
