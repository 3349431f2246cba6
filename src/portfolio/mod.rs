//! Portfolio - Authoritative ledger of balances and open positions
//!
//! All mutation goes through one exclusive lock, so two opens/closes are never
//! interleaved and a failed check leaves nothing half-applied. Readers take the
//! shared side of the same lock and get owned snapshots back.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::core::{Balance, Error, PositionSide, Result, Symbol};

/// Positions are keyed by the entry order that opened them.
const POSITION_PREFIX: &str = "pos-";

pub fn position_id(entry_order_id: &str) -> String {
    format!("{}{}", POSITION_PREFIX, entry_order_id)
}

/// Entry order behind a position id, `None` for ids not minted by `position_id`.
pub fn entry_order_id(position_id: &str) -> Option<&str> {
    position_id.strip_prefix(POSITION_PREFIX)
}

/// Balance of one currency/token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub free: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
}

impl Asset {
    fn new(symbol: impl Into<String>, free: Decimal, locked: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            free,
            locked,
            total: free + locked,
        }
    }

    fn recompute(&mut self) {
        self.total = self.free + self.locked;
    }
}

/// Open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: Symbol,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub strategy: String,
    /// Last price PnL was computed against
    pub mark_price: Option<Decimal>,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
}

impl Position {
    pub fn new(
        id: impl Into<String>,
        symbol: Symbol,
        side: PositionSide,
        entry_price: Decimal,
        quantity: Decimal,
    ) -> Self {
        Self {
            id: id.into(),
            symbol,
            side,
            entry_price,
            quantity,
            stop_loss: None,
            take_profit: None,
            opened_at: Utc::now(),
            strategy: String::new(),
            mark_price: None,
            pnl: Decimal::ZERO,
            pnl_percent: Decimal::ZERO,
        }
    }

    pub fn with_brackets(
        mut self,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    /// Capital locked by the position
    pub fn notional(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    /// PnL if the position were closed at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }

    /// Recompute PnL against a mark price.
    pub fn update_pnl(&mut self, price: Decimal) {
        self.mark_price = Some(price);
        self.pnl = self.pnl_at(price);
        let notional = self.notional();
        self.pnl_percent = if notional.is_zero() {
            Decimal::ZERO
        } else {
            self.pnl / notional * Decimal::ONE_HUNDRED
        };
    }

    /// Price a programmatic close should use: the last mark, else entry.
    pub fn fallback_price(&self) -> Decimal {
        self.mark_price.unwrap_or(self.entry_price)
    }
}

/// Read-only aggregate view of the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioStats {
    /// Quote total plus unrealized PnL
    pub total_value: Decimal,
    pub available_balance: Decimal,
    pub locked_balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub roi_percent: Decimal,
    pub positions_count: usize,
    pub assets: HashMap<String, Balance>,
}

struct Ledger {
    assets: HashMap<String, Asset>,
    positions: HashMap<String, Position>,
}

/// Portfolio ledger
pub struct Portfolio {
    initial_balance: Decimal,
    quote_asset: String,
    ledger: RwLock<Ledger>,
}

impl Portfolio {
    /// New ledger holding `initial_balance` free in the quote asset.
    pub fn new(initial_balance: Decimal, quote_asset: impl Into<String>) -> Self {
        let quote_asset = quote_asset.into();
        let mut assets = HashMap::new();
        assets.insert(
            quote_asset.clone(),
            Asset::new(quote_asset.clone(), initial_balance, Decimal::ZERO),
        );
        Self {
            initial_balance,
            quote_asset,
            ledger: RwLock::new(Ledger {
                assets,
                positions: HashMap::new(),
            }),
        }
    }

    pub fn initial_balance(&self) -> Decimal {
        self.initial_balance
    }

    pub fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    /// Upsert an asset balance.
    pub fn update_asset(&self, symbol: &str, free: Decimal, locked: Decimal) -> Result<()> {
        if free < Decimal::ZERO || locked < Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "{}: free {} locked {}",
                symbol, free, locked
            )));
        }
        let mut ledger = self.ledger.write();
        ledger
            .assets
            .entry(symbol.to_string())
            .and_modify(|a| {
                a.free = free;
                a.locked = locked;
                a.recompute();
            })
            .or_insert_with(|| Asset::new(symbol, free, locked));
        debug!("Balance {}: {} free + {} locked", symbol, free, locked);
        Ok(())
    }

    /// Lock the notional and insert the position, or change nothing.
    pub fn open_position(&self, position: Position) -> Result<Position> {
        if position.entry_price <= Decimal::ZERO || position.quantity <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "position {}: price {} qty {}",
                position.id, position.entry_price, position.quantity
            )));
        }

        let mut ledger = self.ledger.write();
        if ledger.positions.contains_key(&position.id) {
            return Err(Error::DuplicatePosition(position.id));
        }

        let required = position.notional();
        let quote = ledger
            .assets
            .get_mut(&self.quote_asset)
            .ok_or(Error::InsufficientFunds {
                required,
                available: Decimal::ZERO,
            })?;
        if quote.free < required {
            warn!(
                "Insufficient funds for {}: required {}, available {}",
                position.id, required, quote.free
            );
            return Err(Error::InsufficientFunds {
                required,
                available: quote.free,
            });
        }

        quote.free -= required;
        quote.locked += required;
        quote.recompute();

        info!(
            "📈 Opened {} {} {} {} @ {}",
            position.id, position.side, position.quantity, position.symbol, position.entry_price
        );
        ledger.positions.insert(position.id.clone(), position.clone());
        Ok(position)
    }

    /// Realize PnL and release the locked notional.
    pub fn close_position(&self, id: &str, close_price: Decimal) -> Result<Position> {
        let mut ledger = self.ledger.write();
        let mut position = ledger
            .positions
            .remove(id)
            .ok_or_else(|| Error::PositionNotFound(id.to_string()))?;
        position.update_pnl(close_price);

        let notional = position.notional();
        let credit = (notional + position.pnl).max(Decimal::ZERO);
        if let Some(quote) = ledger.assets.get_mut(&self.quote_asset) {
            quote.locked = (quote.locked - notional).max(Decimal::ZERO);
            quote.free += credit;
            quote.recompute();
        }

        info!(
            "📉 Closed {} @ {}: PnL {} ({}%)",
            id,
            close_price,
            position.pnl,
            position.pnl_percent.round_dp(2)
        );
        Ok(position)
    }

    /// Recompute PnL of every position on `symbol`; returns how many moved.
    pub fn mark_price(&self, symbol: &Symbol, price: Decimal) -> usize {
        let mut ledger = self.ledger.write();
        let mut marked = 0;
        for position in ledger.positions.values_mut().filter(|p| &p.symbol == symbol) {
            position.update_pnl(price);
            marked += 1;
        }
        marked
    }

    pub fn stats(&self) -> PortfolioStats {
        let ledger = self.ledger.read();
        let (free, locked, quote_total) = ledger
            .assets
            .get(&self.quote_asset)
            .map(|a| (a.free, a.locked, a.total))
            .unwrap_or_default();
        let unrealized_pnl: Decimal = ledger.positions.values().map(|p| p.pnl).sum();
        let total_value = quote_total + unrealized_pnl;
        let total_pnl = total_value - self.initial_balance;
        let roi_percent = if self.initial_balance.is_zero() {
            Decimal::ZERO
        } else {
            total_pnl / self.initial_balance * Decimal::ONE_HUNDRED
        };

        PortfolioStats {
            total_value,
            available_balance: free,
            locked_balance: locked,
            unrealized_pnl,
            realized_pnl: total_value - self.initial_balance - unrealized_pnl,
            total_pnl,
            roi_percent,
            positions_count: ledger.positions.len(),
            assets: ledger
                .assets
                .values()
                .map(|a| {
                    (
                        a.symbol.clone(),
                        Balance {
                            asset: a.symbol.clone(),
                            free: a.free,
                            locked: a.locked,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.ledger.read().positions.values().cloned().collect();
        positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        positions
    }

    pub fn position(&self, id: &str) -> Option<Position> {
        self.ledger.read().positions.get(id).cloned()
    }

    pub fn has_positions(&self) -> bool {
        !self.ledger.read().positions.is_empty()
    }

    pub fn position_count(&self) -> usize {
        self.ledger.read().positions.len()
    }

    pub fn asset(&self, symbol: &str) -> Option<Asset> {
        self.ledger.read().assets.get(symbol).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn usdt(portfolio: &Portfolio) -> Asset {
        portfolio.asset("USDT").unwrap()
    }

    fn btc_long(id: &str, entry: &str, qty: &str) -> Position {
        Position::new(id, Symbol::new("BTCUSDT"), PositionSide::Long, dec(entry), dec(qty))
    }

    #[test]
    fn test_position_ids_map_back_to_entries() {
        let id = position_id("PAPER-000007");
        assert_eq!(id, "pos-PAPER-000007");
        assert_eq!(entry_order_id(&id), Some("PAPER-000007"));
        assert_eq!(entry_order_id("manual-1"), None);
    }

    #[test]
    fn test_open_close_long_scenario() {
        let portfolio = Portfolio::new(dec("10000"), "USDT");

        portfolio.open_position(btc_long("p1", "45000", "0.1")).unwrap();
        let quote = usdt(&portfolio);
        assert_eq!(quote.free, dec("5500"));
        assert_eq!(quote.locked, dec("4500"));

        let closed = portfolio.close_position("p1", dec("46000")).unwrap();
        assert_eq!(closed.pnl, dec("100"));
        let quote = usdt(&portfolio);
        assert_eq!(quote.free, dec("10100"));
        assert_eq!(quote.locked, Decimal::ZERO);
        assert_eq!(quote.total, dec("10100"));
        assert!(!portfolio.has_positions());

        let stats = portfolio.stats();
        assert_eq!(stats.realized_pnl, dec("100"));
        assert_eq!(stats.roi_percent, dec("1"));
    }

    #[test]
    fn test_short_pnl() {
        let portfolio = Portfolio::new(dec("10000"), "USDT");
        let short =
            Position::new("s1", Symbol::new("ETHUSDT"), PositionSide::Short, dec("3000"), dec("1"));
        portfolio.open_position(short).unwrap();
        let closed = portfolio.close_position("s1", dec("2900")).unwrap();
        assert_eq!(closed.pnl, dec("100"));
        assert_eq!(usdt(&portfolio).free, dec("10100"));
    }

    #[test]
    fn test_insufficient_funds_changes_nothing() {
        let portfolio = Portfolio::new(dec("1000"), "USDT");
        let err = portfolio.open_position(btc_long("p1", "45000", "0.1")).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(usdt(&portfolio).free, dec("1000"));
        assert_eq!(usdt(&portfolio).locked, Decimal::ZERO);
        assert!(portfolio.position("p1").is_none());
    }

    #[test]
    fn test_close_unknown_position() {
        let portfolio = Portfolio::new(dec("1000"), "USDT");
        let err = portfolio.close_position("nope", dec("1")).unwrap_err();
        assert!(matches!(err, Error::PositionNotFound(id) if id == "nope"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let portfolio = Portfolio::new(dec("10000"), "USDT");
        portfolio.open_position(btc_long("p1", "100", "1")).unwrap();
        let err = portfolio.open_position(btc_long("p1", "100", "1")).unwrap_err();
        assert!(matches!(err, Error::DuplicatePosition(_)));
        assert_eq!(usdt(&portfolio).locked, dec("100"));
    }

    #[test]
    fn test_loss_beyond_margin_never_goes_negative() {
        let portfolio = Portfolio::new(dec("100"), "USDT");
        let short =
            Position::new("s1", Symbol::new("ETHUSDT"), PositionSide::Short, dec("100"), dec("1"));
        portfolio.open_position(short).unwrap();
        portfolio.close_position("s1", dec("350")).unwrap();
        let quote = usdt(&portfolio);
        assert_eq!(quote.free, Decimal::ZERO);
        assert_eq!(quote.locked, Decimal::ZERO);
    }

    #[test]
    fn test_unrealized_pnl_from_mark() {
        let portfolio = Portfolio::new(dec("10000"), "USDT");
        portfolio.open_position(btc_long("p1", "45000", "0.1")).unwrap();
        assert_eq!(portfolio.mark_price(&Symbol::new("BTCUSDT"), dec("44000")), 1);

        let stats = portfolio.stats();
        assert_eq!(stats.unrealized_pnl, dec("-100"));
        assert_eq!(stats.total_value, dec("9900"));
        assert_eq!(stats.realized_pnl, Decimal::ZERO);
        assert_eq!(stats.positions_count, 1);
        assert_eq!(portfolio.position("p1").unwrap().pnl_percent.round_dp(4), dec("-2.2222"));
    }

    #[test]
    fn test_round_trip_keeps_free_balance() {
        let portfolio = Portfolio::new(dec("10000"), "USDT");
        portfolio.open_position(btc_long("p1", "200", "5")).unwrap();
        let free_while_open = usdt(&portfolio).free;
        portfolio.close_position("p1", dec("200")).unwrap();
        portfolio.open_position(btc_long("p2", "200", "5")).unwrap();
        assert_eq!(usdt(&portfolio).free, free_while_open);
    }

    #[test]
    fn test_ledger_conservation_sequence() {
        let portfolio = Portfolio::new(dec("10000"), "USDT");
        let mut realized = Decimal::ZERO;

        for (i, (entry, close)) in [("100", "110"), ("250", "240"), ("80", "80"), ("500", "530")]
            .iter()
            .enumerate()
        {
            let id = format!("p{i}");
            portfolio.open_position(btc_long(&id, entry, "2")).unwrap();
            realized += portfolio.close_position(&id, dec(close)).unwrap().pnl;
        }
        portfolio.open_position(btc_long("held", "1000", "1")).unwrap();

        let quote = usdt(&portfolio);
        assert_eq!(quote.free + quote.locked, dec("10000") + realized);
        assert_eq!(quote.locked, dec("1000"));
    }

    #[test]
    fn test_negative_asset_update_rejected() {
        let portfolio = Portfolio::new(dec("10000"), "USDT");
        assert!(portfolio.update_asset("BTC", dec("-1"), Decimal::ZERO).is_err());
        portfolio.update_asset("BTC", dec("0.5"), dec("0.25")).unwrap();
        assert_eq!(portfolio.asset("BTC").unwrap().total, dec("0.75"));
    }

    #[test]
    fn test_concurrent_opens_never_overdraw() {
        let portfolio = Arc::new(Portfolio::new(dec("1000"), "USDT"));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let portfolio = portfolio.clone();
                std::thread::spawn(move || {
                    portfolio
                        .open_position(btc_long(&format!("p{i}"), "100", "1"))
                        .is_ok()
                })
            })
            .collect();
        let opened = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();

        assert_eq!(opened, 10);
        let quote = usdt(&portfolio);
        assert_eq!(quote.free, Decimal::ZERO);
        assert_eq!(quote.locked, dec("1000"));
    }
}
