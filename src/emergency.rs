//! Emergency closer - circuit breaker that unwinds every open position
//!
//! Only one sweep runs at a time. Positions are closed concurrently, each with
//! a bounded number of attempts, and the sweep always reports one aggregate
//! `EmergencyStop` event whatever the outcome. A position's resting child
//! orders are cancelled before its exit is sent.

use futures::future::join_all;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::EmergencyConfig;
use crate::core::{
    ChildOrders, Error, ExchangeConnector, Order, OrderRequest, OrderStatus, Result, Symbol,
};
use crate::events::{EventBus, EventKind, EventType, PositionClosed};
use crate::portfolio::{Portfolio, Position, entry_order_id};

const SOURCE: &str = "emergency_closer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    Success,
    Partial,
    Failed,
    NothingToClose,
}

/// Result of closing one position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseOutcome {
    pub position_id: String,
    pub symbol: Symbol,
    pub closed: bool,
    pub close_price: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Aggregate result of a sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseReport {
    pub reason: String,
    pub status: CloseStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub outcomes: Vec<CloseOutcome>,
}

impl CloseReport {
    fn from_outcomes(reason: &str, outcomes: Vec<CloseOutcome>) -> Self {
        let total = outcomes.len();
        let succeeded = outcomes.iter().filter(|o| o.closed).count();
        let failed = total - succeeded;
        let status = match (total, failed) {
            (0, _) => CloseStatus::NothingToClose,
            (_, 0) => CloseStatus::Success,
            (t, f) if t == f => CloseStatus::Failed,
            _ => CloseStatus::Partial,
        };
        Self {
            reason: reason.to_string(),
            status,
            total,
            succeeded,
            failed,
            errors: outcomes
                .iter()
                .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.position_id, e)))
                .collect(),
            outcomes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloserStatus {
    pub closing: bool,
    pub attempts: HashMap<String, u32>,
    pub venue_available: bool,
    pub open_positions: usize,
}

/// Resets the closing flag however the sweep ends.
struct ClosingGuard<'a>(&'a AtomicBool);

impl Drop for ClosingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct EmergencyCloser {
    portfolio: Arc<Portfolio>,
    venue: Option<Arc<dyn ExchangeConnector>>,
    orders: Option<Arc<dyn ChildOrders>>,
    bus: EventBus,
    config: EmergencyConfig,
    closing: AtomicBool,
    attempts: Mutex<HashMap<String, u32>>,
}

impl EmergencyCloser {
    pub fn new(
        portfolio: Arc<Portfolio>,
        venue: Option<Arc<dyn ExchangeConnector>>,
        orders: Option<Arc<dyn ChildOrders>>,
        bus: EventBus,
        config: EmergencyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            portfolio,
            venue,
            orders,
            bus,
            config,
            closing: AtomicBool::new(false),
            attempts: Mutex::new(HashMap::new()),
        })
    }

    /// Sweep on critical risk alerts and critical system errors.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let closer = self.clone();
        bus.subscribe(EventType::RiskAlert, SOURCE, move |event| {
            let closer = closer.clone();
            async move {
                if let EventKind::RiskAlert(alert) = &event.kind {
                    if alert.is_critical() {
                        closer.sweep(&format!("risk alert: {}", alert.message)).await?;
                    }
                }
                anyhow::Ok(())
            }
        });

        let closer = self.clone();
        bus.subscribe(EventType::SystemError, SOURCE, move |event| {
            let closer = closer.clone();
            async move {
                if let EventKind::SystemError(err) = &event.kind {
                    if err.critical {
                        closer
                            .sweep(&format!("{}: {}", err.component, err.message))
                            .await?;
                    }
                }
                anyhow::Ok(())
            }
        });
    }

    /// `close_all` that treats a sweep already in progress as done.
    async fn sweep(&self, reason: &str) -> Result<()> {
        match self.close_all(reason).await {
            Ok(_) | Err(Error::EmergencyInProgress) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Close every open position.
    pub async fn close_all(&self, reason: &str) -> Result<CloseReport> {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Emergency close already in progress");
            return Err(Error::EmergencyInProgress);
        }
        let _guard = ClosingGuard(&self.closing);

        let positions = self.portfolio.positions();
        error!("🚨 EMERGENCY CLOSE: {} positions ({})", positions.len(), reason);

        let outcomes =
            join_all(positions.into_iter().map(|p| self.close_with_retries(p, reason))).await;
        let report = CloseReport::from_outcomes(reason, outcomes);

        match report.status {
            CloseStatus::Success | CloseStatus::NothingToClose => {
                info!("✅ Emergency close finished: {}/{} closed", report.succeeded, report.total)
            }
            _ => error!(
                "❌ Emergency close incomplete: {}/{} closed, errors: {:?}",
                report.succeeded, report.total, report.errors
            ),
        }

        if let Err(e) = self.bus.emit(SOURCE, EventKind::EmergencyStop(report.clone())) {
            warn!("EmergencyStop not published: {}", e);
        }
        Ok(report)
    }

    /// Close one position with the same retry logic as a sweep.
    pub async fn force_close(&self, position_id: &str, reason: &str) -> Result<CloseOutcome> {
        let position = self
            .portfolio
            .position(position_id)
            .ok_or_else(|| Error::PositionNotFound(position_id.to_string()))?;
        warn!("Force closing {} ({})", position_id, reason);
        Ok(self.close_with_retries(position, reason).await)
    }

    pub fn status(&self) -> CloserStatus {
        CloserStatus {
            closing: self.closing.load(Ordering::Acquire),
            attempts: self.attempts.lock().clone(),
            venue_available: self.venue.is_some(),
            open_positions: self.portfolio.position_count(),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Clear attempt counters. Refused while a sweep is running; the closing
    /// flag is only ever cleared by the sweep itself.
    pub fn reset(&self) -> Result<()> {
        if self.is_closing() {
            warn!("Emergency closer reset refused: sweep in progress");
            return Err(Error::EmergencyInProgress);
        }
        self.attempts.lock().clear();
        info!("Emergency closer reset");
        Ok(())
    }

    async fn close_with_retries(&self, position: Position, reason: &str) -> CloseOutcome {
        let max = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max {
            *self.attempts.lock().entry(position.id.clone()).or_insert(0) += 1;
            info!("🔄 Closing {} attempt {}/{}", position.id, attempt, max);

            match self.close_once(&position).await {
                Ok(closed) => {
                    let close_price = closed.mark_price.unwrap_or(position.entry_price);
                    info!("✅ {} closed @ {} (PnL {})", closed.id, close_price, closed.pnl);
                    let outcome = CloseOutcome {
                        position_id: closed.id.clone(),
                        symbol: closed.symbol.clone(),
                        closed: true,
                        close_price: Some(close_price),
                        pnl: Some(closed.pnl),
                        attempts: attempt,
                        error: None,
                    };
                    let event = EventKind::PositionClosed(PositionClosed {
                        pnl: closed.pnl,
                        position: closed,
                        close_price,
                        reason: format!("emergency: {}", reason),
                    });
                    if let Err(e) = self.bus.emit(SOURCE, event) {
                        warn!("PositionClosed not published: {}", e);
                    }
                    return outcome;
                }
                Err(Error::PositionNotFound(_)) => {
                    info!("{} already closed elsewhere", position.id);
                    return CloseOutcome {
                        position_id: position.id.clone(),
                        symbol: position.symbol.clone(),
                        closed: true,
                        close_price: None,
                        pnl: None,
                        attempts: attempt,
                        error: None,
                    };
                }
                Err(e) => {
                    warn!("Attempt {} to close {} failed: {}", attempt, position.id, e);
                    last_error = e.to_string();
                    if attempt < max {
                        tokio::time::sleep(self.config.retry_delay() * attempt).await;
                    }
                }
            }
        }

        error!("❌ Failed to close {} after {} attempts", position.id, max);
        CloseOutcome {
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            closed: false,
            close_price: None,
            pnl: None,
            attempts: max,
            error: Some(last_error),
        }
    }

    async fn close_once(&self, position: &Position) -> Result<Position> {
        self.cancel_children(position).await;
        let price = match &self.venue {
            Some(venue) => self.market_exit(venue.as_ref(), position).await?,
            None => self
                .portfolio
                .position(&position.id)
                .ok_or_else(|| Error::PositionNotFound(position.id.clone()))?
                .fallback_price(),
        };
        self.portfolio.close_position(&position.id, price)
    }

    /// Cancel stop-loss, take-profit and pending exits hanging off the
    /// position's entry order.
    async fn cancel_children(&self, position: &Position) {
        let Some(orders) = &self.orders else {
            return;
        };
        let Some(entry_id) = entry_order_id(&position.id) else {
            return;
        };
        match self.timed(orders.cancel_children(entry_id)).await {
            Ok(0) => {}
            Ok(n) => info!("Cancelled {} resting orders of {} before the exit", n, position.id),
            Err(e) => warn!("Resting orders of {} not cancelled: {}", position.id, e),
        }
    }

    /// Opposing market order, polled until filled. Returns the fill price.
    async fn market_exit(
        &self,
        venue: &dyn ExchangeConnector,
        position: &Position,
    ) -> Result<Decimal> {
        if self.portfolio.position(&position.id).is_none() {
            return Err(Error::PositionNotFound(position.id.clone()));
        }

        let request = OrderRequest::market(
            position.symbol.clone(),
            position.side.closing_side(),
            position.quantity,
        );
        let mut order = self.timed(venue.place_order(&request)).await?;
        let deadline = Instant::now() + self.config.fill_timeout();

        loop {
            match order.status {
                OrderStatus::Filled => {
                    return order
                        .execution_price()
                        .ok_or_else(|| Error::Venue(format!("fill of {} without price", order.id)));
                }
                status if status.is_terminal() => {
                    return Err(Error::VenueRejected(format!("exit order {} {}", order.id, status)));
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                self.abandon(venue, &order).await;
                return Err(Error::VenueTimeout(format!(
                    "exit order {} not filled within {:?}",
                    order.id,
                    self.config.fill_timeout()
                )));
            }
            tokio::time::sleep(self.config.fill_poll()).await;

            match self.timed(venue.get_order(&order.id, &order.symbol)).await {
                Ok(Some(latest)) => order = latest,
                Ok(None) => warn!("Exit order {} unknown to venue", order.id),
                Err(e) => warn!("Polling exit order {} failed: {}", order.id, e),
            }
        }
    }

    async fn abandon(&self, venue: &dyn ExchangeConnector, order: &Order) {
        match self.timed(venue.cancel_order(&order.id, &order.symbol)).await {
            Ok(true) => info!("Cancelled unfilled exit order {}", order.id),
            Ok(false) => warn!("Venue refused to cancel exit order {}", order.id),
            Err(e) => warn!("Cancel of exit order {} failed: {}", order.id, e),
        }
    }

    async fn timed<T>(&self, call: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.venue_timeout();
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| Error::VenueTimeout(format!("venue call after {:?}", limit)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrdersConfig;
    use crate::core::{Balance, PositionSide, Side};
    use crate::events::{AlertKind, AlertLevel, Event, RiskAlert};
    use crate::exchanges::PaperExchange;
    use crate::execution::{OrderManager, OrderRole, OrderSpec};
    use async_trait::async_trait;
    use std::time::Duration;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn portfolio_with(positions: &[(&str, &str, PositionSide, &str, &str)]) -> Arc<Portfolio> {
        let portfolio = Arc::new(Portfolio::new(dec("100000"), "USDT"));
        for (id, symbol, side, entry, qty) in positions {
            portfolio
                .open_position(Position::new(
                    *id,
                    Symbol::new(*symbol),
                    *side,
                    dec(entry),
                    dec(qty),
                ))
                .unwrap();
        }
        portfolio
    }

    fn without_venue(portfolio: Arc<Portfolio>, bus: EventBus) -> Arc<EmergencyCloser> {
        EmergencyCloser::new(portfolio, None, None, bus, EmergencyConfig::default())
    }

    fn through(portfolio: Arc<Portfolio>, venue: Arc<PaperExchange>) -> Arc<EmergencyCloser> {
        EmergencyCloser::new(
            portfolio,
            Some(venue),
            None,
            EventBus::default(),
            EmergencyConfig::default(),
        )
    }

    fn recorder(bus: &EventBus, event_type: EventType) -> Arc<Mutex<Vec<Arc<Event>>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe(event_type, "recorder", move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().push(event);
                Ok(())
            }
        });
        events
    }

    #[tokio::test]
    async fn test_close_all_without_venue_uses_marks() {
        let portfolio = portfolio_with(&[
            ("pos-a", "BTCUSDT", PositionSide::Long, "45000", "0.1"),
            ("pos-b", "ETHUSDT", PositionSide::Short, "3000", "1"),
        ]);
        portfolio.mark_price(&Symbol::new("BTCUSDT"), dec("46000"));

        let bus = EventBus::default();
        let closed = recorder(&bus, EventType::PositionClosed);
        let stops = recorder(&bus, EventType::EmergencyStop);
        bus.start();

        let closer = without_venue(portfolio.clone(), bus.clone());
        let report = closer.close_all("test").await.unwrap();

        assert_eq!(report.status, CloseStatus::Success);
        assert_eq!((report.total, report.succeeded, report.failed), (2, 2, 0));
        assert!(!portfolio.has_positions());
        // BTC at its mark (+100), ETH never marked closes flat
        assert_eq!(portfolio.asset("USDT").unwrap().free, dec("100100"));
        assert!(!closer.is_closing());

        bus.stop().await;
        assert_eq!(closed.lock().len(), 2);
        assert_eq!(stops.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_through_venue() {
        let portfolio = portfolio_with(&[("pos-a", "BTCUSDT", PositionSide::Long, "45000", "0.1")]);
        let venue = Arc::new(PaperExchange::new());
        venue.set_price(&Symbol::new("BTCUSDT"), dec("44000"));

        let closer = through(portfolio.clone(), venue.clone());
        let report = closer.close_all("drawdown").await.unwrap();

        assert_eq!(report.status, CloseStatus::Success);
        assert_eq!(report.outcomes[0].close_price, Some(dec("44000")));
        assert_eq!(report.outcomes[0].pnl, Some(dec("-100")));
        assert_eq!(venue.placed_count(), 1);
        assert_eq!(portfolio.asset("USDT").unwrap().free, dec("99900"));
    }

    #[tokio::test]
    async fn test_nothing_to_close() {
        let closer = without_venue(portfolio_with(&[]), EventBus::default());
        let report = closer.close_all("idle").await.unwrap();
        assert_eq!(report.status, CloseStatus::NothingToClose);
        assert_eq!(report.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_close_all_is_rejected() {
        let portfolio = portfolio_with(&[("pos-a", "BTCUSDT", PositionSide::Long, "100", "1")]);
        let venue = Arc::new(PaperExchange::new());
        venue.set_price(&Symbol::new("BTCUSDT"), dec("100"));
        venue.set_latency(Duration::from_millis(500));

        let closer = through(portfolio.clone(), venue);

        let first = {
            let closer = closer.clone();
            tokio::spawn(async move { closer.close_all("first").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(closer.is_closing());

        let second = closer.close_all("second").await;
        assert!(matches!(second, Err(Error::EmergencyInProgress)));
        // Reset cannot clear the flag under a running sweep
        assert!(matches!(closer.reset(), Err(Error::EmergencyInProgress)));
        assert!(closer.is_closing());
        assert!(matches!(
            closer.close_all("third").await,
            Err(Error::EmergencyInProgress)
        ));

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.status, CloseStatus::Success);
        assert!(!closer.is_closing());
        assert!(!portfolio.has_positions());
        assert!(closer.reset().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_is_reported() {
        let portfolio = portfolio_with(&[
            ("pos-a", "BTCUSDT", PositionSide::Long, "100", "1"),
            ("pos-b", "ETHUSDT", PositionSide::Long, "100", "1"),
        ]);
        let venue = Arc::new(PaperExchange::new());
        // ETH has no market, its exit never fills
        venue.set_price(&Symbol::new("BTCUSDT"), dec("101"));

        let closer = through(portfolio.clone(), venue.clone());
        let report = closer.close_all("partial").await.unwrap();

        assert_eq!(report.status, CloseStatus::Partial);
        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("pos-b"));
        assert!(portfolio.position("pos-b").is_some());
        assert!(portfolio.position("pos-a").is_none());

        let status = closer.status();
        assert!(!status.closing);
        assert_eq!(status.attempts.get("pos-b"), Some(&3));
        assert_eq!(status.attempts.get("pos-a"), Some(&1));
        assert_eq!(status.open_positions, 1);
        // Unfilled exits were cancelled
        assert!(venue.open_orders(&Symbol::new("ETHUSDT")).is_empty());

        closer.reset().unwrap();
        assert!(closer.status().attempts.is_empty());
    }

    #[tokio::test]
    async fn test_force_close() {
        let portfolio = portfolio_with(&[("pos-a", "BTCUSDT", PositionSide::Short, "100", "2")]);
        portfolio.mark_price(&Symbol::new("BTCUSDT"), dec("90"));
        let closer = without_venue(portfolio.clone(), EventBus::default());

        let err = closer.force_close("missing", "manual").await.unwrap_err();
        assert!(matches!(err, Error::PositionNotFound(_)));

        let outcome = closer.force_close("pos-a", "manual").await.unwrap();
        assert!(outcome.closed);
        assert_eq!(outcome.pnl, Some(dec("20")));
    }

    #[tokio::test]
    async fn test_attach_closes_on_critical_alert_only() {
        let portfolio = portfolio_with(&[("pos-a", "BTCUSDT", PositionSide::Long, "100", "1")]);
        let bus = EventBus::default();
        let stops = recorder(&bus, EventType::EmergencyStop);
        let closer = without_venue(portfolio.clone(), bus.clone());
        closer.attach(&bus);
        bus.start();

        let alert = |level| {
            EventKind::RiskAlert(RiskAlert {
                kind: AlertKind::CriticalRiskScore,
                level,
                message: "score".into(),
                value: 95.0,
                threshold: 80.0,
                symbol: None,
            })
        };
        bus.emit("test", alert(AlertLevel::Warning)).unwrap();
        bus.emit("test", alert(AlertLevel::Critical)).unwrap();
        bus.stop().await;

        assert!(!portfolio.has_positions());
        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        match &stops[0].kind {
            EventKind::EmergencyStop(report) => assert!(report.reason.contains("score")),
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Paper venue that logs the order of submissions and cancels.
    struct Journal {
        paper: Arc<PaperExchange>,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ExchangeConnector for Journal {
        async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
            self.calls.lock().push("place");
            self.paper.place_order(request).await
        }

        async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<bool> {
            self.calls.lock().push("cancel");
            self.paper.cancel_order(order_id, symbol).await
        }

        async fn get_order(&self, order_id: &str, symbol: &Symbol) -> Result<Option<Order>> {
            self.paper.get_order(order_id, symbol).await
        }

        async fn get_balance(&self) -> Result<HashMap<String, Balance>> {
            self.paper.get_balance().await
        }

        fn name(&self) -> &str {
            "journal"
        }
    }

    #[tokio::test]
    async fn test_close_all_cancels_resting_brackets_before_the_exit() {
        let btc = Symbol::new("BTCUSDT");
        let portfolio =
            portfolio_with(&[("pos-ENTRY-1", "BTCUSDT", PositionSide::Long, "100", "1")]);
        let paper = Arc::new(PaperExchange::new());
        paper.set_price(&btc, dec("100"));
        let venue = Arc::new(Journal {
            paper: paper.clone(),
            calls: Mutex::new(Vec::new()),
        });

        let bus = EventBus::default();
        let manager = OrderManager::new(
            venue.clone(),
            bus.clone(),
            portfolio.clone(),
            &OrdersConfig::default(),
        );
        let entry = OrderSpec::market(btc.clone(), Side::Buy, Decimal::ONE);
        for (role, price) in [(OrderRole::StopLoss, "95"), (OrderRole::TakeProfit, "110")] {
            manager
                .place_order(entry.bracket(role, dec(price), Decimal::ONE, "ENTRY-1"))
                .await
                .unwrap();
        }
        assert_eq!(paper.open_orders(&btc).len(), 2);
        venue.calls.lock().clear();

        let closer = EmergencyCloser::new(
            portfolio.clone(),
            Some(venue.clone()),
            Some(manager.clone()),
            bus,
            EmergencyConfig::default(),
        );
        let report = closer.close_all("critical").await.unwrap();

        assert_eq!(report.status, CloseStatus::Success);
        assert!(!portfolio.has_positions());
        assert_eq!(*venue.calls.lock(), vec!["cancel", "cancel", "place"]);
        assert!(paper.open_orders(&btc).is_empty());
        assert!(manager.active_orders().is_empty());
        assert!(manager
            .archived_orders()
            .iter()
            .all(|o| o.status() == OrderStatus::Cancelled));
    }
}
