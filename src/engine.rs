//! Engine - wires the ledger, risk gate, order manager and emergency closer
//! together through the event bus.
//!
//! intent -> admission (reserved) -> placement; fill -> ledger (released);
//! price -> mark and alerts; closed position -> trade history; periodic sweep
//! -> alerts and halt; critical alert -> emergency close.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{ChildOrders, Error, ExchangeConnector, PositionSide, Result, Side};
use crate::emergency::{CloseReport, EmergencyCloser};
use crate::events::{
    AdmissionDenied, AlertKind, AlertLevel, CancelReason, Event, EventBus, EventKind, EventType,
    OrderFilled, PositionClosed, PriceTick, RiskAlert, SystemError, TradeIntent,
};
use crate::execution::{ManagedOrder, OrderManager, OrderRole, OrderSpec};
use crate::portfolio::{Portfolio, Position, entry_order_id, position_id};
use crate::risk::{HaltReason, RiskGate, RiskMetrics, RiskMonitor, TradeRecord};

const SOURCE: &str = "engine";

pub struct Engine {
    config: Config,
    bus: EventBus,
    venue: Arc<dyn ExchangeConnector>,
    portfolio: Arc<Portfolio>,
    risk: Arc<RiskGate>,
    monitor: RiskMonitor,
    orders: Arc<OrderManager>,
    closer: Arc<EmergencyCloser>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    risk_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: Config, venue: Arc<dyn ExchangeConnector>) -> Arc<Self> {
        let bus = EventBus::new(config.bus.stop_timeout());
        let portfolio = Arc::new(Portfolio::new(
            config.app.initial_balance,
            config.app.quote_asset.clone(),
        ));
        let risk = Arc::new(RiskGate::new(config.risk.clone(), portfolio.clone()));
        let monitor = RiskMonitor::new(config.alerts.clone());
        let orders =
            OrderManager::new(venue.clone(), bus.clone(), portfolio.clone(), &config.orders);
        let closer = EmergencyCloser::new(
            portfolio.clone(),
            Some(venue.clone()),
            Some(orders.clone() as Arc<dyn ChildOrders>),
            bus.clone(),
            config.emergency.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            config,
            bus,
            venue,
            portfolio,
            risk,
            monitor,
            orders,
            closer,
            started: AtomicBool::new(false),
            shutdown,
            risk_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn venue(&self) -> &Arc<dyn ExchangeConnector> {
        &self.venue
    }

    pub fn portfolio(&self) -> &Arc<Portfolio> {
        &self.portfolio
    }

    pub fn risk(&self) -> &Arc<RiskGate> {
        &self.risk
    }

    pub fn orders(&self) -> &Arc<OrderManager> {
        &self.orders
    }

    pub fn closer(&self) -> &Arc<EmergencyCloser> {
        &self.closer
    }

    /// Subscribe the handlers, start the bus, the order monitor and the risk loop.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("Engine already started");
            return;
        }

        self.on(EventType::SignalGenerated, |engine, event| async move {
            if let EventKind::SignalGenerated(intent) = &event.kind {
                engine.on_intent(intent).await;
            }
            anyhow::Ok(())
        });
        self.on(EventType::OrderFilled, |engine, event| async move {
            if let EventKind::OrderFilled(fill) = &event.kind {
                engine.on_fill(fill);
            }
            anyhow::Ok(())
        });
        self.on(EventType::OrderCancelled, |engine, event| async move {
            if let EventKind::OrderCancelled(cancelled) = &event.kind {
                // A replacement carries the same client id
                if cancelled.reason != CancelReason::Replaced {
                    engine.release(cancelled.client_id.as_deref());
                }
            }
            anyhow::Ok(())
        });
        self.on(EventType::OrderRejected, |engine, event| async move {
            if let EventKind::OrderRejected(rejected) = &event.kind {
                engine.release(rejected.client_id.as_deref());
            }
            anyhow::Ok(())
        });
        self.on(EventType::PriceUpdate, |engine, event| async move {
            if let EventKind::PriceUpdate(tick) = &event.kind {
                engine.on_price(tick);
            }
            anyhow::Ok(())
        });
        self.on(EventType::PositionClosed, |engine, event| async move {
            if let EventKind::PositionClosed(closed) = &event.kind {
                engine.on_position_closed(closed).await;
            }
            anyhow::Ok(())
        });
        self.on(EventType::EmergencyStop, |engine, event| async move {
            if let EventKind::EmergencyStop(report) = &event.kind {
                engine.on_emergency_stop(report);
            }
            anyhow::Ok(())
        });
        self.closer.attach(&self.bus);

        self.bus.start();
        self.orders.start();

        let this = self.clone();
        let shutdown = self.shutdown.subscribe();
        *self.risk_task.lock() = Some(tokio::spawn(async move { this.risk_loop(shutdown).await }));

        info!(
            "🚀 Engine started on {} with {} {}",
            self.venue.name(),
            self.portfolio.initial_balance(),
            self.portfolio.quote_asset()
        );
    }

    /// Stop the risk loop, then the order manager, then drain the bus.
    ///
    /// Positions still open when the order manager stops are unwound by the
    /// emergency closer while the bus drains.
    pub async fn shutdown(&self) {
        info!("⏹️ Engine shutting down");
        let _ = self.shutdown.send(true);
        let task = self.risk_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Risk loop failed: {}", e);
            }
        }

        self.orders.stop().await;
        self.bus.stop().await;

        let summary = self.risk.performance_summary();
        let stats = self.portfolio.stats();
        info!(
            "📊 {} trades, win rate {:.1}%, total value {} (ROI {}%), {} positions open",
            summary.total_trades,
            summary.win_rate * 100.0,
            stats.total_value,
            stats.roi_percent.round_dp(2),
            stats.positions_count
        );
    }

    /// Close a position with a market exit through the order manager.
    pub async fn close_position(&self, id: &str) -> Result<ManagedOrder> {
        let position = self
            .portfolio
            .position(id)
            .ok_or_else(|| Error::PositionNotFound(id.to_string()))?;
        let entry_id =
            entry_order_id(id).ok_or_else(|| Error::PositionNotFound(id.to_string()))?;

        let mut spec = OrderSpec::market(
            position.symbol.clone(),
            position.side.closing_side(),
            position.quantity,
        )
        .with_strategy(position.strategy.clone());
        spec.role = OrderRole::Exit;
        spec.parent_order_id = Some(entry_id.to_string());

        info!("Closing {} with a market exit", id);
        self.orders.place_order(spec).await
    }

    /// Sample the balance, raise alerts, halt on a hard limit.
    pub fn risk_sweep(&self) -> RiskMetrics {
        self.risk.record_balance();
        let metrics = self.risk.metrics();
        debug!(
            "Risk sweep: drawdown {}% daily loss {}% score {}",
            metrics.current_drawdown.round_dp(2),
            metrics.daily_loss.round_dp(2),
            metrics.risk_score
        );

        for alert in self
            .monitor
            .check_metrics(&metrics, self.portfolio.position_count())
        {
            warn!("⚠️ {}", alert.message);
            self.publish(EventKind::RiskAlert(alert));
        }

        if !self.risk.is_halted() {
            if let Some(reason) = self.risk.should_halt() {
                self.risk.halt(reason.to_string());
                let limits = self.risk.limits();
                let (value, threshold) = match &reason {
                    HaltReason::Drawdown(dd) => {
                        (to_f64(*dd), to_f64(limits.max_drawdown_percent))
                    }
                    HaltReason::DailyLoss(loss) => {
                        (to_f64(*loss), to_f64(limits.max_daily_loss_percent))
                    }
                    HaltReason::RiskScore(score) => {
                        (*score as f64, limits.emergency_risk_score as f64)
                    }
                };
                error!("🚨 Hard limit breached: {}", reason);
                self.publish(EventKind::RiskAlert(RiskAlert {
                    kind: AlertKind::LimitBreached,
                    level: AlertLevel::Critical,
                    message: format!("Hard limit breached: {}", reason),
                    value,
                    threshold,
                    symbol: None,
                }));
            }
        }

        metrics
    }

    fn on<F, Fut>(self: &Arc<Self>, event_type: EventType, handler: F)
    where
        F: Fn(Arc<Self>, Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let this = self.clone();
        self.bus
            .subscribe(event_type, SOURCE, move |event| handler(this.clone(), event));
    }

    async fn risk_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.engine.risk_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.risk_sweep();
                }
            }
        }
        debug!("Risk loop exited");
    }

    async fn on_intent(&self, intent: &TradeIntent) {
        if intent.confidence < self.config.engine.min_confidence {
            debug!(
                "Ignoring {} {} intent: confidence {:.2} below {:.2}",
                intent.side, intent.symbol, intent.confidence, self.config.engine.min_confidence
            );
            return;
        }

        let price = intent.limit_price.unwrap_or(intent.reference_price);
        if price <= Decimal::ZERO {
            warn!("Ignoring {} intent without a usable price", intent.symbol);
            return;
        }

        let (stop_loss, take_profit) = self.brackets_for(intent, price);
        let quantity = intent
            .quantity
            .unwrap_or_else(|| self.size_intent(intent, price, stop_loss));
        if quantity <= Decimal::ZERO {
            warn!("⚠️ Zero position size for {}", intent.symbol);
            return;
        }

        // Held until the entry fills, is cancelled or is abandoned
        let client_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self
            .risk
            .admit(&client_id, &intent.symbol, intent.side, price, quantity)
        {
            let reason = match e {
                Error::AdmissionDenied(denial) => denial.to_string(),
                Error::CriticalRiskBreach(reason) => format!("trading halted: {}", reason),
                other => other.to_string(),
            };
            warn!(
                "🚫 {} {} {} @ {} denied: {}",
                intent.side, quantity, intent.symbol, price, reason
            );
            self.publish(EventKind::AdmissionDenied(AdmissionDenied {
                symbol: intent.symbol.clone(),
                side: intent.side,
                quantity,
                price,
                strategy: intent.strategy.clone(),
                reason,
            }));
            return;
        }

        let spec = match (intent.limit_price, self.config.engine.use_market_orders) {
            (Some(limit), _) => {
                OrderSpec::limit(intent.symbol.clone(), intent.side, quantity, limit)
            }
            (None, true) => OrderSpec::market(intent.symbol.clone(), intent.side, quantity),
            (None, false) => OrderSpec::limit(
                intent.symbol.clone(),
                intent.side,
                quantity,
                intent.reference_price,
            ),
        }
        .with_strategy(intent.strategy.clone())
        .with_brackets(Some(stop_loss), Some(take_profit))
        .with_client_id(client_id.clone());

        info!(
            "🎯 {} {} {} @ {} (SL {}, TP {}, confidence {:.0}%)",
            intent.side,
            quantity,
            intent.symbol,
            price,
            stop_loss,
            take_profit,
            intent.confidence * 100.0
        );
        if let Err(e) = self.orders.place_order(spec).await {
            self.risk.release(&client_id);
            error!("❌ Placement of {} {} failed: {}", intent.side, intent.symbol, e);
            self.publish(EventKind::SystemError(SystemError {
                component: SOURCE.into(),
                message: format!("placement of {} {} failed: {}", intent.side, intent.symbol, e),
                critical: false,
            }));
        }
    }

    /// Stop-loss and take-profit, defaulted from the configured distances.
    fn brackets_for(&self, intent: &TradeIntent, price: Decimal) -> (Decimal, Decimal) {
        let limits = self.risk.limits();
        let stop = price * limits.stop_loss_percent / Decimal::ONE_HUNDRED;
        let profit = price * limits.take_profit_percent / Decimal::ONE_HUNDRED;
        let (stop_loss, take_profit) = match intent.side {
            Side::Buy => (price - stop, price + profit),
            Side::Sell => (price + stop, price - profit),
        };
        (
            intent.stop_loss.unwrap_or(stop_loss),
            intent.take_profit.unwrap_or(take_profit),
        )
    }

    /// Target `sizing_fraction * confidence` of the max position size, risked
    /// over the stop distance.
    fn size_intent(&self, intent: &TradeIntent, price: Decimal, stop_loss: Decimal) -> Decimal {
        let stop_distance = (price - stop_loss).abs();
        if stop_distance.is_zero() {
            return Decimal::ZERO;
        }

        let balance = self.portfolio.stats().available_balance;
        let confidence =
            Decimal::from_f64_retain(intent.confidence.clamp(0.0, 1.0)).unwrap_or(Decimal::ZERO);
        let target = balance * self.risk.limits().max_position_size_percent / Decimal::ONE_HUNDRED
            * self.config.engine.sizing_fraction
            * confidence;
        let risk_amount = target / price * stop_distance;
        self.risk.size_position(balance, risk_amount, stop_distance)
    }

    fn on_fill(&self, fill: &OrderFilled) {
        match fill.role {
            OrderRole::Entry => {
                let position = Position::new(
                    position_id(&fill.order_id),
                    fill.symbol.clone(),
                    PositionSide::from(fill.side),
                    fill.price,
                    fill.quantity,
                )
                .with_brackets(fill.stop_loss, fill.take_profit)
                .with_strategy(fill.strategy.clone());

                let opened = self.portfolio.open_position(position);
                self.release(fill.client_id.as_deref());
                match opened {
                    Ok(opened) => self.publish(EventKind::PositionOpened(opened)),
                    Err(e) => {
                        error!("❌ Fill {} not booked: {}", fill.order_id, e);
                        self.publish(EventKind::SystemError(SystemError {
                            component: SOURCE.into(),
                            message: format!("fill {} not booked: {}", fill.order_id, e),
                            critical: false,
                        }));
                    }
                }
            }
            role => {
                let Some(entry_id) = fill.parent_order_id.as_deref() else {
                    warn!("{:?} fill {} has no parent order", role, fill.order_id);
                    return;
                };
                let id = position_id(entry_id);
                match self.portfolio.close_position(&id, fill.price) {
                    Ok(closed) => self.publish(EventKind::PositionClosed(PositionClosed {
                        pnl: closed.pnl,
                        position: closed,
                        close_price: fill.price,
                        reason: close_reason(role).to_string(),
                    })),
                    Err(Error::PositionNotFound(_)) => debug!("{} already closed", id),
                    Err(e) => error!("❌ Close of {} failed: {}", id, e),
                }
            }
        }
    }

    fn on_price(&self, tick: &PriceTick) {
        if self.portfolio.mark_price(&tick.symbol, tick.price) == 0 {
            return;
        }
        for position in self
            .portfolio
            .positions()
            .iter()
            .filter(|p| p.symbol == tick.symbol)
        {
            for alert in self.monitor.check_position(position, tick.price) {
                warn!("⚠️ {}", alert.message);
                self.publish(EventKind::RiskAlert(alert));
            }
        }
    }

    /// Record the trade and cancel whatever child orders are left.
    async fn on_position_closed(&self, closed: &PositionClosed) {
        self.risk.record_trade(TradeRecord::from(&closed.position));
        if let Some(analytics) = self.monitor.forget_position(&closed.position.id) {
            debug!(
                "{} held {}s, max profit {}, max loss {}",
                closed.position.id,
                analytics.time_in_position.num_seconds(),
                analytics.max_profit.round_dp(2),
                analytics.max_loss.round_dp(2)
            );
        }

        let Some(entry_id) = entry_order_id(&closed.position.id) else {
            return;
        };
        match self.orders.cancel_children(entry_id).await {
            Ok(0) => {}
            Ok(n) => debug!("Cancelled {} leftover orders of {}", n, entry_id),
            Err(e) => warn!("Cancel of leftover orders of {} failed: {}", entry_id, e),
        }
    }

    fn release(&self, client_id: Option<&str>) {
        if let Some(client_id) = client_id {
            if self.risk.release(client_id) {
                debug!("Released reservation {}", client_id);
            }
        }
    }

    fn on_emergency_stop(&self, report: &CloseReport) {
        self.risk.halt(format!("emergency stop: {}", report.reason));
    }

    fn publish(&self, kind: EventKind) {
        if let Err(e) = self.bus.emit(SOURCE, kind) {
            warn!("Event not published: {}", e);
        }
    }
}

fn close_reason(role: OrderRole) -> &'static str {
    match role {
        OrderRole::StopLoss => "stop_loss",
        OrderRole::TakeProfit => "take_profit",
        OrderRole::Entry | OrderRole::Exit => "exit",
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
