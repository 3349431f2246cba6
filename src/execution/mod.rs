//! Execution layer - Order lifecycle management
//!
//! `OrderManager` owns every order it submits until the order reaches a
//! terminal state. A single monitor loop polls the venue and reacts to status
//! transitions: fills arm bracket orders, rejections are resubmitted with
//! exponential backoff, and expired orders are cancelled. The local record only
//! moves on a confirmed venue response. An order that ends cancelled or expired
//! after a partial fill still publishes the filled part.

pub mod managed;
pub mod retry;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::OrdersConfig;
use crate::core::{ChildOrders, Error, ExchangeConnector, Order, OrderStatus, Result};
use crate::events::{
    CancelReason, EventBus, EventKind, OrderCancelled, OrderFilled, OrderPlaced, OrderRejected,
    SystemError,
};
use crate::portfolio::Portfolio;

pub use managed::{ManagedOrder, OrderRole, OrderSpec};
pub use retry::RetryPolicy;

const SOURCE: &str = "order_manager";

/// Order manager - handles order lifecycle
pub struct OrderManager {
    this: Weak<OrderManager>,
    venue: Arc<dyn ExchangeConnector>,
    bus: EventBus,
    portfolio: Arc<Portfolio>,
    policy: RetryPolicy,
    poll_interval: Duration,
    venue_timeout: Duration,
    bracket_window: Duration,
    default_expiry: Option<Duration>,
    stop_timeout: Duration,
    active: RwLock<HashMap<String, ManagedOrder>>,
    archive: RwLock<HashMap<String, ManagedOrder>>,
    /// Parents whose brackets were already placed
    bracketed: Mutex<HashSet<String>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderManager {
    pub fn new(
        venue: Arc<dyn ExchangeConnector>,
        bus: EventBus,
        portfolio: Arc<Portfolio>,
        config: &OrdersConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            venue,
            bus,
            portfolio,
            policy: RetryPolicy::new(config.max_retries, config.backoff_base()),
            poll_interval: config.poll_interval(),
            venue_timeout: config.venue_timeout(),
            bracket_window: config.bracket_window(),
            default_expiry: config.default_expiry(),
            stop_timeout: config.stop_timeout(),
            active: RwLock::new(HashMap::new()),
            archive: RwLock::new(HashMap::new()),
            bracketed: Mutex::new(HashSet::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Spawn the monitor loop.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let shutdown = self.shutdown.subscribe();
        self.spawn(async move { this.monitor_loop(shutdown).await });
        info!(
            "🚀 OrderManager started on {} (poll {:?}, max retries {})",
            self.venue.name(),
            self.poll_interval,
            self.policy.max_retries
        );
    }

    /// Stop the monitor and background tasks; flag any positions left open.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(self.stop_timeout, join_all(handles)).await.is_err() {
            warn!(
                "⚠️ OrderManager tasks did not finish within {:?}, aborting",
                self.stop_timeout
            );
            for handle in aborts {
                handle.abort();
            }
        }

        let open = self.portfolio.position_count();
        if open > 0 {
            warn!("⚠️ {} positions still open at shutdown", open);
            let published = self.bus.emit(
                SOURCE,
                EventKind::SystemError(SystemError {
                    component: SOURCE.into(),
                    message: format!("{} positions open at shutdown", open),
                    critical: true,
                }),
            );
            if let Err(e) = published {
                error!("Failed to request emergency close: {}", e);
            }
        }
        info!("🛑 OrderManager stopped ({} active orders left)", self.active.read().len());
    }

    /// Submit a new order.
    pub async fn place_order(&self, spec: OrderSpec) -> Result<ManagedOrder> {
        self.submit(spec, 0).await
    }

    /// Cancel an active order. `false` when unknown, terminal or refused.
    pub async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        self.cancel_with(order_id, CancelReason::Requested, OrderStatus::Cancelled)
            .await
    }

    /// Cancel and replace with a new price and/or quantity.
    ///
    /// Without a new quantity the replacement covers what was left unfilled.
    pub async fn amend_order(
        &self,
        order_id: &str,
        price: Option<Decimal>,
        quantity: Option<Decimal>,
    ) -> Result<ManagedOrder> {
        let current = self
            .active
            .read()
            .get(order_id)
            .cloned()
            .ok_or_else(|| Error::OrderNotFound(order_id.to_string()))?;

        if !self
            .cancel_with(order_id, CancelReason::Replaced, OrderStatus::Cancelled)
            .await?
        {
            return Err(Error::VenueRejected(format!("cancel of {} refused", order_id)));
        }

        let remaining = self
            .archived(order_id)
            .map(|o| o.remaining())
            .unwrap_or_else(|| current.remaining());
        let mut spec = current.spec.clone();
        if price.is_some() {
            spec.price = price;
        }
        spec.quantity = quantity.unwrap_or(remaining);
        if spec.quantity <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "{} has nothing left to replace",
                order_id
            )));
        }

        info!("✏️ Amending {}: price {:?} qty {}", order_id, spec.price, spec.quantity);
        self.submit(spec, current.retry_count).await
    }

    /// Active or archived order by id
    pub fn get(&self, order_id: &str) -> Option<ManagedOrder> {
        self.active
            .read()
            .get(order_id)
            .cloned()
            .or_else(|| self.archived(order_id))
    }

    pub fn active_orders(&self) -> Vec<ManagedOrder> {
        self.active.read().values().cloned().collect()
    }

    pub fn archived(&self, order_id: &str) -> Option<ManagedOrder> {
        self.archive.read().get(order_id).cloned()
    }

    pub fn archived_orders(&self) -> Vec<ManagedOrder> {
        self.archive.read().values().cloned().collect()
    }

    async fn submit(&self, spec: OrderSpec, retry_count: u32) -> Result<ManagedOrder> {
        let request = spec.request();
        info!(
            "Placing {:?} order: {} {} {} @ {:?}",
            spec.role,
            request.side,
            request.quantity,
            request.symbol,
            request.price
        );

        let placed = self
            .venue_call("place_order", self.venue.place_order(&request))
            .await;
        let mut order = match placed {
            Ok(order) => order,
            Err(Error::VenueTimeout(what)) => return Err(Error::VenueTimeout(what)),
            Err(Error::VenueRejected(reason)) => return Err(Error::VenueRejected(reason)),
            Err(e) => return Err(Error::VenueRejected(e.to_string())),
        };

        // Transitions are only observed by polling
        order.status = OrderStatus::Placed;
        order.filled_quantity = Decimal::ZERO;
        order.filled_price = None;

        let now = Instant::now();
        let expire_after = spec.expire_after.or(match spec.role {
            OrderRole::Entry => self.default_expiry,
            _ => None,
        });
        let managed = ManagedOrder {
            order,
            spec,
            retry_count,
            max_retries: self.policy.max_retries,
            placed_at: now,
            expires_at: expire_after.map(|d| now + d),
            bracket_deadline: now + self.bracket_window,
        };

        self.active
            .write()
            .insert(managed.id().to_string(), managed.clone());
        self.publish(EventKind::OrderPlaced(OrderPlaced {
            order_id: managed.id().to_string(),
            symbol: managed.order.symbol.clone(),
            side: managed.order.side,
            order_type: managed.order.order_type,
            quantity: managed.order.quantity,
            price: managed.order.price,
            strategy: managed.spec.strategy.clone(),
            role: managed.spec.role,
            parent_order_id: managed.spec.parent_order_id.clone(),
            retry_count,
            client_id: managed.spec.client_id.clone(),
        }));
        info!("✅ Order placed: {} (retry {})", managed.id(), retry_count);
        Ok(managed)
    }

    /// `true` once the venue confirmed the cancel, even if the monitor
    /// archived the order first.
    async fn cancel_with(
        &self,
        order_id: &str,
        reason: CancelReason,
        final_status: OrderStatus,
    ) -> Result<bool> {
        let symbol = match self.active.read().get(order_id) {
            Some(managed) => managed.order.symbol.clone(),
            None => return Ok(false),
        };

        if !self
            .venue_call("cancel_order", self.venue.cancel_order(order_id, &symbol))
            .await?
        {
            warn!("Cancel of {} refused by venue", order_id);
            return Ok(false);
        }

        let removed = self.active.write().remove(order_id);
        let Some(mut managed) = removed else {
            debug!("Order {} settled by the monitor while its cancel was in flight", order_id);
            return Ok(true);
        };

        // Pick up fills that landed after the last poll
        match self
            .venue_call("get_order", self.venue.get_order(order_id, &symbol))
            .await
        {
            Ok(Some(remote)) => {
                managed.absorb(&remote);
            }
            Ok(None) => {}
            Err(e) => debug!("Final read of {} failed: {}", order_id, e),
        }
        managed.order.status = final_status;
        managed.order.updated_at = chrono::Utc::now();

        info!("🚫 Order {} cancelled ({:?})", order_id, reason);
        self.finish_unfilled(managed, reason, Instant::now());
        Ok(true)
    }

    async fn monitor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.poll_once().await,
            }
        }
        debug!("Order monitor exited");
    }

    /// One pass over the active set.
    async fn poll_once(&self) {
        let snapshot: Vec<ManagedOrder> = self.active.read().values().cloned().collect();
        let now = Instant::now();

        for managed in snapshot {
            if managed.is_expired(now) {
                self.expire(&managed).await;
                continue;
            }

            let remote = match self
                .venue_call(
                    "get_order",
                    self.venue.get_order(managed.id(), &managed.order.symbol),
                )
                .await
            {
                Ok(Some(remote)) => remote,
                Ok(None) => {
                    warn!("Order {} unknown to venue", managed.id());
                    continue;
                }
                Err(e) if e.is_transient() => {
                    debug!("Poll of {} failed, retrying next tick: {}", managed.id(), e);
                    continue;
                }
                Err(e) => {
                    warn!("Poll of {} failed: {}", managed.id(), e);
                    continue;
                }
            };

            self.on_remote(managed.id(), &remote, now);
        }
    }

    fn on_remote(&self, order_id: &str, remote: &Order, now: Instant) {
        let updated = {
            let mut active = self.active.write();
            let Some(local) = active.get_mut(order_id) else {
                return;
            };
            if !local.absorb(remote) {
                return;
            }
            if remote.status.is_terminal() {
                active.remove(order_id)
            } else {
                Some(local.clone())
            }
        };
        let Some(managed) = updated else {
            return;
        };

        match managed.status() {
            OrderStatus::Filled => self.on_filled(managed, now),
            OrderStatus::Cancelled => {
                info!("Order {} cancelled by venue", managed.id());
                self.finish_unfilled(managed, CancelReason::Venue, now);
            }
            OrderStatus::Expired => {
                info!("Order {} expired on venue", managed.id());
                self.finish_unfilled(managed, CancelReason::Expired, now);
            }
            OrderStatus::Rejected => {
                warn!("❌ Order {} rejected by venue", managed.id());
                self.archive(managed.clone());
                self.spawn_with(move |this| async move {
                    this.resubmit(managed, "rejected by venue".to_string()).await
                });
            }
            OrderStatus::PartiallyFilled => debug!(
                "Order {} partially filled: {}/{}",
                managed.id(),
                managed.order.filled_quantity,
                managed.order.quantity
            ),
            OrderStatus::Pending | OrderStatus::Placed => {}
        }
    }

    fn on_filled(&self, managed: ManagedOrder, now: Instant) {
        self.publish_fill(&managed, now);
        self.archive(managed);
    }

    /// Archive an order that ended cancelled or expired. Whatever part of it
    /// filled is published first.
    fn finish_unfilled(&self, managed: ManagedOrder, reason: CancelReason, now: Instant) {
        if managed.order.filled_quantity > Decimal::ZERO {
            info!(
                "Order {} ended {} with {}/{} filled",
                managed.id(),
                managed.status(),
                managed.order.filled_quantity,
                managed.order.quantity
            );
            self.publish_fill(&managed, now);
        }
        self.publish(EventKind::OrderCancelled(OrderCancelled {
            order_id: managed.id().to_string(),
            symbol: managed.order.symbol.clone(),
            reason,
            client_id: managed.spec.client_id.clone(),
        }));
        self.archive(managed);
    }

    /// Publish the filled quantity, then arm brackets for an entry or cancel
    /// the sibling of a bracket leg.
    fn publish_fill(&self, managed: &ManagedOrder, now: Instant) {
        let price = managed
            .order
            .execution_price()
            .unwrap_or(Decimal::ZERO);
        info!(
            "💰 Order filled: {} {} {} {} @ {}",
            managed.id(),
            managed.order.side,
            managed.order.filled_quantity,
            managed.order.symbol,
            price
        );

        self.publish(EventKind::OrderFilled(OrderFilled {
            order_id: managed.id().to_string(),
            symbol: managed.order.symbol.clone(),
            side: managed.order.side,
            price,
            quantity: managed.order.filled_quantity,
            strategy: managed.spec.strategy.clone(),
            role: managed.spec.role,
            parent_order_id: managed.spec.parent_order_id.clone(),
            stop_loss: managed.spec.stop_loss,
            take_profit: managed.spec.take_profit,
            client_id: managed.spec.client_id.clone(),
        }));

        match managed.role() {
            OrderRole::Entry if managed.spec.has_brackets() => {
                if now > managed.bracket_deadline {
                    warn!("Fill of {} observed after the bracket window", managed.id());
                    self.publish(EventKind::SystemError(SystemError {
                        component: SOURCE.into(),
                        message: format!(
                            "fill of {} observed after {:?}, brackets not placed",
                            managed.id(),
                            self.bracket_window
                        ),
                        critical: false,
                    }));
                } else if self.bracketed.lock().insert(managed.id().to_string()) {
                    let parent = managed.clone();
                    self.spawn_with(move |this| async move { this.place_brackets(parent).await });
                }
            }
            role if role.is_bracket() => {
                if let Some(parent) = managed.parent_order_id() {
                    let sibling = self
                        .active
                        .read()
                        .values()
                        .find(|o| o.parent_order_id() == Some(parent) && o.role().is_bracket())
                        .map(|o| o.id().to_string());
                    if let Some(sibling) = sibling {
                        self.spawn_with(move |this| async move {
                            let cancelled = this
                                .cancel_with(
                                    &sibling,
                                    CancelReason::SiblingFilled,
                                    OrderStatus::Cancelled,
                                )
                                .await;
                            if let Err(e) = cancelled {
                                warn!("Failed to cancel bracket sibling {}: {}", sibling, e);
                            }
                        });
                    }
                }
            }
            _ => {}
        }
    }

    async fn place_brackets(&self, parent: ManagedOrder) {
        let quantity = parent.order.filled_quantity;
        let children = [
            (OrderRole::StopLoss, parent.spec.stop_loss),
            (OrderRole::TakeProfit, parent.spec.take_profit),
        ];

        for (role, price) in children {
            let Some(price) = price else { continue };
            let spec = parent.spec.bracket(role, price, quantity, parent.id());
            match self.submit(spec, 0).await {
                Ok(child) => info!(
                    "🛡️ {:?} {} armed for {} @ {}",
                    role,
                    child.id(),
                    parent.id(),
                    price
                ),
                Err(e) => {
                    error!("Failed to place {:?} for {}: {}", role, parent.id(), e);
                    self.publish(EventKind::SystemError(SystemError {
                        component: SOURCE.into(),
                        message: format!("{:?} for {} not placed: {}", role, parent.id(), e),
                        critical: false,
                    }));
                }
            }
        }
    }

    /// Resubmit a rejected order until accepted or out of retries.
    async fn resubmit(&self, rejected: ManagedOrder, mut reason: String) {
        let mut shutdown = self.shutdown.subscribe();
        let mut retry_count = rejected.retry_count;

        loop {
            if *shutdown.borrow() {
                return;
            }
            if !self.policy.can_retry(retry_count) {
                error!(
                    "❌ Order {} abandoned after {} retries: {}",
                    rejected.id(),
                    retry_count,
                    reason
                );
                self.publish(EventKind::OrderRejected(OrderRejected {
                    order_id: rejected.id().to_string(),
                    symbol: rejected.order.symbol.clone(),
                    strategy: rejected.spec.strategy.clone(),
                    retries: retry_count,
                    reason,
                    client_id: rejected.spec.client_id.clone(),
                }));
                return;
            }

            let delay = self.policy.delay(retry_count);
            warn!(
                "🔄 Resubmitting {} in {:?} (attempt {}/{})",
                rejected.id(),
                delay,
                retry_count + 1,
                self.policy.max_retries
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }

            retry_count += 1;
            match self.submit(rejected.spec.clone(), retry_count).await {
                Ok(_) => return,
                Err(e) => {
                    warn!("Resubmission of {} failed: {}", rejected.id(), e);
                    reason = e.to_string();
                }
            }
        }
    }

    async fn expire(&self, managed: &ManagedOrder) {
        match self
            .cancel_with(managed.id(), CancelReason::Expired, OrderStatus::Expired)
            .await
        {
            Ok(true) => info!("⌛ Order {} expired", managed.id()),
            Ok(false) => debug!("Expiry cancel of {} not confirmed", managed.id()),
            Err(e) => debug!("Expiry cancel of {} failed, retrying next tick: {}", managed.id(), e),
        }
    }

    fn archive(&self, managed: ManagedOrder) {
        self.archive
            .write()
            .insert(managed.id().to_string(), managed);
    }

    fn publish(&self, kind: EventKind) {
        if let Err(e) = self.bus.emit(SOURCE, kind) {
            warn!("Event dropped: {}", e);
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(tokio::spawn(task));
    }

    /// Spawn a task that needs its own handle on the manager.
    fn spawn_with<F, Fut>(&self, task: F)
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        match self.this.upgrade() {
            Some(this) => self.spawn(task(this)),
            None => debug!("OrderManager dropped, task not spawned"),
        }
    }

    async fn venue_call<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.venue_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::VenueTimeout(format!(
                "{} on {} after {:?}",
                what,
                self.venue.name(),
                self.venue_timeout
            ))),
        }
    }
}

#[async_trait]
impl ChildOrders for OrderManager {
    async fn cancel_children(&self, parent_order_id: &str) -> Result<usize> {
        let children: Vec<String> = self
            .active
            .read()
            .values()
            .filter(|o| o.parent_order_id() == Some(parent_order_id))
            .map(|o| o.id().to_string())
            .collect();

        let mut cancelled = 0;
        let mut failure = None;
        for order_id in children {
            match self
                .cancel_with(&order_id, CancelReason::PositionClosing, OrderStatus::Cancelled)
                .await
            {
                Ok(true) => cancelled += 1,
                Ok(false) => debug!("Child {} of {} already gone", order_id, parent_order_id),
                Err(e) => {
                    warn!("Cancel of child {} of {} failed: {}", order_id, parent_order_id, e);
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(cancelled),
        }
    }
}
