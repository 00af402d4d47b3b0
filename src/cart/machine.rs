//! Optimistic cart state machine.
//!
//! Every command runs in two phases. Phase one is synchronous: the reducer
//! produces the next state, totals are recomputed and the new state is
//! visible immediately, online or not. Phase two (`PendingCommit::settle`)
//! creates the order lazily, registers the operation id and dispatches it
//! through the gateway, then maps the outcome back onto whatever the state
//! is *at that moment*.
//!
//! Each reset or resume bumps the session epoch. A continuation that wakes
//! up under a different epoch discards its result.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::calculator::{Calculator, PricingSettings};
use crate::cart::model::{
    AppliedDiscount, ApprovalRequest, CartState, CustomItem, DiscountValue, ItemId,
    ModifierSnapshot, OrderRef, OrderSnapshot, OrderStatus, ProductRef, StockOverrideDialog,
};
use crate::cart::reconcile::{reconcile, rehydrate_item, DriftReport, ServerOrderSnapshot};
use crate::cart::reducer::{
    recompute, reduce, replay, CartCommand, CartContext, CartEffect, LoggedCommand, Transition,
};
use crate::catalog::CatalogLookup;
use crate::db::LocalStore;
use crate::error::{CartError, SyncError};
use crate::gateway::{Gateway, GatewayError, OperationEnvelope, OrderDraft};
use crate::ingestion::new_offline_record;
use crate::operations::{
    OperationId, OperationKind, OperationRegistry, PendingOperation, RegistryStats,
};

const COMMAND_LOG_LIMIT: usize = 512;

/// How phase two ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Nothing to send (offline edit, local-only order, local approval gate).
    LocalOnly,
    Confirmed,
    /// Transient failure; the operation stays registered for `retry_pending`.
    Deferred,
    StockOverride,
    ApprovalRequired,
    RolledBack,
    /// The cart session changed while the operation was in flight.
    Stale,
    PersistedOffline { local_id: String },
    Discarded,
}

enum CommitPlan {
    Done(CommitOutcome),
    EnsureOrder,
    Dispatch(OperationId),
}

/// Phase two of a command. Dropping it skips the network round trip; the
/// optimistic state stays applied.
#[must_use = "the commit phase only runs when settled or spawned"]
pub struct PendingCommit {
    machine: CartMachine,
    epoch: u64,
    plan: CommitPlan,
}

impl PendingCommit {
    pub fn operation_id(&self) -> Option<&OperationId> {
        match &self.plan {
            CommitPlan::Dispatch(id) => Some(id),
            _ => None,
        }
    }

    pub async fn settle(self) -> CommitOutcome {
        match self.plan {
            CommitPlan::Done(outcome) => outcome,
            CommitPlan::EnsureOrder => match self.machine.ensure_order(self.epoch).await {
                Ok(Some(_)) => CommitOutcome::LocalOnly,
                Ok(None) => CommitOutcome::Stale,
                Err(e) => {
                    // The next command retries creation.
                    warn!("lazy order creation failed: {e}");
                    CommitOutcome::LocalOnly
                }
            },
            CommitPlan::Dispatch(id) => self.machine.commit_operation(id, self.epoch).await,
        }
    }

    pub fn spawn(self) -> JoinHandle<CommitOutcome> {
        tokio::spawn(self.settle())
    }
}

struct InFlight {
    /// State before the optimistic phase.
    snapshot: CartState,
    /// State right after it.
    applied: CartState,
    touched_item: Option<ItemId>,
}

struct Session {
    state: CartState,
    epoch: u64,
    registry: OperationRegistry,
    in_flight: HashMap<OperationId, InFlight>,
    log: Vec<LoggedCommand>,
    settings: PricingSettings,
}

struct Inner {
    session: Mutex<Session>,
    gateway: Arc<dyn Gateway>,
    calculator: Arc<dyn Calculator>,
    catalog: Arc<dyn CatalogLookup>,
    store: Arc<LocalStore>,
    drift_tolerance: f64,
}

/// Cheap to clone; all clones drive the same cart.
#[derive(Clone)]
pub struct CartMachine {
    inner: Arc<Inner>,
}

impl CartMachine {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        calculator: Arc<dyn Calculator>,
        catalog: Arc<dyn CatalogLookup>,
        store: Arc<LocalStore>,
        settings: PricingSettings,
        drift_tolerance: f64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(Session {
                    state: CartState::default(),
                    epoch: 0,
                    registry: OperationRegistry::new(),
                    in_flight: HashMap::new(),
                    log: Vec::new(),
                    settings,
                }),
                gateway,
                calculator,
                catalog,
                store,
                drift_tolerance,
            }),
        }
    }

    /// The guard is never held across an await point.
    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn context<'a>(
        &'a self,
        settings: &'a PricingSettings,
        is_offline: bool,
        now: DateTime<Utc>,
    ) -> CartContext<'a> {
        CartContext {
            calculator: self.inner.calculator.as_ref(),
            settings,
            is_offline,
            now,
        }
    }

    fn recompute_session(&self, session: &mut Session) {
        let offline = self.inner.gateway.is_offline_mode();
        let ctx = self.context(&session.settings, offline, Utc::now());
        recompute(&mut session.state, &ctx);
    }

    // -----------------------------------------------------------------------
    // Read access
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> CartState {
        self.session().state.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.session().epoch
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.session().registry.stats()
    }

    pub fn command_log(&self) -> Vec<LoggedCommand> {
        self.session().log.clone()
    }

    /// Rebuild the current session from its command log.
    pub fn replay_session(&self) -> CartState {
        let session = self.session();
        let entries: Vec<LoggedCommand> = session
            .log
            .iter()
            .filter(|entry| entry.epoch == session.epoch)
            .cloned()
            .collect();
        replay(
            &CartState::default(),
            &entries,
            self.inner.calculator.as_ref(),
            &session.settings,
        )
    }

    pub fn settings(&self) -> PricingSettings {
        self.session().settings.clone()
    }

    /// Swap pricing settings after a dataset sync and recompute totals.
    pub fn replace_settings(&self, settings: PricingSettings) {
        let mut guard = self.session();
        let session = &mut *guard;
        session.settings = settings;
        self.recompute_session(session);
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub fn add_item(
        &self,
        product: ProductRef,
        unit_price: f64,
        quantity: u32,
    ) -> Result<PendingCommit, CartError> {
        self.add_item_with_modifiers(product, unit_price, quantity, Vec::new(), None)
    }

    pub fn add_item_with_modifiers(
        &self,
        product: ProductRef,
        unit_price: f64,
        quantity: u32,
        modifiers: Vec<ModifierSnapshot>,
        notes: Option<String>,
    ) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::AddItem {
            line_id: ItemId::new_local(),
            product,
            unit_price,
            quantity,
            modifiers,
            notes,
        })
    }

    pub fn add_custom_item(
        &self,
        item: CustomItem,
        unit_price: f64,
        quantity: u32,
        notes: Option<String>,
    ) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::AddCustomItem {
            line_id: ItemId::new_local(),
            item,
            unit_price,
            quantity,
            notes,
        })
    }

    pub fn update_item_quantity(
        &self,
        item_id: ItemId,
        quantity: u32,
    ) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::UpdateItemQuantity { item_id, quantity })
    }

    pub fn remove_item(&self, item_id: ItemId) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::RemoveItem { item_id })
    }

    pub fn apply_discount(&self, discount_id: &str) -> Result<PendingCommit, CartError> {
        let discount = self
            .inner
            .catalog
            .discount(discount_id)
            .ok_or_else(|| CartError::DiscountNotFound(discount_id.to_string()))?;
        self.execute(CartCommand::ApplyDiscount { discount })
    }

    pub fn apply_discount_code(&self, code: &str) -> Result<PendingCommit, CartError> {
        let discount: AppliedDiscount = self
            .inner
            .catalog
            .discount_by_code(code)
            .ok_or_else(|| CartError::DiscountNotFound(code.to_string()))?;
        self.execute(CartCommand::ApplyDiscount { discount })
    }

    pub fn remove_discount(&self, discount_id: &str) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::RemoveDiscount {
            discount_id: discount_id.to_string(),
        })
    }

    pub fn apply_one_off_discount(
        &self,
        value: DiscountValue,
        reason: Option<String>,
        target_item_id: Option<ItemId>,
    ) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::ApplyOneOffDiscount {
            adjustment_id: new_adjustment_id(),
            value,
            reason,
            target_item_id,
            approved_by: None,
        })
    }

    pub fn apply_price_override(
        &self,
        item_id: ItemId,
        new_price: f64,
        reason: Option<String>,
    ) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::ApplyPriceOverride {
            adjustment_id: new_adjustment_id(),
            item_id,
            new_price,
            reason,
            approved_by: None,
        })
    }

    pub fn apply_tax_exemption(&self, reason: Option<String>) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::ApplyTaxExemption {
            adjustment_id: new_adjustment_id(),
            reason,
            approved_by: None,
        })
    }

    pub fn apply_fee_exemption(&self, reason: Option<String>) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::ApplyFeeExemption {
            adjustment_id: new_adjustment_id(),
            reason,
            approved_by: None,
        })
    }

    pub fn remove_adjustment(&self, adjustment_id: &str) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::RemoveAdjustment {
            adjustment_id: adjustment_id.to_string(),
        })
    }

    pub fn clear_cart(&self) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::ClearCart)
    }

    pub fn hold_order(&self) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::HoldOrder)
    }

    pub fn complete_order(
        &self,
        payment_method: Option<String>,
        tip: f64,
    ) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::CompleteOrder { payment_method, tip })
    }

    pub fn cancel_order(&self, reason: Option<String>) -> Result<PendingCommit, CartError> {
        self.execute(CartCommand::CancelOrder { reason })
    }

    /// Drop the current cart and start a new session.
    pub fn reset_cart(&self) {
        let mut guard = self.session();
        self.reset_session(&mut guard);
    }

    /// Load a held (or otherwise open) server order into a fresh session.
    pub async fn resume_cart(&self, server: ServerOrderSnapshot) -> Result<(), CartError> {
        let resumable = |s: &OrderStatus| matches!(s, OrderStatus::Draft | OrderStatus::Hold);
        if let Some(status) = server.status.filter(|s| !resumable(s)) {
            return Err(CartError::InvalidTransition {
                action: "resume the order",
                status,
            });
        }

        let order = OrderRef::Server(server.order_id.clone());
        let epoch = {
            let mut guard = self.session();
            let session = &mut *guard;
            self.reset_session(session);

            let now = Utc::now();
            let catalog = self.inner.catalog.as_ref();
            let mut state = CartState {
                order_id: Some(order.clone()),
                order_number: server.order_number.clone(),
                items: server.items.iter().map(|item| rehydrate_item(item, catalog)).collect(),
                adjustments: server.adjustments.clone(),
                applied_discounts: server.applied_discounts.clone(),
                created_at: Some(now),
                ..Default::default()
            };
            let ctx = self.context(&session.settings, false, now);
            recompute(&mut state, &ctx);
            let tolerance = self.inner.drift_tolerance;
            session.state = reconcile(&state, &server, catalog, tolerance, now).state;
            session.epoch
        };

        if let Err(e) = self.inner.gateway.initialize_connection(&order).await {
            warn!(order_id = %order.as_str(), "realtime subscription failed: {e}");
        }
        if self.epoch() == epoch {
            info!(order_id = %order.as_str(), "resumed order");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stock override / approval sub-flows
    // -----------------------------------------------------------------------

    /// Resubmit the rejected stock request with the force flag.
    pub fn force_add_item(&self) -> Result<PendingCommit, CartError> {
        let offline = self.inner.gateway.is_offline_mode();
        let now = Utc::now();
        let mut guard = self.session();
        let session = &mut *guard;
        let dialog = session
            .state
            .stock_override_dialog
            .take()
            .ok_or(CartError::NoStockOverride)?;
        let epoch = session.epoch;

        if offline {
            return Ok(PendingCommit {
                machine: self.clone(),
                epoch,
                plan: CommitPlan::Done(CommitOutcome::LocalOnly),
            });
        }

        let mut rollback_target = session.state.clone();
        revert_line(&mut rollback_target, &dialog);
        let ctx = self.context(&session.settings, offline, now);
        recompute(&mut rollback_target, &ctx);

        let mut request = dialog.request;
        if let Value::Object(map) = &mut request.payload {
            map.insert("force".to_string(), Value::Bool(true));
        }
        let id = OperationId::generate(request.kind.prefix(), request.entity_id.as_deref());
        info!(operation_id = %id, item_id = %dialog.item_id, "stock override forced");
        session.registry.register(PendingOperation {
            id: id.clone(),
            request,
            epoch,
            attempts: 0,
            registered_at: now,
            awaiting_retry: false,
        });
        session.in_flight.insert(
            id.clone(),
            InFlight {
                snapshot: rollback_target,
                applied: session.state.clone(),
                touched_item: Some(dialog.item_id),
            },
        );

        Ok(PendingCommit {
            machine: self.clone(),
            epoch,
            plan: CommitPlan::Dispatch(id),
        })
    }

    /// Put the affected line back to its quantity before the request.
    pub fn cancel_stock_override(&self) -> Result<(), CartError> {
        let mut guard = self.session();
        let session = &mut *guard;
        let dialog = session
            .state
            .stock_override_dialog
            .take()
            .ok_or(CartError::NoStockOverride)?;
        revert_line(&mut session.state, &dialog);
        self.recompute_session(session);
        debug!(item_id = %dialog.item_id, "stock override cancelled");
        Ok(())
    }

    /// Re-run the gated command with the approver stamped on it. The request
    /// stays open if the command can no longer be applied.
    pub fn approve_request(&self, manager_id: &str) -> Result<PendingCommit, CartError> {
        let request = self
            .session()
            .state
            .approval_request
            .take()
            .ok_or(CartError::NoApprovalRequest)?;
        match self.execute(request.command.clone().with_approver(manager_id)) {
            Ok(commit) => {
                info!(manager_id, command = request.command.name(), "approval granted");
                Ok(commit)
            }
            Err(e) => {
                warn!(command = request.command.name(), "approved command failed: {e}");
                self.session().state.approval_request = Some(request);
                Err(e)
            }
        }
    }

    pub fn cancel_approval(&self) -> Result<(), CartError> {
        let request = self
            .session()
            .state
            .approval_request
            .take()
            .ok_or(CartError::NoApprovalRequest)?;
        debug!(command = request.command.name(), "approval cancelled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Server pushes and retries
    // -----------------------------------------------------------------------

    /// Reconcile a pushed snapshot against the state as it is now. Pushes for
    /// another order are ignored.
    pub fn apply_server_snapshot(&self, server: &ServerOrderSnapshot) -> Option<DriftReport> {
        let mut guard = self.session();
        let current = guard.state.order_id.as_ref().and_then(OrderRef::server_id);
        if current != Some(server.order_id.as_str()) {
            debug!(order_id = %server.order_id, "ignoring push for another order");
            return None;
        }
        let result = reconcile(
            &guard.state,
            server,
            self.inner.catalog.as_ref(),
            self.inner.drift_tolerance,
            Utc::now(),
        );
        guard.state = result.state;
        Some(result.report)
    }

    /// Re-send operations that failed transiently in this session.
    pub async fn retry_pending(&self) -> Vec<CommitOutcome> {
        if self.inner.gateway.is_offline_mode() {
            return Vec::new();
        }
        let (epoch, ids) = {
            let mut session = self.session();
            let epoch = session.epoch;
            let dropped = session.registry.drop_stale(epoch);
            if dropped > 0 {
                debug!(dropped, "dropped operations from older sessions");
            }
            (epoch, session.registry.retry_candidates(epoch))
        };

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            outcomes.push(self.commit_operation(id, epoch).await);
        }
        outcomes
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn execute(&self, command: CartCommand) -> Result<PendingCommit, CartError> {
        let offline = self.inner.gateway.is_offline_mode();
        let now = Utc::now();
        let mut guard = self.session();
        let session = &mut *guard;
        let transition = {
            let ctx = self.context(&session.settings, offline, now);
            reduce(&session.state, &command, &ctx)?
        };
        self.apply_transition(session, command, transition, offline, now)
    }

    fn apply_transition(
        &self,
        session: &mut Session,
        command: CartCommand,
        transition: Transition,
        offline: bool,
        now: DateTime<Utc>,
    ) -> Result<PendingCommit, CartError> {
        let Transition {
            state,
            effects,
            touched_item,
        } = transition;
        let snapshot = std::mem::replace(&mut session.state, state);
        let epoch = session.epoch;
        let mut plan = CommitPlan::Done(CommitOutcome::LocalOnly);
        let mut operation_id = None;
        let mut closes_session = false;

        for effect in effects {
            match effect {
                // Offline edits are not queued one by one; the finished order is.
                CartEffect::Dispatch(_) if offline => plan = CommitPlan::EnsureOrder,
                CartEffect::Dispatch(request) => {
                    let entity_id = request.entity_id.as_deref();
                    let id = OperationId::generate(request.kind.prefix(), entity_id);
                    session.registry.register(PendingOperation {
                        id: id.clone(),
                        request,
                        epoch,
                        attempts: 0,
                        registered_at: now,
                        awaiting_retry: false,
                    });
                    session.in_flight.insert(
                        id.clone(),
                        InFlight {
                            snapshot: snapshot.clone(),
                            applied: session.state.clone(),
                            touched_item: touched_item.clone(),
                        },
                    );
                    operation_id = Some(id.clone());
                    plan = CommitPlan::Dispatch(id);
                }
                CartEffect::PersistOfflineOrder {
                    status,
                    cancellation_reason,
                } => match self.persist_offline(&session.state, status, cancellation_reason, now) {
                    Ok(local_id) => {
                        closes_session = true;
                        plan = CommitPlan::Done(CommitOutcome::PersistedOffline { local_id });
                    }
                    Err(e) => {
                        error!("failed to persist offline order: {e}");
                        session.state = snapshot;
                        return Err(CartError::Persistence(e.to_string()));
                    }
                },
                CartEffect::DiscardOrder => {
                    closes_session = true;
                    plan = CommitPlan::Done(CommitOutcome::Discarded);
                }
            }
        }

        session.log.push(LoggedCommand {
            operation_id,
            epoch,
            command,
            is_offline: offline,
            at: now,
        });
        if session.log.len() > COMMAND_LOG_LIMIT {
            let excess = session.log.len() - COMMAND_LOG_LIMIT;
            session.log.drain(..excess);
        }
        if closes_session {
            self.reset_session(session);
        }

        Ok(PendingCommit {
            machine: self.clone(),
            epoch,
            plan,
        })
    }

    fn reset_session(&self, session: &mut Session) {
        session.epoch += 1;
        session.state = CartState::default();
        session.in_flight.clear();
        let dropped = session.registry.drop_stale(session.epoch);
        self.inner.gateway.clear_local_order_id();
        debug!(epoch = session.epoch, dropped, "cart session reset");
    }

    fn persist_offline(
        &self,
        state: &CartState,
        status: OrderStatus,
        cancellation_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<String, SyncError> {
        let order = state.order_id.clone().unwrap_or_else(OrderRef::new_local);
        let snapshot = OrderSnapshot::from_state(state, status, cancellation_reason, now);
        let record = new_offline_record(&order, snapshot, now);
        self.inner.store.save_offline_order(&record)?;
        Ok(record.local_id)
    }

    /// Returns `None` when the session moved on while the gateway was busy.
    async fn ensure_order(&self, epoch: u64) -> Result<Option<OrderRef>, GatewayError> {
        let draft = {
            let session = self.session();
            if session.epoch != epoch {
                return Ok(None);
            }
            if let Some(order) = &session.state.order_id {
                return Ok(Some(order.clone()));
            }
            OrderDraft::from_state(&session.state, Utc::now())
        };

        let order = self.inner.gateway.get_or_create_order_id(&draft).await?;

        let mut session = self.session();
        if session.epoch != epoch {
            return Ok(None);
        }
        if let Some(existing) = &session.state.order_id {
            return Ok(Some(existing.clone()));
        }
        if order.is_local() {
            session.state.is_offline_order = true;
        }
        debug!(order_id = %order.as_str(), "order created");
        session.state.order_id = Some(order.clone());
        Ok(Some(order))
    }

    async fn commit_operation(&self, id: OperationId, epoch: u64) -> CommitOutcome {
        let order = match self.ensure_order(epoch).await {
            Ok(Some(order)) => order,
            Ok(None) => return CommitOutcome::Stale,
            Err(err) => return self.resolve(&id, epoch, Err(err)),
        };

        let envelope = {
            let mut guard = self.session();
            let session = &mut *guard;
            if session.epoch != epoch {
                return CommitOutcome::Stale;
            }
            // A local order only reaches the server through ingestion.
            if order.is_local() || self.inner.gateway.is_offline_mode() {
                return self.defer_offline(session, &id);
            }
            let Some(op) = session.registry.begin_attempt(&id) else {
                return CommitOutcome::Stale;
            };
            let envelope = OperationEnvelope::for_operation(op, &order);
            session.state.is_syncing = true;
            envelope
        };

        let result = self.inner.gateway.send_cart_operation(&envelope).await;
        self.resolve(&id, epoch, result)
    }

    fn resolve(
        &self,
        id: &OperationId,
        epoch: u64,
        result: Result<Value, GatewayError>,
    ) -> CommitOutcome {
        let mut guard = self.session();
        let session = &mut *guard;
        if session.epoch != epoch {
            debug!(operation_id = %id, "discarding stale operation result");
            return CommitOutcome::Stale;
        }
        session.state.is_syncing = false;

        match result {
            Ok(ack) => {
                let Some(op) = session.registry.resolve_success(id) else {
                    return CommitOutcome::Stale;
                };
                let touched = session.in_flight.remove(id).and_then(|f| f.touched_item);
                self.apply_ack(session, &op, touched, &ack)
            }
            Err(GatewayError::Transient(reason)) => {
                warn!(operation_id = %id, %reason, "operation deferred");
                self.defer(session, id)
            }
            Err(GatewayError::InsufficientStock {
                message,
                available_quantity,
            }) => self.open_stock_override(session, id, message, available_quantity),
            Err(GatewayError::ApprovalRequired { reason }) => {
                let command = session
                    .log
                    .iter()
                    .rev()
                    .find(|entry| entry.operation_id.as_ref() == Some(id))
                    .map(|entry| entry.command.clone());
                if session.registry.resolve_failure(id).is_none() {
                    return CommitOutcome::Stale;
                }
                let flight = session.in_flight.remove(id);
                self.roll_back(session, flight);
                info!(operation_id = %id, %reason, "server requires manager approval");
                session.state.approval_request =
                    command.map(|command| ApprovalRequest { command, reason });
                CommitOutcome::ApprovalRequired
            }
            Err(GatewayError::Rejected(reason)) => {
                let Some(op) = session.registry.resolve_failure(id) else {
                    return CommitOutcome::Stale;
                };
                warn!(
                    operation_id = %id,
                    kind = op.request.kind.prefix(),
                    %reason,
                    "operation rejected"
                );
                let flight = session.in_flight.remove(id);
                self.roll_back(session, flight);
                CommitOutcome::RolledBack
            }
        }
    }

    fn apply_ack(
        &self,
        session: &mut Session,
        op: &PendingOperation,
        touched: Option<ItemId>,
        ack: &Value,
    ) -> CommitOutcome {
        match op.request.kind {
            OperationKind::CompleteOrder
            | OperationKind::HoldOrder
            | OperationKind::CancelOrder => {
                info!(
                    order_id = ?session.state.order_id.as_ref().map(OrderRef::as_str),
                    kind = op.request.kind.prefix(),
                    "order closed on server"
                );
                self.reset_session(session);
                return CommitOutcome::Confirmed;
            }
            OperationKind::AddItem => {
                if let Some(item_id) = touched {
                    if session.state.adding_item_id.as_ref() == Some(&item_id) {
                        session.state.adding_item_id = None;
                    }
                    if let (ItemId::Local(_), Some(server_id)) =
                        (&item_id, acknowledged_item_id(ack))
                    {
                        promote_item_id(&mut session.state, &item_id, ItemId::Server(server_id));
                    }
                }
            }
            OperationKind::UpdateQuantity => {
                if let Some(item_id) = touched {
                    session.state.updating_items.remove(&item_id);
                }
            }
            _ => {}
        }
        if session.state.order_number.is_none() {
            session.state.order_number = crate::value_str(ack, &["order_number"]);
        }
        CommitOutcome::Confirmed
    }

    /// Transient failure: keep the operation for the next retry, except for
    /// order closure, which falls back to the offline queue so the sale is
    /// never lost.
    fn defer(&self, session: &mut Session, id: &OperationId) -> CommitOutcome {
        match session.registry.get(id).map(|op| op.request.kind) {
            Some(OperationKind::CompleteOrder | OperationKind::CancelOrder) => {
                self.defer_offline(session, id)
            }
            Some(_) => {
                session.registry.mark_for_retry(id);
                CommitOutcome::Deferred
            }
            None => CommitOutcome::Stale,
        }
    }

    fn defer_offline(&self, session: &mut Session, id: &OperationId) -> CommitOutcome {
        let Some(op) = session.registry.get(id) else {
            return CommitOutcome::Stale;
        };
        let (status, reason) = match op.request.kind {
            OperationKind::CompleteOrder => (OrderStatus::Completed, None),
            OperationKind::CancelOrder => (
                OrderStatus::Cancelled,
                crate::value_str(&op.request.payload, &["reason"]),
            ),
            _ => {
                // Edits to an order that has no server side yet.
                session.registry.resolve_success(id);
                session.in_flight.remove(id);
                return CommitOutcome::LocalOnly;
            }
        };

        match self.persist_offline(&session.state, status, reason, Utc::now()) {
            Ok(local_id) => {
                info!(
                    operation_id = %id,
                    local_id = %local_id,
                    "order handed over to the offline queue"
                );
                session.registry.resolve_success(id);
                self.reset_session(session);
                CommitOutcome::PersistedOffline { local_id }
            }
            Err(e) => {
                error!(operation_id = %id, "offline fallback failed, will retry: {e}");
                session.registry.mark_for_retry(id);
                CommitOutcome::Deferred
            }
        }
    }

    fn open_stock_override(
        &self,
        session: &mut Session,
        id: &OperationId,
        message: String,
        available_quantity: Option<u32>,
    ) -> CommitOutcome {
        let Some(op) = session.registry.resolve_failure(id) else {
            return CommitOutcome::Stale;
        };
        let flight = session.in_flight.remove(id);
        let quantity_op = matches!(
            op.request.kind,
            OperationKind::AddItem | OperationKind::UpdateQuantity
        );

        let target = flight
            .as_ref()
            .and_then(|f| f.touched_item.clone())
            .filter(|_| quantity_op)
            .and_then(|item_id| session.state.item(&item_id).map(|item| (item_id, item.clone())));
        let Some((item_id, item)) = target else {
            self.roll_back(session, flight);
            return CommitOutcome::RolledBack;
        };

        let previous_quantity = flight
            .as_ref()
            .and_then(|f| f.snapshot.item(&item_id))
            .map(|previous| previous.quantity);
        info!(
            operation_id = %id,
            item_id = %item_id,
            requested = item.quantity,
            available = ?available_quantity,
            "insufficient stock, awaiting override"
        );
        if session.state.adding_item_id.as_ref() == Some(&item_id) {
            session.state.adding_item_id = None;
        }
        session.state.updating_items.remove(&item_id);
        session.state.stock_override_dialog = Some(StockOverrideDialog {
            operation_id: id.clone(),
            item_id,
            product_name: item.name().to_string(),
            requested_quantity: item.quantity,
            previous_quantity,
            available_quantity,
            message,
            request: op.request,
        });
        CommitOutcome::StockOverride
    }

    /// Undo a failed operation. If the cart is still exactly as the
    /// operation left it, the pre-mutation snapshot comes back whole.
    /// Otherwise other commands or acks landed in between, and only this
    /// operation's own changes are reverted on top of the current state.
    fn roll_back(&self, session: &mut Session, flight: Option<InFlight>) {
        let Some(flight) = flight else {
            return;
        };
        if session.state == flight.applied {
            session.state = flight.snapshot;
            return;
        }
        debug!("cart changed while the operation was in flight, reverting its own changes");
        revert_changes(&mut session.state, &flight.snapshot, &flight.applied);
        self.recompute_session(session);
    }
}

/// Apply the inverse of `before -> after` to `state`. Lines, adjustments and
/// discounts are matched by id; a quantity change is reverted as a delta so
/// later edits to the same line survive.
fn revert_changes(state: &mut CartState, before: &CartState, after: &CartState) {
    for added in after.items.iter().filter(|item| before.item(&item.id).is_none()) {
        state.items.retain(|item| item.id != added.id);
        state
            .adjustments
            .retain(|adj| adj.target_item_id.as_ref() != Some(&added.id));
        state.updating_items.remove(&added.id);
        if state.adding_item_id.as_ref() == Some(&added.id) {
            state.adding_item_id = None;
        }
    }

    for (position, previous) in before.items.iter().enumerate() {
        let Some(changed) = after.item(&previous.id) else {
            // Removed by the operation: put it back unless it is already there.
            if state.item(&previous.id).is_none() {
                let at = position.min(state.items.len());
                state.items.insert(at, previous.clone());
            }
            continue;
        };
        if changed.quantity != previous.quantity {
            state.updating_items.remove(&previous.id);
        }
        let Some(line) = state.item_mut(&previous.id) else {
            continue;
        };
        if changed.quantity != previous.quantity {
            let restored = i64::from(line.quantity) - i64::from(changed.quantity)
                + i64::from(previous.quantity);
            line.quantity = u32::try_from(restored)
                .ok()
                .filter(|quantity| *quantity > 0)
                .unwrap_or(previous.quantity);
        }
        if changed.price_at_sale != previous.price_at_sale
            && line.price_at_sale == changed.price_at_sale
        {
            line.price_at_sale = previous.price_at_sale;
        }
    }

    for added in &after.adjustments {
        if !before.adjustments.iter().any(|adj| adj.id == added.id) {
            state.adjustments.retain(|adj| adj.id != added.id);
        }
    }
    for previous in &before.adjustments {
        let removed = !after.adjustments.iter().any(|adj| adj.id == previous.id);
        if removed && !state.adjustments.iter().any(|adj| adj.id == previous.id) {
            state.adjustments.push(previous.clone());
        }
    }

    for added in &after.applied_discounts {
        if !before.applied_discounts.iter().any(|d| d.discount_id == added.discount_id) {
            state.applied_discounts.retain(|d| d.discount_id != added.discount_id);
        }
    }
    for previous in &before.applied_discounts {
        let unchanged = after
            .applied_discounts
            .iter()
            .any(|d| d.discount_id == previous.discount_id && d.value == previous.value);
        if unchanged {
            continue;
        }
        match state
            .applied_discounts
            .iter_mut()
            .find(|d| d.discount_id == previous.discount_id)
        {
            Some(current) => *current = previous.clone(),
            None => state.applied_discounts.push(previous.clone()),
        }
    }

    if after.status != before.status && state.status == after.status {
        state.status = before.status;
        state.payment_method = before.payment_method.clone();
        state.tip = before.tip;
    }
}

fn revert_line(state: &mut CartState, dialog: &StockOverrideDialog) {
    match dialog.previous_quantity {
        Some(quantity) => {
            if let Some(item) = state.item_mut(&dialog.item_id) {
                item.quantity = quantity;
            }
        }
        None => {
            state.items.retain(|item| item.id != dialog.item_id);
            state
                .adjustments
                .retain(|adj| adj.target_item_id.as_ref() != Some(&dialog.item_id));
        }
    }
    if state.adding_item_id.as_ref() == Some(&dialog.item_id) {
        state.adding_item_id = None;
    }
}

fn promote_item_id(state: &mut CartState, local: &ItemId, server: ItemId) {
    if state.item(&server).is_some() {
        return;
    }
    let Some(item) = state.items.iter_mut().find(|item| &item.id == local) else {
        return;
    };
    item.id = server.clone();
    for adjustment in &mut state.adjustments {
        if adjustment.target_item_id.as_ref() == Some(local) {
            adjustment.target_item_id = Some(server.clone());
        }
    }
    if state.updating_items.remove(local) {
        state.updating_items.insert(server.clone());
    }
    debug!(local = %local, server = %server, "line id confirmed by server");
}

/// Server line id from an add_item ack: `item_id`, `id` or `item.id`.
fn acknowledged_item_id(ack: &Value) -> Option<String> {
    let candidate = ack
        .get("item_id")
        .or_else(|| ack.get("id"))
        .or_else(|| ack.get("item").and_then(|item| item.get("id")))?;
    match candidate {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn new_adjustment_id() -> String {
    format!("adj-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::StandardCalculator;
    use crate::cart::model::CartItem;
    use crate::db::OfflineOrderStatus;
    use crate::test_support::{FakeGateway, StaticCatalog};
    use serde_json::json;

    fn product(id: &str) -> ProductRef {
        ProductRef {
            product_id: id.into(),
            name: format!("Product {id}"),
            tax_category: None,
            product_type: None,
        }
    }

    fn machine(gateway: Arc<FakeGateway>) -> (CartMachine, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::open_in_memory().expect("store"));
        let machine = CartMachine::new(
            gateway,
            Arc::new(StandardCalculator),
            Arc::new(StaticCatalog::default()),
            store.clone(),
            PricingSettings::default(),
            crate::money::DRIFT_TOLERANCE,
        );
        (machine, store)
    }

    #[tokio::test]
    async fn test_offline_adds_merge_without_network() {
        let gateway = FakeGateway::offline();
        let (cart, _store) = machine(gateway.clone());

        for _ in 0..2 {
            let commit = cart.add_item(product("P1"), 5.0, 1).unwrap();
            assert_eq!(commit.settle().await, CommitOutcome::LocalOnly);
        }

        let state = cart.snapshot();
        assert_eq!(state.items.len(), 1);
        assert_eq!(state.items[0].quantity, 2);
        assert_eq!(state.totals.subtotal, 10.0);
        assert!(matches!(state.order_id, Some(OrderRef::Local(_))));
        assert_eq!(gateway.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_optimistic_state_is_visible_before_settle() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());

        let commit = cart.add_item(product("P1"), 3.0, 2).unwrap();
        assert_eq!(cart.snapshot().totals.subtotal, 6.0);
        assert_eq!(gateway.sent_count(), 0);
        assert!(commit.operation_id().is_some());
        assert_eq!(commit.spawn().await.unwrap(), CommitOutcome::Confirmed);
        assert_eq!(gateway.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_rejection_restores_exact_snapshot() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());
        cart.add_item(product("P1"), 5.0, 1).unwrap().settle().await;
        let before = cart.snapshot();

        gateway.push_response(Err(GatewayError::Rejected("closed register".into())));
        let commit = cart.add_item(product("P2"), 7.5, 1).unwrap();
        assert_eq!(cart.snapshot().totals.subtotal, 12.5);
        assert_eq!(commit.settle().await, CommitOutcome::RolledBack);

        assert_eq!(cart.snapshot(), before);
        assert_eq!(cart.registry_stats().failed_total, 1);
    }

    fn product_ids(state: &CartState) -> Vec<&str> {
        state.items.iter().filter_map(CartItem::product_id).collect()
    }

    #[tokio::test]
    async fn test_rejection_keeps_lines_added_while_in_flight() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());
        cart.add_item(product("P0"), 1.0, 1).unwrap().settle().await;

        let first = cart.add_item(product("P1"), 2.0, 1).unwrap();
        let second = cart.add_item(product("P2"), 3.0, 1).unwrap();
        gateway.push_response(Err(GatewayError::Rejected("P1 unavailable".into())));

        assert_eq!(first.settle().await, CommitOutcome::RolledBack);
        assert_eq!(product_ids(&cart.snapshot()), ["P0", "P2"]);
        assert_eq!(second.settle().await, CommitOutcome::Confirmed);

        let state = cart.snapshot();
        assert_eq!(product_ids(&state), ["P0", "P2"]);
        assert_eq!(state.totals.subtotal, 4.0);
        assert_eq!(state.adding_item_id, None);
    }

    #[tokio::test]
    async fn test_two_rejections_in_flight_do_not_resurrect_lines() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());
        cart.add_item(product("P0"), 1.0, 1).unwrap().settle().await;

        let first = cart.add_item(product("P3"), 2.0, 1).unwrap();
        let second = cart.add_item(product("P4"), 3.0, 1).unwrap();
        gateway.push_response(Err(GatewayError::Rejected("closed register".into())));
        gateway.push_response(Err(GatewayError::Rejected("closed register".into())));

        assert_eq!(first.settle().await, CommitOutcome::RolledBack);
        assert_eq!(second.settle().await, CommitOutcome::RolledBack);

        let state = cart.snapshot();
        assert_eq!(product_ids(&state), ["P0"]);
        assert_eq!(state.totals.subtotal, 1.0);
        assert_eq!(cart.registry_stats().failed_total, 2);
    }

    #[tokio::test]
    async fn test_rejected_quantity_change_reverts_only_its_delta() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());
        cart.add_item(product("P0"), 2.0, 1).unwrap().settle().await;
        let line = cart.snapshot().items[0].id.clone();

        let update = cart.update_item_quantity(line.clone(), 3).unwrap();
        let add = cart.add_item(product("P5"), 4.0, 1).unwrap();
        gateway.push_response(Err(GatewayError::Rejected("quantity locked".into())));

        assert_eq!(update.settle().await, CommitOutcome::RolledBack);
        assert_eq!(add.settle().await, CommitOutcome::Confirmed);

        let state = cart.snapshot();
        assert_eq!(state.item(&line).map(|item| item.quantity), Some(1));
        assert!(!state.updating_items.contains(&line));
        assert_eq!(product_ids(&state), ["P0", "P5"]);
        assert_eq!(state.totals.subtotal, 6.0);
    }

    #[tokio::test]
    async fn test_rejected_retry_keeps_later_edits() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());

        gateway.push_response(Err(GatewayError::Transient("timeout".into())));
        let outcome = cart.add_item(product("P1"), 5.0, 1).unwrap().settle().await;
        assert_eq!(outcome, CommitOutcome::Deferred);

        let outcome = cart.add_item(product("P2"), 2.5, 2).unwrap().settle().await;
        assert_eq!(outcome, CommitOutcome::Confirmed);

        gateway.push_response(Err(GatewayError::Rejected("product retired".into())));
        assert_eq!(cart.retry_pending().await, vec![CommitOutcome::RolledBack]);

        let state = cart.snapshot();
        assert_eq!(product_ids(&state), ["P2"]);
        assert_eq!(state.totals.subtotal, 5.0);
        assert!(matches!(state.order_id, Some(OrderRef::Server(_))));
        assert_eq!(cart.registry_stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_ack_promotes_local_line_id() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());
        gateway.push_response(Ok(json!({ "item_id": "srv-9", "order_number": "A-1" })));

        let outcome = cart.add_item(product("P1"), 5.0, 1).unwrap().settle().await;
        assert_eq!(outcome, CommitOutcome::Confirmed);

        let state = cart.snapshot();
        assert_eq!(state.items[0].id, ItemId::Server("srv-9".into()));
        assert_eq!(state.adding_item_id, None);
        assert_eq!(state.order_number.as_deref(), Some("A-1"));
    }

    #[tokio::test]
    async fn test_stock_override_cancel_and_force() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());

        gateway.push_response(Err(GatewayError::InsufficientStock {
            message: "Only 1 left".into(),
            available_quantity: Some(1),
        }));
        let outcome = cart.add_item(product("P1"), 4.0, 3).unwrap().settle().await;
        assert_eq!(outcome, CommitOutcome::StockOverride);

        let state = cart.snapshot();
        let dialog = state.stock_override_dialog.clone().expect("dialog");
        assert_eq!(dialog.requested_quantity, 3);
        assert_eq!(dialog.previous_quantity, None);
        assert_eq!(dialog.available_quantity, Some(1));
        assert_eq!(state.items.len(), 1);

        cart.cancel_stock_override().unwrap();
        let state = cart.snapshot();
        assert!(state.items.is_empty());
        assert_eq!(state.totals.subtotal, 0.0);
        assert_eq!(cart.cancel_stock_override(), Err(CartError::NoStockOverride));

        gateway.push_response(Err(GatewayError::InsufficientStock {
            message: "Only 1 left".into(),
            available_quantity: Some(1),
        }));
        cart.add_item(product("P1"), 4.0, 3).unwrap().settle().await;
        let outcome = cart.force_add_item().unwrap().settle().await;
        assert_eq!(outcome, CommitOutcome::Confirmed);
        assert_eq!(gateway.last_sent().expect("sent").payload["force"], json!(true));
        assert_eq!(cart.snapshot().items[0].quantity, 3);
    }

    #[tokio::test]
    async fn test_server_approval_flow() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());
        cart.add_item(product("P1"), 10.0, 1).unwrap().settle().await;
        let item_id = cart.snapshot().items[0].id.clone();

        gateway.push_response(Err(GatewayError::ApprovalRequired {
            reason: "Override needs a manager".into(),
        }));
        let outcome = cart
            .apply_price_override(item_id.clone(), 6.0, Some("damaged".into()))
            .unwrap()
            .settle()
            .await;
        assert_eq!(outcome, CommitOutcome::ApprovalRequired);

        let state = cart.snapshot();
        assert_eq!(state.items[0].price_at_sale, 10.0);
        assert!(state.adjustments.is_empty());
        assert!(state.approval_request.is_some());

        let outcome = cart.approve_request("mgr-7").unwrap().settle().await;
        assert_eq!(outcome, CommitOutcome::Confirmed);
        let state = cart.snapshot();
        assert_eq!(state.items[0].price_at_sale, 6.0);
        assert_eq!(state.adjustments[0].approved_by_user_id.as_deref(), Some("mgr-7"));
        assert_eq!(
            gateway.last_sent().expect("sent").payload["approved_by_user_id"],
            json!("mgr-7")
        );
        assert_eq!(cart.cancel_approval(), Err(CartError::NoApprovalRequest));
    }

    #[tokio::test]
    async fn test_failed_approval_keeps_request_open() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());
        cart.add_item(product("P1"), 10.0, 1).unwrap().settle().await;
        let item_id = cart.snapshot().items[0].id.clone();

        gateway.push_response(Err(GatewayError::ApprovalRequired {
            reason: "Override needs a manager".into(),
        }));
        let outcome = cart
            .apply_price_override(item_id.clone(), 6.0, None)
            .unwrap()
            .settle()
            .await;
        assert_eq!(outcome, CommitOutcome::ApprovalRequired);
        cart.remove_item(item_id.clone()).unwrap().settle().await;

        assert_eq!(
            cart.approve_request("mgr-7").err(),
            Some(CartError::ItemNotFound(item_id))
        );
        assert!(cart.snapshot().approval_request.is_some());
        assert_eq!(cart.cancel_approval(), Ok(()));
    }

    #[tokio::test]
    async fn test_stale_continuation_is_discarded_after_reset() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());

        let commit = cart.add_item(product("P1"), 5.0, 1).unwrap();
        cart.reset_cart();
        assert_eq!(commit.settle().await, CommitOutcome::Stale);
        assert_eq!(gateway.sent_count(), 0);
        assert!(cart.snapshot().is_empty());
        assert_eq!(cart.registry_stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());

        gateway.push_response(Err(GatewayError::Transient("timeout".into())));
        let outcome = cart.add_item(product("P1"), 5.0, 1).unwrap().settle().await;
        assert_eq!(outcome, CommitOutcome::Deferred);
        assert_eq!(cart.snapshot().items.len(), 1);
        assert_eq!(cart.registry_stats().awaiting_retry, 1);

        assert_eq!(cart.retry_pending().await, vec![CommitOutcome::Confirmed]);
        assert_eq!(cart.registry_stats().in_flight, 0);
        assert_eq!(gateway.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_online_completion_falls_back_to_offline_queue() {
        let gateway = FakeGateway::online();
        let (cart, store) = machine(gateway.clone());
        cart.add_item(product("P1"), 5.0, 2).unwrap().settle().await;
        let epoch = cart.epoch();

        gateway.push_response(Err(GatewayError::Transient("connection reset".into())));
        let commit = cart.complete_order(Some("cash".into()), 0.0).unwrap();
        assert_eq!(cart.snapshot().status, OrderStatus::Pending);
        let outcome = commit.settle().await;
        assert!(matches!(outcome, CommitOutcome::PersistedOffline { .. }));

        let queued = store.list_offline_orders(Some(OfflineOrderStatus::Pending)).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].server_order_id.as_deref(), Some("ord-1"));
        assert_eq!(queued[0].order.totals.subtotal, 10.0);
        assert!(cart.snapshot().is_empty());
        assert!(cart.epoch() > epoch);
    }

    #[tokio::test]
    async fn test_offline_completion_persists_and_resets() {
        let gateway = FakeGateway::offline();
        let (cart, store) = machine(gateway.clone());
        cart.add_item(product("P1"), 5.0, 1).unwrap().settle().await;
        assert_eq!(cart.hold_order().err(), Some(CartError::HoldUnavailableOffline));

        let outcome = cart.complete_order(Some("card".into()), 1.0).unwrap().settle().await;
        let CommitOutcome::PersistedOffline { local_id } = outcome else {
            panic!("expected offline persistence, got {outcome:?}");
        };
        assert!(local_id.starts_with("offline-"));

        let queued = store.list_offline_orders(None).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].server_order_id, None);
        assert_eq!(queued[0].order.totals.total, 6.0);
        assert!(cart.snapshot().is_empty());
        assert!(gateway.cleared_count() >= 1);
        assert_eq!(gateway.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_hold_confirmation_resets_cart() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());
        cart.add_item(product("P1"), 5.0, 1).unwrap().settle().await;

        let commit = cart.hold_order().unwrap();
        assert_eq!(cart.snapshot().status, OrderStatus::Hold);
        assert_eq!(commit.settle().await, CommitOutcome::Confirmed);
        assert!(cart.snapshot().is_empty());
        assert_eq!(gateway.sent_kinds().last(), Some(&OperationKind::HoldOrder));
    }

    #[tokio::test]
    async fn test_server_push_only_applies_to_current_order() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());
        gateway.push_response(Ok(json!({ "item_id": "line-1" })));
        cart.add_item(product("P1"), 10.0, 2).unwrap().settle().await;

        let mut push = ServerOrderSnapshot {
            order_id: "other".into(),
            order_number: None,
            status: None,
            items: vec![],
            subtotal: 19.5,
            tax: 0.0,
            total: 19.5,
            discount_total: 0.0,
            adjustment_total: 0.0,
            adjustments: vec![],
            applied_discounts: vec![],
        };
        assert_eq!(cart.apply_server_snapshot(&push), None);

        push.order_id = "ord-1".into();
        push.items = vec![crate::cart::reconcile::ServerOrderItem {
            id: "line-1".into(),
            product_id: Some("P1".into()),
            name: "Product P1".into(),
            quantity: 2,
            price_at_sale: 10.0,
            modifiers: vec![],
            notes: None,
            tax_category: None,
            product_type: None,
        }];
        let report = cart.apply_server_snapshot(&push).expect("applied");
        assert!(!report.item_drift);
        let state = cart.snapshot();
        assert_eq!(state.totals.subtotal, 19.5);
        assert_eq!(state.totals.total, 19.5);
    }

    #[tokio::test]
    async fn test_resume_rehydrates_held_order() {
        let gateway = FakeGateway::online();
        let (cart, _store) = machine(gateway.clone());
        let held = ServerOrderSnapshot {
            order_id: "ord-77".into(),
            order_number: Some("B-3".into()),
            status: Some(OrderStatus::Hold),
            items: vec![crate::cart::reconcile::ServerOrderItem {
                id: "l-1".into(),
                product_id: Some("P1".into()),
                name: "Soup".into(),
                quantity: 1,
                price_at_sale: 8.0,
                modifiers: vec![],
                notes: None,
                tax_category: None,
                product_type: None,
            }],
            subtotal: 8.0,
            tax: 0.0,
            total: 8.0,
            discount_total: 0.0,
            adjustment_total: 0.0,
            adjustments: vec![],
            applied_discounts: vec![],
        };
        let epoch = cart.epoch();
        cart.resume_cart(held).await.unwrap();

        let state = cart.snapshot();
        assert_eq!(state.order_id, Some(OrderRef::Server("ord-77".into())));
        assert_eq!(state.status, OrderStatus::Draft);
        assert_eq!(state.totals.subtotal, 8.0);
        assert_eq!(cart.epoch(), epoch + 1);
        assert_eq!(gateway.initialized(), vec![OrderRef::Server("ord-77".into())]);
    }

    #[tokio::test]
    async fn test_command_log_replays_current_session() {
        let gateway = FakeGateway::offline();
        let (cart, _store) = machine(gateway);
        cart.add_item(product("P1"), 5.0, 1).unwrap().settle().await;
        cart.add_item(product("P1"), 5.0, 1).unwrap().settle().await;
        cart.add_item(product("P2"), 2.0, 3).unwrap().settle().await;

        let replayed = cart.replay_session();
        let live = cart.snapshot();
        assert_eq!(replayed.items.len(), live.items.len());
        assert_eq!(replayed.totals, live.totals);
        assert_eq!(cart.command_log().len(), 3);
    }
}
