//! The execution controller: opens, reduces and closes positions.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;

use super::advisory::{SlUpdateHistory, SlUpdateRecord, validate_stop_update};
use super::funding::{FundingDecision, assess_entry};
use super::ledger::{CloseLedger, ExitSettlement, recover_exit};
use super::pending::{PendingEntry, PendingEntryBook, PendingResolution, resolve};
use super::sizing::PositionSizer;
use super::{
    CloseOutcome, CloseReport, ExecutionError, OpenOutcome, OpenReport, PendingSweepReport,
    StopUpdate,
};
use crate::config::Config;
use crate::domain::{
    CloseReason, EntryType, InstrumentRules, NewPosition, Position, ProtectionState, Side,
    TradeProposal, TradingMode,
};
use crate::gateway::{
    GatewayError, OrderGateway, OrderRequest, OrderSnapshot, RetryPolicy, cancel_idempotent,
};
use crate::observability::metrics;
use crate::persistence::ClosedTradeRecord;
use crate::protection::{EmergencyCloser, ProtectiveOrders};
use crate::registry::{ClaimGuard, PositionRegistry};
use crate::risk::{AllocationReservation, EntryCandidate, RejectReason, RiskGate};
use crate::tpsl::{self, StopMove};

/// A confirmed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Filled {
    quantity: Decimal,
    price: Decimal,
}

impl Filled {
    /// The order is done and at least partly filled.
    fn from_order(order: &OrderSnapshot) -> Option<Self> {
        if order.status.is_open() || order.filled_qty <= Decimal::ZERO {
            return None;
        }
        let price = order.avg_price.or(order.price)?;
        Some(Self {
            quantity: order.filled_qty,
            price,
        })
    }
}

/// Volume-weighted accumulation of exit fills.
#[derive(Debug, Default)]
struct ExitFills {
    quantity: Decimal,
    notional: Decimal,
}

impl ExitFills {
    fn add(&mut self, fill: Filled) {
        self.quantity += fill.quantity;
        self.notional += fill.quantity * fill.price;
    }

    fn average(&self) -> Option<Filled> {
        (self.quantity > Decimal::ZERO).then(|| Filled {
            quantity: self.quantity,
            price: self.notional / self.quantity,
        })
    }
}

/// Opens, reduces and closes positions.
pub struct ExecutionController {
    config: Arc<Config>,
    gateway: Arc<dyn OrderGateway>,
    registry: Arc<PositionRegistry>,
    risk: Arc<RiskGate>,
    orders: Arc<ProtectiveOrders>,
    ledger: Arc<CloseLedger>,
    retry: RetryPolicy,
    sizer: PositionSizer,
    pending: PendingEntryBook,
    advisory_history: SlUpdateHistory,
}

impl std::fmt::Debug for ExecutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionController")
            .field("sizer", &self.sizer)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionController {
    /// Wire the controller. The gateway is the one protective orders use.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        registry: Arc<PositionRegistry>,
        risk: Arc<RiskGate>,
        orders: Arc<ProtectiveOrders>,
        ledger: Arc<CloseLedger>,
    ) -> Self {
        let sizer = PositionSizer::new(config.entry.clone(), config.engine.risk_level);
        let advisory_history = SlUpdateHistory::new(config.advisory.history_len);
        Self {
            gateway: Arc::clone(orders.gateway()),
            retry: config.retry.clone(),
            config,
            registry,
            risk,
            orders,
            ledger,
            sizer,
            pending: PendingEntryBook::new(),
            advisory_history,
        }
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Exchange gateway.
    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn OrderGateway> {
        &self.gateway
    }

    /// Position registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PositionRegistry> {
        &self.registry
    }

    /// Entry gates.
    #[must_use]
    pub fn risk(&self) -> &Arc<RiskGate> {
        &self.risk
    }

    /// Protective order placer.
    #[must_use]
    pub fn orders(&self) -> &Arc<ProtectiveOrders> {
        &self.orders
    }

    /// Closed-trade bookkeeping.
    #[must_use]
    pub fn ledger(&self) -> &Arc<CloseLedger> {
        &self.ledger
    }

    /// Resting limit entries.
    #[must_use]
    pub const fn pending(&self) -> &PendingEntryBook {
        &self.pending
    }

    /// Advisory stop update attempts.
    #[must_use]
    pub const fn advisory_history(&self) -> &SlUpdateHistory {
        &self.advisory_history
    }

    // ------------------------------------------------------------------
    // Entry
    // ------------------------------------------------------------------

    /// Run a proposal through every gate and, if it passes, open the position.
    ///
    /// Gate refusals come back as [`OpenOutcome::Rejected`]; only exchange
    /// failures and unconfirmed fills are errors.
    pub async fn open_position(&self, proposal: TradeProposal) -> Result<OpenOutcome, ExecutionError> {
        let Some(side) = proposal.side() else {
            let action = proposal.action;
            return Ok(self.reject(&proposal, RejectReason::NotDirectional { action }));
        };
        let mode = proposal.mode;
        let mode_config = self.config.modes.get(mode);
        if !mode_config.enabled {
            return Ok(self.reject(&proposal, RejectReason::ModeDisabled { mode }));
        }
        if self.registry.contains(&proposal.symbol) {
            return Ok(self.reject(&proposal, RejectReason::AlreadyOpen));
        }
        let Some(claim) = self.registry.try_claim(&proposal.symbol) else {
            let reason = if self.registry.contains(&proposal.symbol) {
                RejectReason::AlreadyOpen
            } else {
                RejectReason::EntryInFlight
            };
            return Ok(self.reject(&proposal, reason));
        };

        let now = Utc::now();
        if let Some(block) = self.risk.blocklist().check(&proposal.symbol, now) {
            return Ok(self.reject(&proposal, RejectReason::InstrumentBlocked(block)));
        }

        let symbol = proposal.symbol.as_str();
        let balance = self.gateway.balance().await?;
        let mut notional = match self.sizer.size(
            balance.available,
            mode_config,
            proposal.confidence,
            proposal.size_hint_usd,
        ) {
            Ok(notional) => notional,
            Err(reason) => return Ok(self.reject(&proposal, reason)),
        };

        let funding = self.gateway.funding(symbol).await.unwrap_or_else(|e| {
            tracing::warn!(symbol = %symbol, error = %e, "Funding unavailable, sizing without it");
            None
        });
        match assess_entry(&self.config.funding, side, funding.as_ref(), now) {
            FundingDecision::Proceed => {}
            FundingDecision::Block { cost_pct } => {
                return Ok(self.reject(&proposal, RejectReason::FundingCost { rate_pct: cost_pct }));
            }
            FundingDecision::Shrink { factor, cost_pct } => {
                notional = (notional * factor).round_dp(2);
                tracing::info!(
                    symbol = %symbol,
                    cost_pct = %cost_pct,
                    notional = %notional,
                    "Entry size reduced for funding cost"
                );
                let minimum = self.config.entry.min_order_usd;
                if notional < minimum {
                    return Ok(self.reject(&proposal, RejectReason::SizeTooSmall { notional, minimum }));
                }
            }
        }

        let rules = self.orders.rules().get(self.gateway.as_ref(), symbol).await?;
        let price = match proposal.entry {
            EntryType::Limit { price } => rules.round_price(price),
            EntryType::Market => self.gateway.mark_price(symbol).await?,
        };
        if price <= Decimal::ZERO {
            return Err(GatewayError::Unknown {
                message: format!("no usable price for {symbol}"),
            }
            .into());
        }
        let quantity = rules.round_qty(notional / price);
        if rules.is_dust(quantity) || quantity * price < rules.min_notional {
            return Ok(self.reject(&proposal, RejectReason::DustQuantity { quantity }));
        }

        let candidate = EntryCandidate {
            symbol,
            mode,
            notional,
            leverage: mode_config.leverage,
            balance: balance.total,
        };
        let reservation = match self.risk.evaluate_entry(&candidate, now) {
            Ok(reservation) => reservation,
            Err(reason) => return Ok(self.reject(&proposal, reason)),
        };

        match proposal.entry {
            EntryType::Market => {
                self.enter_market(proposal, side, quantity, &rules, claim, reservation)
                    .await
            }
            EntryType::Limit { .. } => {
                self.enter_limit(proposal, side, quantity, price, &rules, claim, reservation)
                    .await
            }
        }
    }

    async fn enter_market(
        &self,
        proposal: TradeProposal,
        side: Side,
        quantity: Decimal,
        rules: &InstrumentRules,
        claim: ClaimGuard,
        reservation: AllocationReservation,
    ) -> Result<OpenOutcome, ExecutionError> {
        let symbol = proposal.symbol.as_str();
        let request = OrderRequest::market(symbol, side.entry_side(), quantity);
        let placed = match self.gateway.place_order(request).await {
            Ok(placed) => placed,
            Err(e) => return self.entry_refused(&proposal, e),
        };

        let Some(fill) = self.confirm_fill(&placed).await else {
            tracing::error!(
                symbol = %symbol,
                order_id = %placed.order_id,
                "Entry fill not confirmed, position not tracked"
            );
            if let Err(e) = cancel_idempotent(self.gateway.as_ref(), symbol, &placed.order_id).await {
                tracing::warn!(symbol = %symbol, error = %e, "Could not cancel unconfirmed entry");
            }
            return Err(ExecutionError::FillUnconfirmed {
                symbol: symbol.to_string(),
                order_id: placed.order_id,
            });
        };

        let entry_fee = self.config.fees.taker_fee(fill.quantity * fill.price);
        self.commit_entry(&proposal, side, fill, entry_fee, rules, claim, reservation)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn enter_limit(
        &self,
        proposal: TradeProposal,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        rules: &InstrumentRules,
        claim: ClaimGuard,
        reservation: AllocationReservation,
    ) -> Result<OpenOutcome, ExecutionError> {
        let symbol = proposal.symbol.clone();
        let request = OrderRequest::limit(&symbol, side.entry_side(), quantity, price);
        let placed = match self.gateway.place_order(request).await {
            Ok(placed) => placed,
            Err(e) => return self.entry_refused(&proposal, e),
        };

        if let Some(fill) = Filled::from_order(&placed) {
            let entry_fee = self.config.fees.maker_fee(fill.quantity * fill.price);
            return self
                .commit_entry(&proposal, side, fill, entry_fee, rules, claim, reservation)
                .await;
        }

        let now = Utc::now();
        let deadline = now + chrono::Duration::seconds(self.config.entry.limit_timeout_secs as i64);
        let leverage = self.config.modes.get(proposal.mode).leverage;
        tracing::info!(
            symbol = %symbol,
            order_id = %placed.order_id,
            price = %price,
            quantity = %quantity,
            deadline = %deadline,
            "Limit entry resting"
        );
        let order_id = placed.order_id.clone();
        self.pending.insert(PendingEntry::new(
            placed.order_id,
            proposal,
            side,
            quantity,
            price,
            leverage,
            now,
            deadline,
            claim,
            reservation,
        ));
        Ok(OpenOutcome::Pending { order_id })
    }

    /// Map an entry placement failure: venue refusals are rejections.
    fn entry_refused(
        &self,
        proposal: &TradeProposal,
        error: GatewayError,
    ) -> Result<OpenOutcome, ExecutionError> {
        match error {
            GatewayError::OrderRejected { reason } => {
                Ok(self.reject(proposal, RejectReason::ExchangeRejected { reason }))
            }
            e @ GatewayError::InsufficientMargin => Ok(self.reject(
                proposal,
                RejectReason::ExchangeRejected {
                    reason: e.to_string(),
                },
            )),
            e => Err(e.into()),
        }
    }

    /// Turn a confirmed fill into a tracked, protected position.
    #[allow(clippy::too_many_arguments)]
    async fn commit_entry(
        &self,
        proposal: &TradeProposal,
        side: Side,
        fill: Filled,
        entry_fee: Decimal,
        rules: &InstrumentRules,
        claim: ClaimGuard,
        reservation: AllocationReservation,
    ) -> Result<OpenOutcome, ExecutionError> {
        let symbol = proposal.symbol.as_str();
        let mode_config = self.config.modes.get(proposal.mode);
        let stop_price = tpsl::resolve_stop(side, fill.price, proposal.suggested_stop, mode_config, rules);
        let take_profits = tpsl::build_ladder(
            side,
            fill.price,
            mode_config,
            rules,
            &proposal.suggested_targets,
        );
        let targets: Vec<Decimal> = take_profits.iter().map(|level| level.price).collect();
        let now = Utc::now();

        let position = Position::open(
            NewPosition {
                symbol: symbol.to_string(),
                side,
                mode: proposal.mode,
                entry_price: fill.price,
                quantity: fill.quantity,
                leverage: mode_config.leverage,
                stop_price,
                take_profits,
                trailing: mode_config.trailing.params(),
                provenance: proposal.provenance.clone(),
                custom_roi_target_pct: proposal.custom_roi_target_pct,
                entry_fee,
            },
            now,
        );
        if !claim.commit(position) {
            tracing::warn!(
                symbol = %symbol,
                "Symbol became tracked while the entry was in flight, fill left to reconciliation"
            );
            return Ok(self.reject(proposal, RejectReason::AlreadyOpen));
        }
        drop(reservation);

        self.risk.record_open(proposal.mode, now);
        metrics::record_entry(proposal.mode.as_str(), &proposal.provenance.to_string());
        metrics::update_open_positions(self.registry.len());
        self.persist(symbol);
        tracing::info!(
            symbol = %symbol,
            side = %side,
            mode = %proposal.mode,
            quantity = %fill.quantity,
            entry_price = %fill.price,
            stop = %stop_price,
            "Position opened"
        );

        let protection = match self.orders.establish(&self.registry, symbol).await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::error!(
                    symbol = %symbol,
                    error = %e,
                    "Initial protection failed, guardian will heal"
                );
                None
            }
        };
        self.persist(symbol);

        Ok(OpenOutcome::Opened(OpenReport {
            symbol: symbol.to_string(),
            side,
            mode: proposal.mode,
            quantity: fill.quantity,
            entry_price: fill.price,
            stop_price,
            targets,
            protection,
        }))
    }

    fn reject(&self, proposal: &TradeProposal, reason: RejectReason) -> OpenOutcome {
        metrics::record_rejection(proposal.mode.as_str(), reason.label());
        tracing::info!(
            symbol = %proposal.symbol,
            mode = %proposal.mode,
            reason = %reason,
            "Entry rejected"
        );
        OpenOutcome::Rejected(reason)
    }

    /// Wait for an order to fill, polling its status.
    async fn confirm_fill(&self, placed: &OrderSnapshot) -> Option<Filled> {
        if let Some(fill) = Filled::from_order(placed) {
            return Some(fill);
        }
        let interval = self.config.entry.fill_poll_interval();
        for attempt in 1..=self.config.entry.fill_poll_attempts {
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            match self.gateway.order_status(&placed.symbol, &placed.order_id).await {
                Ok(order) if !order.status.is_open() => return Filled::from_order(&order),
                Ok(_) => {}
                Err(e) => tracing::debug!(
                    symbol = %placed.symbol,
                    order_id = %placed.order_id,
                    attempt,
                    error = %e,
                    "Fill status poll failed"
                ),
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Pending limit entries
    // ------------------------------------------------------------------

    /// Resolve resting limit entries: commit fills, cancel expired orders.
    pub async fn sweep_pending(&self, now: DateTime<Utc>) -> PendingSweepReport {
        let mut report = PendingSweepReport::default();
        for (symbol, order_id, deadline) in self.pending.outstanding() {
            let order = match self.gateway.order_status(&symbol, &order_id).await {
                Ok(order) => order,
                Err(GatewayError::OrderNotFound { .. }) => {
                    tracing::warn!(symbol = %symbol, order_id = %order_id, "Pending entry order vanished");
                    self.pending.take(&symbol);
                    report.cancelled.push(symbol);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(symbol = %symbol, error = %e, "Could not check pending entry");
                    report.waiting += 1;
                    continue;
                }
            };

            match resolve(&order, deadline, now, self.config.entry.partial_completion_pct) {
                PendingResolution::Wait => report.waiting += 1,
                PendingResolution::Filled { quantity, price } => {
                    if self.commit_pending(&symbol, Filled { quantity, price }).await {
                        report.opened.push(symbol);
                    }
                }
                PendingResolution::AcceptPartial { quantity, price } => {
                    if let Err(e) = cancel_idempotent(self.gateway.as_ref(), &symbol, &order_id).await {
                        tracing::warn!(symbol = %symbol, error = %e, "Could not cancel limit remainder");
                    }
                    tracing::info!(
                        symbol = %symbol,
                        filled = %quantity,
                        requested = %order.quantity,
                        "Accepting partial limit fill"
                    );
                    if self.commit_pending(&symbol, Filled { quantity, price }).await {
                        report.opened.push(symbol);
                    }
                }
                PendingResolution::Cancel { filled } => {
                    if let Err(e) = cancel_idempotent(self.gateway.as_ref(), &symbol, &order_id).await {
                        tracing::warn!(symbol = %symbol, error = %e, "Could not cancel expired limit entry");
                    }
                    self.pending.take(&symbol);
                    if filled > Decimal::ZERO {
                        tracing::warn!(
                            symbol = %symbol,
                            filled = %filled,
                            "Partial limit fill below threshold, left to reconciliation"
                        );
                    } else {
                        tracing::info!(symbol = %symbol, order_id = %order_id, "Limit entry expired");
                    }
                    report.cancelled.push(symbol);
                }
            }
        }
        report
    }

    async fn commit_pending(&self, symbol: &str, fill: Filled) -> bool {
        let Some(entry) = self.pending.take(symbol) else {
            return false;
        };
        let side = entry.side;
        let (proposal, claim, reservation) = entry.into_parts();
        let rules = match self.orders.rules().get(self.gateway.as_ref(), symbol).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(
                    symbol = %symbol,
                    error = %e,
                    "Limit entry filled but rules unavailable, fill left to reconciliation"
                );
                return false;
            }
        };
        let entry_fee = self.config.fees.maker_fee(fill.quantity * fill.price);
        match self
            .commit_entry(&proposal, side, fill, entry_fee, &rules, claim, reservation)
            .await
        {
            Ok(outcome) => outcome.is_opened(),
            Err(e) => {
                tracing::error!(symbol = %symbol, error = %e, "Could not commit limit entry");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Exit
    // ------------------------------------------------------------------

    /// Close whatever remains of `symbol`.
    ///
    /// Concurrent calls are serialized by the closing guard: the second one
    /// returns [`CloseOutcome::Skipped`].
    pub async fn close_position(
        &self,
        symbol: &str,
        reason: CloseReason,
    ) -> Result<CloseOutcome, ExecutionError> {
        let Some(position) = self.registry.begin_close(symbol) else {
            tracing::debug!(symbol = %symbol, reason = %reason, "Close skipped, nothing to close");
            return Ok(CloseOutcome::Skipped);
        };
        tracing::info!(
            symbol = %symbol,
            side = %position.side,
            reason = %reason,
            quantity = %position.remaining_qty(),
            "Closing position"
        );

        let cancelled = self.orders.cancel_all(symbol, position.side).await;
        tracing::debug!(symbol = %symbol, cancelled, "Protective orders cancelled before exit");

        let error = match self.exit(&position, reason).await {
            Ok(fill) => return self.finish_exit(&position, reason, fill).await,
            Err(e) => e,
        };
        if let ExecutionError::Gateway(GatewayError::OrderRejected { reason: venue }) = &error
            && !self.exchange_holds(&position).await
        {
            tracing::warn!(
                symbol = %symbol,
                venue_reason = %venue,
                "Exit rejected and no exchange position, treating as closed externally"
            );
            return Ok(self.settle_vanished(symbol).await);
        }
        tracing::error!(symbol = %symbol, reason = %reason, error = %error, "Exit failed");
        self.release_after_failed_exit(symbol);
        Err(error)
    }

    /// Execute the exit orders. A limit attempt comes first for non-urgent
    /// reasons; any remainder goes out at market.
    async fn exit(&self, position: &Position, reason: CloseReason) -> Result<Filled, ExecutionError> {
        let symbol = position.symbol.as_str();
        let mut fills = ExitFills::default();

        if self.config.entry.close_with_limit && !reason.is_urgent() {
            match self.limit_exit(position).await {
                Ok(Some(fill)) => fills.add(fill),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    symbol = %symbol,
                    error = %e,
                    "Limit exit failed, falling back to market"
                ),
            }
        }

        let remaining = position.remaining_qty() - fills.quantity;
        if remaining > Decimal::ZERO {
            let request = OrderRequest::market(symbol, position.side.exit_side(), remaining).reduce_only();
            let gateway = &self.gateway;
            let request = &request;
            let placed = self
                .retry
                .run("exit_market", || gateway.place_order(request.clone()))
                .await?;
            match self.confirm_fill(&placed).await {
                Some(fill) => fills.add(fill),
                None if fills.quantity.is_zero() => {
                    return Err(ExecutionError::ExitUnfilled {
                        symbol: symbol.to_string(),
                        order_id: placed.order_id,
                    });
                }
                None => tracing::warn!(
                    symbol = %symbol,
                    order_id = %placed.order_id,
                    "Market exit unconfirmed after partial limit exit"
                ),
            }
        }

        fills.average().ok_or_else(|| ExecutionError::ExitUnfilled {
            symbol: symbol.to_string(),
            order_id: String::new(),
        })
    }

    /// Marketable reduce-only limit just through the mark.
    async fn limit_exit(&self, position: &Position) -> Result<Option<Filled>, ExecutionError> {
        let symbol = position.symbol.as_str();
        let rules = self.orders.rules().get(self.gateway.as_ref(), symbol).await?;
        let mark = self.gateway.mark_price(symbol).await?;
        let price = rules.round_price(
            position
                .side
                .adverse(mark, self.config.entry.close_limit_buffer_pct),
        );
        let request = OrderRequest::limit(
            symbol,
            position.side.exit_side(),
            position.remaining_qty(),
            price,
        )
        .reduce_only();
        let placed = self.gateway.place_order(request).await?;
        if let Some(fill) = self.confirm_fill(&placed).await {
            return Ok(Some(fill));
        }

        cancel_idempotent(self.gateway.as_ref(), symbol, &placed.order_id).await?;
        let partial = self
            .gateway
            .order_status(symbol, &placed.order_id)
            .await
            .ok()
            .and_then(|order| Filled::from_order(&order));
        Ok(partial)
    }

    /// Book an executed exit: partial exits stay open, full exits settle.
    async fn finish_exit(
        &self,
        position: &Position,
        reason: CloseReason,
        fill: Filled,
    ) -> Result<CloseOutcome, ExecutionError> {
        let symbol = position.symbol.as_str();
        let rules = self
            .orders
            .rules()
            .get(self.gateway.as_ref(), symbol)
            .await
            .unwrap_or_default();
        let exit_fee = self.config.fees.taker_fee(fill.quantity * fill.price);
        let now = Utc::now();

        let booked = self.registry.update(symbol, |p| {
            let original = p.original_qty;
            let closed = p.reduce_quantity(fill.quantity);
            let entry_fee_share = if original.is_zero() {
                Decimal::ZERO
            } else {
                p.entry_fee * closed / original
            };
            let pnl = (fill.price - p.entry_price) * closed * p.side.sign() - exit_fee - entry_fee_share;
            let remaining = p.remaining_qty();
            let done = remaining.is_zero() || rules.is_dust(remaining);
            if !done {
                p.realized_pnl += pnl;
                p.end_close();
                p.stop_order_id = None;
                p.target_order_id = None;
                if let Err(e) = p.protection.mark_stop_missing(now) {
                    tracing::warn!(symbol = %p.symbol, error = %e, "Could not record missing stop");
                }
            }
            (closed, pnl, remaining, done)
        });
        let Some((closed, pnl, remaining, done)) = booked else {
            tracing::warn!(symbol = %symbol, "Position vanished during exit");
            return Ok(CloseOutcome::Skipped);
        };

        if !done {
            tracing::warn!(
                symbol = %symbol,
                closed = %closed,
                remaining = %remaining,
                "Exit filled in part, remainder handed back for protection"
            );
            self.persist(symbol);
            return Ok(CloseOutcome::Partial { closed, remaining });
        }

        let Some(removed) = self.registry.remove(symbol) else {
            return Ok(CloseOutcome::Skipped);
        };
        if remaining > Decimal::ZERO {
            tracing::warn!(symbol = %symbol, dust = %remaining, "Dust remainder left on the exchange");
            metrics::record_dust(symbol);
        }
        self.advisory_history.clear(symbol);
        let record = self.ledger.settle(
            &removed,
            ExitSettlement {
                quantity: closed,
                exit_price: fill.price,
                pnl,
                reason,
                closed_at: now,
            },
        );
        Ok(CloseOutcome::Closed(close_report(record)))
    }

    /// Whether the exchange still holds `position`'s side. Unknown counts as held.
    async fn exchange_holds(&self, position: &Position) -> bool {
        match self.gateway.positions().await {
            Ok(positions) => positions.iter().any(|p| {
                p.symbol == position.symbol && p.side == position.side && p.quantity > Decimal::ZERO
            }),
            Err(e) => {
                tracing::warn!(symbol = %position.symbol, error = %e, "Could not list exchange positions");
                true
            }
        }
    }

    /// Settle a position the exchange no longer holds, recovering the exit
    /// from recent fills.
    pub(crate) async fn settle_vanished(&self, symbol: &str) -> CloseOutcome {
        let Some(position) = self.registry.remove(symbol) else {
            return CloseOutcome::Skipped;
        };
        let fills = self
            .gateway
            .recent_fills(symbol, self.config.reconciliation.fills_lookback)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(symbol = %symbol, error = %e, "Could not fetch fills for external close");
                Vec::new()
            });
        let recovered = recover_exit(&position, &fills);
        self.orders.cancel_all(symbol, position.side).await;
        self.advisory_history.clear(symbol);
        let record = self.ledger.settle(
            &position,
            ExitSettlement {
                quantity: position.remaining_qty(),
                exit_price: recovered.price,
                pnl: recovered.pnl,
                reason: CloseReason::External,
                closed_at: Utc::now(),
            },
        );
        CloseOutcome::Closed(close_report(record))
    }

    /// Hand a position whose exit failed back to the guardian.
    fn release_after_failed_exit(&self, symbol: &str) {
        let now = Utc::now();
        self.registry.update(symbol, |p| {
            p.end_close();
            p.stop_order_id = None;
            p.target_order_id = None;
            if let Err(e) = p.protection.mark_stop_missing(now) {
                tracing::warn!(symbol = %p.symbol, error = %e, "Could not record missing stop");
            }
        });
    }

    /// Close every open position concurrently.
    pub async fn close_all(
        &self,
        reason: CloseReason,
    ) -> Vec<(String, Result<CloseOutcome, ExecutionError>)> {
        let symbols: Vec<String> = self
            .registry
            .snapshot_all()
            .into_iter()
            .map(|p| p.symbol)
            .collect();
        let results = join_all(symbols.iter().map(|symbol| self.close_position(symbol, reason))).await;
        symbols.into_iter().zip(results).collect()
    }

    // ------------------------------------------------------------------
    // Take-profit and stop management
    // ------------------------------------------------------------------

    /// Execute one take-profit level. The final level closes the position.
    ///
    /// Returns `false` when nothing was executed (position gone or closing).
    pub async fn execute_take_profit(
        &self,
        symbol: &str,
        level: usize,
        quantity: Decimal,
        final_level: bool,
    ) -> Result<bool, ExecutionError> {
        if final_level {
            let outcome = self.close_position(symbol, CloseReason::TakeProfit).await?;
            return Ok(!matches!(outcome, CloseOutcome::Skipped));
        }

        let Some(position) = self.registry.begin_close(symbol) else {
            return Ok(false);
        };
        let mode = position.mode;
        let mode_config = self.config.modes.get(mode);

        let result = async {
            let rules = self.orders.rules().get(self.gateway.as_ref(), symbol).await?;
            let request = OrderRequest::market(symbol, position.side.exit_side(), quantity).reduce_only();
            let gateway = &self.gateway;
            let request = &request;
            let placed = self
                .retry
                .run("take_profit", || gateway.place_order(request.clone()))
                .await?;
            let fill = self
                .confirm_fill(&placed)
                .await
                .ok_or_else(|| ExecutionError::ExitUnfilled {
                    symbol: symbol.to_string(),
                    order_id: placed.order_id.clone(),
                })?;
            Ok::<_, ExecutionError>((rules, fill))
        }
        .await;
        let (rules, fill) = match result {
            Ok(done) => done,
            Err(e) => {
                self.registry.abort_close(symbol);
                tracing::warn!(symbol = %symbol, level = level + 1, error = %e, "Take-profit not executed");
                return Err(e);
            }
        };

        let exit_fee = self.config.fees.taker_fee(fill.quantity * fill.price);
        let commit = self.registry.update(symbol, |p| {
            let commit = tpsl::commit_take_profit(p, level, fill.quantity, fill.price, exit_fee, mode_config, &rules);
            p.end_close();
            commit
        });
        let Some(commit) = commit else {
            tracing::warn!(symbol = %symbol, "Position vanished during take-profit");
            return Ok(false);
        };

        metrics::record_take_profit(mode.as_str(), level + 1);
        tracing::info!(
            symbol = %symbol,
            level = level + 1,
            quantity = %commit.closed_qty,
            price = %fill.price,
            pnl = %commit.realized,
            "Take-profit executed"
        );

        if let Some(stop) = commit.breakeven_stop
            && let Err(e) = self.push_stop(symbol, stop, StopMove::Breakeven).await
        {
            tracing::warn!(symbol = %symbol, error = %e, "Breakeven stop not placed, guardian will verify");
        }
        self.persist(symbol);
        Ok(true)
    }

    /// Move the exchange stop to the in-memory stop at `price`.
    pub async fn push_stop(
        &self,
        symbol: &str,
        price: Decimal,
        cause: StopMove,
    ) -> Result<(), ExecutionError> {
        match self.orders.replace_stop(&self.registry, symbol, price).await {
            Ok(()) => {
                metrics::record_stop_move(cause.as_str());
                self.persist(symbol);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    symbol = %symbol,
                    stop = %price,
                    cause = cause.as_str(),
                    error = %e,
                    "Stop move not applied on exchange, previous stop stays"
                );
                Err(e.into())
            }
        }
    }

    /// Validate and apply an advisory stop proposal.
    pub async fn apply_advisory_stop(
        &self,
        symbol: &str,
        proposed: Decimal,
    ) -> Result<StopUpdate, ExecutionError> {
        let Some(position) = self.registry.get(symbol).filter(|p| !p.is_closing()) else {
            return Ok(StopUpdate::Skipped);
        };
        let rules = self.orders.rules().get(self.gateway.as_ref(), symbol).await?;
        let mark = self.gateway.mark_price(symbol).await?;
        let proposed = rules.round_stop(proposed, position.side);
        let current = position.stop_price();

        let verdict = validate_stop_update(position.side, current, proposed, mark, &self.config.advisory);
        self.advisory_history.record(
            symbol,
            SlUpdateRecord {
                at: Utc::now(),
                previous: current,
                proposed,
                mark,
                rejection: verdict.err(),
            },
        );
        if let Err(rejection) = verdict {
            tracing::info!(
                symbol = %symbol,
                current = %current,
                proposed = %proposed,
                rule = rejection.label(),
                "Advisory stop update rejected"
            );
            return Ok(StopUpdate::Rejected(rejection));
        }

        let moved = self
            .registry
            .update(symbol, |p| !p.is_closing() && p.tighten_stop(proposed))
            .unwrap_or(false);
        if !moved {
            return Ok(StopUpdate::Skipped);
        }
        tracing::info!(symbol = %symbol, from = %current, to = %proposed, "Advisory stop accepted");
        self.push_stop(symbol, proposed, StopMove::Advisory).await?;
        Ok(StopUpdate::Applied { stop: proposed })
    }

    /// Move a position to another mode and rebuild its protection from the
    /// new mode's defaults.
    pub async fn convert_mode(&self, symbol: &str, mode: TradingMode) -> Result<(), ExecutionError> {
        let target = self.config.modes.get(mode);
        if !target.enabled {
            return Err(ExecutionError::ModeDisabled { mode });
        }
        let not_found = || ExecutionError::PositionNotFound {
            symbol: symbol.to_string(),
        };
        let position = self
            .registry
            .get(symbol)
            .filter(|p| !p.is_closing())
            .ok_or_else(not_found)?;
        let rules = self.orders.rules().get(self.gateway.as_ref(), symbol).await?;
        let stop = tpsl::default_stop(position.side, position.entry_price, target, &rules);
        let ladder = tpsl::build_ladder(position.side, position.entry_price, target, &rules, &[]);
        let trailing = target.trailing.params();

        let converted = self
            .registry
            .update(symbol, |p| {
                let from = p.mode;
                p.mode = mode;
                p.trailing = trailing;
                p.reset_protection(stop, ladder);
                (from, p.protection.state())
            })
            .ok_or_else(not_found)?;
        let (from, state) = converted;
        tracing::info!(symbol = %symbol, from = %from, to = %mode, stop = %stop, "Position mode converted");
        self.persist(symbol);

        if matches!(state, ProtectionState::Protected | ProtectionState::StopVerified) {
            match self.orders.establish(&self.registry, symbol).await {
                Ok(state) => tracing::info!(symbol = %symbol, state = %state, "Protection rebuilt"),
                Err(e) => tracing::warn!(symbol = %symbol, error = %e, "Protection rebuild failed, guardian will heal"),
            }
        } else {
            let old_target = self
                .registry
                .update(symbol, |p| {
                    p.protection.mark_target_missing();
                    p.target_order_id.take()
                })
                .flatten();
            if let Some(old) = old_target
                && let Err(e) = cancel_idempotent(self.gateway.as_ref(), symbol, &old).await
            {
                tracing::warn!(symbol = %symbol, error = %e, "Could not cancel previous take-profit");
            }
            self.push_stop(symbol, stop, StopMove::Advisory).await?;
        }
        self.persist(symbol);
        Ok(())
    }

    pub(crate) fn persist(&self, symbol: &str) {
        if let Some(position) = self.registry.get(symbol)
            && let Err(e) = self.ledger.snapshots().save(&position)
        {
            tracing::warn!(symbol = %symbol, error = %e, "Failed to save position snapshot");
        }
    }
}

fn close_report(record: ClosedTradeRecord) -> CloseReport {
    CloseReport {
        symbol: record.symbol,
        reason: record.reason,
        quantity: record.quantity,
        exit_price: record.exit_price,
        realized_pnl: record.realized_pnl,
        roi_pct: record.roi_pct,
    }
}

#[async_trait]
impl EmergencyCloser for ExecutionController {
    async fn emergency_close(&self, symbol: &str) -> bool {
        match self.close_position(symbol, CloseReason::Emergency).await {
            Ok(CloseOutcome::Closed(_)) => true,
            Ok(CloseOutcome::Skipped) => !self.registry.contains(symbol),
            Ok(CloseOutcome::Partial { .. }) => false,
            Err(e) => {
                tracing::error!(symbol = %symbol, error = %e, "Emergency close failed");
                false
            }
        }
    }
}
