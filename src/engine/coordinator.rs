//! Trade cycle coordinator: the main polling loop.
//!
//! One cycle runs to completion before the next starts:
//! 1. Apply operator commands
//! 2. Refresh prices and the delisting set
//! 3. Admit queued signals through the risk gate and execute them
//! 4. Sweep open positions through the trailing engine
//! 5. Check session limits, liquidating on a hit

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, GatewayError, LedgerError};
use crate::exchange::{MarketData, OrderGateway, PriceMap};
use crate::models::{CloseReason, ClosedPosition, Position, PositionUpdate, Signal};
use crate::signals::SignalQueue;
use crate::trading::{
    CooloffRegistry, OpenRequest, PortfolioSnapshot, PositionLedger, RiskGate,
    SessionCircuitBreaker, SessionStats, TradingConfig, TrailDecision, TrailingStopEngine,
};

use super::{ControlCommand, ControlHandle};

const CONTROL_CAPACITY: usize = 64;
const SLEEP_TICK: Duration = Duration::from_secs(1);

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Set when the cycle stopped early, with the reason
    pub skipped: Option<String>,
    pub admitted: usize,
    pub opened: Vec<String>,
    pub closed: Vec<(String, CloseReason)>,
    pub armed: Vec<String>,
}

/// Orchestrates signal intake, risk checks, execution and exits.
pub struct TradeCycleCoordinator {
    config: Arc<TradingConfig>,
    ledger: PositionLedger,
    market: Arc<dyn MarketData>,
    gateway: Arc<dyn OrderGateway>,
    signals: SignalQueue,
    controls: mpsc::Receiver<ControlCommand>,
    control_tx: mpsc::Sender<ControlCommand>,
    cooloff: CooloffRegistry,
    breaker: SessionCircuitBreaker,
    cycle_interval: Duration,

    // Runtime state
    paused: bool,
    balance_exhausted: bool,
    cycles: u64,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl TradeCycleCoordinator {
    pub fn new(
        config: TradingConfig,
        ledger: PositionLedger,
        market: Arc<dyn MarketData>,
        gateway: Arc<dyn OrderGateway>,
        signals: SignalQueue,
        cycle_interval: Duration,
    ) -> Self {
        let (control_tx, controls) = mpsc::channel(CONTROL_CAPACITY);
        let breaker = SessionCircuitBreaker::new(&config, Utc::now());
        Self {
            config: Arc::new(config),
            ledger,
            market,
            gateway,
            signals,
            controls,
            control_tx,
            cooloff: CooloffRegistry::new(),
            breaker,
            cycle_interval,
            paused: false,
            balance_exhausted: false,
            cycles: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Handle for sending operator commands.
    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle::new(self.control_tx.clone(), self.shutdown.clone())
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    pub fn session_stats(&self) -> &SessionStats {
        self.breaker.stats()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Main run loop. Returns when shut down or on a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            pair = %self.config.pair_with,
            slots = self.config.trade_slots,
            trade_total = %self.config.trade_total,
            trailing = self.config.trailing_enabled(),
            session_limits = self.breaker.is_enabled(),
            paper = self.gateway.is_paper(),
            interval_secs = self.cycle_interval.as_secs(),
            "Starting trade cycle loop"
        );

        let open = self.ledger.list_open().await?;
        if !open.is_empty() {
            info!(count = open.len(), "Resuming with open positions from store");
        }

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let mut outcome = Ok(());
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.run_cycle().await {
                Ok(report) => debug!(cycle = self.cycles, ?report, "Cycle complete"),
                Err(e) if e.is_fatal() => {
                    error!(category = %e.category(), error = %e, "Fatal error, stopping engine");
                    outcome = Err(e.into());
                    break;
                }
                Err(e) => warn!(category = %e.category(), error = %e, "Cycle failed"),
            }
            self.sleep_between_cycles().await;
        }

        self.finish().await;
        outcome
    }

    /// Sleep for the cycle interval in short ticks so shutdown is noticed quickly.
    async fn sleep_between_cycles(&self) {
        let mut remaining = self.cycle_interval;
        while !remaining.is_zero() && !self.shutdown.load(Ordering::SeqCst) {
            let step = remaining.min(SLEEP_TICK);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }

    async fn finish(&self) {
        info!(cycles = self.cycles, cooling_off = self.cooloff.len(), "Shutting down trade cycle loop...");
        match self.ledger.list_open().await {
            Ok(open) if !open.is_empty() => {
                info!(count = open.len(), "Open positions remain persisted")
            }
            Ok(_) => {}
            Err(e) => warn!(category = %e.category(), error = %e, "Could not list open positions"),
        }
        info!("\n{}", self.breaker.stats());
    }

    /// Run one complete cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, EngineError> {
        self.cycles += 1;
        let mut report = CycleReport::default();

        self.apply_controls(&mut report).await?;
        if self.stop_requested(&mut report) {
            return Ok(report);
        }

        let prices = match self.market.prices(&self.config.pair_with).await {
            Ok(prices) => prices,
            Err(e @ GatewayError::RateLimited(_)) => {
                warn!(category = %e.category(), error = %e, "Rate limited, skipping cycle");
                report.skipped = Some(e.to_string());
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };
        let delisting = self.refresh_delisting().await;
        if self.stop_requested(&mut report) {
            return Ok(report);
        }

        self.process_signals(&prices, &delisting, &mut report).await?;
        if self.stop_requested(&mut report) {
            return Ok(report);
        }
        self.sweep(&prices, &delisting, &mut report).await?;
        if self.stop_requested(&mut report) {
            return Ok(report);
        }
        self.check_session(&mut report).await?;

        self.cooloff.prune(Utc::now());
        Ok(report)
    }

    /// Mark the cycle as cut short when shutdown was requested mid-cycle.
    fn stop_requested(&self, report: &mut CycleReport) -> bool {
        if !self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        debug!(cycle = self.cycles, "Shutdown requested, ending cycle early");
        report.skipped = Some("shutdown requested".to_string());
        true
    }

    // ==================== Controls ====================

    async fn apply_controls(&mut self, report: &mut CycleReport) -> Result<(), EngineError> {
        while let Ok(command) = self.controls.try_recv() {
            info!(command = %command, "Applying operator command");
            match command {
                ControlCommand::Pause => self.paused = true,
                ControlCommand::Resume => self.paused = false,
                ControlCommand::Stop => self.shutdown.store(true, Ordering::SeqCst),
                ControlCommand::SellAll => {
                    self.liquidate_all(CloseReason::Manual, report).await?;
                }
                ControlCommand::Sell(symbol) => match self.ledger.get_open(&symbol).await? {
                    Some(position) => {
                        self.close_position(&position, CloseReason::Manual, report).await?;
                    }
                    None => warn!(symbol = %symbol, category = "data", "No open position to sell"),
                },
                ControlCommand::SetTakeProfit { symbol, pct } => {
                    let update = PositionUpdate {
                        take_profit_pct: Some(pct),
                        ..PositionUpdate::default()
                    };
                    if symbol.is_none() {
                        self.swap_config(self.config.with_take_profit(pct));
                    }
                    self.update_targets(symbol.as_deref(), &update).await?;
                }
                ControlCommand::SetStopLoss { symbol, pct } => {
                    if pct >= dec!(100) {
                        warn!(pct = %pct, category = "configuration", "Stop-loss must be below 100%");
                        continue;
                    }
                    let update = PositionUpdate {
                        stop_loss_pct: Some(pct),
                        ..PositionUpdate::default()
                    };
                    if symbol.is_none() {
                        self.swap_config(self.config.with_stop_loss(pct));
                    }
                    self.update_targets(symbol.as_deref(), &update).await?;
                }
            }
        }
        Ok(())
    }

    fn swap_config(&mut self, config: TradingConfig) {
        self.breaker.apply_config(&config);
        self.config = Arc::new(config);
    }

    /// Apply a target change to one symbol, or to every open position.
    async fn update_targets(
        &self,
        symbol: Option<&str>,
        update: &PositionUpdate,
    ) -> Result<(), EngineError> {
        let symbols = match symbol {
            Some(symbol) => vec![symbol.to_string()],
            None => self
                .ledger
                .list_open()
                .await?
                .into_iter()
                .map(|p| p.symbol)
                .collect(),
        };
        for symbol in symbols {
            match self.ledger.update(&symbol, update).await {
                Ok(()) => {}
                Err(e @ LedgerError::NotFound(_)) => {
                    warn!(symbol = %symbol, category = %e.category(), error = %e, "Target not changed")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ==================== Market ====================

    async fn refresh_delisting(&self) -> HashSet<String> {
        let mut delisting: HashSet<String> = self.config.delisted_symbols.iter().cloned().collect();
        match self.market.delisting().await {
            Ok(scheduled) => delisting.extend(scheduled),
            Err(e) => warn!(
                category = %e.category(),
                error = %e,
                "Delist schedule unavailable, using configured list"
            ),
        }
        delisting
    }

    // ==================== Signals ====================

    async fn process_signals(
        &mut self,
        prices: &PriceMap,
        delisting: &HashSet<String>,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let mut signals = self.signals.drain();
        if signals.is_empty() {
            return Ok(());
        }
        if self.paused {
            info!(count = signals.len(), "Trading paused, discarding signals");
            return Ok(());
        }

        // Sells first, then the strongest buys claim slots
        signals.sort_by_key(|s| (!s.is_sell(), Reverse(s.strength())));

        // Read-through view of the store for this cycle
        let open = self.ledger.list_open().await?;
        let snapshot = PortfolioSnapshot {
            open_symbols: open.iter().map(|p| p.symbol.clone()).collect(),
            exposure: open
                .iter()
                .map(|p| prices.get(&p.symbol).map_or(p.current_value(), |price| p.volume * *price))
                .sum(),
            delisting: delisting.clone(),
            session_allows_entries: self.breaker.allows_new_entries(),
            balance_exhausted: self.balance_exhausted,
        };

        let outcome = RiskGate::new(&self.config, &self.cooloff).validate(signals, &snapshot, Utc::now());
        report.admitted = outcome.admitted.len();

        for signal in outcome.admitted {
            if let Err(e) = self.execute_signal(&signal, prices, report).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(
                    symbol = signal.symbol(),
                    kind = %signal.kind(),
                    category = %e.category(),
                    error = %e,
                    "Signal not executed"
                );
            }
        }
        Ok(())
    }

    async fn execute_signal(
        &mut self,
        signal: &Signal,
        prices: &PriceMap,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        match signal {
            Signal::Buy { symbol, source, .. } => {
                if let Some(price) = self.usable_price(symbol, prices) {
                    self.open_position(symbol, price, source, report).await?;
                }
            }
            Signal::Sell { symbol, reason, .. } => {
                if let Some(position) = self.ledger.get_open(symbol).await? {
                    debug!(symbol = %symbol, reason = %reason, "Acting on sell signal");
                    self.close_position(&position, CloseReason::SellSignal, report).await?;
                }
            }
        }
        Ok(())
    }

    fn usable_price(&self, symbol: &str, prices: &PriceMap) -> Option<Decimal> {
        match prices.get(symbol) {
            Some(price) if *price > Decimal::ZERO => Some(*price),
            other => {
                warn!(symbol, price = ?other, category = "data", "No usable price, skipping symbol");
                None
            }
        }
    }

    async fn open_position(
        &mut self,
        symbol: &str,
        price: Decimal,
        source: &str,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        if self.ledger.get_open(symbol).await?.is_some() {
            debug!(symbol, "Position already open, skipping buy");
            return Ok(());
        }

        let Some(volume) = self.size_order(symbol, price).await? else {
            return Ok(());
        };
        let fill = match self.gateway.buy(symbol, volume).await {
            Ok(fill) => fill,
            Err(e) => return self.handle_order_error(symbol, e),
        };
        debug!(
            symbol,
            side = ?fill.side,
            order_id = %fill.order_id,
            fee = %fill.fee,
            filled_at = %fill.time,
            "Buy filled"
        );

        let opened = self
            .ledger
            .open(OpenRequest {
                symbol,
                volume: fill.quantity,
                entry_price: fill.price,
                take_profit_pct: self.config.take_profit_pct,
                stop_loss_pct: self.config.stop_loss_pct,
                signal_tag: source,
            })
            .await;

        match opened {
            Ok(_) => {
                report.opened.push(symbol.to_string());
                Ok(())
            }
            Err(e @ LedgerError::AlreadyOpen(_)) => {
                warn!(symbol, category = %e.category(), error = %e, "Filled buy not recorded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Quantity to buy: `TRADE_TOTAL` worth, or less when the account holds less.
    async fn size_order(&mut self, symbol: &str, price: Decimal) -> Result<Option<Decimal>, EngineError> {
        let trade_total = self.config.trade_total;
        let available = match self.gateway.available_balance().await {
            Ok(available) => available,
            Err(e) => return self.handle_order_error(symbol, e).map(|_| None),
        };
        let Some(available) = available else {
            return Ok(Some(trade_total / price));
        };

        // Leave room for the buy fee
        let affordable = (available / self.config.fee_schedule().effective_buy(Decimal::ONE))
            .round_dp_with_strategy(8, RoundingStrategy::ToZero);
        if affordable >= trade_total {
            return Ok(Some(trade_total / price));
        }

        let volume = (affordable / price).round_dp_with_strategy(8, RoundingStrategy::ToZero);
        if volume <= Decimal::ZERO {
            let err = GatewayError::InsufficientBalance(format!("{} available", available));
            return self.handle_order_error(symbol, err).map(|_| None);
        }
        info!(symbol, budget = %affordable, trade_total = %trade_total, "Sizing down to available balance");
        Ok(Some(volume))
    }

    /// Decide how an order failure affects the cycle. Fatal errors propagate.
    fn handle_order_error(&mut self, symbol: &str, err: GatewayError) -> Result<(), EngineError> {
        match err {
            GatewayError::InsufficientBalance(_) => {
                warn!(symbol, category = %err.category(), error = %err, "Insufficient balance, new entries stopped");
                self.balance_exhausted = true;
                Ok(())
            }
            GatewayError::Network(_) | GatewayError::Auth(_) => Err(err.into()),
            _ => {
                warn!(symbol, category = %err.category(), error = %err, "Order failed");
                Ok(())
            }
        }
    }

    // ==================== Exits ====================

    async fn sweep(
        &mut self,
        prices: &PriceMap,
        delisting: &HashSet<String>,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let engine = TrailingStopEngine::from_config(&self.config);

        for position in self.ledger.list_open().await? {
            let symbol = position.symbol.as_str();
            let Some(price) = prices.get(symbol).copied() else {
                warn!(symbol, category = "data", "No price for open position, skipping");
                continue;
            };

            let decision = engine.evaluate(&position, price, delisting.contains(symbol));
            if let Err(e) = self.apply_decision(&position, price, decision, report).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(symbol, category = %e.category(), error = %e, "Skipping position this cycle");
            }
        }
        Ok(())
    }

    async fn apply_decision(
        &mut self,
        position: &Position,
        price: Decimal,
        decision: TrailDecision,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let symbol = position.symbol.as_str();
        match decision {
            TrailDecision::Skip(reason) => {
                warn!(symbol, category = "data", reason = %reason, "Skipping position");
            }
            TrailDecision::Hold => {
                self.ledger.mark(position, price).await?;
            }
            TrailDecision::Arm(state) | TrailDecision::Ratchet(state) => {
                let pnl = self.ledger.unrealized(position, price)?;
                let update = PositionUpdate::mark(price, pnl).merge(PositionUpdate::trail(state));
                self.ledger.update(symbol, &update).await?;
                if position.trailing_active {
                    debug!(symbol, high_water = %state.high_water_price, floor = %state.trail_floor_price, "Trailing ratcheted");
                } else {
                    info!(
                        symbol,
                        high_water = %state.high_water_price,
                        floor = %state.trail_floor_price,
                        ceiling = %state.trail_ceiling_price,
                        "Trailing armed"
                    );
                    report.armed.push(symbol.to_string());
                }
            }
            TrailDecision::Close(reason) => {
                self.ledger.mark(position, price).await?;
                self.close_position(position, reason, report).await?;
            }
        }
        Ok(())
    }

    /// Sell a position through the gateway and close it at the fill price.
    async fn close_position(
        &mut self,
        position: &Position,
        reason: CloseReason,
        report: &mut CycleReport,
    ) -> Result<Option<ClosedPosition>, EngineError> {
        let symbol = position.symbol.as_str();
        let fill = match self.gateway.sell(symbol, position.volume).await {
            Ok(fill) => fill,
            Err(e) => {
                self.handle_order_error(symbol, e)?;
                return Ok(None);
            }
        };

        let closed = self.ledger.close(symbol, fill.price, reason).await?;
        if matches!(reason, CloseReason::SessionLimit | CloseReason::Delisting | CloseReason::Manual) {
            warn!(symbol, reason = %reason, "Forced liquidation");
        }

        let closed_at = closed.position.close_time.unwrap_or_else(Utc::now);
        self.cooloff.record_close(closed.symbol(), closed_at, closed.pnl.pct, &self.config);
        self.breaker.record_close(&closed, self.config.session_capital());
        // Proceeds are back in the account
        self.balance_exhausted = false;

        report.closed.push((symbol.to_string(), reason));
        Ok(Some(closed))
    }

    async fn liquidate_all(&mut self, reason: CloseReason, report: &mut CycleReport) -> Result<(), EngineError> {
        for position in self.ledger.list_open().await? {
            if let Err(e) = self.close_position(&position, reason, report).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(symbol = %position.symbol, category = %e.category(), error = %e, "Liquidation failed, will retry");
            }
        }
        Ok(())
    }

    // ==================== Session ====================

    async fn check_session(&mut self, report: &mut CycleReport) -> Result<(), EngineError> {
        let capital = self.config.session_capital();
        let realized = self
            .ledger
            .database()
            .realized_profit_since(self.breaker.session_start())
            .await?;
        let pct = if capital > Decimal::ZERO {
            realized / capital * dec!(100)
        } else {
            Decimal::ZERO
        };
        self.breaker.set_realized_pct(pct);

        let verdict = self.breaker.check(pct);
        if verdict.is_hit() && self.breaker.halted().is_none() {
            warn!(session_pct = %pct.round_dp(2), verdict = %verdict, "Session limit reached, liquidating all positions");
            self.breaker.halt(verdict);
        }

        // Keep retrying until every position is out
        if self.breaker.halted().is_some() {
            self.liquidate_all(CloseReason::SessionLimit, report).await?;
        }
        Ok(())
    }
}
