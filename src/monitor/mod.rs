mod session;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::MonitoringConfig;
use crate::registry::FirstEventRegistry;
use crate::store::{NewSession, Store};
use crate::types::{MarketData, PricePoint, SwapEvent, TradeKind};

pub use session::{SessionSignal, SessionState};
use session::{transition_terminal, SessionHandle};

/// How long a monitoring task waits for the enrichment pipeline's market-cap
/// result before recomputing locally.
const SEED_WAIT: Duration = Duration::from_secs(2);

/// Instantaneous pool state.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    pub price_sol: Option<f64>,
    pub slot: Option<u64>,
}

/// Source of pool prices and token supply for the samplers. Object-safe so
/// tests can script it.
pub trait PriceSource: Send + Sync {
    fn sample<'a>(&'a self, pool: &'a str, mint: &'a str) -> BoxFuture<'a, Result<PoolSnapshot>>;
    fn token_supply<'a>(&'a self, mint: &'a str) -> BoxFuture<'a, Result<(Option<f64>, u8)>>;
}

/// A reserved session slot, produced by [`PoolMonitor::register_buy`] and
/// consumed by [`PoolMonitor::activate`].
pub struct PendingSession {
    key: (String, String),
    pool: String,
    first_buy_tx: String,
    event_price_sol: Option<f64>,
    slot: u64,
    block_time: i64,
    state: Arc<Mutex<SessionState>>,
    signal_rx: mpsc::UnboundedReceiver<SessionSignal>,
}

/// Manages per-(wallet, token) monitoring sessions.
///
/// Registration is synchronous and reserves the session slot under the map
/// mutex, so a racing duplicate BUY sees the existing slot and backs off no
/// matter how its registry read went. Each activated session owns one sampler
/// task; signals reach it through a per-session channel. The map mutex only
/// covers insert/lookup/remove — sampler loops never hold it.
pub struct PoolMonitor {
    sessions: Arc<Mutex<HashMap<(String, String), SessionHandle>>>,
    store: Arc<dyn Store>,
    source: Arc<dyn PriceSource>,
    registry: Arc<FirstEventRegistry>,
    config: MonitoringConfig,
}

impl PoolMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn PriceSource>,
        registry: Arc<FirstEventRegistry>,
        config: MonitoringConfig,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            store,
            source,
            registry,
            config,
        }
    }

    /// Decide whether this BUY starts a session and reserve its slot.
    ///
    /// Cheap and synchronous: a registry read plus a map insert. Returns
    /// `None` when the event carries no pool, the pair already has a first
    /// buy, or a session is already active for the pair.
    pub fn register_buy(
        &self,
        token: &str,
        event: &SwapEvent,
        slot: u64,
        block_time: i64,
    ) -> Option<PendingSession> {
        let Some(pool) = event.pool.clone() else {
            debug!("BUY {} carries no pool address, not monitoring", event.signature);
            return None;
        };

        match self.registry.is_first_buy(&event.fee_payer, token) {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "Not the first buy of {} by {}, not monitoring",
                    token, event.fee_payer
                );
                return None;
            }
            Err(e) => {
                warn!("First-buy lookup failed, not monitoring: {}", e);
                return None;
            }
        }

        let key = (event.fee_payer.clone(), token.to_string());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(SessionState::Active));

        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(existing) = sessions.get(&key) {
                if !existing.current_state().is_terminal() {
                    debug!(
                        "Session ({}, {}) already active, duplicate start is a no-op",
                        key.0, key.1
                    );
                    return None;
                }
            }
            sessions.insert(
                key.clone(),
                SessionHandle {
                    signal_tx,
                    state: state.clone(),
                },
            );
        }

        Some(PendingSession {
            key,
            pool,
            first_buy_tx: event.signature.clone(),
            event_price_sol: event.effective_price_sol(TradeKind::Buy),
            slot,
            block_time,
            state,
            signal_rx,
        })
    }

    /// Activate a reserved session: seed its initial price, persist it, and
    /// run the sampler until a terminal transition.
    pub async fn activate(
        &self,
        pending: PendingSession,
        seed: Option<oneshot::Receiver<MarketData>>,
    ) {
        // Prefer the enrichment pipeline's market data over recomputing it.
        let seed = match seed {
            Some(rx) => tokio::time::timeout(SEED_WAIT, rx).await.ok().and_then(|r| r.ok()),
            None => None,
        };
        let sol_usd = self.store.latest_sol_price().unwrap_or_default();
        let initial = seed_initial(seed, pending.event_price_sol, sol_usd);

        let started_at = chrono::Utc::now().timestamp();
        let session_id = match self.store.create_monitoring_session(&NewSession {
            wallet: pending.key.0.clone(),
            token: pending.key.1.clone(),
            pool: pending.pool.clone(),
            start_slot: pending.slot,
            started_at,
            deadline_at: started_at + self.config.max_duration.as_secs() as i64,
            first_buy_tx: pending.first_buy_tx.clone(),
            initial: initial.clone(),
        }) {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to persist monitoring session: {}", e);
                self.sessions.lock().unwrap().remove(&pending.key);
                return;
            }
        };

        let initial_point = PricePoint::from_market(&initial, Some(pending.slot), pending.block_time);
        if let Err(e) = self.store.save_price_sample(session_id, &initial_point) {
            warn!("Failed to persist initial price sample: {}", e);
        }

        info!(
            "📈 Monitoring ({}, {}) via pool {} for {:?}",
            pending.key.0, pending.key.1, pending.pool, self.config.max_duration
        );

        let sampler = Sampler {
            key: pending.key.clone(),
            pool: pending.pool,
            token: pending.key.1.clone(),
            session_id,
            state: pending.state,
            supply: initial.total_supply,
            store: self.store.clone(),
            source: self.source.clone(),
            sessions: self.sessions.clone(),
            config: self.config.clone(),
        };
        sampler.run(pending.signal_rx).await;
    }

    /// Handle a SELL: deliver a terminal sample to the active session, if any.
    /// A sell with no active session (late duplicate, or a wallet we never saw
    /// buy) is logged and dropped.
    pub fn on_sell(&self, token: &str, event: &SwapEvent, block_time: i64) {
        let key = (event.fee_payer.clone(), token.to_string());
        let sol_usd = self.store.latest_sol_price().unwrap_or_default();
        let market =
            MarketData::compute(None, event.effective_price_sol(TradeKind::Sell), sol_usd);

        let sessions = self.sessions.lock().unwrap();
        let Some(handle) = sessions.get(&key) else {
            debug!(
                "SELL {} for ({}, {}) has no active session, dropping signal",
                event.signature, key.0, key.1
            );
            return;
        };

        let signal = SessionSignal::Sell {
            market,
            tx_signature: event.signature.clone(),
            sampled_at: block_time,
        };
        if handle.signal_tx.send(signal).is_err() {
            debug!(
                "Session ({}, {}) already terminated, dropping sell signal",
                key.0, key.1
            );
        }
    }

    /// Cancel every active session. Used on shutdown.
    pub fn cancel_all(&self) {
        let sessions = self.sessions.lock().unwrap();
        let mut cancelled = 0;
        for handle in sessions.values() {
            if handle.signal_tx.send(SessionSignal::Shutdown).is_ok() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("🛑 Cancelling {} monitoring sessions", cancelled);
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|h| !h.current_state().is_terminal())
            .count()
    }

    pub fn session_state(&self, wallet: &str, token: &str) -> SessionState {
        self.sessions
            .lock()
            .unwrap()
            .get(&(wallet.to_string(), token.to_string()))
            .map(|h| h.current_state())
            .unwrap_or(SessionState::Idle)
    }
}

/// Initial price for a new session. A complete enrichment result is used
/// as-is; a partial one is filled in from the SOL/USD quote and the event's
/// own price.
fn seed_initial(
    seed: Option<MarketData>,
    event_price_sol: Option<f64>,
    sol_usd: Option<f64>,
) -> MarketData {
    match seed {
        Some(md) if md.is_complete() => md,
        Some(md) => {
            let md = md.with_derived_price_sol(sol_usd);
            let price_sol = md.price_sol.or(event_price_sol);
            MarketData::compute(md.total_supply, price_sol, sol_usd)
        }
        None => MarketData::compute(None, event_price_sol, sol_usd),
    }
}

/// Per-session sampling loop. Exits on sell signal, deadline, shutdown, or
/// repeated sampler errors; removes the session from the map on the way out.
struct Sampler {
    key: (String, String),
    pool: String,
    token: String,
    session_id: i64,
    state: Arc<Mutex<SessionState>>,
    supply: Option<f64>,
    store: Arc<dyn Store>,
    source: Arc<dyn PriceSource>,
    sessions: Arc<Mutex<HashMap<(String, String), SessionHandle>>>,
    config: MonitoringConfig,
}

impl Sampler {
    async fn run(mut self, mut signals: mpsc::UnboundedReceiver<SessionSignal>) {
        let deadline = Instant::now() + self.config.max_duration;
        let mut ticks = interval_at(
            Instant::now() + self.config.sample_interval,
            self.config.sample_interval,
        );
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                signal = signals.recv() => {
                    match signal {
                        Some(SessionSignal::Sell { market, tx_signature, sampled_at }) => {
                            if transition_terminal(&self.state, SessionState::Completed) {
                                let point = PricePoint::from_market(&market, None, sampled_at);
                                self.finalize("sell", Some(&point), Some(&tx_signature));
                                info!(
                                    "✅ Session ({}, {}) completed on sell {}",
                                    self.key.0, self.key.1, tx_signature
                                );
                            } else {
                                debug!(
                                    "Duplicate sell signal for terminal session ({}, {}), dropped",
                                    self.key.0, self.key.1
                                );
                            }
                            break;
                        }
                        Some(SessionSignal::Shutdown) | None => {
                            if transition_terminal(&self.state, SessionState::Cancelled) {
                                self.finalize("shutdown", None, None);
                            }
                            break;
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    if transition_terminal(&self.state, SessionState::TimedOut) {
                        self.finalize("deadline", None, None);
                        info!(
                            "⏰ Session ({}, {}) timed out after {:?}",
                            self.key.0, self.key.1, self.config.max_duration
                        );
                    }
                    break;
                }
                _ = ticks.tick() => {
                    match self.source.sample(&self.pool, &self.token).await {
                        Ok(snapshot) => {
                            consecutive_errors = 0;
                            self.record_sample(snapshot).await;
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            warn!(
                                "Sampler error for ({}, {}) [{}/{}]: {}",
                                self.key.0, self.key.1,
                                consecutive_errors, self.config.max_sampler_errors, e
                            );
                            if consecutive_errors >= self.config.max_sampler_errors {
                                if transition_terminal(&self.state, SessionState::TimedOut) {
                                    self.finalize("sampler_error", None, None);
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.sessions.lock().unwrap().remove(&self.key);
    }

    async fn record_sample(&mut self, snapshot: PoolSnapshot) {
        if self.supply.is_none() {
            match self.source.token_supply(&self.token).await {
                Ok((supply, _)) => self.supply = supply,
                Err(e) => debug!("Supply fetch failed for {}: {}", self.token, e),
            }
        }
        let sol_usd = self.store.latest_sol_price().unwrap_or_default();
        let market = MarketData::compute(self.supply, snapshot.price_sol, sol_usd);
        let point = PricePoint::from_market(&market, snapshot.slot, chrono::Utc::now().timestamp());

        // Fire-and-forget: a lost sample never stops the loop.
        if let Err(e) = self.store.save_price_sample(self.session_id, &point) {
            warn!("Failed to persist price sample: {}", e);
        }
    }

    fn finalize(&self, reason: &str, terminal: Option<&PricePoint>, sell_tx: Option<&str>) {
        if let Err(e) = self
            .store
            .finalize_session(self.session_id, reason, terminal, sell_tx)
        {
            warn!("Failed to finalize session ({}): {}", reason, e);
        }
    }
}
