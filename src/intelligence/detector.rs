use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};

use crate::config::{QualificationConfig, RankingConfig};
use crate::db::{risk_repo, whale_repo, whale_trade_repo};
use crate::intelligence::ranking::{self, RankedWhale};
use crate::intelligence::tracker::{QualificationBlocker, WhaleTracker};
use crate::models::{
    RiskSeverity, Whale, WhaleEvent, WhaleEventKind, WhaleSignal, WhaleStatsSnapshot, WhaleStatus,
    WhaleTradeEvent,
};
use crate::polymarket::DataClient;

/// How long a top-N signal may block on a full engine channel before the
/// stall is reported as a degraded risk event.
const TOP_N_SEND_PATIENCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub polling_interval: Duration,
    pub daily_trade_threshold: i64,
    pub min_trade_size_usd: Decimal,
    pub qualification: QualificationConfig,
    pub ranking: RankingConfig,
}

/// Summary of one polling cycle, surfaced in status reports.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub tracked: usize,
    pub qualified: usize,
    pub ranked: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub deactivated: usize,
    pub blockers: HashMap<QualificationBlocker, usize>,
}

/// Pure transition function for the per-address state machine. `None` means
/// no change. Forward-only, except the explicit `qualified → discovered`
/// demotion.
pub fn next_status(current: WhaleStatus, qualifies: bool, in_top_n: bool) -> Option<WhaleStatus> {
    match current {
        WhaleStatus::Discovered if qualifies => Some(WhaleStatus::Qualified),
        WhaleStatus::Qualified | WhaleStatus::Ranked if !qualifies => {
            Some(WhaleStatus::Discovered)
        }
        WhaleStatus::Qualified if in_top_n => Some(WhaleStatus::Ranked),
        _ => None,
    }
}

/// Stateful Discovery → Qualification → Ranking pipeline.
///
/// The in-memory `known` map is a cache over the store, primed at startup
/// via `load_known_whales`. Every transition is persisted before the cache
/// is updated, so a crash can never leave the cache ahead of the store.
pub struct WhaleDetector {
    pool: PgPool,
    tracker: WhaleTracker,
    config: DetectorConfig,
    known: HashMap<String, Whale>,
    rank_norms: HashMap<String, Decimal>,
    top: Vec<String>,
    /// Rolling observation window for addresses not yet discovered.
    candidates: HashMap<String, Vec<DateTime<Utc>>>,
    events_tx: mpsc::Sender<WhaleEvent>,
    signal_tx: mpsc::Sender<WhaleSignal>,
}

impl WhaleDetector {
    pub async fn new(
        pool: PgPool,
        data_client: DataClient,
        config: DetectorConfig,
        events_tx: mpsc::Sender<WhaleEvent>,
        signal_tx: mpsc::Sender<WhaleSignal>,
    ) -> anyhow::Result<Self> {
        let known = whale_repo::load_known_whales(&pool).await?;
        tracing::info!(count = known.len(), "Primed whale cache from store");

        let tracker = WhaleTracker::new(pool.clone(), data_client, config.qualification.clone());

        Ok(Self {
            pool,
            tracker,
            config,
            known,
            rank_norms: HashMap::new(),
            top: Vec::new(),
            candidates: HashMap::new(),
            events_tx,
            signal_tx,
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.known.len()
    }

    /// Live top-N view, refreshed once per polling cycle.
    pub fn top_whales(&self, n: usize) -> Vec<String> {
        self.top.iter().take(n).cloned().collect()
    }

    /// Ingest one observed trade (stream fan-in or poller). Re-observations
    /// of a known address always update its counters; unknown addresses
    /// accumulate toward the discovery threshold.
    pub async fn observe_trade(&mut self, event: &WhaleTradeEvent) -> anyhow::Result<()> {
        if event.size_usd < self.config.min_trade_size_usd {
            return Ok(());
        }

        let address = event.wallet.to_lowercase();

        if let Some(status) = self.known.get(&address).map(|w| w.status()) {
            let inserted = whale_trade_repo::insert_whale_trade(&self.pool, event).await?;
            if !inserted {
                return Ok(()); // replay of a trade we already hold
            }
            counter!("whale_trades_observed").increment(1);

            whale_repo::observe_whale(&self.pool, &address, event.traded_at).await?;
            if let Some(cached) = self.known.get_mut(&address) {
                cached.last_active_at = Some(
                    cached
                        .last_active_at
                        .map_or(event.traded_at, |t| t.max(event.traded_at)),
                );
            }

            if status.is_copyable() {
                self.emit_signal(event.clone()).await?;
            }
            return Ok(());
        }

        // Discovery: count observations inside the last 24h.
        let now = Utc::now();
        let window = self.candidates.entry(address.clone()).or_default();
        window.push(event.traded_at);
        window.retain(|t| *t > now - ChronoDuration::hours(24));

        if (window.len() as i64) >= self.config.daily_trade_threshold {
            self.candidates.remove(&address);

            // Persist first, then admit to the cache.
            let whale = whale_repo::observe_whale(&self.pool, &address, event.traded_at).await?;
            whale_trade_repo::insert_whale_trade(&self.pool, event).await?;
            tracing::info!(
                address = %short(&address),
                "New whale discovered"
            );
            counter!("whales_discovered").increment(1);

            self.known.insert(address.clone(), whale.clone());
            self.emit_event(WhaleEventKind::Discovered, whale).await;
        }

        Ok(())
    }

    /// One polling cycle: refresh stats, evaluate transitions, re-rank,
    /// poll copyable whales for new trades, and persist the blocker report.
    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleReport> {
        let now = Utc::now();
        let mut report = CycleReport::default();

        let addresses: Vec<String> = self
            .known
            .iter()
            .filter(|(_, w)| w.is_active)
            .map(|(a, _)| a.clone())
            .collect();
        report.tracked = addresses.len();

        // --- Refresh + qualification ---
        for address in &addresses {
            let stats = match self.tracker.refresh(address).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(address = %short(address), error = %e, "Refresh failed");
                    continue;
                }
            };
            self.tracker.persist(&stats).await?;

            let (qualifies, blockers) = self.tracker.is_qualifying(&stats, now);
            for blocker in &blockers {
                *report.blockers.entry(*blocker).or_default() += 1;
            }

            let current = match self.known.get(address) {
                Some(w) => w.status(),
                None => continue,
            };

            match next_status(current, qualifies, false) {
                Some(WhaleStatus::Qualified) => {
                    if whale_repo::advance_status(&self.pool, address, WhaleStatus::Qualified)
                        .await?
                    {
                        report.promoted += 1;
                        counter!("whales_qualified").increment(1);
                        self.reload_cached(address).await?;
                        if let Some(w) = self.known.get(address).cloned() {
                            tracing::info!(address = %short(address), "Whale qualified");
                            self.emit_event(WhaleEventKind::Qualified, w).await;
                        }
                    }
                }
                Some(WhaleStatus::Discovered) => {
                    if whale_repo::demote_to_discovered(&self.pool, address).await? {
                        report.demoted += 1;
                        self.rank_norms.remove(address);
                        self.reload_cached(address).await?;
                        if let Some(w) = self.known.get(address).cloned() {
                            tracing::info!(address = %short(address), "Whale demoted");
                            self.emit_event(WhaleEventKind::Demoted, w).await;
                        }
                    }
                }
                _ => {
                    self.reload_cached(address).await?;
                }
            }
        }

        // --- Ranking over the qualified cohort ---
        let cohort = whale_repo::load_qualified_whales(&self.pool).await?;
        report.qualified = cohort.len();
        let ranked = ranking::rank_whales(&cohort, &self.config.ranking, now);
        self.apply_ranking(&ranked).await?;
        report.ranked = self.top.len();

        // --- Poll copyable whales for fresh trades ---
        self.poll_whale_trades().await?;

        // --- Expire stale whales ---
        let cutoff = now - ChronoDuration::days(self.config.qualification.max_inactive_days);
        for whale in whale_repo::deactivate_stale(&self.pool, cutoff).await? {
            report.deactivated += 1;
            let address = whale.wallet_address.clone();
            // A discovered whale that never qualified and went silent is done.
            if whale.status() == WhaleStatus::Discovered {
                whale_repo::reject_whale(&self.pool, &address).await?;
            }
            self.reload_cached(&address).await?;
            tracing::info!(address = %short(&address), "Whale marked inactive");
            self.emit_event(WhaleEventKind::Inactive, whale).await;
        }

        self.persist_blocker_report(&report).await?;

        metrics::gauge!("whales_tracked").set(report.tracked as f64);
        metrics::gauge!("whales_qualified_current").set(report.qualified as f64);

        Ok(report)
    }

    /// Persist rank scores, advance newly top-ranked whales, refresh the
    /// normalized-score map and the top-N view.
    async fn apply_ranking(&mut self, ranked: &[RankedWhale]) -> anyhow::Result<()> {
        self.rank_norms.clear();
        for r in ranked {
            whale_repo::update_rank_score(&self.pool, &r.wallet_address, Some(r.score)).await?;
            self.rank_norms
                .insert(r.wallet_address.clone(), r.score_norm);
        }

        let top: Vec<String> = ranked
            .iter()
            .take(self.config.ranking.top_n)
            .map(|r| r.wallet_address.clone())
            .collect();

        for address in &top {
            let newly_ranked =
                whale_repo::advance_status(&self.pool, address, WhaleStatus::Ranked).await?;
            self.reload_cached(address).await?;
            if newly_ranked {
                counter!("whales_ranked").increment(1);
                if let Some(w) = self.known.get(address).cloned() {
                    tracing::info!(address = %short(address), "Whale entered top set");
                    self.emit_event(WhaleEventKind::Ranked, w).await;
                }
            }
        }

        self.top = top;
        Ok(())
    }

    /// Cursor-poll the data API for trades of copyable whales that the
    /// stream did not attribute.
    async fn poll_whale_trades(&mut self) -> anyhow::Result<()> {
        let copyable: Vec<String> = self
            .known
            .iter()
            .filter(|(_, w)| w.is_active && w.status().is_copyable())
            .map(|(a, _)| a.clone())
            .collect();

        for address in copyable {
            let cursor = whale_trade_repo::latest_traded_at(&self.pool, &address)
                .await?
                .unwrap_or_else(|| Utc::now() - ChronoDuration::hours(1));

            let since = self
                .tracker
                .fetch_recent(&address, cursor)
                .await
                .unwrap_or_default();

            for event in since {
                if whale_trade_repo::insert_whale_trade(&self.pool, &event).await? {
                    self.emit_signal(event).await?;
                }
            }
        }

        Ok(())
    }

    /// Build a signal for a fresh trade of a copyable whale and hand it to
    /// the engine with the priority policy: top-N signals block rather than
    /// drop; others drop on overflow.
    async fn emit_signal(&self, trade: WhaleTradeEvent) -> anyhow::Result<()> {
        let address = trade.wallet.to_lowercase();
        let whale = match self.known.get(&address) {
            Some(w) if w.status().is_copyable() => w,
            _ => return Ok(()),
        };

        let signal = WhaleSignal {
            whale_stats: WhaleStatsSnapshot {
                status: whale.status(),
                risk_score: whale.risk_score,
                rank_score_norm: self
                    .rank_norms
                    .get(&address)
                    .copied()
                    .unwrap_or(Decimal::ONE),
                total_trades: whale.total_trades,
                total_volume_usd: whale.total_volume_usd,
            },
            detected_at: Utc::now(),
            trade,
        };

        counter!("copy_signals_emitted").increment(1);

        let is_top = self.top.contains(&address);
        if is_top {
            match timeout(TOP_N_SEND_PATIENCE, self.signal_tx.send(signal.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::warn!("Signal channel closed"),
                Err(_) => {
                    // Top-N signals are never dropped; the stall itself is
                    // the observable event.
                    risk_repo::insert_risk_event(
                        &self.pool,
                        "signal_backpressure",
                        RiskSeverity::Warning,
                        &format!("engine channel full, top whale {} blocked > 1s", short(&address)),
                    )
                    .await?;
                    counter!("signal_channel_stalls").increment(1);
                    if self.signal_tx.send(signal).await.is_err() {
                        tracing::warn!("Signal channel closed");
                    }
                }
            }
        } else if let Err(mpsc::error::TrySendError::Full(_)) = self.signal_tx.try_send(signal) {
            counter!("signals_dropped_non_top").increment(1);
            tracing::debug!(address = %short(&address), "Dropped non-top signal under backpressure");
        }

        Ok(())
    }

    async fn reload_cached(&mut self, address: &str) -> anyhow::Result<()> {
        if let Some(whale) = whale_repo::get_whale(&self.pool, address).await? {
            self.known.insert(address.to_string(), whale);
        }
        Ok(())
    }

    async fn emit_event(&self, kind: WhaleEventKind, whale: Whale) {
        if self
            .events_tx
            .send(WhaleEvent { kind, whale })
            .await
            .is_err()
        {
            tracing::debug!("Whale event channel closed");
        }
    }

    async fn persist_blocker_report(&self, report: &CycleReport) -> anyhow::Result<()> {
        if report.blockers.is_empty() {
            return Ok(());
        }
        let mut parts: Vec<String> = report
            .blockers
            .iter()
            .map(|(b, n)| format!("{b}={n}"))
            .collect();
        parts.sort();
        risk_repo::insert_risk_event(
            &self.pool,
            "qualification_blockers",
            RiskSeverity::Info,
            &parts.join(" "),
        )
        .await
    }
}

/// Detector task: wall-clock polling plus stream fan-in, cancelled
/// cooperatively by the shutdown signal.
pub async fn run_detector_loop(
    mut detector: WhaleDetector,
    mut trade_rx: mpsc::Receiver<WhaleTradeEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(detector.config.polling_interval);
    ticker.tick().await; // skip the immediate tick

    tracing::info!(
        interval_secs = detector.config.polling_interval.as_secs(),
        "Whale detector started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match detector.run_cycle().await {
                    Ok(report) => {
                        tracing::info!(
                            tracked = report.tracked,
                            qualified = report.qualified,
                            ranked = report.ranked,
                            promoted = report.promoted,
                            demoted = report.demoted,
                            "Detector cycle complete"
                        );
                    }
                    Err(e) => tracing::error!(error = %e, "Detector cycle failed"),
                }
            }
            event = trade_rx.recv() => {
                match event {
                    Some(event) => {
                        if let Err(e) = detector.observe_trade(&event).await {
                            tracing::error!(error = %e, wallet = %short(&event.wallet), "Trade observation failed");
                        }
                    }
                    None => {
                        tracing::warn!("Trade event channel closed");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Whale detector shutting down");
                    break;
                }
            }
        }
    }
}

fn short(address: &str) -> &str {
    &address[..10.min(address.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_advances_only_when_qualifying() {
        assert_eq!(
            next_status(WhaleStatus::Discovered, true, false),
            Some(WhaleStatus::Qualified)
        );
        assert_eq!(next_status(WhaleStatus::Discovered, false, false), None);
    }

    #[test]
    fn qualified_ranks_when_in_top_n() {
        assert_eq!(
            next_status(WhaleStatus::Qualified, true, true),
            Some(WhaleStatus::Ranked)
        );
        assert_eq!(next_status(WhaleStatus::Qualified, true, false), None);
    }

    #[test]
    fn requalification_failure_demotes() {
        assert_eq!(
            next_status(WhaleStatus::Qualified, false, false),
            Some(WhaleStatus::Discovered)
        );
        assert_eq!(
            next_status(WhaleStatus::Ranked, false, true),
            Some(WhaleStatus::Discovered)
        );
    }

    #[test]
    fn rejected_is_terminal() {
        assert_eq!(next_status(WhaleStatus::Rejected, true, true), None);
        assert_eq!(next_status(WhaleStatus::Rejected, false, false), None);
    }

    #[test]
    fn ranked_stays_ranked_while_qualifying() {
        // Falling out of the top-N does not regress status; membership is
        // the top_whales() view, not the status column.
        assert_eq!(next_status(WhaleStatus::Ranked, true, false), None);
    }
}
