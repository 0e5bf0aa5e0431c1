// =============================================================================
// Cycle Orchestrator — the daemon's one long-lived loop
// =============================================================================
//
// State machine per tick:
//
//   CHECK_TIME → (closed) SLEEP until five minutes before the next open
//             → (trading session) CHECK_RISK → MAYBE_SCAN → RUN_CYCLE
//             → PERSIST → MAYBE_EOD_FLAT → WAIT out the interval
//
// The orchestrator owns the shutdown handling: cooperative sleeps are
// decomposed into one-second chunks that poll the shared flag, so the
// process exits within a chunk (plus any in-flight tool call) of SIGTERM.
//
// Failure policy: infrastructure errors (equity refresh, persistence) fail
// the cycle and increment a consecutive-failure counter; three in a row end
// the process with a non-zero status for the service manager to restart.
// Tool errors inside the agent run are recorded in the cycle record and do
// not count.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::agent::{AgentSupervisor, CycleContext};
use crate::clock::{Clock, SessionSchedule};
use crate::config::BotConfig;
use crate::journal::Journal;
use crate::momentum::{MomentumStore, WatchlistEntry};
use crate::risk::RiskGovernor;
use crate::scanner::Scanner;
use crate::tools::retry::{retry_tool, RetryConfig};
use crate::tools::ToolClient;
use crate::types::{CycleRecord, MarketRegime, Session, TradeResult};

/// Consecutive cycle failures that end the process.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Cooperative sleeps poll the shutdown flag at this granularity.
const SLEEP_CHUNK_SECS: u64 = 1;

/// How the loop ended; main maps this to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    CleanShutdown,
    FatalCycleFailures,
}

pub struct Orchestrator {
    config: BotConfig,
    schedule: SessionSchedule,
    clock: Arc<dyn Clock>,
    tools: Arc<dyn ToolClient>,
    risk: Arc<RiskGovernor>,
    store: MomentumStore,
    scanner: Scanner,
    supervisor: AgentSupervisor,
    journal: Journal,
    shutdown: Arc<AtomicBool>,
    retry: RetryConfig,

    cycle_id: u64,
    consecutive_failures: u32,
    scanned_on: Option<NaiveDate>,
    eod_flat_on: Option<NaiveDate>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BotConfig,
        schedule: SessionSchedule,
        clock: Arc<dyn Clock>,
        tools: Arc<dyn ToolClient>,
        risk: Arc<RiskGovernor>,
        store: MomentumStore,
        scanner: Scanner,
        supervisor: AgentSupervisor,
        journal: Journal,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let retry = RetryConfig::from_policy(&config.agent);
        Self {
            config,
            schedule,
            clock,
            tools,
            risk,
            store,
            scanner,
            supervisor,
            journal,
            shutdown,
            retry,
            cycle_id: 0,
            consecutive_failures: 0,
            scanned_on: None,
            eod_flat_on: None,
        }
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    pub async fn run(&mut self) -> ExitStatus {
        info!(
            interval_s = self.config.interval_seconds,
            trade_sessions = ?self.config.trade_sessions,
            "orchestrator started"
        );

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let now = self.clock.now();
            let session = self.effective_session(now).await;
            let trade_enabled =
                session != Session::Closed && self.config.trade_sessions.contains(&session);

            if !trade_enabled {
                let plan = self.schedule.sleep_plan(now);
                info!(
                    session = %session,
                    wake_at = %plan.wake_at,
                    reason = plan.reason,
                    "no trading session; sleeping"
                );
                if !self.sleep_until(plan.wake_at).await {
                    break;
                }
                // Loop back into CHECK_TIME: the wake failsafe re-classifies
                // from scratch, so a stale CLOSED can never re-sleep us
                // through the open.
                continue;
            }

            let cycle_started = std::time::Instant::now();
            match self.tick(now, session).await {
                Ok(()) => {
                    self.consecutive_failures = 0;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        consecutive = self.consecutive_failures + 1,
                        "cycle failed"
                    );
                    if self.note_failure() {
                        error!("FATAL_CYCLE_FAILURES: three consecutive cycle failures");
                        self.drain("fatal_cycle_failures");
                        return ExitStatus::FatalCycleFailures;
                    }
                }
            }

            let elapsed = cycle_started.elapsed().as_secs();
            let remaining = self.config.interval_seconds.saturating_sub(elapsed);
            if !self.sleep_for(remaining).await {
                break;
            }
        }

        self.drain("shutdown_signal");
        ExitStatus::CleanShutdown
    }

    /// One full trading-session tick: risk gate, scan, agent run, persist,
    /// EOD flat.
    pub(crate) async fn tick(&mut self, now: DateTime<Utc>, session: Session) -> Result<()> {
        let today = self.schedule.exchange_date(now);

        self.risk.reset_if_new_month(now)?;

        // Equity refresh gates everything; without it the governor is blind.
        let tools = self.tools.clone();
        let account = retry_tool(&self.retry, "get_account", || {
            let tools = tools.clone();
            async move { tools.get_account().await }
        })
        .await
        .map_err(|e| anyhow::anyhow!("equity refresh failed: {e}"))?;
        self.risk.update_equity(account.equity, now)?;
        let pre_equity = account.equity;

        let status = self.risk.status();

        // CHECK_RISK comes before MAYBE_SCAN: a suspended day never invokes
        // the scanner.
        if !status.allowed {
            let (scan_date, _, regime) = self.load_watchlist(today)?;
            let reason = status
                .reason
                .clone()
                .unwrap_or_else(|| "RISK_SUSPENDED".to_string());
            info!(reason = %reason, "cycle skipped: risk governor disallows trading");
            let record = CycleRecord {
                cycle_id: self.cycle_id + 1,
                started_at: now,
                ended_at: now,
                session,
                regime,
                scan_date,
                skipped: Some(format!("RISK_SUSPENDED: {reason}")),
                agent_steps_used: 0,
                orders_submitted: Vec::new(),
                orders_filled: Vec::new(),
                errors: Vec::new(),
                final_equity: pre_equity,
                final_positions: Vec::new(),
            };
            self.persist_cycle(today, &record)?;
            // Flat is flat: the EOD close runs even on a suspended day.
            self.maybe_eod_flat(now, today).await?;
            return Ok(());
        }

        self.maybe_scan(now, today).await;
        let (scan_date, watchlist, regime) = self.load_watchlist(today)?;

        // ------------------------------------------------------------------
        // RUN_CYCLE
        // ------------------------------------------------------------------
        let ctx = CycleContext {
            cycle_id: self.cycle_id + 1,
            session,
            regime,
            exchange_local: self
                .schedule
                .exchange_time(now)
                .format("%Y-%m-%d %H:%M:%S %Z")
                .to_string(),
            risk: status,
            scan_date,
            watchlist,
        };
        let outcome = self.supervisor.run_once(&ctx).await;
        let ended_at = self.clock.now();

        if outcome.steps_exhausted {
            warn!(
                cycle_id = ctx.cycle_id,
                "agent steps exhausted; orders already placed stand"
            );
        }

        // Post-cycle equity and trade accounting.
        let final_equity = outcome
            .final_account
            .as_ref()
            .map(|a| a.equity)
            .unwrap_or(pre_equity);
        if outcome.final_account.is_some() {
            self.risk.update_equity(final_equity, ended_at)?;
        }
        if !outcome.orders_filled.is_empty() {
            let mut symbols: Vec<&str> = outcome
                .orders_filled
                .iter()
                .map(|o| o.symbol.as_str())
                .collect();
            symbols.sort_unstable();
            symbols.dedup();
            self.risk.record_trade(TradeResult {
                symbol: symbols.join(","),
                pnl: final_equity - pre_equity,
                closed_at: ended_at,
            })?;
        }

        // ------------------------------------------------------------------
        // PERSIST
        // ------------------------------------------------------------------
        let record = CycleRecord {
            cycle_id: self.cycle_id + 1,
            started_at: now,
            ended_at,
            session,
            regime,
            scan_date,
            skipped: None,
            agent_steps_used: outcome.agent_steps_used,
            orders_submitted: outcome.orders_submitted,
            orders_filled: outcome.orders_filled,
            errors: outcome.errors,
            final_equity,
            final_positions: outcome.final_positions,
        };
        self.persist_cycle(today, &record)?;

        // ------------------------------------------------------------------
        // MAYBE_EOD_FLAT
        // ------------------------------------------------------------------
        self.maybe_eod_flat(ended_at, today).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Session selection
    // -------------------------------------------------------------------------

    /// Classify the instant, then let a fresh broker clock own the `is_open`
    /// bit. When the broker is unreachable the pure table stands, with the
    /// regular-window failsafe guarding against any stale CLOSED.
    async fn effective_session(&self, now: DateTime<Utc>) -> Session {
        let table = self.schedule.classify(now);
        match self.tools.market_clock().await {
            Ok(broker) => {
                let info = self.schedule.apply_broker_override(table, &broker);
                if info.session != table.session {
                    warn!(
                        table_session = %table.session,
                        broker_open = broker.is_open,
                        "clock disagreement; trusting broker is_open"
                    );
                }
                info.session
            }
            Err(e) => {
                warn!(error = %e, "broker clock unreachable; falling back to session table");
                if self.schedule.regular_window_failsafe(now) {
                    Session::Regular
                } else {
                    table.session
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // MAYBE_SCAN
    // -------------------------------------------------------------------------

    /// At most one scan attempt per exchange-local date, at or after the
    /// policy scan time. A failed attempt latches too; the cycle falls back
    /// to the most recent prior scan for the rest of the day.
    async fn maybe_scan(&mut self, now: DateTime<Utc>, today: NaiveDate) {
        if self.scanned_on == Some(today) {
            return;
        }
        if self.schedule.exchange_time(now).time() < self.config.scan_at() {
            return;
        }
        if let Ok(true) = self.store.hot.has_scan(today) {
            // A previous process instance already scanned today.
            self.scanned_on = Some(today);
            return;
        }

        self.scanned_on = Some(today);
        match self.scanner.run(today, &self.store, now).await {
            Ok(report) => {
                let _ = self.journal.append_log(
                    today,
                    &json!({
                        "event": "scan",
                        "scan_date": report.scan_date,
                        "total_scanned": report.total_scanned,
                        "gainers": report.gainers,
                        "losers": report.losers,
                        "fetch_errors": report.fetch_errors,
                        "regime": report.regime,
                        "duration_seconds": report.duration_seconds,
                    }),
                );
            }
            Err(e) => {
                warn!(
                    scan_date = %today,
                    error = %e,
                    "SCAN_FALLBACK: scan unusable; reusing most recent prior scan"
                );
                let _ = self.journal.append_log(
                    today,
                    &json!({ "event": "scan_fallback", "scan_date": today, "error": e.to_string() }),
                );
            }
        }
    }

    /// Today's watchlist, or the most recent prior scan, or nothing.
    fn load_watchlist(
        &self,
        today: NaiveDate,
    ) -> Result<(Option<NaiveDate>, Vec<WatchlistEntry>, Option<MarketRegime>)> {
        let scan_date = if self.store.hot.has_scan(today)? {
            Some(today)
        } else {
            self.store.hot.latest_scan_date()?
        };
        let Some(scan_date) = scan_date else {
            return Ok((None, Vec::new(), None));
        };
        let watchlist = self.store.hot.watchlist(scan_date)?;
        let regime = self.store.hot.regime(scan_date)?.map(|r| r.regime);
        Ok((Some(scan_date), watchlist, regime))
    }

    // -------------------------------------------------------------------------
    // MAYBE_EOD_FLAT
    // -------------------------------------------------------------------------

    /// Force-flat all positions once per date at or after the policy flat
    /// time. The latch is set only on success so a transient broker outage
    /// retries on the next tick.
    async fn maybe_eod_flat(&mut self, now: DateTime<Utc>, today: NaiveDate) -> Result<()> {
        if self.eod_flat_on == Some(today) {
            return Ok(());
        }
        if !self.schedule.is_eod_flat_trigger(now) {
            return Ok(());
        }

        let tools = self.tools.clone();
        match retry_tool(&self.retry, "close_all_positions", || {
            let tools = tools.clone();
            async move { tools.close_all_positions(true).await }
        })
        .await
        {
            Ok(results) => {
                info!(closed = results.len(), "EOD flat executed");
                self.journal
                    .append_trade(
                        today,
                        &json!({
                            "event": "eod_flat",
                            "cycle_id": self.cycle_id,
                            "at": now.to_rfc3339(),
                            "results": results,
                        }),
                    )
                    .context("failed to journal EOD flat")?;
                let _ = self.journal.append_log(
                    today,
                    &json!({ "event": "eod_flat", "closed": results.len() }),
                );
                self.eod_flat_on = Some(today);
            }
            Err(e) => {
                warn!(error = %e, "EOD flat failed; will retry next tick");
                let _ = self.journal.append_log(
                    today,
                    &json!({ "event": "eod_flat_failed", "error": e.to_string() }),
                );
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Append the cycle record and its orders. The cycle counter advances
    /// only after the appends succeed; on failure the same cycle id is
    /// retried next tick.
    fn persist_cycle(&mut self, today: NaiveDate, record: &CycleRecord) -> Result<()> {
        let mut log_entry =
            serde_json::to_value(record).context("failed to encode cycle record")?;
        log_entry["event"] = json!("cycle");
        self.journal
            .append_log(today, &log_entry)
            .context("failed to journal cycle record")?;

        for order in &record.orders_submitted {
            self.journal
                .append_trade(
                    today,
                    &json!({
                        "event": "order",
                        "cycle_id": record.cycle_id,
                        "symbol": order.symbol,
                        "side": order.side,
                        "qty": order.qty,
                        "order_id": order.order_id,
                        "status": order.status,
                    }),
                )
                .context("failed to journal order")?;
        }

        self.cycle_id = record.cycle_id;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Failure counting and shutdown
    // -------------------------------------------------------------------------

    /// Record one cycle failure; true when the fatal threshold is reached.
    fn note_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
    }

    fn drain(&mut self, reason: &str) {
        let now = self.clock.now();
        let date = self.schedule.exchange_date(now);
        let _ = self.journal.append_log(
            date,
            &json!({
                "event": "exit",
                "reason": reason,
                "at": now.to_rfc3339(),
                "cycles_completed": self.cycle_id,
            }),
        );
        if let Err(e) = self.journal.close() {
            warn!(error = %e, "failed to close journal on drain");
        }
        info!(reason, cycles = self.cycle_id, "orchestrator drained");
    }

    // -------------------------------------------------------------------------
    // Cooperative sleep
    // -------------------------------------------------------------------------

    /// Sleep until `wake_at`, polling the shutdown flag every chunk.
    /// Returns false when the flag interrupted the sleep.
    async fn sleep_until(&self, wake_at: DateTime<Utc>) -> bool {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let now = self.clock.now();
            if now >= wake_at {
                return true;
            }
            let remaining = (wake_at - now).num_seconds().max(1) as u64;
            let chunk = remaining.min(SLEEP_CHUNK_SECS);
            sleep(std::time::Duration::from_secs(chunk)).await;
        }
    }

    /// Sleep `secs`, polling the shutdown flag. Returns false on shutdown.
    async fn sleep_for(&self, secs: u64) -> bool {
        let wake_at = self.clock.now() + chrono::Duration::seconds(secs as i64);
        self.sleep_until(wake_at).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testkit::ScriptedReasoner;
    use crate::agent::{AgentStep, Reasoner};
    use crate::config::{AgentPolicy, RiskPolicy, ScannerPolicy};
    use crate::risk::RiskGovernor;
    use crate::tools::mock::MockToolClient;
    use chrono::{NaiveDateTime, TimeZone};
    use chrono_tz::America::New_York;
    use parking_lot::Mutex;

    fn ny(s: &str) -> DateTime<Utc> {
        let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap();
        New_York
            .from_local_datetime(&naive)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    /// A clock tests can move.
    struct TestClock(Mutex<DateTime<Utc>>);

    impl TestClock {
        fn at(s: &str) -> Arc<Self> {
            Arc::new(Self(Mutex::new(ny(s))))
        }
        fn set(&self, s: &str) {
            *self.0.lock() = ny(s);
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    fn bar(o: f64, c: f64) -> crate::types::DailyBar {
        crate::types::DailyBar {
            ts: Utc.with_ymd_and_hms(2025, 11, 10, 21, 0, 0).unwrap(),
            o,
            h: o.max(c),
            l: o.min(c),
            c,
            v: 2_000_000.0,
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        tools: Arc<MockToolClient>,
        clock: Arc<TestClock>,
        dir: tempfile::TempDir,
    }

    fn fixture(steps: Vec<AgentStep>, clock_time: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BotConfig::default();
        config.data_root = dir.path().to_path_buf();
        config.scanner = ScannerPolicy {
            universe: vec!["UP".to_string(), "DN".to_string()],
            ..ScannerPolicy::default()
        };
        config.agent = AgentPolicy {
            max_retries: 1,
            retry_base_delay_ms: 1,
            ..AgentPolicy::default()
        };

        let tools = Arc::new(MockToolClient::new(100_000.0));
        {
            let mut s = tools.state.lock();
            s.bars.insert("UP".into(), vec![bar(100.0, 105.0)]);
            s.bars.insert("DN".into(), vec![bar(100.0, 95.0)]);
        }

        let clock = TestClock::at(clock_time);
        let schedule = SessionSchedule::new(config.eod_flat_at());
        let shutdown = Arc::new(AtomicBool::new(false));
        let state_dir = config.state_dir();

        let risk = Arc::new(RiskGovernor::load_or_init(
            state_dir.join("risk_management.json"),
            RiskPolicy::default(),
            schedule.clone(),
            100_000.0,
            clock.now(),
        ));
        let store = MomentumStore::open(&state_dir).unwrap();
        let scanner = Scanner::new(
            tools.clone() as Arc<dyn ToolClient>,
            config.scanner.clone(),
            RetryConfig::from_policy(&config.agent),
        );
        let reasoner: Arc<dyn Reasoner> = Arc::new(ScriptedReasoner::new(steps));
        let supervisor = AgentSupervisor::new(
            reasoner,
            tools.clone() as Arc<dyn ToolClient>,
            risk.clone(),
            config.agent.clone(),
            String::new(),
            shutdown.clone(),
        );
        let journal = Journal::new(state_dir);

        let orchestrator = Orchestrator::new(
            config,
            schedule,
            clock.clone() as Arc<dyn Clock>,
            tools.clone() as Arc<dyn ToolClient>,
            risk,
            store,
            scanner,
            supervisor,
            journal,
            shutdown,
        );

        Fixture {
            orchestrator,
            tools,
            clock,
            dir,
        }
    }

    fn log_lines(fix: &Fixture, date: &str) -> Vec<serde_json::Value> {
        let path = fix
            .dir
            .path()
            .join("meridian/log")
            .join(date)
            .join("log.jsonl");
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn buy(symbol: &str) -> AgentStep {
        AgentStep::ToolCall {
            name: "place_order".to_string(),
            arguments: serde_json::json!({
                "symbol": symbol, "qty": 10.0, "side": "buy", "type": "market",
            }),
        }
    }

    #[tokio::test]
    async fn normal_cycle_scans_trades_and_persists() {
        let mut fix = fixture(
            vec![
                buy("UP"),
                AgentStep::Done {
                    summary: "done".to_string(),
                },
            ],
            "2025-11-11 10:00:00",
        );
        let now = fix.clock.now();
        fix.orchestrator.tick(now, Session::Regular).await.unwrap();

        // Scan happened and is cached.
        assert!(fix
            .orchestrator
            .store
            .hot
            .has_scan("2025-11-11".parse().unwrap())
            .unwrap());

        // One order placed, one cycle journaled with it.
        assert_eq!(fix.tools.state.lock().placed.len(), 1);
        let lines = log_lines(&fix, "2025-11-11");
        let cycle = lines.iter().find(|l| l["event"] == "cycle").unwrap();
        assert_eq!(cycle["cycle_id"], 1);
        assert_eq!(cycle["scan_date"], "2025-11-11");
        assert_eq!(cycle["orders_submitted"].as_array().unwrap().len(), 1);
        assert_eq!(cycle["orders_submitted"][0]["symbol"], "UP");

        // The filled order fed the governor's ring.
        assert_eq!(
            fix.orchestrator.risk.snapshot().last_trade_results.len(),
            1
        );
    }

    #[tokio::test]
    async fn scan_runs_at_most_once_per_date() {
        let mut fix = fixture(Vec::new(), "2025-11-11 10:00:00");
        let now = fix.clock.now();
        fix.orchestrator.tick(now, Session::Regular).await.unwrap();
        let calls_after_first = fix.tools.state.lock().bars_calls;

        fix.clock.set("2025-11-11 10:02:00");
        let now = fix.clock.now();
        fix.orchestrator.tick(now, Session::Regular).await.unwrap();
        assert_eq!(fix.tools.state.lock().bars_calls, calls_after_first);
    }

    #[tokio::test]
    async fn failed_scan_falls_back_to_prior_cache() {
        let mut fix = fixture(Vec::new(), "2025-11-11 10:00:00");
        // No losers in today's data → unusable scan.
        {
            let mut s = fix.tools.state.lock();
            s.bars.remove("DN");
        }
        // Seed yesterday's scan.
        let prior: NaiveDate = "2025-11-10".parse().unwrap();
        let movers = crate::momentum::testkit::sample_movers(prior, 2, 2);
        fix.orchestrator
            .store
            .write_scan(
                &movers,
                &crate::momentum::testkit::sample_regime(prior),
                &crate::momentum::testkit::sample_stats(prior, &movers),
                30,
                fix.clock.now(),
            )
            .unwrap();

        let now = fix.clock.now();
        fix.orchestrator.tick(now, Session::Regular).await.unwrap();

        let lines = log_lines(&fix, "2025-11-11");
        assert!(lines.iter().any(|l| l["event"] == "scan_fallback"));
        let cycle = lines.iter().find(|l| l["event"] == "cycle").unwrap();
        assert_eq!(cycle["scan_date"], "2025-11-10");
    }

    #[tokio::test]
    async fn suspended_governor_skips_the_agent() {
        let mut fix = fixture(vec![buy("UP")], "2025-11-11 10:00:00");
        fix.orchestrator.risk.halt("test").unwrap();

        let now = fix.clock.now();
        fix.orchestrator.tick(now, Session::Regular).await.unwrap();

        assert!(fix.tools.state.lock().placed.is_empty());
        // The risk gate also blocks the scanner: no bar fetches, no cache.
        assert_eq!(fix.tools.state.lock().bars_calls, 0);
        assert!(!fix
            .orchestrator
            .store
            .hot
            .has_scan("2025-11-11".parse().unwrap())
            .unwrap());
        let lines = log_lines(&fix, "2025-11-11");
        let cycle = lines.iter().find(|l| l["event"] == "cycle").unwrap();
        assert!(cycle["skipped"]
            .as_str()
            .unwrap()
            .starts_with("RISK_SUSPENDED"));
        assert_eq!(cycle["agent_steps_used"], 0);
    }

    #[tokio::test]
    async fn eod_flat_fires_once_per_date() {
        let mut fix = fixture(Vec::new(), "2025-11-11 15:50:00");
        {
            let mut s = fix.tools.state.lock();
            s.positions.push(crate::types::PositionSnapshot {
                symbol: "UP".into(),
                qty: 10.0,
                avg_entry_price: 100.0,
                unrealized_pl: 0.0,
                unrealized_plpc: 0.0,
            });
        }

        let now = fix.clock.now();
        fix.orchestrator.tick(now, Session::Regular).await.unwrap();
        assert_eq!(fix.tools.state.lock().close_calls, vec![true]);

        fix.clock.set("2025-11-11 15:55:00");
        let now = fix.clock.now();
        fix.orchestrator.tick(now, Session::Regular).await.unwrap();
        assert_eq!(fix.tools.state.lock().close_calls.len(), 1);

        // Next trading day the latch re-arms.
        fix.clock.set("2025-11-12 15:50:00");
        let now = fix.clock.now();
        fix.orchestrator.tick(now, Session::Regular).await.unwrap();
        assert_eq!(fix.tools.state.lock().close_calls.len(), 2);
    }

    #[tokio::test]
    async fn eod_flat_is_not_latched_by_early_cycles() {
        let mut fix = fixture(Vec::new(), "2025-11-11 10:00:00");
        let now = fix.clock.now();
        fix.orchestrator.tick(now, Session::Regular).await.unwrap();
        assert!(fix.tools.state.lock().close_calls.is_empty());
    }

    #[tokio::test]
    async fn equity_refresh_failure_is_a_cycle_failure() {
        let mut fix = fixture(Vec::new(), "2025-11-11 10:00:00");
        fix.tools.state.lock().account_failures = 100;

        let now = fix.clock.now();
        assert!(fix.orchestrator.tick(now, Session::Regular).await.is_err());
        // The cycle counter did not advance.
        assert_eq!(fix.orchestrator.cycle_id, 0);
    }

    #[tokio::test]
    async fn three_failures_reach_the_fatal_threshold() {
        let mut fix = fixture(Vec::new(), "2025-11-11 10:00:00");
        assert!(!fix.orchestrator.note_failure());
        assert!(!fix.orchestrator.note_failure());
        assert!(fix.orchestrator.note_failure());
    }

    #[tokio::test]
    async fn run_exits_clean_when_shutdown_is_set() {
        let mut fix = fixture(Vec::new(), "2025-11-11 10:00:00");
        fix.orchestrator.shutdown.store(true, Ordering::SeqCst);
        assert_eq!(fix.orchestrator.run().await, ExitStatus::CleanShutdown);
    }

    #[tokio::test]
    async fn sleep_until_observes_shutdown_within_a_chunk() {
        let fix = fixture(Vec::new(), "2025-11-11 10:00:00");
        let flag = fix.orchestrator.shutdown.clone();
        let setter = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let started = std::time::Instant::now();
        let wake_at = fix.clock.now() + chrono::Duration::hours(6);
        let completed = fix.orchestrator.sleep_until(wake_at).await;
        setter.await.unwrap();

        assert!(!completed);
        assert!(started.elapsed() < std::time::Duration::from_secs(3));
    }

    #[tokio::test]
    async fn monthly_rollover_happens_on_first_tick_of_month() {
        let mut fix = fixture(Vec::new(), "2025-11-28 10:00:00");
        // Trip the governor in November.
        fix.orchestrator
            .risk
            .update_equity(105_000.0, ny("2025-11-28 09:35:00"))
            .unwrap();
        fix.orchestrator
            .risk
            .update_equity(98_000.0, ny("2025-11-28 09:40:00"))
            .unwrap();
        assert!(!fix.orchestrator.risk.status().allowed);

        // First tick of December re-anchors and trades again.
        fix.clock.set("2025-12-01 10:00:00");
        let now = fix.clock.now();
        fix.orchestrator.tick(now, Session::Regular).await.unwrap();
        assert!(fix.orchestrator.risk.status().allowed);
        assert_eq!(fix.orchestrator.risk.snapshot().month_key, "2025-12");
    }
}
