// =============================================================================
// Pre-Market Scanner — prior-day momentum ranking
// =============================================================================
//
// Once per trading day, sweep the universe's prior-day bars, drop anything
// failing the quality filters, rank by change percentage, and keep the top
// gainers and losers. Each kept symbol gets an opaque indicators blob from
// the external indicators capability. SPY and QQQ decide the day's regime:
//
//   both up   > threshold → bullish
//   both down > threshold → bearish
//   otherwise             → neutral
//
// Per-symbol fetch problems are skipped silently and counted. A scan is
// usable only if it produced at least one gainer and one loser; otherwise
// the orchestrator falls back to the most recent prior scan.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::clock::prev_weekday;
use crate::config::ScannerPolicy;
use crate::momentum::{MomentumStore, RegimeEntry, ScanStats, WatchlistEntry};
use crate::tools::retry::{retry_tool, RetryConfig};
use crate::tools::ToolClient;
use crate::types::{DailyBar, Direction, MarketRegime};

/// Indicator lookback handed to the indicators capability.
const INDICATOR_WINDOW: u32 = 14;

/// Summary of one completed scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub scan_date: NaiveDate,
    pub total_scanned: u32,
    pub gainers: u32,
    pub losers: u32,
    pub fetch_errors: u32,
    pub regime: MarketRegime,
    pub duration_seconds: f64,
}

pub struct Scanner {
    tools: Arc<dyn ToolClient>,
    policy: ScannerPolicy,
    retry: RetryConfig,
}

impl Scanner {
    pub fn new(tools: Arc<dyn ToolClient>, policy: ScannerPolicy, retry: RetryConfig) -> Self {
        Self {
            tools,
            policy,
            retry,
        }
    }

    /// Run the scan for `scan_date` and persist the result through `store`.
    ///
    /// Deterministic given the same inputs: re-running for a date rewrites
    /// the hot cache identically and upserts the archive.
    pub async fn run(
        &self,
        scan_date: NaiveDate,
        store: &MomentumStore,
        now: DateTime<Utc>,
    ) -> Result<ScanReport> {
        let started = Instant::now();
        let prior_day = prev_weekday(scan_date);
        info!(
            scan_date = %scan_date,
            prior_day = %prior_day,
            universe = self.policy.universe.len(),
            "pre-market scan starting"
        );

        // ------------------------------------------------------------------
        // 1. Prior-day bars for the whole universe.
        // ------------------------------------------------------------------
        let tools = self.tools.clone();
        let universe = self.policy.universe.clone();
        let bars = retry_tool(&self.retry, "get_daily_bars", || {
            let tools = tools.clone();
            let universe = universe.clone();
            async move { tools.get_daily_bars(&universe, prior_day, prior_day).await }
        })
        .await?;

        let mut fetch_errors =
            self.policy.universe.len().saturating_sub(bars.len()) as u32;

        // ------------------------------------------------------------------
        // 2.–3. Filter and rank by change percentage.
        // ------------------------------------------------------------------
        let mut candidates: Vec<(String, DailyBar, f64)> = Vec::new();
        for symbol in &self.policy.universe {
            let Some(bar) = bars.get(symbol).and_then(|b| b.last()).copied() else {
                continue;
            };
            if bar.o <= 0.0 {
                fetch_errors += 1;
                continue;
            }
            if bar.c < self.policy.min_price || bar.v < self.policy.min_volume {
                continue;
            }
            let change_pct = (bar.c - bar.o) / bar.o * 100.0;
            candidates.push((symbol.clone(), bar, change_pct));
        }
        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

        let gainers: Vec<_> = candidates
            .iter()
            .filter(|(_, _, chg)| *chg > 0.0)
            .take(self.policy.top_gainers)
            .cloned()
            .collect();
        // Walking the descending sort in reverse yields losers in rank
        // order: most negative change first.
        let losers: Vec<_> = candidates
            .iter()
            .rev()
            .filter(|(_, _, chg)| *chg < 0.0)
            .take(self.policy.top_losers)
            .cloned()
            .collect();

        // ------------------------------------------------------------------
        // 5. Indicators for the selected movers.
        // ------------------------------------------------------------------
        let mut movers = Vec::with_capacity(gainers.len() + losers.len());
        for (direction, selected) in [(Direction::Gainer, &gainers), (Direction::Loser, &losers)] {
            for (rank0, (symbol, bar, change_pct)) in selected.iter().enumerate() {
                let indicators = match self.fetch_indicators(symbol).await {
                    Ok(blob) => blob,
                    Err(e) => {
                        debug!(symbol = %symbol, error = %e, "indicators unavailable");
                        fetch_errors += 1;
                        serde_json::Value::Null
                    }
                };

                // The bar feed carries no capitalization; enforce the floor
                // only when the indicators payload reports one.
                if let Some(cap) = indicators.get("market_cap").and_then(|v| v.as_f64()) {
                    if cap < self.policy.min_market_cap {
                        debug!(symbol = %symbol, market_cap = cap, "below market-cap floor");
                        continue;
                    }
                }

                movers.push(WatchlistEntry {
                    scan_date,
                    symbol: symbol.clone(),
                    direction,
                    rank: rank0 as u32 + 1,
                    open: bar.o,
                    high: bar.h,
                    low: bar.l,
                    close: bar.c,
                    volume: bar.v,
                    change_pct: *change_pct,
                    indicators,
                    momentum_score: change_pct.abs(),
                });
            }
        }

        let gainers_count = movers
            .iter()
            .filter(|m| m.direction == Direction::Gainer)
            .count() as u32;
        let losers_count = movers.len() as u32 - gainers_count;

        // ------------------------------------------------------------------
        // 6. Index movers → regime.
        // ------------------------------------------------------------------
        let regime = self.derive_regime(scan_date, prior_day).await;

        // ------------------------------------------------------------------
        // Usability check before anything is written.
        // ------------------------------------------------------------------
        if gainers_count == 0 || losers_count == 0 {
            anyhow::bail!(
                "scan for {scan_date} produced {gainers_count} gainers / {losers_count} losers"
            );
        }

        // ------------------------------------------------------------------
        // 7.–8. Persist and report.
        // ------------------------------------------------------------------
        let duration_seconds = started.elapsed().as_secs_f64();
        let stats = ScanStats {
            scan_date,
            total_scanned: self.policy.universe.len() as u32,
            high_volume_count: candidates
                .iter()
                .filter(|(_, bar, _)| bar.v >= self.policy.high_volume_threshold)
                .count() as u32,
            gainers_count,
            losers_count,
            avg_change_pct: if candidates.is_empty() {
                0.0
            } else {
                candidates.iter().map(|(_, _, c)| c).sum::<f64>() / candidates.len() as f64
            },
            max_gain_pct: candidates.first().map(|(_, _, c)| *c).unwrap_or(0.0),
            max_loss_pct: candidates.last().map(|(_, _, c)| *c).unwrap_or(0.0),
            fetch_errors,
            scan_duration_seconds: duration_seconds,
        };

        store.write_scan(&movers, &regime, &stats, self.policy.hot_retention_days, now)?;

        let report = ScanReport {
            scan_date,
            total_scanned: stats.total_scanned,
            gainers: gainers_count,
            losers: losers_count,
            fetch_errors,
            regime: regime.regime,
            duration_seconds,
        };
        info!(
            scan_date = %scan_date,
            gainers = report.gainers,
            losers = report.losers,
            fetch_errors = report.fetch_errors,
            regime = %report.regime,
            duration_s = format!("{:.2}", report.duration_seconds),
            "pre-market scan complete"
        );
        Ok(report)
    }

    async fn fetch_indicators(&self, symbol: &str) -> Result<serde_json::Value> {
        let tools = self.tools.clone();
        let symbol = symbol.to_string();
        let blob = retry_tool(&self.retry, "compute_indicators", || {
            let tools = tools.clone();
            let symbol = symbol.clone();
            async move { tools.compute_indicators(&symbol, INDICATOR_WINDOW).await }
        })
        .await?;
        Ok(blob)
    }

    /// SPY/QQQ prior-day changes → coarse regime label.
    async fn derive_regime(&self, scan_date: NaiveDate, prior_day: NaiveDate) -> RegimeEntry {
        let index_symbols = vec!["SPY".to_string(), "QQQ".to_string()];
        let tools = self.tools.clone();
        let bars = retry_tool(&self.retry, "get_daily_bars_indices", || {
            let tools = tools.clone();
            let index_symbols = index_symbols.clone();
            async move { tools.get_daily_bars(&index_symbols, prior_day, prior_day).await }
        })
        .await;

        let change_of = |symbol: &str, bars: &std::collections::HashMap<String, Vec<DailyBar>>| {
            bars.get(symbol)
                .and_then(|b| b.last())
                .filter(|bar| bar.o > 0.0)
                .map(|bar| (bar.c - bar.o) / bar.o * 100.0)
        };

        let (spy, qqq) = match &bars {
            Ok(bars) => (change_of("SPY", bars), change_of("QQQ", bars)),
            Err(e) => {
                warn!(error = %e, "index bars unavailable; regime defaults to neutral");
                (None, None)
            }
        };

        let spy_change_pct = spy.unwrap_or(0.0);
        let qqq_change_pct = qqq.unwrap_or(0.0);
        let threshold = self.policy.regime_threshold_pct;

        let regime = match (spy, qqq) {
            (Some(s), Some(q)) if s > threshold && q > threshold => MarketRegime::Bullish,
            (Some(s), Some(q)) if s < -threshold && q < -threshold => MarketRegime::Bearish,
            _ => MarketRegime::Neutral,
        };

        RegimeEntry {
            scan_date,
            regime,
            spy_change_pct,
            qqq_change_pct,
            market_score: (spy_change_pct + qqq_change_pct) / 2.0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::mock::MockToolClient;
    use chrono::TimeZone;
    use serde_json::json;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 11, 9, 0, 0).unwrap()
    }

    fn bar(o: f64, c: f64, v: f64) -> DailyBar {
        DailyBar {
            ts: Utc.with_ymd_and_hms(2025, 11, 10, 21, 0, 0).unwrap(),
            o,
            h: o.max(c) * 1.01,
            l: o.min(c) * 0.99,
            c,
            v,
        }
    }

    fn policy(universe: &[&str]) -> ScannerPolicy {
        ScannerPolicy {
            universe: universe.iter().map(|s| s.to_string()).collect(),
            top_gainers: 3,
            top_losers: 3,
            ..ScannerPolicy::default()
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
            ..RetryConfig::default()
        }
    }

    fn store(dir: &tempfile::TempDir) -> MomentumStore {
        MomentumStore::open(dir.path()).unwrap()
    }

    #[tokio::test]
    async fn ranks_gainers_and_losers_by_change() {
        let tools = Arc::new(MockToolClient::new(100_000.0));
        {
            let mut s = tools.state.lock();
            s.bars.insert("UP1".into(), vec![bar(100.0, 108.0, 2e6)]);
            s.bars.insert("UP2".into(), vec![bar(100.0, 104.0, 2e6)]);
            s.bars.insert("DN1".into(), vec![bar(100.0, 91.0, 2e6)]);
            s.bars.insert("DN2".into(), vec![bar(100.0, 97.0, 2e6)]);
        }
        let scanner = Scanner::new(
            tools.clone(),
            policy(&["UP1", "UP2", "DN1", "DN2"]),
            fast_retry(),
        );
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);

        let report = scanner.run(date("2025-11-11"), &st, now()).await.unwrap();
        assert_eq!(report.gainers, 2);
        assert_eq!(report.losers, 2);

        let watchlist = st.hot.watchlist(date("2025-11-11")).unwrap();
        assert_eq!(watchlist[0].symbol, "UP1"); // +8% outranks +4%
        assert_eq!(watchlist[0].rank, 1);
        assert_eq!(watchlist[1].symbol, "UP2");
        assert_eq!(watchlist[2].symbol, "DN1"); // -9% is loser rank 1
        assert_eq!(watchlist[2].rank, 1);
        assert_eq!(watchlist[3].symbol, "DN2");
        assert!((watchlist[0].momentum_score - 8.0).abs() < 1e-9);
        assert!((watchlist[2].momentum_score - 9.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn quality_filters_drop_thin_names() {
        let tools = Arc::new(MockToolClient::new(100_000.0));
        {
            let mut s = tools.state.lock();
            s.bars.insert("OK_UP".into(), vec![bar(100.0, 105.0, 2e6)]);
            s.bars.insert("OK_DN".into(), vec![bar(100.0, 95.0, 2e6)]);
            s.bars.insert("PENNY".into(), vec![bar(2.0, 3.0, 9e6)]); // below min_price
            s.bars.insert("THIN".into(), vec![bar(100.0, 120.0, 50_000.0)]); // below min_volume
        }
        let scanner = Scanner::new(
            tools,
            policy(&["OK_UP", "OK_DN", "PENNY", "THIN"]),
            fast_retry(),
        );
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);

        scanner.run(date("2025-11-11"), &st, now()).await.unwrap();
        let symbols: Vec<_> = st
            .hot
            .watchlist(date("2025-11-11"))
            .unwrap()
            .into_iter()
            .map(|m| m.symbol)
            .collect();
        assert_eq!(symbols, vec!["OK_UP", "OK_DN"]);
    }

    #[tokio::test]
    async fn missing_symbols_count_as_fetch_errors() {
        let tools = Arc::new(MockToolClient::new(100_000.0));
        {
            let mut s = tools.state.lock();
            s.bars.insert("UP".into(), vec![bar(100.0, 105.0, 2e6)]);
            s.bars.insert("DN".into(), vec![bar(100.0, 95.0, 2e6)]);
            // "GONE" has no bars at all.
        }
        let scanner = Scanner::new(tools, policy(&["UP", "DN", "GONE"]), fast_retry());
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);

        let report = scanner.run(date("2025-11-11"), &st, now()).await.unwrap();
        assert_eq!(report.fetch_errors, 1);
        assert_eq!(report.gainers + report.losers, 2);
    }

    #[tokio::test]
    async fn one_sided_scan_is_unusable() {
        let tools = Arc::new(MockToolClient::new(100_000.0));
        {
            let mut s = tools.state.lock();
            s.bars.insert("UP1".into(), vec![bar(100.0, 105.0, 2e6)]);
            s.bars.insert("UP2".into(), vec![bar(100.0, 103.0, 2e6)]);
        }
        let scanner = Scanner::new(tools, policy(&["UP1", "UP2"]), fast_retry());
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);

        assert!(scanner.run(date("2025-11-11"), &st, now()).await.is_err());
        // Nothing was written.
        assert!(!st.hot.has_scan(date("2025-11-11")).unwrap());
    }

    #[tokio::test]
    async fn regime_follows_index_movers() {
        let tools = Arc::new(MockToolClient::new(100_000.0));
        {
            let mut s = tools.state.lock();
            s.bars.insert("UP".into(), vec![bar(100.0, 105.0, 2e6)]);
            s.bars.insert("DN".into(), vec![bar(100.0, 95.0, 2e6)]);
            s.bars.insert("SPY".into(), vec![bar(500.0, 504.0, 8e7)]); // +0.8%
            s.bars.insert("QQQ".into(), vec![bar(400.0, 404.0, 5e7)]); // +1.0%
        }
        let scanner = Scanner::new(tools, policy(&["UP", "DN"]), fast_retry());
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);

        let report = scanner.run(date("2025-11-11"), &st, now()).await.unwrap();
        assert_eq!(report.regime, MarketRegime::Bullish);

        let regime = st.hot.regime(date("2025-11-11")).unwrap().unwrap();
        assert!((regime.spy_change_pct - 0.8).abs() < 1e-9);
        assert!((regime.market_score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_indices_default_to_neutral() {
        let tools = Arc::new(MockToolClient::new(100_000.0));
        {
            let mut s = tools.state.lock();
            s.bars.insert("UP".into(), vec![bar(100.0, 105.0, 2e6)]);
            s.bars.insert("DN".into(), vec![bar(100.0, 95.0, 2e6)]);
        }
        let scanner = Scanner::new(tools, policy(&["UP", "DN"]), fast_retry());
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);

        let report = scanner.run(date("2025-11-11"), &st, now()).await.unwrap();
        assert_eq!(report.regime, MarketRegime::Neutral);
    }

    #[tokio::test]
    async fn market_cap_floor_uses_indicator_payload() {
        let tools = Arc::new(MockToolClient::new(100_000.0));
        {
            let mut s = tools.state.lock();
            s.bars.insert("BIG".into(), vec![bar(100.0, 105.0, 2e6)]);
            s.bars.insert("TINY".into(), vec![bar(100.0, 109.0, 2e6)]);
            s.bars.insert("DN".into(), vec![bar(100.0, 95.0, 2e6)]);
            s.indicators.insert("BIG".into(), json!({ "market_cap": 2.0e9 }));
            s.indicators.insert("TINY".into(), json!({ "market_cap": 5.0e7 }));
        }
        let scanner = Scanner::new(tools, policy(&["BIG", "TINY", "DN"]), fast_retry());
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);

        scanner.run(date("2025-11-11"), &st, now()).await.unwrap();
        let symbols: Vec<_> = st
            .hot
            .watchlist(date("2025-11-11"))
            .unwrap()
            .into_iter()
            .map(|m| m.symbol)
            .collect();
        assert!(symbols.contains(&"BIG".to_string()));
        assert!(!symbols.contains(&"TINY".to_string()));
    }

    #[tokio::test]
    async fn rerun_for_same_date_is_idempotent() {
        let tools = Arc::new(MockToolClient::new(100_000.0));
        {
            let mut s = tools.state.lock();
            s.bars.insert("UP".into(), vec![bar(100.0, 105.0, 2e6)]);
            s.bars.insert("DN".into(), vec![bar(100.0, 95.0, 2e6)]);
        }
        let scanner = Scanner::new(tools, policy(&["UP", "DN"]), fast_retry());
        let dir = tempfile::tempdir().unwrap();
        let st = store(&dir);
        let d = date("2025-11-11");

        scanner.run(d, &st, now()).await.unwrap();
        scanner.run(d, &st, now()).await.unwrap();

        assert_eq!(st.hot.watchlist(d).unwrap().len(), 2);
        assert_eq!(st.archive.count_for_date(d).unwrap(), 2);
    }
}
