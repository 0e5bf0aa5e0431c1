// =============================================================================
// Hot cache — the short-retention tier driving today's trading
// =============================================================================
//
// Optimized for repeated intraday reads of a single scan date. The write path
// is a destructive replace: within one transaction, all rows for the date are
// deleted, the fresh result set is inserted, and anything older than the
// retention window is purged.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::momentum::{RegimeEntry, ScanStats, WatchlistEntry};
use crate::types::{Direction, MarketRegime};

pub struct HotCache {
    conn: Mutex<Connection>,
}

impl HotCache {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open hot cache {}", path.display()))?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS daily_movers (
                scan_date      TEXT NOT NULL,
                symbol         TEXT NOT NULL,
                direction      TEXT NOT NULL,
                rank           INTEGER NOT NULL,
                open           REAL NOT NULL,
                high           REAL NOT NULL,
                low            REAL NOT NULL,
                close          REAL NOT NULL,
                volume         REAL NOT NULL,
                change_pct     REAL NOT NULL,
                indicators     TEXT NOT NULL,
                momentum_score REAL NOT NULL,
                UNIQUE (scan_date, symbol)
            );
            CREATE TABLE IF NOT EXISTS market_regime (
                scan_date      TEXT PRIMARY KEY,
                regime         TEXT NOT NULL,
                spy_change_pct REAL NOT NULL,
                qqq_change_pct REAL NOT NULL,
                market_score   REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS scan_stats (
                scan_date             TEXT PRIMARY KEY,
                total_scanned         INTEGER NOT NULL,
                high_volume_count     INTEGER NOT NULL,
                gainers_count         INTEGER NOT NULL,
                losers_count          INTEGER NOT NULL,
                avg_change_pct        REAL NOT NULL,
                max_gain_pct          REAL NOT NULL,
                max_loss_pct          REAL NOT NULL,
                fetch_errors          INTEGER NOT NULL,
                scan_duration_seconds REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_movers_date ON daily_movers (scan_date);
            COMMIT;",
        )
        .context("failed to initialise hot cache schema")?;

        debug!(path = %path.display(), "hot cache opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Destructively replace all rows for `scan_date`, then purge rows older
    /// than `retention_days`. One transaction.
    pub fn replace_day(
        &self,
        scan_date: NaiveDate,
        movers: &[WatchlistEntry],
        regime: &RegimeEntry,
        stats: &ScanStats,
        retention_days: i64,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let date_key = scan_date.to_string();

        tx.execute("DELETE FROM daily_movers WHERE scan_date = ?1", params![date_key])?;
        tx.execute("DELETE FROM market_regime WHERE scan_date = ?1", params![date_key])?;
        tx.execute("DELETE FROM scan_stats WHERE scan_date = ?1", params![date_key])?;

        for m in movers {
            tx.execute(
                "INSERT INTO daily_movers
                 (scan_date, symbol, direction, rank, open, high, low, close,
                  volume, change_pct, indicators, momentum_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    date_key,
                    m.symbol,
                    m.direction.as_str(),
                    m.rank,
                    m.open,
                    m.high,
                    m.low,
                    m.close,
                    m.volume,
                    m.change_pct,
                    m.indicators.to_string(),
                    m.momentum_score,
                ],
            )?;
        }

        tx.execute(
            "INSERT INTO market_regime
             (scan_date, regime, spy_change_pct, qqq_change_pct, market_score)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                date_key,
                regime.regime.as_str(),
                regime.spy_change_pct,
                regime.qqq_change_pct,
                regime.market_score,
            ],
        )?;

        tx.execute(
            "INSERT INTO scan_stats
             (scan_date, total_scanned, high_volume_count, gainers_count,
              losers_count, avg_change_pct, max_gain_pct, max_loss_pct,
              fetch_errors, scan_duration_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                date_key,
                stats.total_scanned,
                stats.high_volume_count,
                stats.gainers_count,
                stats.losers_count,
                stats.avg_change_pct,
                stats.max_gain_pct,
                stats.max_loss_pct,
                stats.fetch_errors,
                stats.scan_duration_seconds,
            ],
        )?;

        // Retention purge.
        let cutoff = (scan_date - Duration::days(retention_days)).to_string();
        let purged = tx.execute("DELETE FROM daily_movers WHERE scan_date < ?1", params![cutoff])?
            + tx.execute("DELETE FROM market_regime WHERE scan_date < ?1", params![cutoff])?
            + tx.execute("DELETE FROM scan_stats WHERE scan_date < ?1", params![cutoff])?;

        tx.commit()?;

        info!(
            scan_date = %scan_date,
            movers = movers.len(),
            purged_rows = purged,
            "hot cache replaced"
        );
        Ok(())
    }

    /// The ranked watchlist for one scan date: gainers first, then losers,
    /// by rank.
    pub fn watchlist(&self, scan_date: NaiveDate) -> Result<Vec<WatchlistEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT scan_date, symbol, direction, rank, open, high, low, close,
                    volume, change_pct, indicators, momentum_score
             FROM daily_movers
             WHERE scan_date = ?1
             ORDER BY direction ASC, rank ASC",
        )?;
        let rows = stmt.query_map(params![scan_date.to_string()], row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn regime(&self, scan_date: NaiveDate) -> Result<Option<RegimeEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT scan_date, regime, spy_change_pct, qqq_change_pct, market_score
             FROM market_regime WHERE scan_date = ?1",
        )?;
        let mut rows = stmt.query_map(params![scan_date.to_string()], |row| {
            let date: String = row.get(0)?;
            let regime: String = row.get(1)?;
            Ok(RegimeEntry {
                scan_date: date.parse().unwrap_or(scan_date),
                regime: MarketRegime::parse(&regime).unwrap_or(MarketRegime::Neutral),
                spy_change_pct: row.get(2)?,
                qqq_change_pct: row.get(3)?,
                market_score: row.get(4)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn stats(&self, scan_date: NaiveDate) -> Result<Option<ScanStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT scan_date, total_scanned, high_volume_count, gainers_count,
                    losers_count, avg_change_pct, max_gain_pct, max_loss_pct,
                    fetch_errors, scan_duration_seconds
             FROM scan_stats WHERE scan_date = ?1",
        )?;
        let mut rows = stmt.query_map(params![scan_date.to_string()], |row| {
            let date: String = row.get(0)?;
            Ok(ScanStats {
                scan_date: date.parse().unwrap_or(scan_date),
                total_scanned: row.get(1)?,
                high_volume_count: row.get(2)?,
                gainers_count: row.get(3)?,
                losers_count: row.get(4)?,
                avg_change_pct: row.get(5)?,
                max_gain_pct: row.get(6)?,
                max_loss_pct: row.get(7)?,
                fetch_errors: row.get(8)?,
                scan_duration_seconds: row.get(9)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    /// Whether any movers exist for the date. Drives the first-startup scan
    /// decision.
    pub fn has_scan(&self, scan_date: NaiveDate) -> Result<bool> {
        let conn = self.conn.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM daily_movers WHERE scan_date = ?1",
            params![scan_date.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Most recent scan date in the cache, if any. Used for fallback when a
    /// scan fails.
    pub fn latest_scan_date(&self) -> Result<Option<NaiveDate>> {
        let conn = self.conn.lock();
        let date: Option<String> = conn.query_row(
            "SELECT MAX(scan_date) FROM daily_movers",
            [],
            |row| row.get(0),
        )?;
        Ok(date.and_then(|d| d.parse().ok()))
    }
}

/// Shared row mapper for the movers shape.
pub(crate) fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<WatchlistEntry> {
    let date: String = row.get(0)?;
    let direction: String = row.get(2)?;
    let indicators: String = row.get(10)?;
    Ok(WatchlistEntry {
        scan_date: date.parse().unwrap_or_default(),
        symbol: row.get(1)?,
        direction: Direction::parse(&direction).unwrap_or(Direction::Gainer),
        rank: row.get(3)?,
        open: row.get(4)?,
        high: row.get(5)?,
        low: row.get(6)?,
        close: row.get(7)?,
        volume: row.get(8)?,
        change_pct: row.get(9)?,
        indicators: serde_json::from_str(&indicators).unwrap_or(serde_json::Value::Null),
        momentum_score: row.get(11)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::momentum::testkit::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn open_cache(dir: &tempfile::TempDir) -> HotCache {
        HotCache::open(&dir.path().join("momentum_cache.db")).unwrap()
    }

    #[test]
    fn replace_day_is_destructive_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir);
        let d = date("2025-11-10");

        let first = sample_movers(d, 5, 5);
        cache
            .replace_day(d, &first, &sample_regime(d), &sample_stats(d, &first), 30)
            .unwrap();
        assert_eq!(cache.watchlist(d).unwrap().len(), 10);

        // Re-running with a smaller set fully replaces the date.
        let second = sample_movers(d, 2, 1);
        cache
            .replace_day(d, &second, &sample_regime(d), &sample_stats(d, &second), 30)
            .unwrap();
        let rows = cache.watchlist(d).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.scan_date == d));
    }

    #[test]
    fn watchlist_orders_gainers_before_losers_by_rank() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir);
        let d = date("2025-11-10");
        let movers = sample_movers(d, 3, 3);
        cache
            .replace_day(d, &movers, &sample_regime(d), &sample_stats(d, &movers), 30)
            .unwrap();

        let rows = cache.watchlist(d).unwrap();
        assert_eq!(rows[0].symbol, "GAIN1");
        assert_eq!(rows[2].symbol, "GAIN3");
        assert_eq!(rows[3].symbol, "LOSE1");
        assert_eq!(rows[5].symbol, "LOSE3");
    }

    #[test]
    fn retention_purges_old_dates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir);

        let old = date("2025-10-01");
        let movers = sample_movers(old, 2, 2);
        cache
            .replace_day(old, &movers, &sample_regime(old), &sample_stats(old, &movers), 30)
            .unwrap();
        assert!(cache.has_scan(old).unwrap());

        // A scan 40 days later pushes the old date past the window.
        let new = date("2025-11-10");
        let movers = sample_movers(new, 2, 2);
        cache
            .replace_day(new, &movers, &sample_regime(new), &sample_stats(new, &movers), 30)
            .unwrap();

        assert!(!cache.has_scan(old).unwrap());
        assert!(cache.has_scan(new).unwrap());
        assert!(cache.regime(old).unwrap().is_none());
        assert!(cache.stats(old).unwrap().is_none());
    }

    #[test]
    fn regime_and_stats_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir);
        let d = date("2025-11-10");
        let movers = sample_movers(d, 1, 1);
        cache
            .replace_day(d, &movers, &sample_regime(d), &sample_stats(d, &movers), 30)
            .unwrap();

        let regime = cache.regime(d).unwrap().unwrap();
        assert_eq!(regime.regime, crate::types::MarketRegime::Bullish);
        assert_eq!(regime.spy_change_pct, 0.8);

        let stats = cache.stats(d).unwrap().unwrap();
        assert_eq!(stats.total_scanned, 100);
        assert_eq!(stats.gainers_count, 1);
        assert_eq!(stats.losers_count, 1);
    }

    #[test]
    fn latest_scan_date_tracks_newest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir);
        assert!(cache.latest_scan_date().unwrap().is_none());

        for d in ["2025-11-06", "2025-11-07", "2025-11-10"] {
            let d = date(d);
            let movers = sample_movers(d, 1, 1);
            cache
                .replace_day(d, &movers, &sample_regime(d), &sample_stats(d, &movers), 30)
                .unwrap();
        }
        assert_eq!(cache.latest_scan_date().unwrap(), Some(date("2025-11-10")));
    }
}
