// =============================================================================
// Historical archive — the append-only tier
// =============================================================================
//
// A monotonic superset of every scan ever cached. Writes are idempotent
// upserts keyed on `(scan_date, symbol)`: re-archiving a date updates the
// rows in place, preserving the original `archived_at` and refreshing
// `updated_at`. Nothing is ever purged.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::momentum::hot_cache::row_to_entry;
use crate::momentum::{RegimeEntry, ScanStats, WatchlistEntry};

pub struct Archive {
    conn: Mutex<Connection>,
}

impl Archive {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open archive {}", path.display()))?;
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
                archived_at    TEXT NOT NULL,
                updated_at     TEXT NOT NULL,
                UNIQUE (scan_date, symbol)
            );
            CREATE TABLE IF NOT EXISTS market_regime (
                scan_date      TEXT PRIMARY KEY,
                regime         TEXT NOT NULL,
                spy_change_pct REAL NOT NULL,
                qqq_change_pct REAL NOT NULL,
                market_score   REAL NOT NULL,
                archived_at    TEXT NOT NULL,
                updated_at     TEXT NOT NULL
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
                scan_duration_seconds REAL NOT NULL,
                archived_at           TEXT NOT NULL,
                updated_at            TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_hist_date ON daily_movers (scan_date);
            CREATE INDEX IF NOT EXISTS idx_hist_symbol ON daily_movers (symbol);
            CREATE INDEX IF NOT EXISTS idx_hist_symbol_date ON daily_movers (symbol, scan_date);
            CREATE INDEX IF NOT EXISTS idx_hist_direction_rank ON daily_movers (direction, rank);
            COMMIT;",
        )
        .context("failed to initialise archive schema")?;

        debug!(path = %path.display(), "archive opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert one scan's rows. `INSERT OR REPLACE` on the unique key; the
    /// original `archived_at` is carried forward so re-archiving a date only
    /// moves `updated_at`.
    pub fn upsert_day(
        &self,
        movers: &[WatchlistEntry],
        regime: Option<&RegimeEntry>,
        stats: Option<&ScanStats>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now_key = now.to_rfc3339();

        for m in movers {
            tx.execute(
                "INSERT OR REPLACE INTO daily_movers
                 (scan_date, symbol, direction, rank, open, high, low, close,
                  volume, change_pct, indicators, momentum_score, archived_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                         COALESCE((SELECT archived_at FROM daily_movers
                                   WHERE scan_date = ?1 AND symbol = ?2), ?13),
                         ?13)",
                params![
                    m.scan_date.to_string(),
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
                    now_key,
                ],
            )?;
        }

        if let Some(r) = regime {
            tx.execute(
                "INSERT OR REPLACE INTO market_regime
                 (scan_date, regime, spy_change_pct, qqq_change_pct, market_score,
                  archived_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5,
                         COALESCE((SELECT archived_at FROM market_regime
                                   WHERE scan_date = ?1), ?6),
                         ?6)",
                params![
                    r.scan_date.to_string(),
                    r.regime.as_str(),
                    r.spy_change_pct,
                    r.qqq_change_pct,
                    r.market_score,
                    now_key,
                ],
            )?;
        }

        if let Some(s) = stats {
            tx.execute(
                "INSERT OR REPLACE INTO scan_stats
                 (scan_date, total_scanned, high_volume_count, gainers_count,
                  losers_count, avg_change_pct, max_gain_pct, max_loss_pct,
                  fetch_errors, scan_duration_seconds, archived_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                         COALESCE((SELECT archived_at FROM scan_stats
                                   WHERE scan_date = ?1), ?11),
                         ?11)",
                params![
                    s.scan_date.to_string(),
                    s.total_scanned,
                    s.high_volume_count,
                    s.gainers_count,
                    s.losers_count,
                    s.avg_change_pct,
                    s.max_gain_pct,
                    s.max_loss_pct,
                    s.fetch_errors,
                    s.scan_duration_seconds,
                    now_key,
                ],
            )?;
        }

        tx.commit()?;
        info!(rows = movers.len(), "archive upserted");
        Ok(())
    }

    /// Row count for one scan date.
    pub fn count_for_date(&self, scan_date: NaiveDate) -> Result<u32> {
        let conn = self.conn.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM daily_movers WHERE scan_date = ?1",
            params![scan_date.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// All archived movers for one scan date, ranked.
    pub fn movers_for_date(&self, scan_date: NaiveDate) -> Result<Vec<WatchlistEntry>> {
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

    /// Archive timestamps for one `(scan_date, symbol)` row.
    pub fn row_timestamps(
        &self,
        scan_date: NaiveDate,
        symbol: &str,
    ) -> Result<Option<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT archived_at, updated_at FROM daily_movers
             WHERE scan_date = ?1 AND symbol = ?2",
        )?;
        let mut rows = stmt.query_map(params![scan_date.to_string(), symbol], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.next().transpose()?)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::momentum::testkit::*;
    use chrono::TimeZone;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 10, h, 0, 0).unwrap()
    }

    fn open_archive(dir: &tempfile::TempDir) -> Archive {
        Archive::open(&dir.path().join("momentum_history.db")).unwrap()
    }

    #[test]
    fn rearchiving_a_date_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(&dir);
        let d = date("2025-11-10");
        let movers = sample_movers(d, 50, 50);

        archive.upsert_day(&movers, Some(&sample_regime(d)), Some(&sample_stats(d, &movers)), at(9)).unwrap();
        assert_eq!(archive.count_for_date(d).unwrap(), 100);

        // Day two re-runs the day-one scan: same row count, no duplicates.
        archive.upsert_day(&movers, Some(&sample_regime(d)), Some(&sample_stats(d, &movers)), at(10)).unwrap();
        assert_eq!(archive.count_for_date(d).unwrap(), 100);

        let rows = archive.movers_for_date(d).unwrap();
        assert_eq!(rows.len(), 100);
    }

    #[test]
    fn rearchiving_updates_fields_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(&dir);
        let d = date("2025-11-10");
        let mut movers = sample_movers(d, 1, 0);

        archive.upsert_day(&movers, None, None, at(9)).unwrap();

        movers[0].change_pct = 7.77;
        movers[0].close = 107.77;
        archive.upsert_day(&movers, None, None, at(10)).unwrap();

        let rows = archive.movers_for_date(d).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].change_pct, 7.77);
        assert_eq!(rows[0].close, 107.77);
    }

    #[test]
    fn archived_at_is_preserved_across_updates() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(&dir);
        let d = date("2025-11-10");
        let movers = sample_movers(d, 1, 0);

        archive.upsert_day(&movers, None, None, at(9)).unwrap();
        let (first_archived, first_updated) =
            archive.row_timestamps(d, "GAIN1").unwrap().unwrap();
        assert_eq!(first_archived, first_updated);

        archive.upsert_day(&movers, None, None, at(11)).unwrap();
        let (archived, updated) = archive.row_timestamps(d, "GAIN1").unwrap().unwrap();
        assert_eq!(archived, first_archived);
        assert!(updated > first_updated);
    }

    #[test]
    fn multiple_dates_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let archive = open_archive(&dir);
        for d in ["2025-11-06", "2025-11-07", "2025-11-10"] {
            let d = date(d);
            let movers = sample_movers(d, 2, 2);
            archive.upsert_day(&movers, Some(&sample_regime(d)), Some(&sample_stats(d, &movers)), at(9)).unwrap();
        }
        assert_eq!(archive.count_for_date(date("2025-11-06")).unwrap(), 4);
        assert_eq!(archive.count_for_date(date("2025-11-07")).unwrap(), 4);
        assert_eq!(archive.count_for_date(date("2025-11-10")).unwrap(), 4);
    }
}
