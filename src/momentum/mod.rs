// =============================================================================
// Momentum store — two-tier SQLite cache of pre-market scans
// =============================================================================
//
// Two databases with distinct purposes:
//
//   * hot cache (`momentum_cache.db`) — today's working set. Each scan
//     destructively replaces its date; rows older than the retention window
//     are purged after every write.
//   * historical archive (`momentum_history.db`) — append-only superset of
//     every scan ever cached. Upserts are keyed on `(scan_date, symbol)`, so
//     re-archiving a date updates in place and never duplicates.
//
// A failed archive never rolls back the hot write; it is logged as
// ARCHIVE_FAILED and retried on the next scan.
// =============================================================================

pub mod archive;
pub mod hot_cache;

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Direction, MarketRegime};

pub use archive::Archive;
pub use hot_cache::HotCache;

// ---------------------------------------------------------------------------
// Row types shared by both tiers
// ---------------------------------------------------------------------------

/// One ranked mover from a scan: the unit the agent trades from.
/// Unique per `(scan_date, symbol)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub scan_date: NaiveDate,
    pub symbol: String,
    pub direction: Direction,
    pub rank: u32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub change_pct: f64,
    /// Opaque technical-indicator blob from the indicators capability.
    pub indicators: serde_json::Value,
    /// Absolute change percentage.
    pub momentum_score: f64,
}

/// Daily market regime derived from the index movers. One per scan date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeEntry {
    pub scan_date: NaiveDate,
    pub regime: MarketRegime,
    pub spy_change_pct: f64,
    pub qqq_change_pct: f64,
    pub market_score: f64,
}

/// Aggregate statistics for one scan. One per scan date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStats {
    pub scan_date: NaiveDate,
    pub total_scanned: u32,
    pub high_volume_count: u32,
    pub gainers_count: u32,
    pub losers_count: u32,
    pub avg_change_pct: f64,
    pub max_gain_pct: f64,
    pub max_loss_pct: f64,
    pub fetch_errors: u32,
    pub scan_duration_seconds: f64,
}

// ---------------------------------------------------------------------------
// Combined store
// ---------------------------------------------------------------------------

/// Owns both tiers and the archive-after-write procedure.
pub struct MomentumStore {
    pub hot: HotCache,
    pub archive: Archive,
}

impl MomentumStore {
    /// Open (creating if necessary) both databases under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            hot: HotCache::open(&dir.join("momentum_cache.db"))?,
            archive: Archive::open(&dir.join("momentum_history.db"))?,
        })
    }

    /// Persist one completed scan: destructively replace the hot cache for
    /// the date, then copy the rows into the archive under upsert semantics.
    ///
    /// The hot write is transactional and its failure is the caller's
    /// problem; an archive failure is logged and swallowed so the scan still
    /// counts (the next scan re-archives).
    pub fn write_scan(
        &self,
        movers: &[WatchlistEntry],
        regime: &RegimeEntry,
        stats: &ScanStats,
        retention_days: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let scan_date = stats.scan_date;
        self.hot
            .replace_day(scan_date, movers, regime, stats, retention_days)?;

        if let Err(e) = self.archive.upsert_day(movers, Some(regime), Some(stats), now) {
            warn!(
                scan_date = %scan_date,
                error = %e,
                "ARCHIVE_FAILED: hot cache written but archive update failed"
            );
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;
    use chrono::TimeZone;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 10, 9, 0, 0).unwrap()
    }

    #[test]
    fn write_scan_populates_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = MomentumStore::open(dir.path()).unwrap();
        let d = date("2025-11-10");
        let movers = sample_movers(d, 3, 2);
        let regime = sample_regime(d);
        let stats = sample_stats(d, &movers);

        store.write_scan(&movers, &regime, &stats, 30, now()).unwrap();

        assert_eq!(store.hot.watchlist(d).unwrap().len(), 5);
        assert_eq!(store.archive.count_for_date(d).unwrap(), 5);
    }

    #[test]
    fn hot_rows_equal_archive_rows_for_the_date() {
        let dir = tempfile::tempdir().unwrap();
        let store = MomentumStore::open(dir.path()).unwrap();
        let d = date("2025-11-10");
        let movers = sample_movers(d, 2, 2);
        let regime = sample_regime(d);
        let stats = sample_stats(d, &movers);
        store.write_scan(&movers, &regime, &stats, 30, now()).unwrap();

        let hot = store.hot.watchlist(d).unwrap();
        let archived = store.archive.movers_for_date(d).unwrap();
        assert_eq!(hot.len(), archived.len());
        for (h, a) in hot.iter().zip(archived.iter()) {
            assert_eq!(h.symbol, a.symbol);
            assert_eq!(h.rank, a.rank);
            assert_eq!(h.change_pct, a.change_pct);
            assert_eq!(h.indicators, a.indicators);
        }
    }
}
