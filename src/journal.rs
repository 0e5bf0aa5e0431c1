// =============================================================================
// Journal — date-partitioned JSONL sink
// =============================================================================
//
// Cycle records and operational events land in
// `{root}/{signature}/log/{YYYY-MM-DD}/log.jsonl`; trade records in a
// parallel `trades/` tree. One JSON object per line, append-only, partition
// chosen by the record's exchange-local date. Directories are created
// lazily; the open file is fsynced when its day closes and on shutdown.
// Rotation is the operator's job.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing::debug;

/// One date-partitioned tree of JSONL files.
struct Tree {
    root: PathBuf,
    file_name: &'static str,
    open: Option<(NaiveDate, File)>,
}

impl Tree {
    fn new(root: PathBuf, file_name: &'static str) -> Self {
        Self {
            root,
            file_name,
            open: None,
        }
    }

    fn append(&mut self, date: NaiveDate, record: &serde_json::Value) -> Result<()> {
        let rollover = match &self.open {
            Some((open_date, _)) => *open_date != date,
            None => true,
        };

        if rollover {
            self.close()?;
            let dir = self.root.join(date.to_string());
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            let path = dir.join(self.file_name);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            debug!(path = %path.display(), "journal file opened");
            self.open = Some((date, file));
        }

        let (_, file) = self
            .open
            .as_mut()
            .expect("journal file is open after rollover");
        let line = serde_json::to_string(record).context("failed to serialise record")?;
        writeln!(file, "{line}").context("failed to append record")?;
        file.flush().context("failed to flush journal")?;
        Ok(())
    }

    /// Fsync and drop the open file, if any.
    fn close(&mut self) -> Result<()> {
        if let Some((date, file)) = self.open.take() {
            file.sync_all()
                .with_context(|| format!("failed to fsync journal for {date}"))?;
        }
        Ok(())
    }
}

/// The persistent log sink: one tree for events, one for trades.
pub struct Journal {
    log: Mutex<Tree>,
    trades: Mutex<Tree>,
}

impl Journal {
    /// `base` is `{root}/{signature}`, fixed for the process lifetime.
    pub fn new(base: PathBuf) -> Self {
        Self {
            log: Mutex::new(Tree::new(base.join("log"), "log.jsonl")),
            trades: Mutex::new(Tree::new(base.join("trades"), "trades.jsonl")),
        }
    }

    /// Append one record to the log tree under the given exchange-local date.
    pub fn append_log(&self, date: NaiveDate, record: &serde_json::Value) -> Result<()> {
        self.log.lock().append(date, record)
    }

    /// Append one record to the trades tree.
    pub fn append_trade(&self, date: NaiveDate, record: &serde_json::Value) -> Result<()> {
        self.trades.lock().append(date, record)
    }

    /// Fsync and close both trees. Called at shutdown.
    pub fn close(&self) -> Result<()> {
        self.log.lock().close()?;
        self.trades.lock().close()?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn appends_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().to_path_buf());
        let d = date("2025-11-10");

        journal.append_log(d, &json!({ "event": "cycle", "cycle_id": 1 })).unwrap();
        journal.append_log(d, &json!({ "event": "cycle", "cycle_id": 2 })).unwrap();

        let lines = read_lines(&dir.path().join("log/2025-11-10/log.jsonl"));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["cycle_id"], 1);
        assert_eq!(lines[1]["cycle_id"], 2);
    }

    #[test]
    fn trades_go_to_their_own_tree() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().to_path_buf());
        let d = date("2025-11-10");

        journal.append_log(d, &json!({ "event": "cycle" })).unwrap();
        journal.append_trade(d, &json!({ "symbol": "AAPL", "side": "buy" })).unwrap();

        assert!(dir.path().join("log/2025-11-10/log.jsonl").exists());
        let trades = read_lines(&dir.path().join("trades/2025-11-10/trades.jsonl"));
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0]["symbol"], "AAPL");
    }

    #[test]
    fn date_rollover_partitions_files() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().to_path_buf());

        journal.append_log(date("2025-11-10"), &json!({ "n": 1 })).unwrap();
        journal.append_log(date("2025-11-11"), &json!({ "n": 2 })).unwrap();
        journal.append_log(date("2025-11-11"), &json!({ "n": 3 })).unwrap();

        assert_eq!(read_lines(&dir.path().join("log/2025-11-10/log.jsonl")).len(), 1);
        assert_eq!(read_lines(&dir.path().join("log/2025-11-11/log.jsonl")).len(), 2);
    }

    #[test]
    fn reopening_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let d = date("2025-11-10");
        {
            let journal = Journal::new(dir.path().to_path_buf());
            journal.append_log(d, &json!({ "n": 1 })).unwrap();
            journal.close().unwrap();
        }
        {
            let journal = Journal::new(dir.path().to_path_buf());
            journal.append_log(d, &json!({ "n": 2 })).unwrap();
            journal.close().unwrap();
        }
        assert_eq!(read_lines(&dir.path().join("log/2025-11-10/log.jsonl")).len(), 2);
    }
}
