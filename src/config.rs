// =============================================================================
// Policy Configuration — startup-loaded daemon settings
// =============================================================================
//
// Central policy hub for the Meridian daemon. Everything tunable lives here:
// session gating, scan and EOD-flat times, risk percentages, scanner filters,
// and agent/tool limits. The file is read once at startup; the daemon is
// restarted by the service manager to pick up changes.
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older policy file.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Session;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_signature() -> String {
    "meridian".to_string()
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_tools_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_reasoner_endpoint() -> String {
    "http://127.0.0.1:8090".to_string()
}

fn default_trade_sessions() -> Vec<Session> {
    vec![Session::Regular]
}

fn default_eod_flat_time() -> String {
    "15:45".to_string()
}

fn default_scan_time() -> String {
    "04:00".to_string()
}

fn default_interval_seconds() -> u64 {
    120
}

fn default_startup_wait_secs() -> u64 {
    60
}

fn default_monthly_limit_pct() -> f64 {
    6.0
}

fn default_per_trade_risk_pct() -> f64 {
    2.0
}

fn default_per_trade_value_cap_pct() -> f64 {
    25.0
}

fn default_trade_ring_capacity() -> usize {
    50
}

fn default_universe() -> Vec<String> {
    // Liquid large-cap defaults; operators replace this with their own list.
    [
        "AAPL", "MSFT", "NVDA", "AMZN", "GOOGL", "META", "TSLA", "AMD", "AVGO",
        "NFLX", "CRM", "ORCL", "INTC", "MU", "QCOM", "BA", "JPM", "BAC", "GS",
        "XOM", "CVX", "PFE", "MRK", "UNH", "COST", "WMT", "DIS", "NKE", "SBUX",
        "UBER",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_min_price() -> f64 {
    5.0
}

fn default_min_volume() -> f64 {
    1_000_000.0
}

fn default_min_market_cap() -> f64 {
    500_000_000.0
}

fn default_top_gainers() -> usize {
    50
}

fn default_top_losers() -> usize {
    50
}

fn default_hot_retention_days() -> i64 {
    30
}

fn default_high_volume_threshold() -> f64 {
    5_000_000.0
}

fn default_regime_threshold_pct() -> f64 {
    0.5
}

fn default_max_agent_steps() -> u32 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_data_timeout_secs() -> u64 {
    30
}

fn default_trade_timeout_secs() -> u64 {
    60
}

// =============================================================================
// RiskPolicy
// =============================================================================

/// Limits enforced by the risk governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPolicy {
    /// Monthly drawdown from the high-water mark that suspends trading,
    /// as a percentage (6.0 means 6 %).
    #[serde(default = "default_monthly_limit_pct")]
    pub monthly_limit_pct: f64,

    /// Capital risked per trade between entry and stop, as a percentage of
    /// equity.
    #[serde(default = "default_per_trade_risk_pct")]
    pub per_trade_risk_pct: f64,

    /// Cap on a single position's notional value as a percentage of equity.
    #[serde(default = "default_per_trade_value_cap_pct")]
    pub per_trade_value_cap_pct: f64,

    /// How many recent trade results the governor retains.
    #[serde(default = "default_trade_ring_capacity")]
    pub trade_ring_capacity: usize,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            monthly_limit_pct: default_monthly_limit_pct(),
            per_trade_risk_pct: default_per_trade_risk_pct(),
            per_trade_value_cap_pct: default_per_trade_value_cap_pct(),
            trade_ring_capacity: default_trade_ring_capacity(),
        }
    }
}

// =============================================================================
// ScannerPolicy
// =============================================================================

/// Universe and quality filters for the pre-market scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerPolicy {
    /// Candidate symbols swept each morning.
    #[serde(default = "default_universe")]
    pub universe: Vec<String>,

    /// Minimum prior-day close.
    #[serde(default = "default_min_price")]
    pub min_price: f64,

    /// Minimum prior-day share volume.
    #[serde(default = "default_min_volume")]
    pub min_volume: f64,

    /// Minimum market capitalization. Enforced when the indicators payload
    /// reports `market_cap`; the bar feed itself carries no capitalization.
    #[serde(default = "default_min_market_cap")]
    pub min_market_cap: f64,

    /// How many top gainers to keep.
    #[serde(default = "default_top_gainers")]
    pub top_gainers: usize,

    /// How many top losers to keep.
    #[serde(default = "default_top_losers")]
    pub top_losers: usize,

    /// Hot-cache retention window in days.
    #[serde(default = "default_hot_retention_days")]
    pub hot_retention_days: i64,

    /// Volume above which a mover counts toward `high_volume_count`.
    #[serde(default = "default_high_volume_threshold")]
    pub high_volume_threshold: f64,

    /// SPY/QQQ move (in percent) that tips the regime bullish or bearish.
    #[serde(default = "default_regime_threshold_pct")]
    pub regime_threshold_pct: f64,
}

impl Default for ScannerPolicy {
    fn default() -> Self {
        Self {
            universe: default_universe(),
            min_price: default_min_price(),
            min_volume: default_min_volume(),
            min_market_cap: default_min_market_cap(),
            top_gainers: default_top_gainers(),
            top_losers: default_top_losers(),
            hot_retention_days: default_hot_retention_days(),
            high_volume_threshold: default_high_volume_threshold(),
            regime_threshold_pct: default_regime_threshold_pct(),
        }
    }
}

// =============================================================================
// AgentPolicy
// =============================================================================

/// Bounds on the per-cycle reasoning run and its tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPolicy {
    /// Maximum reasoning iterations per cycle.
    #[serde(default = "default_max_agent_steps")]
    pub max_steps: u32,

    /// Retries per tool call inside the adapters.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Per-call timeout for market-data capabilities.
    #[serde(default = "default_data_timeout_secs")]
    pub data_timeout_secs: u64,

    /// Per-call timeout for order capabilities.
    #[serde(default = "default_trade_timeout_secs")]
    pub trade_timeout_secs: u64,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            max_steps: default_max_agent_steps(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            data_timeout_secs: default_data_timeout_secs(),
            trade_timeout_secs: default_trade_timeout_secs(),
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level policy for the Meridian daemon.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // --- Identity & paths ----------------------------------------------------

    /// Account signature: the directory under `data_root` that owns all
    /// persisted state for this deployment. Chosen once, immutable for the
    /// process lifetime.
    #[serde(default = "default_signature")]
    pub signature: String,

    /// Root directory for all persisted state.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Path to the strategy prompt handed verbatim to the agent. The daemon
    /// never inspects its contents.
    #[serde(default)]
    pub strategy_prompt_path: Option<PathBuf>,

    // --- Tool endpoints ------------------------------------------------------

    /// Base URL of the capability RPC server (market data, orders,
    /// indicators, broker clock).
    #[serde(default = "default_tools_endpoint")]
    pub tools_endpoint: String,

    /// Base URL of the external reasoning loop.
    #[serde(default = "default_reasoner_endpoint")]
    pub reasoner_endpoint: String,

    // --- Session policy ------------------------------------------------------

    /// Sessions in which cycles may trade. Anything else is degraded to
    /// closed. Default: regular hours only.
    #[serde(default = "default_trade_sessions")]
    pub trade_sessions: Vec<Session>,

    /// Exchange-local time at which the EOD flat fires (HH:MM).
    #[serde(default = "default_eod_flat_time")]
    pub eod_flat_time: String,

    /// Exchange-local time at or after which the daily scan may run (HH:MM).
    #[serde(default = "default_scan_time")]
    pub scan_time: String,

    /// Orchestrator tick cadence in seconds.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// How long to wait for tool endpoints to come up at startup before
    /// giving up with exit code 1.
    #[serde(default = "default_startup_wait_secs")]
    pub startup_wait_secs: u64,

    // --- Component policies --------------------------------------------------

    #[serde(default)]
    pub risk: RiskPolicy,

    #[serde(default)]
    pub scanner: ScannerPolicy,

    #[serde(default)]
    pub agent: AgentPolicy,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            signature: default_signature(),
            data_root: default_data_root(),
            strategy_prompt_path: None,
            tools_endpoint: default_tools_endpoint(),
            reasoner_endpoint: default_reasoner_endpoint(),
            trade_sessions: default_trade_sessions(),
            eod_flat_time: default_eod_flat_time(),
            scan_time: default_scan_time(),
            interval_seconds: default_interval_seconds(),
            startup_wait_secs: default_startup_wait_secs(),
            risk: RiskPolicy::default(),
            scanner: ScannerPolicy::default(),
            agent: AgentPolicy::default(),
        }
    }
}

impl BotConfig {
    /// Load policy from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy file {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse policy file {}", path.display()))?;

        info!(
            path = %path.display(),
            signature = %config.signature,
            universe = config.scanner.universe.len(),
            "policy loaded"
        );

        Ok(config)
    }

    /// Apply environment overrides. `MERIDIAN_SYMBOLS` replaces the scan
    /// universe; endpoint and path variables override their policy values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                info!(count = parsed.len(), "scan universe overridden from env");
                self.scanner.universe = parsed;
            }
        }
        if let Ok(url) = std::env::var("MERIDIAN_TOOLS_URL") {
            self.tools_endpoint = url;
        }
        if let Ok(url) = std::env::var("MERIDIAN_REASONER_URL") {
            self.reasoner_endpoint = url;
        }
        if let Ok(root) = std::env::var("MERIDIAN_DATA_ROOT") {
            self.data_root = PathBuf::from(root);
        }
        if let Ok(sig) = std::env::var("MERIDIAN_SIGNATURE") {
            self.signature = sig;
        }
    }

    /// Validate the policy. Called once at startup; a failure here is a
    /// configuration error and the process exits with code 1.
    pub fn validate(&self) -> Result<()> {
        if self.signature.is_empty() || self.signature.contains(std::path::MAIN_SEPARATOR) {
            anyhow::bail!("signature must be a non-empty path segment");
        }
        if self.interval_seconds == 0 {
            anyhow::bail!("interval_seconds must be positive");
        }
        parse_hhmm(&self.eod_flat_time)
            .with_context(|| format!("invalid eod_flat_time '{}'", self.eod_flat_time))?;
        parse_hhmm(&self.scan_time)
            .with_context(|| format!("invalid scan_time '{}'", self.scan_time))?;
        if self.risk.monthly_limit_pct <= 0.0 {
            anyhow::bail!("monthly_limit_pct must be positive");
        }
        if self.risk.per_trade_risk_pct <= 0.0 || self.risk.per_trade_value_cap_pct <= 0.0 {
            anyhow::bail!("per-trade risk percentages must be positive");
        }
        if self.scanner.universe.is_empty() {
            warn!("scan universe is empty; scans will always fall back");
        }
        if self.agent.max_steps == 0 {
            anyhow::bail!("agent max_steps must be positive");
        }
        Ok(())
    }

    /// Directory owning all persisted state: `{data_root}/{signature}`.
    pub fn state_dir(&self) -> PathBuf {
        self.data_root.join(&self.signature)
    }

    /// Parsed EOD-flat trigger time. Falls back to the default on a value
    /// that somehow bypassed `validate`.
    pub fn eod_flat_at(&self) -> NaiveTime {
        parse_hhmm(&self.eod_flat_time).unwrap_or_else(|_| {
            NaiveTime::from_hms_opt(15, 45, 0).expect("static time is valid")
        })
    }

    /// Parsed earliest scan time.
    pub fn scan_at(&self) -> NaiveTime {
        parse_hhmm(&self.scan_time).unwrap_or_else(|_| {
            NaiveTime::from_hms_opt(4, 0, 0).expect("static time is valid")
        })
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| anyhow::anyhow!("{e}"))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.signature, "meridian");
        assert_eq!(cfg.trade_sessions, vec![Session::Regular]);
        assert_eq!(cfg.eod_flat_time, "15:45");
        assert_eq!(cfg.scan_time, "04:00");
        assert_eq!(cfg.interval_seconds, 120);
        assert!((cfg.risk.monthly_limit_pct - 6.0).abs() < f64::EPSILON);
        assert_eq!(cfg.scanner.top_gainers, 50);
        assert_eq!(cfg.scanner.top_losers, 50);
        assert_eq!(cfg.agent.max_steps, 30);
        assert_eq!(cfg.agent.max_retries, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: BotConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.signature, "meridian");
        assert_eq!(cfg.scanner.hot_retention_days, 30);
        assert_eq!(cfg.agent.retry_base_delay_ms, 1_000);
        assert!(!cfg.scanner.universe.is_empty());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "signature": "paper-01",
            "trade_sessions": ["regular", "pre_market"],
            "scanner": { "universe": ["SPY"] }
        }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.signature, "paper-01");
        assert_eq!(
            cfg.trade_sessions,
            vec![Session::Regular, Session::PreMarket]
        );
        assert_eq!(cfg.scanner.universe, vec!["SPY"]);
        assert_eq!(cfg.scanner.top_gainers, 50);
        assert_eq!(cfg.interval_seconds, 120);
    }

    #[test]
    fn invalid_times_fail_validation() {
        let mut cfg = BotConfig::default();
        cfg.eod_flat_time = "25:99".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = BotConfig::default();
        cfg.scan_time = "four am".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_interval_fails_validation() {
        let mut cfg = BotConfig::default();
        cfg.interval_seconds = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn state_dir_joins_signature() {
        let mut cfg = BotConfig::default();
        cfg.data_root = PathBuf::from("/var/lib/meridian");
        cfg.signature = "paper-01".to_string();
        assert_eq!(
            cfg.state_dir(),
            PathBuf::from("/var/lib/meridian/paper-01")
        );
    }

    #[test]
    fn parsed_times_match_policy() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.eod_flat_at(), NaiveTime::from_hms_opt(15, 45, 0).unwrap());
        assert_eq!(cfg.scan_at(), NaiveTime::from_hms_opt(4, 0, 0).unwrap());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = BotConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: BotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.signature, cfg2.signature);
        assert_eq!(cfg.trade_sessions, cfg2.trade_sessions);
        assert_eq!(cfg.scanner.universe, cfg2.scanner.universe);
    }
}
