// =============================================================================
// Shared types used across the Meridian trading daemon
// =============================================================================
//
// Everything that crosses a component boundary is a typed record. Tool
// adapters translate the opaque JSON they receive on the wire into these
// structs at the edge; nothing downstream touches serde_json::Value except
// the deliberately opaque indicators blob.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Exchange sessions
// ---------------------------------------------------------------------------

/// The four exchange sessions, determined in America/New_York local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Session {
    PreMarket,
    Regular,
    PostMarket,
    Closed,
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreMarket => write!(f, "pre_market"),
            Self::Regular => write!(f, "regular"),
            Self::PostMarket => write!(f, "post_market"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scan domain
// ---------------------------------------------------------------------------

/// Which side of the movers ranking a symbol came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Gainer,
    Loser,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gainer => "gainer",
            Self::Loser => "loser",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gainer" => Some(Self::Gainer),
            "loser" => Some(Self::Loser),
            _ => None,
        }
    }
}

/// Coarse daily market label derived from the index movers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRegime {
    Bullish,
    Bearish,
    Neutral,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bullish" => Some(Self::Bullish),
            "bearish" => Some(Self::Bearish),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tool-boundary records (capability response contracts)
// ---------------------------------------------------------------------------

/// Account snapshot from the `get_account` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: f64,
    #[serde(default)]
    pub cash: f64,
    #[serde(default)]
    pub buying_power: f64,
    #[serde(default)]
    pub pattern_day_trader: bool,
    #[serde(default)]
    pub trading_blocked: bool,
}

/// One open position from the `get_positions` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub qty: f64,
    pub avg_entry_price: f64,
    #[serde(default)]
    pub unrealized_pl: f64,
    #[serde(default)]
    pub unrealized_plpc: f64,
}

/// Latest NBBO quote for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub ts: DateTime<Utc>,
}

/// One daily OHLCV bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DailyBar {
    pub ts: DateTime<Utc>,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Request payload for the `place_order` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: f64,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub extended_hours: bool,
}

/// Receipt from the `place_order` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub status: String,
}

impl OrderReceipt {
    /// Whether the broker reported the order as fully filled.
    pub fn is_filled(&self) -> bool {
        self.status.eq_ignore_ascii_case("filled")
    }
}

/// An order as observed going out through the order capability: the request
/// essentials plus the broker's receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedOrder {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub order_id: String,
    pub status: String,
}

impl SubmittedOrder {
    pub fn from_receipt(req: &OrderRequest, receipt: &OrderReceipt) -> Self {
        Self {
            symbol: req.symbol.clone(),
            side: req.side,
            qty: req.qty,
            order_id: receipt.order_id.clone(),
            status: receipt.status.clone(),
        }
    }

    pub fn is_filled(&self) -> bool {
        self.status.eq_ignore_ascii_case("filled")
    }
}

/// Per-symbol result from the `close_all_positions` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseResult {
    pub symbol: String,
    pub result: String,
}

/// Broker market clock from the `market_clock` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerClock {
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Governor and cycle records
// ---------------------------------------------------------------------------

/// A completed trade outcome fed to the risk governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub symbol: String,
    pub pnl: f64,
    pub closed_at: DateTime<Utc>,
}

/// One orchestrator cycle, as journaled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub session: Session,
    pub regime: Option<MarketRegime>,
    pub scan_date: Option<NaiveDate>,
    /// Set when the cycle was gated off instead of run (e.g. risk-suspended).
    #[serde(default)]
    pub skipped: Option<String>,
    #[serde(default)]
    pub agent_steps_used: u32,
    #[serde(default)]
    pub orders_submitted: Vec<SubmittedOrder>,
    #[serde(default)]
    pub orders_filled: Vec<SubmittedOrder>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub final_equity: f64,
    #[serde(default)]
    pub final_positions: Vec<PositionSnapshot>,
}
