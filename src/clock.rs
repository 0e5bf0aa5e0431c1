// =============================================================================
// Exchange Clock — session classification and sleep planning
// =============================================================================
//
// All session decisions are made in America/New_York, the authority for DST
// transitions. The classifier is a pure function of the instant it is given:
// same instant, same answer. Holiday awareness comes from the broker clock,
// which the orchestrator feeds in via `apply_broker_override`; the table
// itself knows only weekdays and the session boundary times.
//
// Boundary table (exchange-local):
//   PRE_MARKET   04:00–09:30
//   REGULAR      09:30–16:00
//   POST_MARKET  16:00–20:00
//   CLOSED       otherwise, and all weekend
// =============================================================================

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

use crate::types::{BrokerClock, Session};

/// Minutes since exchange-local midnight for each session boundary.
const PRE_OPEN_MIN: u32 = 4 * 60;
const REGULAR_OPEN_MIN: u32 = 9 * 60 + 30;
const REGULAR_CLOSE_MIN: u32 = 16 * 60;
const POST_CLOSE_MIN: u32 = 20 * 60;

/// How far ahead of the next open a closed-market sleep wakes up.
const WAKE_LEAD_MINUTES: i64 = 5;

// ---------------------------------------------------------------------------
// Clock capability
// ---------------------------------------------------------------------------

/// Source of "now", injected so tests can drive the orchestrator with a
/// deterministic clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The production clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Classification results
// ---------------------------------------------------------------------------

/// Output of one classification: the session at the instant, plus the next
/// regular open and close after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub session: Session,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

/// A planned sleep: when to wake and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SleepPlan {
    pub wake_at: DateTime<Utc>,
    pub reason: &'static str,
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// The session boundary table plus policy times that depend on it.
#[derive(Debug, Clone)]
pub struct SessionSchedule {
    eod_flat_at: NaiveTime,
}

impl SessionSchedule {
    pub fn new(eod_flat_at: NaiveTime) -> Self {
        Self { eod_flat_at }
    }

    /// Render an instant in exchange-local time.
    pub fn exchange_time(&self, instant: DateTime<Utc>) -> DateTime<Tz> {
        instant.with_timezone(&New_York)
    }

    /// The exchange-local calendar date of an instant. This is the scan date
    /// and the journal partition key.
    pub fn exchange_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        self.exchange_time(instant).date_naive()
    }

    /// Classify an instant into a session and compute the next regular open
    /// and close. Pure: identical inputs yield identical outputs.
    pub fn classify(&self, instant: DateTime<Utc>) -> SessionInfo {
        let local = self.exchange_time(instant);
        let minute = local.hour() * 60 + local.minute();

        let session = if !is_weekday(local.date_naive()) {
            Session::Closed
        } else if (PRE_OPEN_MIN..REGULAR_OPEN_MIN).contains(&minute) {
            Session::PreMarket
        } else if (REGULAR_OPEN_MIN..REGULAR_CLOSE_MIN).contains(&minute) {
            Session::Regular
        } else if (REGULAR_CLOSE_MIN..POST_CLOSE_MIN).contains(&minute) {
            Session::PostMarket
        } else {
            Session::Closed
        };

        SessionInfo {
            session,
            next_open: self.next_open_after(local),
            next_close: self.next_close_after(local),
        }
    }

    /// Whether the EOD flat should fire: regular session, at or past the
    /// policy flat time (default 15:45).
    pub fn is_eod_flat_trigger(&self, instant: DateTime<Utc>) -> bool {
        let local = self.exchange_time(instant);
        let info = self.classify(instant);
        info.session == Session::Regular && local.time() >= self.eod_flat_at
    }

    /// Plan the closed-market sleep: wake five minutes before the next open.
    /// If that wake point is already behind `instant` (the wake race), wake
    /// exactly at the open instead — never plan a wake in the past.
    pub fn sleep_plan(&self, instant: DateTime<Utc>) -> SleepPlan {
        let next_open = self.classify(instant).next_open;
        let wake_at = next_open - Duration::minutes(WAKE_LEAD_MINUTES);
        if wake_at <= instant {
            SleepPlan {
                wake_at: next_open,
                reason: "pre_open_final_approach",
            }
        } else {
            SleepPlan {
                wake_at,
                reason: "market_closed",
            }
        }
    }

    /// The wake failsafe: true when a weekday instant sits inside the regular
    /// window, in which case any cached CLOSED classification must be
    /// discarded and the session treated as REGULAR.
    pub fn regular_window_failsafe(&self, instant: DateTime<Utc>) -> bool {
        let local = self.exchange_time(instant);
        let minute = local.hour() * 60 + local.minute();
        is_weekday(local.date_naive()) && (REGULAR_OPEN_MIN..REGULAR_CLOSE_MIN).contains(&minute)
    }

    /// Fold a fresh broker clock into a table classification. The broker owns
    /// the `is_open` bit (holidays, early closes): a broker-closed report
    /// degrades any in-hours session to CLOSED. The broker never upgrades a
    /// table-closed instant.
    pub fn apply_broker_override(&self, info: SessionInfo, broker: &BrokerClock) -> SessionInfo {
        if !broker.is_open && info.session != Session::Closed {
            SessionInfo {
                session: Session::Closed,
                next_open: broker.next_open,
                next_close: broker.next_close,
            }
        } else {
            info
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Next regular open strictly after `local`. DST-safe: the candidate date
    /// advances by calendar days and the 09:30 wall time is re-rendered in the
    /// zone, never derived by adding 24-hour spans.
    fn next_open_after(&self, local: DateTime<Tz>) -> DateTime<Utc> {
        let minute = local.hour() * 60 + local.minute();
        let mut date = local.date_naive();
        if !is_weekday(date) || minute >= REGULAR_OPEN_MIN {
            date = next_weekday(date);
        }
        at_exchange_time(date, REGULAR_OPEN_MIN)
    }

    /// Next regular close strictly after `local`.
    fn next_close_after(&self, local: DateTime<Tz>) -> DateTime<Utc> {
        let minute = local.hour() * 60 + local.minute();
        let mut date = local.date_naive();
        if !is_weekday(date) || minute >= REGULAR_CLOSE_MIN {
            date = next_weekday(date);
        }
        at_exchange_time(date, REGULAR_CLOSE_MIN)
    }
}

// ---------------------------------------------------------------------------
// Calendar helpers
// ---------------------------------------------------------------------------

/// Monday through Friday.
pub fn is_weekday(date: NaiveDate) -> bool {
    date.weekday().number_from_monday() <= 5
}

/// The next weekday strictly after `date`.
pub fn next_weekday(date: NaiveDate) -> NaiveDate {
    let mut d = date + Duration::days(1);
    while !is_weekday(d) {
        d += Duration::days(1);
    }
    d
}

/// The last weekday strictly before `date`. Used by the scanner to pick the
/// prior completed trading day.
pub fn prev_weekday(date: NaiveDate) -> NaiveDate {
    let mut d = date - Duration::days(1);
    while !is_weekday(d) {
        d -= Duration::days(1);
    }
    d
}

/// Render an exchange-local wall time on `date` as a UTC instant. 09:30 and
/// 16:00 never fall inside a DST gap in New York (transitions happen at
/// 02:00), so `earliest()` is only a formality.
fn at_exchange_time(date: NaiveDate, minutes: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_num_seconds_from_midnight_opt(minutes * 60, 0)
        .expect("boundary minutes are in range");
    New_York
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .expect("exchange boundary times are never skipped by DST")
        .with_timezone(&Utc)
}
