//! Calendar-scoped spend accumulators.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Reset cadence of a budget window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// Resets at UTC midnight.
    Daily,
    /// Resets at the start of the ISO week (Monday, UTC).
    Weekly,
    /// Resets on the first of the month (UTC).
    Monthly,
    /// Never resets; accumulates for the life of the ledger.
    Unbounded,
}

/// Computes the next reset boundary for a period, strictly after `now`.
#[must_use]
pub fn next_boundary(period: BudgetPeriod, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let midnight = NaiveTime::MIN;
    let date = now.date_naive();

    let next = match period {
        BudgetPeriod::Daily => date.succ_opt()?.and_time(midnight),
        BudgetPeriod::Weekly => {
            let days_into_week = i64::from(date.weekday().num_days_from_monday());
            let week_start = date - ChronoDuration::days(days_into_week);
            (week_start + ChronoDuration::days(7)).and_time(midnight)
        }
        BudgetPeriod::Monthly => {
            let (year, month) = if date.month() == 12 {
                (date.year() + 1, 1)
            } else {
                (date.year(), date.month() + 1)
            };
            chrono::NaiveDate::from_ymd_opt(year, month, 1)?.and_time(midnight)
        }
        BudgetPeriod::Unbounded => return None,
    };

    Some(Utc.from_utc_datetime(&next))
}

/// One spend accumulator with an optional ceiling.
///
/// `spent` holds confirmed spend, `reserved` holds in-flight
/// reservations; both count against the ceiling. Confirmed spend is
/// never reduced except by a window rollover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetWindow {
    /// Reset cadence.
    pub period: BudgetPeriod,
    /// Ceiling in USD, if enforced.
    pub ceiling_usd: Option<f64>,
    /// Confirmed spend in USD.
    pub spent_usd: f64,
    /// Reserved (in-flight) spend in USD.
    pub reserved_usd: f64,
    /// Next reset boundary; `None` for unbounded windows.
    pub resets_at: Option<DateTime<Utc>>,
    /// Whether the warning event fired for this window instance.
    pub warned: bool,
    /// Whether the exhausted event fired for this window instance.
    pub exhausted: bool,
}

impl BudgetWindow {
    /// Opens a window at `now` with an optional ceiling.
    #[must_use]
    pub fn open(period: BudgetPeriod, ceiling_usd: Option<f64>, now: DateTime<Utc>) -> Self {
        Self {
            period,
            ceiling_usd,
            spent_usd: 0.0,
            reserved_usd: 0.0,
            resets_at: next_boundary(period, now),
            warned: false,
            exhausted: false,
        }
    }

    /// Total spend counted against the ceiling.
    #[must_use]
    pub fn committed_usd(&self) -> f64 {
        self.spent_usd + self.reserved_usd
    }

    /// Rolls the window over if `now` has crossed the boundary.
    /// Returns true if a rollover happened.
    pub fn roll_over_if_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.resets_at {
            Some(boundary) if now >= boundary => {
                self.spent_usd = 0.0;
                self.reserved_usd = 0.0;
                self.warned = false;
                self.exhausted = false;
                self.resets_at = next_boundary(self.period, now);
                true
            }
            _ => false,
        }
    }

    /// Returns true if `amount` fits under the ceiling.
    #[must_use]
    pub fn can_accept(&self, amount: f64) -> bool {
        match self.ceiling_usd {
            Some(ceiling) => self.committed_usd() + amount <= ceiling,
            None => true,
        }
    }

    /// Adds a reservation.
    pub fn reserve(&mut self, amount: f64) {
        self.reserved_usd += amount;
    }

    /// Converts a reservation into confirmed spend at the actual cost.
    pub fn confirm(&mut self, reserved: f64, actual: f64) {
        self.reserved_usd = (self.reserved_usd - reserved).max(0.0);
        self.spent_usd += actual;
    }

    /// Drops a reservation without spending.
    pub fn release(&mut self, reserved: f64) {
        self.reserved_usd = (self.reserved_usd - reserved).max(0.0);
    }

    /// Returns true if committed spend has crossed `threshold` (a
    /// fraction of the ceiling). No-op for windows without a ceiling.
    #[must_use]
    pub fn past_warning(&self, threshold: f64) -> bool {
        self.ceiling_usd
            .is_some_and(|ceiling| ceiling > 0.0 && self.committed_usd() / ceiling >= threshold)
    }
}
