//! Atomic reserve-then-confirm budget ledger.

use super::{BudgetPeriod, BudgetWindow};
use crate::errors::PipelineError;
use crate::events::{EventBus, PipelineEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configured ceilings, all optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    /// Maximum estimated cost of a single call.
    pub per_request_usd: Option<f64>,
    /// Lifetime ceiling per backend, keyed by backend name.
    pub per_backend_usd: HashMap<String, f64>,
    /// Daily ceiling (UTC calendar day).
    pub daily_usd: Option<f64>,
    /// Weekly ceiling (ISO week, UTC).
    pub weekly_usd: Option<f64>,
    /// Monthly ceiling (calendar month, UTC).
    pub monthly_usd: Option<f64>,
    /// Fraction of any ceiling at which a warning event fires.
    pub warning_threshold: f64,
}

impl BudgetLimits {
    /// Creates limits with no ceilings and an 80% warning threshold.
    #[must_use]
    pub fn new() -> Self {
        Self {
            warning_threshold: 0.8,
            ..Self::default()
        }
    }

    /// Sets the daily ceiling.
    #[must_use]
    pub fn with_daily(mut self, usd: f64) -> Self {
        self.daily_usd = Some(usd);
        self
    }

    /// Sets the weekly ceiling.
    #[must_use]
    pub fn with_weekly(mut self, usd: f64) -> Self {
        self.weekly_usd = Some(usd);
        self
    }

    /// Sets the monthly ceiling.
    #[must_use]
    pub fn with_monthly(mut self, usd: f64) -> Self {
        self.monthly_usd = Some(usd);
        self
    }

    /// Sets the single-request ceiling.
    #[must_use]
    pub fn with_per_request(mut self, usd: f64) -> Self {
        self.per_request_usd = Some(usd);
        self
    }

    /// Sets a backend's lifetime ceiling.
    #[must_use]
    pub fn with_backend_ceiling(mut self, backend: impl Into<String>, usd: f64) -> Self {
        self.per_backend_usd.insert(backend.into(), usd);
        self
    }

    /// Sets the warning threshold fraction.
    #[must_use]
    pub fn with_warning_threshold(mut self, fraction: f64) -> Self {
        self.warning_threshold = fraction.clamp(0.0, 1.0);
        self
    }
}

/// An approved reservation, to be confirmed or released exactly once.
#[derive(Debug)]
#[must_use = "a reservation must be confirmed or released"]
pub struct Reservation {
    backend: String,
    amount_usd: f64,
}

impl Reservation {
    /// Backend the reservation was taken for.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Reserved estimate in USD.
    pub fn amount_usd(&self) -> f64 {
        self.amount_usd
    }
}

struct LedgerState {
    daily: Option<BudgetWindow>,
    weekly: Option<BudgetWindow>,
    monthly: Option<BudgetWindow>,
    backends: HashMap<String, BudgetWindow>,
}

impl LedgerState {
    fn windows_mut(&mut self) -> impl Iterator<Item = (&'static str, &mut BudgetWindow)> {
        self.daily
            .iter_mut()
            .map(|w| ("daily", w))
            .chain(self.weekly.iter_mut().map(|w| ("weekly", w)))
            .chain(self.monthly.iter_mut().map(|w| ("monthly", w)))
    }
}

/// Gate-keeps spend across all configured scopes.
///
/// Every check-and-reserve happens under a single lock, so two
/// concurrent reservations can never jointly pass a check that together
/// would exceed a ceiling.
pub struct BudgetLedger {
    limits: BudgetLimits,
    state: Mutex<LedgerState>,
    events: Option<EventBus>,
}

impl BudgetLedger {
    /// Creates a ledger with windows opened at the current time.
    #[must_use]
    pub fn new(limits: BudgetLimits) -> Self {
        Self::opened_at(limits, Utc::now())
    }

    /// Creates a ledger with windows opened at `now`.
    #[must_use]
    pub fn opened_at(limits: BudgetLimits, now: DateTime<Utc>) -> Self {
        let state = LedgerState {
            daily: limits
                .daily_usd
                .map(|c| BudgetWindow::open(BudgetPeriod::Daily, Some(c), now)),
            weekly: limits
                .weekly_usd
                .map(|c| BudgetWindow::open(BudgetPeriod::Weekly, Some(c), now)),
            monthly: limits
                .monthly_usd
                .map(|c| BudgetWindow::open(BudgetPeriod::Monthly, Some(c), now)),
            backends: limits
                .per_backend_usd
                .iter()
                .map(|(name, ceiling)| {
                    (
                        name.clone(),
                        BudgetWindow::open(BudgetPeriod::Unbounded, Some(*ceiling), now),
                    )
                })
                .collect(),
        };

        Self {
            limits,
            state: Mutex::new(state),
            events: None,
        }
    }

    /// Attaches an event bus for warning/exhausted notifications.
    #[must_use]
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Checks whether `estimate` would be admitted right now, without
    /// reserving anything.
    #[must_use]
    pub fn can_afford(&self, backend: &str, estimate_usd: f64) -> bool {
        self.check_at(Utc::now(), backend, estimate_usd).is_ok()
    }

    /// Atomically checks every active scope and reserves `estimate`
    /// against all of them.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::BudgetExceeded`] naming the first scope
    /// whose ceiling would be breached. A denied request reserves
    /// nothing.
    pub fn try_reserve(
        &self,
        backend: &str,
        estimate_usd: f64,
    ) -> Result<Reservation, PipelineError> {
        self.try_reserve_at(Utc::now(), backend, estimate_usd)
    }

    /// [`Self::try_reserve`] with an explicit clock, for rollover tests.
    pub fn try_reserve_at(
        &self,
        now: DateTime<Utc>,
        backend: &str,
        estimate_usd: f64,
    ) -> Result<Reservation, PipelineError> {
        if let Some(denied) = self.denied_scope(now, backend, estimate_usd, true) {
            return Err(PipelineError::BudgetExceeded { scope: denied });
        }
        Ok(Reservation {
            backend: backend.to_string(),
            amount_usd: estimate_usd,
        })
    }

    fn check_at(&self, now: DateTime<Utc>, backend: &str, estimate_usd: f64) -> Result<(), String> {
        match self.denied_scope(now, backend, estimate_usd, false) {
            Some(scope) => Err(scope),
            None => Ok(()),
        }
    }

    /// Single critical section: rollover, check all scopes, then either
    /// reserve in all of them or none. Returns the denying scope name.
    fn denied_scope(
        &self,
        now: DateTime<Utc>,
        backend: &str,
        estimate_usd: f64,
        reserve: bool,
    ) -> Option<String> {
        if let Some(ceiling) = self.limits.per_request_usd {
            if estimate_usd > ceiling {
                if reserve {
                    self.emit_exhausted_once_unlocked("request");
                }
                return Some("request".to_string());
            }
        }

        let mut state = self.state.lock();

        for (_, window) in state.windows_mut() {
            window.roll_over_if_due(now);
        }

        let mut denied = state
            .windows_mut()
            .find(|(_, w)| !w.can_accept(estimate_usd))
            .map(|(name, _)| name.to_string());
        if denied.is_none() {
            denied = state
                .backends
                .get(backend)
                .filter(|w| !w.can_accept(estimate_usd))
                .map(|_| format!("backend:{backend}"));
        }

        if let Some(scope) = denied {
            // A read-only affordability check leaves the once-per-window
            // alert state untouched.
            if reserve {
                let already = self.mark_exhausted(&mut state, &scope);
                drop(state);
                if !already {
                    self.emit(PipelineEvent::BudgetExhausted {
                        scope: scope.clone(),
                    });
                }
            }
            return Some(scope);
        }

        if reserve {
            for (_, window) in state.windows_mut() {
                window.reserve(estimate_usd);
            }
            if let Some(window) = state.backends.get_mut(backend) {
                window.reserve(estimate_usd);
            }
            let warnings = self.collect_warnings(&mut state, backend);
            drop(state);
            for event in warnings {
                self.emit(event);
            }
        }

        None
    }

    /// Confirms a reservation at the actual cost from the outcome.
    pub fn confirm(&self, reservation: Reservation, actual_usd: f64) {
        let mut state = self.state.lock();
        for (_, window) in state.windows_mut() {
            window.confirm(reservation.amount_usd, actual_usd);
        }
        if let Some(window) = state.backends.get_mut(&reservation.backend) {
            window.confirm(reservation.amount_usd, actual_usd);
        }
    }

    /// Releases a reservation without spending (failed or skipped item).
    pub fn release(&self, reservation: Reservation) {
        let mut state = self.state.lock();
        for (_, window) in state.windows_mut() {
            window.release(reservation.amount_usd);
        }
        if let Some(window) = state.backends.get_mut(&reservation.backend) {
            window.release(reservation.amount_usd);
        }
    }

    /// Returns confirmed spend per scope, for reporting.
    #[must_use]
    pub fn spent_by_scope(&self) -> HashMap<String, f64> {
        let mut state = self.state.lock();
        let mut spent: HashMap<String, f64> = state
            .windows_mut()
            .map(|(name, w)| (name.to_string(), w.spent_usd))
            .collect();
        for (name, window) in &state.backends {
            spent.insert(format!("backend:{name}"), window.spent_usd);
        }
        spent
    }

    fn collect_warnings(&self, state: &mut LedgerState, backend: &str) -> Vec<PipelineEvent> {
        let threshold = self.limits.warning_threshold;
        let mut events = Vec::new();

        for (name, window) in state.windows_mut() {
            if !window.warned && window.past_warning(threshold) {
                window.warned = true;
                events.push(PipelineEvent::BudgetWarning {
                    scope: name.to_string(),
                    spent_usd: window.committed_usd(),
                    ceiling_usd: window.ceiling_usd.unwrap_or_default(),
                });
            }
        }
        if let Some(window) = state.backends.get_mut(backend) {
            if !window.warned && window.past_warning(threshold) {
                window.warned = true;
                events.push(PipelineEvent::BudgetWarning {
                    scope: format!("backend:{backend}"),
                    spent_usd: window.committed_usd(),
                    ceiling_usd: window.ceiling_usd.unwrap_or_default(),
                });
            }
        }
        events
    }

    /// Marks the denying window as exhausted, returning whether the
    /// event already fired for this window instance.
    fn mark_exhausted(&self, state: &mut LedgerState, scope: &str) -> bool {
        let window = if let Some(name) = scope.strip_prefix("backend:") {
            state.backends.get_mut(name)
        } else {
            state.windows_mut().find(|(n, _)| *n == scope).map(|(_, w)| w)
        };
        match window {
            Some(w) => std::mem::replace(&mut w.exhausted, true),
            None => false,
        }
    }

    fn emit_exhausted_once_unlocked(&self, scope: &str) {
        // Per-request denials carry no window state; emit every time at
        // debug level via the bus subscriber's discretion.
        self.emit(PipelineEvent::BudgetExhausted {
            scope: scope.to_string(),
        });
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(ref bus) = self.events {
            bus.emit(event);
        }
    }
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("limits", &self.limits)
            .finish()
    }
}
