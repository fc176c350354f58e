//! Simulation clock: owns simulated time and the session phase machine.
//!
//! ```text
//! BeforeOpen → Trading → AfterClose → SessionComplete ─┐
//!     ▲                                                 │
//!     └────────────────── next session ─────────────────┘
//!                                  (no sessions left) → Finished
//! ```
//!
//! A trading iteration ends by handing the clock an [`IterationOutcome`]; the
//! clock, not the caller, computes the next timestamp. `Sleep` carries a
//! non-zero tick count, so every completed iteration strictly advances time
//! and no sequence of calls can revisit a (timestamp, phase) pair.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use thiserror::Error;

use crate::calendar::{DateRange, Granularity, Session, TradingCalendar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    BeforeOpen,
    Trading,
    AfterClose,
    SessionComplete,
    Finished,
}

/// How a trading iteration ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Advance by this many granularity steps.
    Sleep(NonZeroU32),
    /// Stop trading for the session.
    CloseSession,
}

impl IterationOutcome {
    pub fn one_tick() -> Self {
        IterationOutcome::Sleep(NonZeroU32::MIN)
    }

    pub fn ticks(n: u32) -> Self {
        NonZeroU32::new(n).map_or(IterationOutcome::CloseSession, IterationOutcome::Sleep)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("cannot {action} while in {from:?}")]
    InvalidTransition { from: Phase, action: &'static str },
}

/// Read-only snapshot of the clock. Others only ever see copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockState {
    pub now: DateTime<Utc>,
    pub session_open: DateTime<Utc>,
    pub session_close: DateTime<Utc>,
    pub phase: Phase,
    /// Trading iterations completed across all sessions.
    pub iteration: u64,
    pub session_index: usize,
}

pub struct SimulationClock {
    sessions: Vec<Session>,
    step: Duration,
    state: ClockState,
}

impl SimulationClock {
    pub fn new(calendar: &TradingCalendar, range: &DateRange, granularity: Granularity) -> Self {
        Self::from_sessions(calendar.sessions(range), granularity, range)
    }

    fn from_sessions(sessions: Vec<Session>, granularity: Granularity, range: &DateRange) -> Self {
        let state = match sessions.first() {
            Some(first) => ClockState {
                now: first.open,
                session_open: first.open,
                session_close: first.close,
                phase: Phase::BeforeOpen,
                iteration: 0,
                session_index: 0,
            },
            None => {
                let start = range.start.and_time(NaiveTime::MIN).and_utc();
                ClockState {
                    now: start,
                    session_open: start,
                    session_close: start,
                    phase: Phase::Finished,
                    iteration: 0,
                    session_index: 0,
                }
            }
        };
        Self {
            sessions,
            step: granularity.step(),
            state,
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state.now
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn is_finished(&self) -> bool {
        self.state.phase == Phase::Finished
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn current_session(&self) -> Option<&Session> {
        match self.state.phase {
            Phase::Finished => None,
            _ => self.sessions.get(self.state.session_index),
        }
    }

    /// Move through every phase except `Trading`, which only
    /// [`SimulationClock::complete_iteration`] may leave.
    pub fn advance_phase(&mut self) -> Result<ClockState, ClockError> {
        let next = match self.state.phase {
            Phase::BeforeOpen => Phase::Trading,
            Phase::AfterClose => Phase::SessionComplete,
            Phase::SessionComplete => {
                let idx = self.state.session_index + 1;
                match self.sessions.get(idx) {
                    Some(session) => {
                        self.state.session_index = idx;
                        self.state.session_open = session.open;
                        self.state.session_close = session.close;
                        self.state.now = session.open;
                        Phase::BeforeOpen
                    }
                    None => Phase::Finished,
                }
            }
            from @ (Phase::Trading | Phase::Finished) => {
                return Err(ClockError::InvalidTransition {
                    from,
                    action: "advance phase",
                })
            }
        };
        self.state.phase = next;
        Ok(self.state)
    }

    /// End a trading iteration. The next timestamp is computed here and is
    /// strictly later than the current one.
    pub fn complete_iteration(&mut self, outcome: IterationOutcome) -> Result<ClockState, ClockError> {
        if self.state.phase != Phase::Trading {
            return Err(ClockError::InvalidTransition {
                from: self.state.phase,
                action: "complete a trading iteration",
            });
        }
        self.state.iteration += 1;
        let close = self.state.session_close;
        match outcome {
            IterationOutcome::CloseSession => {
                self.state.now = close;
                self.state.phase = Phase::AfterClose;
            }
            IterationOutcome::Sleep(ticks) => {
                let next = i32::try_from(ticks.get())
                    .ok()
                    .and_then(|n| self.step.checked_mul(n))
                    .and_then(|d| self.state.now.checked_add_signed(d));
                match next {
                    Some(t) if t < close => self.state.now = t,
                    _ => {
                        self.state.now = close;
                        self.state.phase = Phase::AfterClose;
                    }
                }
            }
        }
        Ok(self.state)
    }

    /// Stop early. Idempotent.
    pub fn finish(&mut self) -> ClockState {
        self.state.phase = Phase::Finished;
        self.state
    }
}
