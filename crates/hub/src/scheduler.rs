//! Auto-feed scheduler: fires `FEED_AUTO` once per configured slot per day.
//!
//! The scheduler owns the persisted [`ScheduleConfig`] and is the only thing
//! that mutates it. Every mutation is written to disk *before* it takes effect
//! in memory, and before any command goes out, so a crash can never forget
//! that a slot already fired while the command was already sent.
//!
//! ## Per-tick state
//!
//! ```text
//! Idle ──[enabled && online]──▶ Armed ──[slot due, persisted]──▶ Fired
//!  ▲                              │                                │
//!  └──[disabled || offline]───────┘◀───────────[next tick]─────────┘
//! ```
//!
//! A slot is due when `slot <= now < slot + grace_window` on the current local
//! day and it is not yet in `triggered_today`. Anything later than the grace
//! window is skipped for the day rather than fired hours late.

use std::collections::BTreeSet;

use time::{Date, Duration, OffsetDateTime};
use tracing::{error, info, warn};

use crate::emitter::{Command, CommandSink, EmitError};
use crate::schedule::{validate_slots, ScheduleConfig, ScheduleError, SlotTime};
use crate::store::ScheduleStore;

/// Default late-trigger recovery window.
#[cfg(test)]
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::minutes(10);

/// A slot recorded as triggered on disk, and what the sink said about the
/// `FEED_AUTO` that followed.
#[derive(Debug)]
pub struct FiredSlot {
    pub slot: SlotTime,
    pub emit: Result<(), EmitError>,
}

#[derive(Debug)]
pub enum TickOutcome {
    /// Auto-feed disabled or device offline; nothing evaluated.
    Idle,
    /// Evaluated, no slot due.
    Armed,
    /// These slots fired on this tick.
    Fired(Vec<FiredSlot>),
}

/// A tick stopped by a persistence failure. `fired` holds the slots committed
/// earlier in the same tick.
#[derive(Debug)]
pub struct TickError {
    pub fired: Vec<FiredSlot>,
    pub cause: ScheduleError,
}

impl From<ScheduleError> for TickError {
    fn from(cause: ScheduleError) -> Self {
        Self {
            fired: Vec::new(),
            cause,
        }
    }
}

pub struct Scheduler {
    config: ScheduleConfig,
    store: ScheduleStore,
    grace_window: Duration,
}

impl Scheduler {
    /// Load the persisted schedule (or defaults) from `store`.
    pub fn new(store: ScheduleStore, grace_window: Duration) -> Self {
        let config = store.load();
        Self::from_parts(config, store, grace_window)
    }

    pub fn from_parts(config: ScheduleConfig, store: ScheduleStore, grace_window: Duration) -> Self {
        Self {
            config,
            store,
            grace_window,
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    // -----------------------------------------------------------------------
    // Tick evaluation
    // -----------------------------------------------------------------------

    /// Run one evaluation pass at local time `now`.
    ///
    /// A persistence failure stops the tick before that slot is emitted and
    /// leaves it eligible for the next tick.
    pub fn tick(
        &mut self,
        now: OffsetDateTime,
        online: bool,
        sink: &dyn CommandSink,
    ) -> Result<TickOutcome, TickError> {
        if !self.config.auto_feed_enabled || !online {
            return Ok(TickOutcome::Idle);
        }

        self.ensure_daily_reset(now.date())?;

        let due = self.due_slots(now);
        if due.is_empty() {
            return Ok(TickOutcome::Armed);
        }

        let mut fired = Vec::with_capacity(due.len());
        for slot in due {
            let mut next = self.config.clone();
            next.triggered_today.insert(slot.key());
            if let Err(cause) = self.commit(next) {
                return Err(TickError { fired, cause });
            }

            let late = now - slot_at(slot, now);
            info!(
                slot = %slot,
                late_sec = late.whole_seconds(),
                "scheduler: auto feed triggered"
            );
            // Already recorded as triggered; a failed send is not retried.
            let emit = sink.send(Command::FeedAuto);
            if let Err(e) = &emit {
                error!(slot = %slot, "scheduler: failed to emit FEED_AUTO: {e}");
            }
            fired.push(FiredSlot { slot, emit });
        }

        Ok(TickOutcome::Fired(fired))
    }

    /// Clear `triggered_today` when the local date changed since the last
    /// check. Returns whether a reset happened; a second call on the same day
    /// is a no-op.
    pub fn ensure_daily_reset(&mut self, today: Date) -> Result<bool, ScheduleError> {
        if self.config.last_check_date == Some(today) {
            return Ok(false);
        }

        let mut next = self.config.clone();
        next.triggered_today.clear();
        next.last_check_date = Some(today);
        self.commit(next)?;

        info!(%today, "scheduler: daily reset, all slots re-armed");
        Ok(true)
    }

    /// Slots due at `now`, de-duplicated by key.
    fn due_slots(&self, now: OffsetDateTime) -> BTreeSet<SlotTime> {
        self.config
            .feed_times
            .iter()
            .copied()
            .filter(|&slot| !self.config.was_triggered(slot))
            .filter(|&slot| is_due(slot, now, self.grace_window))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Editing
    // -----------------------------------------------------------------------

    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), ScheduleError> {
        let mut next = self.config.clone();
        next.auto_feed_enabled = enabled;
        self.commit(next)?;
        info!(enabled, "scheduler: auto feed toggled");
        Ok(())
    }

    /// Replace the slot list. Returns `false` (and writes nothing) when the
    /// new list is identical to the current one.
    ///
    /// `triggered_today` is left alone: entries for removed slots stay until
    /// the next daily reset.
    pub fn set_slots(&mut self, slots: Vec<SlotTime>) -> Result<bool, ScheduleError> {
        validate_slots(&slots)?;
        if slots == self.config.feed_times {
            return Ok(false);
        }

        let mut next = self.config.clone();
        next.feed_times = slots;
        self.commit(next)?;
        info!(
            slots = %join_slots(&self.config.feed_times),
            "scheduler: feed slots updated"
        );
        Ok(true)
    }

    /// Operator re-arm: forget which slots fired today without waiting for the
    /// date to roll over.
    pub fn reset_daily_history(&mut self) -> Result<(), ScheduleError> {
        let mut next = self.config.clone();
        next.triggered_today.clear();
        self.commit(next)?;
        warn!("scheduler: daily history cleared by operator");
        Ok(())
    }

    fn commit(&mut self, next: ScheduleConfig) -> Result<(), ScheduleError> {
        self.store.save(&next)?;
        self.config = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `slot` on the same local day (and offset) as `now`.
fn slot_at(slot: SlotTime, now: OffsetDateTime) -> OffsetDateTime {
    now.date()
        .with_time(slot.as_time())
        .assume_offset(now.offset())
}

/// Grace-window trigger predicate: `slot <= now < slot + grace`, same day.
pub fn is_due(slot: SlotTime, now: OffsetDateTime, grace: Duration) -> bool {
    let late = now - slot_at(slot, now);
    late >= Duration::ZERO && late < grace
}

pub(crate) fn join_slots(slots: &[SlotTime]) -> String {
    slots
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// ===========================================================================
// Tests
// ===========================================================================
