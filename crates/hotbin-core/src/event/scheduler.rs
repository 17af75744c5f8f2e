//! Per-thread event counters and the trigger algorithm.
//!
//! For each direction the thread keeps `current` (bytes so far), `last`
//! (bytes at the previous scheduler pass) and `next` (bytes at which the next
//! pass is due). Handler waits are stored relative to `last`, so between
//! passes only `current` moves. The fast threshold published in
//! [`TsdShared`](crate::tsd::TsdShared) mirrors `next` while the thread is
//! nominal and is 0 otherwise, sending every operation to the slow path.

use std::sync::atomic::{Ordering, fence};

use crate::error::InvariantViolation;
use crate::event::{
    ALLOC_EVENT_COUNT, DALLOC_EVENT_COUNT, Direction, Enabled, EventHandler, TE_MAX_INTERVAL,
    TE_MAX_START_WAIT, TE_MIN_START_WAIT, TE_NEXT_EVENT_FAST_MAX, handlers,
};
use crate::runtime::Runtime;
use crate::tsd::{Tsd, TsdState};

/// Counters for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionState {
    pub current: u64,
    pub last: u64,
    pub next: u64,
}

impl DirectionState {
    /// Bytes left before the next pass.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.next.wrapping_sub(self.current)
    }

    #[must_use]
    pub const fn interval(&self) -> u64 {
        self.next.wrapping_sub(self.last)
    }
}

/// All event bookkeeping a thread owns.
#[derive(Debug, Clone, Default)]
pub struct ThreadEvents {
    alloc: DirectionState,
    dalloc: DirectionState,
    alloc_waits: [u64; ALLOC_EVENT_COUNT],
    dalloc_waits: [u64; DALLOC_EVENT_COUNT],
}

impl ThreadEvents {
    #[must_use]
    pub fn state(&self, direction: Direction) -> &DirectionState {
        match direction {
            Direction::Alloc => &self.alloc,
            Direction::Dalloc => &self.dalloc,
        }
    }

    fn state_mut(&mut self, direction: Direction) -> &mut DirectionState {
        match direction {
            Direction::Alloc => &mut self.alloc,
            Direction::Dalloc => &mut self.dalloc,
        }
    }

    #[must_use]
    pub fn waits(&self, direction: Direction) -> &[u64] {
        match direction {
            Direction::Alloc => &self.alloc_waits,
            Direction::Dalloc => &self.dalloc_waits,
        }
    }

    fn waits_mut(&mut self, direction: Direction) -> &mut [u64] {
        match direction {
            Direction::Alloc => &mut self.alloc_waits,
            Direction::Dalloc => &mut self.dalloc_waits,
        }
    }

    /// Add `usize` bytes. Returns whether the next pass is now due.
    #[inline]
    pub fn advance(&mut self, direction: Direction, usize: u64) -> bool {
        let state = self.state_mut(direction);
        let before = state.current;
        state.current = before.wrapping_add(usize);
        usize >= state.next.wrapping_sub(before)
    }

    /// Schedule the next pass `wait` bytes after `last`, capped at
    /// [`TE_MAX_INTERVAL`].
    pub fn adjust_thresholds(&mut self, direction: Direction, wait: u64) {
        let state = self.state_mut(direction);
        state.next = state.last.wrapping_add(wait.min(TE_MAX_INTERVAL));
    }

    /// Close the current accounting window: returns the bytes since `last`
    /// and moves `last` to `current`.
    fn take_accum(&mut self, direction: Direction) -> u64 {
        let state = self.state_mut(direction);
        let accum = state.current.wrapping_sub(state.last);
        state.last = state.current;
        accum
    }

    /// Move `last` up to `current`, shortening every live wait by the bytes
    /// consumed so far.
    fn rebase(&mut self, direction: Direction) {
        let elapsed = self.take_accum(direction);
        for wait in self.waits_mut(direction) {
            if *wait > 0 {
                *wait = wait.saturating_sub(elapsed).max(TE_MIN_START_WAIT);
            }
        }
    }

    /// Install the wait of a freshly registered user hook at `index`.
    /// Returns whether `next` moved.
    pub fn install_wait(&mut self, direction: Direction, index: usize, new_wait: u64) -> bool {
        let state = *self.state(direction);
        if new_wait < state.remaining() {
            self.rebase(direction);
            self.waits_mut(direction)[index] = new_wait;
            let min = min_wait(self.waits(direction));
            self.adjust_thresholds(direction, min);
            true
        } else {
            let elapsed = state.current.wrapping_sub(state.last);
            self.waits_mut(direction)[index] = new_wait.saturating_add(elapsed);
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn set_state(&mut self, direction: Direction, state: DirectionState) {
        *self.state_mut(direction) = state;
    }
}

/// Update one handler's wait after `accum` bytes. Returns whether it is due.
///
/// A wait of 0 marks a user slot this thread has not seen yet: it gets a
/// fresh wait without firing.
pub fn update_wait(
    wait: &mut u64,
    accum: u64,
    allow: bool,
    postponed: impl FnOnce() -> u64,
    fresh: impl FnOnce() -> u64,
) -> bool {
    if *wait > accum {
        *wait -= accum;
        return false;
    }
    if *wait == 0 {
        *wait = fresh().max(TE_MIN_START_WAIT);
        return false;
    }
    if !allow {
        *wait = postponed().max(TE_MIN_START_WAIT);
        return false;
    }
    *wait = fresh().max(TE_MIN_START_WAIT);
    true
}

/// Smallest non-zero wait, [`TE_MAX_START_WAIT`] when there is none.
#[must_use]
pub fn min_wait(waits: &[u64]) -> u64 {
    waits
        .iter()
        .copied()
        .filter(|&w| w > 0)
        .fold(TE_MAX_START_WAIT, u64::min)
}

/// Fast threshold for `next`, 0 when `next` is too close to wrapping.
#[inline]
#[must_use]
pub const fn fast_threshold(next: u64) -> u64 {
    if next <= TE_NEXT_EVENT_FAST_MAX { next } else { 0 }
}

fn wait_on_fire(handler: &dyn EventHandler, runtime: &Runtime, tsd: &Tsd) -> u64 {
    match handler.override_wait(runtime) {
        0 => handler.new_event_wait(tsd),
        interval => interval,
    }
}

/// Check the interval relations of one direction. `active` holds the waits
/// of the handlers currently enabled.
pub fn check_invariants(
    direction: Direction,
    state: &DirectionState,
    fast: u64,
    active: &[u64],
) -> Result<(), InvariantViolation> {
    if state.next == state.last {
        return Err(InvariantViolation::EmptyInterval {
            direction,
            last: state.last,
        });
    }
    let allowed = state.next <= TE_NEXT_EVENT_FAST_MAX;
    if fast != 0 && (fast != state.next || !allowed) {
        return Err(InvariantViolation::FastThreshold {
            direction,
            fast,
            next: state.next,
            allowed,
        });
    }
    let interval = state.interval();
    if state.current.wrapping_sub(state.last) >= interval {
        return Err(InvariantViolation::CurrentOutsideInterval {
            direction,
            current: state.current,
            last: state.last,
            next: state.next,
        });
    }
    let min = min_wait(active);
    let no_active = active.iter().all(|&w| w == 0);
    let consistent = interval == min
        || (interval < min && interval == TE_MAX_INTERVAL)
        || (no_active && state.last == 0);
    if !consistent {
        return Err(InvariantViolation::IntervalMismatch {
            direction,
            interval,
            min_wait: min,
        });
    }
    Ok(())
}

impl Tsd {
    /// Scheduler pass for `direction`: charge the bytes since the previous
    /// pass to every enabled handler, reschedule, then run the due ones.
    pub(crate) fn event_trigger(&mut self, direction: Direction) {
        let runtime = self.runtime.clone();
        let table = handlers(direction);
        let accum = self.events.take_accum(direction);
        let allow = self.shared.state().is_nominal() && self.reentrancy == 0;

        let mut due = [false; ALLOC_EVENT_COUNT];
        for (index, handler) in table.iter().enumerate() {
            match handler.enabled(&runtime, direction) {
                Enabled::NotInstalled => break,
                Enabled::No => continue,
                Enabled::Yes => {}
            }
            let mut wait = self.events.waits(direction)[index];
            due[index] = update_wait(
                &mut wait,
                accum,
                allow,
                || handler.postponed_event_wait(self),
                || wait_on_fire(*handler, &runtime, self),
            );
            self.events.waits_mut(direction)[index] = wait;
        }

        let wait = self.active_min_wait(&runtime, direction);
        self.events.adjust_thresholds(direction, wait);
        self.recompute_fast_threshold();
        debug_assert_eq!(self.assert_invariants(), Ok(()));

        for (index, handler) in table.iter().enumerate() {
            if due[index] {
                handler.handle(self, direction);
            }
        }
        debug_assert_eq!(self.assert_invariants(), Ok(()));
    }

    /// Start both directions afresh from the current byte counts.
    pub(crate) fn te_init(&mut self) {
        let runtime = self.runtime.clone();
        for direction in Direction::ALL {
            self.events.take_accum(direction);
            for (index, handler) in handlers(direction).iter().enumerate() {
                let wait = match handler.enabled(&runtime, direction) {
                    Enabled::Yes => handler.new_event_wait(self).max(TE_MIN_START_WAIT),
                    Enabled::No | Enabled::NotInstalled => 0,
                };
                self.events.waits_mut(direction)[index] = wait;
            }
            let wait = self.active_min_wait(&runtime, direction);
            self.events.adjust_thresholds(direction, wait);
        }
        self.recompute_fast_threshold();
    }

    fn active_waits(&self, runtime: &Runtime, direction: Direction) -> ([u64; ALLOC_EVENT_COUNT], usize) {
        let mut active = [0; ALLOC_EVENT_COUNT];
        let mut n = 0;
        let waits = self.events.waits(direction);
        for (index, handler) in handlers(direction).iter().enumerate() {
            match handler.enabled(runtime, direction) {
                Enabled::NotInstalled => break,
                Enabled::No => {}
                Enabled::Yes => {
                    active[n] = waits[index];
                    n += 1;
                }
            }
        }
        (active, n)
    }

    fn active_min_wait(&self, runtime: &Runtime, direction: Direction) -> u64 {
        let (active, n) = self.active_waits(runtime, direction);
        min_wait(&active[..n])
    }

    /// Publish the fast thresholds, or zero them when the thread must take
    /// the slow path.
    pub(crate) fn recompute_fast_threshold(&self) {
        let shared = &self.shared;
        if shared.state() != TsdState::Nominal {
            shared.zero_fast_thresholds();
            return;
        }
        for direction in Direction::ALL {
            shared.set_fast_threshold(direction, fast_threshold(self.events.state(direction).next));
        }
        fence(Ordering::SeqCst);
        if shared.state() != TsdState::Nominal {
            shared.zero_fast_thresholds();
        }
    }

    /// Point the thread at a user hook just installed in `slot`.
    pub(crate) fn te_user_installed(&mut self, slot: usize, interval: u64, alloc_only: bool) {
        let mut moved = self
            .events
            .install_wait(Direction::Alloc, Direction::Alloc.user_index(slot), interval);
        if !alloc_only {
            moved |= self
                .events
                .install_wait(Direction::Dalloc, Direction::Dalloc.user_index(slot), interval);
        }
        if moved {
            self.recompute_fast_threshold();
        }
    }

    /// Check every counter relation for both directions.
    pub fn assert_invariants(&self) -> Result<(), InvariantViolation> {
        for direction in Direction::ALL {
            let (active, n) = self.active_waits(&self.runtime, direction);
            check_invariants(
                direction,
                self.events.state(direction),
                self.shared.fast_threshold(direction),
                &active[..n],
            )?;
        }
        Ok(())
    }
}
