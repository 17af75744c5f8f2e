//! User event hooks.
//!
//! Up to [`MAX_USER_EVENTS`] hooks can be installed at run time. Each one is
//! called every `interval` bytes of allocation (and deallocation, unless it is
//! alloc-only) on every thread. Slots are written once under the writer lock
//! and then published; readers never lock.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering, fence};

use parking_lot::Mutex;

use crate::error::RegisterError;
use crate::event::{Direction, Enabled, EventHandler, EventKind, TE_MIN_START_WAIT};
use crate::runtime::Runtime;
use crate::tsd::Tsd;

pub const MAX_USER_EVENTS: usize = 4;

/// `(is_alloc, thread_allocated, thread_deallocated)`.
pub type UserEventCallback = fn(bool, u64, u64);

#[derive(Debug, Clone, Copy)]
pub struct UserHook {
    pub callback: Option<UserEventCallback>,
    pub interval: u64,
    pub alloc_only: bool,
}

impl PartialEq for UserHook {
    fn eq(&self, other: &Self) -> bool {
        let same_callback = match (self.callback, other.callback) {
            (Some(a), Some(b)) => std::ptr::fn_addr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_callback && self.interval == other.interval && self.alloc_only == other.alloc_only
    }
}

impl Eq for UserHook {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Written to this slot.
    Installed(usize),
    /// An identical hook was already present.
    AlreadyRegistered,
}

pub struct UserHookTable {
    writer: Mutex<()>,
    slots: [OnceLock<UserHook>; MAX_USER_EVENTS],
    published: [AtomicBool; MAX_USER_EVENTS],
}

impl UserHookTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(()),
            slots: std::array::from_fn(|_| OnceLock::new()),
            published: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    /// Install `hook` in the first free slot.
    ///
    /// Fails with [`RegisterError::InvalidArgument`] for a hook without a
    /// callback or with a zero interval, and with [`RegisterError::Full`]
    /// once every slot holds a different hook.
    pub fn register(&self, hook: UserHook) -> Result<RegisterOutcome, RegisterError> {
        if hook.callback.is_none() || hook.interval == 0 {
            return Err(RegisterError::InvalidArgument);
        }
        let _guard = self.writer.lock();
        for (slot, published) in self.published.iter().enumerate() {
            if published.load(Ordering::Relaxed) {
                if self.slots[slot].get() == Some(&hook) {
                    return Ok(RegisterOutcome::AlreadyRegistered);
                }
                continue;
            }
            if self.slots[slot].set(hook).is_err() {
                continue;
            }
            fence(Ordering::SeqCst);
            published.store(true, Ordering::Release);
            return Ok(RegisterOutcome::Installed(slot));
        }
        Err(RegisterError::Full)
    }

    /// Published hook in `slot`.
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<UserHook> {
        if !self.published.get(slot)?.load(Ordering::Acquire) {
            return None;
        }
        self.slots[slot].get().copied()
    }

    #[must_use]
    pub fn enabled(&self, slot: usize, direction: Direction) -> Enabled {
        match self.get(slot) {
            None => Enabled::NotInstalled,
            Some(hook) if direction.is_alloc() || !hook.alloc_only => Enabled::Yes,
            Some(_) => Enabled::No,
        }
    }

    #[must_use]
    pub fn installed(&self) -> usize {
        (0..MAX_USER_EVENTS).take_while(|&slot| self.get(slot).is_some()).count()
    }
}

impl Default for UserHookTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UserHookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserHookTable")
            .field("installed", &self.installed())
            .finish()
    }
}

/// Scheduler adapter for user slot `slot`.
pub(crate) struct UserEvent {
    pub(crate) slot: usize,
}

impl EventHandler for UserEvent {
    fn kind(&self) -> EventKind {
        EventKind::User(self.slot)
    }

    fn enabled(&self, runtime: &Runtime, direction: Direction) -> Enabled {
        runtime.user_hooks().enabled(self.slot, direction)
    }

    fn new_event_wait(&self, tsd: &Tsd) -> u64 {
        tsd.runtime()
            .user_hooks()
            .get(self.slot)
            .map_or(TE_MIN_START_WAIT, |hook| hook.interval)
    }

    fn handle(&self, tsd: &mut Tsd, direction: Direction) {
        let Some(callback) = tsd
            .runtime()
            .user_hooks()
            .get(self.slot)
            .and_then(|hook| hook.callback)
        else {
            return;
        };
        let allocated = tsd.thread_allocated();
        let deallocated = tsd.thread_deallocated();
        tsd.pre_reentrancy();
        callback(direction.is_alloc(), allocated, deallocated);
        tsd.post_reentrancy();
    }
}
