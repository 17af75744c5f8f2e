//! Per-thread peak of net allocated bytes.

use crate::event::{Direction, Enabled, EventHandler, EventKind};
use crate::runtime::Runtime;
use crate::tsd::Tsd;

/// Bytes between peak samples in either direction.
pub const PEAK_EVENT_WAIT: u64 = 64 << 10;

/// High-water mark of `allocated - deallocated`, measured from the last
/// reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Peak {
    cur_max: u64,
    adjustment: u64,
}

impl Peak {
    #[must_use]
    pub const fn max(&self) -> u64 {
        self.cur_max
    }

    pub fn update(&mut self, allocated: u64, deallocated: u64) {
        let candidate = allocated.wrapping_sub(deallocated).wrapping_sub(self.adjustment) as i64;
        if candidate > 0 && candidate as u64 > self.cur_max {
            self.cur_max = candidate as u64;
        }
    }

    /// Restart tracking from the current net usage.
    pub fn set_zero(&mut self, allocated: u64, deallocated: u64) {
        self.cur_max = 0;
        self.adjustment = allocated.wrapping_sub(deallocated);
    }
}

pub(crate) struct PeakEvent;

impl EventHandler for PeakEvent {
    fn kind(&self) -> EventKind {
        EventKind::Peak
    }

    fn enabled(&self, _runtime: &Runtime, _direction: Direction) -> Enabled {
        Enabled::Yes
    }

    fn new_event_wait(&self, _tsd: &Tsd) -> u64 {
        PEAK_EVENT_WAIT
    }

    fn override_wait(&self, _runtime: &Runtime) -> u64 {
        PEAK_EVENT_WAIT
    }

    fn handle(&self, tsd: &mut Tsd, _direction: Direction) {
        tsd.peak_update();
        tsd.run_activity_callback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_high_water_since_reset() {
        let mut peak = Peak::default();
        peak.update(1000, 200);
        peak.update(1200, 1100);
        assert_eq!(peak.max(), 800);
        peak.set_zero(1200, 1100);
        assert_eq!(peak.max(), 0);
        peak.update(1300, 1100);
        assert_eq!(peak.max(), 100);
    }

    #[test]
    fn net_drop_below_reset_point_is_ignored() {
        let mut peak = Peak::default();
        peak.set_zero(5000, 1000);
        peak.update(5000, 4500);
        assert_eq!(peak.max(), 0);
    }
}
