//! Profiling events.
//!
//! The profiler itself lives outside this crate; it plugs in through
//! [`ProfilingHooks`]. Sampling is enabled whenever hooks are installed, the
//! threshold event whenever `lg_prof_threshold` is configured.

use crate::event::{Direction, Enabled, EventHandler, EventKind};
use crate::runtime::Runtime;
use crate::tsd::Tsd;

pub trait ProfilingHooks: Send + Sync {
    /// Bytes until the next sample. Typically drawn from a geometric
    /// distribution.
    fn sample_wait(&self) -> u64;

    fn on_sample(&self, thread_allocated: u64);

    fn on_threshold(&self, thread_allocated: u64, thread_deallocated: u64, peak: u64);
}

pub(crate) struct ProfSampleEvent;

impl EventHandler for ProfSampleEvent {
    fn kind(&self) -> EventKind {
        EventKind::ProfSample
    }

    fn enabled(&self, runtime: &Runtime, _direction: Direction) -> Enabled {
        if runtime.prof().is_some() {
            Enabled::Yes
        } else {
            Enabled::No
        }
    }

    fn new_event_wait(&self, tsd: &Tsd) -> u64 {
        tsd.runtime().prof().map_or(0, |prof| prof.sample_wait())
    }

    fn handle(&self, tsd: &mut Tsd, _direction: Direction) {
        if let Some(prof) = tsd.runtime().prof() {
            prof.on_sample(tsd.thread_allocated());
        }
    }
}

pub(crate) struct ProfThresholdEvent;

impl EventHandler for ProfThresholdEvent {
    fn kind(&self) -> EventKind {
        EventKind::ProfThreshold
    }

    fn enabled(&self, runtime: &Runtime, _direction: Direction) -> Enabled {
        if runtime.options().lg_prof_threshold.is_some() {
            Enabled::Yes
        } else {
            Enabled::No
        }
    }

    fn new_event_wait(&self, tsd: &Tsd) -> u64 {
        tsd.runtime().options().prof_threshold_bytes().unwrap_or(0)
    }

    fn override_wait(&self, runtime: &Runtime) -> u64 {
        runtime.options().prof_threshold_bytes().unwrap_or(0)
    }

    fn handle(&self, tsd: &mut Tsd, _direction: Direction) {
        let peak = tsd.peak_update();
        let runtime = tsd.runtime().clone();
        if let Some(prof) = runtime.prof() {
            prof.on_threshold(tsd.thread_allocated(), tsd.thread_deallocated(), peak);
        }
    }
}
