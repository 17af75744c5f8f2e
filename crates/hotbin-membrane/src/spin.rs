//! Adaptive spin-then-yield backoff for short critical sections.

/// Rounds of exponential spinning before falling back to `yield_now`.
pub const SPIN_LIMIT_LG: u32 = 5;

/// Backoff state. Each call to [`Spin::adaptive`] waits about twice as long
/// as the previous one until the spin budget is spent, then yields the CPU.
#[derive(Debug, Default, Clone)]
pub struct Spin {
    iteration: u32,
}

impl Spin {
    #[must_use]
    pub const fn new() -> Self {
        Self { iteration: 0 }
    }

    pub fn adaptive(&mut self) {
        if self.iteration < SPIN_LIMIT_LG {
            for _ in 0..(1u32 << self.iteration) {
                std::hint::spin_loop();
            }
            self.iteration += 1;
        } else {
            std::thread::yield_now();
        }
    }

    /// Whether the spin budget is spent and further waits only yield.
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.iteration >= SPIN_LIMIT_LG
    }

    #[must_use]
    pub const fn iterations(&self) -> u32 {
        self.iteration
    }
}

/// Spin until `ready` returns true or `max_rounds` backoff rounds elapse.
/// Returns whether `ready` was observed.
pub fn spin_until(max_rounds: u32, mut ready: impl FnMut() -> bool) -> bool {
    let mut spin = Spin::new();
    for _ in 0..max_rounds {
        if ready() {
            return true;
        }
        spin.adaptive();
    }
    ready()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_budget_is_bounded() {
        let mut spin = Spin::new();
        for _ in 0..SPIN_LIMIT_LG {
            assert!(!spin.exhausted());
            spin.adaptive();
        }
        assert!(spin.exhausted());
        spin.adaptive();
        assert_eq!(spin.iterations(), SPIN_LIMIT_LG);
    }

    #[test]
    fn spin_until_reports_readiness() {
        let mut n = 0;
        assert!(spin_until(10, || {
            n += 1;
            n == 3
        }));
        assert!(!spin_until(2, || false));
    }
}
