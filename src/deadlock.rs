/// Raised when the watchdog fires.
#[derive(thiserror::Error, Debug)]
#[error(
    "deadlock detected at cycle {cycle}: no instruction retired for {interval} cycles\n{state}"
)]
pub struct DeadlockError {
    pub cycle: u64,
    pub interval: u64,
    /// Scheduler and arbiter state dump.
    pub state: String,
}

/// Watches the global retired-instruction counter.
///
/// Fires when the counter has not advanced for the configured number of
/// consecutive cycles while kernels remain active.
#[derive(Debug)]
pub struct Watchdog {
    interval: u64,
    last_instructions: u64,
    last_progress_cycle: u64,
}

impl Watchdog {
    #[must_use]
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            last_instructions: 0,
            last_progress_cycle: 0,
        }
    }

    pub fn check(
        &mut self,
        cycle: u64,
        instructions: u64,
        active: bool,
        state: impl FnOnce() -> String,
    ) -> Result<(), DeadlockError> {
        if self.interval == 0 {
            return Ok(());
        }
        if instructions > self.last_instructions {
            self.last_instructions = instructions;
            self.last_progress_cycle = cycle;
            return Ok(());
        }
        if active && cycle.saturating_sub(self.last_progress_cycle) >= self.interval {
            return Err(DeadlockError {
                cycle,
                interval: self.interval,
                state: state(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Watchdog;

    #[test]
    fn fires_only_without_progress() {
        let mut watchdog = Watchdog::new(100);
        // progress every cycle: never fires
        for cycle in 0..500 {
            assert!(watchdog.check(cycle, cycle, true, String::new).is_ok());
        }
        // stalled: fires after the interval
        let mut fired = None;
        for cycle in 500..700 {
            if watchdog.check(cycle, 499, true, String::new).is_err() {
                fired = Some(cycle);
                break;
            }
        }
        assert_eq!(fired, Some(599));
    }

    #[test]
    fn inactive_gpu_never_deadlocks() {
        let mut watchdog = Watchdog::new(10);
        for cycle in 0..100 {
            assert!(watchdog.check(cycle, 0, false, String::new).is_ok());
        }
    }

    #[test]
    fn disabled_watchdog_is_silent() {
        let mut watchdog = Watchdog::new(0);
        for cycle in 0..100_000 {
            assert!(watchdog.check(cycle, 0, true, String::new).is_ok());
        }
    }
}
