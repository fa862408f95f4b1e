use crate::core::WarpIssuer;
use crate::warp::Warp;

use std::sync::Arc;

/// Loose round-robin scheduler.
///
/// Rotates priority one past the warp that issued last.
#[derive(Debug)]
pub struct Scheduler {
    inner: super::Base,
}

impl Scheduler {
    #[must_use]
    pub fn new(id: usize, core_id: usize, config: Arc<crate::config::GPU>) -> Self {
        Self {
            inner: super::Base::new(id, core_id, config),
        }
    }
}

impl super::SchedulerUnit for Scheduler {
    fn id(&self) -> usize {
        self.inner.id
    }

    fn add_supervised_warp(&mut self, warp_id: usize) {
        self.inner.supervised_warps.push(warp_id);
    }

    fn prioritized_warp_ids(&self) -> &[usize] {
        &self.inner.next_cycle_prioritized_warps
    }

    fn cycle(
        &mut self,
        issuer: &mut dyn WarpIssuer,
        warps: &mut [Warp],
        stats: &mut stats::scheduler::Scheduler,
    ) {
        self.inner.clear_memory_barriers(warps);
        self.inner.order_round_robin();
        log::debug!(
            "lrr scheduler[{}, core {}]: prioritized warp ids: {:?}",
            self.inner.id,
            self.inner.core_id,
            self.inner.next_cycle_prioritized_warps,
        );
        self.inner.issue_to(issuer, warps, stats);
    }
}
