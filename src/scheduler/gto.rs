use crate::core::WarpIssuer;
use crate::warp::Warp;

use std::sync::Arc;

/// Greedy-then-oldest scheduler.
///
/// Keeps issuing from the warp that issued last; when it stalls, falls
/// back to the eligible warp with the smallest dynamic warp id.
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
        self.inner.order_greedy_then_priority(warps, |warp| {
            // finished or stalled warps sort last
            (warp.done_exit() || warp.waiting(), warp.dynamic_warp_id)
        });
        log::debug!(
            "gto scheduler[{}, core {}]: prioritized warp ids: {:?}",
            self.inner.id,
            self.inner.core_id,
            self.inner.next_cycle_prioritized_warps,
        );
        self.inner.issue_to(issuer, warps, stats);
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::active_warp;
    use super::super::SchedulerUnit;
    use crate::config;
    use std::sync::Arc;

    #[derive(Debug)]
    struct CountingIssuer {
        issued_warps: Vec<usize>,
    }

    impl crate::core::WarpIssuer for CountingIssuer {
        fn has_free_register(&self, _: crate::core::PipelineStage, _: usize) -> bool {
            true
        }

        fn issue_warp(
            &mut self,
            _: crate::core::PipelineStage,
            warp: &mut crate::warp::Warp,
            instr: crate::instruction::WarpInstruction,
            _: usize,
        ) -> bool {
            self.issued_warps.push(warp.warp_id);
            warp.num_instr_in_pipeline -= 1;
            drop(instr);
            true
        }

        fn warp_waiting_at_barrier(&self, _: usize) -> bool {
            false
        }

        fn scoreboard_collision(
            &self,
            _: usize,
            _: &crate::instruction::WarpInstruction,
        ) -> bool {
            false
        }
    }

    #[test]
    fn gto_issues_greedily_until_stall() {
        let mut config = config::GPU::default();
        config.max_instruction_issue_per_warp = 1;
        let config = Arc::new(config);
        let mut scheduler = super::Scheduler::new(0, 0, config);
        let mut stats = stats::scheduler::Scheduler::default();

        // warp 1 is oldest (smallest dynamic id)
        let mut warps = vec![active_warp(0, 5), active_warp(1, 2), active_warp(2, 9)];
        for warp in &warps {
            scheduler.add_supervised_warp(warp.warp_id);
        }

        let mut issuer = CountingIssuer {
            issued_warps: Vec::new(),
        };

        // first cycle: greedy seed is warp 0 (last issued index 0)
        scheduler.cycle(&mut issuer, &mut warps, &mut stats);
        assert_eq!(issuer.issued_warps, vec![0]);

        // refill warp 0 and keep issuing greedily from it
        warps[0].ibuffer_fill(0, crate::instruction::WarpInstruction::test_instruction("ADD", 8));
        warps[0].num_instr_in_pipeline += 1;
        scheduler.cycle(&mut issuer, &mut warps, &mut stats);
        assert_eq!(issuer.issued_warps, vec![0, 0]);

        // warp 0 drained: oldest eligible (warp 1) goes next
        scheduler.cycle(&mut issuer, &mut warps, &mut stats);
        assert_eq!(issuer.issued_warps, vec![0, 0, 1]);
    }
}
