pub mod gto;
pub mod lrr;

use crate::core::{PipelineStage, WarpIssuer};
use crate::opcodes::ArchOp;
use crate::warp::Warp;

use console::style;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ExecUnitKind {
    NONE,
    SP,
    SFU,
    MEM,
    INT,
}

/// A warp scheduler.
///
/// Owns a subset of the core's warps and issues at most
/// `max_instruction_issue_per_warp` instructions of one warp per cycle.
pub trait SchedulerUnit: std::fmt::Debug + Send + Sync + 'static {
    fn id(&self) -> usize;

    fn add_supervised_warp(&mut self, warp_id: usize);

    /// Order the supervised warps and issue from the first eligible one.
    fn cycle(
        &mut self,
        issuer: &mut dyn WarpIssuer,
        warps: &mut [Warp],
        stats: &mut stats::scheduler::Scheduler,
    );

    /// Warp ids in last issue priority order, for diagnostics.
    fn prioritized_warp_ids(&self) -> &[usize];
}

#[derive(Debug)]
pub struct Base {
    pub id: usize,
    pub core_id: usize,

    /// All warps this scheduler arbitrates between.
    pub supervised_warps: Vec<usize>,
    /// Index into `supervised_warps` of the last warp that issued.
    pub last_supervised_issued_idx: usize,
    pub next_cycle_prioritized_warps: Vec<usize>,

    pub config: Arc<crate::config::GPU>,
}

impl Base {
    #[must_use]
    pub fn new(id: usize, core_id: usize, config: Arc<crate::config::GPU>) -> Self {
        Self {
            id,
            core_id,
            supervised_warps: Vec::new(),
            last_supervised_issued_idx: 0,
            next_cycle_prioritized_warps: Vec::new(),
            config,
        }
    }

    /// Greedy-then-priority ordering: the last issued warp first, the rest
    /// sorted by the priority function.
    pub fn order_greedy_then_priority<K: Ord>(
        &mut self,
        warps: &[Warp],
        priority: impl Fn(&Warp) -> K,
    ) {
        let out = &mut self.next_cycle_prioritized_warps;
        out.clear();

        let greedy = self
            .supervised_warps
            .get(self.last_supervised_issued_idx)
            .copied();
        if let Some(greedy) = greedy {
            out.push(greedy);
        }

        let mut sorted: Vec<usize> = self.supervised_warps.clone();
        sorted.sort_by_key(|&warp_id| priority(&warps[warp_id]));
        out.extend(sorted.into_iter().filter(|&warp_id| Some(warp_id) != greedy));

        debug_assert_eq!(out.len(), self.supervised_warps.len());
    }

    /// Loose round robin starting one past the last issued warp.
    pub fn order_round_robin(&mut self) {
        let out = &mut self.next_cycle_prioritized_warps;
        out.clear();
        let n = self.supervised_warps.len();
        if n == 0 {
            return;
        }
        let start = (self.last_supervised_issued_idx + 1) % n;
        out.extend(
            (0..n).map(|i| self.supervised_warps[(start + i) % n]),
        );
    }

    /// Issue loop over the prioritized warps.
    ///
    /// Issues from the first warp with a ready instruction, then stops:
    /// one warp supplies all instructions a scheduler issues in a cycle.
    pub fn issue_to(
        &mut self,
        issuer: &mut dyn WarpIssuer,
        warps: &mut [Warp],
        stats: &mut stats::scheduler::Scheduler,
    ) {
        let mut valid_inst = false;
        let mut ready_inst = false;
        let mut issued_inst = false;

        let prioritized = self.next_cycle_prioritized_warps.clone();
        for warp_id in prioritized {
            let warp = &mut warps[warp_id];
            if warp.done_exit() {
                continue;
            }

            log::debug!(
                "scheduler[{}] core {}: testing warp {} (dynamic={}, pc={:?})",
                self.id,
                self.core_id,
                warp_id,
                warp.dynamic_warp_id,
                warp.pc(),
            );

            let max_issue = self.config.max_instruction_issue_per_warp;
            let diff_exec_units = self.config.dual_issue_only_to_different_exec_units;
            let mut checked = 0;
            let mut issued = 0;
            let mut prev_issued_exec_unit = ExecUnitKind::NONE;

            while !warp.waiting()
                && !issuer.warp_waiting_at_barrier(warp_id)
                && !warp.ibuffer_empty()
                && checked < max_issue
                && checked <= issued
                && issued < max_issue
            {
                let mut warp_inst_issued = false;

                if let Some(instr) = warp.ibuffer_peek() {
                    valid_inst = true;
                    if issuer.scoreboard_collision(warp_id, instr) {
                        log::debug!(
                            "warp {} {}",
                            warp_id,
                            style("fails scoreboard").yellow()
                        );
                    } else {
                        ready_inst = true;
                        let category = instr.opcode.category;

                        let target = match category {
                            ArchOp::LOAD_OP | ArchOp::STORE_OP | ArchOp::MEMORY_BARRIER_OP => {
                                Some((PipelineStage::ID_OC_MEM, ExecUnitKind::MEM))
                            }
                            ArchOp::SFU_OP | ArchOp::DP_OP => {
                                Some((PipelineStage::ID_OC_SFU, ExecUnitKind::SFU))
                            }
                            ArchOp::INT_OP | ArchOp::ALU_OP | ArchOp::SP_OP
                            | ArchOp::BARRIER_OP | ArchOp::EXIT_OPS | ArchOp::NO_OP => {
                                // with an INT pipe, integer and ALU work
                                // issues there and the SP pipe keeps FP
                                if self.config.num_int_units > 0 && category != ArchOp::SP_OP {
                                    Some((PipelineStage::ID_OC_INT, ExecUnitKind::INT))
                                } else {
                                    Some((PipelineStage::ID_OC_SP, ExecUnitKind::SP))
                                }
                            }
                        };

                        if let Some((stage, unit)) = target {
                            let unit_free = issuer.has_free_register(stage, self.id);
                            let dual_issue_allowed =
                                !diff_exec_units || prev_issued_exec_unit != unit;
                            if unit_free && dual_issue_allowed {
                                let instr = warp.ibuffer_take().unwrap();
                                debug_assert_eq!(instr.warp_id, warp.warp_id);
                                if issuer.issue_warp(stage, warp, instr, self.id) {
                                    issued += 1;
                                    issued_inst = true;
                                    warp_inst_issued = true;
                                    prev_issued_exec_unit = unit;
                                }
                            } else {
                                log::debug!(
                                    "issue failed: no free {stage:?} register (free={unit_free})",
                                );
                            }
                        }
                    }
                }
                if warp_inst_issued {
                    warp.ibuffer_step();
                }
                checked += 1;
            }

            if issued > 0 {
                self.last_supervised_issued_idx = self
                    .supervised_warps
                    .iter()
                    .position(|&supervised| supervised == warp_id)
                    .unwrap_or(self.last_supervised_issued_idx);
                if issued == 1 {
                    stats.num_single_issue += 1;
                } else {
                    stats.num_dual_issue += 1;
                }
                break;
            }
        }

        // issue stall bookkeeping
        if !valid_inst {
            stats.issue_raw_hazard_stall += 1;
        } else if !ready_inst {
            stats.issue_control_hazard_stall += 1;
        } else if !issued_inst {
            stats.issue_pipeline_stall += 1;
        }
    }

    /// Release memory barriers whose stores have drained.
    pub fn clear_memory_barriers(&self, warps: &mut [Warp]) {
        for &warp_id in &self.supervised_warps {
            let warp = &mut warps[warp_id];
            if warp.waiting_for_memory_barrier && warp.stores_done() {
                warp.waiting_for_memory_barrier = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config;
    use crate::instruction::WarpInstruction;
    use crate::warp::Warp;
    use bitvec::array::BitArray;
    use std::sync::Arc;

    pub(crate) fn active_warp(warp_id: usize, dynamic_warp_id: usize) -> Warp {
        let mut warp = Warp::default();
        let mut mask: crate::warp::ActiveMask = BitArray::ZERO;
        mask.fill(true);
        warp.init(warp_id, dynamic_warp_id, 0, mask, 0, [].into());
        warp.ibuffer_fill(0, WarpInstruction::test_instruction("ADD", 0));
        warp.num_instr_in_pipeline += 1;
        warp
    }

    #[test]
    fn greedy_then_oldest_ordering() {
        let config = Arc::new(config::GPU::default());
        let mut base = super::Base::new(0, 0, config);
        base.supervised_warps.extend([0, 1, 2]);

        let warps: Vec<Warp> = (0..3)
            // dynamic ids reversed: warp 2 is the oldest
            .map(|warp_id| active_warp(warp_id, 10 - warp_id))
            .collect();

        // last issued was warp 1: it keeps priority, then oldest first
        base.last_supervised_issued_idx = 1;
        base.order_greedy_then_priority(&warps, |warp| warp.dynamic_warp_id);
        assert_eq!(base.next_cycle_prioritized_warps, vec![1, 2, 0]);
    }

    #[test]
    fn round_robin_rotates_past_last_issued() {
        let config = Arc::new(config::GPU::default());
        let mut base = super::Base::new(0, 0, config);
        base.supervised_warps.extend([0, 1, 2, 3]);
        base.last_supervised_issued_idx = 1;
        base.order_round_robin();
        assert_eq!(base.next_cycle_prioritized_warps, vec![2, 3, 0, 1]);
    }
}
