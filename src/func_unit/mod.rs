pub mod int;
pub mod load_store;
pub mod sfu;
pub mod sp;

pub use int::IntUnit;
pub use load_store::LoadStoreUnit;
pub use sfu::SFU;
pub use sp::SPUnit;

use crate::core::PipelineStage;
use crate::instruction::WarpInstruction;
use crate::register_set::{self, RegisterSet};
use crate::warp;

use bitvec::{array::BitArray, BitArr};

pub const MAX_ALU_LATENCY: usize = 512;
pub type OccupiedSlots = BitArr!(for MAX_ALU_LATENCY);

/// A pipelined SIMD execution unit.
pub trait SimdFunctionUnit: std::fmt::Display + Send + Sync + 'static {
    fn can_issue(&self, instr: &WarpInstruction) -> bool;

    fn issue(&mut self, instr: WarpInstruction);

    /// Advance the pipeline one stage; completed instructions move to the
    /// result port.
    fn cycle(&mut self, result_port: &mut RegisterSet, cycle: u64);

    /// The `OC_EX_*` register set this unit drains.
    fn issue_port(&self) -> PipelineStage;

    fn is_issue_partitioned(&self) -> bool;

    fn issue_reg_id(&self) -> usize;

    /// Stallable units schedule their own writeback; others reserve a
    /// result bus slot at issue.
    fn stallable(&self) -> bool;

    fn occupied(&self) -> &OccupiedSlots;

    fn active_lanes_in_pipeline(&self) -> usize;
}

/// Shared pipeline implementation for the ALU-style units.
#[derive(Debug)]
pub struct PipelinedSimdUnit {
    pub id: usize,
    pub name: String,
    pub pipeline_reg: Vec<Option<WarpInstruction>>,
    pub issue_reg_id: usize,
    pub active_insts_in_pipeline: usize,
    pub dispatch_reg: Option<WarpInstruction>,
    pub occupied: OccupiedSlots,
}

impl std::fmt::Display for PipelinedSimdUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PipelinedSimdUnit {
    #[must_use]
    pub fn new(id: usize, name: String, depth: usize, issue_reg_id: usize) -> Self {
        let pipeline_reg = (0..depth).map(|_| None).collect();
        Self {
            id,
            name,
            pipeline_reg,
            issue_reg_id,
            active_insts_in_pipeline: 0,
            dispatch_reg: None,
            occupied: BitArray::ZERO,
        }
    }

    #[must_use]
    pub fn num_active_instr_in_pipeline(&self) -> usize {
        self.pipeline_reg.iter().flatten().count()
    }

    #[must_use]
    pub fn active_lanes_in_pipeline(&self) -> usize {
        let mut active_lanes: warp::ActiveMask = BitArray::ZERO;
        for stage in self.pipeline_reg.iter().flatten() {
            active_lanes |= stage.active_mask;
        }
        active_lanes.count_ones()
    }

    /// Free to accept an instruction of this latency: the dispatch
    /// register is empty and the initiation slot is not occupied.
    #[must_use]
    pub fn can_issue(&self, instr: &WarpInstruction) -> bool {
        self.dispatch_reg.is_none() && !self.occupied[instr.latency]
    }

    pub fn issue(&mut self, instr: WarpInstruction) {
        debug_assert!(self.dispatch_reg.is_none());
        self.occupied.set(instr.latency, true);
        register_set::move_warp(Some(instr), &mut self.dispatch_reg);
    }

    pub fn cycle(&mut self, result_port: &mut RegisterSet, cycle: u64) {
        log::debug!(
            "fu[{:03}] {:<10} cycle={:03}: {}/{} active",
            self.id,
            self.name,
            cycle,
            self.num_active_instr_in_pipeline(),
            self.pipeline_reg.len(),
        );

        // a full result port backpressures the pipeline
        if self.pipeline_reg[0].is_some() && result_port.has_free() {
            let completed = self.pipeline_reg[0].take();
            result_port.move_in_from(completed);
            debug_assert!(self.active_insts_in_pipeline > 0);
            self.active_insts_in_pipeline -= 1;
        }
        if self.active_insts_in_pipeline > 0 {
            for stage in 0..self.pipeline_reg.len() - 1 {
                if self.pipeline_reg[stage].is_none() && self.pipeline_reg[stage + 1].is_some() {
                    let current = self.pipeline_reg[stage + 1].take();
                    register_set::move_warp(current, &mut self.pipeline_reg[stage]);
                }
            }
        }
        if let Some(ref mut dispatch) = self.dispatch_reg {
            dispatch.dispatch_delay_cycles = dispatch.dispatch_delay_cycles.saturating_sub(1);
            let start_stage = dispatch.latency - dispatch.initiation_interval;
            if dispatch.dispatch_delay_cycles == 0 && self.pipeline_reg[start_stage].is_none() {
                let dispatch = self.dispatch_reg.take().unwrap();
                register_set::move_warp(Some(dispatch), &mut self.pipeline_reg[start_stage]);
                self.active_insts_in_pipeline += 1;
            }
        }

        // occupied slots shift towards completion each cycle
        self.occupied.shift_left(1);
    }
}

#[cfg(test)]
mod tests {
    use super::PipelinedSimdUnit;
    use crate::core::PipelineStage;
    use crate::instruction::WarpInstruction;
    use crate::register_set::RegisterSet;

    #[test]
    fn instruction_completes_after_latency() {
        let mut unit = PipelinedSimdUnit::new(0, "SPUnit".to_string(), 32, 0);
        let mut result_port = RegisterSet::new(PipelineStage::EX_WB, 2);

        let mut instr = WarpInstruction::test_instruction("ADD", 0);
        instr.latency = 4;
        instr.initiation_interval = 1;
        instr.dispatch_delay_cycles = instr.initiation_interval;
        assert!(unit.can_issue(&instr));
        unit.issue(instr);

        let mut completed_at = None;
        for cycle in 0..10 {
            unit.cycle(&mut result_port, cycle);
            if result_port.has_ready() && completed_at.is_none() {
                completed_at = Some(cycle);
            }
        }
        assert_eq!(completed_at, Some(4));
    }

    #[test]
    fn initiation_interval_blocks_same_latency_issue() {
        let mut unit = PipelinedSimdUnit::new(0, "SFU".to_string(), 64, 0);
        let mut result_port = RegisterSet::new(PipelineStage::EX_WB, 4);

        let mut first = WarpInstruction::test_instruction("MUFU", 0);
        first.latency = 20;
        first.initiation_interval = 4;
        first.dispatch_delay_cycles = first.initiation_interval;
        unit.issue(first);

        let mut second = WarpInstruction::test_instruction("MUFU", 8);
        second.latency = 20;
        second.initiation_interval = 4;
        second.dispatch_delay_cycles = second.initiation_interval;

        // the latency slot is taken until the occupied mask shifts past it
        assert!(!unit.can_issue(&second));
        unit.cycle(&mut result_port, 0);
        assert!(!unit.can_issue(&second));
    }
}
