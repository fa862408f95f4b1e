use crate::core::PipelineStage;
use crate::func_unit as fu;
use crate::instruction::WarpInstruction;
use crate::opcodes::ArchOp;
use crate::register_set::RegisterSet;

/// Special function unit: transcendental ops at reduced throughput.
pub struct SFU {
    inner: fu::PipelinedSimdUnit,
}

impl SFU {
    #[must_use]
    pub fn new(id: usize, depth: usize, issue_reg_id: usize) -> Self {
        Self {
            inner: fu::PipelinedSimdUnit::new(id, format!("SFU[{id}]"), depth, issue_reg_id),
        }
    }
}

impl std::fmt::Display for SFU {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.inner.name)
    }
}

impl fu::SimdFunctionUnit for SFU {
    fn can_issue(&self, instr: &WarpInstruction) -> bool {
        match instr.opcode.category {
            ArchOp::SFU_OP | ArchOp::DP_OP => self.inner.can_issue(instr),
            _ => false,
        }
    }

    fn issue(&mut self, instr: WarpInstruction) {
        self.inner.issue(instr);
    }

    fn cycle(&mut self, result_port: &mut RegisterSet, cycle: u64) {
        self.inner.cycle(result_port, cycle);
    }

    fn issue_port(&self) -> PipelineStage {
        PipelineStage::OC_EX_SFU
    }

    fn is_issue_partitioned(&self) -> bool {
        true
    }

    fn issue_reg_id(&self) -> usize {
        self.inner.issue_reg_id
    }

    fn stallable(&self) -> bool {
        false
    }

    fn occupied(&self) -> &fu::OccupiedSlots {
        &self.inner.occupied
    }

    fn active_lanes_in_pipeline(&self) -> usize {
        self.inner.active_lanes_in_pipeline()
    }
}
