use crate::instruction::WarpInstruction;
use bitvec::{array::BitArray, BitArr};
use std::collections::VecDeque;

/// Number of threads per warp.
pub const WARP_SIZE: usize = 32;

/// Thread active mask.
///
/// Bit i set means thread i is active for the current instruction.
pub type ActiveMask = BitArr!(for WARP_SIZE, in u32);

const IBUFFER_SIZE: usize = 2;

/// Per-warp execution state.
#[derive(Debug)]
pub struct Warp {
    pub warp_id: usize,
    pub dynamic_warp_id: usize,
    /// Hardware block slot this warp belongs to.
    pub block_hw_id: usize,
    pub kernel_launch_id: Option<u64>,

    pub trace_pc: usize,
    pub trace_instructions: VecDeque<WarpInstruction>,
    pub active_mask: ActiveMask,

    pub done_exit: bool,
    pub num_instr_in_pipeline: usize,
    pub num_outstanding_stores: usize,
    pub num_outstanding_atomics: usize,
    pub has_imiss_pending: bool,
    pub waiting_for_memory_barrier: bool,
    pub instr_buffer: Vec<Option<WarpInstruction>>,
    pub next: usize,
}

impl Default for Warp {
    fn default() -> Self {
        Self {
            warp_id: usize::MAX,
            dynamic_warp_id: usize::MAX,
            block_hw_id: 0,
            kernel_launch_id: None,
            trace_pc: 0,
            trace_instructions: VecDeque::new(),
            active_mask: BitArray::ZERO,
            done_exit: true,
            num_instr_in_pipeline: 0,
            num_outstanding_stores: 0,
            num_outstanding_atomics: 0,
            has_imiss_pending: false,
            waiting_for_memory_barrier: false,
            instr_buffer: vec![None; IBUFFER_SIZE],
            next: 0,
        }
    }
}

impl Warp {
    pub fn init(
        &mut self,
        warp_id: usize,
        dynamic_warp_id: usize,
        block_hw_id: usize,
        active_mask: ActiveMask,
        kernel_launch_id: u64,
        trace_instructions: VecDeque<WarpInstruction>,
    ) {
        debug_assert_eq!(self.num_instr_in_pipeline, 0);
        debug_assert_eq!(self.num_outstanding_stores, 0);
        self.warp_id = warp_id;
        self.dynamic_warp_id = dynamic_warp_id;
        self.block_hw_id = block_hw_id;
        self.kernel_launch_id = Some(kernel_launch_id);
        self.trace_pc = 0;
        self.trace_instructions = trace_instructions;
        self.active_mask = active_mask;
        self.done_exit = false;
        self.has_imiss_pending = false;
        self.waiting_for_memory_barrier = false;
        self.instr_buffer.fill(None);
        self.next = 0;
    }

    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.trace_instructions.len()
    }

    #[must_use]
    pub fn current_instr(&self) -> Option<&WarpInstruction> {
        self.trace_instructions.get(self.trace_pc)
    }

    pub fn next_trace_inst(&mut self) -> Option<WarpInstruction> {
        let instr = self.trace_instructions.get(self.trace_pc)?.clone();
        self.trace_pc += 1;
        Some(instr)
    }

    #[must_use]
    pub fn pc(&self) -> Option<usize> {
        debug_assert!(self.trace_pc <= self.instruction_count());
        self.current_instr().map(|instr| instr.pc)
    }

    /// The trace stream is exhausted.
    #[must_use]
    pub fn done(&self) -> bool {
        self.trace_pc == self.instruction_count()
    }

    pub fn ibuffer_fill(&mut self, slot: usize, instr: WarpInstruction) {
        debug_assert!(slot < self.instr_buffer.len());
        self.instr_buffer[slot] = Some(instr);
        self.next = 0;
    }

    #[must_use]
    pub fn ibuffer_empty(&self) -> bool {
        self.instr_buffer.iter().all(Option::is_none)
    }

    #[must_use]
    pub fn ibuffer_peek(&self) -> Option<&WarpInstruction> {
        self.instr_buffer[self.next].as_ref()
    }

    pub fn ibuffer_take(&mut self) -> Option<WarpInstruction> {
        self.instr_buffer[self.next].take()
    }

    pub fn ibuffer_step(&mut self) {
        self.next = (self.next + 1) % IBUFFER_SIZE;
    }

    pub fn ibuffer_flush(&mut self) {
        for slot in &mut self.instr_buffer {
            if slot.take().is_some() {
                self.num_instr_in_pipeline -= 1;
            }
        }
    }

    pub fn set_thread_completed(&mut self, lane: usize) {
        self.active_mask.set(lane, false);
    }

    /// All threads have exited.
    #[must_use]
    pub fn functional_done(&self) -> bool {
        self.active_mask.not_any()
    }

    #[must_use]
    pub fn stores_done(&self) -> bool {
        self.num_outstanding_stores == 0
    }

    /// Fully drained: no live threads, stores and pipeline empty.
    #[must_use]
    pub fn hardware_done(&self) -> bool {
        self.functional_done() && self.stores_done() && self.num_instr_in_pipeline == 0
    }

    #[must_use]
    pub fn done_exit(&self) -> bool {
        self.done_exit
    }

    /// Not eligible for issue this cycle.
    #[must_use]
    pub fn waiting(&self) -> bool {
        if self.functional_done() {
            // waiting to be initialized with a block
            true
        } else if self.waiting_for_memory_barrier {
            true
        } else {
            self.num_outstanding_atomics > 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Warp;
    use crate::instruction::WarpInstruction;
    use bitvec::array::BitArray;

    #[test]
    fn ibuffer_round_robin() {
        let mut warp = Warp::default();
        warp.ibuffer_fill(0, WarpInstruction::test_instruction("ADD", 0));
        warp.ibuffer_fill(1, WarpInstruction::test_instruction("ADD", 8));
        assert_eq!(warp.ibuffer_peek().map(|i| i.pc), Some(0));
        warp.ibuffer_take();
        warp.ibuffer_step();
        assert_eq!(warp.ibuffer_peek().map(|i| i.pc), Some(8));
        warp.ibuffer_take();
        warp.ibuffer_step();
        assert!(warp.ibuffer_empty());
    }

    #[test]
    fn hardware_done_requires_drained_pipeline() {
        let mut warp = Warp::default();
        let mut mask = BitArray::ZERO;
        mask.set(0, true);
        warp.init(0, 0, 0, mask, 0, [].into());
        assert!(!warp.functional_done());
        warp.set_thread_completed(0);
        assert!(warp.functional_done());
        warp.num_outstanding_stores = 1;
        assert!(!warp.hardware_done());
        warp.num_outstanding_stores = 0;
        assert!(warp.hardware_done());
    }
}
