use crate::core::WarpMask;
use crate::instruction::WarpInstruction;
use bitvec::array::BitArray;
use std::collections::HashMap;

/// Tracks `bar.sync` style barriers per hardware block.
///
/// Warps block when they reach a barrier; the whole group is released in
/// the cycle all active warps of the block have arrived.
#[derive(Debug)]
pub struct BarrierSet {
    max_blocks_per_core: usize,
    max_barriers_per_block: usize,
    /// Warps of each active block.
    warps_per_block: HashMap<usize, WarpMask>,
    bar_id_to_warps: Box<[WarpMask]>,
    active_warps: WarpMask,
    warps_at_barrier: WarpMask,
}

impl BarrierSet {
    #[must_use]
    pub fn new(max_blocks_per_core: usize, max_barriers_per_block: usize) -> Self {
        Self {
            max_blocks_per_core,
            max_barriers_per_block,
            warps_per_block: HashMap::new(),
            bar_id_to_warps: vec![BitArray::ZERO; max_barriers_per_block].into_boxed_slice(),
            active_warps: BitArray::ZERO,
            warps_at_barrier: BitArray::ZERO,
        }
    }

    #[must_use]
    pub fn is_waiting_at_barrier(&self, warp_id: usize) -> bool {
        self.warps_at_barrier[warp_id]
    }

    pub fn allocate_barrier(&mut self, block_hw_id: usize, warps: WarpMask) {
        assert!(block_hw_id < self.max_blocks_per_core);
        assert!(
            !self.warps_per_block.contains_key(&block_hw_id),
            "block should not already be active"
        );
        self.warps_per_block.insert(block_hw_id, warps);
        assert!(self.warps_per_block.len() <= self.max_blocks_per_core);

        self.active_warps |= warps;
        self.warps_at_barrier &= !warps;
        for bar_id in 0..self.max_barriers_per_block {
            self.bar_id_to_warps[bar_id] &= !warps;
        }
    }

    /// Called once the block completes.
    pub fn deallocate_barrier(&mut self, block_hw_id: usize) {
        let Some(warps_in_block) = self.warps_per_block.remove(&block_hw_id) else {
            return;
        };
        let at_barrier = warps_in_block & self.warps_at_barrier;
        assert!(!at_barrier.any(), "no warps stuck at barrier");
        let active = warps_in_block & self.active_warps;
        assert!(!active.any(), "no warps in block are still running");

        self.active_warps &= !warps_in_block;
        self.warps_at_barrier &= !warps_in_block;
        for bar_id in 0..self.max_barriers_per_block {
            self.bar_id_to_warps[bar_id] &= !warps_in_block;
        }
    }

    /// Warp exited and may unblock its block's barrier.
    pub fn warp_exited(&mut self, warp_id: usize) {
        self.active_warps.set(warp_id, false);

        let Some(warps_in_block) = self
            .warps_per_block
            .values()
            .find(|warps| warps[warp_id])
            .copied()
        else {
            return;
        };
        let active = warps_in_block & self.active_warps;

        for bar_id in 0..self.max_barriers_per_block {
            let at_barrier = warps_in_block & self.bar_id_to_warps[bar_id];
            if at_barrier == active && active.any() {
                // all remaining warps arrived, release them
                self.bar_id_to_warps[bar_id] &= !at_barrier;
                self.warps_at_barrier &= !at_barrier;
            }
        }
    }

    /// Warp hit a barrier instruction.
    pub fn warp_reached_barrier(&mut self, block_hw_id: usize, instr: &WarpInstruction) {
        let warps_in_block = self
            .warps_per_block
            .get(&block_hw_id)
            .copied()
            .expect("block not found in barrier set");
        assert!(warps_in_block[instr.warp_id], "warp is in the block");
        let bar = instr.barrier.expect("bar instruction has barrier info");

        self.bar_id_to_warps[bar.id].set(instr.warp_id, true);
        self.warps_at_barrier.set(instr.warp_id, true);

        let at_barrier = warps_in_block & self.bar_id_to_warps[bar.id];
        let active = warps_in_block & self.active_warps;
        if at_barrier == active {
            // all warps arrived, release waiting warps
            self.bar_id_to_warps[bar.id] &= !at_barrier;
            self.warps_at_barrier &= !at_barrier;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BarrierSet;
    use crate::instruction::WarpInstruction;
    use bitvec::array::BitArray;

    #[test]
    fn barrier_releases_when_all_warps_arrive() {
        let mut barriers = BarrierSet::new(8, 16);
        let mut warps: crate::core::WarpMask = BitArray::ZERO;
        warps.set(0, true);
        warps.set(1, true);
        barriers.allocate_barrier(0, warps);

        let mut bar = WarpInstruction::test_instruction("BAR", 0);
        bar.barrier = Some(crate::instruction::BarrierInfo { id: 0 });

        bar.warp_id = 0;
        barriers.warp_reached_barrier(0, &bar);
        assert!(barriers.is_waiting_at_barrier(0));
        assert!(!barriers.is_waiting_at_barrier(1));

        bar.warp_id = 1;
        barriers.warp_reached_barrier(0, &bar);
        // both arrived: released together
        assert!(!barriers.is_waiting_at_barrier(0));
        assert!(!barriers.is_waiting_at_barrier(1));
    }

    #[test]
    fn exited_warp_does_not_block_release() {
        let mut barriers = BarrierSet::new(8, 16);
        let mut warps: crate::core::WarpMask = BitArray::ZERO;
        warps.set(0, true);
        warps.set(1, true);
        barriers.allocate_barrier(0, warps);

        let mut bar = WarpInstruction::test_instruction("BAR", 0);
        bar.barrier = Some(crate::instruction::BarrierInfo { id: 0 });
        bar.warp_id = 0;
        barriers.warp_reached_barrier(0, &bar);
        assert!(barriers.is_waiting_at_barrier(0));

        // warp 1 exits instead of reaching the barrier
        barriers.warp_exited(1);
        assert!(!barriers.is_waiting_at_barrier(0));
    }
}
