use crate::instruction::WarpInstruction;
use itertools::Itertools;
use std::collections::HashSet;

/// Tracks registers with pending writes per warp.
///
/// Blocks issue on WAW and RAW hazards; WAR cannot occur with in-order
/// issue.
#[derive(Debug)]
pub struct Scoreboard {
    pub core_id: usize,
    warp_registers: Box<[HashSet<u32>]>,
}

impl Scoreboard {
    #[must_use]
    pub fn new(core_id: usize, max_warps: usize) -> Self {
        let warp_registers = (0..max_warps).map(|_| HashSet::new()).collect();
        Self {
            core_id,
            warp_registers,
        }
    }

    #[must_use]
    pub fn has_collision(&self, warp_id: usize, instr: &WarpInstruction) -> bool {
        let Some(reserved) = self.warp_registers.get(warp_id) else {
            return false;
        };
        if reserved.is_empty() {
            return false;
        }
        log::trace!(
            "scoreboard: warp {} reserved registers: {:?}",
            warp_id,
            reserved.iter().sorted().collect::<Vec<_>>(),
        );
        instr
            .inputs()
            .chain(instr.outputs())
            .any(|reg| reserved.contains(reg))
    }

    #[must_use]
    pub fn pending_writes(&self, warp_id: usize) -> &HashSet<u32> {
        &self.warp_registers[warp_id]
    }

    pub fn reserve(&mut self, warp_id: usize, reg_num: u32) {
        let registers = &mut self.warp_registers[warp_id];
        assert!(
            !registers.contains(&reg_num),
            "core {}: warp {} reserves already reserved register {}",
            self.core_id,
            warp_id,
            reg_num
        );
        registers.insert(reg_num);
    }

    pub fn reserve_all(&mut self, instr: &WarpInstruction) {
        let outputs: Vec<u32> = instr.outputs().copied().collect();
        for reg in outputs {
            self.reserve(instr.warp_id, reg);
        }
    }

    pub fn release(&mut self, warp_id: usize, reg_num: u32) {
        if self.warp_registers[warp_id].remove(&reg_num) {
            log::trace!("scoreboard: warp {} releases register {}", warp_id, reg_num);
        }
    }

    pub fn release_all(&mut self, instr: &WarpInstruction) {
        let outputs: Vec<u32> = instr.outputs().copied().collect();
        for reg in outputs {
            self.release(instr.warp_id, reg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Scoreboard;
    use crate::instruction::WarpInstruction;

    #[test]
    fn raw_and_waw_hazards_collide() {
        let mut scoreboard = Scoreboard::new(0, 4);
        let mut writer = WarpInstruction::test_instruction("ADD", 0);
        writer.dest_arch_reg[0] = Some(1);
        writer.src_arch_reg[0] = Some(2);
        scoreboard.reserve_all(&writer);

        // RAW: read of r1
        let mut reader = WarpInstruction::test_instruction("ADD", 8);
        reader.dest_arch_reg[0] = Some(3);
        reader.src_arch_reg[0] = Some(1);
        assert!(scoreboard.has_collision(0, &reader));

        // WAW: write of r1
        let mut other_writer = WarpInstruction::test_instruction("ADD", 16);
        other_writer.dest_arch_reg[0] = Some(1);
        assert!(scoreboard.has_collision(0, &other_writer));

        // different warp is unaffected
        assert!(!scoreboard.has_collision(1, &reader));

        scoreboard.release_all(&writer);
        assert!(!scoreboard.has_collision(0, &reader));
    }
}
