use crate::core::PipelineStage;
use crate::instruction::WarpInstruction;

/// A pipeline register set holding up to `size` in-flight instructions.
#[derive(Debug, Clone)]
pub struct RegisterSet {
    pub stage: PipelineStage,
    pub regs: Box<[Option<WarpInstruction>]>,
}

impl RegisterSet {
    #[must_use]
    pub fn new(stage: PipelineStage, size: usize) -> Self {
        let regs = (0..size).map(|_| None).collect();
        Self { stage, regs }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.regs.len()
    }

    #[must_use]
    pub fn has_free(&self) -> bool {
        self.regs.iter().any(Option::is_none)
    }

    /// In sub-core mode each scheduler owns exactly one slot.
    #[must_use]
    pub fn has_free_sub_core(&self, reg_id: usize) -> bool {
        self.regs.get(reg_id).is_some_and(Option::is_none)
    }

    #[must_use]
    pub fn has_ready(&self) -> bool {
        self.regs.iter().any(Option::is_some)
    }

    pub fn get_free_mut(&mut self) -> Option<(usize, &mut Option<WarpInstruction>)> {
        self.regs
            .iter_mut()
            .enumerate()
            .find(|(_, reg)| reg.is_none())
    }

    pub fn get_free_sub_core_mut(
        &mut self,
        reg_id: usize,
    ) -> Option<(usize, &mut Option<WarpInstruction>)> {
        match self.regs.get_mut(reg_id) {
            Some(reg) if reg.is_none() => Some((reg_id, reg)),
            _ => None,
        }
    }

    /// The oldest ready instruction, by unique id.
    #[must_use]
    pub fn get_ready(&self) -> Option<(usize, &WarpInstruction)> {
        self.regs
            .iter()
            .enumerate()
            .filter_map(|(idx, reg)| reg.as_ref().map(|instr| (idx, instr)))
            .min_by_key(|(_, instr)| instr.uid)
    }

    pub fn get_ready_mut(&mut self) -> Option<(usize, &mut Option<WarpInstruction>)> {
        let idx = self.get_ready().map(|(idx, _)| idx)?;
        Some((idx, &mut self.regs[idx]))
    }

    pub fn get_ready_sub_core_mut(
        &mut self,
        reg_id: usize,
    ) -> Option<&mut Option<WarpInstruction>> {
        match self.regs.get_mut(reg_id) {
            Some(reg) if reg.is_some() => Some(reg),
            _ => None,
        }
    }

    /// Take the oldest ready instruction out of the set.
    pub fn take_ready(&mut self) -> Option<WarpInstruction> {
        self.get_ready_mut().and_then(|(_, reg)| reg.take())
    }

    #[must_use]
    pub fn scheduler_id(&self, reg_id: usize) -> Option<usize> {
        self.regs.get(reg_id)?.as_ref()?.scheduler_id
    }

    pub fn move_in_from(&mut self, src: Option<WarpInstruction>) {
        let (_, free) = self.get_free_mut().unwrap();
        move_warp(src, free);
    }
}

impl std::fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let instructions = self
            .regs
            .iter()
            .map(|reg| reg.as_ref().map(std::string::ToString::to_string));
        f.debug_list().entries(instructions).finish()
    }
}

pub fn move_warp<T>(from: Option<T>, to: &mut Option<T>) {
    debug_assert!(to.is_none());
    *to = from;
}

#[cfg(test)]
mod tests {
    use super::RegisterSet;
    use crate::core::PipelineStage;
    use crate::instruction::WarpInstruction;

    #[test]
    fn ready_picks_oldest_uid() {
        let mut set = RegisterSet::new(PipelineStage::ID_OC_SP, 2);
        let mut newer = WarpInstruction::test_instruction("ADD", 8);
        newer.uid = 7;
        let mut older = WarpInstruction::test_instruction("ADD", 0);
        older.uid = 3;
        set.regs[0] = Some(newer);
        set.regs[1] = Some(older);

        let (idx, ready) = set.get_ready().unwrap();
        assert_eq!(idx, 1);
        assert_eq!(ready.uid, 3);
    }

    #[test]
    fn sub_core_slots_are_private() {
        let mut set = RegisterSet::new(PipelineStage::ID_OC_SP, 2);
        set.regs[0] = Some(WarpInstruction::test_instruction("ADD", 0));
        assert!(!set.has_free_sub_core(0));
        assert!(set.has_free_sub_core(1));
        assert!(set.get_free_sub_core_mut(0).is_none());
        assert!(set.get_free_sub_core_mut(1).is_some());
    }
}
