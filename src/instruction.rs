use crate::{
    address, config,
    mem_fetch::{self, access},
    opcodes::{self, ArchOp, Opcode},
    warp::{ActiveMask, WARP_SIZE},
};

use bitvec::array::BitArray;
use std::collections::{BTreeMap, VecDeque};

/// Maximum architectural register operands per instruction (each way).
pub const MAX_REG_OPERANDS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Global,
    Local,
    Shared,
    Constant,
    Texture,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BarrierInfo {
    pub id: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PerThreadInfo {
    pub mem_req_addr: Option<address>,
}

/// One warp-wide instruction.
///
/// Once issued out of decode, the active mask and operand set never change.
#[derive(Clone, Debug)]
pub struct WarpInstruction {
    /// Unique id, assigned at issue.
    pub uid: u64,
    pub warp_id: usize,
    pub pc: usize,
    pub opcode: Opcode,
    pub active_mask: ActiveMask,
    pub threads: Vec<PerThreadInfo>,
    pub memory_space: Option<MemorySpace>,
    pub data_size: u32,
    pub barrier: Option<BarrierInfo>,

    pub dest_arch_reg: [Option<u32>; MAX_REG_OPERANDS],
    pub src_arch_reg: [Option<u32>; MAX_REG_OPERANDS],

    pub mem_access_queue: VecDeque<access::MemAccess>,

    pub scheduler_id: Option<usize>,
    pub issue_cycle: Option<u64>,
    pub latency: usize,
    pub initiation_interval: usize,
    pub dispatch_delay_cycles: usize,
}

impl std::fmt::Display for WarpInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}[pc={},warp={}]", self.opcode, self.pc, self.warp_id)
    }
}

impl WarpInstruction {
    pub fn from_trace(
        entry: &crate::trace::TraceInstruction,
        warp_id: usize,
        active_mask: ActiveMask,
        config: &config::GPU,
    ) -> Option<Self> {
        let opcode = opcodes::lookup(&entry.opcode)?;
        let (latency, initiation_interval) = config.get_latencies(opcode.category);

        let mut dest_arch_reg = [None; MAX_REG_OPERANDS];
        for (slot, reg) in dest_arch_reg.iter_mut().zip(&entry.dest_regs) {
            *slot = Some(*reg);
        }
        let mut src_arch_reg = [None; MAX_REG_OPERANDS];
        for (slot, reg) in src_arch_reg.iter_mut().zip(&entry.src_regs) {
            *slot = Some(*reg);
        }

        let mut threads = vec![PerThreadInfo::default(); WARP_SIZE];
        let mut memory_space = None;
        if entry.mem_width > 0 {
            memory_space = Some(match opcode.category {
                ArchOp::LOAD_OP | ArchOp::STORE_OP if entry.opcode.starts_with("LDL") => {
                    MemorySpace::Local
                }
                ArchOp::LOAD_OP | ArchOp::STORE_OP if entry.opcode.starts_with("STL") => {
                    MemorySpace::Local
                }
                _ => MemorySpace::Global,
            });
            for (lane, thread) in threads.iter_mut().enumerate() {
                if active_mask[lane] {
                    let addr = entry
                        .base_addr
                        .wrapping_add_signed(entry.stride * lane as i64);
                    thread.mem_req_addr = Some(addr);
                }
            }
        }

        let barrier = (opcode.category == ArchOp::BARRIER_OP).then_some(BarrierInfo { id: 0 });

        Some(Self {
            uid: 0,
            warp_id,
            pc: entry.pc,
            opcode,
            active_mask,
            threads,
            memory_space,
            data_size: entry.mem_width,
            barrier,
            dest_arch_reg,
            src_arch_reg,
            mem_access_queue: VecDeque::new(),
            scheduler_id: None,
            issue_cycle: None,
            latency,
            initiation_interval,
            dispatch_delay_cycles: 0,
        })
    }

    pub fn inputs(&self) -> impl Iterator<Item = &u32> {
        self.src_arch_reg.iter().flatten()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &u32> {
        self.dest_arch_reg.iter().flatten()
    }

    #[must_use]
    pub fn active_thread_count(&self) -> usize {
        self.active_mask.count_ones()
    }

    #[must_use]
    pub fn is_load(&self) -> bool {
        self.opcode.category == ArchOp::LOAD_OP
    }

    #[must_use]
    pub fn is_store(&self) -> bool {
        self.opcode.category == ArchOp::STORE_OP
    }

    #[must_use]
    pub fn is_memory_instruction(&self) -> bool {
        matches!(
            self.opcode.category,
            ArchOp::LOAD_OP | ArchOp::STORE_OP | ArchOp::MEMORY_BARRIER_OP
        )
    }

    #[must_use]
    pub fn is_exit(&self) -> bool {
        self.opcode.category == ArchOp::EXIT_OPS
    }

    #[must_use]
    pub fn access_kind(&self) -> Option<access::Kind> {
        let is_write = self.is_store();
        match self.memory_space {
            Some(MemorySpace::Global) if is_write => Some(access::Kind::GLOBAL_ACC_W),
            Some(MemorySpace::Global) => Some(access::Kind::GLOBAL_ACC_R),
            Some(MemorySpace::Local) if is_write => Some(access::Kind::LOCAL_ACC_W),
            Some(MemorySpace::Local) => Some(access::Kind::LOCAL_ACC_R),
            Some(MemorySpace::Constant) => Some(access::Kind::CONST_ACC_R),
            Some(MemorySpace::Texture) => Some(access::Kind::TEXTURE_ACC_R),
            _ => None,
        }
    }

    /// Coalesce the per-thread addresses of this warp into memory accesses.
    ///
    /// Accesses are segment-aligned; a segment shrinks to halves or quarters
    /// when only part of it is touched.
    pub fn generate_mem_accesses(&mut self) -> Option<Vec<access::MemAccess>> {
        if !matches!(self.opcode.category, ArchOp::LOAD_OP | ArchOp::STORE_OP) {
            return None;
        }
        if self.active_thread_count() < 1 {
            // predicated off
            return None;
        }
        let access_kind = self.access_kind()?;
        let is_write = self.is_store();

        let segment_size: u64 = match self.data_size {
            1 => 32,
            2 => 64,
            4 | 8 | 16 => 128,
            size => panic!("invalid data size {size}"),
        };

        // segment base addr -> (active mask, touched byte addresses)
        let mut segments: BTreeMap<address, (ActiveMask, Vec<address>)> = BTreeMap::new();
        for lane in 0..WARP_SIZE {
            if !self.active_mask[lane] {
                continue;
            }
            let Some(addr) = self.threads[lane].mem_req_addr else {
                continue;
            };
            let base = addr & !(segment_size - 1);
            let entry = segments.entry(base).or_insert((BitArray::ZERO, Vec::new()));
            entry.0.set(lane, true);
            for byte in addr..addr + u64::from(self.data_size) {
                entry.1.push(byte);
            }
        }

        let mut accesses = Vec::with_capacity(segments.len());
        for (base, (mask, bytes)) in segments {
            let lower = *bytes.iter().min().unwrap();
            let upper = *bytes.iter().max().unwrap();

            // shrink the segment while all touched bytes fit in one half
            let mut addr = base;
            let mut size = segment_size;
            while size > u64::from(crate::mem_sub_partition::SECTOR_SIZE) {
                let half = size / 2;
                if upper < addr + half {
                    size = half;
                } else if lower >= addr + half {
                    addr += half;
                    size = half;
                } else {
                    break;
                }
            }

            let line_base = base & !(u64::from(crate::mem_sub_partition::MAX_MEMORY_ACCESS_SIZE) - 1);
            let mut byte_mask: mem_fetch::ByteMask = BitArray::ZERO;
            let mut sector_mask: mem_fetch::SectorMask = BitArray::ZERO;
            for byte in &bytes {
                let line_offset = (byte - line_base) as usize;
                if line_offset < byte_mask.len() {
                    byte_mask.set(line_offset, true);
                }
                let sector = (byte - line_base) / u64::from(crate::mem_sub_partition::SECTOR_SIZE);
                let sector_mask_len = sector_mask.len();
                sector_mask.set(sector as usize % sector_mask_len, true);
            }

            accesses.push(
                access::Builder {
                    kind: access_kind,
                    addr,
                    req_size_bytes: size as u32,
                    is_write,
                    warp_active_mask: mask,
                    byte_mask,
                    sector_mask,
                }
                .build(),
            );
        }
        Some(accesses)
    }
}

#[cfg(test)]
impl WarpInstruction {
    /// Bare instruction for unit tests.
    #[must_use]
    pub fn test_instruction(mnemonic: &str, pc: usize) -> Self {
        let opcode = opcodes::lookup(mnemonic).unwrap();
        let mut active_mask: ActiveMask = BitArray::ZERO;
        active_mask.fill(true);
        Self {
            uid: 0,
            warp_id: 0,
            pc,
            opcode,
            active_mask,
            threads: vec![PerThreadInfo::default(); WARP_SIZE],
            memory_space: None,
            data_size: 0,
            barrier: None,
            dest_arch_reg: [None; MAX_REG_OPERANDS],
            src_arch_reg: [None; MAX_REG_OPERANDS],
            mem_access_queue: VecDeque::new(),
            scheduler_id: None,
            issue_cycle: None,
            latency: 4,
            initiation_interval: 1,
            dispatch_delay_cycles: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MemorySpace, WarpInstruction};
    use bitvec::array::BitArray;

    fn load_with_stride(base: crate::address, stride: i64, data_size: u32) -> WarpInstruction {
        let mut instr = WarpInstruction::test_instruction("LDG", 0);
        instr.memory_space = Some(MemorySpace::Global);
        instr.data_size = data_size;
        for (lane, thread) in instr.threads.iter_mut().enumerate() {
            thread.mem_req_addr = Some(base.wrapping_add_signed(stride * lane as i64));
        }
        instr
    }

    #[test]
    fn coalesced_accesses_form_one_line() {
        let mut instr = load_with_stride(0x8000_0000, 4, 4);
        let accesses = instr.generate_mem_accesses().unwrap();
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].addr, 0x8000_0000);
        assert_eq!(accesses[0].req_size_bytes, 128);
        assert_eq!(accesses[0].warp_active_mask.count_ones(), 32);
        assert_eq!(accesses[0].sector_mask.count_ones(), 4);
    }

    #[test]
    fn narrow_access_shrinks_segment() {
        // all threads hit the same 4 bytes
        let mut instr = load_with_stride(0x8000_0000, 0, 4);
        let accesses = instr.generate_mem_accesses().unwrap();
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].req_size_bytes, 32);
        assert_eq!(accesses[0].sector_mask.count_ones(), 1);
    }

    #[test]
    fn strided_accesses_split_per_line() {
        // stride of one line: every thread touches its own 128B line
        let mut instr = load_with_stride(0x8000_0000, 128, 4);
        let accesses = instr.generate_mem_accesses().unwrap();
        assert_eq!(accesses.len(), 32);
        assert!(accesses.iter().all(|access| access.req_size_bytes == 32));
    }

    #[test]
    fn inactive_threads_generate_nothing() {
        let mut instr = load_with_stride(0x8000_0000, 4, 4);
        instr.active_mask = BitArray::ZERO;
        assert!(instr.generate_mem_accesses().is_none());
    }
}
