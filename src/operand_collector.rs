use crate::core::PipelineStage;
use crate::instruction::{WarpInstruction, MAX_REG_OPERANDS};
use crate::register_set::{self, RegisterSet};

use bitvec::{array::BitArray, BitArr};
use console::style;
use itertools::Itertools;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};

/// Compute the register file bank of a register.
///
/// Banks partition evenly among warp schedulers in sub-core mode; the
/// modulus is then taken within the scheduler's slice.
#[must_use]
pub fn register_bank(
    reg_num: u32,
    warp_id: usize,
    num_banks: usize,
    bank_warp_shift: usize,
    sub_core_model: bool,
    banks_per_scheduler: usize,
    scheduler_id: usize,
) -> usize {
    let mut bank = reg_num as usize;
    if bank_warp_shift > 0 {
        bank += warp_id;
    }
    if sub_core_model {
        let bank = (scheduler_id * banks_per_scheduler) + (bank % banks_per_scheduler);
        debug_assert!(bank < num_banks);
        bank
    } else {
        bank % num_banks
    }
}

/// A read operand to collect.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceOperand {
    pub warp_id: usize,
    /// Index of this operand within the owning instruction.
    pub operand: usize,
    pub register: u32,
    pub bank: usize,
    pub scheduler_id: usize,
    pub collector_unit_id: usize,
}

/// A write operand of a completing instruction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DestinationOperand {
    pub warp_id: usize,
    pub register: u32,
    pub bank: usize,
    pub scheduler_id: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Allocation {
    Read(SourceOperand),
    Write(DestinationOperand),
}

impl Allocation {
    #[must_use]
    pub fn is_read(&self) -> bool {
        matches!(self, Allocation::Read(_))
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Allocation::Write(_))
    }
}

pub type NotReadyMask = BitArr!(for MAX_REG_OPERANDS * 2);

#[derive(Debug, Clone)]
struct PendingInstruction {
    warp_instr: WarpInstruction,
    /// Pipeline register this instruction dispatches into once all source
    /// operands arrived.
    output_register: PipelineStage,
    src_operands: [Option<SourceOperand>; MAX_REG_OPERANDS * 2],
    not_ready: NotReadyMask,
}

/// A collector unit buffers one instruction while its source operands are
/// read from the banked register file, then dispatches it to an execution
/// pipeline register.
#[derive(Debug, Clone)]
pub struct CollectorUnit {
    pub id: usize,
    pub kind: Kind,
    pending: Option<PendingInstruction>,

    num_banks: usize,
    bank_warp_shift: usize,
    sub_core_model: bool,
    num_banks_per_scheduler: usize,
    /// With sub-core model, the only pipeline register slot this unit may
    /// dispatch into.
    pub reg_id: usize,
}

impl CollectorUnit {
    fn new(kind: Kind, id: usize) -> Self {
        Self {
            id,
            kind,
            pending: None,
            num_banks: 0,
            bank_warp_shift: 0,
            sub_core_model: false,
            num_banks_per_scheduler: 0,
            reg_id: 0,
        }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.pending.is_none()
    }

    /// The mask of operands still to be collected.
    #[must_use]
    pub fn not_ready_mask(&self) -> NotReadyMask {
        self.pending
            .as_ref()
            .map_or(BitArray::ZERO, |pending| pending.not_ready)
    }

    /// Ready for dispatch: all operands collected and the output register
    /// has a free slot.
    #[must_use]
    pub fn ready(&self, pipeline_reg: &[RegisterSet]) -> bool {
        let Some(ref pending) = self.pending else {
            return false;
        };
        let output_register = &pipeline_reg[pending.output_register as usize];
        let has_free_register = if self.sub_core_model {
            output_register.has_free_sub_core(self.reg_id)
        } else {
            output_register.has_free()
        };
        pending.not_ready.not_any() && has_free_register
    }

    /// Assign the oldest ready instruction of `input` to this unit.
    fn allocate(&mut self, input: &mut RegisterSet, output_register: PipelineStage) -> bool {
        debug_assert!(self.is_free());
        let Some(instr) = input.take_ready() else {
            return false;
        };
        log::debug!(
            "{} {instr}",
            style(format!("operand collector::allocate({:?})", self.kind)).green(),
        );

        let mut src_operands = [(); MAX_REG_OPERANDS * 2].map(|()| None);
        let mut not_ready: NotReadyMask = BitArray::ZERO;
        let scheduler_id = instr.scheduler_id.expect("issued instruction has scheduler");

        for (op, reg_num) in instr
            .src_arch_reg
            .iter()
            .enumerate()
            .filter_map(|(op, reg)| reg.map(|reg| (op, reg)))
            .unique_by(|(_, reg)| *reg)
        {
            let bank = register_bank(
                reg_num,
                instr.warp_id,
                self.num_banks,
                self.bank_warp_shift,
                self.sub_core_model,
                self.num_banks_per_scheduler,
                scheduler_id,
            );
            src_operands[op] = Some(SourceOperand {
                warp_id: instr.warp_id,
                collector_unit_id: self.id,
                operand: op,
                register: reg_num,
                bank,
                scheduler_id,
            });
            not_ready.set(op, true);
        }

        self.pending = Some(PendingInstruction {
            warp_instr: instr,
            not_ready,
            src_operands,
            output_register,
        });
        true
    }

    /// Move the collected instruction into its output pipeline register.
    pub fn dispatch(&mut self, pipeline_reg: &mut [RegisterSet]) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        debug_assert!(pending.not_ready.not_any());
        let output_register = &mut pipeline_reg[pending.output_register as usize];
        if self.sub_core_model {
            let (_, free_reg) = output_register
                .get_free_sub_core_mut(self.reg_id)
                .expect("dispatch requires free sub-core slot");
            register_set::move_warp(Some(pending.warp_instr), free_reg);
        } else {
            let (_, free_reg) = output_register.get_free_mut().expect("dispatch requires free slot");
            register_set::move_warp(Some(pending.warp_instr), free_reg);
        }
    }

    /// A bank read for operand `op` completed.
    pub fn collect_operand(&mut self, op: usize) {
        if let Some(ref mut pending) = self.pending {
            log::debug!(
                "collector unit [{}] {} collected operand {}",
                self.id,
                pending.warp_instr,
                op,
            );
            debug_assert!(pending.not_ready[op]);
            pending.not_ready.set(op, false);
        }
    }
}

/// Register file bank arbiter.
///
/// The register file is banked with a single port per bank: per cycle a
/// bank serves one read or one write, never both. Reads are matched to
/// idle banks with a wavefront allocator; writes take priority and are
/// placed by the writeback stage.
#[derive(Debug, Default)]
pub struct Arbiter {
    num_banks: usize,
    num_collectors: usize,

    /// Per bank: this cycle's winner.
    allocated_banks: Box<[Option<Allocation>]>,
    /// Per bank: queued read operands.
    queue: Box<[VecDeque<SourceOperand>]>,
    /// First collector unit to consider in the wavefront (round robin).
    last_cu: usize,
    inmatch: ndarray::Array1<Option<usize>>,
    request: ndarray::Array2<u8>,
}

impl Arbiter {
    pub fn init(&mut self, num_collectors: usize, num_banks: usize) {
        debug_assert!(num_collectors > 0);
        debug_assert!(num_banks > 0);
        self.num_collectors = num_collectors;
        self.num_banks = num_banks;
        self.inmatch = ndarray::Array1::from_shape_simple_fn(num_banks, || None);
        self.request = ndarray::Array2::zeros((num_banks, num_collectors));
        self.queue = (0..num_banks).map(|_| VecDeque::new()).collect();
        self.allocated_banks = (0..num_banks).map(|_| None).collect();
    }

    /// Queue the source operands of a freshly allocated collector unit.
    pub fn add_read_requests(&mut self, cu: &CollectorUnit) {
        let Some(ref pending) = cu.pending else {
            return;
        };
        for op in pending.src_operands.iter().flatten() {
            self.queue[op.bank].push_back(op.clone());
        }
    }

    /// Match queued reads to idle banks: at most one read per bank per
    /// cycle, at most one grant per collector unit per diagonal.
    pub fn allocate_reads(&mut self) -> SmallVec<[SourceOperand; 8]> {
        let num_inputs = self.num_banks;
        let num_outputs = self.num_collectors;

        let mut allocated: SmallVec<[SourceOperand; 8]> = SmallVec::new();

        let no_allocation = self.allocated_banks.iter().all(Option::is_none);
        let empty_queue = self.queue.iter().all(VecDeque::is_empty);
        if no_allocation && empty_queue {
            // fast path: rotate the priority anyway to stay cycle-accurate
            self.last_cu = (self.last_cu + 1) % num_outputs;
            return allocated;
        }

        let inmatch = &mut self.inmatch;
        let request = &mut self.request;
        inmatch.fill(None);
        request.fill(0);

        for bank in 0..num_inputs {
            if let Some(op) = self.queue[bank].front() {
                debug_assert!(op.collector_unit_id < num_outputs);
                request[(bank, op.collector_unit_id)] = 1;
            }
            if matches!(self.allocated_banks[bank], Some(Allocation::Write(_))) {
                // writes have priority: mark the bank matched
                inmatch[bank] = Some(usize::MAX);
            }
        }

        // wavefront allocator: walk the diagonals of the request matrix
        let square = num_inputs.max(num_outputs);
        let mut cu_priority = self.last_cu;
        for p in 0..square {
            let mut output = (cu_priority + p) % num_outputs;
            for input in 0..num_inputs {
                if inmatch[input].is_none() && request[(input, output)] != 0 {
                    // grant
                    inmatch[input] = Some(output);
                    log::trace!("granting bank {input} to collector unit {output}");
                }
                output = (output + 1) % num_outputs;
            }
        }

        // round-robin the priority diagonal
        cu_priority = (cu_priority + 1) % num_outputs;
        self.last_cu = cu_priority;

        for bank in 0..num_inputs {
            if inmatch[bank].is_some()
                && !matches!(self.allocated_banks[bank], Some(Allocation::Write(_)))
            {
                if let Some(op) = self.queue[bank].pop_front() {
                    allocated.push(op);
                }
            }
        }
        for read in &allocated {
            self.allocate_bank_for_read(read.bank, read.clone());
        }
        log::debug!("arbiter allocated {} reads ({allocated:?})", allocated.len());
        allocated
    }

    /// A bank with no allocation this cycle.
    #[must_use]
    pub fn bank_idle(&self, bank: usize) -> bool {
        self.allocated_banks[bank].is_none()
    }

    pub fn allocate_bank_for_write(&mut self, bank: usize, op: DestinationOperand) {
        debug_assert!(bank < self.num_banks);
        debug_assert!(self.bank_idle(bank), "bank allocated twice in one cycle");
        self.allocated_banks[bank] = Some(Allocation::Write(op));
    }

    pub fn allocate_bank_for_read(&mut self, bank: usize, op: SourceOperand) {
        debug_assert!(bank < self.num_banks);
        debug_assert!(self.bank_idle(bank), "bank allocated twice in one cycle");
        self.allocated_banks[bank] = Some(Allocation::Read(op));
    }

    /// Bank allocations persist only through the current cycle.
    pub fn reset_allocation(&mut self) {
        self.allocated_banks.fill(None);
    }
}

/// Picks a ready collector unit of its set and dispatches it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchUnit {
    last_collector_unit: usize,
    sub_core_model: bool,
    num_warp_schedulers: usize,
    pub kind: Kind,
    pub id: usize,
}

impl DispatchUnit {
    #[must_use]
    pub fn new(kind: Kind, id: usize) -> Self {
        Self {
            kind,
            id,
            last_collector_unit: 0,
            sub_core_model: false,
            num_warp_schedulers: 0,
        }
    }

    pub fn init(&mut self, sub_core_model: bool, num_warp_schedulers: usize) {
        self.sub_core_model = sub_core_model;
        self.num_warp_schedulers = num_warp_schedulers;
    }

    /// Round-robin over the set's collector units for one in ready state.
    ///
    /// With sub-core enabled the rotation starts with the next collector
    /// unit assigned to a different sub-core than the one that dispatched
    /// last.
    pub fn find_ready(
        &mut self,
        collector_units: &[CollectorUnit],
        set_collector_unit_ids: &[usize],
        pipeline_reg: &[RegisterSet],
    ) -> Option<usize> {
        let num_collector_units = set_collector_unit_ids.len();
        let round_robin_increment = if self.sub_core_model {
            let cus_per_scheduler = num_collector_units / self.num_warp_schedulers;
            cus_per_scheduler - (self.last_collector_unit % cus_per_scheduler)
        } else {
            1
        };

        for i in 0..num_collector_units {
            let i = (self.last_collector_unit + i + round_robin_increment) % num_collector_units;
            let collector_unit_id = set_collector_unit_ids[i];
            let collector_unit = &collector_units[collector_unit_id];
            debug_assert_eq!(collector_unit_id, collector_unit.id);
            if collector_unit.ready(pipeline_reg) {
                self.last_collector_unit = i;
                log::debug!(
                    "dispatch unit {:?}[{}]: chose collector unit {collector_unit_id}",
                    self.kind,
                    self.id,
                );
                return Some(collector_unit_id);
            }
        }
        None
    }
}

/// An input port: pipeline registers feeding collector sets.
#[derive(Debug, Clone)]
pub struct InputPort {
    pub in_ports: Vec<PipelineStage>,
    pub out_ports: Vec<PipelineStage>,
    pub collector_unit_kinds: Vec<Kind>,
}

impl InputPort {
    #[must_use]
    pub fn new(
        in_ports: Vec<PipelineStage>,
        out_ports: Vec<PipelineStage>,
        collector_unit_kinds: Vec<Kind>,
    ) -> Self {
        debug_assert_eq!(in_ports.len(), out_ports.len());
        debug_assert!(!collector_unit_kinds.is_empty());
        Self {
            in_ports,
            out_ports,
            collector_unit_kinds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    SP_CUS,
    INT_CUS,
    SFU_CUS,
    MEM_CUS,
    GEN_CUS,
}

pub type CuSets = HashMap<Kind, Vec<usize>>;

/// Operand collector register file unit.
#[derive(Debug)]
pub struct RegisterFileUnit {
    pub num_banks: usize,
    pub bank_warp_shift: usize,
    pub sub_core_model: bool,
    pub num_banks_per_scheduler: usize,
    pub num_warp_schedulers: usize,

    pub arbiter: Arbiter,
    pub in_ports: Vec<InputPort>,
    pub collector_units: Vec<CollectorUnit>,
    pub collector_unit_sets: CuSets,
    pub dispatch_units: Vec<DispatchUnit>,
}

impl RegisterFileUnit {
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_banks: 0,
            bank_warp_shift: 0,
            sub_core_model: false,
            num_banks_per_scheduler: 0,
            num_warp_schedulers: 0,
            arbiter: Arbiter::default(),
            in_ports: Vec::new(),
            collector_units: Vec::new(),
            collector_unit_sets: CuSets::new(),
            dispatch_units: Vec::new(),
        }
    }

    /// Add `num_collector_units` collector units of `kind`, with dedicated
    /// dispatch units.
    pub fn add_cu_set(&mut self, kind: Kind, num_collector_units: usize, num_dispatch_units: usize) {
        let set = self.collector_unit_sets.entry(kind).or_default();
        for _ in 0..num_collector_units {
            let id = self.collector_units.len();
            set.push(id);
            self.collector_units.push(CollectorUnit::new(kind, id));
        }
        for id in 0..num_dispatch_units {
            self.dispatch_units.push(DispatchUnit::new(kind, id));
        }
    }

    pub fn add_port(
        &mut self,
        input: Vec<PipelineStage>,
        output: Vec<PipelineStage>,
        cu_sets: Vec<Kind>,
    ) {
        self.in_ports.push(InputPort::new(input, output, cu_sets));
    }

    pub fn init(
        &mut self,
        num_banks: usize,
        warp_size: usize,
        sub_core_model: bool,
        num_warp_schedulers: usize,
    ) {
        let num_collector_units = self.collector_units.len();

        self.num_banks = num_banks;
        self.bank_warp_shift = (warp_size as f32 + 0.5).log2() as usize;
        debug_assert!(self.bank_warp_shift == 5 || warp_size != 32);

        self.sub_core_model = sub_core_model;
        self.num_warp_schedulers = num_warp_schedulers;
        if self.sub_core_model {
            debug_assert_eq!(self.num_banks % num_warp_schedulers, 0);
            debug_assert!(
                num_warp_schedulers <= num_collector_units
                    && num_collector_units % num_warp_schedulers == 0
            );
        }
        self.num_banks_per_scheduler = self.num_banks / num_warp_schedulers;

        self.arbiter.init(num_collector_units, num_banks);
        for (cu_id, cu) in self.collector_units.iter_mut().enumerate() {
            if self.sub_core_model {
                let units_per_scheduler = num_collector_units / num_warp_schedulers;
                cu.reg_id = cu_id / units_per_scheduler;
            }
            cu.num_banks = self.num_banks;
            cu.bank_warp_shift = self.bank_warp_shift;
            cu.sub_core_model = self.sub_core_model;
            cu.num_banks_per_scheduler = self.num_banks_per_scheduler;
        }
        for dispatch_unit in &mut self.dispatch_units {
            dispatch_unit.init(self.sub_core_model, self.num_warp_schedulers);
        }
    }

    /// One operand collector cycle, in fixed phase order.
    pub fn step(&mut self, pipeline_reg: &mut [RegisterSet]) {
        log::debug!("{}", style("operand collector::step()").green());
        self.dispatch_ready_cu(pipeline_reg);
        self.allocate_reads();
        debug_assert!(!self.in_ports.is_empty());
        for port in 0..self.in_ports.len() {
            self.allocate_collector_unit(pipeline_reg, port);
        }
        self.arbiter.reset_allocation();
    }

    /// Process read requests that do not have conflicts.
    pub fn allocate_reads(&mut self) {
        let granted = self.arbiter.allocate_reads();
        for read in granted {
            let cu = &mut self.collector_units[read.collector_unit_id];
            cu.collect_operand(read.operand);
        }
    }

    /// Find a free collector unit for a ready instruction at this port.
    pub fn allocate_collector_unit(
        &mut self,
        pipeline_reg: &mut [RegisterSet],
        input_port_id: usize,
    ) {
        let port = self.in_ports[input_port_id].clone();
        for (input_stage, output_stage) in port.in_ports.iter().zip(port.out_ports.iter()) {
            let input = &mut pipeline_reg[*input_stage as usize];
            if !input.has_ready() {
                continue;
            }
            for kind in &port.collector_unit_kinds {
                let cu_set = &self.collector_unit_sets[kind];
                let (mut lower, mut upper) = (0, cu_set.len());
                if self.sub_core_model {
                    // only the collector units of the issuing scheduler
                    let (reg_id, _) = input.get_ready().unwrap();
                    let units_per_scheduler = cu_set.len() / self.num_warp_schedulers;
                    let scheduler_id = input.scheduler_id(reg_id).unwrap();
                    lower = scheduler_id * units_per_scheduler;
                    upper = lower + units_per_scheduler;
                    debug_assert!(upper <= cu_set.len());
                }
                let mut allocated = false;
                for collector_unit_id in &cu_set[lower..upper] {
                    let cu = &mut self.collector_units[*collector_unit_id];
                    if cu.is_free() {
                        allocated = cu.allocate(input, *output_stage);
                        self.arbiter.add_read_requests(&self.collector_units[*collector_unit_id]);
                        break;
                    }
                }
                if allocated {
                    break;
                }
            }
        }
    }

    /// Dispatch at most one ready collector unit per dispatch unit.
    pub fn dispatch_ready_cu(&mut self, pipeline_reg: &mut [RegisterSet]) {
        for dispatch_unit in &mut self.dispatch_units {
            let set = &self.collector_unit_sets[&dispatch_unit.kind];
            if let Some(collector_unit_id) =
                dispatch_unit.find_ready(&self.collector_units, set, pipeline_reg)
            {
                self.collector_units[collector_unit_id].dispatch(pipeline_reg);
            }
        }
    }

    /// Write back the destination registers of a completing instruction.
    ///
    /// Destinations are written atomically within one cycle: if any
    /// destination bank is busy nothing is allocated and the caller
    /// retries next cycle.
    pub fn writeback(&mut self, instr: &WarpInstruction) -> bool {
        let scheduler_id = instr.scheduler_id.unwrap_or(0);
        let banks: Vec<(usize, u32)> = instr
            .outputs()
            .map(|&reg_num| {
                let bank = register_bank(
                    reg_num,
                    instr.warp_id,
                    self.num_banks,
                    self.bank_warp_shift,
                    self.sub_core_model,
                    self.num_banks_per_scheduler,
                    scheduler_id,
                );
                (bank, reg_num)
            })
            .unique_by(|(bank, _)| *bank)
            .collect();

        if banks.iter().any(|(bank, _)| !self.arbiter.bank_idle(*bank)) {
            log::trace!("operand collector: writeback {instr} stalls on busy bank");
            return false;
        }
        for (bank, reg_num) in banks {
            self.arbiter.allocate_bank_for_write(
                bank,
                DestinationOperand {
                    warp_id: instr.warp_id,
                    register: reg_num,
                    scheduler_id,
                    bank,
                },
            );
        }
        true
    }
}

impl Default for RegisterFileUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{register_bank, DestinationOperand, Kind, RegisterFileUnit};
    use crate::core::PipelineStage;
    use crate::instruction::WarpInstruction;
    use crate::register_set::RegisterSet;

    fn pipeline_registers() -> Vec<RegisterSet> {
        PipelineStage::ALL
            .iter()
            .map(|stage| RegisterSet::new(*stage, 2))
            .collect()
    }

    fn operand_collector() -> RegisterFileUnit {
        let mut rfu = RegisterFileUnit::new();
        rfu.add_cu_set(Kind::SP_CUS, 4, 1);
        rfu.add_port(
            vec![PipelineStage::ID_OC_SP],
            vec![PipelineStage::OC_EX_SP],
            vec![Kind::SP_CUS],
        );
        rfu.init(16, 32, false, 2);
        rfu
    }

    fn issued_instruction(warp_id: usize, srcs: &[u32], dest: u32, uid: u64) -> WarpInstruction {
        let mut instr = WarpInstruction::test_instruction("ADD", 0);
        instr.uid = uid;
        instr.warp_id = warp_id;
        instr.scheduler_id = Some(0);
        for (slot, reg) in instr.src_arch_reg.iter_mut().zip(srcs) {
            *slot = Some(*reg);
        }
        instr.dest_arch_reg[0] = Some(dest);
        instr
    }

    #[test]
    fn bank_function_partitions_per_scheduler() {
        // without sub-core: plain modulus (warp shift folds in the warp id)
        assert_eq!(register_bank(3, 0, 16, 5, false, 8, 0), 3);
        assert_eq!(register_bank(19, 0, 16, 5, false, 8, 0), 3);
        assert_eq!(register_bank(3, 1, 16, 5, false, 8, 0), 4);

        // sub-core: scheduler 1 owns banks 8..16
        assert_eq!(register_bank(3, 0, 16, 5, true, 8, 1), 11);
        assert!(register_bank(19, 0, 16, 5, true, 8, 1) >= 8);
    }

    #[test]
    fn instruction_flows_to_execution_register() {
        let mut rfu = operand_collector();
        let mut pipeline_reg = pipeline_registers();

        let instr = issued_instruction(0, &[2, 3], 1, 1);
        pipeline_reg[PipelineStage::ID_OC_SP as usize].regs[0] = Some(instr);

        // cycle 1: collector unit allocated, reads queued
        rfu.step(&mut pipeline_reg);
        assert!(pipeline_reg[PipelineStage::ID_OC_SP as usize].regs[0].is_none());
        let busy: Vec<_> = rfu.collector_units.iter().filter(|cu| !cu.is_free()).collect();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].not_ready_mask().count_ones(), 2);

        // cycle 2: both reads granted (different banks)
        rfu.step(&mut pipeline_reg);
        let busy: Vec<_> = rfu.collector_units.iter().filter(|cu| !cu.is_free()).collect();
        assert_eq!(busy[0].not_ready_mask().count_ones(), 0);

        // cycle 3: dispatched into OC_EX_SP
        rfu.step(&mut pipeline_reg);
        assert!(rfu.collector_units.iter().all(super::CollectorUnit::is_free));
        assert!(pipeline_reg[PipelineStage::OC_EX_SP as usize].has_ready());
    }

    #[test]
    fn same_bank_operands_take_two_cycles() {
        let mut rfu = operand_collector();
        let mut pipeline_reg = pipeline_registers();

        // r2 and r18 map to the same bank (16 banks)
        let instr = issued_instruction(0, &[2, 18], 1, 1);
        pipeline_reg[PipelineStage::ID_OC_SP as usize].regs[0] = Some(instr);

        rfu.step(&mut pipeline_reg);
        let cu = rfu.collector_units.iter().find(|cu| !cu.is_free()).unwrap();
        assert_eq!(cu.not_ready_mask().count_ones(), 2);

        // one bank, one read per cycle
        rfu.step(&mut pipeline_reg);
        let cu = rfu.collector_units.iter().find(|cu| !cu.is_free()).unwrap();
        assert_eq!(cu.not_ready_mask().count_ones(), 1);

        rfu.step(&mut pipeline_reg);
        let cu = rfu.collector_units.iter().find(|cu| !cu.is_free()).unwrap();
        assert_eq!(cu.not_ready_mask().count_ones(), 0);
    }

    #[test]
    fn write_beats_read_on_the_same_bank() {
        let mut rfu = operand_collector();
        let mut pipeline_reg = pipeline_registers();

        // queue a read for r2 of warp 0
        let instr = issued_instruction(0, &[2], 1, 1);
        pipeline_reg[PipelineStage::ID_OC_SP as usize].regs[0] = Some(instr);
        rfu.step(&mut pipeline_reg);

        // writeback allocates the same bank before reads are matched
        let bank = register_bank(2, 0, 16, 5, false, 8, 0);
        rfu.arbiter.allocate_bank_for_write(
            bank,
            DestinationOperand {
                warp_id: 0,
                register: 2,
                bank,
                scheduler_id: 0,
            },
        );
        let granted = rfu.arbiter.allocate_reads();
        assert!(granted.is_empty(), "write has priority over the queued read");

        // next cycle (allocation reset) the read goes through
        rfu.arbiter.reset_allocation();
        let granted = rfu.arbiter.allocate_reads();
        assert_eq!(granted.len(), 1);
    }

    #[test]
    fn writeback_is_all_or_nothing() {
        let mut rfu = operand_collector();

        let mut instr = issued_instruction(0, &[], 1, 1);
        instr.dest_arch_reg[1] = Some(17);
        // bank(1) busy: neither r1 nor r17 gets allocated
        let bank = register_bank(1, 0, 16, 5, false, 8, 0);
        rfu.arbiter.allocate_bank_for_write(
            bank,
            DestinationOperand {
                warp_id: 9,
                register: 99,
                bank,
                scheduler_id: 0,
            },
        );
        assert!(!rfu.writeback(&instr));

        rfu.arbiter.reset_allocation();
        assert!(rfu.writeback(&instr));
    }
}
