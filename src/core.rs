use crate::barrier::BarrierSet;
use crate::func_unit::{self as fu, SimdFunctionUnit};
use crate::instruction::WarpInstruction;
use crate::interconn::{CoreMemoryInterface, Interconnect, MemFetchInterface, Packet};
use crate::kernel::Kernel;
use crate::operand_collector::{self as opcoll, RegisterFileUnit};
use crate::register_set::RegisterSet;
use crate::scheduler::{self as sched, SchedulerUnit};
use crate::scoreboard::Scoreboard;
use crate::warp::Warp;
use crate::{cache, config, mem_fetch, opcodes::ArchOp};

use bitvec::{array::BitArray, BitArr};
use console::style;
use std::sync::Arc;

/// Simulated base address of program text.
pub const PROGRAM_MEM_START: crate::address = 0xF000_0000;

pub const MAX_WARPS_PER_CORE: usize = 64;
pub type WarpMask = BitArr!(for MAX_WARPS_PER_CORE);

/// Pipeline register stages between the front end, the operand collector
/// and the execution units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum PipelineStage {
    ID_OC_SP = 0,
    ID_OC_INT = 1,
    ID_OC_SFU = 2,
    ID_OC_MEM = 3,
    OC_EX_SP = 4,
    OC_EX_INT = 5,
    OC_EX_SFU = 6,
    OC_EX_MEM = 7,
    EX_WB = 8,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 9] = [
        PipelineStage::ID_OC_SP,
        PipelineStage::ID_OC_INT,
        PipelineStage::ID_OC_SFU,
        PipelineStage::ID_OC_MEM,
        PipelineStage::OC_EX_SP,
        PipelineStage::OC_EX_INT,
        PipelineStage::OC_EX_SFU,
        PipelineStage::OC_EX_MEM,
        PipelineStage::EX_WB,
    ];
}

/// Issue interface the schedulers drive.
pub trait WarpIssuer {
    fn has_free_register(&self, stage: PipelineStage, scheduler_id: usize) -> bool;

    fn issue_warp(
        &mut self,
        stage: PipelineStage,
        warp: &mut Warp,
        instr: WarpInstruction,
        scheduler_id: usize,
    ) -> bool;

    fn warp_waiting_at_barrier(&self, warp_id: usize) -> bool;

    fn scoreboard_collision(&self, warp_id: usize, instr: &WarpInstruction) -> bool;
}

/// Mutable view over the core state the schedulers issue into.
pub struct CoreIssuer<'a> {
    pub config: &'a Arc<config::GPU>,
    pub pipeline_reg: &'a mut [RegisterSet],
    pub scoreboard: &'a mut Scoreboard,
    pub barriers: &'a mut BarrierSet,
    pub warp_instruction_next_uid: &'a mut u64,
    pub cycle: u64,
}

impl WarpIssuer for CoreIssuer<'_> {
    fn has_free_register(&self, stage: PipelineStage, scheduler_id: usize) -> bool {
        let stage_reg = &self.pipeline_reg[stage as usize];
        if self.config.sub_core_model {
            stage_reg.has_free_sub_core(scheduler_id)
        } else {
            stage_reg.has_free()
        }
    }

    fn warp_waiting_at_barrier(&self, warp_id: usize) -> bool {
        self.barriers.is_waiting_at_barrier(warp_id)
    }

    fn scoreboard_collision(&self, warp_id: usize, instr: &WarpInstruction) -> bool {
        self.scoreboard.has_collision(warp_id, instr)
    }

    fn issue_warp(
        &mut self,
        stage: PipelineStage,
        warp: &mut Warp,
        mut instr: WarpInstruction,
        scheduler_id: usize,
    ) -> bool {
        let stage_reg = &mut self.pipeline_reg[stage as usize];
        let free = if self.config.sub_core_model {
            stage_reg.get_free_sub_core_mut(scheduler_id)
        } else {
            stage_reg.get_free_mut()
        };
        let Some((reg_idx, free)) = free else {
            return false;
        };

        instr.uid = *self.warp_instruction_next_uid;
        *self.warp_instruction_next_uid += 1;
        instr.warp_id = warp.warp_id;
        instr.issue_cycle = Some(self.cycle);
        instr.dispatch_delay_cycles = instr.initiation_interval;
        instr.scheduler_id = Some(scheduler_id);

        log::debug!(
            "{} by scheduler {} to pipeline[{:?}][{}]",
            style(format!(
                "cycle {:03} issue {} for warp {}",
                self.cycle, instr, warp.warp_id
            ))
            .yellow(),
            scheduler_id,
            stage,
            reg_idx,
        );

        // exits complete threads at issue
        if instr.opcode.category == ArchOp::EXIT_OPS {
            for lane in 0..self.config.warp_size {
                if instr.active_mask[lane] {
                    warp.set_thread_completed(lane);
                }
            }
        }

        if instr.is_load() || instr.is_store() {
            if let Some(accesses) = instr.generate_mem_accesses() {
                for access in accesses {
                    log::trace!("generated access {access} for {instr}");
                    instr.mem_access_queue.push_back(access);
                }
            }
        }

        match instr.opcode.category {
            ArchOp::BARRIER_OP => {
                self.barriers.warp_reached_barrier(warp.block_hw_id, &instr);
            }
            ArchOp::MEMORY_BARRIER_OP => {
                warp.waiting_for_memory_barrier = true;
            }
            _ => {}
        }

        self.scoreboard.reserve_all(&instr);
        *free = Some(instr);
        true
    }
}

/// One hardware block slot of a core.
#[derive(Debug)]
struct BlockSlot {
    kernel_launch_id: u64,
    #[allow(dead_code)]
    block_id: u64,
    warps: WarpMask,
    num_active_warps: usize,
}

pub type ResultBus = BitArr!(for fu::MAX_ALU_LATENCY);

/// A streaming multiprocessor.
pub struct Core<I> {
    pub core_id: usize,
    pub cluster_id: usize,
    config: Arc<config::GPU>,

    pipeline_reg: Vec<RegisterSet>,
    pub warps: Vec<Warp>,
    schedulers: Vec<Box<dyn SchedulerUnit>>,
    scheduler_issue_priority: usize,
    pub operand_collector: RegisterFileUnit,
    functional_units: Vec<Box<dyn SimdFunctionUnit>>,
    pub load_store_unit: fu::LoadStoreUnit<I>,
    pub scoreboard: Scoreboard,
    pub barriers: BarrierSet,
    pub instr_l1_cache: Option<cache::ReadOnly>,

    instr_fetch_buffer: Option<usize>,
    last_warp_fetched: usize,
    result_busses: Vec<ResultBus>,

    block_slots: Vec<Option<BlockSlot>>,
    dynamic_warp_id: usize,
    num_active_blocks: usize,
    pub current_kernel: Option<u64>,
    /// Kernel launch ids of blocks that finished this cycle, drained by
    /// the simulator.
    pub finished_blocks: Vec<u64>,

    warp_instruction_next_uid: u64,
    /// Warp instructions retired on this core (drives the watchdog).
    pub num_sim_insn: u64,
    pub scheduler_stats: stats::scheduler::Scheduler,

    mem_port: Arc<CoreMemoryInterface<I>>,
}

impl<I> Core<I>
where
    I: Interconnect<Packet<mem_fetch::MemFetch>>,
{
    pub fn new(
        core_id: usize,
        cluster_id: usize,
        mem_port: Arc<CoreMemoryInterface<I>>,
        fetch_allocator: mem_fetch::Allocator,
        config: Arc<config::GPU>,
    ) -> Self {
        let num_fu = config.num_sp_units + config.num_int_units + config.num_sfu_units;
        let stage_width = config.num_schedulers_per_core;
        let pipeline_reg = PipelineStage::ALL
            .iter()
            .map(|stage| {
                let width = if *stage == PipelineStage::EX_WB {
                    num_fu + 2
                } else {
                    stage_width
                };
                RegisterSet::new(*stage, width)
            })
            .collect();

        let max_warps = config.max_warps_per_core();
        assert!(max_warps <= MAX_WARPS_PER_CORE);
        let warps = (0..max_warps).map(|_| Warp::default()).collect();

        let mut schedulers: Vec<Box<dyn SchedulerUnit>> = (0..config.num_schedulers_per_core)
            .map(|id| match config.scheduler {
                config::SchedulerKind::GTO => Box::new(sched::gto::Scheduler::new(
                    id,
                    core_id,
                    config.clone(),
                )) as Box<dyn SchedulerUnit>,
                config::SchedulerKind::LRR => Box::new(sched::lrr::Scheduler::new(
                    id,
                    core_id,
                    config.clone(),
                )) as Box<dyn SchedulerUnit>,
            })
            .collect();
        // warps are distributed round robin over the schedulers
        for warp_id in 0..max_warps {
            schedulers[warp_id % config.num_schedulers_per_core].add_supervised_warp(warp_id);
        }

        let mut operand_collector = RegisterFileUnit::new();
        operand_collector.add_cu_set(
            opcoll::Kind::SP_CUS,
            config.operand_collector_num_units_sp,
            config.num_sp_units,
        );
        operand_collector.add_port(
            vec![PipelineStage::ID_OC_SP],
            vec![PipelineStage::OC_EX_SP],
            vec![opcoll::Kind::SP_CUS],
        );
        if config.num_int_units > 0 {
            operand_collector.add_cu_set(
                opcoll::Kind::INT_CUS,
                config.operand_collector_num_units_int.max(1),
                config.num_int_units,
            );
            operand_collector.add_port(
                vec![PipelineStage::ID_OC_INT],
                vec![PipelineStage::OC_EX_INT],
                vec![opcoll::Kind::INT_CUS],
            );
        }
        operand_collector.add_cu_set(
            opcoll::Kind::SFU_CUS,
            config.operand_collector_num_units_sfu,
            config.num_sfu_units,
        );
        operand_collector.add_port(
            vec![PipelineStage::ID_OC_SFU],
            vec![PipelineStage::OC_EX_SFU],
            vec![opcoll::Kind::SFU_CUS],
        );
        operand_collector.add_cu_set(
            opcoll::Kind::MEM_CUS,
            config.operand_collector_num_units_mem,
            1,
        );
        operand_collector.add_port(
            vec![PipelineStage::ID_OC_MEM],
            vec![PipelineStage::OC_EX_MEM],
            vec![opcoll::Kind::MEM_CUS],
        );
        operand_collector.init(
            config.num_reg_banks,
            config.warp_size,
            config.sub_core_model,
            config.num_schedulers_per_core,
        );

        let mut functional_units: Vec<Box<dyn SimdFunctionUnit>> = Vec::new();
        for id in 0..config.num_sp_units {
            functional_units.push(Box::new(fu::SPUnit::new(id, config.max_sp_latency, id)));
        }
        for id in 0..config.num_int_units {
            functional_units.push(Box::new(fu::IntUnit::new(id, config.max_int_latency, id)));
        }
        for id in 0..config.num_sfu_units {
            functional_units.push(Box::new(fu::SFU::new(id, config.max_sfu_latency, id)));
        }

        let load_store_unit = fu::LoadStoreUnit::new(
            core_id,
            cluster_id,
            Arc::clone(&mem_port),
            fetch_allocator.clone(),
            config.clone(),
        );

        let instr_l1_cache = config.inst_cache_l1.as_ref().map(|cache_config| {
            cache::ReadOnly::new(
                format!("core-{cluster_id}-{core_id}-L1I"),
                core_id,
                cache_config.clone(),
                fetch_allocator.clone(),
                mem_fetch::Status::IN_L1I_MISS_QUEUE,
            )
        });

        let scoreboard = Scoreboard::new(core_id, max_warps);
        let barriers = BarrierSet::new(
            config.max_concurrent_blocks_per_core,
            config.max_barriers_per_block,
        );

        let result_busses = (0..num_fu + 1).map(|_| BitArray::ZERO).collect();
        let block_slots = (0..config.max_concurrent_blocks_per_core)
            .map(|_| None)
            .collect();

        Self {
            core_id,
            cluster_id,
            config,
            pipeline_reg,
            warps,
            schedulers,
            scheduler_issue_priority: 0,
            operand_collector,
            functional_units,
            load_store_unit,
            scoreboard,
            barriers,
            instr_l1_cache,
            instr_fetch_buffer: None,
            last_warp_fetched: 0,
            result_busses,
            block_slots,
            dynamic_warp_id: 0,
            num_active_blocks: 0,
            current_kernel: None,
            finished_blocks: Vec::new(),
            warp_instruction_next_uid: 0,
            num_sim_insn: 0,
            scheduler_stats: stats::scheduler::Scheduler::default(),
            mem_port,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.num_active_blocks > 0
    }

    #[must_use]
    pub fn num_active_blocks(&self) -> usize {
        self.num_active_blocks
    }

    #[must_use]
    pub fn total_sim_insn(&self) -> u64 {
        self.num_sim_insn + self.load_store_unit.num_sim_insn
    }

    #[must_use]
    pub fn ldst_response_buffer_full(&self) -> bool {
        self.load_store_unit.response_buffer_full()
    }

    /// Route a returning fetch to the instruction cache or the load/store
    /// unit.
    pub fn accept_fetch(&mut self, fetch: mem_fetch::MemFetch, cycle: u64) {
        if fetch.access_kind() == mem_fetch::access::Kind::INST_ACC_R {
            let warp_id = fetch.warp_id;
            self.warps[warp_id].has_imiss_pending = false;
            let icache = self
                .instr_l1_cache
                .as_mut()
                .expect("instruction fetch without L1I");
            icache.fill(fetch, cycle);
            // discard the serviced entries; the re-fetch hits in the cache
            while icache.next_access().is_some() {}
        } else {
            self.load_store_unit.fill(fetch, cycle);
        }
    }

    pub fn cycle(&mut self, cycle: u64) {
        if !self.is_active() {
            return;
        }
        self.writeback(cycle);
        self.execute(cycle);
        for _ in 0..self.config.reg_file_port_throughput {
            self.operand_collector.step(&mut self.pipeline_reg);
        }
        self.issue(cycle);
        for _ in 0..self.config.inst_fetch_throughput {
            self.decode(cycle);
            self.fetch(cycle);
        }
        self.complete_blocks();
    }

    /// Drain `EX_WB`: allocate write banks, release the scoreboard, retire.
    fn writeback(&mut self, cycle: u64) {
        loop {
            let Some((idx, _)) = self.pipeline_reg[PipelineStage::EX_WB as usize].get_ready()
            else {
                break;
            };
            let granted = {
                let instr = self.pipeline_reg[PipelineStage::EX_WB as usize].regs[idx]
                    .as_ref()
                    .unwrap();
                self.operand_collector.writeback(instr)
            };
            if !granted {
                break;
            }
            let instr = self.pipeline_reg[PipelineStage::EX_WB as usize].regs[idx]
                .take()
                .unwrap();
            log::debug!(
                "{}",
                style(format!("cycle {cycle:03}: writeback {instr}")).cyan()
            );
            self.scoreboard.release_all(&instr);
            self.warps[instr.warp_id].num_instr_in_pipeline -= 1;
            self.num_sim_insn += 1;
        }
    }

    /// Advance the functional units and issue from the `OC_EX_*` registers.
    fn execute(&mut self, cycle: u64) {
        for result_bus in &mut self.result_busses {
            result_bus.shift_left(1);
        }

        let (issue_regs, wb_regs) = self
            .pipeline_reg
            .split_at_mut(PipelineStage::EX_WB as usize);
        let ex_wb = &mut wb_regs[0];

        for unit in &mut self.functional_units {
            unit.cycle(ex_wb, cycle);

            let issue_reg = &mut issue_regs[unit.issue_port() as usize];
            let partition_issue = self.config.sub_core_model && unit.is_issue_partitioned();
            let ready_reg = if partition_issue {
                issue_reg.get_ready_sub_core_mut(unit.issue_reg_id())
            } else {
                issue_reg.get_ready_mut().map(|(_, reg)| reg)
            };
            let Some(ready_reg) = ready_reg else {
                continue;
            };
            if let Some(instr) = ready_reg.as_ref() {
                if unit.can_issue(instr) {
                    let schedule_wb_now = !unit.stallable();
                    let free_bus = self
                        .result_busses
                        .iter_mut()
                        .find(|bus| !bus[instr.latency]);
                    match free_bus {
                        Some(result_bus) if schedule_wb_now => {
                            debug_assert!(instr.latency < fu::MAX_ALU_LATENCY);
                            result_bus.set(instr.latency, true);
                            unit.issue(ready_reg.take().unwrap());
                        }
                        _ if !schedule_wb_now => {
                            unit.issue(ready_reg.take().unwrap());
                        }
                        _ => {
                            // stall: no free result bus for this latency
                        }
                    }
                }
            }
        }

        // the load/store unit writes back on its own port
        self.load_store_unit.cycle(
            &mut self.operand_collector,
            &mut self.scoreboard,
            &mut self.warps,
            &mut issue_regs[PipelineStage::OC_EX_MEM as usize],
            cycle,
        );
    }

    fn issue(&mut self, cycle: u64) {
        let mut issuer = CoreIssuer {
            config: &self.config,
            pipeline_reg: &mut self.pipeline_reg,
            scoreboard: &mut self.scoreboard,
            barriers: &mut self.barriers,
            warp_instruction_next_uid: &mut self.warp_instruction_next_uid,
            cycle,
        };
        let num_schedulers = self.schedulers.len();
        for i in 0..num_schedulers {
            let idx = (self.scheduler_issue_priority + i) % num_schedulers;
            self.schedulers[idx].cycle(&mut issuer, &mut self.warps, &mut self.scheduler_stats);
        }
        self.scheduler_issue_priority = (self.scheduler_issue_priority + 1) % num_schedulers;
    }

    /// Move fetched instructions from the warp's trace stream into its
    /// instruction buffer.
    fn decode(&mut self, _cycle: u64) {
        let Some(warp_id) = self.instr_fetch_buffer.take() else {
            return;
        };
        let warp = &mut self.warps[warp_id];
        for slot in 0..2 {
            let Some(instr) = warp.next_trace_inst() else {
                break;
            };
            log::trace!("decode: warp {warp_id} ibuffer[{slot}] <- {instr}");
            warp.ibuffer_fill(slot, instr);
            warp.num_instr_in_pipeline += 1;
        }
    }

    fn fetch(&mut self, cycle: u64) {
        // drain the instruction cache miss queue into the interconnect
        if let Some(icache) = self.instr_l1_cache.as_mut() {
            if let Some(fetch) = icache.miss_queue_front() {
                if !self.mem_port.full(fetch.size(), false) {
                    let fetch = icache.miss_queue_pop().unwrap();
                    self.mem_port.push(fetch, cycle);
                }
            }
        }

        if self.instr_fetch_buffer.is_some() {
            return;
        }
        let max_warps = self.warps.len();
        for i in 0..max_warps {
            let warp_id = (self.last_warp_fetched + 1 + i) % max_warps;
            let warp = &self.warps[warp_id];
            if warp.done_exit() || warp.done() || !warp.ibuffer_empty() || warp.has_imiss_pending {
                continue;
            }
            self.last_warp_fetched = warp_id;

            if self.config.perfect_inst_cache || self.instr_l1_cache.is_none() {
                self.instr_fetch_buffer = Some(warp_id);
                return;
            }

            let pc = warp.pc().unwrap() as crate::address;
            let fetch_addr = PROGRAM_MEM_START + pc;
            let fetch = self.instruction_fetch(fetch_addr, warp_id);
            let icache = self.instr_l1_cache.as_mut().unwrap();
            let mut events = Vec::new();
            let status = icache.access(fetch.addr(), fetch, &mut events, cycle);
            match status {
                cache::RequestStatus::HIT => {
                    self.instr_fetch_buffer = Some(warp_id);
                }
                cache::RequestStatus::RESERVATION_FAIL => {
                    // retry next cycle
                }
                _ => {
                    self.warps[warp_id].has_imiss_pending = true;
                }
            }
            return;
        }
    }

    fn instruction_fetch(&self, addr: crate::address, warp_id: usize) -> mem_fetch::MemFetch {
        let line_size = self
            .config
            .inst_cache_l1
            .as_ref()
            .map_or(128, |config| config.line_size);
        let aligned = addr & !u64::from(line_size - 1);
        let mut active_mask: crate::warp::ActiveMask = BitArray::ZERO;
        active_mask.fill(true);
        let access = mem_fetch::access::Builder {
            kind: mem_fetch::access::Kind::INST_ACC_R,
            addr: aligned,
            req_size_bytes: line_size,
            is_write: false,
            warp_active_mask: active_mask,
            byte_mask: BitArray::ZERO,
            sector_mask: BitArray::ZERO,
        }
        .build();
        let mut fetch = self
            .load_store_unit
            .fetch_allocator()
            .new_fetch(access, None, warp_id);
        fetch.warp_id = warp_id;
        fetch
    }

    /// Detect warps whose pipeline fully drained and retire their blocks.
    fn complete_blocks(&mut self) {
        for slot_idx in 0..self.block_slots.len() {
            let Some(slot) = self.block_slots[slot_idx].as_mut() else {
                continue;
            };
            let warp_ids: Vec<usize> = slot.warps.iter_ones().collect();
            for warp_id in warp_ids {
                let warp = &mut self.warps[warp_id];
                if !warp.done_exit() && warp.done() && warp.hardware_done() {
                    warp.done_exit = true;
                    self.barriers.warp_exited(warp_id);
                    slot.num_active_warps -= 1;
                }
            }
            if slot.num_active_warps == 0 {
                let slot = self.block_slots[slot_idx].take().unwrap();
                log::debug!(
                    "core {}: block {} of kernel {} finished",
                    self.core_id,
                    slot.block_id,
                    slot.kernel_launch_id
                );
                self.barriers.deallocate_barrier(slot_idx);
                self.finished_blocks.push(slot.kernel_launch_id);
                self.num_active_blocks -= 1;
                if self.num_active_blocks == 0 {
                    self.current_kernel = None;
                }
            }
        }
    }

    /// Can another block of `kernel` start on this core?
    #[must_use]
    pub fn can_issue_block(&self, kernel: &Kernel) -> bool {
        if let Some(current) = self.current_kernel {
            if current != kernel.launch_id() && !self.config.concurrent_kernel_sm {
                return false;
            }
        }
        self.find_free_block_slot(kernel).is_some()
    }

    fn warps_per_block(&self, kernel: &Kernel) -> usize {
        kernel
            .threads_per_block()
            .div_ceil(self.config.warp_size)
            .max(1)
    }

    fn find_free_block_slot(&self, kernel: &Kernel) -> Option<usize> {
        let warps_per_block = self.warps_per_block(kernel);
        let max_slots_by_warps = self.warps.len() / warps_per_block;
        (0..self.block_slots.len().min(max_slots_by_warps))
            .find(|slot_idx| self.block_slots[*slot_idx].is_none())
    }

    /// Bind the next block of `kernel` to this core.
    pub fn issue_block(&mut self, kernel: &mut Kernel, cycle: u64) {
        let slot_idx = self
            .find_free_block_slot(kernel)
            .expect("issue_block requires a free slot");
        let warps_per_block = self.warps_per_block(kernel);
        let base_warp = slot_idx * warps_per_block;
        let threads_per_block = kernel.threads_per_block();

        let block = kernel
            .next_block_trace(&self.config)
            .expect("kernel has another block");
        log::debug!(
            "core {}: issue block {} of kernel {} to slot {slot_idx} (warps {base_warp}..{})",
            self.core_id,
            block.block_id,
            kernel.launch_id(),
            base_warp + warps_per_block,
        );

        let mut block_warps: WarpMask = BitArray::ZERO;
        for warp_in_block in 0..warps_per_block {
            let warp_id = base_warp + warp_in_block;
            let threads_in_warp = threads_per_block
                .saturating_sub(warp_in_block * self.config.warp_size)
                .min(self.config.warp_size);
            if threads_in_warp == 0 {
                break;
            }
            let mut active_mask: crate::warp::ActiveMask = BitArray::ZERO;
            for lane in 0..threads_in_warp {
                active_mask.set(lane, true);
            }
            let mut instructions = block.warps.get(warp_in_block).cloned().unwrap_or_default();
            for instr in &mut instructions {
                instr.warp_id = warp_id;
            }
            self.warps[warp_id].init(
                warp_id,
                self.dynamic_warp_id,
                slot_idx,
                active_mask,
                kernel.launch_id(),
                instructions,
            );
            self.dynamic_warp_id += 1;
            block_warps.set(warp_id, true);
        }

        self.barriers.allocate_barrier(slot_idx, block_warps);
        self.block_slots[slot_idx] = Some(BlockSlot {
            kernel_launch_id: kernel.launch_id(),
            block_id: block.block_id,
            warps: block_warps,
            num_active_warps: block_warps.count_ones(),
        });
        self.num_active_blocks += 1;
        self.current_kernel = Some(kernel.launch_id());
        kernel.num_running_blocks += 1;
    }
}
