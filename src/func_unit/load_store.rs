use crate::interconn::{CoreMemoryInterface, Interconnect, MemFetchInterface, Packet};
use crate::opcodes::ArchOp;
use crate::operand_collector::RegisterFileUnit;
use crate::register_set::RegisterSet;
use crate::scoreboard::Scoreboard;
use crate::warp::Warp;
use crate::{cache, config, mem_fetch};

use console::style;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// The load/store unit: front door of the L1 data cache.
///
/// Turns memory instructions into fetches, tracks outstanding loads per
/// destination register and outstanding stores per warp, and writes
/// completed loads back through the operand collector.
pub struct LoadStoreUnit<I> {
    pub core_id: usize,
    pub cluster_id: usize,
    config: Arc<config::GPU>,

    pub data_l1: Option<cache::Data>,
    dispatch_reg: Option<crate::instruction::WarpInstruction>,
    response_fifo: VecDeque<mem_fetch::MemFetch>,

    /// Outstanding fills per warp and destination register.
    pending_writes: HashMap<usize, HashMap<u32, usize>>,
    next_writeback: Option<crate::instruction::WarpInstruction>,
    writeback_queue: VecDeque<crate::instruction::WarpInstruction>,
    /// Hits complete after the configured L1 latency.
    l1_latency_queue: VecDeque<(u64, mem_fetch::MemFetch)>,

    mem_port: Arc<CoreMemoryInterface<I>>,
    fetch_allocator: mem_fetch::Allocator,

    /// Warp instructions retired by this unit.
    pub num_sim_insn: u64,
}

impl<I> std::fmt::Debug for LoadStoreUnit<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LoadStoreUnit")
            .field("core_id", &self.core_id)
            .field("dispatch_reg", &self.dispatch_reg)
            .field("response_fifo", &self.response_fifo.len())
            .finish()
    }
}

impl<I> LoadStoreUnit<I>
where
    I: Interconnect<Packet<mem_fetch::MemFetch>>,
{
    #[must_use]
    pub fn new(
        core_id: usize,
        cluster_id: usize,
        mem_port: Arc<CoreMemoryInterface<I>>,
        fetch_allocator: mem_fetch::Allocator,
        config: Arc<config::GPU>,
    ) -> Self {
        let data_l1 = config.data_cache_l1.as_ref().map(|cache_config| {
            cache::Data::new(
                format!("core-{cluster_id}-{core_id}-L1D"),
                core_id,
                cache_config.clone(),
                fetch_allocator.clone(),
                mem_fetch::Status::IN_L1D_MISS_QUEUE,
                mem_fetch::access::Kind::L1_WRBK_ACC,
                mem_fetch::access::Kind::L1_WR_ALLOC_R,
            )
        });
        Self {
            core_id,
            cluster_id,
            config,
            data_l1,
            dispatch_reg: None,
            response_fifo: VecDeque::new(),
            pending_writes: HashMap::new(),
            next_writeback: None,
            writeback_queue: VecDeque::new(),
            l1_latency_queue: VecDeque::new(),
            mem_port,
            fetch_allocator,
            num_sim_insn: 0,
        }
    }

    #[must_use]
    pub fn response_buffer_full(&self) -> bool {
        self.response_fifo.len() >= self.config.num_ldst_response_buffer_size
    }

    /// Accept a returning fetch from the interconnect.
    pub fn fill(&mut self, mut fetch: mem_fetch::MemFetch, time: u64) {
        debug_assert!(!self.response_buffer_full());
        fetch.set_status(mem_fetch::Status::IN_SHADER_LDST_RESPONSE_FIFO, time);
        self.response_fifo.push_back(fetch);
    }

    pub fn flush(&mut self) -> usize {
        self.data_l1.as_mut().map_or(0, cache::Data::flush)
    }

    pub fn invalidate(&mut self) {
        if let Some(ref mut l1) = self.data_l1 {
            l1.invalidate();
        }
    }

    #[must_use]
    pub fn pending_writes(&self, warp_id: usize, reg: u32) -> usize {
        self.pending_writes
            .get(&warp_id)
            .and_then(|regs| regs.get(&reg))
            .copied()
            .unwrap_or(0)
    }

    pub fn cycle(
        &mut self,
        operand_collector: &mut RegisterFileUnit,
        scoreboard: &mut Scoreboard,
        warps: &mut [Warp],
        issue_reg: &mut RegisterSet,
        cycle: u64,
    ) {
        self.writeback_cycle(operand_collector, scoreboard, warps);

        // hits whose latency elapsed
        while self
            .l1_latency_queue
            .front()
            .is_some_and(|(ready, _)| *ready <= cycle)
        {
            let (_, fetch) = self.l1_latency_queue.pop_front().unwrap();
            self.process_load_return(fetch, cycle);
        }

        // fills that were serviced by the memory system
        while let Some(fetch) = self.data_l1.as_mut().and_then(cache::Data::next_access) {
            self.process_load_return(fetch, cycle);
        }

        // one response per cycle
        if let Some(front) = self.response_fifo.front() {
            match front.kind {
                mem_fetch::Kind::WRITE_ACK => {
                    let mut fetch = self.response_fifo.pop_front().unwrap();
                    warps[fetch.warp_id].num_outstanding_stores -= 1;
                    fetch.set_status(mem_fetch::Status::DELETED, cycle);
                }
                mem_fetch::Kind::READ_REPLY => {
                    let waiting = self
                        .data_l1
                        .as_ref()
                        .is_some_and(|l1| l1.waiting_for_fill(front));
                    let fetch = self.response_fifo.pop_front().unwrap();
                    if waiting {
                        self.data_l1.as_mut().unwrap().fill(fetch, cycle);
                    } else {
                        self.process_load_return(fetch, cycle);
                    }
                }
                mem_fetch::Kind::READ_REQUEST | mem_fetch::Kind::WRITE_REQUEST => {
                    panic!("request kind in load/store response fifo");
                }
            }
        }

        // drain the miss queue towards the interconnect
        if let Some(fetch) = self.data_l1.as_ref().and_then(cache::Data::miss_queue_front) {
            if !self.mem_port.full(fetch.size(), fetch.is_write()) {
                let fetch = self.data_l1.as_mut().unwrap().miss_queue_pop().unwrap();
                self.mem_port.push(fetch, cycle);
            }
        }

        self.memory_cycle(warps, cycle);

        if self.dispatch_reg.is_none() {
            if let Some(instr) = issue_reg.take_ready() {
                log::debug!(
                    "{}",
                    style(format!("load/store unit: dispatching {instr}")).magenta()
                );
                self.dispatch_reg = Some(instr);
            }
        }
    }

    fn writeback_cycle(
        &mut self,
        operand_collector: &mut RegisterFileUnit,
        scoreboard: &mut Scoreboard,
        warps: &mut [Warp],
    ) {
        if self.next_writeback.is_none() {
            self.next_writeback = self.writeback_queue.pop_front();
        }
        let Some(ref instr) = self.next_writeback else {
            return;
        };
        if operand_collector.writeback(instr) {
            let instr = self.next_writeback.take().unwrap();
            for reg in instr.outputs() {
                scoreboard.release(instr.warp_id, *reg);
            }
            warps[instr.warp_id].num_instr_in_pipeline -= 1;
            self.num_sim_insn += 1;
            log::debug!("load/store unit: wrote back {instr}");
        }
    }

    /// A load's data arrived (hit latency elapsed or fill returned).
    fn process_load_return(&mut self, mut fetch: mem_fetch::MemFetch, cycle: u64) {
        fetch.set_status(mem_fetch::Status::IN_SHADER_FETCHED, cycle);
        let Some(instr) = fetch.instr.take() else {
            // write-allocate read: no instruction to complete
            fetch.set_status(mem_fetch::Status::DELETED, cycle);
            return;
        };
        let warp_pending = self.pending_writes.entry(instr.warp_id).or_default();
        for reg in instr.outputs() {
            let count = warp_pending.get_mut(reg).expect("pending write tracked");
            *count -= 1;
            if *count == 0 {
                warp_pending.remove(reg);
            }
        }
        let all_done = instr
            .outputs()
            .all(|reg| !warp_pending.contains_key(reg));
        if all_done {
            self.writeback_queue.push_back(instr);
        }
        fetch.set_status(mem_fetch::Status::DELETED, cycle);
    }

    fn memory_cycle(&mut self, warps: &mut [Warp], cycle: u64) {
        if self.dispatch_reg.is_none() {
            return;
        }
        if self
            .dispatch_reg
            .as_ref()
            .is_some_and(|instr| instr.mem_access_queue.is_empty())
        {
            self.retire_dispatch_if_done(warps);
            return;
        }

        let instr_snapshot = self.dispatch_reg.as_ref().unwrap().clone();
        let access = instr_snapshot.mem_access_queue.front().unwrap().clone();
        let is_load = instr_snapshot.is_load();
        let is_store = instr_snapshot.is_store();
        let warp_id = instr_snapshot.warp_id;

        let bypass_l1 = self.data_l1.is_none()
            || (self.config.global_mem_skip_l1_data_cache
                && instr_snapshot.memory_space == Some(crate::instruction::MemorySpace::Global));

        let mut accepted = false;
        let mut ack_expected = false;
        let mut hit_latency_fetch = None;

        let fetch = self
            .fetch_allocator
            .new_fetch(access, Some(instr_snapshot.clone()), warp_id);
        if bypass_l1 {
            if !self.mem_port.full(fetch.size(), fetch.is_write()) {
                accepted = true;
                ack_expected = is_store;
                self.mem_port.push(fetch, cycle);
            }
        } else {
            let hit_fetch = fetch.clone();
            let mut events = Vec::new();
            let status = self
                .data_l1
                .as_mut()
                .unwrap()
                .access(fetch.addr(), fetch, &mut events, cycle);
            match status {
                cache::RequestStatus::HIT => {
                    accepted = true;
                    if is_load {
                        hit_latency_fetch = Some(hit_fetch);
                    }
                    ack_expected = events
                        .iter()
                        .any(|event| matches!(event, cache::Event::WriteRequestSent));
                }
                cache::RequestStatus::MISS
                | cache::RequestStatus::HIT_RESERVED
                | cache::RequestStatus::SECTOR_MISS => {
                    accepted = true;
                    ack_expected = events
                        .iter()
                        .any(|event| matches!(event, cache::Event::WriteRequestSent));
                }
                cache::RequestStatus::RESERVATION_FAIL => {
                    // the instruction stalls and retries next cycle
                    log::debug!("load/store unit: reservation failure, retrying next cycle");
                }
                cache::RequestStatus::MSHR_HIT => {
                    unreachable!("MSHR_HIT is not an access status")
                }
            }
        }

        if accepted {
            self.dispatch_reg
                .as_mut()
                .unwrap()
                .mem_access_queue
                .pop_front();
            if is_load {
                self.track_pending_load(&instr_snapshot);
                if let Some(hit_fetch) = hit_latency_fetch {
                    let latency = self.config.l1_latency as u64;
                    self.l1_latency_queue.push_back((cycle + latency, hit_fetch));
                }
            }
            if is_store && ack_expected {
                warps[warp_id].num_outstanding_stores += 1;
            }
            // a store or barrier finishes once its last access is accepted
            if self
                .dispatch_reg
                .as_ref()
                .is_some_and(|instr| instr.mem_access_queue.is_empty())
            {
                self.retire_dispatch_if_done(warps);
            }
        }
    }

    /// Memory barriers, stores and predicated-off instructions retire in
    /// the mem pipeline; loads retire through the writeback stage.
    fn retire_dispatch_if_done(&mut self, warps: &mut [Warp]) {
        let instr = self.dispatch_reg.take().unwrap();
        if instr.is_load() && instr.outputs().count() > 0 {
            // a predicated-off load generated no accesses: release its
            // registers through the regular writeback path
            let no_pending = instr
                .outputs()
                .all(|reg| self.pending_writes(instr.warp_id, *reg) == 0);
            if no_pending {
                self.writeback_queue.push_back(instr);
            }
            return;
        }
        let retires_here = instr.opcode.category == ArchOp::MEMORY_BARRIER_OP
            || instr.is_store()
            || instr.outputs().count() == 0;
        if retires_here {
            warps[instr.warp_id].num_instr_in_pipeline -= 1;
            self.num_sim_insn += 1;
        }
    }

    fn track_pending_load(&mut self, instr: &crate::instruction::WarpInstruction) {
        let warp_pending = self.pending_writes.entry(instr.warp_id).or_default();
        for reg in instr.outputs() {
            *warp_pending.entry(*reg).or_insert(0) += 1;
        }
    }

    #[must_use]
    pub fn l1_stats(&self) -> Option<&stats::Cache> {
        self.data_l1.as_ref().map(cache::Data::stats)
    }

    #[must_use]
    pub fn fetch_allocator(&self) -> &mem_fetch::Allocator {
        &self.fetch_allocator
    }
}
