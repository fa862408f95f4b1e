use crate::core::Core;
use crate::deadlock::Watchdog;
use crate::interconn::{CoreMemoryInterface, Interconnect, Packet};
use crate::kernel::{Kernel, KernelManager};
use crate::mem_partition_unit::MemPartitionUnit;
use crate::mem_sub_partition::{MemSubPartition, SECTOR_SIZE};
use crate::streams::StreamManager;
use crate::trace::Command;
use crate::{config, mcu, mem_fetch};

use color_eyre::eyre;
use console::style;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Ejection buffer between the interconnect and a cluster's cores.
const CLUSTER_EJECTION_BUFFER_SIZE: usize = 8;

/// The simulated GPU: cores, partitions and the command loop driver.
pub struct Simulator<I> {
    pub config: Arc<config::GPU>,
    interconn: Arc<I>,

    cores: Vec<Core<I>>,
    mem_partition_units: Vec<MemPartitionUnit>,
    mem_sub_partitions: Vec<MemSubPartition>,
    cluster_response_fifo: Vec<VecDeque<mem_fetch::MemFetch>>,

    kernel_manager: KernelManager,
    stream_manager: StreamManager,
    mem_controller: mcu::MemoryControllerUnit,
    icnt_stats: Arc<Mutex<stats::Interconn>>,

    pub stats: stats::Stats,
    pub cycle: u64,
    block_issue_next_core: usize,
    traces_dir: PathBuf,
}

impl<I> Simulator<I>
where
    I: Interconnect<Packet<mem_fetch::MemFetch>>,
{
    pub fn new(interconn: Arc<I>, config: Arc<config::GPU>, traces_dir: impl Into<PathBuf>) -> Self {
        let mem_controller = mcu::MemoryControllerUnit::new(&config);
        let icnt_stats = Arc::new(Mutex::new(stats::Interconn::default()));

        let mut cores = Vec::with_capacity(config.total_cores());
        for core_id in 0..config.total_cores() {
            let cluster_id = config.global_core_id_to_cluster_id(core_id);
            let mem_port = Arc::new(CoreMemoryInterface {
                cluster_id,
                config: config.clone(),
                interconn: Arc::clone(&interconn),
                stats: Arc::clone(&icnt_stats),
            });
            let fetch_allocator = mem_fetch::Allocator {
                core_id: Some(core_id),
                cluster_id: Some(cluster_id),
                mem_controller: mem_controller.clone(),
            };
            cores.push(Core::new(
                core_id,
                cluster_id,
                mem_port,
                fetch_allocator,
                config.clone(),
            ));
        }

        let mem_partition_units = (0..config.num_memory_controllers)
            .map(|id| MemPartitionUnit::new(id, config.clone()))
            .collect();
        let mem_sub_partitions = (0..config.total_sub_partitions())
            .map(|id| {
                let partition_id = id / config.num_sub_partitions_per_memory_controller;
                let fetch_allocator = mem_fetch::Allocator {
                    core_id: None,
                    cluster_id: None,
                    mem_controller: mem_controller.clone(),
                };
                MemSubPartition::new(id, partition_id, fetch_allocator, config.clone())
            })
            .collect();

        let cluster_response_fifo = (0..config.num_simt_clusters)
            .map(|_| VecDeque::new())
            .collect();

        let stats = stats::Stats::new(config.total_cores(), config.total_sub_partitions());

        Self {
            interconn,
            cores,
            mem_partition_units,
            mem_sub_partitions,
            cluster_response_fifo,
            kernel_manager: KernelManager::new(config.clone()),
            stream_manager: StreamManager::default(),
            mem_controller,
            icnt_stats,
            stats,
            cycle: 0,
            block_issue_next_core: 0,
            config,
            traces_dir: traces_dir.into(),
        }
    }

    /// Total warp instructions retired, across all cores.
    #[must_use]
    pub fn total_sim_insn(&self) -> u64 {
        self.cores.iter().map(Core::total_sim_insn).sum()
    }

    /// Anything in flight anywhere?
    #[must_use]
    pub fn active(&self) -> bool {
        self.cores.iter().any(Core::is_active)
            || self.mem_partition_units.iter().any(MemPartitionUnit::busy)
            || self.mem_sub_partitions.iter().any(MemSubPartition::busy)
            || self.cluster_response_fifo.iter().any(|fifo| !fifo.is_empty())
            || self.interconn.busy()
            || self.kernel_manager.more_blocks_to_run()
    }

    /// Model a host-to-device copy: populate L2 residency, no simulated
    /// cycles elapse.
    pub fn memcopy_to_gpu(&mut self, addr: crate::address, num_bytes: u64) {
        log::info!("memcopy: {num_bytes} bytes to {addr:#x}");
        if !self.config.fill_l2_on_memcopy {
            return;
        }
        let chunk = u64::from(SECTOR_SIZE);
        let mut offset = 0;
        while offset < num_bytes {
            let chunk_addr = addr + offset;
            let sub_id = self
                .mem_controller
                .to_physical_address(chunk_addr)
                .sub_partition as usize;
            self.mem_sub_partitions[sub_id].force_l2_tag_update(chunk_addr, self.cycle);
            offset += chunk;
        }
    }

    /// One simulated GPU cycle, components in fixed order.
    pub fn cycle(&mut self) {
        let cycle = self.cycle;

        // shader cores: writeback, execute, operand collector, issue,
        // front end
        for core in &mut self.cores {
            core.cycle(cycle);
        }
        for core in &mut self.cores {
            for launch_id in core.finished_blocks.drain(..) {
                self.kernel_manager.block_finished(launch_id);
            }
        }

        // responses popped this cycle are visible to the cores next cycle
        self.icnt_to_shader_cycle(cycle);

        // memory hierarchy in reverse data-flow order
        self.l2_to_icnt_cycle(cycle);
        for (unit, subs) in self.mem_partition_units.iter_mut().zip(
            self.mem_sub_partitions
                .chunks_mut(self.config.num_sub_partitions_per_memory_controller),
        ) {
            unit.simple_dram_cycle(subs, cycle);
        }
        self.icnt_to_l2_cycle(cycle);
        for sub in &mut self.mem_sub_partitions {
            sub.cache_cycle(cycle);
        }

        self.interconn.advance();
        self.issue_blocks_to_cores(cycle);
        self.cycle += 1;
    }

    /// Drain reply queues of the sub partitions into the interconnect.
    fn l2_to_icnt_cycle(&mut self, cycle: u64) {
        for sub in &mut self.mem_sub_partitions {
            let Some(front) = sub.interconn_reply_front() else {
                continue;
            };
            let dest_cluster = front.cluster_id.unwrap_or(0);
            let response_size = if front.is_write() {
                front.control_size()
            } else {
                front.size()
            };
            if !self.interconn.has_buffer(dest_cluster, response_size) {
                continue;
            }
            let mut fetch = sub.pop_interconn_reply().unwrap();
            fetch.set_status(mem_fetch::Status::IN_ICNT_TO_SHADER, cycle);
            fetch.return_cycle.get_or_insert(cycle);
            {
                let mut icnt_stats = self.icnt_stats.lock().unwrap();
                icnt_stats.packets_to_shader += 1;
                icnt_stats.flits_to_shader +=
                    u64::from(response_size.div_ceil(self.config.flit_size));
            }
            let src_node = self.config.mem_id_to_device_id(sub.id);
            self.interconn.push(
                src_node,
                dest_cluster,
                Packet { data: fetch, time: cycle },
                response_size,
            );
        }
    }

    /// Pop requests from the interconnect into the sub partitions.
    fn icnt_to_l2_cycle(&mut self, cycle: u64) {
        for sub in &mut self.mem_sub_partitions {
            let node = self.config.mem_id_to_device_id(sub.id);
            // worst case: a line-sized request split into sectors
            if sub.full(crate::mem_sub_partition::MAX_MEMORY_ACCESS_SIZE) {
                continue;
            }
            if let Some(packet) = self.interconn.pop(node) {
                let mut fetch = packet.into_inner();
                log::debug!("sub partition {}: received {fetch}", sub.id);
                fetch.set_status(mem_fetch::Status::IN_PARTITION_ICNT_TO_L2_QUEUE, cycle);
                self.stats.accesses.inc(fetch.access_kind().into(), 1);
                sub.push(fetch, cycle);
            }
        }
    }

    /// Move replies from the interconnect through the cluster ejection
    /// buffers into the cores.
    fn icnt_to_shader_cycle(&mut self, cycle: u64) {
        for cluster_id in 0..self.config.num_simt_clusters {
            // buffer -> core
            let fifo = &mut self.cluster_response_fifo[cluster_id];
            if let Some(front) = fifo.front() {
                let core_id = front.core_id.unwrap_or(cluster_id);
                let is_inst = front.access_kind() == mem_fetch::access::Kind::INST_ACC_R;
                let core = &mut self.cores[core_id];
                if is_inst || !core.ldst_response_buffer_full() {
                    let fetch = fifo.pop_front().unwrap();
                    core.accept_fetch(fetch, cycle);
                }
            }
            // interconnect -> buffer
            let fifo = &mut self.cluster_response_fifo[cluster_id];
            if fifo.len() < CLUSTER_EJECTION_BUFFER_SIZE {
                if let Some(packet) = self.interconn.pop(cluster_id) {
                    let mut fetch = packet.into_inner();
                    fetch.set_status(mem_fetch::Status::IN_CLUSTER_TO_SHADER_QUEUE, cycle);
                    fifo.push_back(fetch);
                }
            }
        }
    }

    /// Bind pending blocks of the selected kernel to cores.
    fn issue_blocks_to_cores(&mut self, cycle: u64) {
        let Some(launch_id) = self.kernel_manager.select_kernel() else {
            return;
        };
        let num_cores = self.cores.len();
        for i in 0..num_cores {
            let core_idx = (self.block_issue_next_core + i) % num_cores;
            let kernel = self.kernel_manager.get_mut(launch_id);
            if kernel.no_more_blocks_to_run() {
                break;
            }
            let core = &mut self.cores[core_idx];
            if core.can_issue_block(kernel) {
                core.issue_block(kernel, cycle);
                self.stats.sim.num_blocks += 1;
            }
        }
        self.block_issue_next_core = (self.block_issue_next_core + 1) % num_cores;
    }

    /// Run the command list to completion.
    ///
    /// Maintains the rolling window of in-flight kernels, launches them on
    /// free streams, steps the GPU and retires finished kernels.
    pub fn run(&mut self, commands: &[Command]) -> eyre::Result<()> {
        let silent = std::env::var("SILENT").unwrap_or_default().to_lowercase() == "yes";
        let cycle_cap: Option<u64> = std::env::var("CYCLES")
            .ok()
            .and_then(|cycles| cycles.parse().ok());

        let window_size = if self.config.concurrent_kernel_sm {
            self.config.max_concurrent_kernels
        } else {
            1
        };
        assert!(window_size > 0);

        let mut watchdog = Watchdog::new(self.config.deadlock_detect_cycles);
        let mut kernel_window: VecDeque<u64> = VecDeque::with_capacity(window_size);
        let mut command_idx = 0;
        let mut cap_reached = false;

        while command_idx < commands.len() || !kernel_window.is_empty() {
            // fill the window with the next commands
            while kernel_window.len() < window_size && command_idx < commands.len() {
                match &commands[command_idx] {
                    Command::MemcpyHtoD {
                        dest_device_addr,
                        num_bytes,
                    } => self.memcopy_to_gpu(*dest_device_addr, *num_bytes),
                    Command::KernelLaunch(launch) => {
                        let kernel = Kernel::from_trace(&self.traces_dir, launch)?;
                        let launch_id = self.kernel_manager.add(kernel);
                        kernel_window.push_back(launch_id);
                    }
                }
                command_idx += 1;
            }

            // launch kernels in the window whose stream is free
            for &launch_id in &kernel_window {
                let kernel = self.kernel_manager.get(launch_id);
                if kernel.launched || self.stream_manager.is_busy(kernel.stream_id()) {
                    continue;
                }
                if !self.kernel_manager.can_start_kernel() {
                    continue;
                }
                let stream_id = kernel.stream_id();
                if !silent {
                    println!(
                        "{}",
                        style(format!(
                            "launching kernel {}",
                            self.kernel_manager.get(launch_id)
                        ))
                        .green()
                    );
                }
                self.kernel_manager.try_launch_kernel(launch_id, self.cycle)?;
                self.stream_manager.reserve_stream(stream_id);
            }

            // step until a kernel finishes or the GPU drains
            let mut finished_kernel = None;
            loop {
                if !self.active() {
                    break;
                }
                self.cycle();
                self.stats.sim.cycles += 1;

                if cycle_cap.is_some_and(|cap| self.cycle >= cap) {
                    self.kernel_manager.stop_all_running_kernels();
                    cap_reached = true;
                    break;
                }

                watchdog.check(self.cycle, self.total_sim_insn(), self.active(), || {
                    self.dump_state()
                })?;

                finished_kernel = self.kernel_manager.get_finished_kernel();
                if finished_kernel.is_some() {
                    break;
                }
            }

            if let Some(launch_id) = finished_kernel {
                self.retire_kernel(launch_id, silent);
                kernel_window.retain(|&id| id != launch_id);
            } else if cap_reached {
                if !silent {
                    println!("simulation cycle cap reached, exiting");
                }
                break;
            } else if kernel_window
                .iter()
                .all(|&id| self.kernel_manager.get(id).launched)
                && !self.active()
            {
                // drain any remaining finished kernels
                while let Some(launch_id) = self.kernel_manager.get_finished_kernel() {
                    self.retire_kernel(launch_id, silent);
                    kernel_window.retain(|&id| id != launch_id);
                }
                if kernel_window.is_empty() && command_idx >= commands.len() {
                    break;
                }
            }
        }

        self.stats.sim.instructions = self.total_sim_insn();
        self.collect_stats();
        Ok(())
    }

    fn retire_kernel(&mut self, launch_id: u64, silent: bool) {
        let cycle = self.cycle;
        let kernel = self.kernel_manager.get_mut(launch_id);
        kernel.completed_cycle = cycle;
        self.stream_manager.release_stream(kernel.stream_id());
        self.stats.kernels.push(stats::Kernel {
            launch_id,
            name: kernel.name().to_string(),
            stream_id: kernel.stream_id(),
            start_cycle: kernel.start_cycle,
            completed_cycle: cycle,
            num_blocks: kernel.num_blocks() as u64,
        });
        if !silent {
            println!(
                "{}",
                style(format!(
                    "kernel {} finished at cycle {}",
                    self.kernel_manager.get(launch_id),
                    cycle
                ))
                .green()
            );
        }
    }

    /// Merge per-component counters into the stats bag.
    fn collect_stats(&mut self) {
        for core in &self.cores {
            self.stats.scheduler += core.scheduler_stats.clone();
            if let Some(l1i) = core.instr_l1_cache.as_ref() {
                *self.stats.l1i_stats.get_mut(core.core_id) = l1i.stats().clone();
            }
            if let Some(l1d) = core.load_store_unit.l1_stats() {
                *self.stats.l1d_stats.get_mut(core.core_id) = l1d.clone();
            }
        }
        for sub in &self.mem_sub_partitions {
            if let Some(l2) = sub.l2_stats() {
                *self.stats.l2d_stats.get_mut(sub.id) = l2.clone();
            }
        }
        for unit in &self.mem_partition_units {
            self.stats.dram.total_reads += unit.stats.total_reads;
            self.stats.dram.total_writes += unit.stats.total_writes;
        }
        self.stats.interconn = self.icnt_stats.lock().unwrap().clone();
    }

    /// Scheduler and queue state, dumped when the watchdog fires.
    fn dump_state(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for core in &self.cores {
            if core.is_active() {
                let _ = writeln!(
                    out,
                    "core {}: active blocks={} retired={}",
                    core.core_id,
                    core.num_active_blocks(),
                    core.total_sim_insn(),
                );
            }
        }
        for sub in &self.mem_sub_partitions {
            if sub.busy() {
                let _ = writeln!(out, "{sub:?}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    //! End-to-end scenarios over synthetic traces.

    use super::Simulator;
    use crate::interconn::SimpleInterconnect;
    use crate::{config, trace};

    use std::fmt::Write as _;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    fn traces_dir(test: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("warpsim-e2e-{}", std::process::id()))
            .join(test);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_config() -> config::GPU {
        let mut config = config::GPU::default();
        config.num_simt_clusters = 1;
        config.num_cores_per_simt_cluster = 1;
        config.num_memory_controllers = 1;
        config.num_sub_partitions_per_memory_controller = 2;
        config.dram_latency = 20;
        config.deadlock_detect_cycles = 50_000;
        config
    }

    fn kernel_header(id: u64, name: &str, grid: u32, block: u32) -> String {
        format!(
            "-kernel name = {name}\n\
             -kernel id = {id}\n\
             -grid dim = ({grid},1,1)\n\
             -block dim = ({block},1,1)\n\
             -shmem = 0\n\
             -nregs = 16\n\
             -stream id = 0\n\n"
        )
    }

    fn write_kernel(dir: &Path, id: u64, contents: &str) {
        std::fs::write(dir.join(format!("kernel-{id}.traceg")), contents).unwrap();
    }

    fn write_commands(dir: &Path, contents: &str) {
        std::fs::write(dir.join("commands.trace"), contents).unwrap();
    }

    fn run_trace(config: config::GPU, dir: &Path) -> stats::Stats {
        let config = Arc::new(config);
        let interconn = Arc::new(SimpleInterconnect::new(
            config.num_simt_clusters,
            config.total_sub_partitions(),
            Some(config.icnt_buffer_size),
        ));
        let commands = trace::parse_commands(dir.join("commands.trace")).unwrap();
        let mut sim = Simulator::new(interconn, config, dir);
        sim.run(&commands).unwrap();
        sim.stats
    }

    /// One warp executing a long chain of register ADDs. No memory
    /// traffic at all; every instruction retires.
    #[test]
    fn single_add_kernel() {
        let dir = traces_dir("single-add");
        let mut kernel = kernel_header(1, "add_chain", 1, 32);
        kernel.push_str("block = (0,0,0)\nwarp = 0\n");
        let mut pc = 0usize;
        for _ in 0..1024 {
            writeln!(kernel, "{pc:04x} ffffffff 1 R1 ADD 2 R2 R3 0").unwrap();
            pc += 8;
        }
        writeln!(kernel, "{pc:04x} ffffffff 0 EXIT 0 0").unwrap();
        write_kernel(&dir, 1, &kernel);
        write_commands(&dir, "kernel-1\n");

        let stats = run_trace(test_config(), &dir);

        assert_eq!(stats.sim.instructions, 1025);
        assert_eq!(stats.sim.num_blocks, 1);
        assert_eq!(stats.kernels.len(), 1);

        // no memory traffic
        assert_eq!(stats.l1d_stats.reduce().total_accesses(), 0);
        assert_eq!(stats.l2d_stats.reduce().total_accesses(), 0);
        assert_eq!(stats.dram.total_reads + stats.dram.total_writes, 0);
        assert_eq!(stats.interconn.flits_to_mem, 0);

        // the adds are fully dependent: one instruction in flight at a time
        assert!(stats.sim.cycles >= 1024, "cycles: {}", stats.sim.cycles);
        assert!(
            stats.sim.cycles < 40_000,
            "cycles: {} (pipeline stalled?)",
            stats.sim.cycles
        );
    }

    /// A chain of SFU square roots on independent registers. The SFU
    /// initiation interval bounds throughput; no memory fetches.
    #[test]
    fn sfu_sqrt_chain() {
        let dir = traces_dir("sfu-sqrt");
        let mut kernel = kernel_header(1, "sfu_bw", 1, 32);
        kernel.push_str("block = (0,0,0)\nwarp = 0\n");
        let mut pc = 0usize;
        let num_sqrt = 128usize;
        for i in 0..num_sqrt {
            // cycle the destination registers to avoid hazards
            let dest = 1 + (i % 8);
            writeln!(kernel, "{pc:04x} ffffffff 1 R{dest} MUFU 1 R10 0").unwrap();
            pc += 8;
        }
        writeln!(kernel, "{pc:04x} ffffffff 0 EXIT 0 0").unwrap();
        write_kernel(&dir, 1, &kernel);
        write_commands(&dir, "kernel-1\n");

        let stats = run_trace(test_config(), &dir);

        assert_eq!(stats.sim.instructions, num_sqrt as u64 + 1);
        assert_eq!(stats.l1d_stats.reduce().total_accesses(), 0);
        assert_eq!(stats.interconn.flits_to_mem, 0);

        // quarter-rate issue: at least initiation_interval cycles per sqrt
        assert!(
            stats.sim.cycles >= (num_sqrt as u64) * 4,
            "cycles: {}",
            stats.sim.cycles
        );
    }

    /// Streaming copy. Cold loads miss the L1 once per line; the L2 sees
    /// one miss and three merged sector accesses per line; every store is
    /// acknowledged.
    #[test]
    fn streaming_copy() {
        let dir = traces_dir("streaming-copy");
        let num_lines = 64u64;
        let src = 0x8000_0000u64;
        let dst = 0x9000_0000u64;

        let mut kernel = kernel_header(1, "copy", 1, 32);
        kernel.push_str("block = (0,0,0)\nwarp = 0\n");
        let mut pc = 0usize;
        for line in 0..num_lines {
            let load_addr = src + line * 128;
            let store_addr = dst + line * 128;
            writeln!(kernel, "{pc:04x} ffffffff 1 R4 LDG 1 R2 4 {load_addr:#x} 4").unwrap();
            pc += 8;
            writeln!(kernel, "{pc:04x} ffffffff 0 STG 1 R4 4 {store_addr:#x} 4").unwrap();
            pc += 8;
        }
        writeln!(kernel, "{pc:04x} ffffffff 0 EXIT 0 0").unwrap();
        write_kernel(&dir, 1, &kernel);
        write_commands(&dir, "kernel-1\n");

        let stats = run_trace(test_config(), &dir);

        assert_eq!(stats.sim.instructions, num_lines * 2 + 1);

        // cold L1: every load misses exactly once per line
        use stats::cache::{AccessStat, RequestStatus};
        use stats::mem::AccessKind;
        let l1d = stats.l1d_stats.reduce();
        let l1_read_misses = l1d
            .accesses
            .get(&(AccessKind::GLOBAL_ACC_R, AccessStat::Status(RequestStatus::MISS)))
            .copied()
            .unwrap_or(0);
        assert_eq!(l1_read_misses, num_lines);

        // L2 sectors: one line fetch, three merges per 128B line
        let l2d = stats.l2d_stats.reduce();
        let l2_read_misses = l2d
            .accesses
            .get(&(AccessKind::GLOBAL_ACC_R, AccessStat::Status(RequestStatus::MISS)))
            .copied()
            .unwrap_or(0);
        let l2_read_pending = l2d
            .accesses
            .get(&(
                AccessKind::GLOBAL_ACC_R,
                AccessStat::Status(RequestStatus::HIT_RESERVED),
            ))
            .copied()
            .unwrap_or(0);
        assert_eq!(l2_read_misses, num_lines);
        assert_eq!(l2_read_pending, num_lines * 3);

        // each line is read from DRAM exactly once
        assert_eq!(stats.dram.total_reads, num_lines);
        // writes made it to DRAM (write-through L1, no-write-allocate L2)
        assert!(stats.dram.total_writes > 0);

        // the simulation drained: every store got its WRITE_ACK
        assert!(stats.interconn.flits_to_shader > 0);
    }

    /// Two warps load the same line in back-to-back cycles. The second
    /// merges into the first's MSHR entry; one request reaches DRAM.
    #[test]
    fn mshr_merge() {
        let dir = traces_dir("mshr-merge");
        let mut kernel = kernel_header(1, "merge", 1, 64);
        kernel.push_str("block = (0,0,0)\n");
        for warp in 0..2 {
            writeln!(kernel, "warp = {warp}").unwrap();
            // both warps hit the same 32 bytes of the same line
            writeln!(kernel, "0000 ffffffff 1 R4 LDG 1 R2 4 0x80000000 0").unwrap();
            writeln!(kernel, "0008 ffffffff 0 EXIT 0 0").unwrap();
        }
        write_kernel(&dir, 1, &kernel);
        write_commands(&dir, "kernel-1\n");

        let stats = run_trace(test_config(), &dir);

        assert_eq!(stats.sim.instructions, 4);

        let l1d = stats.l1d_stats.reduce();
        assert_eq!(l1d.num_misses(), 1, "first load misses");
        assert_eq!(l1d.num_pending_hits(), 1, "second load merges");
        assert_eq!(l1d.num_mshr_hits(), 1);

        // exactly one request to DRAM
        assert_eq!(stats.dram.total_reads, 1);
    }

    /// Memcpy commands pre-populate the L2: the first kernel load hits.
    #[test]
    fn memcpy_fills_l2() {
        let dir = traces_dir("memcpy-fill");
        let mut kernel = kernel_header(1, "after_copy", 1, 32);
        kernel.push_str("block = (0,0,0)\nwarp = 0\n");
        kernel.push_str("0000 ffffffff 1 R4 LDG 1 R2 4 0x80000000 4\n");
        kernel.push_str("0008 ffffffff 0 EXIT 0 0\n");
        write_kernel(&dir, 1, &kernel);
        write_commands(&dir, "MemcpyHtoD,0x80000000,128\nkernel-1\n");

        let stats = run_trace(test_config(), &dir);

        // the L1 still misses cold, but the L2 already holds the line
        let l2d = stats.l2d_stats.reduce();
        assert_eq!(l2d.num_misses(), 0, "L2 was pre-populated by the memcpy");
        assert!(l2d.num_hits() > 0);
        assert_eq!(stats.dram.total_reads, 0);
    }

    /// Determinism: two runs over the same trace and configuration produce
    /// identical stats.
    #[test]
    fn identical_runs_are_deterministic() {
        let dir = traces_dir("determinism");
        let mut kernel = kernel_header(1, "copy", 2, 64);
        for block in 0..2 {
            writeln!(kernel, "block = ({block},0,0)").unwrap();
            for warp in 0..2 {
                writeln!(kernel, "warp = {warp}").unwrap();
                let base = 0x8000_0000u64 + (block * 2 + warp) * 0x400;
                writeln!(kernel, "0000 ffffffff 1 R4 LDG 1 R2 4 {base:#x} 4").unwrap();
                writeln!(kernel, "0008 ffffffff 1 R5 ADD 2 R4 R4 0").unwrap();
                let out = base + 0x10_0000;
                writeln!(kernel, "0010 ffffffff 0 STG 1 R5 4 {out:#x} 4").unwrap();
                writeln!(kernel, "0018 ffffffff 0 EXIT 0 0").unwrap();
            }
        }
        write_kernel(&dir, 1, &kernel);
        write_commands(&dir, "kernel-1\n");

        let first = run_trace(test_config(), &dir);
        let second = run_trace(test_config(), &dir);
        assert_eq!(first, second);
    }

    /// The LRR scheduler completes the same workload as GTO.
    #[test]
    fn lrr_scheduler_completes() {
        let dir = traces_dir("lrr");
        let mut kernel = kernel_header(1, "lrr_test", 1, 64);
        kernel.push_str("block = (0,0,0)\n");
        for warp in 0..2 {
            writeln!(kernel, "warp = {warp}").unwrap();
            let mut pc = 0usize;
            for _ in 0..16 {
                writeln!(kernel, "{pc:04x} ffffffff 1 R1 ADD 2 R2 R3 0").unwrap();
                pc += 8;
            }
            writeln!(kernel, "{pc:04x} ffffffff 0 EXIT 0 0").unwrap();
        }
        write_kernel(&dir, 1, &kernel);
        write_commands(&dir, "kernel-1\n");

        let mut config = test_config();
        config.scheduler = config::SchedulerKind::LRR;
        let stats = run_trace(config, &dir);
        assert_eq!(stats.sim.instructions, 34);
    }

    /// Barriers: both warps of a block stall at `bar.sync` until the other
    /// arrives; the kernel still drains.
    #[test]
    fn barrier_synchronizes_block() {
        let dir = traces_dir("barrier");
        let mut kernel = kernel_header(1, "barrier_test", 1, 64);
        kernel.push_str("block = (0,0,0)\n");
        // warp 0 has a long prelude, warp 1 hits the barrier immediately
        kernel.push_str("warp = 0\n");
        let mut pc = 0usize;
        for _ in 0..32 {
            writeln!(kernel, "{pc:04x} ffffffff 1 R1 ADD 2 R2 R3 0").unwrap();
            pc += 8;
        }
        writeln!(kernel, "{pc:04x} ffffffff 0 BAR 0 0").unwrap();
        pc += 8;
        writeln!(kernel, "{pc:04x} ffffffff 1 R4 ADD 2 R2 R3 0").unwrap();
        pc += 8;
        writeln!(kernel, "{pc:04x} ffffffff 0 EXIT 0 0").unwrap();
        kernel.push_str("warp = 1\n");
        kernel.push_str("0000 ffffffff 0 BAR 0 0\n");
        kernel.push_str("0008 ffffffff 1 R4 ADD 2 R2 R3 0\n");
        kernel.push_str("0010 ffffffff 0 EXIT 0 0\n");
        write_kernel(&dir, 1, &kernel);
        write_commands(&dir, "kernel-1\n");

        let stats = run_trace(test_config(), &dir);
        assert_eq!(stats.sim.instructions, 32 + 3 + 3);
        assert_eq!(stats.kernels.len(), 1);
    }
}
