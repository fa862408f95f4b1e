use crate::instruction::WarpInstruction;
use crate::trace::{BlockTrace, KernelLaunch};
use crate::{config, trace, warp};

use bitvec::array::BitArray;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("limit of {max_concurrent_kernels} concurrent kernels reached")]
    LimitReached { max_concurrent_kernels: usize },

    #[error("block of {threads_per_block} threads too large (limit is {max_threads_per_block})")]
    BlockSizeTooLarge {
        threads_per_block: usize,
        max_threads_per_block: usize,
    },
}

/// A block's warps ready to be bound to a core.
#[derive(Debug)]
pub struct IssuedBlock {
    pub block_id: u64,
    pub warps: Vec<VecDeque<WarpInstruction>>,
}

/// A kernel in flight: its launch configuration and the cursor over its
/// trace.
#[derive(Debug)]
pub struct Kernel {
    pub launch: KernelLaunch,
    blocks: Vec<BlockTrace>,
    next_block_idx: usize,
    pub num_running_blocks: usize,
    pub launched: bool,
    pub start_cycle: u64,
    pub completed_cycle: u64,
}

impl std::fmt::Display for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Kernel({}: {})", self.launch.id, self.launch.name)
    }
}

impl Kernel {
    pub fn from_trace(traces_dir: impl AsRef<Path>, launch: &KernelLaunch) -> color_eyre::eyre::Result<Self> {
        let trace_path = traces_dir
            .as_ref()
            .join(format!("{}.traceg", launch.trace_file));
        log::info!("reading kernel trace {}", trace_path.display());
        let (launch, blocks) = trace::read_kernel_trace(trace_path)?;
        Ok(Self {
            launch,
            blocks,
            next_block_idx: 0,
            num_running_blocks: 0,
            launched: false,
            start_cycle: 0,
            completed_cycle: 0,
        })
    }

    #[must_use]
    pub fn launch_id(&self) -> u64 {
        self.launch.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.launch.name
    }

    #[must_use]
    pub fn stream_id(&self) -> usize {
        self.launch.stream_id
    }

    #[must_use]
    pub fn threads_per_block(&self) -> usize {
        self.launch.block.size() as usize
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn no_more_blocks_to_run(&self) -> bool {
        self.next_block_idx >= self.blocks.len()
    }

    #[must_use]
    pub fn running(&self) -> bool {
        self.num_running_blocks > 0
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.no_more_blocks_to_run() && !self.running()
    }

    /// Decode the next block's warps into instruction streams.
    ///
    /// A kernel with `launched == false` is never advanced.
    pub fn next_block_trace(&mut self, config: &config::GPU) -> Option<IssuedBlock> {
        assert!(self.launched, "unlaunched kernel is never advanced");
        let block = self.blocks.get(self.next_block_idx)?;
        let block_id = self.next_block_idx as u64;
        self.next_block_idx += 1;

        let threads_per_block = self.launch.block.size() as usize;
        let num_warps = threads_per_block.div_ceil(config.warp_size).max(1);

        let mut warps: Vec<VecDeque<WarpInstruction>> = vec![VecDeque::new(); num_warps];
        for warp_trace in &block.warps {
            let warp_id = warp_trace.warp_id;
            let Some(slot) = warps.get_mut(warp_id) else {
                continue;
            };
            for entry in &warp_trace.instructions {
                let mut active_mask: warp::ActiveMask = BitArray::ZERO;
                let threads_in_warp = threads_per_block
                    .saturating_sub(warp_id * config.warp_size)
                    .min(config.warp_size);
                for lane in 0..threads_in_warp {
                    if entry.mask & (1 << lane) != 0 {
                        active_mask.set(lane, true);
                    }
                }
                let instr = WarpInstruction::from_trace(entry, warp_id, active_mask, config)
                    .expect("opcodes validated at trace parse");
                slot.push_back(instr);
            }
        }
        Some(IssuedBlock { block_id, warps })
    }
}

/// The rolling window of kernels running on the GPU.
pub struct KernelManager {
    kernels: HashMap<u64, Kernel>,
    running: Box<[Option<u64>]>,
    last_issued: usize,
    config: Arc<config::GPU>,
}

impl std::fmt::Debug for KernelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("KernelManager")
            .field("running", &self.running)
            .finish()
    }
}

impl KernelManager {
    #[must_use]
    pub fn new(config: Arc<config::GPU>) -> Self {
        let running = (0..config.max_concurrent_kernels).map(|_| None).collect();
        Self {
            kernels: HashMap::new(),
            running,
            last_issued: 0,
            config,
        }
    }

    pub fn add(&mut self, kernel: Kernel) -> u64 {
        let launch_id = kernel.launch_id();
        assert!(
            self.kernels.insert(launch_id, kernel).is_none(),
            "duplicate kernel launch id {launch_id}"
        );
        launch_id
    }

    #[must_use]
    pub fn get(&self, launch_id: u64) -> &Kernel {
        &self.kernels[&launch_id]
    }

    pub fn get_mut(&mut self, launch_id: u64) -> &mut Kernel {
        self.kernels.get_mut(&launch_id).expect("known kernel")
    }

    /// A launch slot is free (or holds a finished kernel).
    #[must_use]
    pub fn can_start_kernel(&self) -> bool {
        self.running.iter().any(|slot| match slot {
            Some(launch_id) => self.kernels[launch_id].done(),
            None => true,
        })
    }

    #[must_use]
    pub fn more_blocks_to_run(&self) -> bool {
        self.running.iter().flatten().any(|launch_id| {
            !self.kernels[launch_id].no_more_blocks_to_run()
        })
    }

    #[must_use]
    pub fn any_running(&self) -> bool {
        self.running.iter().flatten().any(|launch_id| {
            let kernel = &self.kernels[launch_id];
            !kernel.done()
        })
    }

    pub fn try_launch_kernel(&mut self, launch_id: u64, cycle: u64) -> Result<(), LaunchError> {
        let threads_per_block = self.kernels[&launch_id].threads_per_block();
        let max_threads_per_block = self.config.max_threads_per_core;
        if threads_per_block > max_threads_per_block {
            return Err(LaunchError::BlockSizeTooLarge {
                threads_per_block,
                max_threads_per_block,
            });
        }
        let kernels = &self.kernels;
        let free_slot = self
            .running
            .iter_mut()
            .find(|slot| match slot {
                Some(other) => kernels[other].done(),
                None => true,
            })
            .ok_or(LaunchError::LimitReached {
                max_concurrent_kernels: self.config.max_concurrent_kernels,
            })?;
        *free_slot = Some(launch_id);
        let kernel = self.kernels.get_mut(&launch_id).expect("known kernel");
        kernel.launched = true;
        kernel.start_cycle = cycle;
        Ok(())
    }

    /// Pick the kernel blocks are issued from this cycle.
    ///
    /// Prefers the kernel issued from last, then round robin over the
    /// other running slots.
    #[must_use]
    pub fn select_kernel(&mut self) -> Option<u64> {
        if let Some(launch_id) = self.running[self.last_issued] {
            if !self.kernels[&launch_id].no_more_blocks_to_run() {
                return Some(launch_id);
            }
        }
        let num_slots = self.running.len();
        for i in 0..num_slots {
            let idx = (self.last_issued + i + 1) % num_slots;
            if let Some(launch_id) = self.running[idx] {
                if !self.kernels[&launch_id].no_more_blocks_to_run() {
                    self.last_issued = idx;
                    return Some(launch_id);
                }
            }
        }
        None
    }

    /// A block of `launch_id` retired on some core.
    pub fn block_finished(&mut self, launch_id: u64) {
        let kernel = self.kernels.get_mut(&launch_id).expect("known kernel");
        debug_assert!(kernel.num_running_blocks > 0);
        kernel.num_running_blocks -= 1;
    }

    /// Remove and return a finished kernel, if any.
    pub fn get_finished_kernel(&mut self) -> Option<u64> {
        for slot in self.running.iter_mut() {
            if let Some(launch_id) = slot {
                let kernel = &self.kernels[launch_id];
                if kernel.launched && kernel.done() {
                    let launch_id = *launch_id;
                    *slot = None;
                    return Some(launch_id);
                }
            }
        }
        None
    }

    /// Drop all running kernels (cycle cap reached).
    pub fn stop_all_running_kernels(&mut self) {
        for slot in self.running.iter_mut() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Kernel, KernelManager};
    use crate::{config, trace};
    use std::sync::Arc;

    fn dummy_kernel(id: u64, num_blocks: usize, stream_id: usize) -> Kernel {
        let launch = trace::KernelLaunch {
            id,
            name: format!("kernel-{id}"),
            trace_file: format!("kernel-{id}"),
            grid: trace::Dim {
                x: num_blocks as u32,
                y: 1,
                z: 1,
            },
            block: trace::Dim { x: 32, y: 1, z: 1 },
            shared_mem_bytes: 0,
            num_registers: 8,
            stream_id,
        };
        let blocks = (0..num_blocks)
            .map(|x| trace::BlockTrace {
                block: trace::Dim {
                    x: x as u32,
                    y: 1,
                    z: 1,
                },
                warps: Vec::new(),
            })
            .collect();
        Kernel {
            launch,
            blocks,
            next_block_idx: 0,
            num_running_blocks: 0,
            launched: false,
            start_cycle: 0,
            completed_cycle: 0,
        }
    }

    #[test]
    fn kernel_lifecycle() {
        let config = Arc::new(config::GPU::default());
        let mut manager = KernelManager::new(config.clone());
        let id = manager.add(dummy_kernel(1, 2, 0));

        assert!(manager.can_start_kernel());
        manager.try_launch_kernel(id, 10).unwrap();
        assert!(manager.get(id).launched);
        assert_eq!(manager.select_kernel(), Some(id));

        // consume both blocks
        let kernel = manager.get_mut(id);
        kernel.next_block_trace(&config).unwrap();
        kernel.num_running_blocks += 1;
        kernel.next_block_trace(&config).unwrap();
        kernel.num_running_blocks += 1;
        assert!(kernel.no_more_blocks_to_run());
        assert!(manager.select_kernel().is_none());
        assert!(manager.get_finished_kernel().is_none(), "blocks still running");

        manager.block_finished(id);
        manager.block_finished(id);
        assert_eq!(manager.get_finished_kernel(), Some(id));
        assert!(manager.get_finished_kernel().is_none());
    }

    #[test]
    fn oversized_block_fails_to_launch() {
        let config = Arc::new(config::GPU::default());
        let mut manager = KernelManager::new(config);
        let mut kernel = dummy_kernel(1, 1, 0);
        kernel.launch.block = trace::Dim {
            x: 4096,
            y: 1,
            z: 1,
        };
        let id = manager.add(kernel);
        assert!(manager.try_launch_kernel(id, 0).is_err());
    }
}
