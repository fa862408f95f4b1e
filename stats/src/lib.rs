#![allow(
    non_camel_case_types,
    clippy::upper_case_acronyms,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod dram;
pub mod interconn;
pub mod kernel;
pub mod mem;
pub mod scheduler;
pub mod sim;

pub use cache::{Cache, PerCache};
pub use dram::DRAM;
pub use interconn::Interconn;
pub use kernel::Kernel;
pub use mem::Accesses;
pub use sim::Sim;

use serde::{Deserialize, Serialize};

/// Full counter bag for a simulation run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub sim: Sim,
    pub accesses: Accesses,
    pub scheduler: scheduler::Scheduler,
    pub dram: DRAM,
    pub interconn: Interconn,
    pub l1i_stats: PerCache,
    pub l1d_stats: PerCache,
    pub l2d_stats: PerCache,
    /// Per-kernel snapshots, in retirement order.
    pub kernels: Vec<Kernel>,
    pub stall_dram_full: u64,
}

impl Stats {
    #[must_use]
    pub fn new(num_total_cores: usize, num_sub_partitions: usize) -> Self {
        Self {
            sim: Sim::default(),
            accesses: Accesses::default(),
            scheduler: scheduler::Scheduler::default(),
            dram: DRAM::default(),
            interconn: Interconn::default(),
            l1i_stats: PerCache::new(num_total_cores),
            l1d_stats: PerCache::new(num_total_cores),
            l2d_stats: PerCache::new(num_sub_partitions),
            kernels: Vec::new(),
            stall_dram_full: 0,
        }
    }
}
