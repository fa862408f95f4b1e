use crate::{address, mshr, opcodes::ArchOp};

use clap::Parser;
use color_eyre::eyre;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;

pub const WORD_SIZE: u32 = 4;

/// A cache replacement policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReplacementPolicy {
    LRU,  // L
    FIFO, // F
}

/// A cache write policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WritePolicy {
    READ_ONLY,     // R
    WRITE_BACK,    // B
    WRITE_THROUGH, // T
}

/// A cache allocate policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocatePolicy {
    ON_MISS, // M
    ON_FILL, // F
}

/// A cache write-allocate policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WriteAllocatePolicy {
    NO_WRITE_ALLOCATE, // N
    WRITE_ALLOCATE,    // W
}

/// Cache geometry and policies.
///
/// Parsed from an accelsim-style geometry string:
/// `<nsets>:<bsize>:<assoc>,<rep>:<wr>:<alloc>:<wr_alloc>,<mshr>:<N>:<merge>,<mq>`
#[derive(Clone, Debug)]
pub struct Cache {
    pub num_sets: usize,
    pub line_size: u32,
    pub associativity: usize,

    pub replacement_policy: ReplacementPolicy,
    pub write_policy: WritePolicy,
    pub allocate_policy: AllocatePolicy,
    pub write_allocate_policy: WriteAllocatePolicy,

    pub mshr_kind: mshr::Kind,
    pub mshr_entries: usize,
    pub mshr_max_merge: usize,
    pub miss_queue_size: usize,

    /// Only evict clean lines until this percentage of lines is dirty.
    pub l1_cache_write_ratio_percent: usize,
}

impl Cache {
    #[must_use]
    pub fn line_size_log2(&self) -> u32 {
        self.line_size.trailing_zeros()
    }

    #[must_use]
    pub fn total_lines(&self) -> usize {
        self.num_sets * self.associativity
    }

    #[must_use]
    pub fn tag(&self, addr: address) -> address {
        // the tag includes both index and tag to support set index
        // functions that map different indexes to the same set
        addr & !u64::from(self.line_size - 1)
    }

    #[must_use]
    pub fn block_addr(&self, addr: address) -> address {
        addr & !u64::from(self.line_size - 1)
    }

    /// Linear set index function.
    #[must_use]
    pub fn set_index(&self, addr: address) -> u64 {
        (addr >> self.line_size_log2()) & (self.num_sets as u64 - 1)
    }

    /// Granularity of a fill from the next level.
    #[must_use]
    pub fn atom_size(&self) -> u32 {
        if self.mshr_kind == mshr::Kind::SECTOR_ASSOC {
            crate::mem_sub_partition::SECTOR_SIZE
        } else {
            self.line_size
        }
    }

    #[must_use]
    pub fn mshr_addr(&self, addr: address) -> address {
        if self.mshr_kind == mshr::Kind::SECTOR_ASSOC {
            addr & !u64::from(crate::mem_sub_partition::SECTOR_SIZE - 1)
        } else {
            addr & !u64::from(self.line_size - 1)
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("bad cache geometry {0:?}")]
    CacheGeometry(String),

    #[error("unknown option value {value:?} for {option}")]
    UnknownValue { option: String, value: String },

    #[error(transparent)]
    Clap(#[from] clap::Error),
}

impl std::str::FromStr for Cache {
    type Err = ParseError;

    fn from_str(config: &str) -> Result<Self, Self::Err> {
        let err = || ParseError::CacheGeometry(config.to_string());
        let mut groups = config.split(',');
        let mut geometry = groups.next().ok_or_else(err)?.split(':');
        let num_sets = geometry.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let line_size = geometry.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let associativity = geometry.next().ok_or_else(err)?.parse().map_err(|_| err())?;

        let mut policies = groups.next().ok_or_else(err)?.split(':');
        let replacement_policy = match policies.next().ok_or_else(err)? {
            "L" => ReplacementPolicy::LRU,
            "F" => ReplacementPolicy::FIFO,
            _ => return Err(err()),
        };
        let write_policy = match policies.next().ok_or_else(err)? {
            "R" => WritePolicy::READ_ONLY,
            "B" => WritePolicy::WRITE_BACK,
            "T" => WritePolicy::WRITE_THROUGH,
            _ => return Err(err()),
        };
        let allocate_policy = match policies.next().ok_or_else(err)? {
            "m" | "M" => AllocatePolicy::ON_MISS,
            "f" | "F" => AllocatePolicy::ON_FILL,
            _ => return Err(err()),
        };
        let write_allocate_policy = match policies.next().ok_or_else(err)? {
            "N" => WriteAllocatePolicy::NO_WRITE_ALLOCATE,
            "W" => WriteAllocatePolicy::WRITE_ALLOCATE,
            _ => return Err(err()),
        };

        let mut mshr = groups.next().ok_or_else(err)?.split(':');
        let mshr_kind = match mshr.next().ok_or_else(err)? {
            "A" => mshr::Kind::ASSOC,
            "S" => mshr::Kind::SECTOR_ASSOC,
            _ => return Err(err()),
        };
        let mshr_entries = mshr.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let mshr_max_merge = mshr.next().ok_or_else(err)?.parse().map_err(|_| err())?;

        let miss_queue_size = groups
            .next()
            .ok_or_else(err)?
            .parse()
            .map_err(|_| err())?;

        Ok(Self {
            num_sets,
            line_size,
            associativity,
            replacement_policy,
            write_policy,
            allocate_policy,
            write_allocate_policy,
            mshr_kind,
            mshr_entries,
            mshr_max_merge,
            miss_queue_size,
            l1_cache_write_ratio_percent: 0,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchedulerKind {
    GTO,
    LRR,
}

impl std::str::FromStr for SchedulerKind {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "gto" => Ok(SchedulerKind::GTO),
            "lrr" => Ok(SchedulerKind::LRR),
            other => Err(ParseError::UnknownValue {
                option: "gpgpu_scheduler".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Raw command line options, accelsim flag names.
#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[clap(long = "gpgpu_n_clusters", default_value = "20")]
    pub num_clusters: usize,
    #[clap(long = "gpgpu_n_cores_per_cluster", default_value = "1")]
    pub num_cores_per_cluster: usize,
    #[clap(long = "gpgpu_num_sched_per_core", default_value = "2")]
    pub num_sched_per_core: usize,
    #[clap(long = "gpgpu_shader_core_pipeline", default_value = "2048:32")]
    pub shader_core_pipeline: String,
    #[clap(long = "gpgpu_max_concurrent_block_per_core", default_value = "32")]
    pub max_concurrent_blocks_per_core: usize,
    #[clap(long = "gpgpu_scheduler", default_value = "gto")]
    pub scheduler: String,
    #[clap(long = "gpgpu_max_insn_issue_per_warp", default_value = "2")]
    pub max_instruction_issue_per_warp: usize,
    #[clap(long = "gpgpu_dual_issue_diff_exec_units", default_value = "1")]
    pub dual_issue_diff_exec_units: u8,

    #[clap(long = "gpgpu_num_reg_banks", default_value = "16")]
    pub num_reg_banks: usize,
    #[clap(long = "gpgpu_reg_bank_use_warp_id", default_value = "0")]
    pub reg_bank_use_warp_id: u8,
    #[clap(long = "gpgpu_sub_core_model", default_value = "0")]
    pub sub_core_model: u8,
    #[clap(long = "gpgpu_reg_file_port_throughput", default_value = "1")]
    pub reg_file_port_throughput: usize,
    #[clap(long = "gpgpu_operand_collector_num_units_sp", default_value = "4")]
    pub operand_collector_num_units_sp: usize,
    #[clap(long = "gpgpu_operand_collector_num_units_int", default_value = "0")]
    pub operand_collector_num_units_int: usize,
    #[clap(long = "gpgpu_operand_collector_num_units_sfu", default_value = "4")]
    pub operand_collector_num_units_sfu: usize,
    #[clap(long = "gpgpu_operand_collector_num_units_mem", default_value = "2")]
    pub operand_collector_num_units_mem: usize,

    #[clap(long = "gpgpu_num_sp_units", default_value = "1")]
    pub num_sp_units: usize,
    #[clap(long = "gpgpu_num_int_units", default_value = "0")]
    pub num_int_units: usize,
    #[clap(long = "gpgpu_num_sfu_units", default_value = "1")]
    pub num_sfu_units: usize,

    #[clap(long = "gpgpu_cache:il1", default_value = "8:128:4,L:R:f:N,A:2:48,4")]
    pub inst_cache_l1: String,
    #[clap(long = "gpgpu_cache:dl1", default_value = "64:128:6,L:T:m:N,A:128:8,16")]
    pub data_cache_l1: String,
    #[clap(long = "gpgpu_cache:dl2", default_value = "64:128:16,L:B:m:N,A:1024:1024,32")]
    pub data_cache_l2: String,
    #[clap(long = "gpgpu_perfect_inst_const_cache", default_value = "1")]
    pub perfect_inst_cache: u8,
    #[clap(long = "gpgpu_l1_latency", default_value = "1")]
    pub l1_latency: usize,
    #[clap(long = "gpgpu_gmem_skip_L1D", default_value = "0")]
    pub global_mem_skip_l1_data_cache: u8,

    #[clap(long = "gpgpu_n_mem", default_value = "8")]
    pub num_memory_controllers: usize,
    #[clap(long = "gpgpu_n_sub_partition_per_mchannel", default_value = "2")]
    pub num_sub_partitions_per_memory_controller: usize,
    #[clap(long = "gpgpu_dram_latency", default_value = "100")]
    pub dram_latency: usize,
    #[clap(long = "gpgpu_fill_l2_on_memcopy", default_value = "1")]
    pub fill_l2_on_memcopy: u8,
    #[clap(long = "rop_latency", default_value = "0")]
    pub rop_latency: u64,

    #[clap(long = "gpgpu_concurrent_kernel_sm", default_value = "0")]
    pub concurrent_kernel_sm: u8,
    #[clap(long = "gpgpu_max_concurrent_kernel", default_value = "8")]
    pub max_concurrent_kernels: usize,
    #[clap(long = "gpgpu_deadlock_detect", default_value = "100000")]
    pub deadlock_detect: u64,

    #[clap(long = "network_file")]
    pub network_file: Option<PathBuf>,
    #[clap(long = "icnt_flit_size", default_value = "32")]
    pub flit_size: u32,
    #[clap(long = "icnt_buffer_size", default_value = "64")]
    pub icnt_buffer_size: usize,

    #[clap(num_args(0..), allow_hyphen_values = true, trailing_var_arg = true)]
    pub unknown: Vec<String>,
}

static ARGUMENT_REGEX: Lazy<Regex> = Lazy::new(|| {
    let arg = r"([\w\d\-:]+)";
    let value_excluding_comment = r"(?:[^#\n]+)";
    let trailing_comment = r"(?:#.*)?";
    let pattern = [r"^\s*-{1,2}", arg, r"\s+(", value_excluding_comment, ")", trailing_comment];
    let pattern = pattern.join("");
    regex::RegexBuilder::new(&pattern)
        .multi_line(true)
        .build()
        .unwrap()
});

/// Extract `-key value` pairs from a flat config file.
pub fn extract_arguments(config: &str) -> impl Iterator<Item = (&str, &str)> {
    ARGUMENT_REGEX.captures_iter(config).filter_map(|cap| {
        let key = cap.get(1)?.as_str().trim();
        let value = cap.get(2)?.as_str().trim();
        Some((key, value))
    })
}

/// GPU configuration.
#[derive(Clone, Debug)]
pub struct GPU {
    pub num_simt_clusters: usize,
    pub num_cores_per_simt_cluster: usize,
    pub num_schedulers_per_core: usize,
    pub max_threads_per_core: usize,
    pub warp_size: usize,
    pub max_concurrent_blocks_per_core: usize,
    pub max_barriers_per_block: usize,

    pub scheduler: SchedulerKind,
    pub max_instruction_issue_per_warp: usize,
    pub dual_issue_only_to_different_exec_units: bool,

    pub num_reg_banks: usize,
    pub reg_bank_use_warp_id: bool,
    pub sub_core_model: bool,
    pub reg_file_port_throughput: usize,
    pub operand_collector_num_units_sp: usize,
    pub operand_collector_num_units_int: usize,
    pub operand_collector_num_units_sfu: usize,
    pub operand_collector_num_units_mem: usize,

    pub num_sp_units: usize,
    pub num_int_units: usize,
    pub num_sfu_units: usize,

    pub inst_cache_l1: Option<Arc<Cache>>,
    pub data_cache_l1: Option<Arc<Cache>>,
    pub data_cache_l2: Option<Arc<Cache>>,
    pub perfect_inst_cache: bool,
    pub l1_latency: usize,
    pub global_mem_skip_l1_data_cache: bool,
    pub num_ldst_response_buffer_size: usize,

    pub num_memory_controllers: usize,
    pub num_sub_partitions_per_memory_controller: usize,
    pub dram_latency: usize,
    pub fill_l2_on_memcopy: bool,
    pub rop_latency: u64,

    pub concurrent_kernel_sm: bool,
    pub max_concurrent_kernels: usize,
    /// Abort if no instruction retires for this many cycles (0 disables).
    pub deadlock_detect_cycles: u64,

    pub network_file: Option<PathBuf>,
    pub flit_size: u32,
    pub icnt_buffer_size: usize,

    /// Instruction fetches per core per cycle.
    pub inst_fetch_throughput: usize,
    /// Pipeline depth (and occupancy horizon) per unit kind.
    pub max_sp_latency: usize,
    pub max_int_latency: usize,
    pub max_sfu_latency: usize,
}

impl Default for GPU {
    fn default() -> Self {
        let opts = Options::parse_from(std::iter::empty::<&str>());
        Self::from_options(&opts).unwrap()
    }
}

impl GPU {
    pub fn from_options(opts: &Options) -> Result<Self, ParseError> {
        let mut pipeline = opts.shader_core_pipeline.split(':');
        let max_threads_per_core = pipeline
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2048);
        let warp_size = pipeline.next().and_then(|v| v.parse().ok()).unwrap_or(32);

        let parse_cache = |config: &str| -> Result<Option<Arc<Cache>>, ParseError> {
            if config == "none" {
                Ok(None)
            } else {
                Ok(Some(Arc::new(config.parse()?)))
            }
        };

        Ok(Self {
            num_simt_clusters: opts.num_clusters,
            num_cores_per_simt_cluster: opts.num_cores_per_cluster,
            num_schedulers_per_core: opts.num_sched_per_core,
            max_threads_per_core,
            warp_size,
            max_concurrent_blocks_per_core: opts.max_concurrent_blocks_per_core,
            max_barriers_per_block: 16,
            scheduler: opts.scheduler.parse()?,
            max_instruction_issue_per_warp: opts.max_instruction_issue_per_warp,
            dual_issue_only_to_different_exec_units: opts.dual_issue_diff_exec_units != 0,
            num_reg_banks: opts.num_reg_banks,
            reg_bank_use_warp_id: opts.reg_bank_use_warp_id != 0,
            sub_core_model: opts.sub_core_model != 0,
            reg_file_port_throughput: opts.reg_file_port_throughput,
            operand_collector_num_units_sp: opts.operand_collector_num_units_sp,
            operand_collector_num_units_int: opts.operand_collector_num_units_int,
            operand_collector_num_units_sfu: opts.operand_collector_num_units_sfu,
            operand_collector_num_units_mem: opts.operand_collector_num_units_mem,
            num_sp_units: opts.num_sp_units,
            num_int_units: opts.num_int_units,
            num_sfu_units: opts.num_sfu_units,
            inst_cache_l1: parse_cache(&opts.inst_cache_l1)?,
            data_cache_l1: parse_cache(&opts.data_cache_l1)?,
            data_cache_l2: parse_cache(&opts.data_cache_l2)?,
            perfect_inst_cache: opts.perfect_inst_cache != 0,
            l1_latency: opts.l1_latency,
            global_mem_skip_l1_data_cache: opts.global_mem_skip_l1_data_cache != 0,
            num_ldst_response_buffer_size: 2,
            num_memory_controllers: opts.num_memory_controllers,
            num_sub_partitions_per_memory_controller: opts
                .num_sub_partitions_per_memory_controller,
            dram_latency: opts.dram_latency,
            fill_l2_on_memcopy: opts.fill_l2_on_memcopy != 0,
            rop_latency: opts.rop_latency,
            concurrent_kernel_sm: opts.concurrent_kernel_sm != 0,
            max_concurrent_kernels: opts.max_concurrent_kernels,
            deadlock_detect_cycles: opts.deadlock_detect,
            network_file: opts.network_file.clone(),
            flit_size: opts.flit_size,
            icnt_buffer_size: opts.icnt_buffer_size,
            inst_fetch_throughput: 1,
            max_sp_latency: 32,
            max_int_latency: 32,
            max_sfu_latency: 64,
        })
    }

    /// Parse a flat `-key value` configuration file.
    ///
    /// Options this simulator does not model are skipped.
    pub fn parse(config: &str) -> eyre::Result<Self> {
        use clap::CommandFactory;
        let command = Options::command();
        let known: std::collections::HashSet<&str> = command
            .get_arguments()
            .filter_map(|arg| arg.get_long())
            .collect();

        let args = extract_arguments(config)
            .filter(|(key, _)| {
                let recognized = known.contains(key);
                if !recognized {
                    log::debug!("ignoring unmodeled config option -{key}");
                }
                recognized
            })
            .flat_map(|(key, value)| [format!("--{key}"), value.to_string()]);
        let args: Vec<String> = std::iter::once(String::from("warpsim")).chain(args).collect();
        let opts = Options::try_parse_from(args).map_err(ParseError::Clap)?;
        Ok(Self::from_options(&opts)?)
    }

    #[must_use]
    pub fn total_cores(&self) -> usize {
        self.num_simt_clusters * self.num_cores_per_simt_cluster
    }

    #[must_use]
    pub fn max_warps_per_core(&self) -> usize {
        self.max_threads_per_core / self.warp_size
    }

    #[must_use]
    pub fn total_sub_partitions(&self) -> usize {
        self.num_memory_controllers * self.num_sub_partitions_per_memory_controller
    }

    /// Interconnect device id for a memory sub partition.
    #[must_use]
    pub fn mem_id_to_device_id(&self, sub_partition_id: usize) -> usize {
        self.num_simt_clusters + sub_partition_id
    }

    #[must_use]
    pub fn total_nodes(&self) -> usize {
        self.num_simt_clusters + self.total_sub_partitions()
    }

    #[must_use]
    pub fn global_core_id_to_cluster_id(&self, core_id: usize) -> usize {
        core_id / self.num_cores_per_simt_cluster
    }

    /// Latency and initiation interval for an op class.
    #[must_use]
    pub fn get_latencies(&self, category: ArchOp) -> (usize, usize) {
        match category {
            ArchOp::SFU_OP => (20, 4),
            ArchOp::DP_OP => (20, 8),
            ArchOp::INT_OP | ArchOp::SP_OP | ArchOp::ALU_OP => (4, 1),
            ArchOp::LOAD_OP | ArchOp::STORE_OP | ArchOp::MEMORY_BARRIER_OP => (1, 1),
            _ => (1, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre;

    #[test]
    fn parse_cache_geometry() -> eyre::Result<()> {
        let config: super::Cache = "64:128:6,L:T:m:N,A:128:8,16".parse()?;
        assert_eq!(config.num_sets, 64);
        assert_eq!(config.line_size, 128);
        assert_eq!(config.associativity, 6);
        assert_eq!(config.replacement_policy, super::ReplacementPolicy::LRU);
        assert_eq!(config.write_policy, super::WritePolicy::WRITE_THROUGH);
        assert_eq!(config.allocate_policy, super::AllocatePolicy::ON_MISS);
        assert_eq!(config.mshr_entries, 128);
        assert_eq!(config.mshr_max_merge, 8);
        assert_eq!(config.miss_queue_size, 16);
        Ok(())
    }

    #[test]
    fn parse_config_file() -> eyre::Result<()> {
        let config = r"
# core
-gpgpu_n_clusters 4
-gpgpu_n_cores_per_cluster 1
-gpgpu_num_sched_per_core 2 # two schedulers
-gpgpu_scheduler gto
-gpgpu_deadlock_detect 5000
";
        let gpu = super::GPU::parse(config)?;
        assert_eq!(gpu.num_simt_clusters, 4);
        assert_eq!(gpu.num_schedulers_per_core, 2);
        assert_eq!(gpu.scheduler, super::SchedulerKind::GTO);
        assert_eq!(gpu.deadlock_detect_cycles, 5000);
        Ok(())
    }

    #[test]
    fn line_and_sector_arithmetic() {
        let config: super::Cache = "64:128:6,L:T:m:N,A:128:8,16".parse().unwrap();
        assert_eq!(config.block_addr(0x8000_01ab), 0x8000_0180);
        assert_eq!(config.set_index(0x8000_0180), 3);
        assert_eq!(config.tag(0x8000_01ab), 0x8000_0180);
    }
}
