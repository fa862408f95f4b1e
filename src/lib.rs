#![allow(
    non_camel_case_types,
    clippy::upper_case_acronyms,
    clippy::module_name_repetitions
)]

pub mod barrier;
pub mod cache;
pub mod config;
pub mod core;
pub mod deadlock;
pub mod fifo;
pub mod func_unit;
pub mod instruction;
pub mod interconn;
pub mod kernel;
pub mod mcu;
pub mod mem_fetch;
pub mod mem_partition_unit;
pub mod mem_sub_partition;
pub mod mshr;
pub mod opcodes;
pub mod operand_collector;
pub mod register_set;
pub mod scheduler;
pub mod scoreboard;
pub mod sim;
pub mod streams;
pub mod tag_array;
pub mod trace;
pub mod warp;

pub use sim::Simulator;

/// Memory address type used throughout the simulator.
pub type address = u64;
