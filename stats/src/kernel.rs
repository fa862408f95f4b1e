use serde::{Deserialize, Serialize};

/// Snapshot taken when a kernel retires.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    pub launch_id: u64,
    pub name: String,
    pub stream_id: usize,
    pub start_cycle: u64,
    pub completed_cycle: u64,
    pub num_blocks: u64,
}
