use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DRAM {
    /// Read requests serviced by DRAM.
    pub total_reads: u64,
    /// Write requests serviced by DRAM.
    pub total_writes: u64,
}
