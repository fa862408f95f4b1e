use serde::{Deserialize, Serialize};

/// Interconnect traffic counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interconn {
    pub packets_to_mem: u64,
    pub packets_to_shader: u64,
    pub flits_to_mem: u64,
    pub flits_to_shader: u64,
}
