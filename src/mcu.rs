use crate::{address, config};

/// Number of bytes interleaved consecutively on one sub partition.
pub const DRAM_ATOM_SIZE: u64 = 256;

const NUM_BANKS: u64 = 16;
const COLUMN_CHUNKS_PER_BANK: u64 = 4;

/// A raw address decoded into DRAM coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PhysicalAddress {
    pub chip: u64,
    pub bank: u64,
    pub row: u64,
    pub col: u64,
    pub sub_partition: u64,
}

/// Decodes raw addresses into (chip, bank, row, column, sub partition).
///
/// Consecutive 256-byte atoms interleave across all sub partitions so that
/// streaming accesses spread over the memory modules.
#[derive(Clone, Debug)]
pub struct MemoryControllerUnit {
    num_channels: u64,
    num_sub_partitions_per_channel: u64,
}

impl MemoryControllerUnit {
    #[must_use]
    pub fn new(config: &config::GPU) -> Self {
        Self {
            num_channels: config.num_memory_controllers as u64,
            num_sub_partitions_per_channel: config.num_sub_partitions_per_memory_controller
                as u64,
        }
    }

    #[must_use]
    pub fn num_sub_partitions(&self) -> usize {
        (self.num_channels * self.num_sub_partitions_per_channel) as usize
    }

    #[must_use]
    pub fn to_physical_address(&self, addr: address) -> PhysicalAddress {
        let total_subs = self.num_channels * self.num_sub_partitions_per_channel;
        let chunk = addr / DRAM_ATOM_SIZE;
        let sub_partition = chunk % total_subs;
        let chip = sub_partition / self.num_sub_partitions_per_channel;
        let local_chunk = chunk / total_subs;

        let col = local_chunk % COLUMN_CHUNKS_PER_BANK;
        let bank = (local_chunk / COLUMN_CHUNKS_PER_BANK) % NUM_BANKS;
        let row = local_chunk / (COLUMN_CHUNKS_PER_BANK * NUM_BANKS);

        PhysicalAddress {
            chip,
            bank,
            row,
            col,
            sub_partition,
        }
    }

    /// Address within the partition, with the interleaving bits removed.
    #[must_use]
    pub fn memory_partition_address(&self, addr: address) -> address {
        let total_subs = self.num_channels * self.num_sub_partitions_per_channel;
        let chunk = addr / DRAM_ATOM_SIZE;
        (chunk / total_subs) * DRAM_ATOM_SIZE + (addr % DRAM_ATOM_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use crate::config;

    #[test]
    fn consecutive_atoms_interleave() {
        let config = config::GPU::default();
        let mcu = super::MemoryControllerUnit::new(&config);
        let total_subs = config.total_sub_partitions() as u64;

        let first = mcu.to_physical_address(0);
        let second = mcu.to_physical_address(super::DRAM_ATOM_SIZE);
        assert_eq!(first.sub_partition, 0);
        assert_eq!(second.sub_partition, 1 % total_subs);

        // same atom, same sub partition
        let a = mcu.to_physical_address(0x80);
        assert_eq!(a.sub_partition, first.sub_partition);
    }

    #[test]
    fn partition_address_is_dense() {
        let config = config::GPU::default();
        let mcu = super::MemoryControllerUnit::new(&config);
        let total_subs = config.total_sub_partitions() as u64;

        // the atom that lands on sub partition 0 right after address 0
        let next = total_subs * super::DRAM_ATOM_SIZE;
        assert_eq!(
            mcu.memory_partition_address(next),
            super::DRAM_ATOM_SIZE,
            "second atom on a partition is dense within the partition"
        );
    }
}
