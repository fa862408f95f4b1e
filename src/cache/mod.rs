pub mod base;
pub mod block;
pub mod data;
pub mod readonly;

pub use data::Data;
pub use readonly::ReadOnly;

use crate::tag_array;

/// Outcome of a cache probe.
#[derive(Debug, strum::EnumIter, Clone, Copy, Hash, PartialEq, Eq)]
pub enum RequestStatus {
    HIT = 0,
    HIT_RESERVED,
    MISS,
    RESERVATION_FAIL,
    SECTOR_MISS,
    MSHR_HIT,
}

impl From<RequestStatus> for stats::cache::RequestStatus {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::HIT => Self::HIT,
            RequestStatus::HIT_RESERVED => Self::HIT_RESERVED,
            RequestStatus::MISS => Self::MISS,
            RequestStatus::RESERVATION_FAIL => Self::RESERVATION_FAIL,
            RequestStatus::SECTOR_MISS => Self::SECTOR_MISS,
            RequestStatus::MSHR_HIT => Self::MSHR_HIT,
        }
    }
}

/// Why a request could not reserve cache resources this cycle.
#[derive(Debug, strum::EnumIter, Clone, Copy, Hash, PartialEq, Eq)]
pub enum ReservationFailure {
    /// all lines in the set are reserved
    LINE_ALLOC_FAIL = 0,
    /// miss queue (i.e. interconnect or DRAM) is full
    MISS_QUEUE_FULL,
    MSHR_ENTRY_FAIL,
    MSHR_MERGE_ENTRY_FAIL,
    MSHR_RW_PENDING,
}

impl From<ReservationFailure> for stats::cache::ReservationFailure {
    fn from(failure: ReservationFailure) -> Self {
        match failure {
            ReservationFailure::LINE_ALLOC_FAIL => Self::LINE_ALLOC_FAIL,
            ReservationFailure::MISS_QUEUE_FULL => Self::MISS_QUEUE_FULL,
            ReservationFailure::MSHR_ENTRY_FAIL => Self::MSHR_ENTRY_FAIL,
            ReservationFailure::MSHR_MERGE_ENTRY_FAIL => Self::MSHR_MERGE_ENTRY_FAIL,
            ReservationFailure::MSHR_RW_PENDING => Self::MSHR_RW_PENDING,
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum AccessStat {
    ReservationFailure(ReservationFailure),
    Status(RequestStatus),
}

impl From<AccessStat> for stats::cache::AccessStat {
    fn from(access: AccessStat) -> Self {
        match access {
            AccessStat::Status(status) => Self::Status(status.into()),
            AccessStat::ReservationFailure(failure) => Self::ReservationFailure(failure.into()),
        }
    }
}

/// Side effects of a cache access the caller must act on.
#[derive(Debug, Clone)]
pub enum Event {
    ReadRequestSent,
    WriteRequestSent,
    /// A read request generated by a write miss under write-allocate.
    WriteAllocateSent,
    /// A dirty line was evicted; the writeback was queued.
    WriteBackRequestSent {
        evicted: tag_array::EvictedBlockInfo,
    },
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::mem_fetch::{self, access};
    use bitvec::array::BitArray;

    /// Global read fetch with a full sector mask, for cache unit tests.
    pub fn read_fetch(addr: crate::address, warp_id: usize) -> mem_fetch::MemFetch {
        build_fetch(addr, warp_id, access::Kind::GLOBAL_ACC_R, false)
    }

    pub fn write_fetch(addr: crate::address, warp_id: usize) -> mem_fetch::MemFetch {
        build_fetch(addr, warp_id, access::Kind::GLOBAL_ACC_W, true)
    }

    fn build_fetch(
        addr: crate::address,
        warp_id: usize,
        kind: access::Kind,
        is_write: bool,
    ) -> mem_fetch::MemFetch {
        let mut sector_mask: mem_fetch::SectorMask = BitArray::ZERO;
        sector_mask.fill(true);
        let access = access::Builder {
            kind,
            addr,
            req_size_bytes: 128,
            is_write,
            warp_active_mask: BitArray::ZERO,
            byte_mask: BitArray::ZERO,
            sector_mask,
        }
        .build();
        mem_fetch::Builder {
            instr: None,
            access,
            warp_id,
            core_id: Some(0),
            cluster_id: Some(0),
            physical_addr: crate::mcu::PhysicalAddress::default(),
            partition_addr: 0,
        }
        .build()
    }
}
