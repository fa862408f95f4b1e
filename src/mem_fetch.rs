use crate::{address, instruction::WarpInstruction, mcu};

use bitvec::BitArr;
use once_cell::sync::Lazy;
use std::sync::atomic;

/// Control bytes of a read packet: 6 address, 2 miscellaneous.
pub const READ_PACKET_SIZE: u32 = 8;
pub const WRITE_PACKET_SIZE: u32 = 8;

pub type ByteMask = BitArr!(for crate::mem_sub_partition::MAX_MEMORY_ACCESS_SIZE as usize);
pub type SectorMask = BitArr!(for crate::mem_sub_partition::SECTOR_CHUNK_SIZE, in u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    READ_REQUEST = 0,
    WRITE_REQUEST,
    READ_REPLY,
    WRITE_ACK,
}

/// Position of a fetch in the memory system.
///
/// Wire-ordered: the discriminants match the order requests walk the
/// hierarchy. The `IN_PARTITION_MC_*` stages are defined for that order but
/// are not visited by the simplified DRAM model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::EnumIter)]
pub enum Status {
    INITIALIZED,
    IN_L1I_MISS_QUEUE,
    IN_L1D_MISS_QUEUE,
    IN_L1T_MISS_QUEUE,
    IN_L1C_MISS_QUEUE,
    IN_L1TLB_MISS_QUEUE,
    IN_VM_MANAGER_QUEUE,
    IN_ICNT_TO_MEM,
    IN_PARTITION_ROP_DELAY,
    IN_PARTITION_ICNT_TO_L2_QUEUE,
    IN_PARTITION_L2_TO_DRAM_QUEUE,
    IN_PARTITION_DRAM_LATENCY_QUEUE,
    IN_PARTITION_L2_MISS_QUEUE,
    IN_PARTITION_MC_INTERFACE_QUEUE,
    IN_PARTITION_MC_INPUT_QUEUE,
    IN_PARTITION_MC_BANK_ARB_QUEUE,
    IN_PARTITION_DRAM,
    IN_PARTITION_MC_RETURNQ,
    IN_PARTITION_DRAM_TO_L2_QUEUE,
    IN_PARTITION_L2_FILL_QUEUE,
    IN_PARTITION_L2_TO_ICNT_QUEUE,
    IN_ICNT_TO_SHADER,
    IN_CLUSTER_TO_SHADER_QUEUE,
    IN_SHADER_LDST_RESPONSE_FIFO,
    IN_SHADER_FETCHED,
    IN_SHADER_L1T_ROB,
    DELETED,
}

pub mod access {
    use crate::address;

    #[derive(
        Debug, strum::EnumIter, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    )]
    pub enum Kind {
        GLOBAL_ACC_R,
        LOCAL_ACC_R,
        CONST_ACC_R,
        TEXTURE_ACC_R,
        GLOBAL_ACC_W,
        LOCAL_ACC_W,
        L1_WRBK_ACC,
        L2_WRBK_ACC,
        INST_ACC_R,
        L1_WR_ALLOC_R,
        L2_WR_ALLOC_R,
    }

    impl Kind {
        #[must_use]
        pub fn is_write(&self) -> bool {
            matches!(
                self,
                Kind::GLOBAL_ACC_W | Kind::LOCAL_ACC_W | Kind::L1_WRBK_ACC | Kind::L2_WRBK_ACC
            )
        }
    }

    impl From<Kind> for stats::mem::AccessKind {
        fn from(kind: Kind) -> Self {
            match kind {
                Kind::GLOBAL_ACC_R => Self::GLOBAL_ACC_R,
                Kind::LOCAL_ACC_R => Self::LOCAL_ACC_R,
                Kind::CONST_ACC_R => Self::CONST_ACC_R,
                Kind::TEXTURE_ACC_R => Self::TEXTURE_ACC_R,
                Kind::GLOBAL_ACC_W => Self::GLOBAL_ACC_W,
                Kind::LOCAL_ACC_W => Self::LOCAL_ACC_W,
                Kind::L1_WRBK_ACC => Self::L1_WRBK_ACC,
                Kind::L2_WRBK_ACC => Self::L2_WRBK_ACC,
                Kind::INST_ACC_R => Self::INST_ACC_R,
                Kind::L1_WR_ALLOC_R => Self::L1_WR_ALLOC_R,
                Kind::L2_WR_ALLOC_R => Self::L2_WR_ALLOC_R,
            }
        }
    }

    /// A single coalesced memory transaction of a warp.
    #[derive(Clone, PartialEq, Eq, Hash)]
    pub struct MemAccess {
        pub addr: address,
        pub kind: Kind,
        pub is_write: bool,
        pub req_size_bytes: u32,
        pub warp_active_mask: crate::warp::ActiveMask,
        pub byte_mask: super::ByteMask,
        pub sector_mask: super::SectorMask,
    }

    impl std::fmt::Debug for MemAccess {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.debug_struct("MemAccess")
                .field("addr", &self.addr)
                .field("kind", &self.kind)
                .field("req_size_bytes", &self.req_size_bytes)
                .field("is_write", &self.is_write)
                .finish()
        }
    }

    impl std::fmt::Display for MemAccess {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "{:?}@{}", self.kind, self.addr)
        }
    }

    impl MemAccess {
        #[must_use]
        pub fn control_size(&self) -> u32 {
            if self.is_write {
                super::WRITE_PACKET_SIZE
            } else {
                super::READ_PACKET_SIZE
            }
        }

        #[must_use]
        pub fn data_size(&self) -> u32 {
            self.req_size_bytes
        }

        #[must_use]
        pub fn size(&self) -> u32 {
            self.data_size() + self.control_size()
        }
    }

    #[derive(Debug, Clone)]
    pub struct Builder {
        pub kind: Kind,
        pub addr: address,
        pub req_size_bytes: u32,
        pub is_write: bool,
        pub warp_active_mask: crate::warp::ActiveMask,
        pub byte_mask: super::ByteMask,
        pub sector_mask: super::SectorMask,
    }

    impl Builder {
        #[must_use]
        pub fn build(self) -> MemAccess {
            assert_eq!(self.kind.is_write(), self.is_write);
            MemAccess {
                addr: self.addr,
                kind: self.kind,
                is_write: self.is_write,
                req_size_bytes: self.req_size_bytes,
                warp_active_mask: self.warp_active_mask,
                byte_mask: self.byte_mask,
                sector_mask: self.sector_mask,
            }
        }
    }
}

static MEM_FETCH_UID: Lazy<atomic::AtomicU64> = Lazy::new(|| atomic::AtomicU64::new(0));

/// Generate a process-monotonic unique id for a fetch request.
pub fn generate_uid() -> u64 {
    MEM_FETCH_UID.fetch_add(1, atomic::Ordering::SeqCst)
}

/// A request moving through the memory hierarchy.
#[derive(Clone, Debug)]
pub struct MemFetch {
    pub uid: u64,
    pub access: access::MemAccess,
    pub instr: Option<WarpInstruction>,
    pub physical_addr: mcu::PhysicalAddress,
    pub partition_addr: address,
    pub kind: Kind,
    pub warp_id: usize,
    pub core_id: Option<usize>,
    pub cluster_id: Option<usize>,

    pub status: Status,
    pub last_status_change: Option<u64>,
    pub inject_cycle: Option<u64>,
    pub return_cycle: Option<u64>,

    /// Set when a request is divided into sector requests at the L2;
    /// points back to the original request.
    pub original_fetch: Option<Box<MemFetch>>,
}

impl std::fmt::Display for MemFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}({:?}@{})", self.kind, self.access.kind, self.addr())
    }
}

impl Eq for MemFetch {}

impl PartialEq for MemFetch {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl std::hash::Hash for MemFetch {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

#[derive(Debug, Clone)]
pub struct Builder {
    pub instr: Option<WarpInstruction>,
    pub access: access::MemAccess,
    pub warp_id: usize,
    pub core_id: Option<usize>,
    pub cluster_id: Option<usize>,
    pub physical_addr: mcu::PhysicalAddress,
    pub partition_addr: address,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> MemFetch {
        let kind = if self.access.is_write {
            Kind::WRITE_REQUEST
        } else {
            Kind::READ_REQUEST
        };
        MemFetch {
            uid: generate_uid(),
            access: self.access,
            instr: self.instr,
            warp_id: self.warp_id,
            core_id: self.core_id,
            cluster_id: self.cluster_id,
            physical_addr: self.physical_addr,
            partition_addr: self.partition_addr,
            kind,
            status: Status::INITIALIZED,
            last_status_change: None,
            inject_cycle: None,
            return_cycle: None,
            original_fetch: None,
        }
    }
}

impl MemFetch {
    #[must_use]
    pub fn addr(&self) -> address {
        self.access.addr
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.access.is_write
    }

    #[must_use]
    pub fn access_kind(&self) -> access::Kind {
        self.access.kind
    }

    #[must_use]
    pub fn data_size(&self) -> u32 {
        self.access.req_size_bytes
    }

    #[must_use]
    pub fn control_size(&self) -> u32 {
        self.access.control_size()
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.data_size() + self.control_size()
    }

    /// Size of the packet crossing the interconnect.
    ///
    /// Write (and atomic) packets carry data, read requests only control
    /// metadata.
    #[must_use]
    pub fn packet_size(&self) -> u32 {
        if self.is_write() || self.is_atomic() {
            self.size()
        } else {
            self.control_size()
        }
    }

    #[must_use]
    pub fn is_atomic(&self) -> bool {
        false
    }

    #[must_use]
    pub fn sub_partition_id(&self) -> usize {
        self.physical_addr.sub_partition as usize
    }

    pub fn set_status(&mut self, status: Status, time: u64) {
        self.status = status;
        self.last_status_change = Some(time);
    }

    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(self.kind, Kind::READ_REPLY | Kind::WRITE_ACK)
    }

    /// Turn a request into its reply.
    ///
    /// A no-op on fetches that already are replies. Writeback accesses never
    /// become replies; calling this on one is a simulator bug.
    pub fn set_reply(&mut self) {
        assert!(
            !matches!(
                self.access.kind,
                access::Kind::L1_WRBK_ACC | access::Kind::L2_WRBK_ACC
            ),
            "cannot set reply for writeback access {:?}",
            self.access.kind
        );
        match self.kind {
            Kind::READ_REQUEST => {
                debug_assert!(!self.is_write());
                self.kind = Kind::READ_REPLY;
            }
            Kind::WRITE_REQUEST => {
                debug_assert!(self.is_write());
                self.kind = Kind::WRITE_ACK;
            }
            Kind::READ_REPLY | Kind::WRITE_ACK => {}
        }
    }
}

/// Builds fetches on behalf of a component.
///
/// Cache evictions need new writeback fetches with decoded physical
/// addresses; the allocator carries the component identity and the address
/// decoder for that.
#[derive(Clone, Debug)]
pub struct Allocator {
    pub core_id: Option<usize>,
    pub cluster_id: Option<usize>,
    pub mem_controller: mcu::MemoryControllerUnit,
}

impl Allocator {
    #[must_use]
    pub fn new_fetch(
        &self,
        access: access::MemAccess,
        instr: Option<WarpInstruction>,
        warp_id: usize,
    ) -> MemFetch {
        let physical_addr = self.mem_controller.to_physical_address(access.addr);
        let partition_addr = self.mem_controller.memory_partition_address(access.addr);
        Builder {
            instr,
            access,
            warp_id,
            core_id: self.core_id,
            cluster_id: self.cluster_id,
            physical_addr,
            partition_addr,
        }
        .build()
    }
}

#[cfg(test)]
mod tests {
    use super::{access, Builder, Kind};
    use bitvec::array::BitArray;

    fn read_fetch(addr: crate::address) -> super::MemFetch {
        let access = access::Builder {
            kind: access::Kind::GLOBAL_ACC_R,
            addr,
            req_size_bytes: 128,
            is_write: false,
            warp_active_mask: BitArray::ZERO,
            byte_mask: BitArray::ZERO,
            sector_mask: BitArray::ZERO,
        }
        .build();
        Builder {
            instr: None,
            access,
            warp_id: 0,
            core_id: None,
            cluster_id: None,
            physical_addr: crate::mcu::PhysicalAddress::default(),
            partition_addr: 0,
        }
        .build()
    }

    #[test]
    fn uids_are_monotonic() {
        let first = read_fetch(0x100);
        let second = read_fetch(0x100);
        assert!(first.uid < second.uid);
        assert_ne!(first, second);
    }

    #[test]
    fn set_reply_is_idempotent() {
        let mut fetch = read_fetch(0x80);
        assert!(!fetch.is_reply());
        fetch.set_reply();
        assert_eq!(fetch.kind, Kind::READ_REPLY);
        fetch.set_reply();
        assert_eq!(fetch.kind, Kind::READ_REPLY);
        assert!(fetch.is_reply());
    }

    #[test]
    #[should_panic(expected = "writeback access")]
    fn set_reply_panics_on_writeback() {
        let access = access::Builder {
            kind: access::Kind::L1_WRBK_ACC,
            addr: 0x80,
            req_size_bytes: 128,
            is_write: true,
            warp_active_mask: BitArray::ZERO,
            byte_mask: BitArray::ZERO,
            sector_mask: BitArray::ZERO,
        }
        .build();
        let mut fetch = Builder {
            instr: None,
            access,
            warp_id: 0,
            core_id: None,
            cluster_id: None,
            physical_addr: crate::mcu::PhysicalAddress::default(),
            partition_addr: 0,
        }
        .build();
        fetch.set_reply();
    }
}
