use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(
    Debug,
    strum::EnumIter,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum AccessKind {
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

impl AccessKind {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(
            self,
            AccessKind::GLOBAL_ACC_W
                | AccessKind::LOCAL_ACC_W
                | AccessKind::L1_WRBK_ACC
                | AccessKind::L2_WRBK_ACC
        )
    }
}

/// Memory accesses issued into the memory subsystem, by kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accesses {
    pub inner: HashMap<AccessKind, u64>,
}

impl Accesses {
    pub fn inc(&mut self, kind: AccessKind, count: u64) {
        *self.inner.entry(kind).or_insert(0) += count;
    }

    #[must_use]
    pub fn num_writes(&self) -> u64 {
        self.inner
            .iter()
            .filter(|(kind, _)| kind.is_write())
            .map(|(_, count)| count)
            .sum()
    }

    #[must_use]
    pub fn num_reads(&self) -> u64 {
        self.inner
            .iter()
            .filter(|(kind, _)| !kind.is_write())
            .map(|(_, count)| count)
            .sum()
    }
}

impl std::ops::AddAssign for Accesses {
    fn add_assign(&mut self, other: Self) {
        for (kind, count) in other.inner {
            *self.inner.entry(kind).or_insert(0) += count;
        }
    }
}
