use super::mem::AccessKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::IntoEnumIterator;

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
pub enum RequestStatus {
    HIT = 0,
    HIT_RESERVED,
    MISS,
    RESERVATION_FAIL,
    SECTOR_MISS,
    MSHR_HIT,
}

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
pub enum ReservationFailure {
    /// all lines are reserved
    LINE_ALLOC_FAIL = 0,
    /// miss queue (i.e. interconnect or DRAM) is full
    MISS_QUEUE_FULL,
    MSHR_ENTRY_FAIL,
    MSHR_MERGE_ENTRY_FAIL,
    MSHR_RW_PENDING,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessStat {
    ReservationFailure(ReservationFailure),
    Status(RequestStatus),
}

/// Per-cache access outcome histogram.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    /// Serialized as a sorted list: JSON maps need string keys.
    #[serde(with = "flat_accesses")]
    pub accesses: HashMap<(AccessKind, AccessStat), u64>,
}

mod flat_accesses {
    use super::{AccessKind, AccessStat};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    type Flat = Vec<((AccessKind, AccessStat), u64)>;

    pub fn serialize<S: Serializer>(
        map: &HashMap<(AccessKind, AccessStat), u64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut flat: Flat = map.iter().map(|(key, count)| (*key, *count)).collect();
        flat.sort_by_key(|(key, _)| *key);
        flat.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<(AccessKind, AccessStat), u64>, D::Error> {
        let flat = Flat::deserialize(deserializer)?;
        Ok(flat.into_iter().collect())
    }
}

impl Default for Cache {
    fn default() -> Self {
        let mut accesses = HashMap::new();
        for access_kind in AccessKind::iter() {
            for status in RequestStatus::iter() {
                accesses.insert((access_kind, AccessStat::Status(status)), 0);
            }
            for failure in ReservationFailure::iter() {
                accesses.insert((access_kind, AccessStat::ReservationFailure(failure)), 0);
            }
        }
        Self { accesses }
    }
}

impl Cache {
    pub fn inc(&mut self, kind: AccessKind, access_stat: AccessStat, count: u64) {
        *self.accesses.entry((kind, access_stat)).or_insert(0) += count;
    }

    fn count_status(&self, status: RequestStatus) -> u64 {
        self.accesses
            .iter()
            .filter(|((_, stat), _)| *stat == AccessStat::Status(status))
            .map(|(_, count)| count)
            .sum()
    }

    #[must_use]
    pub fn num_hits(&self) -> u64 {
        self.count_status(RequestStatus::HIT)
    }

    #[must_use]
    pub fn num_misses(&self) -> u64 {
        self.count_status(RequestStatus::MISS)
    }

    #[must_use]
    pub fn num_pending_hits(&self) -> u64 {
        self.count_status(RequestStatus::HIT_RESERVED)
    }

    #[must_use]
    pub fn num_mshr_hits(&self) -> u64 {
        self.count_status(RequestStatus::MSHR_HIT)
    }

    #[must_use]
    pub fn num_reservation_failures(&self) -> u64 {
        self.accesses
            .iter()
            .filter(|((_, stat), _)| matches!(stat, AccessStat::ReservationFailure(_)))
            .map(|(_, count)| count)
            .sum()
    }

    #[must_use]
    pub fn num_accesses_of_kind(&self, kind: AccessKind) -> u64 {
        self.accesses
            .iter()
            .filter(|((access_kind, stat), _)| {
                *access_kind == kind && matches!(stat, AccessStat::Status(_))
            })
            .map(|(_, count)| count)
            .sum()
    }

    #[must_use]
    pub fn total_accesses(&self) -> u64 {
        self.accesses
            .iter()
            .filter(|((_, stat), _)| matches!(stat, AccessStat::Status(_)))
            .map(|(_, count)| count)
            .sum()
    }
}

impl std::ops::AddAssign for Cache {
    fn add_assign(&mut self, other: Self) {
        for (key, count) in other.accesses {
            *self.accesses.entry(key).or_insert(0) += count;
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut accesses: Vec<_> = self
            .accesses
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|((access_kind, access_stat), count)| {
                let key = match access_stat {
                    AccessStat::Status(status) => format!("{access_kind:?}[{status:?}]"),
                    AccessStat::ReservationFailure(failure) => {
                        format!("{access_kind:?}[{failure:?}]")
                    }
                };
                (key, count)
            })
            .collect();
        accesses.sort_by_key(|(key, _)| key.clone());

        let mut out = f.debug_struct("Cache");
        for (key, count) in accesses {
            out.field(&key, count);
        }
        out.finish_non_exhaustive()
    }
}

/// One `Cache` histogram per physical cache instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerCache {
    pub inner: Vec<Cache>,
}

impl PerCache {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            inner: (0..size).map(|_| Cache::default()).collect(),
        }
    }

    #[must_use]
    pub fn get(&self, id: usize) -> &Cache {
        &self.inner[id]
    }

    pub fn get_mut(&mut self, id: usize) -> &mut Cache {
        &mut self.inner[id]
    }

    /// Sum all per-instance histograms into one.
    #[must_use]
    pub fn reduce(&self) -> Cache {
        let mut out = Cache::default();
        for stats in &self.inner {
            out += stats.clone();
        }
        out
    }
}
