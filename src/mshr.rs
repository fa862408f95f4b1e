use crate::{address, mem_fetch};
use std::collections::{HashMap, VecDeque};

/// Miss status holding register kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    ASSOC,        // A
    SECTOR_ASSOC, // S
}

/// Outstanding requests for one block address.
#[derive(Debug, Default)]
pub struct Entry {
    requests: VecDeque<mem_fetch::MemFetch>,
}

impl Entry {
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Miss status holding registers.
///
/// Tracks outstanding misses per block address and coalesces duplicates:
/// at most one request per key is in flight, later requests merge into the
/// entry's waiter list.
#[derive(Debug)]
pub struct Table {
    num_entries: usize,
    max_merged: usize,
    entries: HashMap<address, Entry>,
    /// Block addresses whose fill response arrived.
    ///
    /// Draining the merged requests may take several cycles.
    current_response: VecDeque<address>,
}

impl Table {
    #[must_use]
    pub fn new(num_entries: usize, max_merged: usize) -> Self {
        Self {
            num_entries,
            max_merged,
            entries: HashMap::with_capacity(num_entries),
            current_response: VecDeque::new(),
        }
    }

    /// Is there an outstanding miss for this block?
    #[must_use]
    pub fn probe(&self, block_addr: address) -> bool {
        self.entries.contains_key(&block_addr)
    }

    /// No more space for tracking a new access to this block.
    #[must_use]
    pub fn full(&self, block_addr: address) -> bool {
        match self.entries.get(&block_addr) {
            Some(entry) => entry.requests.len() >= self.max_merged,
            None => self.entries.len() >= self.num_entries,
        }
    }

    /// Add or merge an access.
    pub fn add(&mut self, block_addr: address, fetch: mem_fetch::MemFetch) {
        let entry = self.entries.entry(block_addr).or_default();
        assert!(entry.requests.len() < self.max_merged);
        entry.requests.push_back(fetch);
        assert!(self.entries.len() <= self.num_entries);
    }

    /// Accept a fill response: mark the entry ready for draining.
    pub fn mark_ready(&mut self, block_addr: address, fetch: &mem_fetch::MemFetch) {
        if let Some(entry) = self.entries.get_mut(&block_addr) {
            self.current_response.push_back(block_addr);
            if let Some(merged) = entry.requests.iter_mut().find(|f| **f == *fetch) {
                *merged = fetch.clone();
            }
        }
        log::trace!("mshr: mark_ready(block_addr={block_addr})");
        debug_assert!(self.current_response.len() <= self.entries.len());
    }

    #[must_use]
    pub fn has_ready_accesses(&self) -> bool {
        !self.current_response.is_empty()
    }

    #[must_use]
    pub fn ready_accesses(&self) -> Option<&VecDeque<mem_fetch::MemFetch>> {
        let block_addr = self.current_response.front()?;
        Some(&self.entries.get(block_addr)?.requests)
    }

    /// Pop the next ready access; removes the entry once drained.
    pub fn next_access(&mut self) -> Option<mem_fetch::MemFetch> {
        let block_addr = *self.current_response.front()?;
        let entry = self.entries.get_mut(&block_addr)?;
        debug_assert!(!entry.requests.is_empty());
        let fetch = entry.requests.pop_front();
        if entry.requests.is_empty() {
            self.entries.remove(&block_addr);
            self.current_response.pop_front();
        }
        fetch
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_response.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::Table;
    use crate::mem_fetch::{self, access};
    use bitvec::array::BitArray;

    fn load(addr: crate::address, warp_id: usize) -> mem_fetch::MemFetch {
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

    #[test]
    fn merge_returns_both_waiters_on_one_fill() {
        let mut mshrs = Table::new(16, 4);
        let block_addr = 0x8000_0000;

        let first = load(block_addr, 0);
        let second = load(block_addr + 4, 1);

        assert!(!mshrs.probe(block_addr));
        mshrs.add(block_addr, first.clone());
        assert!(mshrs.probe(block_addr));
        // merge, no second in-flight request
        mshrs.add(block_addr, second);

        assert!(!mshrs.has_ready_accesses());
        mshrs.mark_ready(block_addr, &first);
        assert!(mshrs.has_ready_accesses());

        let drained: Vec<_> = std::iter::from_fn(|| mshrs.next_access()).collect();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].warp_id, 0);
        assert_eq!(drained[1].warp_id, 1);
        assert!(!mshrs.probe(block_addr));
        assert!(!mshrs.has_ready_accesses());
    }

    #[test]
    fn full_accounts_for_entries_and_merges() {
        let mut mshrs = Table::new(1, 2);
        let block_a = 0x100;
        let block_b = 0x200;

        assert!(!mshrs.full(block_a));
        mshrs.add(block_a, load(block_a, 0));
        // new entries are full, merging into the existing one is not
        assert!(mshrs.full(block_b));
        assert!(!mshrs.full(block_a));
        mshrs.add(block_a, load(block_a, 1));
        assert!(mshrs.full(block_a));
    }
}
