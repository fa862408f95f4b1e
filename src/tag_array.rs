use crate::cache::block::{self, Line};
use crate::{address, cache, config, mem_fetch};

use std::collections::HashMap;
use std::sync::Arc;

pub type LineTable = HashMap<address, u64>;

/// What got thrown out of the cache to make room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictedBlockInfo {
    pub block_addr: address,
    pub modified_size: u32,
    pub byte_mask: mem_fetch::ByteMask,
    pub sector_mask: mem_fetch::SectorMask,
}

#[derive(Debug)]
pub struct AccessStatus {
    pub index: Option<usize>,
    pub writeback: bool,
    pub evicted: Option<EvictedBlockInfo>,
    pub status: cache::RequestStatus,
}

/// Set-associative tag array.
#[derive(Debug)]
pub struct TagArray {
    pub lines: Vec<Line>,
    config: Arc<config::Cache>,
    num_access: u64,
    num_miss: u64,
    num_pending_hit: u64,
    num_reservation_fail: u64,
    pub num_dirty: usize,
    pending_lines: LineTable,
}

impl TagArray {
    #[must_use]
    pub fn new(config: Arc<config::Cache>) -> Self {
        let lines = (0..config.total_lines()).map(|_| Line::default()).collect();
        Self {
            lines,
            config,
            num_access: 0,
            num_miss: 0,
            num_pending_hit: 0,
            num_reservation_fail: 0,
            num_dirty: 0,
            pending_lines: LineTable::new(),
        }
    }

    /// For non-sectored caches the whole line moves together.
    fn effective_mask(&self, mask: &mem_fetch::SectorMask) -> mem_fetch::SectorMask {
        if self.config.mshr_kind == crate::mshr::Kind::SECTOR_ASSOC {
            *mask
        } else {
            let mut full: mem_fetch::SectorMask = bitvec::array::BitArray::ZERO;
            full.fill(true);
            full
        }
    }

    /// Probe the tag array without modifying it.
    ///
    /// Returns the way index (replacement candidate on a miss) and the
    /// request status. Reserved lines are never eviction candidates; if all
    /// ways of the set are reserved the probe fails with
    /// `RESERVATION_FAIL`.
    #[must_use]
    pub fn probe(
        &self,
        block_addr: address,
        mask: &mem_fetch::SectorMask,
        is_write: bool,
    ) -> (Option<usize>, cache::RequestStatus) {
        let mask = self.effective_mask(mask);
        let set_index = self.config.set_index(block_addr) as usize;
        let tag = self.config.tag(block_addr);

        let mut invalid_line = None;
        let mut valid_line = None;
        let mut valid_time = u64::MAX;
        let mut all_reserved = true;

        let dirty_line_percent =
            (self.num_dirty as f64 / self.config.total_lines() as f64 * 100.0) as usize;

        for way in 0..self.config.associativity {
            let idx = set_index * self.config.associativity + way;
            let line = &self.lines[idx];
            if line.tag == tag && !line.is_invalid() {
                match line.status(&mask) {
                    block::Status::RESERVED => {
                        return (Some(idx), cache::RequestStatus::HIT_RESERVED);
                    }
                    block::Status::VALID => {
                        return (Some(idx), cache::RequestStatus::HIT);
                    }
                    block::Status::MODIFIED => {
                        let status = if is_write || line.is_readable(&mask) {
                            cache::RequestStatus::HIT
                        } else {
                            cache::RequestStatus::SECTOR_MISS
                        };
                        return (Some(idx), status);
                    }
                    block::Status::INVALID => {
                        return (Some(idx), cache::RequestStatus::SECTOR_MISS);
                    }
                }
            }
            if !line.is_reserved() {
                // only evict clean lines until the dirty ratio passes the
                // configured limit
                if !line.is_modified()
                    || dirty_line_percent >= self.config.l1_cache_write_ratio_percent
                {
                    all_reserved = false;
                    if line.is_invalid() {
                        invalid_line = Some(idx);
                    } else {
                        let time = match self.config.replacement_policy {
                            config::ReplacementPolicy::LRU => line.last_access_time(),
                            config::ReplacementPolicy::FIFO => line.alloc_time(),
                        };
                        if time < valid_time {
                            valid_time = time;
                            valid_line = Some(idx);
                        }
                    }
                }
            }
        }

        if all_reserved {
            // miss, and not enough space to allocate on miss
            return (None, cache::RequestStatus::RESERVATION_FAIL);
        }

        let index = match (valid_line, invalid_line) {
            (_, Some(invalid)) => invalid,
            (Some(valid), None) => valid,
            (None, None) => panic!("found neither a valid nor an invalid cache line"),
        };
        (Some(index), cache::RequestStatus::MISS)
    }

    /// Access the tag array, allocating on miss per policy.
    #[must_use]
    pub fn access(
        &mut self,
        block_addr: address,
        fetch: &mem_fetch::MemFetch,
        time: u64,
    ) -> AccessStatus {
        log::trace!("tag_array::access({fetch}, time={time})");
        self.num_access += 1;

        let mask = self.effective_mask(&fetch.access.sector_mask);
        let mut writeback = false;
        let mut evicted = None;

        let (index, status) = self.probe(block_addr, &fetch.access.sector_mask, fetch.is_write());
        match status {
            cache::RequestStatus::HIT | cache::RequestStatus::HIT_RESERVED => {
                if status == cache::RequestStatus::HIT_RESERVED {
                    self.num_pending_hit += 1;
                }
                let line = &mut self.lines[index.expect("hit has index")];
                line.set_last_access_time(time);
            }
            cache::RequestStatus::MISS => {
                self.num_miss += 1;
                let index = index.expect("miss has replacement index");
                if self.config.allocate_policy == config::AllocatePolicy::ON_MISS {
                    let line = &mut self.lines[index];
                    if line.is_modified() {
                        writeback = true;
                        evicted = Some(EvictedBlockInfo {
                            block_addr: line.block_addr,
                            modified_size: line.modified_size(),
                            byte_mask: line.dirty_byte_mask(),
                            sector_mask: line.dirty_sector_mask(),
                        });
                        self.num_dirty -= 1;
                    }
                    line.allocate(
                        self.config.tag(block_addr),
                        self.config.block_addr(block_addr),
                        &mask,
                        time,
                    );
                }
            }
            cache::RequestStatus::SECTOR_MISS => {
                debug_assert_eq!(self.config.mshr_kind, crate::mshr::Kind::SECTOR_ASSOC);
                if self.config.allocate_policy == config::AllocatePolicy::ON_MISS {
                    let line = &mut self.lines[index.expect("sector miss has index")];
                    let was_modified = line.is_modified();
                    line.allocate_sector(&mask, time);
                    if was_modified && !line.is_modified() {
                        self.num_dirty -= 1;
                    }
                }
            }
            cache::RequestStatus::RESERVATION_FAIL => {
                self.num_reservation_fail += 1;
            }
            cache::RequestStatus::MSHR_HIT => {
                panic!("tag_array access: MSHR_HIT should never be returned by a probe");
            }
        }
        AccessStatus {
            index,
            writeback,
            evicted,
            status,
        }
    }

    /// Fill a line that was allocated (reserved) when the miss was sent.
    pub fn fill_on_miss(&mut self, cache_index: usize, fetch: &mem_fetch::MemFetch, time: u64) {
        debug_assert!(self.config.allocate_policy == config::AllocatePolicy::ON_MISS);
        let mask = self.effective_mask(&fetch.access.sector_mask);
        let was_modified = self.lines[cache_index].is_modified();
        self.lines[cache_index].fill(&mask, &fetch.access.byte_mask, time);
        if self.lines[cache_index].is_modified() && !was_modified {
            self.num_dirty += 1;
        }
    }

    /// Allocate and fill a line when the response returns.
    pub fn fill_on_fill(
        &mut self,
        addr: address,
        sector_mask: &mem_fetch::SectorMask,
        byte_mask: &mem_fetch::ByteMask,
        is_write: bool,
        time: u64,
    ) {
        let mask = self.effective_mask(sector_mask);
        let (index, probe_status) = self.probe(addr, sector_mask, is_write);
        if probe_status == cache::RequestStatus::RESERVATION_FAIL {
            return;
        }
        let index = index.unwrap();
        let line = &mut self.lines[index];
        let mut was_modified = line.is_modified();

        if probe_status == cache::RequestStatus::MISS {
            line.allocate(
                self.config.tag(addr),
                self.config.block_addr(addr),
                &mask,
                time,
            );
        } else if probe_status == cache::RequestStatus::SECTOR_MISS {
            line.allocate_sector(&mask, time);
        }
        if was_modified && !line.is_modified() {
            self.num_dirty -= 1;
        }
        was_modified = line.is_modified();
        line.fill(&mask, byte_mask, time);
        if line.is_modified() && !was_modified {
            self.num_dirty += 1;
        }
    }

    /// Flush all modified lines. Returns the number flushed.
    pub fn flush(&mut self) -> usize {
        let mut flushed = 0;
        for line in &mut self.lines {
            if line.is_modified() {
                let mut all: mem_fetch::SectorMask = bitvec::array::BitArray::ZERO;
                all.fill(true);
                line.set_status(block::Status::INVALID, &all);
                flushed += 1;
            }
        }
        self.num_dirty = 0;
        flushed
    }

    pub fn invalidate(&mut self) {
        for line in &mut self.lines {
            let mut all: mem_fetch::SectorMask = bitvec::array::BitArray::ZERO;
            all.fill(true);
            line.set_status(block::Status::INVALID, &all);
        }
        self.num_dirty = 0;
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.lines.len()
    }

    pub fn get_block_mut(&mut self, idx: usize) -> &mut Line {
        &mut self.lines[idx]
    }

    #[must_use]
    pub fn get_block(&self, idx: usize) -> &Line {
        &self.lines[idx]
    }

    pub fn add_pending_line(&mut self, fetch: &mem_fetch::MemFetch) {
        let addr = self.config.block_addr(fetch.addr());
        self.pending_lines.entry(addr).or_insert(fetch.uid);
    }

    pub fn remove_pending_line(&mut self, fetch: &mem_fetch::MemFetch) {
        let addr = self.config.block_addr(fetch.addr());
        self.pending_lines.remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::TagArray;
    use crate::cache::testing::{read_fetch, write_fetch};
    use crate::{cache, config};
    use std::sync::Arc;

    fn small_cache() -> Arc<config::Cache> {
        // 4 sets, 128B lines, 2-way, LRU write-back on-miss
        Arc::new("4:128:2,L:B:m:N,A:16:8,4".parse().unwrap())
    }

    #[test]
    fn lru_evicts_least_recently_used_way() {
        let config = small_cache();
        let mut tags = TagArray::new(config.clone());

        // two lines mapping to set 0 fill both ways
        let a = read_fetch(0x0000, 0);
        let b = read_fetch(0x0000 + 4 * 128, 0);
        let c = read_fetch(0x0000 + 8 * 128, 0);

        let status = tags.access(config.block_addr(a.addr()), &a, 1);
        assert_eq!(status.status, cache::RequestStatus::MISS);
        tags.fill_on_miss(status.index.unwrap(), &a, 2);

        let status = tags.access(config.block_addr(b.addr()), &b, 3);
        assert_eq!(status.status, cache::RequestStatus::MISS);
        tags.fill_on_miss(status.index.unwrap(), &b, 4);

        // touch a to make b least recently used
        let status = tags.access(config.block_addr(a.addr()), &a, 5);
        assert_eq!(status.status, cache::RequestStatus::HIT);

        // c evicts b
        let status = tags.access(config.block_addr(c.addr()), &c, 6);
        assert_eq!(status.status, cache::RequestStatus::MISS);
        tags.fill_on_miss(status.index.unwrap(), &c, 7);

        let status = tags.access(config.block_addr(a.addr()), &a, 8);
        assert_eq!(status.status, cache::RequestStatus::HIT);
        let (_, probe) = tags.probe(config.block_addr(b.addr()), &b.access.sector_mask, false);
        assert_eq!(probe, cache::RequestStatus::MISS);
    }

    #[test]
    fn reserved_lines_are_not_evicted() {
        let config = small_cache();
        let mut tags = TagArray::new(config.clone());

        // reserve both ways of set 0 without filling
        let a = read_fetch(0x0000, 0);
        let b = read_fetch(0x0000 + 4 * 128, 0);
        let c = read_fetch(0x0000 + 8 * 128, 0);
        let status = tags.access(config.block_addr(a.addr()), &a, 1);
        assert_eq!(status.status, cache::RequestStatus::MISS);
        let status = tags.access(config.block_addr(b.addr()), &b, 2);
        assert_eq!(status.status, cache::RequestStatus::MISS);

        // all ways reserved: line allocation fails
        let status = tags.access(config.block_addr(c.addr()), &c, 3);
        assert_eq!(status.status, cache::RequestStatus::RESERVATION_FAIL);
        assert_eq!(status.index, None);
    }

    #[test]
    fn dirty_eviction_reports_writeback() {
        let config = small_cache();
        let mut tags = TagArray::new(config.clone());

        let a = write_fetch(0x0000, 0);
        let status = tags.access(config.block_addr(a.addr()), &a, 1);
        assert_eq!(status.status, cache::RequestStatus::MISS);
        let index = status.index.unwrap();
        tags.fill_on_miss(index, &a, 2);
        tags.get_block_mut(index)
            .set_status(crate::cache::block::Status::MODIFIED, &a.access.sector_mask);
        tags.num_dirty += 1;

        // fill the other way, then evict the dirty line
        let b = read_fetch(0x0000 + 4 * 128, 0);
        let status = tags.access(config.block_addr(b.addr()), &b, 3);
        tags.fill_on_miss(status.index.unwrap(), &b, 4);

        let c = read_fetch(0x0000 + 8 * 128, 0);
        let status = tags.access(config.block_addr(c.addr()), &c, 5);
        assert_eq!(status.status, cache::RequestStatus::MISS);
        assert!(status.writeback);
        let evicted = status.evicted.unwrap();
        assert_eq!(evicted.block_addr, 0x0000);
        assert!(evicted.modified_size > 0);
    }
}
