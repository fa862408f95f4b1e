use crate::fifo::Fifo;
use crate::{cache, config, mem_fetch};

use bitvec::array::BitArray;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Largest single memory access (one cache line).
pub const MAX_MEMORY_ACCESS_SIZE: u32 = 128;
/// Sectors per line.
pub const SECTOR_CHUNK_SIZE: usize = 4;
/// Sector size in bytes.
pub const SECTOR_SIZE: u32 = 32;

pub const ROP_QUEUE_STATUS: mem_fetch::Status = mem_fetch::Status::IN_PARTITION_ROP_DELAY;

/// A memory sub partition: the L2 slice and its queues.
///
/// Requests arrive from the interconnect, are split into sector requests,
/// probe the L2, and either return as replies or continue to DRAM.
pub struct MemSubPartition {
    /// Global sub partition id.
    pub id: usize,
    pub partition_id: usize,
    config: Arc<config::GPU>,

    pub l2_cache: Option<cache::Data>,

    interconn_to_l2_queue: Fifo<mem_fetch::MemFetch>,
    l2_to_dram_queue: Fifo<mem_fetch::MemFetch>,
    dram_to_l2_queue: Fifo<mem_fetch::MemFetch>,
    l2_to_interconn_queue: Fifo<mem_fetch::MemFetch>,
    rop_queue: VecDeque<(u64, mem_fetch::MemFetch)>,

    /// Originals of sector-split requests, by original uid, with the
    /// number of children still in flight.
    pending_originals: HashMap<u64, (mem_fetch::MemFetch, usize)>,

    pub accesses: stats::Accesses,
}

impl std::fmt::Debug for MemSubPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemSubPartition")
            .field("id", &self.id)
            .field("interconn_to_l2", &self.interconn_to_l2_queue.len())
            .field("l2_to_dram", &self.l2_to_dram_queue.len())
            .field("dram_to_l2", &self.dram_to_l2_queue.len())
            .field("l2_to_interconn", &self.l2_to_interconn_queue.len())
            .finish()
    }
}

impl MemSubPartition {
    #[must_use]
    pub fn new(
        id: usize,
        partition_id: usize,
        fetch_allocator: mem_fetch::Allocator,
        config: Arc<config::GPU>,
    ) -> Self {
        let l2_cache = config.data_cache_l2.as_ref().map(|cache_config| {
            cache::Data::new(
                format!("sub-partition-{id}-L2"),
                id,
                cache_config.clone(),
                fetch_allocator.clone(),
                mem_fetch::Status::IN_PARTITION_L2_MISS_QUEUE,
                mem_fetch::access::Kind::L2_WRBK_ACC,
                mem_fetch::access::Kind::L2_WR_ALLOC_R,
            )
        });
        Self {
            id,
            partition_id,
            config,
            l2_cache,
            interconn_to_l2_queue: Fifo::new(Some(8)),
            l2_to_dram_queue: Fifo::new(Some(8)),
            dram_to_l2_queue: Fifo::new(Some(8)),
            l2_to_interconn_queue: Fifo::new(Some(8)),
            rop_queue: VecDeque::new(),
            pending_originals: HashMap::new(),
            accesses: stats::Accesses::default(),
        }
    }

    /// Worst case queue slots needed for a request of `size` bytes.
    fn sector_chunks(size: u32) -> usize {
        size.div_ceil(SECTOR_SIZE) as usize
    }

    /// Can a fetch of `size` bytes enter this cycle?
    #[must_use]
    pub fn full(&self, size: u32) -> bool {
        !self.interconn_to_l2_queue.can_fit(Self::sector_chunks(size))
    }

    /// Split a request larger than one sector into per-sector children
    /// pointing back at the original.
    fn breakdown_request_to_sector_requests(
        &mut self,
        fetch: mem_fetch::MemFetch,
    ) -> Vec<mem_fetch::MemFetch> {
        if fetch.data_size() <= SECTOR_SIZE {
            return vec![fetch];
        }
        let line_addr = fetch.addr() & !u64::from(MAX_MEMORY_ACCESS_SIZE - 1);
        let sector_mask = fetch.access.sector_mask;
        let sectors: Vec<usize> = if sector_mask.not_any() {
            (0..SECTOR_CHUNK_SIZE).collect()
        } else {
            sector_mask.iter_ones().collect()
        };

        let mut children = Vec::with_capacity(sectors.len());
        for sector in &sectors {
            let mut child_sector_mask: mem_fetch::SectorMask = BitArray::ZERO;
            child_sector_mask.set(*sector, true);
            let access = mem_fetch::access::Builder {
                kind: fetch.access.kind,
                addr: line_addr + *sector as u64 * u64::from(SECTOR_SIZE),
                req_size_bytes: SECTOR_SIZE,
                is_write: fetch.is_write(),
                warp_active_mask: fetch.access.warp_active_mask,
                byte_mask: fetch.access.byte_mask,
                sector_mask: child_sector_mask,
            }
            .build();
            let mut child = mem_fetch::Builder {
                instr: None,
                access,
                warp_id: fetch.warp_id,
                core_id: fetch.core_id,
                cluster_id: fetch.cluster_id,
                physical_addr: fetch.physical_addr,
                partition_addr: fetch.partition_addr,
            }
            .build();
            child.kind = fetch.kind;
            child.original_fetch = Some(Box::new(fetch.clone()));
            children.push(child);
        }
        log::debug!(
            "sub partition {}: split {fetch} into {} sector requests",
            self.id,
            children.len()
        );
        self.pending_originals
            .insert(fetch.uid, (fetch, children.len()));
        children
    }

    /// Accept a request from the interconnect.
    pub fn push(&mut self, fetch: mem_fetch::MemFetch, cycle: u64) {
        debug_assert!(!self.full(fetch.data_size()));
        self.accesses.inc(fetch.access_kind().into(), 1);

        for mut fetch in self.breakdown_request_to_sector_requests(fetch) {
            if self.config.rop_latency > 0 {
                fetch.set_status(ROP_QUEUE_STATUS, cycle);
                self.rop_queue
                    .push_back((cycle + self.config.rop_latency, fetch));
            } else {
                fetch.set_status(mem_fetch::Status::IN_PARTITION_ICNT_TO_L2_QUEUE, cycle);
                self.interconn_to_l2_queue.enqueue(fetch);
            }
        }
    }

    /// A child completed; returns the finished original once all children
    /// are accounted for, or the fetch itself if it was never split.
    fn assemble_reply(&mut self, mut fetch: mem_fetch::MemFetch, cycle: u64) -> Option<mem_fetch::MemFetch> {
        if let Some(original) = fetch.original_fetch.take() {
            fetch.set_status(mem_fetch::Status::DELETED, cycle);
            let (_, remaining) = self
                .pending_originals
                .get_mut(&original.uid)
                .expect("split original tracked");
            *remaining -= 1;
            if *remaining == 0 {
                let (mut original, _) = self.pending_originals.remove(&original.uid).unwrap();
                original.set_reply();
                return Some(original);
            }
            return None;
        }
        fetch.set_reply();
        Some(fetch)
    }

    fn push_reply(&mut self, fetch: mem_fetch::MemFetch, cycle: u64) {
        if let Some(mut reply) = self.assemble_reply(fetch, cycle) {
            reply.set_status(mem_fetch::Status::IN_PARTITION_L2_TO_ICNT_QUEUE, cycle);
            self.l2_to_interconn_queue.enqueue(reply);
        }
    }

    /// One L2 cycle.
    pub fn cache_cycle(&mut self, cycle: u64) {
        // rop delay elapsed
        if self
            .rop_queue
            .front()
            .is_some_and(|(ready, _)| *ready <= cycle)
            && !self.interconn_to_l2_queue.full()
        {
            let (_, mut fetch) = self.rop_queue.pop_front().unwrap();
            fetch.set_status(mem_fetch::Status::IN_PARTITION_ICNT_TO_L2_QUEUE, cycle);
            self.interconn_to_l2_queue.enqueue(fetch);
        }

        // L2 misses continue towards DRAM
        if !self.l2_to_dram_queue.full() {
            if let Some(fetch) = self.l2_cache.as_mut().and_then(cache::Data::miss_queue_pop) {
                let mut fetch = fetch;
                fetch.set_status(mem_fetch::Status::IN_PARTITION_L2_TO_DRAM_QUEUE, cycle);
                self.l2_to_dram_queue.enqueue(fetch);
            }
        }

        // serviced misses return to the requesters
        if !self.l2_to_interconn_queue.full() {
            if let Some(fetch) = self.l2_cache.as_mut().and_then(cache::Data::next_access) {
                if fetch.access_kind() == mem_fetch::access::Kind::L2_WR_ALLOC_R {
                    // allocation read, nothing to return
                    let mut fetch = fetch;
                    fetch.set_status(mem_fetch::Status::DELETED, cycle);
                } else {
                    self.push_reply(fetch, cycle);
                }
            }
        }

        // returns from DRAM
        if let Some(front) = self.dram_to_l2_queue.first() {
            let waiting_for_fill = self
                .l2_cache
                .as_ref()
                .is_some_and(|l2| l2.waiting_for_fill(front));
            if waiting_for_fill {
                let fetch = self.dram_to_l2_queue.dequeue().unwrap();
                let l2 = self.l2_cache.as_mut().unwrap();
                l2.fill(fetch, cycle);
            } else if front.is_write() {
                let is_writeback = matches!(
                    front.access_kind(),
                    mem_fetch::access::Kind::L1_WRBK_ACC | mem_fetch::access::Kind::L2_WRBK_ACC
                );
                if is_writeback {
                    // writeback traffic terminates here
                    let mut fetch = self.dram_to_l2_queue.dequeue().unwrap();
                    fetch.set_status(mem_fetch::Status::DELETED, cycle);
                } else if !self.l2_to_interconn_queue.full() {
                    let fetch = self.dram_to_l2_queue.dequeue().unwrap();
                    self.push_reply(fetch, cycle);
                }
            } else if !self.l2_to_interconn_queue.full() {
                // read that bypassed the L2
                let fetch = self.dram_to_l2_queue.dequeue().unwrap();
                self.push_reply(fetch, cycle);
            }
        }

        // requests from the interconnect probe the L2
        if self.interconn_to_l2_queue.first().is_some() {
            if self.l2_cache.is_some() {
                if !self.l2_to_interconn_queue.full() {
                    let attempt = self.interconn_to_l2_queue.first().unwrap().clone();
                    let mut events = Vec::new();
                    let status = self.l2_cache.as_mut().unwrap().access(
                        attempt.addr(),
                        attempt,
                        &mut events,
                        cycle,
                    );
                    if status != cache::RequestStatus::RESERVATION_FAIL {
                        let fetch = self.interconn_to_l2_queue.dequeue().unwrap();
                        if status == cache::RequestStatus::HIT {
                            let is_writeback = matches!(
                                fetch.access_kind(),
                                mem_fetch::access::Kind::L1_WRBK_ACC
                                    | mem_fetch::access::Kind::L2_WRBK_ACC
                            );
                            if fetch.is_write() && is_writeback {
                                let mut fetch = fetch;
                                fetch.set_status(mem_fetch::Status::DELETED, cycle);
                            } else {
                                // read hits and write hit acks reply
                                // immediately
                                self.push_reply(fetch, cycle);
                            }
                        }
                        // on a miss the L2 tracks the request; the queued
                        // copy is dropped
                    }
                }
            } else if !self.l2_to_dram_queue.full() {
                // no L2: pass through to DRAM
                let mut fetch = self.interconn_to_l2_queue.dequeue().unwrap();
                fetch.set_status(mem_fetch::Status::IN_PARTITION_L2_TO_DRAM_QUEUE, cycle);
                self.l2_to_dram_queue.enqueue(fetch);
            }
        }
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        !self.interconn_to_l2_queue.is_empty()
            || !self.l2_to_dram_queue.is_empty()
            || !self.dram_to_l2_queue.is_empty()
            || !self.l2_to_interconn_queue.is_empty()
            || !self.rop_queue.is_empty()
            || !self.pending_originals.is_empty()
            || self
                .l2_cache
                .as_ref()
                .is_some_and(cache::Data::has_ready_accesses)
    }

    #[must_use]
    pub fn interconn_reply_front(&self) -> Option<&mem_fetch::MemFetch> {
        self.l2_to_interconn_queue.first()
    }

    pub fn pop_interconn_reply(&mut self) -> Option<mem_fetch::MemFetch> {
        self.l2_to_interconn_queue.dequeue()
    }

    #[must_use]
    pub fn dram_to_l2_full(&self) -> bool {
        self.dram_to_l2_queue.full()
    }

    pub fn dram_to_l2_push(&mut self, mut fetch: mem_fetch::MemFetch, cycle: u64) {
        fetch.set_status(mem_fetch::Status::IN_PARTITION_DRAM_TO_L2_QUEUE, cycle);
        self.dram_to_l2_queue.enqueue(fetch);
    }

    #[must_use]
    pub fn l2_to_dram_front(&self) -> Option<&mem_fetch::MemFetch> {
        self.l2_to_dram_queue.first()
    }

    pub fn l2_to_dram_pop(&mut self) -> Option<mem_fetch::MemFetch> {
        self.l2_to_dram_queue.dequeue()
    }

    pub fn flush_l2(&mut self) -> usize {
        self.l2_cache.as_mut().map_or(0, cache::Data::flush)
    }

    pub fn invalidate_l2(&mut self) {
        if let Some(ref mut l2) = self.l2_cache {
            l2.invalidate();
        }
    }

    /// Mark a line resident after a simulated host-to-device copy.
    pub fn force_l2_tag_update(&mut self, addr: crate::address, cycle: u64) {
        if let Some(ref mut l2) = self.l2_cache {
            let sector = (addr >> SECTOR_SIZE.trailing_zeros())
                % SECTOR_CHUNK_SIZE as u64;
            let mut mask: mem_fetch::SectorMask = BitArray::ZERO;
            mask.set(sector as usize, true);
            l2.force_tag_update(addr, mask, cycle);
        }
    }

    #[must_use]
    pub fn l2_stats(&self) -> Option<&stats::Cache> {
        self.l2_cache.as_ref().map(cache::Data::stats)
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::testing::read_fetch;
    use crate::{config, mcu, mem_fetch};
    use std::sync::Arc;

    fn sub_partition() -> super::MemSubPartition {
        let config = Arc::new(config::GPU::default());
        let allocator = mem_fetch::Allocator {
            core_id: None,
            cluster_id: None,
            mem_controller: mcu::MemoryControllerUnit::new(&config),
        };
        super::MemSubPartition::new(0, 0, allocator, config)
    }

    #[test]
    fn large_requests_split_into_sectors() {
        let mut sub = sub_partition();
        let fetch = read_fetch(0x8000_0000, 0);
        assert_eq!(fetch.data_size(), 128);
        let uid = fetch.uid;

        sub.push(fetch, 0);
        assert_eq!(sub.interconn_to_l2_queue.len(), 4);
        for (sector, child) in sub.interconn_to_l2_queue.iter().enumerate() {
            assert_eq!(child.data_size(), super::SECTOR_SIZE);
            assert_eq!(
                child.addr(),
                0x8000_0000 + sector as u64 * u64::from(super::SECTOR_SIZE)
            );
            assert_eq!(child.original_fetch.as_ref().unwrap().uid, uid);
        }
    }

    #[test]
    fn small_requests_are_not_split() {
        let mut sub = sub_partition();
        let mut fetch = read_fetch(0x8000_0000, 0);
        fetch.access.req_size_bytes = 32;
        sub.push(fetch, 0);
        assert_eq!(sub.interconn_to_l2_queue.len(), 1);
        assert!(sub.pending_originals.is_empty());
    }

    #[test]
    fn split_read_completes_once_all_children_return() {
        let mut sub = sub_partition();
        let fetch = read_fetch(0x8000_0000, 0);
        let uid = fetch.uid;
        sub.push(fetch, 0);

        // drive the L2: the first child misses, the rest merge in the mshr
        let mut cycle = 0;
        while sub.l2_to_dram_queue.is_empty() && cycle < 100 {
            sub.cache_cycle(cycle);
            cycle += 1;
        }
        for _ in 0..8 {
            sub.cache_cycle(cycle);
            cycle += 1;
        }
        assert_eq!(
            sub.l2_to_dram_queue.len(),
            1,
            "one outstanding line fetch, three merged sector accesses"
        );
        let l2_stats = sub.l2_stats().unwrap();
        assert_eq!(l2_stats.num_misses(), 1);
        assert_eq!(l2_stats.num_pending_hits() + l2_stats.num_mshr_hits(), 6);

        // pretend DRAM returned the line
        let to_dram = sub.l2_to_dram_pop().unwrap();
        sub.dram_to_l2_push(to_dram, cycle);
        for _ in 0..16 {
            sub.cache_cycle(cycle);
            cycle += 1;
        }

        // exactly one reply: the reassembled original
        let reply = sub.pop_interconn_reply().expect("reply for original");
        assert_eq!(reply.uid, uid);
        assert!(reply.is_reply());
        assert!(sub.pop_interconn_reply().is_none());
        assert!(sub.pending_originals.is_empty());
    }
}
