use super::base::Base;
use crate::{address, cache, config, mem_fetch};

use bitvec::array::BitArray;
use std::collections::VecDeque;
use std::sync::Arc;

/// Data cache, used for both the per-core L1D and the per-partition L2.
///
/// Implements write policies on top of [`Base`]: write-back and
/// write-through hits, no-write-allocate and (naive) write-allocate
/// misses.
#[derive(Debug)]
pub struct Data {
    pub inner: Base,
    /// Access kind of writeback fetches this cache emits on dirty
    /// evictions.
    write_back_kind: mem_fetch::access::Kind,
    /// Access kind of the read generated by a write miss under
    /// write-allocate.
    write_alloc_kind: mem_fetch::access::Kind,
}

impl Data {
    #[must_use]
    pub fn new(
        name: String,
        id: usize,
        cache_config: Arc<config::Cache>,
        fetch_allocator: mem_fetch::Allocator,
        miss_queue_status: mem_fetch::Status,
        write_back_kind: mem_fetch::access::Kind,
        write_alloc_kind: mem_fetch::access::Kind,
    ) -> Self {
        debug_assert!(matches!(
            write_back_kind,
            mem_fetch::access::Kind::L1_WRBK_ACC | mem_fetch::access::Kind::L2_WRBK_ACC
        ));
        Self {
            inner: Base::new(name, id, cache_config, fetch_allocator, miss_queue_status),
            write_back_kind,
            write_alloc_kind,
        }
    }

    /// Probe and service one access.
    ///
    /// Returns the status the upstream component acts on: `HIT` completes,
    /// `MISS`/`HIT_RESERVED`/`SECTOR_MISS` mean the request was accepted,
    /// `RESERVATION_FAIL` means nothing happened and the caller retries
    /// next cycle.
    pub fn access(
        &mut self,
        addr: address,
        fetch: mem_fetch::MemFetch,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) -> cache::RequestStatus {
        let block_addr = self.inner.cache_config.block_addr(addr);
        let (cache_index, probe_status) = self.inner.tag_array.probe(
            block_addr,
            &fetch.access.sector_mask,
            fetch.is_write(),
        );
        let kind = fetch.access_kind().into();
        log::debug!(
            "{}::access({fetch}) block_addr={block_addr} probe={probe_status:?}",
            &self.inner.name
        );

        let access_status =
            self.process_tag_probe(fetch, block_addr, cache_index, probe_status, events, time);

        // reservation failure reasons are recorded where they occur; the
        // access outcome histogram records the probe result
        let recorded = if access_status == cache::RequestStatus::RESERVATION_FAIL {
            cache::RequestStatus::RESERVATION_FAIL
        } else {
            probe_status
        };
        self.inner
            .stats
            .inc(kind, cache::AccessStat::Status(recorded).into(), 1);
        access_status
    }

    fn process_tag_probe(
        &mut self,
        fetch: mem_fetch::MemFetch,
        block_addr: address,
        cache_index: Option<usize>,
        probe_status: cache::RequestStatus,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) -> cache::RequestStatus {
        if fetch.is_write() {
            match probe_status {
                cache::RequestStatus::HIT => {
                    self.write_hit(fetch, block_addr, cache_index, events, time)
                }
                cache::RequestStatus::RESERVATION_FAIL => {
                    self.inner.stats.inc(
                        fetch.access_kind().into(),
                        cache::AccessStat::ReservationFailure(
                            cache::ReservationFailure::LINE_ALLOC_FAIL,
                        )
                        .into(),
                        1,
                    );
                    cache::RequestStatus::RESERVATION_FAIL
                }
                _ => self.write_miss(fetch, events, time),
            }
        } else {
            match probe_status {
                cache::RequestStatus::HIT => {
                    self.read_hit(fetch, block_addr, time);
                    cache::RequestStatus::HIT
                }
                cache::RequestStatus::RESERVATION_FAIL => {
                    self.inner.stats.inc(
                        fetch.access_kind().into(),
                        cache::AccessStat::ReservationFailure(
                            cache::ReservationFailure::LINE_ALLOC_FAIL,
                        )
                        .into(),
                        1,
                    );
                    cache::RequestStatus::RESERVATION_FAIL
                }
                status => self.read_miss(fetch, block_addr, cache_index, status, events, time),
            }
        }
    }

    fn read_hit(&mut self, fetch: mem_fetch::MemFetch, block_addr: address, time: u64) {
        let access = self.inner.tag_array.access(block_addr, &fetch, time);
        debug_assert_eq!(access.status, cache::RequestStatus::HIT);
    }

    fn read_miss(
        &mut self,
        fetch: mem_fetch::MemFetch,
        block_addr: address,
        _cache_index: Option<usize>,
        _probe_status: cache::RequestStatus,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) -> cache::RequestStatus {
        if !self.inner.miss_queue_can_fit(1) {
            // cannot handle the miss this cycle
            self.inner.stats.inc(
                fetch.access_kind().into(),
                cache::AccessStat::ReservationFailure(
                    cache::ReservationFailure::MISS_QUEUE_FULL,
                )
                .into(),
                1,
            );
            return cache::RequestStatus::RESERVATION_FAIL;
        }

        let (should_miss, writeback, evicted) =
            self.inner
                .send_read_request(block_addr, fetch, events, false, false, time);
        if !should_miss {
            return cache::RequestStatus::RESERVATION_FAIL;
        }

        if writeback {
            if let Some(evicted) = evicted {
                if self.inner.cache_config.write_policy == config::WritePolicy::WRITE_BACK {
                    self.send_writeback(&evicted, events, time);
                }
            }
        }
        cache::RequestStatus::MISS
    }

    fn write_hit(
        &mut self,
        fetch: mem_fetch::MemFetch,
        block_addr: address,
        cache_index: Option<usize>,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) -> cache::RequestStatus {
        match self.inner.cache_config.write_policy {
            config::WritePolicy::WRITE_BACK => {
                // update the line, no traffic downstream
                let access = self.inner.tag_array.access(block_addr, &fetch, time);
                debug_assert_eq!(access.status, cache::RequestStatus::HIT);
                self.mark_modified(cache_index.expect("write hit has index"), &fetch);
                cache::RequestStatus::HIT
            }
            config::WritePolicy::WRITE_THROUGH => {
                if !self.inner.miss_queue_can_fit(1) {
                    self.inner.stats.inc(
                        fetch.access_kind().into(),
                        cache::AccessStat::ReservationFailure(
                            cache::ReservationFailure::MISS_QUEUE_FULL,
                        )
                        .into(),
                        1,
                    );
                    return cache::RequestStatus::RESERVATION_FAIL;
                }
                let access = self.inner.tag_array.access(block_addr, &fetch, time);
                debug_assert_eq!(access.status, cache::RequestStatus::HIT);
                self.mark_modified(cache_index.expect("write hit has index"), &fetch);
                self.inner.send_write_request(
                    fetch,
                    cache::Event::WriteRequestSent,
                    events,
                    time,
                );
                cache::RequestStatus::HIT
            }
            config::WritePolicy::READ_ONLY => {
                panic!("write hit on read-only cache {}", self.inner.name)
            }
        }
    }

    fn write_miss(
        &mut self,
        fetch: mem_fetch::MemFetch,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) -> cache::RequestStatus {
        match self.inner.cache_config.write_allocate_policy {
            config::WriteAllocatePolicy::NO_WRITE_ALLOCATE => {
                if !self.inner.miss_queue_can_fit(1) {
                    self.inner.stats.inc(
                        fetch.access_kind().into(),
                        cache::AccessStat::ReservationFailure(
                            cache::ReservationFailure::MISS_QUEUE_FULL,
                        )
                        .into(),
                        1,
                    );
                    return cache::RequestStatus::RESERVATION_FAIL;
                }
                // forward the write downstream, do not allocate
                self.inner.send_write_request(
                    fetch,
                    cache::Event::WriteRequestSent,
                    events,
                    time,
                );
                cache::RequestStatus::MISS
            }
            config::WriteAllocatePolicy::WRITE_ALLOCATE => {
                // the write goes downstream and a read brings the line in
                if !self.inner.miss_queue_can_fit(2) {
                    self.inner.stats.inc(
                        fetch.access_kind().into(),
                        cache::AccessStat::ReservationFailure(
                            cache::ReservationFailure::MISS_QUEUE_FULL,
                        )
                        .into(),
                        1,
                    );
                    return cache::RequestStatus::RESERVATION_FAIL;
                }
                let block_addr = self.inner.cache_config.block_addr(fetch.addr());
                let read_access = mem_fetch::access::Builder {
                    kind: self.write_alloc_kind,
                    addr: fetch.addr(),
                    req_size_bytes: self.inner.cache_config.atom_size(),
                    is_write: false,
                    warp_active_mask: fetch.access.warp_active_mask,
                    byte_mask: fetch.access.byte_mask,
                    sector_mask: fetch.access.sector_mask,
                }
                .build();
                let warp_id = fetch.warp_id;
                let read_fetch = self
                    .inner
                    .fetch_allocator
                    .new_fetch(read_access, None, warp_id);

                self.inner.send_write_request(
                    fetch,
                    cache::Event::WriteRequestSent,
                    events,
                    time,
                );
                let (should_miss, writeback, evicted) = self
                    .inner
                    .send_read_request(block_addr, read_fetch, events, false, true, time);
                if should_miss {
                    events.push(cache::Event::WriteAllocateSent);
                    if writeback {
                        if let Some(evicted) = evicted {
                            if self.inner.cache_config.write_policy
                                == config::WritePolicy::WRITE_BACK
                            {
                                self.send_writeback(&evicted, events, time);
                            }
                        }
                    }
                }
                cache::RequestStatus::MISS
            }
        }
    }

    fn mark_modified(&mut self, cache_index: usize, fetch: &mem_fetch::MemFetch) {
        let line = self.inner.tag_array.get_block_mut(cache_index);
        let was_modified = line.is_modified();
        line.set_status(super::block::Status::MODIFIED, &fetch.access.sector_mask);
        line.set_byte_mask(&fetch.access.byte_mask);
        if !was_modified {
            self.inner.tag_array.num_dirty += 1;
        }
    }

    /// Emit a writeback fetch for an evicted dirty line.
    fn send_writeback(
        &mut self,
        evicted: &crate::tag_array::EvictedBlockInfo,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) {
        let mut active_mask: crate::warp::ActiveMask = BitArray::ZERO;
        active_mask.fill(true);
        let access = mem_fetch::access::Builder {
            kind: self.write_back_kind,
            addr: evicted.block_addr,
            req_size_bytes: evicted.modified_size,
            is_write: true,
            warp_active_mask: active_mask,
            byte_mask: evicted.byte_mask,
            sector_mask: evicted.sector_mask,
        }
        .build();
        let writeback = self.inner.fetch_allocator.new_fetch(access, None, 0);
        self.inner.send_write_request(
            writeback,
            cache::Event::WriteBackRequestSent {
                evicted: evicted.clone(),
            },
            events,
            time,
        );
    }

    // delegated plumbing

    pub fn fill(&mut self, fetch: mem_fetch::MemFetch, time: u64) {
        self.inner.fill(fetch, time);
    }

    #[must_use]
    pub fn waiting_for_fill(&self, fetch: &mem_fetch::MemFetch) -> bool {
        self.inner.waiting_for_fill(fetch)
    }

    #[must_use]
    pub fn has_ready_accesses(&self) -> bool {
        self.inner.has_ready_accesses()
    }

    pub fn next_access(&mut self) -> Option<mem_fetch::MemFetch> {
        self.inner.next_access()
    }

    #[must_use]
    pub fn ready_accesses(&self) -> Option<&VecDeque<mem_fetch::MemFetch>> {
        self.inner.ready_accesses()
    }

    #[must_use]
    pub fn miss_queue_front(&self) -> Option<&mem_fetch::MemFetch> {
        self.inner.miss_queue_front()
    }

    pub fn miss_queue_pop(&mut self) -> Option<mem_fetch::MemFetch> {
        self.inner.miss_queue_pop()
    }

    pub fn flush(&mut self) -> usize {
        self.inner.flush()
    }

    pub fn invalidate(&mut self) {
        self.inner.invalidate();
    }

    #[must_use]
    pub fn stats(&self) -> &stats::Cache {
        &self.inner.stats
    }

    /// Mark a line resident without simulating an access (memcpy fill).
    pub fn force_tag_update(&mut self, addr: address, sector_mask: mem_fetch::SectorMask, time: u64) {
        let block_addr = self.inner.cache_config.block_addr(addr);
        self.inner.tag_array.fill_on_fill(
            block_addr,
            &sector_mask,
            &BitArray::ZERO,
            false,
            time,
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::testing::{read_fetch, write_fetch};
    use crate::{cache, config, mcu, mem_fetch};
    use std::sync::Arc;

    fn l1_cache(geometry: &str) -> super::Data {
        let cache_config: Arc<config::Cache> = Arc::new(geometry.parse().unwrap());
        let allocator = mem_fetch::Allocator {
            core_id: Some(0),
            cluster_id: Some(0),
            mem_controller: mcu::MemoryControllerUnit::new(&config::GPU::default()),
        };
        super::Data::new(
            "L1D".to_string(),
            0,
            cache_config,
            allocator,
            mem_fetch::Status::IN_L1D_MISS_QUEUE,
            mem_fetch::access::Kind::L1_WRBK_ACC,
            mem_fetch::access::Kind::L1_WR_ALLOC_R,
        )
    }

    #[test]
    fn cold_read_misses_and_fill_returns_waiters() {
        let mut cache = l1_cache("64:128:6,L:B:m:N,A:32:8,8");
        let mut events = Vec::new();
        let fetch = read_fetch(0x8000_0000, 0);

        let status = cache.access(fetch.addr(), fetch.clone(), &mut events, 1);
        assert_eq!(status, cache::RequestStatus::MISS);
        assert!(matches!(events.as_slice(), [cache::Event::ReadRequestSent]));

        // the downstream request sits in the miss queue
        let sent = cache.miss_queue_pop().unwrap();
        assert_eq!(sent.uid, fetch.uid);
        assert!(cache.waiting_for_fill(&sent));

        // a second access to the same line merges in the mshr
        let merged = read_fetch(0x8000_0040, 1);
        let status = cache.access(merged.addr(), merged, &mut events, 2);
        assert_eq!(status, cache::RequestStatus::MISS);
        assert!(cache.miss_queue_front().is_none(), "merged, nothing sent");
        assert_eq!(cache.stats().num_pending_hits(), 1);
        assert_eq!(cache.stats().num_mshr_hits(), 1);

        // fill completes both
        cache.fill(sent, 10);
        assert!(cache.has_ready_accesses());
        let drained: Vec<_> = std::iter::from_fn(|| cache.next_access()).collect();
        assert_eq!(drained.len(), 2);

        // line is now resident
        let hit = read_fetch(0x8000_0000, 0);
        let status = cache.access(hit.addr(), hit, &mut events, 11);
        assert_eq!(status, cache::RequestStatus::HIT);
    }

    #[test]
    fn write_through_forwards_every_write() {
        let mut cache = l1_cache("64:128:6,L:T:m:N,A:32:8,8");
        let mut events = Vec::new();

        // cold write miss: forwarded downstream, no allocation
        let write = write_fetch(0x8000_0000, 0);
        let status = cache.access(write.addr(), write, &mut events, 1);
        assert_eq!(status, cache::RequestStatus::MISS);
        assert!(matches!(events.as_slice(), [cache::Event::WriteRequestSent]));
        assert!(cache.miss_queue_pop().is_some());

        // read miss brings the line in
        events.clear();
        let read = read_fetch(0x8000_0000, 0);
        let status = cache.access(read.addr(), read, &mut events, 2);
        assert_eq!(status, cache::RequestStatus::MISS);
        let sent = cache.miss_queue_pop().unwrap();
        cache.fill(sent, 3);
        let _ = cache.next_access();

        // write hit still forwards the write under write-through
        events.clear();
        let write = write_fetch(0x8000_0000, 0);
        let status = cache.access(write.addr(), write, &mut events, 4);
        assert_eq!(status, cache::RequestStatus::HIT);
        assert!(matches!(events.as_slice(), [cache::Event::WriteRequestSent]));
        assert!(cache.miss_queue_pop().is_some());
    }

    #[test]
    fn write_back_dirty_eviction_emits_writeback_fetch() {
        // single set, 1-way: the second distinct line evicts the first
        let mut cache = l1_cache("1:128:1,L:B:m:W,A:32:8,8");
        let mut events = Vec::new();

        // write-allocate: write miss sends write + allocate read
        let write = write_fetch(0x0000, 0);
        let status = cache.access(write.addr(), write, &mut events, 1);
        assert_eq!(status, cache::RequestStatus::MISS);
        let sent_write = cache.miss_queue_pop().unwrap();
        assert!(sent_write.is_write());
        let alloc_read = cache.miss_queue_pop().unwrap();
        assert_eq!(
            alloc_read.access_kind(),
            mem_fetch::access::Kind::L1_WR_ALLOC_R
        );
        cache.fill(alloc_read, 2);
        let _ = cache.next_access();

        // write hit dirties the line
        events.clear();
        let write = write_fetch(0x0000, 0);
        let status = cache.access(write.addr(), write, &mut events, 3);
        assert_eq!(status, cache::RequestStatus::HIT);
        assert!(events.is_empty(), "write-back hit generates no traffic");

        // a read to another line evicts the dirty line
        events.clear();
        let read = read_fetch(0x1000, 0);
        let status = cache.access(read.addr(), read, &mut events, 4);
        assert_eq!(status, cache::RequestStatus::MISS);
        let has_writeback = events
            .iter()
            .any(|event| matches!(event, cache::Event::WriteBackRequestSent { .. }));
        assert!(has_writeback);
        let queued: Vec<_> = std::iter::from_fn(|| cache.miss_queue_pop()).collect();
        assert!(queued
            .iter()
            .any(|fetch| fetch.access_kind() == mem_fetch::access::Kind::L1_WRBK_ACC));
    }
}
