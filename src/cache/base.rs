use crate::tag_array::{self, TagArray};
use crate::{address, cache, config, mem_fetch, mshr};

use console::style;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub block_addr: address,
    pub addr: address,
    pub cache_index: Option<usize>,
    pub data_size: u32,
}

/// Common machinery of the data and read-only caches: tag array, MSHRs,
/// the miss queue, and the table of requests waiting for a fill.
pub struct Base {
    pub name: String,
    /// Core id or sub partition id, used to index per-cache stats.
    pub id: usize,

    pub stats: stats::Cache,
    pub cache_config: Arc<config::Cache>,
    pub tag_array: TagArray,
    pub mshrs: mshr::Table,
    pub fetch_allocator: mem_fetch::Allocator,

    pub miss_queue: VecDeque<mem_fetch::MemFetch>,
    pub miss_queue_status: mem_fetch::Status,

    pending: HashMap<u64, PendingRequest>,
}

impl std::fmt::Debug for Base {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Base")
            .field("name", &self.name)
            .field("miss_queue", &self.miss_queue.len())
            .finish()
    }
}

impl Base {
    #[must_use]
    pub fn new(
        name: String,
        id: usize,
        cache_config: Arc<config::Cache>,
        fetch_allocator: mem_fetch::Allocator,
        miss_queue_status: mem_fetch::Status,
    ) -> Self {
        let tag_array = TagArray::new(cache_config.clone());
        let mshrs = mshr::Table::new(cache_config.mshr_entries, cache_config.mshr_max_merge);
        Self {
            name,
            id,
            stats: stats::Cache::default(),
            cache_config,
            tag_array,
            mshrs,
            fetch_allocator,
            miss_queue: VecDeque::new(),
            miss_queue_status,
            pending: HashMap::new(),
        }
    }

    #[must_use]
    pub fn miss_queue_full(&self) -> bool {
        self.miss_queue.len() >= self.cache_config.miss_queue_size
    }

    /// Can `n` more misses be queued this cycle?
    #[must_use]
    pub fn miss_queue_can_fit(&self, n: usize) -> bool {
        self.miss_queue.len() + n <= self.cache_config.miss_queue_size
    }

    #[must_use]
    pub fn miss_queue_front(&self) -> Option<&mem_fetch::MemFetch> {
        self.miss_queue.front()
    }

    pub fn miss_queue_pop(&mut self) -> Option<mem_fetch::MemFetch> {
        self.miss_queue.pop_front()
    }

    /// Is this fetch waiting for a fill from the lower memory level?
    #[must_use]
    pub fn waiting_for_fill(&self, fetch: &mem_fetch::MemFetch) -> bool {
        self.pending.contains_key(&fetch.uid)
    }

    #[must_use]
    pub fn has_ready_accesses(&self) -> bool {
        self.mshrs.has_ready_accesses()
    }

    #[must_use]
    pub fn ready_accesses(&self) -> Option<&VecDeque<mem_fetch::MemFetch>> {
        self.mshrs.ready_accesses()
    }

    /// Pop the next access whose miss was serviced.
    pub fn next_access(&mut self) -> Option<mem_fetch::MemFetch> {
        self.mshrs.next_access()
    }

    /// Read miss handler: merge into the MSHRs or allocate a new entry and
    /// queue the request downstream.
    ///
    /// Returns `(should_miss, writeback, evicted)`.
    pub fn send_read_request(
        &mut self,
        block_addr: address,
        mut fetch: mem_fetch::MemFetch,
        events: &mut Vec<cache::Event>,
        read_only: bool,
        write_allocate: bool,
        time: u64,
    ) -> (bool, bool, Option<tag_array::EvictedBlockInfo>) {
        let mut should_miss = false;
        let mut writeback = false;
        let mut evicted = None;

        let mshr_addr = self.cache_config.mshr_addr(fetch.addr());
        let mshr_hit = self.mshrs.probe(mshr_addr);
        let mshr_full = self.mshrs.full(mshr_addr);

        log::debug!(
            "{}::send_read_request({fetch}) mshr_addr={mshr_addr} mshr_hit={mshr_hit} mshr_full={mshr_full} miss_queue_full={}",
            &self.name,
            self.miss_queue_full(),
        );

        if mshr_hit && !mshr_full {
            // merge into the outstanding entry; no new downstream request
            let access = self.tag_array.access(block_addr, &fetch, time);
            if !read_only {
                writeback = access.writeback;
                evicted = access.evicted;
            }
            let kind = fetch.access_kind().into();
            self.mshrs.add(mshr_addr, fetch);
            self.stats.inc(
                kind,
                stats::cache::AccessStat::Status(stats::cache::RequestStatus::MSHR_HIT),
                1,
            );
            should_miss = true;
        } else if !mshr_hit && !mshr_full && !self.miss_queue_full() {
            let access = self.tag_array.access(block_addr, &fetch, time);
            if !read_only {
                writeback = access.writeback;
                evicted = access.evicted;
            }
            self.pending.insert(
                fetch.uid,
                PendingRequest {
                    block_addr: mshr_addr,
                    addr: fetch.addr(),
                    cache_index: access.index,
                    data_size: fetch.data_size(),
                },
            );
            self.mshrs.add(mshr_addr, fetch.clone());

            // downstream request fetches the whole mshr block
            fetch.access.req_size_bytes = self.cache_config.atom_size();
            fetch.access.addr = mshr_addr;
            if self.cache_config.mshr_kind != mshr::Kind::SECTOR_ASSOC {
                // a full line fetch covers every sector
                fetch.access.sector_mask.fill(true);
            }
            fetch.set_status(self.miss_queue_status, time);
            self.miss_queue.push_back(fetch);
            if !write_allocate {
                events.push(cache::Event::ReadRequestSent);
            }
            should_miss = true;
        } else if mshr_hit && mshr_full {
            self.stats.inc(
                fetch.access_kind().into(),
                cache::AccessStat::ReservationFailure(
                    cache::ReservationFailure::MSHR_MERGE_ENTRY_FAIL,
                )
                .into(),
                1,
            );
        } else if !mshr_hit && mshr_full {
            self.stats.inc(
                fetch.access_kind().into(),
                cache::AccessStat::ReservationFailure(cache::ReservationFailure::MSHR_ENTRY_FAIL)
                    .into(),
                1,
            );
        } else {
            self.stats.inc(
                fetch.access_kind().into(),
                cache::AccessStat::ReservationFailure(cache::ReservationFailure::MISS_QUEUE_FULL)
                    .into(),
                1,
            );
        }
        (should_miss, writeback, evicted)
    }

    /// Queue a write request downstream.
    pub fn send_write_request(
        &mut self,
        mut fetch: mem_fetch::MemFetch,
        event: cache::Event,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) {
        log::debug!(
            "{}: {}",
            &self.name,
            style(format!("send write request {fetch}")).blue()
        );
        events.push(event);
        fetch.set_status(self.miss_queue_status, time);
        self.miss_queue.push_back(fetch);
    }

    /// Accept a fill response from the lower memory level.
    pub fn fill(&mut self, mut fetch: mem_fetch::MemFetch, time: u64) {
        let pending = self
            .pending
            .remove(&fetch.uid)
            .expect("fill for request that was never sent");

        fetch.access.req_size_bytes = pending.data_size;
        fetch.access.addr = pending.addr;

        match self.cache_config.allocate_policy {
            config::AllocatePolicy::ON_MISS => {
                let index = pending.cache_index.expect("on-miss fill has line index");
                self.tag_array.fill_on_miss(index, &fetch, time);
            }
            config::AllocatePolicy::ON_FILL => {
                self.tag_array.fill_on_fill(
                    pending.block_addr,
                    &fetch.access.sector_mask.clone(),
                    &fetch.access.byte_mask.clone(),
                    fetch.is_write(),
                    time,
                );
            }
        }
        self.mshrs.mark_ready(pending.block_addr, &fetch);
    }

    pub fn flush(&mut self) -> usize {
        self.tag_array.flush()
    }

    pub fn invalidate(&mut self) {
        self.tag_array.invalidate();
        self.mshrs.clear();
    }
}
