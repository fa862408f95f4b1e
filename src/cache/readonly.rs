use super::base::Base;
use crate::{address, cache, config, mem_fetch};

use std::sync::Arc;

/// Read-only cache, used for the L1 instruction cache.
#[derive(Debug)]
pub struct ReadOnly {
    pub inner: Base,
}

impl ReadOnly {
    #[must_use]
    pub fn new(
        name: String,
        id: usize,
        cache_config: Arc<config::Cache>,
        fetch_allocator: mem_fetch::Allocator,
        miss_queue_status: mem_fetch::Status,
    ) -> Self {
        debug_assert_eq!(
            cache_config.write_policy,
            config::WritePolicy::READ_ONLY,
            "read-only cache with a write policy"
        );
        Self {
            inner: Base::new(name, id, cache_config, fetch_allocator, miss_queue_status),
        }
    }

    pub fn access(
        &mut self,
        addr: address,
        fetch: mem_fetch::MemFetch,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) -> cache::RequestStatus {
        debug_assert!(!fetch.is_write());
        let block_addr = self.inner.cache_config.block_addr(addr);
        let (_, probe_status) =
            self.inner
                .tag_array
                .probe(block_addr, &fetch.access.sector_mask, false);
        let kind = fetch.access_kind().into();

        let access_status = match probe_status {
            cache::RequestStatus::HIT => {
                let access = self.inner.tag_array.access(block_addr, &fetch, time);
                access.status
            }
            cache::RequestStatus::RESERVATION_FAIL => {
                self.inner.stats.inc(
                    kind,
                    cache::AccessStat::ReservationFailure(
                        cache::ReservationFailure::LINE_ALLOC_FAIL,
                    )
                    .into(),
                    1,
                );
                cache::RequestStatus::RESERVATION_FAIL
            }
            _ => {
                if self.inner.miss_queue_can_fit(1) {
                    let (should_miss, _, _) = self
                        .inner
                        .send_read_request(block_addr, fetch, events, true, false, time);
                    if should_miss {
                        cache::RequestStatus::MISS
                    } else {
                        cache::RequestStatus::RESERVATION_FAIL
                    }
                } else {
                    self.inner.stats.inc(
                        kind,
                        cache::AccessStat::ReservationFailure(
                            cache::ReservationFailure::MISS_QUEUE_FULL,
                        )
                        .into(),
                        1,
                    );
                    cache::RequestStatus::RESERVATION_FAIL
                }
            }
        };
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

    pub fn fill(&mut self, fetch: mem_fetch::MemFetch, time: u64) {
        self.inner.fill(fetch, time);
    }

    #[must_use]
    pub fn has_ready_accesses(&self) -> bool {
        self.inner.has_ready_accesses()
    }

    pub fn next_access(&mut self) -> Option<mem_fetch::MemFetch> {
        self.inner.next_access()
    }

    #[must_use]
    pub fn miss_queue_front(&self) -> Option<&mem_fetch::MemFetch> {
        self.inner.miss_queue_front()
    }

    pub fn miss_queue_pop(&mut self) -> Option<mem_fetch::MemFetch> {
        self.inner.miss_queue_pop()
    }

    #[must_use]
    pub fn waiting_for_fill(&self, fetch: &mem_fetch::MemFetch) -> bool {
        self.inner.waiting_for_fill(fetch)
    }

    #[must_use]
    pub fn stats(&self) -> &stats::Cache {
        &self.inner.stats
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::testing::read_fetch;
    use crate::{cache, config, mcu, mem_fetch};
    use std::sync::Arc;

    #[test]
    fn inst_cache_miss_then_hit() {
        let cache_config: Arc<config::Cache> = Arc::new("8:128:4,L:R:f:N,A:2:48,4".parse().unwrap());
        let allocator = mem_fetch::Allocator {
            core_id: Some(0),
            cluster_id: Some(0),
            mem_controller: mcu::MemoryControllerUnit::new(&config::GPU::default()),
        };
        let mut icache = super::ReadOnly::new(
            "L1I".to_string(),
            0,
            cache_config,
            allocator,
            mem_fetch::Status::IN_L1I_MISS_QUEUE,
        );
        let mut events = Vec::new();

        let fetch = read_fetch(0x400, 0);
        let status = icache.access(fetch.addr(), fetch, &mut events, 1);
        assert_eq!(status, cache::RequestStatus::MISS);

        let sent = icache.miss_queue_pop().unwrap();
        assert_eq!(sent.status, mem_fetch::Status::IN_L1I_MISS_QUEUE);
        icache.fill(sent, 5);
        let _ = icache.next_access();

        let fetch = read_fetch(0x400, 0);
        let status = icache.access(fetch.addr(), fetch, &mut events, 6);
        assert_eq!(status, cache::RequestStatus::HIT);
    }
}
