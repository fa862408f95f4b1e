use crate::mem_sub_partition::MemSubPartition;
use crate::{config, mem_fetch};

use std::collections::VecDeque;
use std::sync::Arc;

/// A memory partition: the DRAM channel behind two L2 sub partitions.
///
/// The DRAM model is a fixed-latency queue: one request enters and one
/// returns per cycle.
#[derive(Debug)]
pub struct MemPartitionUnit {
    pub id: usize,
    config: Arc<config::GPU>,
    dram_latency_queue: VecDeque<(u64, mem_fetch::MemFetch)>,
    /// Round robin over the sub partitions feeding this channel.
    arbitration_turn: usize,
    pub stats: stats::DRAM,
}

impl MemPartitionUnit {
    #[must_use]
    pub fn new(id: usize, config: Arc<config::GPU>) -> Self {
        Self {
            id,
            config,
            dram_latency_queue: VecDeque::new(),
            arbitration_turn: 0,
            stats: stats::DRAM::default(),
        }
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        !self.dram_latency_queue.is_empty()
    }

    /// One DRAM cycle over this partition's sub partitions.
    pub fn simple_dram_cycle(&mut self, subs: &mut [MemSubPartition], cycle: u64) {
        // return path: the oldest request whose latency elapsed
        if self
            .dram_latency_queue
            .front()
            .is_some_and(|(ready, _)| *ready <= cycle)
        {
            let sub_id = self.dram_latency_queue.front().unwrap().1.sub_partition_id();
            let local = sub_id - subs[0].id;
            if !subs[local].dram_to_l2_full() {
                let (_, fetch) = self.dram_latency_queue.pop_front().unwrap();
                if fetch.is_write() {
                    self.stats.total_writes += 1;
                } else {
                    self.stats.total_reads += 1;
                }
                log::debug!("partition {}: dram return {fetch}", self.id);
                subs[local].dram_to_l2_push(fetch, cycle);
            }
        }

        // intake: one request per cycle, round robin over the subs
        let num_subs = subs.len();
        for i in 0..num_subs {
            let idx = (self.arbitration_turn + i) % num_subs;
            if subs[idx].l2_to_dram_front().is_some() {
                let mut fetch = subs[idx].l2_to_dram_pop().unwrap();
                fetch.set_status(mem_fetch::Status::IN_PARTITION_DRAM, cycle);
                log::debug!("partition {}: dram latency queue <- {fetch}", self.id);
                self.dram_latency_queue
                    .push_back((cycle + self.config.dram_latency as u64, fetch));
                self.arbitration_turn = (idx + 1) % num_subs;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::testing::read_fetch;
    use crate::mem_sub_partition::MemSubPartition;
    use crate::{config, mcu, mem_fetch};
    use std::sync::Arc;

    #[test]
    fn dram_returns_after_fixed_latency() {
        let mut config = config::GPU::default();
        config.dram_latency = 10;
        config.data_cache_l2 = None;
        let config = Arc::new(config);
        let allocator = mem_fetch::Allocator {
            core_id: None,
            cluster_id: None,
            mem_controller: mcu::MemoryControllerUnit::new(&config),
        };
        let mut subs =
            vec![MemSubPartition::new(0, 0, allocator.clone(), config.clone())];
        let mut unit = super::MemPartitionUnit::new(0, config);

        // without an L2 the request passes straight through to DRAM
        let mut fetch = read_fetch(0x0, 0);
        fetch.access.req_size_bytes = 32;
        subs[0].push(fetch, 0);
        subs[0].cache_cycle(0);
        assert!(subs[0].l2_to_dram_front().is_some());

        let mut return_cycle = None;
        for cycle in 1..50 {
            unit.simple_dram_cycle(&mut subs, cycle);
            subs[0].cache_cycle(cycle);
            if return_cycle.is_none() && subs[0].interconn_reply_front().is_some() {
                return_cycle = Some(cycle);
            }
        }
        let return_cycle = return_cycle.expect("read returned");
        assert!(return_cycle >= 10, "return after dram latency");
        assert_eq!(unit.stats.total_reads, 1);

        let reply = subs[0].pop_interconn_reply().unwrap();
        assert!(reply.is_reply());
    }
}
