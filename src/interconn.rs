use crate::{config, mem_fetch};

use console::style;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A packet travelling through the interconnect.
#[derive(Clone, Debug)]
pub struct Packet<T> {
    pub data: T,
    pub time: u64,
}

impl<T> Packet<T> {
    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<T> std::ops::Deref for Packet<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::DerefMut for Packet<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T> std::fmt::Display for Packet<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.data, f)
    }
}

/// General interconnect between cores and memory partitions.
///
/// Functions are not mutable because implementations lock internally.
pub trait Interconnect<P>: Send + Sync + 'static {
    fn busy(&self) -> bool;

    fn push(&self, src: usize, dest: usize, packet: P, size: u32);

    fn pop(&self, node: usize) -> Option<P>;

    fn has_buffer(&self, node: usize, size: u32) -> bool;

    /// Advance the network by one cycle.
    fn advance(&self);
}

/// Two-subnet queueing network.
///
/// Requests and replies travel on disjoint subnets; each destination node
/// has a bounded output queue drained by its owner. Transfers complete in
/// the cycle they are pushed.
#[derive(Debug)]
pub struct SimpleInterconnect<P> {
    pub num_cores: usize,
    pub num_nodes: usize,
    pub num_subnets: usize,
    capacity: Option<usize>,
    queues: Vec<Vec<Mutex<VecDeque<P>>>>,
    in_flight: Mutex<u64>,
}

impl<P> SimpleInterconnect<P> {
    #[must_use]
    pub fn new(num_cores: usize, num_mems: usize, capacity: Option<usize>) -> Self {
        let num_subnets = 2;
        let num_nodes = num_cores + num_mems;
        let queues = (0..num_subnets)
            .map(|_| (0..num_nodes).map(|_| Mutex::new(VecDeque::new())).collect())
            .collect();
        Self {
            num_cores,
            num_nodes,
            num_subnets,
            capacity,
            queues,
            in_flight: Mutex::new(0),
        }
    }

    fn subnet(&self, dest: usize) -> usize {
        // replies (to cores) travel on subnet 1
        usize::from(dest < self.num_cores)
    }
}

impl<P> Interconnect<P> for SimpleInterconnect<P>
where
    P: Send + Sync + std::fmt::Display + 'static,
{
    fn busy(&self) -> bool {
        *self.in_flight.lock().unwrap() != 0
    }

    fn push(&self, src: usize, dest: usize, packet: P, size: u32) {
        assert!(dest < self.num_nodes);
        let subnet = self.subnet(dest);
        log::debug!(
            "{}: {size} bytes from node {src} to {dest} (subnet {subnet})",
            style(format!("INTERCONN PUSH {packet}")).bold(),
        );
        *self.in_flight.lock().unwrap() += 1;
        self.queues[subnet][dest].lock().unwrap().push_back(packet);
    }

    fn pop(&self, node: usize) -> Option<P> {
        let subnet = self.subnet(node);
        let packet = self.queues[subnet][node].lock().unwrap().pop_front();
        if packet.is_some() {
            *self.in_flight.lock().unwrap() -= 1;
        }
        packet
    }

    fn has_buffer(&self, node: usize, _size: u32) -> bool {
        let Some(capacity) = self.capacity else {
            return true;
        };
        let subnet = self.subnet(node);
        self.queues[subnet][node].lock().unwrap().len() < capacity
    }

    fn advance(&self) {
        // transfers complete at push time
    }
}

/// Interface used by a core (its load/store and fetch units) to inject
/// memory requests towards the partitions.
pub trait MemFetchInterface: Send + Sync + std::fmt::Debug + 'static {
    fn full(&self, size: u32, write: bool) -> bool;

    fn push(&self, fetch: mem_fetch::MemFetch, time: u64);
}

pub struct CoreMemoryInterface<I> {
    pub cluster_id: usize,
    pub config: Arc<config::GPU>,
    pub interconn: Arc<I>,
    pub stats: Arc<Mutex<stats::Interconn>>,
}

impl<I> std::fmt::Debug for CoreMemoryInterface<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CoreMemoryInterface")
            .field("cluster_id", &self.cluster_id)
            .finish()
    }
}

impl<I> MemFetchInterface for CoreMemoryInterface<I>
where
    I: Interconnect<Packet<mem_fetch::MemFetch>>,
{
    fn full(&self, size: u32, write: bool) -> bool {
        let request_size = if write {
            size
        } else {
            mem_fetch::READ_PACKET_SIZE
        };
        !self.interconn.has_buffer(self.cluster_id, request_size)
    }

    fn push(&self, mut fetch: mem_fetch::MemFetch, time: u64) {
        let dest_sub_partition = fetch.sub_partition_id();
        let dest = self.config.mem_id_to_device_id(dest_sub_partition);
        let packet_size = fetch.packet_size();
        log::debug!(
            "cluster {}: push {fetch} to sub partition {dest_sub_partition} (node {dest})",
            self.cluster_id,
        );
        {
            let mut stats = self.stats.lock().unwrap();
            stats.packets_to_mem += 1;
            stats.flits_to_mem += u64::from(packet_size.div_ceil(self.config.flit_size));
        }
        fetch.set_status(mem_fetch::Status::IN_ICNT_TO_MEM, time);
        fetch.inject_cycle.get_or_insert(time);
        self.interconn
            .push(self.cluster_id, dest, Packet { data: fetch, time }, packet_size);
    }
}

pub mod anynet {
    //! Arbitrary-topology network description.
    //!
    //! Parses an adjacency-plus-latency file and precomputes shortest-path
    //! routing with link latency as the edge weight.

    use std::collections::HashMap;
    use std::path::Path;

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("malformed topology line: {0:?}")]
        MalformedLine(String),

        #[error("node {node} attached to both router {first} and router {second}")]
        DuplicateNode {
            node: usize,
            first: usize,
            second: usize,
        },

        #[error("virtual channel ranges overlap: {0:?} and {1:?}")]
        OverlappingVirtualChannels(std::ops::Range<usize>, std::ops::Range<usize>),

        #[error(transparent)]
        Io(#[from] std::io::Error),
    }

    /// Virtual channel ranges per packet class.
    ///
    /// The four classes must use disjoint channel ranges so replies can
    /// never block behind requests.
    #[derive(Clone, Debug)]
    pub struct VirtualChannels {
        pub read_request: std::ops::Range<usize>,
        pub write_request: std::ops::Range<usize>,
        pub read_reply: std::ops::Range<usize>,
        pub write_reply: std::ops::Range<usize>,
    }

    impl Default for VirtualChannels {
        fn default() -> Self {
            Self {
                read_request: 0..1,
                write_request: 1..2,
                read_reply: 2..3,
                write_reply: 3..4,
            }
        }
    }

    impl VirtualChannels {
        pub fn validate(&self) -> Result<(), Error> {
            let ranges = [
                &self.read_request,
                &self.write_request,
                &self.read_reply,
                &self.write_reply,
            ];
            for (i, a) in ranges.iter().enumerate() {
                for b in ranges.iter().skip(i + 1) {
                    if a.start < b.end && b.start < a.end {
                        return Err(Error::OverlappingVirtualChannels(
                            (*a).clone(),
                            (*b).clone(),
                        ));
                    }
                }
            }
            Ok(())
        }

        #[must_use]
        pub fn select(&self, kind: crate::mem_fetch::Kind) -> std::ops::Range<usize> {
            use crate::mem_fetch::Kind;
            match kind {
                Kind::READ_REQUEST => self.read_request.clone(),
                Kind::WRITE_REQUEST => self.write_request.clone(),
                Kind::READ_REPLY => self.read_reply.clone(),
                Kind::WRITE_ACK => self.write_reply.clone(),
            }
        }
    }

    /// Parsed topology: per-router attached nodes and weighted links.
    #[derive(Debug, Default)]
    pub struct Topology {
        pub num_routers: usize,
        /// node id -> owning router
        pub node_router: HashMap<usize, usize>,
        /// router -> (neighbor router -> (output port, latency))
        pub router_links: Vec<HashMap<usize, (usize, u64)>>,
        /// router -> (node -> output port)
        pub node_ports: Vec<HashMap<usize, usize>>,
    }

    impl Topology {
        pub fn parse_file(path: &Path) -> Result<Self, Error> {
            let contents = std::fs::read_to_string(path)?;
            Self::parse(&contents)
        }

        /// Parse lines of the form
        /// `router <id> [node <id>]* [router <id> [<latency>]]*`.
        pub fn parse(contents: &str) -> Result<Self, Error> {
            let mut topology = Self::default();
            let mut max_router = 0;
            // (src, dst, latency), ports assigned after sizing
            let mut raw: Vec<(usize, Vec<(bool, usize, u64)>)> = Vec::new();

            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
                    continue;
                }
                let err = || Error::MalformedLine(line.to_string());
                let mut tokens = line.split_whitespace().peekable();
                if tokens.next() != Some("router") {
                    return Err(err());
                }
                let router: usize = tokens.next().ok_or_else(err)?.parse().map_err(|_| err())?;
                max_router = max_router.max(router);

                let mut links = Vec::new();
                while let Some(kind) = tokens.next() {
                    let is_router = match kind {
                        "router" => true,
                        "node" => false,
                        _ => return Err(err()),
                    };
                    let id: usize = tokens.next().ok_or_else(err)?.parse().map_err(|_| err())?;
                    let mut latency = 1;
                    if is_router {
                        if let Some(peeked) = tokens.peek() {
                            if let Ok(parsed) = peeked.parse::<u64>() {
                                latency = parsed;
                                tokens.next();
                            }
                        }
                        max_router = max_router.max(id);
                    }
                    links.push((is_router, id, latency));
                }
                raw.push((router, links));
            }

            let num_routers = max_router + 1;
            topology.num_routers = num_routers;
            topology.router_links = vec![HashMap::new(); num_routers];
            topology.node_ports = vec![HashMap::new(); num_routers];

            for (router, links) in raw {
                for (port, (is_router, id, latency)) in links.into_iter().enumerate() {
                    if is_router {
                        topology.router_links[router].insert(id, (port, latency));
                    } else {
                        if let Some(&existing) = topology.node_router.get(&id) {
                            if existing != router {
                                return Err(Error::DuplicateNode {
                                    node: id,
                                    first: existing,
                                    second: router,
                                });
                            }
                        }
                        topology.node_router.insert(id, router);
                        topology.node_ports[router].insert(id, port);
                    }
                }
            }

            // links are bidirectional: synthesize the reverse direction for
            // routers that did not declare it themselves
            for src in 0..num_routers {
                let declared: Vec<(usize, u64)> = topology.router_links[src]
                    .iter()
                    .map(|(&dst, &(_, latency))| (dst, latency))
                    .collect();
                for (dst, latency) in declared {
                    if !topology.router_links[dst].contains_key(&src) {
                        let port =
                            topology.router_links[dst].len() + topology.node_ports[dst].len();
                        topology.router_links[dst].insert(src, (port, latency));
                    }
                }
            }
            Ok(topology)
        }
    }

    /// Shortest-path routing table over a [`Topology`].
    #[derive(Debug)]
    pub struct RoutingTable {
        /// router -> destination node -> output port
        pub table: Vec<HashMap<usize, usize>>,
        /// router -> router -> total link latency along the shortest path
        pub distance: Vec<Vec<u64>>,
    }

    impl RoutingTable {
        /// Dijkstra from every router, link latency as edge weight.
        #[must_use]
        pub fn build(topology: &Topology) -> Self {
            let n = topology.num_routers;
            let mut table = vec![HashMap::new(); n];
            let mut distance = vec![vec![u64::MAX; n]; n];

            for start in 0..n {
                let mut dist = vec![u64::MAX; n];
                let mut prev: Vec<Option<usize>> = vec![None; n];
                let mut unvisited: Vec<usize> = (0..n).collect();
                dist[start] = 0;

                while !unvisited.is_empty() {
                    let (idx, &current) = unvisited
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, &router)| dist[router])
                        .unwrap();
                    unvisited.swap_remove(idx);
                    if dist[current] == u64::MAX {
                        break;
                    }
                    // deterministic tie-breaking: relax in ascending router id
                    let mut neighbors: Vec<(usize, u64)> = topology.router_links[current]
                        .iter()
                        .map(|(&neighbor, &(_, latency))| (neighbor, latency))
                        .collect();
                    neighbors.sort_unstable_by_key(|(neighbor, _)| *neighbor);
                    for (neighbor, latency) in neighbors {
                        let candidate = dist[current].saturating_add(latency);
                        if candidate < dist[neighbor] {
                            dist[neighbor] = candidate;
                            prev[neighbor] = Some(current);
                        }
                    }
                }

                distance[start] = dist.clone();

                for target in 0..n {
                    // walk back to find the first hop from start
                    let port = if target == start {
                        None
                    } else {
                        let mut hop = target;
                        while let Some(previous) = prev[hop] {
                            if previous == start {
                                break;
                            }
                            hop = previous;
                        }
                        if prev[hop] == Some(start) {
                            Some(topology.router_links[start][&hop].0)
                        } else {
                            // unreachable router
                            None
                        }
                    };
                    for (&node, &node_port) in &topology.node_ports[target] {
                        let out = if target == start {
                            node_port
                        } else {
                            match port {
                                Some(port) => port,
                                None => continue,
                            }
                        };
                        table[start].insert(node, out);
                    }
                }
            }
            Self { table, distance }
        }

        #[must_use]
        pub fn output_port(&self, router: usize, dest_node: usize) -> Option<usize> {
            self.table.get(router)?.get(&dest_node).copied()
        }

        /// Longest shortest-path hop latency between any reachable pair.
        #[must_use]
        pub fn diameter(&self) -> u64 {
            self.distance
                .iter()
                .flatten()
                .copied()
                .filter(|&d| d != u64::MAX)
                .max()
                .unwrap_or(0)
        }
    }

    /// Latency-accurate network over an anynet topology.
    ///
    /// Packets become visible at the destination once the Dijkstra distance
    /// between the endpoints' routers has elapsed.
    #[derive(Debug)]
    pub struct AnyNetwork<P> {
        topology: Topology,
        routing: RoutingTable,
        pub virtual_channels: VirtualChannels,
        cycle: std::sync::Mutex<u64>,
        sequence: std::sync::Mutex<u64>,
        queues: Vec<std::sync::Mutex<Vec<(u64, u64, P)>>>,
        capacity: Option<usize>,
        in_flight: std::sync::Mutex<u64>,
    }

    impl<P> AnyNetwork<P> {
        #[must_use]
        pub fn new(
            topology: Topology,
            virtual_channels: VirtualChannels,
            num_nodes: usize,
            capacity: Option<usize>,
        ) -> Self {
            let routing = RoutingTable::build(&topology);
            let queues = (0..num_nodes).map(|_| std::sync::Mutex::new(Vec::new())).collect();
            Self {
                topology,
                routing,
                virtual_channels,
                cycle: std::sync::Mutex::new(0),
                sequence: std::sync::Mutex::new(0),
                queues,
                capacity,
                in_flight: std::sync::Mutex::new(0),
            }
        }

        #[must_use]
        pub fn routing_table(&self) -> &RoutingTable {
            &self.routing
        }

        fn latency(&self, src_node: usize, dest_node: usize) -> u64 {
            let src_router = self.topology.node_router[&src_node];
            let dest_router = self.topology.node_router[&dest_node];
            self.routing.distance[src_router][dest_router]
        }
    }

    impl<P> super::Interconnect<P> for AnyNetwork<P>
    where
        P: Send + Sync + std::fmt::Display + 'static,
    {
        fn busy(&self) -> bool {
            *self.in_flight.lock().unwrap() != 0
        }

        fn push(&self, src: usize, dest: usize, packet: P, _size: u32) {
            let now = *self.cycle.lock().unwrap();
            let ready = now + self.latency(src, dest);
            let mut sequence = self.sequence.lock().unwrap();
            let seq = *sequence;
            *sequence += 1;
            *self.in_flight.lock().unwrap() += 1;
            self.queues[dest].lock().unwrap().push((ready, seq, packet));
        }

        fn pop(&self, node: usize) -> Option<P> {
            let now = *self.cycle.lock().unwrap();
            let mut queue = self.queues[node].lock().unwrap();
            let ready_idx = queue
                .iter()
                .enumerate()
                .filter(|(_, (ready, _, _))| *ready <= now)
                .min_by_key(|(_, (ready, seq, _))| (*ready, *seq))
                .map(|(idx, _)| idx)?;
            let (_, _, packet) = queue.remove(ready_idx);
            *self.in_flight.lock().unwrap() -= 1;
            Some(packet)
        }

        fn has_buffer(&self, node: usize, _size: u32) -> bool {
            match self.capacity {
                Some(capacity) => self.queues[node].lock().unwrap().len() < capacity,
                None => true,
            }
        }

        fn advance(&self) {
            *self.cycle.lock().unwrap() += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::anynet::{RoutingTable, Topology, VirtualChannels};
    use super::{Interconnect, SimpleInterconnect};
    use color_eyre::eyre;

    /// Three routers in a line: 0 --5-- 1 --3-- 2, one node each.
    const LINE: &str = r"
router 0 node 0 router 1 5
router 1 node 1 router 0 5 router 2 3
router 2 node 2 router 1 3
";

    #[test]
    fn anynet_line_routing() -> eyre::Result<()> {
        let topology = Topology::parse(LINE)?;
        assert_eq!(topology.num_routers, 3);
        let routing = RoutingTable::build(&topology);

        // router 0 reaches node 2 through its port towards router 1
        let port_towards_1 = topology.router_links[0][&1].0;
        assert_eq!(routing.output_port(0, 2), Some(port_towards_1));

        // total latency equals the dijkstra distance
        assert_eq!(routing.distance[0][2], 5 + 3);
        assert_eq!(routing.distance[2][0], 5 + 3);
        assert_eq!(routing.diameter(), 8);
        Ok(())
    }

    #[test]
    fn anynet_delivery_takes_link_latency() -> eyre::Result<()> {
        use super::anynet::AnyNetwork;
        let topology = Topology::parse(LINE)?;
        let network: AnyNetwork<u32> =
            AnyNetwork::new(topology, VirtualChannels::default(), 3, None);

        network.push(0, 2, 42, 8);
        // nothing is visible until 8 cycles of link latency elapsed
        for _ in 0..8 {
            assert_eq!(network.pop(2), None);
            network.advance();
        }
        assert_eq!(network.pop(2), Some(42));
        assert!(!network.busy());
        Ok(())
    }

    #[test]
    fn routing_reaches_every_destination() -> eyre::Result<()> {
        let topology = Topology::parse(LINE)?;
        let routing = RoutingTable::build(&topology);
        for router in 0..topology.num_routers {
            for &node in topology.node_router.keys() {
                assert!(
                    routing.output_port(router, node).is_some(),
                    "router {router} has no route to node {node}"
                );
            }
        }
        Ok(())
    }

    #[test]
    fn virtual_channel_ranges_must_be_disjoint() {
        let valid = VirtualChannels::default();
        assert!(valid.validate().is_ok());

        let overlapping = VirtualChannels {
            read_request: 0..2,
            write_request: 1..3,
            read_reply: 3..4,
            write_reply: 4..5,
        };
        assert!(overlapping.validate().is_err());
    }

    #[test]
    fn simple_interconnect_is_fifo_per_node() {
        let interconn: SimpleInterconnect<u32> = SimpleInterconnect::new(2, 2, None);
        let mem_node = 2;
        interconn.push(0, mem_node, 42, 8);
        interconn.push(0, mem_node, 43, 8);
        assert!(interconn.busy());
        assert_eq!(interconn.pop(mem_node), Some(42));
        assert_eq!(interconn.pop(mem_node), Some(43));
        assert_eq!(interconn.pop(mem_node), None);
        assert!(!interconn.busy());
    }
}
