//! Consistent-hash ring with bounded partition loads.
//!
//! Keys hash onto a fixed set of partitions, and partitions are distributed
//! over members by walking a ring of hashed virtual nodes, capping any single
//! member's share at `load_factor` times the average. Adding or removing one
//! member therefore relocates only ~1/N of the partitions.

use std::collections::{BTreeSet, HashMap};

/// 64-bit stable hash over raw bytes.
pub trait Hasher {
    fn sum64(&self, data: &[u8]) -> u64;
}

/// Default [`Hasher`] backed by xxHash64 (seed 0).
#[derive(Debug, Default, Clone, Copy)]
pub struct Xxh64;

impl Hasher for Xxh64 {
    fn sum64(&self, data: &[u8]) -> u64 {
        xxhash_rust::xxh64::xxh64(data, 0)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of partitions the key space maps onto.
    pub partition_count: usize,
    /// Virtual nodes placed on the ring per member.
    pub replication_factor: usize,
    /// Cap on a member's partition share, as a multiple of the average load.
    pub load_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partition_count: 27_103,
            replication_factor: 10,
            load_factor: 1.25,
        }
    }
}

/// Maps routing keys to ring members. Parameters are fixed at construction.
pub struct Ring<H = Xxh64>
where
    H: Hasher,
{
    config: Config,
    hasher: H,
    members: BTreeSet<String>,
    // Virtual node hash -> owning member.
    ring: HashMap<u64, String>,
    sorted_set: Vec<u64>,
    // Partition id -> owning member, rebuilt on membership change.
    partitions: HashMap<usize, String>,
}

impl Ring<Xxh64> {
    pub fn new(config: Config) -> Self {
        Self::with_hasher(config, Xxh64)
    }
}

impl<H: Hasher> Ring<H> {
    pub fn with_hasher(config: Config, hasher: H) -> Self {
        assert!(config.partition_count > 0, "partition_count must be positive");
        assert!(
            config.replication_factor > 0,
            "replication_factor must be positive"
        );
        Self {
            config,
            hasher,
            members: BTreeSet::new(),
            ring: HashMap::new(),
            sorted_set: Vec::new(),
            partitions: HashMap::new(),
        }
    }

    /// Inserts `member` and redistributes partitions. The first insertion
    /// initialises the ring. Re-adding an existing member is a no-op.
    pub fn add(&mut self, member: &str) {
        if !self.members.insert(member.to_string()) {
            return;
        }
        for i in 0..self.config.replication_factor {
            let vnode = format!("{member}{i}");
            let hash = self.hasher.sum64(vnode.as_bytes());
            self.ring.insert(hash, member.to_string());
        }
        self.rebuild();
    }

    /// Removes `member` and redistributes its partitions over the remainder.
    pub fn remove(&mut self, member: &str) {
        if !self.members.remove(member) {
            return;
        }
        for i in 0..self.config.replication_factor {
            let vnode = format!("{member}{i}");
            let hash = self.hasher.sum64(vnode.as_bytes());
            self.ring.remove(&hash);
        }
        self.rebuild();
    }

    /// Returns the member owning `key`, or `None` for an empty ring.
    /// Deterministic and stable for a fixed member set.
    pub fn locate(&self, key: &[u8]) -> Option<&str> {
        let partition = (self.hasher.sum64(key) % self.config.partition_count as u64) as usize;
        self.partition_owner(partition)
    }

    pub fn partition_owner(&self, partition: usize) -> Option<&str> {
        self.partitions.get(&partition).map(String::as_str)
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn partition_count(&self) -> usize {
        self.config.partition_count
    }

    fn average_load(&self) -> f64 {
        (self.config.partition_count as f64 / self.members.len() as f64
            * self.config.load_factor)
            .ceil()
    }

    fn rebuild(&mut self) {
        self.sorted_set = self.ring.keys().copied().collect();
        self.sorted_set.sort_unstable();
        self.partitions.clear();

        if self.members.is_empty() {
            return;
        }
        let average_load = self.average_load();
        let mut loads: HashMap<&str, f64> = HashMap::new();

        for partition in 0..self.config.partition_count {
            let hash = self.hasher.sum64(&(partition as u64).to_le_bytes());
            let start = match self.sorted_set.binary_search(&hash) {
                Ok(index) => index,
                Err(index) if index == self.sorted_set.len() => 0,
                Err(index) => index,
            };

            // Walk the ring until a member with spare capacity is found.
            let mut index = start;
            let mut visited = 0;
            loop {
                visited += 1;
                if visited >= self.sorted_set.len() {
                    panic!("not enough room to distribute partitions");
                }
                let member = self.ring[&self.sorted_set[index]].as_str();
                let load = loads.entry(member).or_insert(0.0);
                if *load + 1.0 <= average_load {
                    *load += 1.0;
                    self.partitions.insert(partition, member.to_string());
                    break;
                }
                index += 1;
                if index >= self.sorted_set.len() {
                    index = 0;
                }
            }
        }
    }
}
