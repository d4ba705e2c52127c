use crate::permutation::{PermutationEngine, DEFAULT_ROUNDS, MAX_CYCLE_WALK};
use crate::SweepError;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

/// Inclusive block of host-order addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressRange {
    pub begin: u32,
    pub end: u32,
}

impl AddressRange {
    /// Host addresses of `address/mask`. Up to /30 the network and broadcast
    /// addresses are left out; /31 and /32 keep the whole block.
    pub fn from_prefix(address: Ipv4Addr, mask: u8) -> Result<Self, SweepError> {
        if mask > 32 {
            return Err(SweepError::InvalidMask(mask));
        }
        let base = u32::from(address);
        let host_bits = u32::from(32 - mask);
        let host_mask = if host_bits == 32 { u32::MAX } else { (1u32 << host_bits) - 1 };
        if base & host_mask != 0 {
            return Err(SweepError::MisalignedAddress { address: address.to_string(), mask });
        }
        let broadcast = base | host_mask;
        if mask >= 31 {
            Ok(AddressRange { begin: base, end: broadcast })
        } else {
            Ok(AddressRange { begin: base + 1, end: broadcast - 1 })
        }
    }

    pub fn len(&self) -> u64 {
        u64::from(self.end - self.begin) + 1
    }

    pub fn contains(&self, address: u32) -> bool {
        self.begin <= address && address <= self.end
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", Ipv4Addr::from(self.begin), Ipv4Addr::from(self.end))
    }
}

/// Visits every address of its ranges once, in keyed pseudorandom order.
///
/// The cursor walks `[start, end)` of the linear index space formed by
/// concatenating the sorted ranges; each position is shuffled over the whole
/// space before being mapped back to an address, so disjoint cursor windows
/// (shards) visit disjoint address sets.
#[derive(Debug, Clone)]
pub struct Sweeper {
    ranges: Vec<AddressRange>,
    total_length: u64,
    seed: u64,
    rounds: u32,
    cycle_cap: u32,
    permutation: Option<PermutationEngine>,
    cursor: u64,
    start: u64,
    end: u64,
}

impl Default for Sweeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sweeper {
    /// Randomly seeded sweeper with the default round count.
    pub fn new() -> Self {
        Self::with_params(rand::random(), DEFAULT_ROUNDS)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_params(seed, DEFAULT_ROUNDS)
    }

    pub fn with_params(seed: u64, rounds: u32) -> Self {
        Sweeper {
            ranges: Vec::new(),
            total_length: 0,
            seed,
            rounds,
            cycle_cap: MAX_CYCLE_WALK,
            permutation: None,
            cursor: 0,
            start: 0,
            end: 0,
        }
    }

    /// Cycle-walk cap of the permutation; see `PermutationEngine::with_cycle_cap`.
    pub fn with_cycle_cap(mut self, cap: u32) -> Self {
        self.cycle_cap = cap;
        self.permutation = self.permutation.map(|p| p.with_cycle_cap(cap));
        self
    }

    /// Adds `address/mask`. Resets the cursor window to the whole space, so
    /// ranges must be added before sweeping or slicing.
    pub fn add_range(&mut self, address: Ipv4Addr, mask: u8) -> Result<(), SweepError> {
        let range = AddressRange::from_prefix(address, mask)?;
        if let Some(existing) = self.ranges.iter().find(|r| r.overlaps(&range)) {
            return Err(SweepError::OverlappingRange { new: range.to_string(), existing: existing.to_string() });
        }
        self.ranges.push(range);
        self.ranges.sort();
        self.total_length = self.ranges.iter().map(AddressRange::len).sum();
        self.permutation = Some(PermutationEngine::new(self.total_length, self.seed, self.rounds)?.with_cycle_cap(self.cycle_cap));
        self.cursor = 0;
        self.start = 0;
        self.end = self.total_length;
        tracing::debug!(%range, total = self.total_length, "range added");
        Ok(())
    }

    /// Accepts `a.b.c.d/n`, or a bare address as a /32.
    pub fn add_cidr(&mut self, text: &str) -> Result<(), SweepError> {
        let text = text.trim();
        let net = if text.contains('/') {
            text.parse::<Ipv4Net>().map_err(|_| SweepError::InvalidCidr(text.to_string()))?
        } else {
            let addr = text.parse::<Ipv4Addr>().map_err(|_| SweepError::InvalidCidr(text.to_string()))?;
            Ipv4Net::new(addr, 32).map_err(|_| SweepError::InvalidCidr(text.to_string()))?
        };
        self.add_range(net.addr(), net.prefix_len())
    }

    /// Shard `index` of `num_shards`: an independent copy whose window is that
    /// share of the whole space. The last shard absorbs the remainder.
    pub fn get_slice(&self, num_shards: usize, index: usize) -> Result<Sweeper, SweepError> {
        if num_shards == 0 || index >= num_shards {
            return Err(SweepError::InvalidShard { index, count: num_shards });
        }
        if self.ranges.is_empty() {
            return Err(SweepError::NoRanges);
        }
        let chunk = self.total_length / num_shards as u64;
        let start = index as u64 * chunk;
        let end = if index + 1 == num_shards { self.total_length } else { start + chunk };
        if start > end {
            return Err(SweepError::ShardInvariantViolation(format!("shard {index}/{num_shards}: start {start} > end {end}")));
        }
        let mut shard = self.clone();
        shard.start = start;
        shard.cursor = start;
        shard.end = end;
        Ok(shard)
    }

    /// Next address of the window, or `Exhausted` once the window is done.
    pub fn get_ip(&mut self) -> Result<Ipv4Addr, SweepError> {
        let permutation = self.permutation.as_ref().ok_or(SweepError::NoRanges)?;
        if self.has_range_finished() {
            return Err(SweepError::Exhausted);
        }
        let mut index = permutation.shuffle(self.cursor)?;
        self.cursor += 1;
        for range in &self.ranges {
            let len = range.len();
            if index < len {
                // index < len <= 2^32, so the sum stays inside the range
                return Ok(Ipv4Addr::from(range.begin + index as u32));
            }
            index -= len;
        }
        Err(SweepError::ShardInvariantViolation(format!("cursor {} maps outside every range", self.cursor - 1)))
    }

    pub fn has_range_finished(&self) -> bool {
        self.cursor >= self.end
    }

    /// `(cursor, window end)`.
    pub fn get_stats(&self) -> (u64, u64) {
        (self.cursor, self.end)
    }

    /// `(window start, window end)`.
    pub fn window(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.cursor)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn drain(sweeper: &mut Sweeper) -> Vec<u32> {
        let mut out = Vec::new();
        while !sweeper.has_range_finished() {
            out.push(u32::from(sweeper.get_ip().unwrap()));
        }
        out
    }

    #[test]
    fn prefix_host_ranges() {
        let r = AddressRange::from_prefix(Ipv4Addr::new(10, 0, 0, 0), 24).unwrap();
        assert_eq!((r.begin, r.end), (0x0A00_0001, 0x0A00_00FE));
        assert_eq!(r.len(), 254);
        assert_eq!(AddressRange::from_prefix(Ipv4Addr::new(10, 0, 0, 0), 30).unwrap().len(), 2);
        assert_eq!(AddressRange::from_prefix(Ipv4Addr::new(10, 0, 0, 0), 31).unwrap().len(), 2);
        let single = AddressRange::from_prefix(Ipv4Addr::new(10, 0, 0, 7), 32).unwrap();
        assert_eq!((single.begin, single.end), (0x0A00_0007, 0x0A00_0007));
        assert_eq!(AddressRange::from_prefix(Ipv4Addr::UNSPECIFIED, 0).unwrap().len(), (1u64 << 32) - 2);
    }

    #[test]
    fn bad_prefixes_are_rejected() {
        let mut s = Sweeper::with_seed(1);
        assert_eq!(s.add_range(Ipv4Addr::new(10, 0, 0, 0), 33), Err(SweepError::InvalidMask(33)));
        assert!(matches!(s.add_range(Ipv4Addr::new(10, 0, 0, 1), 24), Err(SweepError::MisalignedAddress { mask: 24, .. })));
        assert!(matches!(s.add_cidr("10.0.0.0/40"), Err(SweepError::InvalidCidr(_))));
        assert!(matches!(s.add_cidr("not-an-ip"), Err(SweepError::InvalidCidr(_))));
        assert_eq!(s.total_length(), 0);
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let mut s = Sweeper::with_seed(1);
        s.add_cidr("10.0.0.0/24").unwrap();
        assert!(matches!(s.add_cidr("10.0.0.128/25"), Err(SweepError::OverlappingRange { .. })));
        s.add_cidr("10.0.1.0/24").unwrap();
        assert_eq!(s.total_length(), 508);
    }

    #[test]
    fn visits_every_address_exactly_once() {
        let mut s = Sweeper::with_seed(0x5EED);
        s.add_cidr("192.168.1.0/24").unwrap();
        s.add_cidr("10.0.0.0/29").unwrap();
        s.add_cidr("172.16.0.9").unwrap();
        let visited = drain(&mut s);
        assert_eq!(visited.len() as u64, s.total_length());
        let unique: HashSet<u32> = visited.iter().copied().collect();
        assert_eq!(unique.len(), visited.len());
        for addr in &visited {
            assert!(s.ranges().iter().any(|r| r.contains(*addr)));
        }
        assert!(unique.contains(&u32::from(Ipv4Addr::new(172, 16, 0, 9))));
        assert!(!unique.contains(&u32::from(Ipv4Addr::new(192, 168, 1, 0))));
        assert!(!unique.contains(&u32::from(Ipv4Addr::new(192, 168, 1, 255))));
        assert_eq!(s.get_ip(), Err(SweepError::Exhausted));
    }

    #[test]
    fn order_is_shuffled_and_reproducible() {
        let mut a = Sweeper::with_seed(77);
        let mut b = Sweeper::with_seed(77);
        a.add_cidr("10.1.0.0/22").unwrap();
        b.add_cidr("10.1.0.0/22").unwrap();
        let (va, vb) = (drain(&mut a), drain(&mut b));
        assert_eq!(va, vb);
        let mut sorted = va.clone();
        sorted.sort_unstable();
        assert_ne!(va, sorted);
    }

    #[test]
    fn shards_partition_the_space() {
        let mut s = Sweeper::with_seed(3);
        s.add_cidr("10.2.0.0/22").unwrap();
        s.add_cidr("10.9.9.0/30").unwrap();
        let total = s.total_length();
        let shards: Vec<Sweeper> = (0..3).map(|i| s.get_slice(3, i).unwrap()).collect();

        let mut expected_start = 0;
        for shard in &shards {
            let (start, end) = shard.window();
            assert_eq!(start, expected_start);
            expected_start = end;
        }
        assert_eq!(expected_start, total);

        let mut all = HashSet::new();
        for mut shard in shards {
            for addr in drain(&mut shard) {
                assert!(all.insert(addr), "{addr} visited by two shards");
            }
        }
        assert_eq!(all.len() as u64, total);
    }

    #[test]
    fn more_shards_than_addresses() {
        let mut s = Sweeper::with_seed(3);
        s.add_cidr("10.0.0.0/30").unwrap();
        let first = s.get_slice(4, 0).unwrap();
        assert!(first.has_range_finished());
        let mut last = s.get_slice(4, 3).unwrap();
        assert_eq!(drain(&mut last).len(), 2);
    }

    #[test]
    fn invalid_shard_requests() {
        let mut s = Sweeper::with_seed(3);
        assert_eq!(s.get_slice(2, 0).unwrap_err(), SweepError::NoRanges);
        s.add_cidr("10.0.0.0/24").unwrap();
        assert_eq!(s.get_slice(0, 0).unwrap_err(), SweepError::InvalidShard { index: 0, count: 0 });
        assert_eq!(s.get_slice(3, 3).unwrap_err(), SweepError::InvalidShard { index: 3, count: 3 });
    }

    #[test]
    fn stats_track_the_cursor() {
        let mut s = Sweeper::with_seed(9);
        s.add_cidr("10.0.0.0/29").unwrap();
        assert_eq!(s.get_stats(), (0, 6));
        s.get_ip().unwrap();
        s.get_ip().unwrap();
        assert_eq!(s.get_stats(), (2, 6));
        assert_eq!(s.remaining(), 4);
    }

    #[test]
    fn empty_sweeper_has_nothing_to_give() {
        let mut s = Sweeper::with_seed(1);
        assert!(s.has_range_finished());
        assert_eq!(s.get_ip(), Err(SweepError::NoRanges));
    }
}
