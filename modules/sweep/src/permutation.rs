use crate::SweepError;
use std::fmt;

pub const DEFAULT_ROUNDS: u32 = 4;

/// Upper bound on cycle-walk steps. The padded domain is less than twice the
/// range, so each step lands in range with probability above one half.
pub const MAX_CYCLE_WALK: u32 = 128;

/// Keyed bijection over `[0, range)`.
///
/// Values are split into an `a_bits` high half and a `b_bits` low half of the
/// smallest power-of-two domain covering the range. Even rounds mix the low
/// half into the high half, odd rounds the high half into the low half, each
/// through a BLAKE3 keyed hash of `(round, half)`. Outputs that land in the
/// padding above `range` are fed through the network again (cycle walking).
#[derive(Clone)]
pub struct PermutationEngine {
    range: u64,
    seed: u64,
    rounds: u32,
    key: [u8; 32],
    a_bits: u32,
    b_bits: u32,
    a_mask: u64,
    b_mask: u64,
    cycle_cap: u32,
}

impl fmt::Debug for PermutationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermutationEngine")
            .field("range", &self.range)
            .field("seed", &self.seed)
            .field("rounds", &self.rounds)
            .field("a_bits", &self.a_bits)
            .field("b_bits", &self.b_bits)
            .field("cycle_cap", &self.cycle_cap)
            .finish()
    }
}

fn low_mask(bits: u32) -> u64 {
    match bits {
        0 => 0,
        64.. => u64::MAX,
        n => (1u64 << n) - 1,
    }
}

impl PermutationEngine {
    pub fn new(range: u64, seed: u64, rounds: u32) -> Result<Self, SweepError> {
        if range == 0 {
            return Err(SweepError::InvalidRange);
        }
        let bits = if range <= 1 { 0 } else { 64 - (range - 1).leading_zeros() };
        let a_bits = (bits + 1) / 2;
        let b_bits = bits - a_bits;
        Ok(PermutationEngine {
            range,
            seed,
            rounds,
            key: *blake3::hash(&seed.to_le_bytes()).as_bytes(),
            a_bits,
            b_bits,
            a_mask: low_mask(a_bits),
            b_mask: low_mask(b_bits),
            cycle_cap: MAX_CYCLE_WALK,
        })
    }

    /// Overrides the cycle-walk cap (default `MAX_CYCLE_WALK`). A cap of 0
    /// fails every input whose first pass lands in the padding.
    pub fn with_cycle_cap(mut self, cap: u32) -> Self {
        self.cycle_cap = cap;
        self
    }

    pub fn range(&self) -> u64 {
        self.range
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn shuffle(&self, index: u64) -> Result<u64, SweepError> {
        self.walk(index, |v| self.encrypt(v))
    }

    pub fn unshuffle(&self, value: u64) -> Result<u64, SweepError> {
        self.walk(value, |v| self.decrypt(v))
    }

    fn walk(&self, start: u64, step: impl Fn(u64) -> u64) -> Result<u64, SweepError> {
        if start >= self.range {
            return Err(SweepError::IndexOutOfRange { index: start, range: self.range });
        }
        let mut v = step(start);
        let mut walks = 0;
        while v >= self.range {
            if walks == self.cycle_cap {
                return Err(SweepError::PermutationInvariantViolation { value: start, cap: self.cycle_cap });
            }
            v = step(v);
            walks += 1;
        }
        Ok(v)
    }

    fn round_fn(&self, round: u32, half: u64) -> u64 {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(&round.to_le_bytes());
        hasher.update(&half.to_le_bytes());
        let out = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&out.as_bytes()[..8]);
        u64::from_le_bytes(word)
    }

    fn encrypt(&self, v: u64) -> u64 {
        let (mut a, mut b) = (v >> self.b_bits, v & self.b_mask);
        for round in 0..self.rounds {
            if round % 2 == 0 {
                a ^= self.round_fn(round, b) & self.a_mask;
            } else {
                b ^= self.round_fn(round, a) & self.b_mask;
            }
        }
        (a << self.b_bits) | b
    }

    fn decrypt(&self, v: u64) -> u64 {
        let (mut a, mut b) = (v >> self.b_bits, v & self.b_mask);
        for round in (0..self.rounds).rev() {
            if round % 2 == 0 {
                a ^= self.round_fn(round, b) & self.a_mask;
            } else {
                b ^= self.round_fn(round, a) & self.b_mask;
            }
        }
        (a << self.b_bits) | b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_bijection(range: u64, seed: u64) {
        let engine = PermutationEngine::new(range, seed, DEFAULT_ROUNDS).unwrap();
        let mut seen = vec![false; range as usize];
        for i in 0..range {
            let v = engine.shuffle(i).unwrap();
            assert!(v < range, "range {range}: {i} -> {v}");
            assert!(!seen[v as usize], "range {range}: {v} produced twice");
            seen[v as usize] = true;
            assert_eq!(engine.unshuffle(v).unwrap(), i);
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn bijection_over_assorted_ranges() {
        for range in [1u64, 2, 3, 5, 7, 8, 9, 31, 32, 33, 100, 254, 1000, 4097, 20_000] {
            assert_bijection(range, 0xDEAD_BEEF ^ range);
        }
    }

    #[test]
    fn zero_range_is_rejected() {
        assert_eq!(PermutationEngine::new(0, 1, 4).unwrap_err(), SweepError::InvalidRange);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let engine = PermutationEngine::new(10, 1, 4).unwrap();
        assert!(matches!(engine.shuffle(10), Err(SweepError::IndexOutOfRange { index: 10, range: 10 })));
        assert!(matches!(engine.unshuffle(11), Err(SweepError::IndexOutOfRange { .. })));
    }

    #[test]
    fn same_seed_same_order_different_seed_different_order() {
        let a = PermutationEngine::new(1000, 7, 4).unwrap();
        let b = PermutationEngine::new(1000, 7, 4).unwrap();
        let c = PermutationEngine::new(1000, 8, 4).unwrap();
        let order = |e: &PermutationEngine| (0..1000).map(|i| e.shuffle(i).unwrap()).collect::<Vec<_>>();
        assert_eq!(order(&a), order(&b));
        assert_ne!(order(&a), order(&c));
    }

    #[test]
    fn order_is_not_sequential() {
        let engine = PermutationEngine::new(1000, 42, 4).unwrap();
        let fixed = (0..1000).filter(|&i| engine.shuffle(i).unwrap() == i).count();
        assert!(fixed < 50, "{fixed} fixed points");
    }

    #[test]
    fn full_ipv4_sized_range_stays_in_bounds() {
        let range = u32::MAX as u64 - 1;
        let engine = PermutationEngine::new(range, 99, 4).unwrap();
        for i in [0, 1, 12345, range / 2, range - 1] {
            let v = engine.shuffle(i).unwrap();
            assert!(v < range);
            assert_eq!(engine.unshuffle(v).unwrap(), i);
        }
    }

    #[test]
    fn exhausted_cycle_walk_is_fatal() {
        // 6 of 8 padded slots are in range; some seed sends an index into the padding
        let failure = (0..64u64)
            .find_map(|seed| {
                let engine = PermutationEngine::new(6, seed, DEFAULT_ROUNDS).unwrap().with_cycle_cap(0);
                (0..6).find_map(|i| engine.shuffle(i).err())
            })
            .unwrap();
        assert!(matches!(failure, SweepError::PermutationInvariantViolation { cap: 0, .. }));
        assert!(failure.is_fatal());
        assert!(!SweepError::Exhausted.is_fatal());
    }

    #[test]
    fn power_of_two_range_never_walks() {
        let engine = PermutationEngine::new(8, 3, DEFAULT_ROUNDS).unwrap().with_cycle_cap(0);
        assert!((0..8).all(|i| engine.shuffle(i).is_ok()));
    }
}
