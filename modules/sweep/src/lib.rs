//! Address-space traversal: a keyed format-preserving permutation over the
//! configured IPv4 ranges, sliceable into disjoint shards.

mod permutation;
mod sweeper;

pub use permutation::{PermutationEngine, DEFAULT_ROUNDS, MAX_CYCLE_WALK};
pub use sweeper::{AddressRange, Sweeper};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SweepError {
    #[error("permutation range must be non-zero")]
    InvalidRange,
    #[error("index {index} outside permutation range {range}")]
    IndexOutOfRange { index: u64, range: u64 },
    #[error("invalid prefix length /{0}")]
    InvalidMask(u8),
    #[error("{address}/{mask} has host bits set")]
    MisalignedAddress { address: String, mask: u8 },
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),
    #[error("range {new} overlaps already configured {existing}")]
    OverlappingRange { new: String, existing: String },
    #[error("no address ranges configured")]
    NoRanges,
    #[error("invalid shard {index} of {count}")]
    InvalidShard { index: usize, count: usize },
    #[error("address space exhausted")]
    Exhausted,
    /// Fatal: the cycle walk did not land inside the range within the cap.
    #[error("permutation invariant violated: cycle walk from {value} exceeded {cap} steps")]
    PermutationInvariantViolation { value: u64, cap: u32 },
    /// Fatal: a shard window with start past its end, or a cursor outside every range.
    #[error("shard invariant violated: {0}")]
    ShardInvariantViolation(String),
}

impl SweepError {
    /// Invariant violations mean a construction bug; the worker must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PermutationInvariantViolation { .. } | Self::ShardInvariantViolation(_))
    }
}
