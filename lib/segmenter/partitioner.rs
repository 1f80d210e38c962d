use num::BigInt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SegmenterError {
    #[error("unsupported partitioner `{0}`")]
    UnsupportedPartitioner(String),
    #[error("cannot segment an empty ring")]
    EmptyRing,
    #[error("invalid token `{0}`")]
    InvalidToken(String),
    #[error("segment {index} ends at {end} but the next segment starts at {next_start}")]
    Discontiguous {
        index: usize,
        end: String,
        next_start: String,
    },
    #[error("segments cover {actual} tokens, expected exactly {expected}")]
    CoverageMismatch { expected: String, actual: String },
    #[error("requested {requested} segments per ring, at most {max} are allowed")]
    SlicesOutOfRange { requested: u64, max: u64 },
    #[error("ring would split into {total} segments, more than the limit of {max}")]
    TooManySegments { total: u64, max: u64 },
}

/// Key-space scheme of the cluster.
///
/// Only the two hash partitioners have a numeric token space that can be split arithmetically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioner {
    /// `[0, 2^127 - 1]`
    Random,
    /// `[-2^63, 2^63 - 1]`
    Murmur3,
}

impl Partitioner {
    /// Resolves a partitioner from its name, accepting fully qualified class names.
    pub fn from_class_name(name: &str) -> Result<Self, SegmenterError> {
        let name = name.trim();
        if name.ends_with("RandomPartitioner") {
            Ok(Partitioner::Random)
        } else if name.ends_with("Murmur3Partitioner") {
            Ok(Partitioner::Murmur3)
        } else {
            Err(SegmenterError::UnsupportedPartitioner(name.to_string()))
        }
    }

    pub fn class_name(self) -> &'static str {
        match self {
            Partitioner::Random => "org.apache.cassandra.dht.RandomPartitioner",
            Partitioner::Murmur3 => "org.apache.cassandra.dht.Murmur3Partitioner",
        }
    }

    pub fn range_min(self) -> BigInt {
        match self {
            Partitioner::Random => BigInt::from(0u8),
            Partitioner::Murmur3 => BigInt::from(i64::MIN),
        }
    }

    pub fn range_max(self) -> BigInt {
        match self {
            Partitioner::Random => BigInt::from(i128::MAX),
            Partitioner::Murmur3 => BigInt::from(i64::MAX),
        }
    }

    /// Number of distinct tokens, `RANGE_MAX - RANGE_MIN + 1`.
    pub fn range_size(self) -> BigInt {
        self.range_max() - self.range_min() + 1u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_short_and_qualified_names() {
        assert_eq!(
            Partitioner::from_class_name("Murmur3Partitioner"),
            Ok(Partitioner::Murmur3)
        );
        assert_eq!(
            Partitioner::from_class_name("org.apache.cassandra.dht.RandomPartitioner"),
            Ok(Partitioner::Random)
        );
        assert_eq!(
            Partitioner::from_class_name(" org.apache.cassandra.dht.Murmur3Partitioner\n"),
            Ok(Partitioner::Murmur3)
        );
    }

    #[test]
    fn rejects_order_preserving_partitioners() {
        for name in [
            "org.apache.cassandra.dht.ByteOrderedPartitioner",
            "org.apache.cassandra.dht.OrderPreservingPartitioner",
            "Murmur3PartitionerV2",
            "",
        ] {
            let err = Partitioner::from_class_name(name).expect_err("expected rejection");
            assert!(matches!(err, SegmenterError::UnsupportedPartitioner(_)));
        }
    }

    #[test]
    fn range_sizes_are_powers_of_two() {
        assert_eq!(
            Partitioner::Murmur3.range_size(),
            BigInt::from(1u8) << 64usize
        );
        assert_eq!(
            Partitioner::Random.range_size(),
            BigInt::from(1u8) << 127usize
        );
    }
}
