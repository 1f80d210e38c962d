//! Token-range segmentation.
//!
//! Splits a partitioner's full key space into contiguous, ring-ordered repair ranges. All
//! arithmetic is done on `BigInt`: the random partitioner's space is `2^127` wide and the
//! intermediate product `arc_size * requested_total` does not fit in any fixed-width integer.
//!
//! The segmenter trusts its input: ring tokens must already be sorted ascending and lie inside the
//! partitioner's bounds. Misordered input is caught by the coverage check at the end of
//! [`RangeSegmenter::generate_arcs`], not by up-front validation.

mod partitioner;

pub use partitioner::{Partitioner, SegmenterError};

use log::{debug, trace};
use num::{BigInt, Integer, One, ToPrimitive, Zero};
use std::fmt;
use std::str::FromStr;

/// Largest segment count that may be requested for one table ring.
pub const MAX_SLICES: u64 = 100_000;

/// Largest number of ranges a single ring may be split into, across all of its arcs.
pub const MAX_RING_SEGMENTS: u64 = 1_000_000;

/// Half-open token interval `[start, end)` in ring order.
///
/// `end` may be numerically smaller than `start` when the range wraps past `RANGE_MAX`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepairRange {
    pub start: BigInt,
    pub end: BigInt,
}

impl RepairRange {
    pub fn new(start: BigInt, end: BigInt) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for RepairRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.start, self.end)
    }
}

/// How many segments a single ring arc receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentCountPolicy {
    /// `ceil(requested_total * arc_size / RANGE_SIZE)`: the requested total is spread over the
    /// ring in proportion to each arc's share of the key space.
    #[default]
    Proportional,
    /// Every arc receives `requested_total` segments regardless of its width.
    PerArc,
}

impl SegmentCountPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentCountPolicy::Proportional => "proportional",
            SegmentCountPolicy::PerArc => "per-arc",
        }
    }
}

impl FromStr for SegmentCountPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "proportional" => Ok(SegmentCountPolicy::Proportional),
            "per-arc" | "per_arc" => Ok(SegmentCountPolicy::PerArc),
            other => Err(format!(
                "unknown segment policy `{other}` (expected `proportional` or `per-arc`)"
            )),
        }
    }
}

/// One ring arc `[start, stop)` and the ranges it was split into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenArc {
    pub start: BigInt,
    pub stop: BigInt,
    pub size: BigInt,
    pub ranges: Vec<RepairRange>,
}

/// Parses a decimal token as reported by the cluster.
pub fn parse_token(raw: &str) -> Result<BigInt, SegmenterError> {
    BigInt::from_str(raw.trim()).map_err(|_| SegmenterError::InvalidToken(raw.to_string()))
}

#[derive(Debug, Clone)]
pub struct RangeSegmenter {
    partitioner: Partitioner,
    range_min: BigInt,
    range_max: BigInt,
    range_size: BigInt,
    policy: SegmentCountPolicy,
}

impl RangeSegmenter {
    /// Builds a segmenter for the named partitioner.
    ///
    /// This is the only fallible step for well-formed input: unsupported partitioners are
    /// rejected here so the worker refuses to start rather than failing mid-pass.
    pub fn new(partitioner_name: &str) -> Result<Self, SegmenterError> {
        Ok(Self::for_partitioner(Partitioner::from_class_name(
            partitioner_name,
        )?))
    }

    pub fn for_partitioner(partitioner: Partitioner) -> Self {
        Self {
            partitioner,
            range_min: partitioner.range_min(),
            range_max: partitioner.range_max(),
            range_size: partitioner.range_size(),
            policy: SegmentCountPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SegmentCountPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }

    pub fn policy(&self) -> SegmentCountPolicy {
        self.policy
    }

    pub fn range_size(&self) -> &BigInt {
        &self.range_size
    }

    pub fn contains(&self, token: &BigInt) -> bool {
        *token >= self.range_min && *token <= self.range_max
    }

    /// Splits the whole ring into ranges, in ring order starting at `ring_tokens[0]`.
    pub fn generate(
        &self,
        ring_tokens: &[BigInt],
        requested_total: u64,
    ) -> Result<Vec<RepairRange>, SegmenterError> {
        Ok(self
            .generate_arcs(ring_tokens, requested_total)?
            .into_iter()
            .flat_map(|arc| arc.ranges)
            .collect())
    }

    /// Splits the ring arc by arc, keeping each arc's ranges together.
    ///
    /// Arc `i` runs from `ring_tokens[i]` to `ring_tokens[i + 1]`; the last arc wraps back to
    /// `ring_tokens[0]`. A `requested_total` of zero is treated as one.
    pub fn generate_arcs(
        &self,
        ring_tokens: &[BigInt],
        requested_total: u64,
    ) -> Result<Vec<TokenArc>, SegmenterError> {
        if ring_tokens.is_empty() {
            return Err(SegmenterError::EmptyRing);
        }
        if requested_total > MAX_SLICES {
            return Err(SegmenterError::SlicesOutOfRange {
                requested: requested_total,
                max: MAX_SLICES,
            });
        }

        let requested_total = requested_total.max(1);
        let token_count = ring_tokens.len();

        let mut planned = Vec::with_capacity(token_count);
        let mut total = 0u64;
        for (i, start) in ring_tokens.iter().enumerate() {
            let stop = &ring_tokens[(i + 1) % token_count];
            let size = self.arc_size(start, stop);
            let segment_count = self.segments_for_arc(&size, requested_total);
            total = total.saturating_add(segment_count);
            planned.push((start, stop, size, segment_count));
        }
        if total > MAX_RING_SEGMENTS {
            return Err(SegmenterError::TooManySegments {
                total,
                max: MAX_RING_SEGMENTS,
            });
        }

        let mut arcs = Vec::with_capacity(token_count);
        for (start, stop, size, segment_count) in planned {
            debug!("Dividing token range [{start},{stop}) into {segment_count} segments");

            let ranges = self.split_arc(start, &size, segment_count);
            arcs.push(TokenArc {
                start: start.clone(),
                stop: stop.clone(),
                size,
                ranges,
            });
        }

        let all_ranges: Vec<&RepairRange> = arcs.iter().flat_map(|arc| arc.ranges.iter()).collect();
        self.verify_coverage(&all_ranges)?;

        Ok(arcs)
    }

    /// Number of segments the arc contributes under the active policy.
    ///
    /// Clamped to `[1, arc_size]`: an arc narrower than its segment count would otherwise produce
    /// empty `[t, t)` ranges.
    pub fn segments_for_arc(&self, arc_size: &BigInt, requested_total: u64) -> u64 {
        let requested_total = requested_total.max(1);
        let total = BigInt::from(requested_total);

        let count = match self.policy {
            SegmentCountPolicy::Proportional => ceil_div(&(&total * arc_size), &self.range_size),
            SegmentCountPolicy::PerArc => ceil_div(&(arc_size * &total), arc_size),
        };

        let count = count.min(arc_size.clone()).max(BigInt::one());
        count.to_u64().unwrap_or(requested_total)
    }

    /// Distance from `start` to `stop` walking the ring upwards; `stop <= start` wraps.
    pub fn arc_size(&self, start: &BigInt, stop: &BigInt) -> BigInt {
        let size = stop - start;
        if size <= BigInt::zero() {
            size + &self.range_size
        } else {
            size
        }
    }

    /// Number of tokens covered by `range`.
    pub fn span(&self, range: &RepairRange) -> BigInt {
        self.arc_size(&range.start, &range.end)
    }

    fn split_arc(&self, start: &BigInt, size: &BigInt, segment_count: u64) -> Vec<RepairRange> {
        let divisor = BigInt::from(segment_count);

        let endpoints: Vec<BigInt> = (0..=segment_count)
            .map(|j| {
                let offset = (size * BigInt::from(j)) / &divisor;
                let token = start + offset;
                if token > self.range_max {
                    token - &self.range_size
                } else {
                    token
                }
            })
            .collect();

        endpoints
            .windows(2)
            .enumerate()
            .map(|(j, pair)| {
                trace!("Segment #{}: [{},{})", j + 1, pair[0], pair[1]);
                RepairRange::new(pair[0].clone(), pair[1].clone())
            })
            .collect()
    }

    fn verify_coverage(&self, ranges: &[&RepairRange]) -> Result<(), SegmenterError> {
        let mut covered = BigInt::zero();

        for (index, range) in ranges.iter().enumerate() {
            let next = ranges[(index + 1) % ranges.len()];
            if range.end != next.start {
                return Err(SegmenterError::Discontiguous {
                    index,
                    end: range.end.to_string(),
                    next_start: next.start.to_string(),
                });
            }
            covered += self.span(range);
        }

        if covered != self.range_size {
            return Err(SegmenterError::CoverageMismatch {
                expected: self.range_size.to_string(),
                actual: covered.to_string(),
            });
        }

        Ok(())
    }
}

/// Ceiling division for non-negative operands.
fn ceil_div(numerator: &BigInt, denominator: &BigInt) -> BigInt {
    let (quotient, remainder) = numerator.div_rem(denominator);
    if remainder.is_zero() {
        quotient
    } else {
        quotient + 1u8
    }
}
