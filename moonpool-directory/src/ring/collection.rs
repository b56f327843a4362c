//! Sorted, non-overlapping sets of ring ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::range::{RingRange, RING_SIZE};

/// A sorted, non-overlapping set of [`RingRange`]s.
///
/// Represents everything one silo owns (all its partitions' ranges
/// combined). Ranges are sorted by start; since ranges never overlap, at most
/// one of them wraps and it is always the last one.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingRangeCollection {
    ranges: Vec<RingRange>,
}

impl RingRangeCollection {
    /// The empty collection.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a collection from arbitrary ranges.
    ///
    /// Empty ranges are dropped. The ranges must not overlap.
    pub fn create(ranges: impl IntoIterator<Item = RingRange>) -> Self {
        let mut ranges: Vec<RingRange> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
        ranges.sort_by_key(|r| (r.is_wrapped(), r.start()));
        let collection = Self { ranges };
        debug_assert!(
            collection.is_disjoint(),
            "ring ranges overlap: {collection:?}"
        );
        collection
    }

    /// The ranges, sorted by start.
    pub fn ranges(&self) -> &[RingRange] {
        &self.ranges
    }

    /// Iterate over the ranges.
    pub fn iter(&self) -> impl Iterator<Item = &RingRange> {
        self.ranges.iter()
    }

    /// Number of ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the collection covers no points.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether the collection covers the whole ring.
    pub fn is_full(&self) -> bool {
        self.size() == RING_SIZE
    }

    /// Number of points covered.
    pub fn size(&self) -> u64 {
        self.ranges.iter().map(RingRange::size).sum()
    }

    /// Share of the ring covered, in percent.
    pub fn size_percent(&self) -> f64 {
        self.size() as f64 * 100.0 / RING_SIZE as f64
    }

    /// Whether any range contains `point`.
    pub fn contains(&self, point: u32) -> bool {
        let Some(last) = self.ranges.last() else {
            return false;
        };

        let linear = if last.is_wrapped() {
            &self.ranges[..self.ranges.len() - 1]
        } else {
            &self.ranges[..]
        };
        let index = linear.partition_point(|r| r.start() < point);
        if index > 0 && linear[index - 1].contains(point) {
            return true;
        }

        last.contains(point)
    }

    /// Whether any range shares a point with `range`.
    pub fn intersects(&self, range: &RingRange) -> bool {
        self.ranges.iter().any(|r| r.intersects(range))
    }

    /// The points covered by `self` but not by `previous`.
    ///
    /// When both collections hold the same partitions (same cardinality, each
    /// pair anchored on the same end point) the difference is taken pairwise,
    /// which is how consecutive ownership of one silo is compared. Otherwise
    /// every range of `previous` is subtracted from every range of `self`.
    pub fn difference(&self, previous: &RingRangeCollection) -> RingRangeCollection {
        let paired = self.ranges.len() == previous.ranges.len()
            && self
                .ranges
                .iter()
                .zip(&previous.ranges)
                .all(|(current, prior)| current.end() == prior.end());

        if paired {
            return Self::create(
                self.ranges
                    .iter()
                    .zip(&previous.ranges)
                    .flat_map(|(current, prior)| current.difference(prior)),
            );
        }

        let mut remaining = Vec::new();
        for range in &self.ranges {
            let mut pieces = vec![*range];
            for prior in &previous.ranges {
                pieces = pieces.iter().flat_map(|p| p.difference(prior)).collect();
                if pieces.is_empty() {
                    break;
                }
            }
            remaining.extend(pieces);
        }
        Self::create(remaining)
    }

    fn is_disjoint(&self) -> bool {
        let adjacent_disjoint = self
            .ranges
            .windows(2)
            .all(|pair| !pair[0].intersects(&pair[1]));
        let wrap_disjoint = match (self.ranges.first(), self.ranges.last()) {
            (Some(first), Some(last)) if self.ranges.len() > 1 => !last.intersects(first),
            _ => true,
        };
        adjacent_disjoint && wrap_disjoint
    }
}

impl fmt::Debug for RingRangeCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.ranges).finish()
    }
}

impl fmt::Display for RingRangeCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}% [", self.size_percent())?;
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{range}")?;
        }
        write!(f, "]")
    }
}

impl<'a> IntoIterator for &'a RingRangeCollection {
    type Item = &'a RingRange;
    type IntoIter = std::slice::Iter<'a, RingRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}
