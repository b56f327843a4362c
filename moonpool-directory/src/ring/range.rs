//! Intervals on the 32-bit directory ring.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of points on the ring (`2^32`).
pub const RING_SIZE: u64 = 1 << 32;

/// A half-open interval `(start, end]` on the ring `[0, 2^32)`.
///
/// `start >= end` means the range wraps past `u32::MAX` back to zero.
/// Because `start == end` would be ambiguous, two encodings are reserved:
/// [`RingRange::EMPTY`] and [`RingRange::FULL`].
///
/// # Examples
///
/// ```rust
/// use moonpool_directory::RingRange;
///
/// let wrapped = RingRange::new(0xFFFF_FFF0, 0x10);
/// assert!(wrapped.is_wrapped());
/// assert!(wrapped.contains(0x5));
/// assert_eq!(wrapped.size(), 0x20);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RingRange {
    start: u32,
    end: u32,
}

impl RingRange {
    /// The range containing no points.
    pub const EMPTY: RingRange = RingRange { start: 0, end: 0 };

    /// The range containing every point.
    pub const FULL: RingRange = RingRange { start: 1, end: 1 };

    /// Create the range `(start, end]`.
    ///
    /// `start == end` yields [`RingRange::EMPTY`]; use [`RingRange::FULL`]
    /// for the whole ring.
    pub const fn new(start: u32, end: u32) -> Self {
        if start == end {
            Self::EMPTY
        } else {
            Self { start, end }
        }
    }

    /// Exclusive lower bound. Zero for the empty and full ranges.
    pub fn start(&self) -> u32 {
        if self.start == self.end {
            0
        } else {
            self.start
        }
    }

    /// Inclusive upper bound. Zero for the empty and full ranges.
    pub fn end(&self) -> u32 {
        if self.start == self.end {
            0
        } else {
            self.end
        }
    }

    /// Whether the range contains no points.
    pub fn is_empty(&self) -> bool {
        self.start == self.end && self.start == 0
    }

    /// Whether the range contains every point.
    pub fn is_full(&self) -> bool {
        self.start == self.end && self.start != 0
    }

    /// Whether the range wraps past `u32::MAX`.
    pub fn is_wrapped(&self) -> bool {
        self.start > self.end
    }

    /// Whether `point` lies in `(start, end]`.
    pub fn contains(&self, point: u32) -> bool {
        if self.start == self.end {
            return self.is_full();
        }

        if self.start < self.end {
            self.start < point && point <= self.end
        } else {
            point > self.start || point <= self.end
        }
    }

    /// Number of points in the range.
    pub fn size(&self) -> u64 {
        if self.is_empty() {
            0
        } else if self.is_full() {
            RING_SIZE
        } else {
            u64::from(self.end.wrapping_sub(self.start))
        }
    }

    /// Share of the ring covered by this range, in percent.
    pub fn size_percent(&self) -> f64 {
        self.size() as f64 * 100.0 / RING_SIZE as f64
    }

    /// The points of the ring not in this range.
    pub fn complement(&self) -> RingRange {
        if self.is_empty() {
            Self::FULL
        } else if self.is_full() {
            Self::EMPTY
        } else {
            Self {
                start: self.end,
                end: self.start,
            }
        }
    }

    /// Whether the two ranges share at least one point.
    pub fn intersects(&self, other: &RingRange) -> bool {
        !self.intersections(other).is_empty()
    }

    /// The sub-ranges shared by both ranges, sorted by start.
    ///
    /// Two ranges intersect in at most two pieces: when both wrap, the
    /// overlap around zero is one piece and the overlap in the middle of the
    /// ring may be a second one.
    pub fn intersections(&self, other: &RingRange) -> Vec<RingRange> {
        if self.is_empty() || other.is_empty() {
            return Vec::new();
        }
        if self.is_full() {
            return vec![*other];
        }
        if other.is_full() {
            return vec![*self];
        }

        let mut pieces = Vec::with_capacity(4);
        for (a_lo, a_hi) in self.segments() {
            for (b_lo, b_hi) in other.segments() {
                let lo = a_lo.max(b_lo);
                let hi = a_hi.min(b_hi);
                if lo < hi {
                    pieces.push((lo, hi));
                }
            }
        }

        // A piece running up to the top of the ring and one starting at the
        // bottom are the same range seen from both sides of zero.
        let top = pieces.iter().position(|&(lo, hi)| hi == MAX && lo > BOTTOM);
        let bottom = pieces.iter().position(|&(lo, hi)| lo == BOTTOM && hi < MAX);
        let mut result = Vec::with_capacity(2);
        if let (Some(top), Some(bottom)) = (top, bottom) {
            let (start, _) = pieces[top];
            let (_, end) = pieces[bottom];
            result.push(if start == end {
                Self::FULL
            } else {
                Self::new(start as u32, end as u32)
            });
            let (first, second) = (top.max(bottom), top.min(bottom));
            pieces.remove(first);
            pieces.remove(second);
        }

        for (lo, hi) in pieces {
            if lo == BOTTOM && hi == MAX {
                result.push(Self::FULL);
            } else {
                result.push(Self::new(lo as u32, hi as u32));
            }
        }

        result.sort_by_key(|range| range.start());
        result
    }

    /// The points of this range that are not in `other`.
    pub fn difference(&self, other: &RingRange) -> Vec<RingRange> {
        self.intersections(&other.complement())
    }

    /// The range as linear `(lo, hi]` segments over `[-1, 2^32 - 1]`.
    fn segments(&self) -> Vec<(i64, i64)> {
        if self.is_empty() {
            Vec::new()
        } else if self.is_full() {
            vec![(BOTTOM, MAX)]
        } else if self.start < self.end {
            vec![(i64::from(self.start), i64::from(self.end))]
        } else {
            let mut segments = Vec::with_capacity(2);
            if self.start != u32::MAX {
                segments.push((i64::from(self.start), MAX));
            }
            segments.push((BOTTOM, i64::from(self.end)));
            segments
        }
    }
}

const BOTTOM: i64 = -1;
const MAX: i64 = u32::MAX as i64;

impl fmt::Debug for RingRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for RingRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "(empty)")
        } else if self.is_full() {
            write!(f, "(full)")
        } else {
            write!(
                f,
                "(0x{:08X}, 0x{:08X}] {:.2}%",
                self.start,
                self.end,
                self.size_percent()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total_size(ranges: &[RingRange]) -> u64 {
        ranges.iter().map(RingRange::size).sum()
    }

    #[test]
    fn test_wrapped_range_contains_and_size() {
        let r = RingRange::new(0xFFFF_FFF0, 0x10);
        assert!(r.is_wrapped());
        assert!(r.contains(0x5));
        assert!(r.contains(0));
        assert!(r.contains(u32::MAX));
        assert!(r.contains(0x10));
        assert!(!r.contains(0xFFFF_FFF0));
        assert!(!r.contains(0x11));
        assert_eq!(r.size(), 0x20);
    }

    #[test]
    fn test_linear_range_is_half_open() {
        let r = RingRange::new(10, 20);
        assert!(!r.is_wrapped());
        assert!(!r.contains(10));
        assert!(r.contains(11));
        assert!(r.contains(20));
        assert!(!r.contains(21));
        assert_eq!(r.size(), 10);
    }

    #[test]
    fn test_reserved_encodings() {
        assert!(RingRange::EMPTY.is_empty());
        assert!(!RingRange::EMPTY.is_full());
        assert!(RingRange::FULL.is_full());
        assert!(!RingRange::FULL.is_empty());
        assert_eq!(RingRange::new(7, 7), RingRange::EMPTY);
        assert_eq!(RingRange::EMPTY.size(), 0);
        assert_eq!(RingRange::FULL.size(), RING_SIZE);
        assert!(RingRange::FULL.contains(0));
        assert!(RingRange::FULL.contains(u32::MAX));
        assert!(!RingRange::EMPTY.contains(0));
        assert_eq!(RingRange::EMPTY.complement(), RingRange::FULL);
        assert_eq!(RingRange::FULL.complement(), RingRange::EMPTY);
    }

    #[test]
    fn test_complement_partitions_ring() {
        let r = RingRange::new(100, 200);
        let c = r.complement();
        assert_eq!(r.size() + c.size(), RING_SIZE);
        assert!(c.contains(100));
        assert!(!c.contains(150));
        assert!(c.contains(201));
        assert!(r.intersections(&c).is_empty());
    }

    #[test]
    fn test_difference_with_self_is_empty() {
        for r in [
            RingRange::new(10, 20),
            RingRange::new(0xFFFF_FFF0, 0x10),
            RingRange::FULL,
            RingRange::new(u32::MAX, 5),
        ] {
            assert!(r.difference(&r).is_empty(), "{r}");
        }
    }

    #[test]
    fn test_intersection_linear_and_wrapped() {
        let linear = RingRange::new(0, 0x20);
        let wrapped = RingRange::new(0xFFFF_FFF0, 0x10);
        let overlap = linear.intersections(&wrapped);
        assert_eq!(overlap, vec![RingRange::new(0, 0x10)]);
        assert_eq!(wrapped.intersections(&linear), overlap);
    }

    #[test]
    fn test_intersection_includes_zero() {
        // (MAX, 0x10] is [0, 0x10]; zero must survive the intersection.
        let low = RingRange::new(u32::MAX, 0x10);
        let wrapped = RingRange::new(0xFFFF_FFF0, 0x8);
        let overlap = low.intersections(&wrapped);
        assert_eq!(overlap, vec![RingRange::new(u32::MAX, 0x8)]);
        assert!(overlap[0].contains(0));
        assert_eq!(total_size(&overlap), 9);
    }

    #[test]
    fn test_two_wrapped_ranges_intersect_in_two_pieces() {
        let a = RingRange::new(10, 5);
        let b = RingRange::new(20, 15);
        let pieces = a.intersections(&b);
        assert_eq!(pieces.len(), 2);
        assert!(pieces.contains(&RingRange::new(10, 15)));
        assert!(pieces.contains(&RingRange::new(20, 5)));
        for point in [0u32, 5, 11, 15, 21, u32::MAX] {
            let expected = a.contains(point) && b.contains(point);
            let actual = pieces.iter().any(|p| p.contains(point));
            assert_eq!(expected, actual, "point {point}");
        }
    }

    #[test]
    fn test_difference_of_nested_ranges() {
        let outer = RingRange::new(0, 100);
        let inner = RingRange::new(40, 60);
        let diff = outer.difference(&inner);
        assert_eq!(diff, vec![RingRange::new(0, 40), RingRange::new(60, 100)]);
        assert!(inner.difference(&outer).is_empty());
    }

    #[test]
    fn test_full_intersections() {
        let r = RingRange::new(0xFFFF_FFF0, 0x10);
        assert_eq!(RingRange::FULL.intersections(&r), vec![r]);
        assert_eq!(r.intersections(&RingRange::FULL), vec![r]);
        assert_eq!(
            RingRange::FULL.intersections(&RingRange::FULL),
            vec![RingRange::FULL]
        );
        assert!(RingRange::FULL.intersections(&RingRange::EMPTY).is_empty());
        assert_eq!(
            RingRange::FULL.difference(&r),
            vec![r.complement()]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(RingRange::EMPTY.to_string(), "(empty)");
        assert_eq!(RingRange::FULL.to_string(), "(full)");
        assert!(RingRange::new(1, 2).to_string().starts_with("(0x00000001, 0x00000002]"));
    }
}
