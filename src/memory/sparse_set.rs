//! Sets of sample indices stored as sorted half-open ranges
//!
//! Flagging information travels through the pipeline as a [`SparseSet`]
//! instead of one boolean per sample. The ranges are kept sorted, disjoint and
//! non-adjacent after every mutation, so two sets covering the same indices
//! always compare equal.

use std::io::{self, Read, Write};
use std::iter;
use std::ops::Range;

/// An ordered set of disjoint, non-adjacent `[begin, end)` ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseSet {
    ranges: Vec<Range<i64>>,
}

impl SparseSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Add `[begin, end)` to the set, merging with touching ranges
    pub fn include(&mut self, begin: i64, end: i64) -> &mut Self {
        if begin >= end {
            return self;
        }

        // Ranges that overlap or touch [begin, end) form the slice first..last
        let first = self.ranges.partition_point(|r| r.end < begin);
        let last = self.ranges.partition_point(|r| r.start <= end);

        let mut merged = begin..end;
        if first < last {
            merged.start = merged.start.min(self.ranges[first].start);
            merged.end = merged.end.max(self.ranges[last - 1].end);
        }

        self.ranges.splice(first..last, iter::once(merged));
        self
    }

    /// Remove `[begin, end)` from the set, splitting ranges where needed
    pub fn exclude(&mut self, begin: i64, end: i64) -> &mut Self {
        if begin >= end {
            return self;
        }

        let first = self.ranges.partition_point(|r| r.end <= begin);
        let last = self.ranges.partition_point(|r| r.start < end);

        if first >= last {
            return self;
        }

        let left = self.ranges[first].start..begin;
        let right = end..self.ranges[last - 1].end;

        let remainder = [left, right].into_iter().filter(|r| r.start < r.end);
        self.ranges.splice(first..last, remainder);
        self
    }

    /// The part of this set that falls within `[begin, end)`
    pub fn subset(&self, begin: i64, end: i64) -> SparseSet {
        let mut result = SparseSet::new();
        if begin >= end {
            return result;
        }

        let first = self.ranges.partition_point(|r| r.end <= begin);
        for range in self.ranges[first..].iter().take_while(|r| r.start < end) {
            result.ranges.push(range.start.max(begin)..range.end.min(end));
        }

        result
    }

    /// The indices within `[begin, end)` that are not in this set
    pub fn invert(&self, begin: i64, end: i64) -> SparseSet {
        let mut result = SparseSet::new();
        let mut cursor = begin;

        for range in self.subset(begin, end).ranges {
            if range.start > cursor {
                result.ranges.push(cursor..range.start);
            }
            cursor = range.end;
        }

        if cursor < end {
            result.ranges.push(cursor..end);
        }

        result
    }

    /// A copy of this set with every index moved by `offset`
    pub fn shifted(&self, offset: i64) -> SparseSet {
        SparseSet {
            ranges: self
                .ranges
                .iter()
                .map(|r| r.start + offset..r.end + offset)
                .collect(),
        }
    }

    /// Remove every range
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Whether the set holds no indices
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of indices covered by the set
    pub fn count(&self) -> u64 {
        self.ranges.iter().map(|r| (r.end - r.start) as u64).sum()
    }

    /// Whether `index` is covered by the set
    pub fn contains(&self, index: i64) -> bool {
        let pos = self.ranges.partition_point(|r| r.end <= index);
        self.ranges.get(pos).map_or(false, |r| r.start <= index)
    }

    /// The ranges in ascending order
    pub fn ranges(&self) -> &[Range<i64>] {
        &self.ranges
    }

    /// Iterate over the ranges in ascending order
    pub fn iter(&self) -> impl Iterator<Item = &Range<i64>> {
        self.ranges.iter()
    }

    /// Size in bytes of the marshalled form
    pub fn marshalled_size(&self) -> usize {
        4 + self.ranges.len() * 16
    }

    /// Write the set as a little-endian range count followed by begin/end pairs
    pub fn marshall<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&(self.ranges.len() as u32).to_le_bytes())?;
        for range in &self.ranges {
            out.write_all(&range.start.to_le_bytes())?;
            out.write_all(&range.end.to_le_bytes())?;
        }
        Ok(())
    }

    /// Read a set written by [`SparseSet::marshall`]
    pub fn unmarshall<R: Read + ?Sized>(input: &mut R) -> io::Result<SparseSet> {
        let mut word = [0u8; 4];
        input.read_exact(&mut word)?;
        let count = u32::from_le_bytes(word) as usize;

        let mut set = SparseSet::new();
        let mut value = [0u8; 8];
        for _ in 0..count {
            input.read_exact(&mut value)?;
            let begin = i64::from_le_bytes(value);
            input.read_exact(&mut value)?;
            let end = i64::from_le_bytes(value);

            let ordered = set.ranges.last().map_or(true, |last| last.end < begin);
            if begin >= end || !ordered {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed flag range [{}, {})", begin, end),
                ));
            }
            set.ranges.push(begin..end);
        }

        Ok(set)
    }
}
