//! Interval sets over guest addresses.
//!
//! [`RangeSet`] keeps disjoint, coalesced `[start, end)` intervals and is used for the
//! GPU-modified bookkeeping. [`OverlapRangeSet`] counts how many in-flight download generations
//! cover each byte, so a write-back can tell when the last generation covering a range retired.

use std::collections::BTreeMap;

use crate::addr::DeviceAddr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// `start -> end`, disjoint and never adjacent.
    ranges: BTreeMap<DeviceAddr, DeviceAddr>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Number of disjoint intervals.
    pub fn interval_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceAddr, DeviceAddr)> + '_ {
        self.ranges.iter().map(|(&start, &end)| (start, end))
    }

    pub fn add(&mut self, start: DeviceAddr, size: u64) {
        if size == 0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = start.saturating_add(size);
        // Intervals are sorted by start, so walking backwards from `new_end` visits them in
        // decreasing end order as well.
        let touching: Vec<(DeviceAddr, DeviceAddr)> = self
            .ranges
            .range(..=new_end)
            .rev()
            .take_while(|&(_, &end)| end >= new_start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in touching {
            self.ranges.remove(&s);
            new_start = new_start.min(s);
            new_end = new_end.max(e);
        }
        self.ranges.insert(new_start, new_end);
    }

    pub fn subtract(&mut self, start: DeviceAddr, size: u64) {
        if size == 0 {
            return;
        }
        let end = start.saturating_add(size);
        let hit: Vec<(DeviceAddr, DeviceAddr)> = self
            .ranges
            .range(..end)
            .rev()
            .take_while(|&(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in hit {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start);
            }
            if e > end {
                self.ranges.insert(end, e);
            }
        }
    }

    pub fn for_each(&self, mut func: impl FnMut(DeviceAddr, DeviceAddr)) {
        for (&start, &end) in &self.ranges {
            func(start, end);
        }
    }

    /// Calls `func` with every interval intersecting `[start, start + size)`, clipped to it.
    pub fn for_each_in_range(
        &self,
        start: DeviceAddr,
        size: u64,
        mut func: impl FnMut(DeviceAddr, DeviceAddr),
    ) {
        if size == 0 {
            return;
        }
        let end = start.saturating_add(size);
        let first = self
            .ranges
            .range(..start)
            .next_back()
            .filter(|&(_, &e)| e > start);
        for (&s, &e) in first.into_iter().chain(self.ranges.range(start..end)) {
            func(s.max(start), e.min(end));
        }
    }

    /// Calls `func` with every sub-range of `[start, start + size)` not covered by the set.
    pub fn for_each_gap(
        &self,
        start: DeviceAddr,
        size: u64,
        mut func: impl FnMut(DeviceAddr, DeviceAddr),
    ) {
        if size == 0 {
            return;
        }
        let end = start.saturating_add(size);
        let mut cursor = start;
        self.for_each_in_range(start, size, |s, e| {
            if s > cursor {
                func(cursor, s);
            }
            cursor = e;
        });
        if cursor < end {
            func(cursor, end);
        }
    }

    pub fn intersects(&self, start: DeviceAddr, size: u64) -> bool {
        let mut found = false;
        self.for_each_in_range(start, size, |_, _| found = true);
        found
    }

    /// Returns true when every byte of `[start, start + size)` is in the set.
    pub fn covers(&self, start: DeviceAddr, size: u64) -> bool {
        let mut uncovered = false;
        self.for_each_gap(start, size, |_, _| uncovered = true);
        !uncovered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    end: DeviceAddr,
    count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct OverlapRangeSet {
    segments: BTreeMap<DeviceAddr, Segment>,
}

impl OverlapRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Split the segment straddling `pos` so that `pos` becomes a segment boundary.
    fn split_at(&mut self, pos: DeviceAddr) {
        let Some((&start, &segment)) = self.segments.range(..pos).next_back() else {
            return;
        };
        if segment.end <= pos || start == pos {
            return;
        }
        self.segments.insert(
            start,
            Segment {
                end: pos,
                count: segment.count,
            },
        );
        self.segments.insert(pos, segment);
    }

    fn keys_within(&self, start: DeviceAddr, end: DeviceAddr) -> Vec<DeviceAddr> {
        self.segments.range(start..end).map(|(&s, _)| s).collect()
    }

    pub fn add(&mut self, start: DeviceAddr, size: u64) {
        if size == 0 {
            return;
        }
        let end = start.saturating_add(size);
        self.split_at(start);
        self.split_at(end);
        let mut cursor = start;
        for key in self.keys_within(start, end) {
            if key > cursor {
                self.segments.insert(cursor, Segment { end: key, count: 1 });
            }
            if let Some(segment) = self.segments.get_mut(&key) {
                segment.count += 1;
                cursor = segment.end;
            }
        }
        if cursor < end {
            self.segments.insert(cursor, Segment { end, count: 1 });
        }
    }

    /// Drop one reference from every byte of the range, calling `on_released` for sub-ranges
    /// whose count reached zero.
    pub fn subtract(
        &mut self,
        start: DeviceAddr,
        size: u64,
        mut on_released: impl FnMut(DeviceAddr, DeviceAddr),
    ) {
        if size == 0 {
            return;
        }
        let end = start.saturating_add(size);
        self.split_at(start);
        self.split_at(end);
        for key in self.keys_within(start, end) {
            let Some(segment) = self.segments.get_mut(&key) else {
                continue;
            };
            segment.count -= 1;
            if segment.count == 0 {
                let segment_end = segment.end;
                self.segments.remove(&key);
                on_released(key, segment_end);
            }
        }
    }

    /// Forget the range entirely regardless of its reference count.
    pub fn delete_all(&mut self, start: DeviceAddr, size: u64) {
        if size == 0 {
            return;
        }
        let end = start.saturating_add(size);
        self.split_at(start);
        self.split_at(end);
        for key in self.keys_within(start, end) {
            self.segments.remove(&key);
        }
    }

    pub fn for_each_in_range(
        &self,
        start: DeviceAddr,
        size: u64,
        mut func: impl FnMut(DeviceAddr, DeviceAddr, u32),
    ) {
        if size == 0 {
            return;
        }
        let end = start.saturating_add(size);
        let first = self
            .segments
            .range(..start)
            .next_back()
            .filter(|&(_, segment)| segment.end > start);
        for (&s, segment) in first.into_iter().chain(self.segments.range(start..end)) {
            func(s.max(start), segment.end.min(end), segment.count);
        }
    }
}
