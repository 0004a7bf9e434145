use std::cmp::max;
use std::collections::BTreeMap;

/// A set of `u64` values, stored as disjoint, non-adjacent inclusive ranges. This is how
///  missing frames are tracked and transmitted: loss tends to come in bursts, so the number
///  of ranges stays small even if many frames are missing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// start -> end (inclusive)
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> RangeSet {
        RangeSet::default()
    }

    pub fn single(value: u64) -> RangeSet {
        let mut result = RangeSet::new();
        result.insert(value, value);
        result
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// number of disjoint ranges
    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    /// number of values in all ranges
    pub fn num_values(&self) -> u64 {
        self.ranges.iter()
            .map(|(&s, &e)| e - s + 1)
            .sum()
    }

    pub fn first(&self) -> Option<u64> {
        self.ranges.keys().next().cloned()
    }

    pub fn last(&self) -> Option<u64> {
        self.ranges.values().next_back().cloned()
    }

    pub fn contains(&self, value: u64) -> bool {
        self.ranges.range(..=value)
            .next_back()
            .map_or(false, |(_, &end)| end >= value)
    }

    /// iterates over the inclusive (start, end) ranges in ascending order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }

    pub fn values(&self) -> impl Iterator<Item = u64> + '_ {
        self.iter().flat_map(|(s, e)| s..=e)
    }

    pub fn insert_one(&mut self, value: u64) {
        self.insert(value, value);
    }

    /// adds all values in `start..=end`, merging with overlapping or adjacent ranges
    pub fn insert(&mut self, start: u64, end: u64) {
        assert!(start <= end, "range {}..={} is empty", start, end);

        let mut new_start = start;
        let mut new_end = end;

        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e.saturating_add(1) >= start {
                new_start = s;
                new_end = max(new_end, e);
                self.ranges.remove(&s);
            }
        }

        while let Some((&s, &e)) = self.ranges.range(new_start..).next() {
            if s > new_end.saturating_add(1) {
                break;
            }
            new_end = max(new_end, e);
            self.ranges.remove(&s);
        }

        self.ranges.insert(new_start, new_end);
    }

    pub fn insert_all(&mut self, other: &RangeSet) {
        for (s, e) in other.iter() {
            self.insert(s, e);
        }
    }

    /// removes all values in `start..=end`, splitting ranges as necessary
    pub fn remove(&mut self, start: u64, end: u64) {
        if start > end {
            return;
        }

        // ranges are disjoint and sorted, so their ends are sorted as well
        let overlapping = self.ranges.range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect::<Vec<_>>();

        for (s, e) in overlapping {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start - 1);
            }
            if e > end {
                self.ranges.insert(end + 1, e);
            }
        }
    }

    /// removes all values strictly below `threshold`
    pub fn remove_below(&mut self, threshold: u64) {
        if threshold > 0 {
            self.remove(0, threshold - 1);
        }
    }

    /// the subset of values in `start..=end`
    pub fn intersect(&self, start: u64, end: u64) -> RangeSet {
        let mut result = RangeSet::new();
        for (s, e) in self.iter() {
            let s = max(s, start);
            let e = e.min(end);
            if s <= e {
                result.insert(s, e);
            }
        }
        result
    }

    /// splits into sets of at most `max_ranges` ranges each, preserving order
    pub fn split_by_num_ranges(&self, max_ranges: usize) -> Vec<RangeSet> {
        assert!(max_ranges > 0);

        let mut result = Vec::new();
        let mut current = RangeSet::new();
        for (s, e) in self.iter() {
            if current.num_ranges() == max_ranges {
                result.push(std::mem::take(&mut current));
            }
            current.ranges.insert(s, e);
        }
        if !current.is_empty() {
            result.push(current);
        }
        result
    }
}

impl FromIterator<u64> for RangeSet {
    fn from_iter<T: IntoIterator<Item=u64>>(iter: T) -> Self {
        let mut result = RangeSet::new();
        for v in iter {
            result.insert_one(v);
        }
        result
    }
}
