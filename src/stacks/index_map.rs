use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Maps several dense index ranges, one per source, onto one contiguous aggregate range.
///
/// Source `i` with count `c_i` owns the aggregate indices
/// `[c_0 + ... + c_(i-1), c_0 + ... + c_i)`. Negative indices are sentinels (invalid, discarded)
/// and pass through both directions untouched.
///
/// The last answer of [`IndexMap::source_of`] is remembered, since consecutive lookups usually
/// land in the same source.
#[derive(Debug)]
pub struct IndexMap {
    /// `ends[i]` is one past the last aggregate index owned by source `i`.
    ends: Vec<i32>,
    last_source: AtomicUsize,
}

impl Clone for IndexMap {
    fn clone(&self) -> Self {
        IndexMap {
            ends: self.ends.clone(),
            last_source: AtomicUsize::new(self.last_source.load(Ordering::Relaxed)),
        }
    }
}

impl IndexMap {
    /// Builds a map from the per-source counts, in source order.
    pub fn new<I>(counts: I) -> Result<Self>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut ends = Vec::new();
        let mut total: i64 = 0;
        for (index, count) in counts.into_iter().enumerate() {
            if count == 0 {
                return Err(Error::NonPositiveCount { index, count: 0 });
            }
            total += count as i64;
            assert!(
                total <= i32::MAX as i64,
                "index map total {} does not fit an index",
                total
            );
            ends.push(total as i32);
        }
        if ends.is_empty() {
            return Err(Error::EmptyIndexMap);
        }
        Ok(IndexMap {
            ends,
            last_source: AtomicUsize::new(0),
        })
    }

    /// Total size of the aggregate range.
    pub fn count(&self) -> usize {
        self.ends[self.ends.len() - 1] as usize
    }

    /// Number of sources.
    pub fn source_count(&self) -> usize {
        self.ends.len()
    }

    /// The source owning `aggregate`.
    ///
    /// # Panics
    ///
    /// Panics if `aggregate` is negative or not below [`IndexMap::count`].
    pub fn source_of(&self, aggregate: i32) -> usize {
        assert!(
            aggregate >= 0 && aggregate < self.ends[self.ends.len() - 1],
            "aggregate index {} outside of index map",
            aggregate
        );
        let last = self.last_source.load(Ordering::Relaxed);
        if aggregate < self.ends[last] && aggregate >= self.base(last) {
            return last;
        }
        // The first source whose end exceeds `aggregate`, i.e. whose end is >= aggregate + 1.
        let source = match self.ends.binary_search(&(aggregate + 1)) {
            Ok(source) | Err(source) => source,
        };
        self.last_source.store(source, Ordering::Relaxed);
        source
    }

    /// Position of `aggregate` within `source`. A `source` of `None` is the identity.
    pub fn offset_of(&self, source: Option<usize>, aggregate: i32) -> i32 {
        match source {
            Some(source) if aggregate >= 0 => aggregate - self.base(source),
            _ => aggregate,
        }
    }

    /// The aggregate index of `offset` within `source`; negative offsets pass through.
    pub fn index_of(&self, source: usize, offset: i32) -> i32 {
        if offset < 0 {
            return offset;
        }
        let index = self.base(source) + offset;
        debug_assert!(index < self.ends[source], "offset {} too large for source {}", offset, source);
        index
    }

    fn base(&self, source: usize) -> i32 {
        if source == 0 {
            0
        } else {
            self.ends[source - 1]
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn rejects_bad_counts() {
        assert!(matches!(
            IndexMap::new(Vec::new()),
            Err(Error::EmptyIndexMap)
        ));
        assert!(matches!(
            IndexMap::new(vec![3, 0, 2]),
            Err(Error::NonPositiveCount { index: 1, .. })
        ));
    }

    #[test]
    fn maps_both_ways() {
        let map = IndexMap::new(vec![3, 1, 4]).unwrap();
        assert_eq!(map.count(), 8);
        let expected = [(0, 0), (0, 1), (0, 2), (1, 0), (2, 0), (2, 1), (2, 2), (2, 3)];
        for (aggregate, &(source, offset)) in expected.iter().enumerate() {
            let aggregate = aggregate as i32;
            assert_eq!(map.source_of(aggregate), source);
            assert_eq!(map.offset_of(Some(source), aggregate), offset);
            assert_eq!(map.index_of(source, offset), aggregate);
        }
        // Lookups in reverse defeat the memoized answer.
        for aggregate in (0..8).rev() {
            let source = map.source_of(aggregate);
            assert_eq!(expected[aggregate as usize].0, source);
        }
    }

    #[test]
    fn sentinels_pass_through() {
        let map = IndexMap::new(vec![2, 2]).unwrap();
        assert_eq!(map.index_of(1, -1), -1);
        assert_eq!(map.index_of(1, -2), -2);
        assert_eq!(map.offset_of(Some(1), -1), -1);
        assert_eq!(map.offset_of(None, 3), 3);
    }

    #[test]
    fn round_trips_random_splits() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..50 {
            let counts: Vec<usize> = (0..rng.gen_range(1..10))
                .map(|_| rng.gen_range(1..20))
                .collect();
            let map = IndexMap::new(counts.clone()).unwrap();
            assert_eq!(map.count(), counts.iter().sum::<usize>());
            for i in 0..map.count() as i32 {
                let source = map.source_of(i);
                assert_eq!(map.index_of(source, map.offset_of(Some(source), i)), i);
            }
        }
    }
}
