use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};

use ahash::RandomState;

const NO_ENTRY: u32 = u32::MAX;
const MIN_BUCKETS: usize = 64;

/// An append-only table that hands out a dense index for every distinct value it sees.
///
/// The first time a value is interned it receives the next free index (`0`, `1`, `2`, ...). Every
/// later call with an equal value returns that same index. Entries are never removed, so an index
/// stays valid for the life of the table.
///
/// Lookups go through open hashing: `buckets` holds the head of a singly linked chain for every
/// hash bucket, and `next` links each value to the one interned before it in the same bucket. The
/// bucket array doubles whenever there are more values than buckets.
///
/// Once a table has been fully populated, [`Interner::done_interning`] drops the hash index and
/// keeps only the values, which is all that is needed to go from an index back to its value.
#[derive(Debug, Clone)]
pub struct Interner<T> {
    values: Vec<T>,
    next: Vec<u32>,
    buckets: Vec<u32>,
    hasher: RandomState,
    frozen: bool,
}

impl<T> Default for Interner<T>
where
    T: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Interner<T>
where
    T: Hash + Eq,
{
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty table sized for roughly `capacity` distinct values.
    pub fn with_capacity(capacity: usize) -> Self {
        let nbuckets = capacity.next_power_of_two().max(MIN_BUCKETS);
        Interner {
            values: Vec::with_capacity(capacity),
            next: Vec::with_capacity(capacity),
            buckets: vec![NO_ENTRY; nbuckets],
            hasher: RandomState::new(),
            frozen: false,
        }
    }

    /// Returns the index of `value`, allocating the next dense index if it has not been seen.
    ///
    /// # Panics
    ///
    /// Panics if [`Interner::done_interning`] has already been called.
    pub fn intern(&mut self, value: T) -> usize {
        if let Some(index) = self.lookup(&value) {
            return index;
        }
        self.insert_new(value)
    }

    /// Like [`Interner::intern`], but only converts `value` into an owned `T` when it is new.
    pub fn intern_ref<Q>(&mut self, value: &Q) -> usize
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = T> + ?Sized,
    {
        if let Some(index) = self.lookup(value) {
            return index;
        }
        self.insert_new(value.to_owned())
    }

    /// Returns the index previously assigned to `value`, if any.
    ///
    /// # Panics
    ///
    /// Panics if [`Interner::done_interning`] has already been called.
    pub fn lookup<Q>(&self, value: &Q) -> Option<usize>
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        assert!(
            !self.frozen,
            "value lookup on an interning table after done_interning"
        );
        let mut cur = self.buckets[self.bucket_of(value)];
        while cur != NO_ENTRY {
            if self.values[cur as usize].borrow() == value {
                return Some(cur as usize);
            }
            cur = self.next[cur as usize];
        }
        None
    }

    /// Returns the value stored at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` was never handed out by this table.
    pub fn get(&self, index: usize) -> &T {
        &self.values[index]
    }

    /// Number of distinct values interned so far.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over the values in index order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &T> + '_ {
        self.values.iter()
    }

    /// Whether [`Interner::done_interning`] has been called.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Frees the hash index. Values stay reachable through [`Interner::get`], but no further
    /// values may be interned or looked up by value.
    pub fn done_interning(&mut self) {
        self.frozen = true;
        self.buckets = Vec::new();
        self.next = Vec::new();
        self.values.shrink_to_fit();
    }

    fn insert_new(&mut self, value: T) -> usize {
        let index = self.values.len();
        assert!(
            index < NO_ENTRY as usize,
            "interning table exceeded {} entries",
            NO_ENTRY
        );
        let bucket = self.bucket_of(&value);
        self.values.push(value);
        self.next.push(self.buckets[bucket]);
        self.buckets[bucket] = index as u32;
        if self.values.len() > self.buckets.len() {
            self.grow();
        }
        index
    }

    fn grow(&mut self) {
        let nbuckets = self.buckets.len() * 2;
        self.buckets.clear();
        self.buckets.resize(nbuckets, NO_ENTRY);
        for index in 0..self.values.len() {
            let bucket = self.bucket_of(&self.values[index]);
            self.next[index] = self.buckets[bucket];
            self.buckets[bucket] = index as u32;
        }
    }

    fn bucket_of<Q>(&self, value: &Q) -> usize
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = self.hasher.build_hasher();
        value.hash(&mut hasher);
        (hasher.finish() as usize) & (self.buckets.len() - 1)
    }
}
