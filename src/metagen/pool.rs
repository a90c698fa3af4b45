// Copyright (c) 2025 knix
// All rights reserved.

use std::hash::Hash;
use std::num::NonZeroU32;

use fxhash::FxHashMap;
use log::trace;

/// Append-only storage addressed by a nonzero id. Ids are handed out in insertion
/// order, so the first element is always id 1.
pub struct Pool<T, Index: Into<NonZeroU32> + From<NonZeroU32>> {
    vec: Vec<T>,
    name: &'static str,
    _index: std::marker::PhantomData<Index>,
}

impl<T, Index: Into<NonZeroU32> + From<NonZeroU32> + Copy> Pool<T, Index> {
    pub fn new(name: &'static str) -> Pool<T, Index> {
        Pool { name, vec: Vec::new(), _index: std::marker::PhantomData }
    }

    pub fn next_id(&self) -> Index {
        // Safety: len + 1 is never zero
        let index = unsafe { NonZeroU32::new_unchecked(self.vec.len() as u32 + 1) };
        Index::from(index)
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn add(&mut self, t: T) -> Index {
        let index = self.next_id();
        self.vec.push(t);
        index
    }

    fn index_to_actual_index(index: Index) -> usize {
        let nz32: NonZeroU32 = index.into();
        nz32.get() as usize - 1
    }

    #[track_caller]
    pub fn get(&self, index: Index) -> &T {
        let actual = Self::index_to_actual_index(index);
        match self.vec.get(actual) {
            None => panic!("pool {} has no entry {}", self.name, actual + 1),
            Some(t) => t,
        }
    }

    pub fn get_mut(&mut self, index: Index) -> &mut T {
        let actual = Self::index_to_actual_index(index);
        &mut self.vec[actual]
    }
}

/// A [`Pool`] that hands back the existing id when an equal value is added again.
pub struct InternPool<T: Hash + Eq + Clone, Index: Into<NonZeroU32> + From<NonZeroU32>> {
    pool: Pool<T, Index>,
    dedup: FxHashMap<T, Index>,
}

impl<T: Hash + Eq + Clone, Index: Into<NonZeroU32> + From<NonZeroU32> + Copy> InternPool<T, Index> {
    pub fn new(name: &'static str) -> Self {
        InternPool { pool: Pool::new(name), dedup: FxHashMap::default() }
    }

    pub fn intern(&mut self, t: T) -> Index {
        if let Some(existing) = self.dedup.get(&t) {
            return *existing;
        }
        let id = self.pool.add(t.clone());
        trace!("interned new {} entry #{}", self.pool.name, self.pool.len());
        self.dedup.insert(t, id);
        id
    }

    pub fn find(&self, t: &T) -> Option<Index> {
        self.dedup.get(t).copied()
    }

    pub fn get(&self, index: Index) -> &T {
        self.pool.get(index)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod test {
    use std::num::NonZeroU32;

    use super::{InternPool, Pool};

    #[test]
    fn single() {
        let mut pool: Pool<i32, NonZeroU32> = Pool::new("single");
        let handle: NonZeroU32 = pool.add(42);
        assert_eq!(*pool.get(handle), 42);
        assert_eq!(handle.get(), 1);
    }

    #[test]
    fn ids_follow_insertion_order() {
        let mut pool: Pool<&str, NonZeroU32> = Pool::new("order");
        let a = pool.add("a");
        let b = pool.add("b");
        assert_eq!((a.get(), b.get()), (1, 2));
        assert_eq!(pool.next_id().get(), 3);
    }

    #[test]
    fn intern_dedups() {
        let mut pool: InternPool<(u32, u32), NonZeroU32> = InternPool::new("intern");
        let a = pool.intern((1, 2));
        let b = pool.intern((3, 4));
        let c = pool.intern((1, 2));
        assert_eq!(a, c, "Identical values should deduplicate");
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2, "Should only have two instances");
        assert_eq!(pool.find(&(3, 4)), Some(b));
    }
}
