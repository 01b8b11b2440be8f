use core::hash::Hash;
use std::{collections::hash_map::DefaultHasher, hash::Hasher};

use parking_lot::{Mutex, MutexGuard};

/// Fixed-size table of mutexes addressed by key hash. Used to serialize
/// concurrent writers of the same content address without allocating a lock
/// per key.
pub struct MutexMap<T: Default> {
    map: Box<[Mutex<T>]>,
    mask: u64,
    hasher: DefaultHasher,
}

impl<T: Default> MutexMap<T> {
    pub fn with_capacity(size: usize) -> MutexMap<T> {
        let size = size.next_power_of_two();
        MutexMap {
            map: (0..size)
                .map(|_| Mutex::new(T::default()))
                .collect::<Vec<Mutex<T>>>()
                .into_boxed_slice(),
            mask: (size - 1) as u64,
            hasher: DefaultHasher::new(),
        }
    }

    pub fn lock_hash<U>(&self, key: U) -> MutexGuard<'_, T>
    where
        U: Hash,
    {
        let mut hasher = self.hasher.clone();
        key.hash(&mut hasher);
        let hash = hasher.finish() & self.mask;
        self.map[hash as usize].lock()
    }
}
