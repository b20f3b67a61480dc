use crate::RwLock;
use foldhash::fast::RandomState;
use std::collections::HashMap;

/// The table held by a single shard.
pub type Entries<V> = HashMap<String, V, RandomState>;

/// A thread-safe partition of a `ShardedMap`.
///
/// This struct wraps a `HashMap` protected by a reader-writer lock: lookups share the
/// lock, mutations take it exclusively.
pub struct Shard<V> {
    /// The underlying hashmap protected by a `RwLock`.
    map: RwLock<Entries<V>>,
}

impl<V> Shard<V> {
    /// Creates a new, empty `Shard`.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a new `Shard` with the specified initial capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The initial capacity of the hashmap.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::with_capacity_and_hasher(
                capacity,
                RandomState::default(),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Returns a clone of the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        self.map.read().get(key).cloned()
    }

    /// Inserts or overwrites the value stored under `key`.
    ///
    /// The key is only copied into an owned `String` when it is not present yet.
    ///
    /// # Returns
    ///
    /// The previous value, if the key was present.
    pub fn put(&self, key: &str, value: V) -> Option<V> {
        let mut map = self.map.write();
        match map.get_mut(key) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => {
                map.insert(key.to_owned(), value);
                None
            }
        }
    }

    /// Removes `key`. Removing an absent key does nothing.
    ///
    /// # Returns
    ///
    /// The removed value, if the key was present.
    pub fn delete(&self, key: &str) -> Option<V> {
        self.map.write().remove(key)
    }

    /// Calls `func` with shared access to the whole shard.
    ///
    /// The lock is held for the duration of the call and released on return, including
    /// when `func` panics.
    ///
    /// # Examples
    /// ```
    /// use shardmap::Shard;
    ///
    /// let shard = Shard::new();
    /// shard.put("a", 1);
    /// shard.put("b", 2);
    /// let sum: i32 = shard.read(|entries| entries.values().sum());
    /// assert_eq!(sum, 3);
    /// ```
    pub fn read<F, R>(&self, func: F) -> R
    where
        F: FnOnce(&Entries<V>) -> R,
    {
        let map = self.map.read();
        func(&map)
    }

    /// Calls `func` with exclusive access to the whole shard.
    ///
    /// Several keys of the same shard can be inspected and modified atomically inside
    /// `func`. The lock is released on return, including when `func` panics.
    ///
    /// # Examples
    /// ```
    /// use shardmap::Shard;
    ///
    /// let shard = Shard::new();
    /// let inserted = shard.write(|entries| {
    ///     if entries.contains_key("a") {
    ///         return false;
    ///     }
    ///     entries.insert("a".to_string(), 1);
    ///     true
    /// });
    /// assert!(inserted);
    /// assert_eq!(shard.get("a"), Some(1));
    /// ```
    pub fn write<F, R>(&self, func: F) -> R
    where
        F: FnOnce(&mut Entries<V>) -> R,
    {
        let mut map = self.map.write();
        func(&mut map)
    }
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for Shard<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never block: a shard may be locked by the caller itself.
        match self.map.try_read() {
            Some(map) => f.debug_struct("Shard").field("len", &map.len()).finish(),
            None => f.debug_struct("Shard").finish_non_exhaustive(),
        }
    }
}
