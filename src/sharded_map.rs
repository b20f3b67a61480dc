use crate::{shard_index, Entries, Result, Shard};
use std::sync::OnceLock;

/// A thread-safe map from string keys to values, partitioned across a fixed number of
/// independently locked shards.
pub struct ShardedMap<V> {
    /// The shards, never added to, removed or replaced after construction.
    shards: Vec<Shard<V>>,
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

/// Returns the default number of shards to use for the `ShardedMap`.
fn default_shard_count() -> usize {
    static DEFAULT_SHARD_COUNT: OnceLock<usize> = OnceLock::new();
    *DEFAULT_SHARD_COUNT.get_or_init(|| {
        (std::thread::available_parallelism().map_or(1, usize::from) * 4).next_power_of_two()
    })
}

impl<V> ShardedMap<V> {
    /// Creates a new `ShardedMap` with `shard_count` empty shards.
    ///
    /// # Panics
    ///
    /// Panics if `shard_count` is zero.
    pub fn new(shard_count: usize) -> Self {
        Self::with_capacity_and_shard_count(0, shard_count)
    }

    /// Creates a new `ShardedMap` with the specified initial capacity and the default
    /// number of shards.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_shard_count(capacity, default_shard_count())
    }

    /// Creates a new `ShardedMap` with the specified initial capacity and number of shards.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The total initial capacity, split evenly across the shards.
    /// * `shard_count` - The number of shards to create.
    ///
    /// # Panics
    ///
    /// Panics if `shard_count` is zero.
    pub fn with_capacity_and_shard_count(capacity: usize, shard_count: usize) -> Self {
        assert_ne!(shard_count, 0, "shard count must be non-zero");
        let shard_capacity = capacity / shard_count;
        tracing::debug!(shard_count, capacity, "creating sharded map");
        Self {
            shards: (0..shard_count)
                .map(|_| Shard::with_capacity(shard_capacity))
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the number of shards, fixed for the lifetime of the map.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns the index of the shard that owns `key` in this map.
    pub fn index_of(&self, key: &str) -> Result<usize> {
        shard_index(key, self.shards.len())
    }

    /// Returns the total number of entries.
    ///
    /// The shards are counted one after another, so concurrent writers may make the
    /// result stale by the time it is returned.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Gets the value associated with the given key.
    ///
    /// # Returns
    /// * `Ok(Some(V))` if the key exists
    /// * `Ok(None)` if the key doesn't exist
    /// * `Err(Error::EmptyKey)` if the key is empty
    ///
    /// # Examples
    /// ```
    /// use shardmap::ShardedMap;
    ///
    /// let map = ShardedMap::new(4);
    /// map.put("alice", 1)?;
    /// assert_eq!(map.get("alice")?, Some(1));
    /// assert_eq!(map.get("carol")?, None);
    /// assert!(map.get("").is_err());
    /// # Ok::<(), shardmap::Error>(())
    /// ```
    pub fn get(&self, key: &str) -> Result<Option<V>>
    where
        V: Clone,
    {
        Ok(self.shard(key)?.get(key))
    }

    /// Sets a value in the map, overwriting any previous value.
    ///
    /// # Returns
    ///
    /// The previous value, if the key was present.
    pub fn put(&self, key: &str, value: V) -> Result<Option<V>> {
        Ok(self.shard(key)?.put(key, value))
    }

    /// Removes a key from the map. Removing an absent key succeeds.
    ///
    /// # Returns
    ///
    /// The removed value, if the key was present.
    ///
    /// # Examples
    /// ```
    /// use shardmap::ShardedMap;
    ///
    /// let map = ShardedMap::new(4);
    /// map.put("alice", 1)?;
    /// assert_eq!(map.delete("alice")?, Some(1));
    /// assert_eq!(map.delete("alice")?, None);
    /// # Ok::<(), shardmap::Error>(())
    /// ```
    pub fn delete(&self, key: &str) -> Result<Option<V>> {
        Ok(self.shard(key)?.delete(key))
    }

    /// Calls `func` with shared access to the shard that owns `key`.
    pub fn read_shard_of<F, R>(&self, key: &str, func: F) -> Result<R>
    where
        F: FnOnce(&Entries<V>) -> R,
    {
        Ok(self.shard(key)?.read(func))
    }

    /// Calls `func` with exclusive access to the shard that owns `key`.
    ///
    /// **Locking behaviour:** Deadlock if `func` calls back into this map for a key of
    /// the same shard.
    ///
    /// # Examples
    /// ```
    /// use shardmap::ShardedMap;
    ///
    /// let map = ShardedMap::<u32>::new(4);
    /// // Insert only if absent, atomically.
    /// let inserted = map.write_shard_of("alice", |entries| {
    ///     if entries.contains_key("alice") {
    ///         return false;
    ///     }
    ///     entries.insert("alice".to_string(), 1);
    ///     true
    /// })?;
    /// assert!(inserted);
    /// assert_eq!(map.get("alice")?, Some(1));
    /// # Ok::<(), shardmap::Error>(())
    /// ```
    pub fn write_shard_of<F, R>(&self, key: &str, func: F) -> Result<R>
    where
        F: FnOnce(&mut Entries<V>) -> R,
    {
        Ok(self.shard(key)?.write(func))
    }

    /// Visits every shard in index order under its shared lock.
    ///
    /// Shard `i` is released before shard `i + 1` is locked, so the scan as a whole is
    /// not a snapshot of the map.
    ///
    /// # Examples
    /// ```
    /// use shardmap::ShardedMap;
    ///
    /// let map = ShardedMap::new(4);
    /// map.put("alice", 1)?;
    /// map.put("bob", 2)?;
    /// let mut total = 0;
    /// map.for_each_shard_read(|_, entries| total += entries.values().sum::<i32>());
    /// assert_eq!(total, 3);
    /// # Ok::<(), shardmap::Error>(())
    /// ```
    pub fn for_each_shard_read<F>(&self, mut func: F)
    where
        F: FnMut(usize, &Entries<V>),
    {
        for (index, shard) in self.shards.iter().enumerate() {
            shard.read(|entries| func(index, entries));
        }
    }

    /// Visits every shard in index order under its exclusive lock.
    ///
    /// Shard `i` is released before shard `i + 1` is locked.
    pub fn for_each_shard_write<F>(&self, mut func: F)
    where
        F: FnMut(usize, &mut Entries<V>),
    {
        for (index, shard) in self.shards.iter().enumerate() {
            shard.write(|entries| func(index, entries));
        }
    }

    #[inline(always)]
    fn shard(&self, key: &str) -> Result<&Shard<V>> {
        let idx = shard_index(key, self.shards.len())?;
        Ok(&self.shards[idx])
    }
}

impl ShardedMap<()> {
    /// Maps `key` to a shard index for a map with `shard_count` shards.
    ///
    /// The result only depends on `key` and `shard_count`, whatever the value type of
    /// the map. Same as [`shard_index`].
    ///
    /// # Examples
    /// ```
    /// use shardmap::ShardedMap;
    ///
    /// let map = ShardedMap::<u32>::new(4);
    /// assert_eq!(ShardedMap::compute_index("bob", map.shard_count()).unwrap(), 0);
    /// assert_eq!(map.index_of("bob").unwrap(), 0);
    /// ```
    pub fn compute_index(key: &str, shard_count: usize) -> Result<usize> {
        shard_index(key, shard_count)
    }
}

impl<V> std::fmt::Debug for ShardedMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shard_count", &self.shards.len())
            .finish_non_exhaustive()
    }
}
