use std::collections::VecDeque;

/// Single FIFO of `(key, value)` units holding at most one unit per key.
///
/// Re-inserting an existing key removes the prior unit first and appends the
/// new one at the tail, so an updated key moves to the most-recently-written
/// position and can dequeue after older untouched keys.
pub struct KeyedQueue<K, V> {
	items: VecDeque<(K, V)>,
}

impl<K, V> Default for KeyedQueue<K, V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K, V> KeyedQueue<K, V> {
	/// Creates an empty queue.
	pub fn new() -> Self {
		Self { items: VecDeque::new() }
	}

	/// Number of pending units.
	pub fn len(&self) -> usize {
		self.items.len()
	}

	/// True when no units are pending.
	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	/// Pops the head: the oldest surviving unit by (re-)insertion time.
	pub fn dequeue(&mut self) -> Option<(K, V)> {
		self.items.pop_front()
	}

	/// Drops all pending units.
	pub fn clear(&mut self) {
		self.items.clear();
	}
}

impl<K, V> KeyedQueue<K, V>
where
	K: PartialEq,
{
	/// True when a unit for `key` is pending.
	pub fn contains(&self, key: &K) -> bool {
		self.items.iter().any(|(k, _)| k == key)
	}

	/// Inserts a unit, coalescing with any pending unit for the same key.
	///
	/// The prior unit is removed first, then the new one is appended at the
	/// tail. Returns true when a prior unit was replaced.
	pub fn enqueue(&mut self, key: K, value: V) -> bool {
		let replaced = self.remove(&key).is_some();
		self.items.push_back((key, value));
		replaced
	}

	/// Removes the pending unit for `key`, a no-op when none is pending.
	pub fn remove(&mut self, key: &K) -> Option<V> {
		let idx = self.items.iter().position(|(k, _)| k == key)?;
		self.items.remove(idx).map(|(_, value)| value)
	}
}
