use std::sync::Arc;

use parking_lot::Mutex;

/// Opaque token returned by [`LatestGuard::set`], identifying one publish.
///
/// Identity is the allocation itself: two tokens compare equal only when
/// they came from the same `set` call.
pub struct GuardToken<T> {
	slot: Arc<T>,
}

impl<T> Clone for GuardToken<T> {
	fn clone(&self) -> Self {
		Self { slot: Arc::clone(&self.slot) }
	}
}

impl<T> GuardToken<T> {
	/// The payload published with this token.
	pub fn value(&self) -> &T {
		&self.slot
	}
}

/// Optimistic "am I still the most recent update" holder.
///
/// An updater publishes a value with [`set`](Self::set) and may later
/// retract it with [`reset`](Self::reset); the retraction is a silent no-op
/// when a newer publish has superseded the token, so a stale updater never
/// clobbers a more recent one.
pub struct LatestGuard<T> {
	current: Mutex<Option<Arc<T>>>,
}

impl<T> Default for LatestGuard<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> LatestGuard<T> {
	/// Creates an empty guard.
	pub fn new() -> Self {
		Self { current: Mutex::new(None) }
	}

	/// Installs `value` as current and returns its token.
	pub fn set(&self, value: T) -> GuardToken<T> {
		let slot = Arc::new(value);
		*self.current.lock() = Some(Arc::clone(&slot));
		GuardToken { slot }
	}

	/// Like [`set`](Self::set), but returns `None` without installing a new
	/// token when `value` already equals the current payload.
	pub fn compare_set(&self, value: T) -> Option<GuardToken<T>>
	where
		T: PartialEq,
	{
		let mut current = self.current.lock();
		if current.as_deref() == Some(&value) {
			return None;
		}
		let slot = Arc::new(value);
		*current = Some(Arc::clone(&slot));
		Some(GuardToken { slot })
	}

	/// Clears the current state only if `token` is still the one on record.
	///
	/// Returns true when the state was cleared; a superseded token is a
	/// silent no-op.
	pub fn reset(&self, token: &GuardToken<T>) -> bool {
		let mut current = self.current.lock();
		match &*current {
			Some(slot) if Arc::ptr_eq(slot, &token.slot) => {
				*current = None;
				true
			}
			_ => false,
		}
	}

	/// The current payload, `None` when empty.
	pub fn value(&self) -> Option<T>
	where
		T: Clone,
	{
		self.current.lock().as_deref().cloned()
	}
}
