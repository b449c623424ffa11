use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::exclusive::{ActionEntry, run_action};
use crate::job::JobError;
use crate::keyed_queue::KeyedQueue;

struct KeyedState<K> {
	queue: KeyedQueue<K, ActionEntry>,
	running: Option<K>,
	closed: bool,
}

struct KeyedInner<K> {
	state: Mutex<KeyedState<K>>,
	notify: Notify,
	cancel: CancellationToken,
}

/// Multi-slot coalescing executor keyed by an identity.
///
/// Each key independently coalesces: a request for a key with a pending unit
/// replaces it (the replaced unit never executes). At most one unit is in
/// flight per instance, drained FIFO by re-insertion time. A faulted unit is
/// logged and the executor stays usable.
pub struct KeyedAction<K> {
	inner: Arc<KeyedInner<K>>,
}

impl<K> Default for KeyedAction<K>
where
	K: PartialEq + fmt::Debug + Send + 'static,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<K> KeyedAction<K>
where
	K: PartialEq + fmt::Debug + Send + 'static,
{
	/// Creates the executor and starts its drain loop.
	///
	/// Must be called from within a Tokio runtime.
	pub fn new() -> Self {
		let inner = Arc::new(KeyedInner {
			state: Mutex::new(KeyedState {
				queue: KeyedQueue::new(),
				running: None,
				closed: false,
			}),
			notify: Notify::new(),
			cancel: CancellationToken::new(),
		});
		tokio::spawn(drain_loop(Arc::clone(&inner)));
		Self { inner }
	}

	/// Requests execution of `factory` under `key`, coalescing with any
	/// pending request for the same key. A unit already in flight for that
	/// key is unaffected.
	pub fn request<F, Fut>(&self, key: K, factory: F, token: CancellationToken)
	where
		F: FnOnce(CancellationToken) -> Fut + Send + 'static,
		Fut: Future<Output = Result<(), JobError>> + Send + 'static,
	{
		let mut st = self.inner.state.lock();
		if st.closed {
			return;
		}
		if st.queue.contains(&key) {
			tracing::trace!(key = ?key, "job.keyed.coalesced");
		}
		st.queue.enqueue(key, ActionEntry::new(factory, token));
		drop(st);
		self.inner.notify.notify_one();
	}

	/// Drops the pending unit for `key`; a no-op when none is pending or
	/// when that key's unit is already running.
	pub fn remove(&self, key: &K) {
		let removed = self.inner.state.lock().queue.remove(key).is_some();
		if removed {
			tracing::trace!(key = ?key, "job.keyed.removed");
		}
	}

	/// Number of not-yet-started units.
	pub fn pending_count(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	/// True while a unit runs or any are pending.
	pub fn is_busy(&self) -> bool {
		let st = self.inner.state.lock();
		st.running.is_some() || !st.queue.is_empty()
	}
}

impl<K> KeyedAction<K> {
	/// Cancels the shared scope: pending units are dropped and an in-flight
	/// unit observes cooperative cancellation via its run token.
	pub fn close(&self) {
		{
			let mut st = self.inner.state.lock();
			st.closed = true;
			st.queue.clear();
		}
		self.inner.cancel.cancel();
		self.inner.notify.notify_waiters();
	}
}

impl<K> Drop for KeyedAction<K> {
	fn drop(&mut self) {
		self.close();
	}
}

async fn drain_loop<K>(inner: Arc<KeyedInner<K>>)
where
	K: PartialEq + Send + 'static,
{
	loop {
		// Register before checking the queue to avoid lost-wakeup.
		let notified = inner.notify.notified();

		if inner.cancel.is_cancelled() {
			break;
		}

		let entry = {
			let mut st = inner.state.lock();
			match st.queue.dequeue() {
				Some((key, entry)) => {
					st.running = Some(key);
					Some(entry)
				}
				None => {
					st.running = None;
					None
				}
			}
		};

		match entry {
			Some(entry) => {
				run_action(&inner.cancel, entry, "keyed").await;
				inner.state.lock().running = None;
			}
			None => {
				tokio::select! {
					_ = inner.cancel.cancelled() => break,
					_ = notified => {}
				}
			}
		}
	}
	inner.state.lock().running = None;
	tracing::debug!("job.keyed.exit");
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use tokio::sync::oneshot;

	use super::*;

	async fn settle<K>(action: &KeyedAction<K>)
	where
		K: PartialEq + fmt::Debug + Send + 'static,
	{
		while action.is_busy() {
			tokio::time::sleep(Duration::from_millis(2)).await;
		}
	}

	#[tokio::test]
	async fn pending_request_for_same_key_is_coalesced() {
		let action = KeyedAction::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let (started_tx, started_rx) = oneshot::channel();
		let (release_tx, release_rx) = oneshot::channel::<()>();

		// Gate the loop so key 1's second submission lands while pending.
		action.request(
			0u32,
			move |_run| async move {
				let _ = started_tx.send(());
				let _ = release_rx.await;
				Ok(())
			},
			CancellationToken::new(),
		);
		started_rx.await.unwrap();

		for value in ["a", "b"] {
			let log = Arc::clone(&log);
			action.request(
				1u32,
				move |_run| async move {
					log.lock().push(value);
					Ok(())
				},
				CancellationToken::new(),
			);
		}
		assert_eq!(action.pending_count(), 1);

		let _ = release_tx.send(());
		settle(&action).await;
		assert_eq!(*log.lock(), vec!["b"]);
	}

	#[tokio::test]
	async fn faulted_unit_leaves_the_executor_usable() {
		let action = KeyedAction::new();
		action.request(5u32, |_run| async { Err(JobError::failed("decode error")) }, CancellationToken::new());
		settle(&action).await;

		let (done_tx, done_rx) = oneshot::channel();
		action.request(
			6u32,
			move |_run| async move {
				let _ = done_tx.send(());
				Ok(())
			},
			CancellationToken::new(),
		);
		tokio::time::timeout(Duration::from_secs(1), done_rx)
			.await
			.expect("executor must survive a faulted unit")
			.unwrap();
	}

	#[tokio::test]
	async fn remove_drops_a_pending_unit_only() {
		let action = KeyedAction::new();
		let ran = Arc::new(AtomicUsize::new(0));
		let (started_tx, started_rx) = oneshot::channel();
		let (release_tx, release_rx) = oneshot::channel::<()>();

		action.request(
			0u32,
			move |_run| async move {
				let _ = started_tx.send(());
				let _ = release_rx.await;
				Ok(())
			},
			CancellationToken::new(),
		);
		started_rx.await.unwrap();

		{
			let ran = Arc::clone(&ran);
			action.request(
				1u32,
				move |_run| async move {
					ran.fetch_add(1, Ordering::SeqCst);
					Ok(())
				},
				CancellationToken::new(),
			);
		}
		action.remove(&1u32);
		// Removing the running key is a no-op.
		action.remove(&0u32);
		assert_eq!(action.pending_count(), 0);

		let _ = release_tx.send(());
		settle(&action).await;
		assert_eq!(ran.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn close_drops_pending_and_cancels_in_flight() {
		let action = KeyedAction::new();
		let ran = Arc::new(AtomicUsize::new(0));
		let (started_tx, started_rx) = oneshot::channel();
		let (done_tx, done_rx) = oneshot::channel();

		action.request(
			0u32,
			move |run: CancellationToken| async move {
				let _ = started_tx.send(());
				run.cancelled().await;
				let _ = done_tx.send(());
				Err(JobError::Cancelled)
			},
			CancellationToken::new(),
		);
		started_rx.await.unwrap();

		{
			let ran = Arc::clone(&ran);
			action.request(
				1u32,
				move |_run| async move {
					ran.fetch_add(1, Ordering::SeqCst);
					Ok(())
				},
				CancellationToken::new(),
			);
		}
		action.close();

		tokio::time::timeout(Duration::from_secs(1), done_rx)
			.await
			.expect("in-flight unit must observe close")
			.unwrap();
		assert_eq!(ran.load(Ordering::SeqCst), 0, "pending units are dropped on close");
	}

	#[tokio::test]
	async fn distinct_keys_run_one_at_a_time_in_order() {
		let action = KeyedAction::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let in_flight = Arc::new(AtomicUsize::new(0));
		let (started_tx, started_rx) = oneshot::channel();
		let (release_tx, release_rx) = oneshot::channel::<()>();

		action.request(
			99u32,
			move |_run| async move {
				let _ = started_tx.send(());
				let _ = release_rx.await;
				Ok(())
			},
			CancellationToken::new(),
		);
		started_rx.await.unwrap();

		for key in 1..=3u32 {
			let log = Arc::clone(&log);
			let in_flight = Arc::clone(&in_flight);
			action.request(
				key,
				move |_run| async move {
					assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0, "at most one unit in flight");
					tokio::time::sleep(Duration::from_millis(2)).await;
					log.lock().push(key);
					in_flight.fetch_sub(1, Ordering::SeqCst);
					Ok(())
				},
				CancellationToken::new(),
			);
		}

		let _ = release_tx.send(());
		settle(&action).await;
		assert_eq!(*log.lock(), vec![1, 2, 3]);
	}
}
