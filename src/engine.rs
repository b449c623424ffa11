use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::job::{JobError, JobOperation, QueuedJob};

struct EngineState {
	queue: VecDeque<Arc<dyn QueuedJob>>,
	processing: bool,
	closed: bool,
}

struct EngineInner {
	state: Mutex<EngineState>,
	notify: Notify,
	busy: watch::Sender<bool>,
	cancel: CancellationToken,
}

impl EngineInner {
	/// Recomputes the busy flag; must be called with the state lock held so
	/// observers never see a stale value after submit/pop transitions.
	fn update_busy(&self, state: &EngineState) {
		let busy = state.processing || !state.queue.is_empty();
		self.busy.send_if_modified(|cur| {
			if *cur == busy {
				false
			} else {
				*cur = busy;
				true
			}
		});
	}
}

/// Unbounded FIFO of jobs drained by exactly one background consumer.
///
/// Producers submit from any task; jobs execute strictly in submission
/// order, one at a time, off the producer's call stack. One job's failure is
/// logged and never stops the loop. Dropping the engine closes it.
pub struct SequentialJobEngine {
	inner: Arc<EngineInner>,
}

impl Default for SequentialJobEngine {
	fn default() -> Self {
		Self::new()
	}
}

impl SequentialJobEngine {
	/// Creates the engine and starts its single consumer loop.
	///
	/// Must be called from within a Tokio runtime.
	pub fn new() -> Self {
		let (busy, _) = watch::channel(false);
		let inner = Arc::new(EngineInner {
			state: Mutex::new(EngineState {
				queue: VecDeque::new(),
				processing: false,
				closed: false,
			}),
			notify: Notify::new(),
			busy,
			cancel: CancellationToken::new(),
		});
		tokio::spawn(consumer_loop(Arc::clone(&inner)));
		Self { inner }
	}

	/// Enqueues one unit of work and returns its operation handle.
	///
	/// Synchronous and non-blocking. After [`Self::close`] the work is
	/// refused: the returned operation is already `Cancelled`.
	pub fn submit<T, F, Fut>(&self, work: F) -> JobOperation<T>
	where
		T: Send + 'static,
		F: FnOnce(CancellationToken) -> Fut + Send + 'static,
		Fut: Future<Output = Result<T, JobError>> + Send + 'static,
	{
		let op = JobOperation::new(work);
		let refused = {
			let mut st = self.inner.state.lock();
			if st.closed {
				true
			} else {
				st.queue.push_back(Arc::new(op.clone()) as Arc<dyn QueuedJob>);
				self.inner.update_busy(&st);
				false
			}
		};
		if refused {
			tracing::trace!("job.engine.refused");
			op.cancel_pending();
		} else {
			self.inner.notify.notify_one();
		}
		op
	}

	/// Number of submitted jobs not yet started.
	pub fn pending_count(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	/// True while a job is executing or any are pending.
	pub fn is_busy(&self) -> bool {
		let st = self.inner.state.lock();
		st.processing || !st.queue.is_empty()
	}

	/// Drain barrier: suspends until the engine is neither processing nor
	/// holding pending jobs. `token` cancels the wait only.
	pub async fn wait_idle(&self, token: &CancellationToken) -> Result<(), JobError> {
		let mut rx = self.inner.busy.subscribe();
		tokio::select! {
			biased;
			res = rx.wait_for(|busy| !*busy) => {
				let _ = res;
				Ok(())
			}
			_ = token.cancelled() => Err(JobError::Cancelled),
		}
	}

	/// Stops intake and signals the engine cancellation source.
	///
	/// In-flight work finishes or self-cancels; never-started jobs are
	/// marked `Cancelled` so their waiters unblock.
	pub fn close(&self) {
		{
			let mut st = self.inner.state.lock();
			st.closed = true;
		}
		self.inner.cancel.cancel();
		self.inner.notify.notify_waiters();
		tracing::debug!("job.engine.close");
	}
}

impl Drop for SequentialJobEngine {
	fn drop(&mut self) {
		self.close();
	}
}

async fn consumer_loop(inner: Arc<EngineInner>) {
	loop {
		// Register the notification future before inspecting the queue to
		// avoid lost-wakeup between unlock and await.
		let notified = inner.notify.notified();

		if inner.cancel.is_cancelled() {
			break;
		}

		let next = {
			let mut st = inner.state.lock();
			let job = st.queue.pop_front();
			st.processing = job.is_some();
			inner.update_busy(&st);
			job
		};

		match next {
			Some(job) => {
				match job.invoke(&inner.cancel).await {
					Ok(()) => {}
					Err(JobError::Cancelled) => tracing::trace!("job.engine.cancelled"),
					Err(err) => tracing::warn!(error = %err, "job.engine.faulted"),
				}
				let mut st = inner.state.lock();
				st.processing = false;
				inner.update_busy(&st);
			}
			None => {
				tokio::select! {
					_ = inner.cancel.cancelled() => break,
					_ = notified => {}
				}
			}
		}
	}

	// Shutdown drain: release waiters of jobs that never started.
	let drained: Vec<Arc<dyn QueuedJob>> = {
		let mut st = inner.state.lock();
		st.processing = false;
		let drained = st.queue.drain(..).collect();
		inner.update_busy(&st);
		drained
	};
	for job in drained {
		job.cancel_pending();
	}
	tracing::debug!("job.engine.exit");
}

/// Sequential engine whose jobs additionally receive one shared progress
/// sink. Scheduling semantics are identical to [`SequentialJobEngine`].
pub struct ProgressJobEngine<P> {
	engine: SequentialJobEngine,
	progress: Arc<P>,
}

impl<P> ProgressJobEngine<P>
where
	P: Send + Sync + 'static,
{
	/// Creates the engine around a shared progress sink.
	pub fn new(progress: Arc<P>) -> Self {
		Self {
			engine: SequentialJobEngine::new(),
			progress,
		}
	}

	/// Enqueues work that receives the shared progress sink.
	pub fn submit<T, F, Fut>(&self, work: F) -> JobOperation<T>
	where
		T: Send + 'static,
		F: FnOnce(CancellationToken, Arc<P>) -> Fut + Send + 'static,
		Fut: Future<Output = Result<T, JobError>> + Send + 'static,
	{
		let progress = Arc::clone(&self.progress);
		self.engine.submit(move |token| work(token, progress))
	}

	/// The shared progress sink.
	pub fn progress(&self) -> &Arc<P> {
		&self.progress
	}

	/// See [`SequentialJobEngine::pending_count`].
	pub fn pending_count(&self) -> usize {
		self.engine.pending_count()
	}

	/// See [`SequentialJobEngine::is_busy`].
	pub fn is_busy(&self) -> bool {
		self.engine.is_busy()
	}

	/// See [`SequentialJobEngine::wait_idle`].
	pub async fn wait_idle(&self, token: &CancellationToken) -> Result<(), JobError> {
		self.engine.wait_idle(token).await
	}

	/// See [`SequentialJobEngine::close`].
	pub fn close(&self) {
		self.engine.close();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use tokio::sync::oneshot;

	use crate::job::JobState;

	use super::*;

	#[tokio::test]
	async fn executes_in_submission_order_without_overlap() {
		let engine = SequentialJobEngine::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		let in_flight = Arc::new(AtomicUsize::new(0));
		let max_in_flight = Arc::new(AtomicUsize::new(0));

		for i in 0..8usize {
			let log = Arc::clone(&log);
			let in_flight = Arc::clone(&in_flight);
			let max_in_flight = Arc::clone(&max_in_flight);
			let _ = engine.submit(move |_token| async move {
				let live = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
				max_in_flight.fetch_max(live, Ordering::SeqCst);
				tokio::time::sleep(Duration::from_millis(2)).await;
				log.lock().push(i);
				in_flight.fetch_sub(1, Ordering::SeqCst);
				Ok(())
			});
		}

		engine.wait_idle(&CancellationToken::new()).await.unwrap();
		assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
		assert_eq!(max_in_flight.load(Ordering::SeqCst), 1, "jobs must never overlap");
	}

	#[tokio::test]
	async fn pending_count_and_busy_track_the_queue() {
		let engine = SequentialJobEngine::new();
		let (started_tx, started_rx) = oneshot::channel();
		let (release_tx, release_rx) = oneshot::channel::<()>();

		let _blocker = engine.submit(move |_token| async move {
			let _ = started_tx.send(());
			let _ = release_rx.await;
			Ok(())
		});
		started_rx.await.unwrap();

		for _ in 0..3 {
			let _ = engine.submit(|_token| async { Ok(()) });
		}
		assert_eq!(engine.pending_count(), 3);
		assert!(engine.is_busy());

		let _ = release_tx.send(());
		engine.wait_idle(&CancellationToken::new()).await.unwrap();
		assert_eq!(engine.pending_count(), 0);
		assert!(!engine.is_busy());
	}

	#[tokio::test]
	async fn submit_wait_yields_result_end_to_end() {
		let engine = SequentialJobEngine::new();
		let op = engine.submit(|_token| async {
			tokio::time::sleep(Duration::from_millis(10)).await;
			Ok(42u32)
		});
		assert!(engine.is_busy(), "busy immediately after submission");

		let state = op.wait(&CancellationToken::new()).await.unwrap();
		assert_eq!(state, JobState::Completed);
		assert_eq!(op.result(), Some(42));

		engine.wait_idle(&CancellationToken::new()).await.unwrap();
		assert!(!engine.is_busy());
	}

	#[tokio::test]
	async fn one_fault_never_stops_the_loop() {
		let engine = SequentialJobEngine::new();
		let bad = engine.submit(|_token| async { Err::<(), _>(JobError::failed("decode error")) });
		let good = engine.submit(|_token| async { Ok(7u32) });

		engine.wait_idle(&CancellationToken::new()).await.unwrap();
		assert_eq!(bad.state(), JobState::Faulted);
		assert_eq!(bad.error(), Some(JobError::failed("decode error")));
		assert_eq!(good.state(), JobState::Completed);
		assert_eq!(good.result(), Some(7));
	}

	#[tokio::test]
	async fn close_refuses_intake_and_releases_pending_waiters() {
		let engine = SequentialJobEngine::new();
		let (started_tx, started_rx) = oneshot::channel();

		// Cancel-aware blocker keeps the consumer occupied.
		let blocker = engine.submit(move |token: CancellationToken| async move {
			let _ = started_tx.send(());
			token.cancelled().await;
			Err::<(), _>(JobError::Cancelled)
		});
		started_rx.await.unwrap();

		let pending = engine.submit(|_token| async { Ok(1u32) });
		engine.close();

		let refused = engine.submit(|_token| async { Ok(2u32) });
		assert_eq!(refused.state(), JobState::Cancelled);

		let state = tokio::time::timeout(Duration::from_secs(1), pending.wait(&CancellationToken::new()))
			.await
			.expect("pending waiter must be released")
			.unwrap();
		assert_eq!(state, JobState::Cancelled);
		assert_eq!(blocker.wait(&CancellationToken::new()).await, Ok(JobState::Cancelled));
	}

	#[tokio::test]
	async fn wait_idle_is_cancellable_without_touching_the_engine() {
		let engine = SequentialJobEngine::new();
		let (_release_tx, release_rx) = oneshot::channel::<()>();
		let _blocker = engine.submit(move |_token| async move {
			let _ = release_rx.await;
			Ok(())
		});

		let wait_cancel = CancellationToken::new();
		wait_cancel.cancel();
		assert_eq!(engine.wait_idle(&wait_cancel).await, Err(JobError::Cancelled));
		assert!(engine.is_busy());
	}

	#[tokio::test]
	async fn progress_engine_threads_the_shared_sink() {
		let engine = ProgressJobEngine::new(Arc::new(Mutex::new(Vec::new())));
		for i in 0..3u32 {
			let _ = engine.submit(move |_token, sink: Arc<Mutex<Vec<u32>>>| async move {
				sink.lock().push(i);
				Ok(())
			});
		}
		engine.wait_idle(&CancellationToken::new()).await.unwrap();
		assert_eq!(*engine.progress().lock(), vec![0, 1, 2]);
	}
}
