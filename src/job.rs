use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of one job operation.
///
/// Transitions are monotonic: `Idle → Running → {Completed, Cancelled,
/// Faulted}`. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
	/// Created but not yet picked up by a consumer.
	Idle,
	/// Currently executing.
	Running,
	/// Finished normally; the result is stored.
	Completed,
	/// Observed cooperative cancellation.
	Cancelled,
	/// Failed with an error other than cancellation.
	Faulted,
}

impl JobState {
	/// Returns true for states with no further transitions.
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Cancelled | Self::Faulted)
	}
}

/// Error produced by one unit of work.
///
/// `Cancelled` is the expected cooperative-cancellation signal and is never
/// treated as a fault by the executors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
	/// The work observed its cancellation token.
	Cancelled,
	/// The work failed for any other reason.
	Failed(String),
}

impl JobError {
	/// Convenience constructor for fault messages.
	pub fn failed(msg: impl Into<String>) -> Self {
		Self::Failed(msg.into())
	}
}

impl std::fmt::Display for JobError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			JobError::Cancelled => write!(f, "job cancelled"),
			JobError::Failed(msg) => write!(f, "job failed: {msg}"),
		}
	}
}

impl std::error::Error for JobError {}

pub(crate) type JobFuture<T> = Pin<Box<dyn Future<Output = Result<T, JobError>> + Send>>;

type WorkFn<T> = Box<dyn FnOnce(CancellationToken) -> JobFuture<T> + Send>;

struct JobInner<T> {
	work: Mutex<Option<WorkFn<T>>>,
	outcome: Mutex<Option<Result<T, JobError>>>,
	state: watch::Sender<JobState>,
	cancel: CancellationToken,
}

/// A deferred, cancellable, awaitable unit of work carrying a typed result.
///
/// Cheap-clone handle; the submitter keeps one clone while an engine holds a
/// type-erased one in its queue. Exactly one consumer ever invokes the work;
/// any number of holders may `wait` concurrently.
pub struct JobOperation<T> {
	inner: Arc<JobInner<T>>,
}

impl<T> Clone for JobOperation<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> JobOperation<T>
where
	T: Send + 'static,
{
	/// Wraps a work function into a not-yet-started operation.
	pub fn new<F, Fut>(work: F) -> Self
	where
		F: FnOnce(CancellationToken) -> Fut + Send + 'static,
		Fut: Future<Output = Result<T, JobError>> + Send + 'static,
	{
		let work: WorkFn<T> = Box::new(move |token| Box::pin(work(token)));
		let (state, _) = watch::channel(JobState::Idle);
		Self {
			inner: Arc::new(JobInner {
				work: Mutex::new(Some(work)),
				outcome: Mutex::new(None),
				state,
				cancel: CancellationToken::new(),
			}),
		}
	}

	/// Current lifecycle state.
	pub fn state(&self) -> JobState {
		*self.inner.state.borrow()
	}

	/// Stored result, present only once the state is `Completed`.
	pub fn result(&self) -> Option<T>
	where
		T: Clone,
	{
		match &*self.inner.outcome.lock() {
			Some(Ok(value)) => Some(value.clone()),
			_ => None,
		}
	}

	/// Recorded failure, present once the state is `Cancelled` or `Faulted`.
	pub fn error(&self) -> Option<JobError> {
		match &*self.inner.outcome.lock() {
			Some(Err(err)) => Some(err.clone()),
			_ => None,
		}
	}

	/// Requests cooperative cancellation of this job only.
	pub fn cancel(&self) {
		self.inner.cancel.cancel();
	}

	/// Returns whether cancellation has been requested.
	pub fn is_cancellation_requested(&self) -> bool {
		self.inner.cancel.is_cancelled()
	}

	/// Suspends until the state is terminal, returning that state.
	///
	/// `token` cancels the wait itself, never the underlying job. Safe to
	/// call from any number of tasks concurrently.
	pub async fn wait(&self, token: &CancellationToken) -> Result<JobState, JobError> {
		let mut rx = self.inner.state.subscribe();
		tokio::select! {
			biased;
			res = rx.wait_for(|state| state.is_terminal()) => match res {
				Ok(state) => Ok(*state),
				// The sender lives in our own inner; closure is unreachable
				// while this handle exists.
				Err(_) => Ok(self.state()),
			},
			_ = token.cancelled() => Err(JobError::Cancelled),
		}
	}

	/// Executes the wrapped work exactly once.
	///
	/// Called by the single consumer that owns this operation's execution.
	/// The terminal outcome is recorded for waiters and re-raised to the
	/// caller; it is the caller's job to log and swallow it.
	pub(crate) async fn invoke(&self, parent: &CancellationToken) -> Result<(), JobError> {
		let work = self.inner.work.lock().take();
		let Some(work) = work else {
			// Expected when cancel_pending raced the consumer; only a true
			// double invoke is worth a warning.
			if self.inner.cancel.is_cancelled() {
				tracing::trace!("job.invoke.cancelled_pending");
			} else {
				tracing::warn!("job.invoke.duplicate");
			}
			return Ok(());
		};

		if parent.is_cancelled() {
			self.inner.cancel.cancel();
		}
		if self.inner.cancel.is_cancelled() {
			self.finish(Err(JobError::Cancelled));
			return Err(JobError::Cancelled);
		}

		self.inner.state.send_replace(JobState::Running);
		let fut = work(self.inner.cancel.clone());
		match drive(fut, &self.inner.cancel, parent).await {
			Ok(value) => {
				self.finish(Ok(value));
				Ok(())
			}
			Err(err) => {
				self.finish(Err(err.clone()));
				Err(err)
			}
		}
	}

	/// Marks a never-started operation as cancelled so its waiters unblock.
	///
	/// No-op once the single consumer has taken the work.
	pub(crate) fn cancel_pending(&self) {
		self.inner.cancel.cancel();
		let work = self.inner.work.lock().take();
		if work.is_some() && self.state() == JobState::Idle {
			self.finish(Err(JobError::Cancelled));
		}
	}

	/// Records the outcome, then publishes the terminal state.
	///
	/// Outcome must be stored before the state flips so a waiter released by
	/// the terminal transition always sees the result.
	fn finish(&self, outcome: Result<T, JobError>) {
		let next = match &outcome {
			Ok(_) => JobState::Completed,
			Err(JobError::Cancelled) => JobState::Cancelled,
			Err(JobError::Failed(_)) => JobState::Faulted,
		};
		*self.inner.outcome.lock() = Some(outcome);
		self.inner.state.send_replace(next);
	}
}

/// Drives a job future while forwarding an external cancel scope into the
/// job's own token, so the work observes cancellation cooperatively instead
/// of being dropped mid-await.
pub(crate) async fn drive<T>(fut: JobFuture<T>, own: &CancellationToken, external: &CancellationToken) -> Result<T, JobError> {
	let mut fut = fut;
	if external.is_cancelled() {
		own.cancel();
		return fut.await;
	}
	tokio::select! {
		biased;
		res = &mut fut => res,
		_ = external.cancelled() => {
			own.cancel();
			fut.await
		}
	}
}

/// Invoke-only boundary over heterogeneous job operations.
///
/// Lets one FIFO carry jobs of different result types; the concrete `T`
/// stays with the submitter's `JobOperation<T>` handle.
#[async_trait]
pub(crate) trait QueuedJob: Send + Sync {
	async fn invoke(&self, parent: &CancellationToken) -> Result<(), JobError>;
	fn cancel_pending(&self);
}

#[async_trait]
impl<T> QueuedJob for JobOperation<T>
where
	T: Send + 'static,
{
	async fn invoke(&self, parent: &CancellationToken) -> Result<(), JobError> {
		JobOperation::invoke(self, parent).await
	}

	fn cancel_pending(&self) {
		JobOperation::cancel_pending(self);
	}
}
