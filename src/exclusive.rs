use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::job::{JobError, JobFuture, drive};

pub(crate) type ActionFn = Box<dyn FnOnce(CancellationToken) -> JobFuture<()> + Send>;

/// One not-yet-started action: its factory plus the caller's cancel scope.
pub(crate) struct ActionEntry {
	pub factory: ActionFn,
	pub token: CancellationToken,
}

impl ActionEntry {
	pub fn new<F, Fut>(factory: F, token: CancellationToken) -> Self
	where
		F: FnOnce(CancellationToken) -> Fut + Send + 'static,
		Fut: Future<Output = Result<(), JobError>> + Send + 'static,
	{
		Self {
			factory: Box::new(move |run| Box::pin(factory(run))),
			token,
		}
	}
}

/// Runs one action with a run token scoped under the instance token,
/// forwarding the caller's token mid-flight. Faults are logged and
/// swallowed; the executor stays usable.
pub(crate) async fn run_action(instance: &CancellationToken, entry: ActionEntry, scope: &'static str) {
	if entry.token.is_cancelled() {
		tracing::trace!(scope, "job.action.skipped");
		return;
	}
	let run = instance.child_token();
	let fut = (entry.factory)(run.clone());
	match drive(fut, &run, &entry.token).await {
		Ok(()) => {}
		Err(JobError::Cancelled) => tracing::trace!(scope, "job.action.cancelled"),
		Err(err) => tracing::warn!(scope, error = %err, "job.action.faulted"),
	}
}

struct ExclusiveState {
	next: Option<ActionEntry>,
	running: bool,
	closed: bool,
}

struct ExclusiveInner {
	state: Mutex<ExclusiveState>,
	notify: Notify,
	cancel: CancellationToken,
}

/// Single-slot executor: at most one action running, at most one pending,
/// and the newest pending request wins.
///
/// A request arriving while an action runs replaces any stored pending
/// request; the replaced one never executes. The enqueue decision and the
/// promote-or-idle decision share one lock, so a request racing a completion
/// is neither lost nor double-started.
pub struct ExclusiveAction {
	inner: Arc<ExclusiveInner>,
}

impl Default for ExclusiveAction {
	fn default() -> Self {
		Self::new()
	}
}

impl ExclusiveAction {
	/// Creates the executor and starts its drain loop.
	///
	/// Must be called from within a Tokio runtime.
	pub fn new() -> Self {
		let inner = Arc::new(ExclusiveInner {
			state: Mutex::new(ExclusiveState {
				next: None,
				running: false,
				closed: false,
			}),
			notify: Notify::new(),
			cancel: CancellationToken::new(),
		});
		tokio::spawn(drain_loop(Arc::clone(&inner)));
		Self { inner }
	}

	/// Requests execution of `factory`, superseding any pending request.
	///
	/// `token` is the caller's cancel scope: a request already cancelled
	/// when it would start is skipped, and mid-run cancellation is forwarded
	/// into the run token cooperatively.
	pub fn request<F, Fut>(&self, factory: F, token: CancellationToken)
	where
		F: FnOnce(CancellationToken) -> Fut + Send + 'static,
		Fut: Future<Output = Result<(), JobError>> + Send + 'static,
	{
		let superseded = {
			let mut st = self.inner.state.lock();
			if st.closed {
				return;
			}
			st.next.replace(ActionEntry::new(factory, token)).is_some()
		};
		if superseded {
			tracing::trace!("job.exclusive.superseded");
		}
		self.inner.notify.notify_one();
	}

	/// True while an action runs or a request is pending.
	pub fn is_busy(&self) -> bool {
		let st = self.inner.state.lock();
		st.running || st.next.is_some()
	}

	/// Cancels the instance scope; the pending request (if any) is dropped
	/// and an in-flight action observes cancellation via its run token.
	pub fn close(&self) {
		{
			let mut st = self.inner.state.lock();
			st.closed = true;
			st.next = None;
		}
		self.inner.cancel.cancel();
		self.inner.notify.notify_waiters();
	}
}

impl Drop for ExclusiveAction {
	fn drop(&mut self) {
		self.close();
	}
}

async fn drain_loop(inner: Arc<ExclusiveInner>) {
	loop {
		// Register before checking the slot to avoid lost-wakeup.
		let notified = inner.notify.notified();

		if inner.cancel.is_cancelled() {
			break;
		}

		let entry = {
			let mut st = inner.state.lock();
			let entry = st.next.take();
			st.running = entry.is_some();
			entry
		};

		match entry {
			Some(entry) => {
				run_action(&inner.cancel, entry, "exclusive").await;
				inner.state.lock().running = false;
			}
			None => {
				tokio::select! {
					_ = inner.cancel.cancelled() => break,
					_ = notified => {}
				}
			}
		}
	}
	inner.state.lock().running = false;
	tracing::debug!("job.exclusive.exit");
}
