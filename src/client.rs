use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::hub::{ClientId, JobCategory, JobHub, JobKey, JobOrder};
use crate::job::{JobError, JobOperation, JobState};

struct SourceInner {
	category: JobCategory,
	key: JobKey,
	op: JobOperation<()>,
	started: AtomicBool,
}

/// Binding of one scheduled unit to its cancellation scope and its
/// `(category, key)` dedup identity.
///
/// Cheap-clone handle; the hub keeps one clone to drive execution while the
/// ordering client retains another for bulk wait/cancel bookkeeping.
#[derive(Clone)]
pub struct JobSource {
	inner: Arc<SourceInner>,
}

impl JobSource {
	/// Binds an operation to its scheduling identity.
	pub fn new(category: JobCategory, key: JobKey, op: JobOperation<()>) -> Self {
		Self {
			inner: Arc::new(SourceInner {
				category,
				key,
				op,
				started: AtomicBool::new(false),
			}),
		}
	}

	pub fn category(&self) -> JobCategory {
		self.inner.category
	}

	pub fn key(&self) -> JobKey {
		self.inner.key
	}

	/// The wrapped operation; the hub invokes it on one of its workers.
	pub fn operation(&self) -> &JobOperation<()> {
		&self.inner.op
	}

	/// Requests cooperative cancellation of this unit only.
	pub fn cancel(&self) {
		self.inner.op.cancel();
	}

	pub fn is_cancellation_requested(&self) -> bool {
		self.inner.op.is_cancellation_requested()
	}

	/// Recorded by the hub when execution begins.
	pub fn mark_started(&self) {
		self.inner.started.store(true, Ordering::Release);
	}

	pub fn has_started(&self) -> bool {
		self.inner.started.load(Ordering::Acquire)
	}

	pub fn state(&self) -> JobState {
		self.inner.op.state()
	}

	/// Suspends until the unit reaches a terminal state.
	pub async fn wait(&self, token: &CancellationToken) -> Result<JobState, JobError> {
		self.inner.op.wait(token).await
	}

	/// Like [`wait`](Self::wait) with a deadline; `Ok(None)` on timeout.
	pub async fn wait_timeout(&self, timeout: Duration, token: &CancellationToken) -> Result<Option<JobState>, JobError> {
		match tokio::time::timeout(timeout, self.wait(token)).await {
			Ok(res) => res.map(Some),
			Err(_) => Ok(None),
		}
	}
}

/// Batch-ordering bookkeeping atop the [`JobHub`] contract.
///
/// Filters already-satisfied items out of each batch, submits the rest,
/// retains the returned sources for bulk wait/cancel, and unregisters from
/// the hub on [`close`](Self::close). Performs no scheduling itself.
pub struct JobClient {
	id: ClientId,
	hub: Arc<dyn JobHub>,
	sources: Mutex<Vec<JobSource>>,
}

impl JobClient {
	/// Registers with the hub and returns the client handle.
	pub async fn register(id: ClientId, hub: Arc<dyn JobHub>) -> Self {
		hub.register_client(id).await;
		tracing::debug!(client = ?id, "job.client.register");
		Self {
			id,
			hub,
			sources: Mutex::new(Vec::new()),
		}
	}

	pub fn id(&self) -> ClientId {
		self.id
	}

	/// Submits the not-yet-satisfied items of a batch, replacing the
	/// retained source list with the hub's result.
	pub async fn order(&self, items: Vec<JobOrder>) -> Vec<JobSource> {
		let pending: Vec<JobOrder> = items.into_iter().filter(|item| !item.satisfied).collect();
		let sources = if pending.is_empty() {
			Vec::new()
		} else {
			self.hub.order(self.id, pending).await
		};
		tracing::debug!(client = ?self.id, ordered = sources.len(), "job.client.order");
		*self.sources.lock() = sources.clone();
		sources
	}

	/// Snapshot of the currently retained sources.
	pub fn sources(&self) -> Vec<JobSource> {
		self.sources.lock().clone()
	}

	/// Cancels the retained sources and the hub-side order.
	pub async fn cancel_order(&self) {
		let sources: Vec<JobSource> = {
			let mut retained = self.sources.lock();
			retained.drain(..).collect()
		};
		for source in &sources {
			source.cancel();
		}
		self.hub.cancel_order(self.id).await;
		tracing::debug!(client = ?self.id, cancelled = sources.len(), "job.client.cancel_order");
	}

	/// Bulk wait: true once every retained source is terminal, false when
	/// the deadline expires first. `token` cancels the wait only.
	pub async fn wait_all(&self, timeout: Duration, token: &CancellationToken) -> Result<bool, JobError> {
		let deadline = Instant::now() + timeout;
		let sources = self.sources();
		for source in sources {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if source.wait_timeout(remaining, token).await?.is_none() {
				return Ok(false);
			}
		}
		Ok(true)
	}

	/// Unregisters from the hub. Call before dropping the client.
	pub async fn close(&self) {
		self.hub.unregister_client(self.id).await;
		tracing::debug!(client = ?self.id, "job.client.unregister");
	}
}
