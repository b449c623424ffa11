use async_trait::async_trait;

use crate::client::JobSource;
use crate::job::JobOperation;

/// Scheduling category of one ordered unit (e.g. page content, thumbnail).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobCategory(pub &'static str);

/// Dedup identity of one ordered unit within its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey(pub u64);

/// Identity of one registered hub client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

/// One item of an order batch.
pub struct JobOrder {
	pub category: JobCategory,
	pub key: JobKey,
	/// Already-satisfied items are filtered out by the client and never
	/// reach the hub.
	pub satisfied: bool,
	pub op: JobOperation<()>,
}

/// Contract of the external scheduling hub this crate delegates to.
///
/// The hub owns all multi-category/multi-worker dispatch. Contract
/// requirements, relied upon but not verified here:
///
/// - at most one in-flight unit per `(category, key)` across all clients;
/// - every ordered operation is driven to a terminal state, including
///   cancelled ones (invoke it, or mark it cancelled-pending, but never
///   silently drop it). Cancellation is only a request; waiters block on
///   the terminal transition.
#[async_trait]
pub trait JobHub: Send + Sync {
	async fn register_client(&self, client: ClientId);

	async fn unregister_client(&self, client: ClientId);

	/// Schedules a batch for `client`, returning one source per item.
	async fn order(&self, client: ClientId, items: Vec<JobOrder>) -> Vec<JobSource>;

	/// Cancels the outstanding order of `client`.
	async fn cancel_order(&self, client: ClientId);
}
