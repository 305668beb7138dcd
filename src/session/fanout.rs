//! Bounded-parallel fan-out over work items
//!
//! Every item runs on its own tokio task under a fresh root scope, so items
//! never share scoped services. At most `max_degree` items are in flight at
//! once. When a session is given, each item scope references it for the
//! duration of the item, which keeps the session alive while work is running.
//!
//! Cancellation stops scheduling: items not yet started are reported as
//! [`ItemOutcome::Cancelled`] and never get a scope. Items already running
//! receive the token and are expected to observe it; their scopes are
//! disposed when their work returns.

use crate::error::CoreResult;
use crate::scope::{ScopeContainer, ScopeId};
use crate::session::metrics;
use crate::session::order::Order;
use crate::session::registry::SessionRegistry;
use crate::session::types::{Session, SessionId};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a single fan-out item finished
#[derive(Debug)]
pub enum ItemOutcome<R> {
    /// Work returned a value
    Completed(R),
    /// Work returned an error, panicked, or its scope could not be attached
    Failed(anyhow::Error),
    /// Cancellation fired before the item was started
    Cancelled,
}

impl<R> ItemOutcome<R> {
    /// True for [`ItemOutcome::Completed`]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// True for [`ItemOutcome::Failed`]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// True for [`ItemOutcome::Cancelled`]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result of one fan-out item
#[derive(Debug)]
pub struct ItemResult<R> {
    /// Position of the item in the input
    pub index: usize,
    /// Scope the item ran under; `None` if it never started
    pub scope_id: Option<ScopeId>,
    /// How the item finished
    pub outcome: ItemOutcome<R>,
    /// Wall time spent on the item, zero if it never started
    pub duration_ms: u64,
}

/// Aggregated fan-out results, ordered by item index
#[derive(Debug)]
pub struct FanoutReport<R> {
    /// One entry per input item
    pub results: Vec<ItemResult<R>>,
    /// Items whose work returned a value
    pub completed: usize,
    /// Items that errored, panicked, or could not attach their scope
    pub failed: usize,
    /// Items never started because cancellation fired first
    pub cancelled: usize,
    /// Wall time of the whole fan-out
    pub total_duration_ms: u64,
}

impl<R> FanoutReport<R> {
    fn from_results(mut results: Vec<ItemResult<R>>, total_duration_ms: u64) -> Self {
        results.sort_by_key(|result| result.index);
        let count = |pred: fn(&ItemOutcome<R>) -> bool| {
            results.iter().filter(|result| pred(&result.outcome)).count()
        };
        let completed = count(ItemOutcome::is_completed);
        let failed = count(ItemOutcome::is_failed);
        let cancelled = count(ItemOutcome::is_cancelled);
        Self {
            results,
            completed,
            failed,
            cancelled,
            total_duration_ms,
        }
    }

    /// Total number of items
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// True when every item completed
    pub fn all_completed(&self) -> bool {
        self.completed == self.results.len()
    }
}

impl SessionRegistry {
    /// Run `work` once per item with bounded parallelism
    ///
    /// Each item gets a fresh root scope. If `session_id` is given, every
    /// item scope references that session while its work runs. A
    /// `max_degree` of zero is treated as one.
    ///
    /// # Arguments
    ///
    /// * `session_id` - Session every item scope references, if any
    /// * `items` - Work items, one task each
    /// * `max_degree` - Maximum number of items in flight
    /// * `cancel` - Stops new items from starting; passed to running work
    /// * `work` - Called with the item's scope, the item and the token
    ///
    /// # Returns
    ///
    /// A [`FanoutReport`] with one result per item, ordered by index
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::SessionNotFound` if `session_id` does not
    /// name a live session. Per-item failures never fail the call; they are
    /// reported in the returned [`FanoutReport`].
    ///
    /// # Examples
    ///
    /// ```
    /// use scopekeeper::scope::{ScopeFactory, ServiceCollection};
    /// use scopekeeper::session::SessionRegistry;
    /// use std::sync::Arc;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let scopes = Arc::new(ScopeFactory::new(ServiceCollection::new().build()));
    /// let registry = Arc::new(SessionRegistry::new(scopes, chrono::Duration::minutes(30)));
    ///
    /// let report = registry
    ///     .parallel_for_each(None, vec![1, 2, 3], 2, CancellationToken::new(), |_scope, n, _| {
    ///         async move { Ok::<_, anyhow::Error>(n * 10) }
    ///     })
    ///     .await
    ///     .unwrap();
    /// assert_eq!(report.completed, 3);
    /// # }
    /// ```
    pub async fn parallel_for_each<T, R, F, Fut>(
        self: &Arc<Self>,
        session_id: Option<SessionId>,
        items: Vec<T>,
        max_degree: usize,
        cancel: CancellationToken,
        work: F,
    ) -> CoreResult<FanoutReport<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Arc<ScopeContainer>, T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let session = match session_id {
            Some(id) => Some(self.get_session(&id)?),
            None => None,
        };

        let degree = max_degree.max(1);
        let item_count = items.len();
        let started = Instant::now();

        info!(
            fanout.event = "start",
            fanout.item_count = item_count,
            fanout.max_degree = degree,
            session.id = ?session_id,
            "Starting fan-out"
        );

        let limiter = Arc::new(Semaphore::new(degree));
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(item_count);
        let mut results = Vec::with_capacity(item_count);
        let mut pending = items.into_iter().enumerate();

        while let Some((index, item)) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&limiter).acquire_owned() => permit.ok(),
            };

            let Some(permit) = permit else {
                results.push(cancelled_item(index));
                results.extend(pending.by_ref().map(|(index, _)| cancelled_item(index)));
                warn!(
                    fanout.event = "cancelled",
                    fanout.first_unstarted = index,
                    "Fan-out cancelled, remaining items not started"
                );
                break;
            };

            let scope = self.scope_factory().create_scope(None);
            let item_started = Instant::now();
            let registry = Arc::clone(self);
            let session = session.clone();
            let work = Arc::clone(&work);
            let cancel = cancel.clone();
            let item_scope = Arc::clone(&scope);
            let handle = tokio::spawn(async move {
                let _permit = permit;
                run_item(registry, index, item, item_scope, session, work, cancel).await
            });
            handles.push((index, scope, item_started, handle));
        }

        let joined_items = join_all(handles.into_iter().map(
            |(index, scope, item_started, handle)| async move {
                (index, scope, item_started, handle.await)
            },
        ))
        .await;

        for (index, scope, item_started, joined) in joined_items {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    // The lease, if any, released its reference while unwinding
                    scope.dispose();
                    warn!(
                        fanout.event = "item_panic",
                        fanout.item_index = index,
                        scope.id = %scope.id(),
                        fanout.error = %e,
                        "Fan-out item task failed"
                    );
                    metrics::fanout_item("failed");
                    results.push(ItemResult {
                        index,
                        scope_id: Some(scope.id()),
                        outcome: ItemOutcome::Failed(anyhow::anyhow!("item task failed: {}", e)),
                        duration_ms: item_started.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        let report = FanoutReport::from_results(results, started.elapsed().as_millis() as u64);
        info!(
            fanout.event = "complete",
            fanout.completed = report.completed,
            fanout.failed = report.failed,
            fanout.cancelled = report.cancelled,
            fanout.duration_ms = report.total_duration_ms,
            "Fan-out complete"
        );
        Ok(report)
    }

    /// Fan out over the items of `order` and record each outcome on it
    ///
    /// Cancelled items are left without a record.
    ///
    /// # Arguments
    ///
    /// * `session_id` - Session holding the order
    /// * `order` - Order whose items are processed
    /// * `max_degree` - Maximum number of items in flight
    /// * `cancel` - Stops new items from starting
    /// * `work` - Produces the detail recorded for a successful item
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::SessionNotFound` if the session is gone.
    pub async fn run_order<F, Fut>(
        self: &Arc<Self>,
        session_id: SessionId,
        order: Arc<Order>,
        max_degree: usize,
        cancel: CancellationToken,
        work: F,
    ) -> CoreResult<FanoutReport<String>>
    where
        F: Fn(Arc<ScopeContainer>, String, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let report = self
            .parallel_for_each(
                Some(session_id),
                order.items().to_vec(),
                max_degree,
                cancel,
                work,
            )
            .await?;

        for result in &report.results {
            match &result.outcome {
                ItemOutcome::Completed(detail) => order.record_result(result.index, true, detail),
                ItemOutcome::Failed(e) => {
                    order.record_result(result.index, false, format!("{:#}", e))
                }
                ItemOutcome::Cancelled => {}
            }
        }

        debug!(
            order.job_id = order.job_id(),
            order.completed = order.completed_count(),
            "Order results recorded"
        );
        Ok(report)
    }
}

fn cancelled_item<R>(index: usize) -> ItemResult<R> {
    metrics::fanout_item("cancelled");
    ItemResult {
        index,
        scope_id: None,
        outcome: ItemOutcome::Cancelled,
        duration_ms: 0,
    }
}

async fn run_item<T, R, F, Fut>(
    registry: Arc<SessionRegistry>,
    index: usize,
    item: T,
    scope: Arc<ScopeContainer>,
    session: Option<Arc<Session>>,
    work: Arc<F>,
    cancel: CancellationToken,
) -> ItemResult<R>
where
    F: Fn(Arc<ScopeContainer>, T, CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    let started = Instant::now();
    let scope_id = scope.id();

    let lease = match &session {
        Some(session) => match registry.attach_scope(Arc::clone(&scope), session) {
            Ok(lease) => Some(lease),
            Err(e) => {
                scope.dispose();
                metrics::fanout_item("failed");
                return ItemResult {
                    index,
                    scope_id: Some(scope_id),
                    outcome: ItemOutcome::Failed(e.into()),
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
        },
        None => None,
    };

    debug!(
        fanout.event = "item_start",
        fanout.item_index = index,
        scope.id = %scope_id,
        "Fan-out item started"
    );

    let outcome = match (*work)(Arc::clone(&scope), item, cancel).await {
        Ok(value) => ItemOutcome::Completed(value),
        Err(e) => {
            warn!(
                fanout.event = "item_failed",
                fanout.item_index = index,
                scope.id = %scope_id,
                fanout.error = %e,
                "Fan-out item failed"
            );
            ItemOutcome::Failed(e)
        }
    };

    match lease {
        Some(lease) => {
            lease.release().await;
        }
        None => {
            scope.dispose();
        }
    }

    metrics::fanout_item(outcome.label());
    ItemResult {
        index,
        scope_id: Some(scope_id),
        outcome,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}
