//! Long-running job attached to a session
//!
//! An [`Order`] is attached at most once per session and then read by the
//! fan-out workers that process its items. Workers record per-item results
//! concurrently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Result recorded for one order item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItemRecord {
    /// Whether the item's work succeeded
    pub succeeded: bool,
    /// Output on success, error message on failure
    pub detail: String,
    /// When the result was recorded
    pub recorded_at: DateTime<Utc>,
}

/// A job whose items are processed in parallel under one session
#[derive(Debug)]
pub struct Order {
    job_id: String,
    items: Vec<String>,
    created_at: DateTime<Utc>,
    results: Mutex<BTreeMap<usize, OrderItemRecord>>,
}

impl Order {
    /// Create an order with the given job id and work items
    pub fn new(job_id: impl Into<String>, items: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            items,
            created_at: Utc::now(),
            results: Mutex::new(BTreeMap::new()),
        }
    }

    /// Job id used for lookups
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Work items, in submission order
    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// When the order was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Record the outcome of item `index`, replacing any earlier record
    pub fn record_result(&self, index: usize, succeeded: bool, detail: impl Into<String>) {
        self.lock_results().insert(
            index,
            OrderItemRecord {
                succeeded,
                detail: detail.into(),
                recorded_at: Utc::now(),
            },
        );
    }

    /// Number of items with a recorded outcome
    pub fn completed_count(&self) -> usize {
        self.lock_results().len()
    }

    /// True once every item has a recorded outcome
    pub fn is_complete(&self) -> bool {
        self.completed_count() >= self.items.len()
    }

    /// Serializable view of the order
    pub fn snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            job_id: self.job_id.clone(),
            items: self.items.clone(),
            created_at: self.created_at,
            results: self.lock_results().clone(),
        }
    }

    fn lock_results(&self) -> MutexGuard<'_, BTreeMap<usize, OrderItemRecord>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serializable view of an [`Order`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    /// Job id
    pub job_id: String,
    /// Work items
    pub items: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Recorded outcomes keyed by item index
    pub results: BTreeMap<usize, OrderItemRecord>,
}
